//! Defines the message protocol between the client and the generation service.
//!
//! Every frame is an [`Envelope`]: an event name, a JSON payload and, for
//! correlated calls, a request id. Payload keys are camelCase.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use sitegen_core::models::{GenerationResult, Message, ProjectId};
use uuid::Uuid;

/// Event names used on the wire and by local lifecycle dispatch.
pub mod events {
    // Connection lifecycle.
    pub const AUTH: &str = "auth";
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const AUTH_ERROR: &str = "auth_error";
    pub const ERROR: &str = "error";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const RECONNECT_FAILED: &str = "reconnect_failed";

    /// Reply to a correlated call.
    pub const ACK: &str = "ack";

    // Generation lifecycle.
    pub const GENERATION_STARTED: &str = "generation_started";
    pub const GENERATION_PROGRESS: &str = "generation_progress";
    pub const GENERATION_COMPLETE: &str = "generation_complete";
    pub const GENERATION_ERROR: &str = "generation_error";

    // Client-initiated, correlated.
    pub const GENERATE_WEBSITE: &str = "generate_website";
    pub const CANCEL_GENERATION: &str = "cancel_generation";
    pub const GET_GENERATION_STATUS: &str = "get_generation_status";
    pub const JOIN_ROOM: &str = "join_room";
    pub const LEAVE_ROOM: &str = "leave_room";

    // Room broadcast, unacknowledged.
    pub const TYPING: &str = "typing";
    pub const CURSOR_POSITION: &str = "cursor_position";
    pub const CODE_CHANGES: &str = "code_changes";
    pub const USER_JOINED: &str = "user_joined";
    pub const USER_LEFT: &str = "user_left";
}

/// A single frame on the channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            request_id: None,
            data,
            error: None,
        }
    }

    /// A correlated call expecting an `ack` with the same request id.
    pub fn request(event: impl Into<String>, request_id: u64, data: Value) -> Self {
        Self {
            request_id: Some(request_id),
            ..Self::new(event, data)
        }
    }

    /// A successful reply to a correlated call.
    pub fn ack(request_id: u64, data: Value) -> Self {
        Self::request(events::ACK, request_id, data)
    }

    /// An explicit failure reply to a correlated call.
    pub fn nack(request_id: u64, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::request(events::ACK, request_id, Value::Null)
        }
    }

    /// Decodes the payload into `T`, returning `None` if it does not fit.
    pub fn payload<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.data.clone()).ok()
    }
}

/// Sent by the client as its first frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Payload of `auth_error` and `error`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorPayload {
    #[serde(default, alias = "error")]
    pub message: String,
}

/// Payload of requests that only name a project.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRef {
    pub project_id: ProjectId,
}

/// Payload of `generate_website`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub project_id: ProjectId,
    pub generation_id: Uuid,
    pub message: String,
    pub conversation_history: Vec<Message>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStarted {
    pub project_id: ProjectId,
    #[serde(default)]
    pub generation_id: Option<Uuid>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationProgress {
    pub project_id: ProjectId,
    #[serde(default)]
    pub generation_id: Option<Uuid>,
    pub progress: f64,
    #[serde(default)]
    pub stage: String,
}

impl GenerationProgress {
    /// The reported progress as a whole percent in `0..=100`.
    pub fn percent(&self) -> u8 {
        if self.progress.is_nan() {
            return 0;
        }
        self.progress.clamp(0.0, 100.0).round() as u8
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationComplete {
    pub project_id: ProjectId,
    #[serde(default)]
    pub generation_id: Option<Uuid>,
    pub result: GenerationResult,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationFailed {
    pub project_id: ProjectId,
    #[serde(default)]
    pub generation_id: Option<Uuid>,
    pub error: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

/// A presence or collaboration event inside a project room.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomEvent {
    pub project_id: ProjectId,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_typing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Value>,
}

impl RoomEvent {
    pub fn new(project_id: impl Into<ProjectId>, user_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: user_id.into(),
            is_typing: None,
            position: None,
            changes: None,
        }
    }
}
