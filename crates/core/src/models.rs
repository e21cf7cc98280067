//! Conversation and Generation Models
//!
//! This module defines the data structures shared by the channel path, the
//! fallback path and the history cache. Field names serialize in camelCase to
//! match the generation service's JSON contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Identifier of a project. Sessions, rooms and history are all keyed by it.
pub type ProjectId = String;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// The outcome of one completed generation, as reported by the service.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    #[serde(default)]
    pub conversational_response: String,
    /// Reference to the produced artifact. Opaque to this layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_artifact: Option<Value>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub response_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// One conversation turn.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

impl Message {
    /// Creates a user turn stamped with the current time.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: MessageRole::User,
            content: content.into(),
            timestamp: Utc::now(),
            artifact: None,
            tokens_used: None,
            response_time_ms: None,
        }
    }

    /// Creates the assistant turn recorded for a completed generation.
    pub fn assistant(result: &GenerationResult) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: MessageRole::Assistant,
            content: result.conversational_response.clone(),
            timestamp: Utc::now(),
            artifact: result.generated_artifact.clone(),
            tokens_used: Some(result.tokens_used),
            response_time_ms: Some(result.response_time_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_role_serialization() {
        assert_eq!(serde_json::to_string(&MessageRole::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&MessageRole::Assistant).unwrap(),
            "\"assistant\""
        );
    }

    #[test]
    fn test_message_role_display() {
        assert_eq!(format!("{}", MessageRole::User), "user");
        assert_eq!(format!("{}", MessageRole::Assistant), "assistant");
    }

    #[test]
    fn test_generation_result_from_service_json() {
        let value = json!({
            "conversationalResponse": "Here is your landing page.",
            "generatedArtifact": { "path": "index.html" },
            "tokensUsed": 1200,
            "responseTimeMs": 5400,
            "conversationId": "conv-7"
        });
        let result: GenerationResult = serde_json::from_value(value).unwrap();

        assert_eq!(result.conversational_response, "Here is your landing page.");
        assert_eq!(result.generated_artifact, Some(json!({ "path": "index.html" })));
        assert_eq!(result.tokens_used, 1200);
        assert_eq!(result.response_time_ms, 5400);
        assert_eq!(result.conversation_id.as_deref(), Some("conv-7"));
    }

    #[test]
    fn test_generation_result_tolerates_missing_fields() {
        let result: GenerationResult =
            serde_json::from_value(json!({ "conversationalResponse": "ok" })).unwrap();
        assert_eq!(result.tokens_used, 0);
        assert!(result.generated_artifact.is_none());
    }

    #[test]
    fn test_assistant_message_carries_result_metadata() {
        let result = GenerationResult {
            conversational_response: "Done".to_string(),
            generated_artifact: Some(json!("artifact-1")),
            tokens_used: 42,
            response_time_ms: 900,
            conversation_id: None,
        };
        let message = Message::assistant(&result);

        assert_eq!(message.role, MessageRole::Assistant);
        assert_eq!(message.content, "Done");
        assert_eq!(message.artifact, Some(json!("artifact-1")));
        assert_eq!(message.tokens_used, Some(42));
        assert_eq!(message.response_time_ms, Some(900));
    }

    #[test]
    fn test_user_message_serializes_camel_case() {
        let message = Message::user("make a landing page");
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "make a landing page");
        assert!(json.get("timestamp").is_some());
        assert!(json.get("tokensUsed").is_none());
    }
}
