use sitegen_core::session::SessionError;
use std::time::Duration;

/// Errors surfaced by the client session layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The handshake or initial connect failed.
    #[error("connection failed: {0}")]
    Connection(String),
    /// A correlated call got no reply in time.
    #[error("`{event}` timed out after {after:?}")]
    Timeout { event: String, after: Duration },
    /// The channel is down or dropped mid-call.
    #[error("transport error: {0}")]
    Transport(String),
    /// The service explicitly rejected a correlated call.
    #[error("`{event}` rejected by service: {message}")]
    Server { event: String, message: String },
    /// The service reported a failed generation.
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("a generation is already in progress for project {0}")]
    GenerationInProgress(String),
}

impl ClientError {
    pub fn not_connected() -> Self {
        ClientError::Transport("channel is not connected".to_string())
    }
}

impl From<SessionError> for ClientError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::AlreadyActive(project_id) => ClientError::GenerationInProgress(project_id),
        }
    }
}
