use thiserror::Error;

/// Error taxonomy shared across the recorder, hubs, and WebSocket fan-out layer.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("recorder injection timed out waiting for the agent's first snapshot")]
    InjectionTimeout,
    #[error("recorder injection was rejected: {0}")]
    InjectionRejected(String),
    #[error("invalid DOM event: {0}")]
    InvalidEvent(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
    #[error("browser for session {0} is not ready to accept control frames")]
    BrowserNotReady(String),
    #[error("control action failed: {0}")]
    ExecutionFailed(String),
    #[error("cross-process hub channel is not configured")]
    HubUnavailable,
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;
