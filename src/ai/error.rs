use thiserror::Error;

/// AI subsystem errors.
#[derive(Debug, Clone, Error)]
pub enum AiError {
    #[error("feeder already initialized")]
    AlreadyInitialized,

    #[error("feeder not initialized")]
    NotInitialized,

    #[error("inference worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("frame send failed: {0}")]
    FrameSend(String),

    #[error("result parse failed: {0}")]
    ResultParse(String),

    #[error("worker handshake failed: {0}")]
    Handshake(String),

    #[error("worker connection lost: {0}")]
    Disconnected(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("capture pipeline error: {0}")]
    Capture(String),
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, AiError>;
