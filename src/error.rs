use thiserror::Error;

/// The closed vocabulary of error kinds the system can surface.
///
/// Transport-level protocol errors on a single frame are logged and skipped
/// rather than returned here; only failures that terminate an operation or
/// an owning transport take this shape.
#[derive(Debug, Error)]
pub enum PtunError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("login rejected: {0}")]
    LoginRejected(String),

    #[error("login timed out")]
    LoginTimeout,

    #[error("nat detection timed out")]
    DetectTimeout,

    #[error("nat analysis failed: {0}")]
    AnalyzeFailed(String),

    #[error("hole punch failed")]
    PunchFailed,

    #[error("transport closed")]
    Closed,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("no handler registered for message key {0}")]
    NoHandler(String),

    #[error("message reply timed out")]
    MessageTimeout,

    #[error("buffer too small for incoming frame")]
    BufferTooSmall,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PtunError>;
