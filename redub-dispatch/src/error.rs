use redub_core::ErrorKind;
use thiserror::Error;

/// Result type for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("dispatch queue is full ({depth} pending)")]
    QueueFull { depth: usize },

    #[error("unknown claim for job {0}")]
    UnknownClaim(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("dispatch backend closed")]
    Closed,
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::QueueFull { .. } => ErrorKind::RateLimited,
            Self::UnknownClaim(_) => ErrorKind::Conflict,
            Self::Unavailable(_) | Self::Backend(_) => ErrorKind::Transient,
            Self::Closed => ErrorKind::Draining,
        }
    }
}

impl From<redis::RedisError> for DispatchError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_io_error() || err.is_timeout() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}
