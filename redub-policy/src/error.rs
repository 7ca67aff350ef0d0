use redub_core::ErrorKind;
use thiserror::Error;

/// Result type for policy decisions
pub type PolicyResult<T> = Result<T, PolicyError>;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("not authenticated")]
    Auth,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found")]
    NotFound,

    #[error("csrf token missing or invalid")]
    Csrf,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("request blocked by network gate: {0}")]
    Gate(String),

    #[error(transparent)]
    Store(#[from] redub_store::StoreError),
}

impl PolicyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth => ErrorKind::Auth,
            Self::Forbidden(_) | Self::Csrf | Self::Gate(_) => ErrorKind::Forbidden,
            Self::NotFound => ErrorKind::NotFound,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Store(err) => err.kind(),
        }
    }
}
