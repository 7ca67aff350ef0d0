use redub_core::{ErrorKind, QuotaDetail};
use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("quota exceeded: {0:?}")]
    Quota(QuotaDetail),

    #[error("disk low: {free_bytes} bytes free, {min_bytes} required")]
    DiskLow { free_bytes: u64, min_bytes: u64 },

    #[error("scheduler is draining")]
    Draining,

    #[error(transparent)]
    Store(#[from] redub_store::StoreError),

    #[error(transparent)]
    Dispatch(#[from] redub_dispatch::DispatchError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Quota(_) => ErrorKind::QuotaExceeded,
            // Low disk surfaces as queue-unavailable, not a user quota.
            Self::DiskLow { .. } => ErrorKind::Transient,
            Self::Draining => ErrorKind::Draining,
            Self::Store(err) => err.kind(),
            Self::Dispatch(err) => err.kind(),
            Self::Io(_) => ErrorKind::Transient,
        }
    }
}
