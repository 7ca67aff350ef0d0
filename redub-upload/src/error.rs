use redub_core::{ErrorKind, QuotaDetail};
use redub_store::StoreError;
use thiserror::Error;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("invalid upload request: {0}")]
    Validation(String),

    #[error("upload not found: {0}")]
    NotFound(String),

    #[error("upload quota exceeded: {0:?}")]
    Quota(QuotaDetail),

    #[error("upload session is {state}, expected open")]
    WrongState { state: String },

    #[error("chunk {index} conflicts with committed data")]
    ChunkConflict {
        index: u64,
        /// Indices already committed, returned to the client alongside
        /// the 409 so it can resume correctly
        committed: Vec<u64>,
    },

    #[error("upload incomplete: {missing} chunks missing, {received_bytes}/{total_bytes} bytes")]
    Incomplete {
        missing: usize,
        received_bytes: u64,
        total_bytes: u64,
    },

    #[error("declared hash does not match assembled content")]
    HashMismatch,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Quota(_) => ErrorKind::QuotaExceeded,
            Self::WrongState { .. }
            | Self::ChunkConflict { .. }
            | Self::Incomplete { .. }
            | Self::HashMismatch => ErrorKind::Conflict,
            Self::Io(_) => ErrorKind::Transient,
            Self::Store(err) => err.kind(),
        }
    }
}
