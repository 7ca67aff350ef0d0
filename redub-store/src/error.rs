use redub_core::ErrorKind;
use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Infrastructure errors for the metadata store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("state mismatch: expected {expected}, found {actual}")]
    StateMismatch { expected: String, actual: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("disk full")]
    DiskFull,

    #[error("store corruption: {0}")]
    Corruption(String),

    #[error("refusing to open store at unsafe path: {0}")]
    UnsafePath(String),

    #[error("schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Classify into the workspace-wide error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::StateMismatch { .. } | Self::Conflict(_) => ErrorKind::Conflict,
            Self::DiskFull => ErrorKind::QuotaExceeded,
            Self::Corruption(_) | Self::SchemaTooNew { .. } | Self::UnsafePath(_) => {
                ErrorKind::Corruption
            }
            Self::Serialization(_) => ErrorKind::Fatal,
            Self::Io(_) | Self::Database(_) => ErrorKind::Transient,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row".into()),
            sqlx::Error::Io(io) => {
                if io.raw_os_error() == Some(28) {
                    // ENOSPC
                    Self::DiskFull
                } else {
                    Self::Io(io)
                }
            }
            other => {
                let text = other.to_string();
                if text.contains("disk is full") || text.contains("database or disk is full") {
                    Self::DiskFull
                } else if text.contains("malformed") || text.contains("not a database") {
                    Self::Corruption(text)
                } else {
                    Self::Database(text)
                }
            }
        }
    }
}
