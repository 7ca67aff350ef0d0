//! redub-upload: resumable chunked upload sessions.
//!
//! Chunk bytes live on disk under the configured uploads root, one private
//! directory per session; all bookkeeping (bitmaps, byte counts, expiry)
//! lives in the metadata store. Chunk commits are atomic: bytes land in a
//! temp sibling, are renamed into place, and only then is the bitmap bit
//! set. A committed chunk index is immutable; re-delivering identical
//! bytes is an idempotent success, anything else is a conflict.

pub mod error;
pub mod sanitize;
pub mod store;

pub use error::{UploadError, UploadResult};
pub use sanitize::sanitize_filename;
pub use store::{ChunkWrite, UploadStatus, UploadStore};
