use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use redub_core::{UploadId, UserId};

/// Upload session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Open,
    Complete,
    Abandoned,
}

impl UploadState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Complete => "complete",
            Self::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Resumable chunked upload session metadata.
///
/// Chunk bytes live on disk under the uploads root; this record owns the
/// bookkeeping: which chunk indices committed, how many bytes arrived, and
/// when the session expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: UploadId,
    pub owner_id: UserId,
    pub filename_safe: String,
    pub total_bytes: u64,
    pub chunk_bytes: u64,
    pub expected_chunks: u64,

    /// Sparse bitmap of committed chunk indices, one bit per index
    #[serde(default)]
    pub received: Vec<u8>,
    pub received_bytes: u64,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: UploadState,

    /// Hash declared by the client at init, verified at complete
    pub declared_hash: Option<String>,
    /// Content hash recorded at complete
    pub final_hash: Option<String>,
}

impl UploadRecord {
    pub fn new(
        owner_id: UserId,
        filename_safe: String,
        total_bytes: u64,
        chunk_bytes: u64,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        let expected_chunks = total_bytes.div_ceil(chunk_bytes.max(1));
        Self {
            id: UploadId::new(),
            owner_id,
            filename_safe,
            total_bytes,
            chunk_bytes,
            expected_chunks,
            received: vec![0; (expected_chunks as usize).div_ceil(8)],
            received_bytes: 0,
            created_at: now,
            expires_at: now + ttl,
            state: UploadState::Open,
            declared_hash: None,
            final_hash: None,
        }
    }

    /// Whether chunk `index` has been committed.
    pub fn has_chunk(&self, index: u64) -> bool {
        let byte = (index / 8) as usize;
        let bit = (index % 8) as u8;
        self.received
            .get(byte)
            .map(|b| b & (1 << bit) != 0)
            .unwrap_or(false)
    }

    /// Mark chunk `index` as committed and account its bytes.
    pub fn set_chunk(&mut self, index: u64, len: u64) {
        let byte = (index / 8) as usize;
        let bit = (index % 8) as u8;
        if byte >= self.received.len() {
            self.received.resize(byte + 1, 0);
        }
        if !self.has_chunk(index) {
            self.received[byte] |= 1 << bit;
            self.received_bytes += len;
        }
    }

    /// Indices in `[0, expected_chunks)` not yet committed.
    pub fn missing_indices(&self) -> Vec<u64> {
        (0..self.expected_chunks)
            .filter(|i| !self.has_chunk(*i))
            .collect()
    }

    /// Complete iff every index committed and byte counts agree exactly.
    pub fn is_complete(&self) -> bool {
        self.missing_indices().is_empty() && self.received_bytes == self.total_bytes
    }

    /// The byte length chunk `index` must have: `chunk_bytes`, except the
    /// final chunk which may be shorter.
    pub fn expected_chunk_len(&self, index: u64) -> u64 {
        if index + 1 == self.expected_chunks {
            let rem = self.total_bytes % self.chunk_bytes;
            if rem == 0 {
                self.chunk_bytes
            } else {
                rem
            }
        } else {
            self.chunk_bytes
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == UploadState::Open && self.expires_at < now
    }
}
