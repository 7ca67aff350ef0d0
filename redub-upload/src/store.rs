use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use redub_core::{Config, QuotaDetail, UploadId, UserId};
use redub_store::{MetaStore, StoreError, UploadRecord, UploadState};

use crate::error::{UploadError, UploadResult};
use crate::sanitize::sanitize_filename;

/// Outcome of a chunk write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkWrite {
    Committed,
    /// The exact bytes were already committed at this index; a no-op
    AlreadyCommitted,
}

/// Client-facing view of a session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UploadStatus {
    pub id: UploadId,
    pub state: UploadState,
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub chunk_bytes: u64,
    pub missing_indices: Vec<u64>,
    pub expires_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct UploadLimits {
    max_upload_bytes: u64,
    max_storage_bytes_per_user: u64,
    max_inflight_per_user: u64,
    session_ttl: chrono::Duration,
}

/// Disk-backed resumable upload sessions. Bookkeeping lives in the
/// metadata store; this type owns the bytes.
pub struct UploadStore {
    meta: Arc<MetaStore>,
    root: PathBuf,
    limits: UploadLimits,
    /// Per-upload commit locks, created lazily
    locks: parking_lot::Mutex<HashMap<UploadId, Arc<tokio::sync::Mutex<()>>>>,
}

impl UploadStore {
    pub fn new(meta: Arc<MetaStore>, config: &Config) -> UploadResult<Self> {
        std::fs::create_dir_all(&config.uploads_dir)?;
        Ok(Self {
            meta,
            root: config.uploads_dir.clone(),
            limits: UploadLimits {
                max_upload_bytes: config.max_upload_bytes,
                max_storage_bytes_per_user: config.max_storage_bytes_per_user,
                max_inflight_per_user: config.max_uploads_inflight_per_user,
                session_ttl: chrono::Duration::from_std(config.upload_session_ttl)
                    .unwrap_or_else(|_| chrono::Duration::hours(48)),
            },
            locks: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    fn lock_for(&self, id: &UploadId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn drop_lock(&self, id: &UploadId) {
        self.locks.lock().remove(id);
    }

    fn session_dir(&self, id: &UploadId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn chunk_path(&self, id: &UploadId, index: u64) -> PathBuf {
        self.session_dir(id).join(format!("chunk_{index:06}"))
    }

    /// Canonical location of the assembled file once the session is
    /// complete.
    pub fn final_path(&self, record: &UploadRecord) -> PathBuf {
        self.session_dir(&record.id).join(&record.filename_safe)
    }

    /// Start a new session: quota checks, filename sanitation, a private
    /// directory on disk, and a metadata record. Storage is reserved up
    /// front so concurrent sessions cannot overshoot the cap; abandonment
    /// releases the reservation.
    pub async fn init(
        &self,
        owner: &UserId,
        filename: &str,
        total_bytes: u64,
        chunk_bytes: u64,
        declared_hash: Option<String>,
    ) -> UploadResult<UploadRecord> {
        let safe_name = sanitize_filename(filename).map_err(UploadError::Validation)?;

        if total_bytes == 0 {
            return Err(UploadError::Validation("total_bytes must be positive".into()));
        }
        if total_bytes > self.limits.max_upload_bytes {
            return Err(UploadError::Quota(QuotaDetail::new(
                "upload_init",
                "max_upload_bytes",
                self.limits.max_upload_bytes,
                total_bytes,
            )));
        }
        if chunk_bytes == 0 || chunk_bytes > self.limits.max_upload_bytes {
            return Err(UploadError::Validation("chunk_bytes out of range".into()));
        }

        let limits = self.limits.clone();
        let quota_result = self
            .meta
            .update_quota(owner, |q| {
                if q.uploads_inflight >= limits.max_inflight_per_user {
                    return Err("uploads_inflight_limit".into());
                }
                if q.storage_bytes_used + total_bytes > limits.max_storage_bytes_per_user {
                    return Err("storage_bytes_limit".into());
                }
                q.uploads_inflight += 1;
                q.storage_bytes_used += total_bytes;
                Ok(())
            })
            .await;

        if let Err(StoreError::Conflict(reason)) = &quota_result {
            let snapshot = self.meta.quota(owner).await?;
            let (limit, current) = match reason.as_str() {
                "uploads_inflight_limit" => {
                    (limits.max_inflight_per_user, snapshot.uploads_inflight)
                }
                _ => (limits.max_storage_bytes_per_user, snapshot.storage_bytes_used),
            };
            return Err(UploadError::Quota(QuotaDetail::new(
                "upload_init",
                reason.clone(),
                limit,
                current,
            )));
        }
        quota_result?;

        let mut record = UploadRecord::new(
            owner.clone(),
            safe_name,
            total_bytes,
            chunk_bytes,
            self.limits.session_ttl,
        );
        record.declared_hash = declared_hash;

        let dir = self.session_dir(&record.id);
        tokio::fs::create_dir_all(&dir).await?;
        ensure_contained(&self.root, &dir)?;

        self.meta.put_upload(&record).await?;
        info!(upload = %record.id, owner = %owner, bytes = total_bytes, "upload session opened");
        Ok(record)
    }

    /// Commit one chunk. Requires `offset == index * chunk_bytes`; the
    /// final chunk may be shorter than `chunk_bytes`. Identical
    /// re-delivery of a committed index is an idempotent success; any
    /// other overlap is a conflict and mutates nothing.
    pub async fn write_chunk(
        &self,
        id: &UploadId,
        index: u64,
        offset: u64,
        bytes: &[u8],
    ) -> UploadResult<ChunkWrite> {
        let record = self.get(id).await?;

        if record.state != UploadState::Open {
            return Err(UploadError::WrongState {
                state: record.state.to_string(),
            });
        }
        if record.is_expired(Utc::now()) {
            return Err(UploadError::WrongState {
                state: "expired".into(),
            });
        }
        if index >= record.expected_chunks {
            return Err(UploadError::Validation(format!(
                "chunk index {index} out of range (expected {} chunks)",
                record.expected_chunks
            )));
        }
        if offset != index * record.chunk_bytes {
            return Err(UploadError::Validation(format!(
                "offset {offset} does not match index {index} (chunk_bytes {})",
                record.chunk_bytes
            )));
        }
        let expected_len = record.expected_chunk_len(index);
        if bytes.len() as u64 != expected_len {
            return Err(UploadError::Validation(format!(
                "chunk {index} must be {expected_len} bytes, got {}",
                bytes.len()
            )));
        }

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        // Re-check under the lock: a concurrent writer may have committed
        // this index while we waited.
        let record = self.get(id).await?;
        if record.has_chunk(index) {
            let existing = tokio::fs::read(self.chunk_path(id, index)).await?;
            if existing == bytes {
                debug!(upload = %id, index, "identical chunk re-delivery ignored");
                return Ok(ChunkWrite::AlreadyCommitted);
            }
            let mut committed: Vec<u64> = (0..record.expected_chunks)
                .filter(|i| record.has_chunk(*i))
                .collect();
            committed.sort_unstable();
            return Err(UploadError::ChunkConflict { index, committed });
        }

        // Temp sibling then rename: a crash mid-write leaves no committed
        // state behind.
        let final_path = self.chunk_path(id, index);
        let tmp_path = self.session_dir(id).join(format!(".chunk_{index:06}.tmp"));
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &final_path).await?;

        let len = bytes.len() as u64;
        self.meta
            .update_upload(id, |u| {
                u.set_chunk(index, len);
                Ok(())
            })
            .await?;

        Ok(ChunkWrite::Committed)
    }

    /// Verify, assemble and seal the session. Returns the canonical path
    /// of the assembled input file. Completing an already-complete session
    /// returns the same path again.
    pub async fn complete(&self, id: &UploadId) -> UploadResult<PathBuf> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let record = self.get(id).await?;
        match record.state {
            UploadState::Complete => return Ok(self.final_path(&record)),
            UploadState::Abandoned => {
                return Err(UploadError::WrongState {
                    state: record.state.to_string(),
                })
            }
            UploadState::Open => {}
        }

        let missing = record.missing_indices();
        if !missing.is_empty() || record.received_bytes != record.total_bytes {
            return Err(UploadError::Incomplete {
                missing: missing.len(),
                received_bytes: record.received_bytes,
                total_bytes: record.total_bytes,
            });
        }

        let dir = self.session_dir(id);
        ensure_contained(&self.root, &dir)?;

        let assembled_tmp = dir.join(".assembling.tmp");
        let mut out = tokio::fs::File::create(&assembled_tmp).await?;
        let mut hasher = Sha256::new();
        for index in 0..record.expected_chunks {
            let bytes = tokio::fs::read(self.chunk_path(id, index)).await?;
            hasher.update(&bytes);
            out.write_all(&bytes).await?;
        }
        out.sync_all().await?;
        drop(out);

        let digest = hasher.finalize();
        let final_hash: String = digest.iter().map(|b| format!("{b:02x}")).collect();

        if let Some(declared) = &record.declared_hash {
            if !declared.eq_ignore_ascii_case(&final_hash) {
                tokio::fs::remove_file(&assembled_tmp).await.ok();
                return Err(UploadError::HashMismatch);
            }
        }

        let final_path = self.final_path(&record);
        tokio::fs::rename(&assembled_tmp, &final_path).await?;

        for index in 0..record.expected_chunks {
            tokio::fs::remove_file(self.chunk_path(id, index)).await.ok();
        }

        self.meta
            .update_upload(id, |u| {
                u.state = UploadState::Complete;
                u.final_hash = Some(final_hash.clone());
                Ok(())
            })
            .await?;

        self.meta
            .update_quota(&record.owner_id, |q| {
                q.uploads_inflight = q.uploads_inflight.saturating_sub(1);
                Ok(())
            })
            .await?;

        self.drop_lock(id);
        info!(upload = %id, path = %final_path.display(), "upload complete");
        Ok(final_path)
    }

    pub async fn status(&self, id: &UploadId) -> UploadResult<UploadStatus> {
        let record = self.get(id).await?;
        Ok(UploadStatus {
            id: record.id.clone(),
            state: record.state,
            received_bytes: record.received_bytes,
            total_bytes: record.total_bytes,
            chunk_bytes: record.chunk_bytes,
            missing_indices: record.missing_indices(),
            expires_at: record.expires_at,
        })
    }

    pub async fn get(&self, id: &UploadId) -> UploadResult<UploadRecord> {
        self.meta.get_upload(id).await.map_err(|err| match err {
            StoreError::NotFound(_) => UploadError::NotFound(id.to_string()),
            other => UploadError::Store(other),
        })
    }

    /// Sweep sessions whose deadline passed: free disk, release the quota
    /// reservation, mark abandoned. Returns how many were reclaimed.
    pub async fn sweep_expired(&self) -> UploadResult<usize> {
        let expired = self.meta.expired_uploads(Utc::now()).await?;
        let mut reclaimed = 0;

        for record in expired {
            let lock = self.lock_for(&record.id);
            let _guard = lock.lock().await;

            let dir = self.session_dir(&record.id);
            if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(upload = %record.id, error = %err, "failed to remove expired upload dir");
                    continue;
                }
            }

            self.meta
                .update_upload(&record.id, |u| {
                    u.state = UploadState::Abandoned;
                    Ok(())
                })
                .await?;

            self.meta
                .update_quota(&record.owner_id, |q| {
                    q.storage_bytes_used = q.storage_bytes_used.saturating_sub(record.total_bytes);
                    q.uploads_inflight = q.uploads_inflight.saturating_sub(1);
                    Ok(())
                })
                .await?;

            self.drop_lock(&record.id);
            reclaimed += 1;
        }

        if reclaimed > 0 {
            info!(count = reclaimed, "swept expired upload sessions");
        }
        Ok(reclaimed)
    }
}

/// Defense against traversal: the resolved session path must stay under
/// the uploads root.
fn ensure_contained(root: &Path, candidate: &Path) -> UploadResult<()> {
    let root = root.canonicalize()?;
    let candidate = candidate.canonicalize()?;
    if !candidate.starts_with(&root) {
        return Err(UploadError::Validation(format!(
            "path {} escapes the uploads root",
            candidate.display()
        )));
    }
    Ok(())
}
