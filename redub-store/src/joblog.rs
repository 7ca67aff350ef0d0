use sqlx::Row;
use tokio::io::AsyncWriteExt;

use redub_core::JobId;

use crate::db::MetaStore;
use crate::error::StoreResult;

impl MetaStore {
    /// Append one line to a job's log file and index its position.
    ///
    /// The line is stored verbatim plus a trailing newline; callers are
    /// expected to have redacted secrets already (worker logs go through
    /// `redub_core::redact` before they get here).
    pub async fn append_log(&self, job_id: &JobId, line: &str) -> StoreResult<()> {
        let path = self.job_log_path(job_id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut payload = line.as_bytes().to_vec();
        payload.push(b'\n');
        file.write_all(&payload).await?;

        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO job_log_positions (job_id, lines, bytes) VALUES (?1, 1, ?2)
             ON CONFLICT(job_id) DO UPDATE SET
                 lines = lines + 1,
                 bytes = bytes + excluded.bytes",
        )
        .bind(job_id.as_str())
        .bind(payload.len() as i64)
        .execute(&self.jobs_db)
        .await?;
        Ok(())
    }

    /// The last `n` log lines of a job, oldest first. A job with no log
    /// yet yields an empty vector.
    pub async fn tail_log(&self, job_id: &JobId, n: usize) -> StoreResult<Vec<String>> {
        let path = self.job_log_path(job_id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].iter().map(|s| s.to_string()).collect())
    }

    /// Indexed line/byte counters for a job's log.
    pub async fn log_position(&self, job_id: &JobId) -> StoreResult<(u64, u64)> {
        let row = sqlx::query("SELECT lines, bytes FROM job_log_positions WHERE job_id = ?1")
            .bind(job_id.as_str())
            .fetch_optional(&self.jobs_db)
            .await?;
        Ok(row
            .map(|r| {
                (
                    r.get::<i64, _>("lines").max(0) as u64,
                    r.get::<i64, _>("bytes").max(0) as u64,
                )
            })
            .unwrap_or((0, 0)))
    }

    pub fn job_log_path(&self, job_id: &JobId) -> std::path::PathBuf {
        self.log_dir.join(format!("{}.log", job_id.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store() -> (tempfile::TempDir, MetaStore) {
        std::env::set_var("REDUB_ALLOW_UNSAFE_STATE_DIR", "1");
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(&dir.path().join("state"), &dir.path().join("logs"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn append_and_tail() {
        let (_dir, store) = open_store().await;
        let job = JobId::new();

        for i in 0..5 {
            store
                .append_log(&job, &format!("stage transcribe step {i}"))
                .await
                .unwrap();
        }

        let tail = store.tail_log(&job, 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail[1].ends_with("step 4"));

        let (lines, bytes) = store.log_position(&job).await.unwrap();
        assert_eq!(lines, 5);
        assert!(bytes > 0);
    }

    #[tokio::test]
    async fn tail_of_missing_log_is_empty() {
        let (_dir, store) = open_store().await;
        assert!(store.tail_log(&JobId::new(), 10).await.unwrap().is_empty());
    }
}
