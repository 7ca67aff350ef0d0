use chrono::Utc;
use sqlx::Row;

use redub_core::JobId;

use crate::db::MetaStore;
use crate::error::StoreResult;
use crate::time::to_millis;

/// Delivery state of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxState {
    Pending,
    SentRedis,
    SentLocal,
    Error,
}

impl OutboxState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::SentRedis => "sent_redis",
            Self::SentLocal => "sent_local",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent_redis" => Self::SentRedis,
            "sent_local" => Self::SentLocal,
            "error" => Self::Error,
            _ => Self::Pending,
        }
    }
}

/// One row of the submission outbox. Written in the same transaction as
/// the job insert; drained by the dispatch flusher.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub job_id: JobId,
    pub state: OutboxState,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl MetaStore {
    /// Pending (or errored, for retry) rows, oldest first.
    pub async fn pending_outbox(&self, limit: u32) -> StoreResult<Vec<OutboxRow>> {
        let rows = sqlx::query(
            "SELECT job_id, state, attempts, last_error FROM outbox
             WHERE state IN ('pending', 'error')
             ORDER BY updated_at ASC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.jobs_db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| OutboxRow {
                job_id: JobId::from_string(row.get("job_id")),
                state: OutboxState::parse(row.get::<String, _>("state").as_str()),
                attempts: row.get::<i64, _>("attempts").max(0) as u32,
                last_error: row.get("last_error"),
            })
            .collect())
    }

    /// Record the outcome of one flush attempt.
    pub async fn mark_outbox(
        &self,
        job_id: &JobId,
        state: OutboxState,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "UPDATE outbox SET state = ?1, attempts = attempts + 1,
                    last_error = ?2, updated_at = ?3
             WHERE job_id = ?4",
        )
        .bind(state.name())
        .bind(error)
        .bind(to_millis(Utc::now()))
        .bind(job_id.as_str())
        .execute(&self.jobs_db)
        .await?;
        Ok(())
    }

    /// Re-open a delivered row so the flusher routes the job again.
    /// Used by reruns and resume-after-pause.
    pub async fn reopen_outbox(&self, job_id: &JobId) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO outbox (job_id, state, attempts, last_error, updated_at)
             VALUES (?1, 'pending', 0, NULL, ?2)
             ON CONFLICT(job_id) DO UPDATE SET
                 state = 'pending', last_error = NULL, updated_at = excluded.updated_at",
        )
        .bind(job_id.as_str())
        .bind(to_millis(Utc::now()))
        .execute(&self.jobs_db)
        .await?;
        Ok(())
    }
}
