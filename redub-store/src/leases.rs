use chrono::Utc;
use sqlx::Row;
use std::time::Duration;

use redub_core::{ConsumerId, JobId};

use crate::db::MetaStore;
use crate::error::StoreResult;
use crate::time::to_millis;

/// Result of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The caller now holds the lease until the returned deadline
    Acquired { expires_at: chrono::DateTime<Utc> },
    /// Someone else holds an unexpired lease
    HeldByOther { consumer: String },
}

impl MetaStore {
    /// Acquire the execution lease for a job.
    ///
    /// A single atomic statement: insert the row, or replace it iff the
    /// existing lease has expired. This is what makes execution
    /// at-most-once across instances regardless of dispatch backend.
    pub async fn acquire_lease(
        &self,
        job_id: &JobId,
        consumer: &ConsumerId,
        ttl: Duration,
    ) -> StoreResult<LeaseOutcome> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(300));

        let result = sqlx::query(
            "INSERT INTO leases (job_id, consumer, expires_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(job_id) DO UPDATE SET
                 consumer = excluded.consumer,
                 expires_at = excluded.expires_at
             WHERE leases.expires_at <= ?4 OR leases.consumer = excluded.consumer",
        )
        .bind(job_id.as_str())
        .bind(consumer.as_str())
        .bind(to_millis(expires_at))
        .bind(to_millis(now))
        .execute(&self.jobs_db)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(LeaseOutcome::Acquired { expires_at });
        }

        let row = sqlx::query("SELECT consumer FROM leases WHERE job_id = ?1")
            .bind(job_id.as_str())
            .fetch_optional(&self.jobs_db)
            .await?;
        Ok(LeaseOutcome::HeldByOther {
            consumer: row.map(|r| r.get("consumer")).unwrap_or_default(),
        })
    }

    /// Extend a held lease; a lost or stolen lease is a no-op.
    pub async fn extend_lease(
        &self,
        job_id: &JobId,
        consumer: &ConsumerId,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let expires_at =
            Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(300));
        let result = sqlx::query(
            "UPDATE leases SET expires_at = ?1 WHERE job_id = ?2 AND consumer = ?3",
        )
        .bind(to_millis(expires_at))
        .bind(job_id.as_str())
        .bind(consumer.as_str())
        .execute(&self.jobs_db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Whether any unexpired lease exists for the job.
    pub async fn has_active_lease(&self, job_id: &JobId) -> StoreResult<bool> {
        let row = sqlx::query("SELECT expires_at FROM leases WHERE job_id = ?1")
            .bind(job_id.as_str())
            .fetch_optional(&self.jobs_db)
            .await?;
        Ok(row
            .map(|r| r.get::<i64, _>("expires_at") > to_millis(Utc::now()))
            .unwrap_or(false))
    }

    /// Release a lease held by `consumer`. Releasing someone else's lease
    /// is a no-op.
    pub async fn release_lease(&self, job_id: &JobId, consumer: &ConsumerId) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM leases WHERE job_id = ?1 AND consumer = ?2")
            .bind(job_id.as_str())
            .bind(consumer.as_str())
            .execute(&self.jobs_db)
            .await?;
        Ok(())
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
    async fn second_consumer_is_refused_while_lease_held() {
        let (_dir, store) = open_store().await;
        let job = JobId::new();
        let a = ConsumerId::new("worker-a");
        let b = ConsumerId::new("worker-b");

        let first = store
            .acquire_lease(&job, &a, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(first, LeaseOutcome::Acquired { .. }));

        let second = store
            .acquire_lease(&job, &b, Duration::from_secs(60))
            .await
            .unwrap();
        match second {
            LeaseOutcome::HeldByOther { consumer } => assert_eq!(consumer, a.to_string()),
            other => panic!("expected HeldByOther, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let (_dir, store) = open_store().await;
        let job = JobId::new();
        let a = ConsumerId::new("worker-a");
        let b = ConsumerId::new("worker-b");

        store
            .acquire_lease(&job, &a, Duration::from_millis(0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let takeover = store
            .acquire_lease(&job, &b, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(takeover, LeaseOutcome::Acquired { .. }));
    }

    #[tokio::test]
    async fn holder_can_reacquire_and_release() {
        let (_dir, store) = open_store().await;
        let job = JobId::new();
        let a = ConsumerId::new("worker-a");

        store
            .acquire_lease(&job, &a, Duration::from_secs(60))
            .await
            .unwrap();
        // Re-entrant acquisition by the same consumer refreshes the deadline.
        let again = store
            .acquire_lease(&job, &a, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(again, LeaseOutcome::Acquired { .. }));

        assert!(store
            .extend_lease(&job, &a, Duration::from_secs(120))
            .await
            .unwrap());

        store.release_lease(&job, &a).await.unwrap();
        let b = ConsumerId::new("worker-b");
        let after = store
            .acquire_lease(&job, &b, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(after, LeaseOutcome::Acquired { .. }));
    }
}
