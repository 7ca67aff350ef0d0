use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use redub_store::{JobState, MetaStore, OutboxState, StoreError};

use crate::auto::{AutoDispatch, BackendKind};
use crate::Submission;

const FLUSH_BATCH: u32 = 32;

/// Drains the submission outbox into the active dispatch backend.
///
/// The outbox row is written in the same transaction as the job, so a
/// submission survives any backend outage: this task keeps retrying until
/// some backend accepts it. Rows for jobs that left `QUEUED` in the
/// meantime (canceled before dispatch) are closed without submitting.
pub struct OutboxFlusher {
    meta: Arc<MetaStore>,
    dispatch: Arc<AutoDispatch>,
    interval: Duration,
}

impl OutboxFlusher {
    pub fn new(meta: Arc<MetaStore>, dispatch: Arc<AutoDispatch>, interval: Duration) -> Self {
        Self {
            meta,
            dispatch,
            interval,
        }
    }

    /// One pass over the pending rows. Returns how many were settled.
    pub async fn flush_once(&self) -> usize {
        let rows = match self.meta.pending_outbox(FLUSH_BATCH).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "outbox scan failed");
                return 0;
            }
        };

        let mut settled = 0;
        for row in rows {
            let job = match self.meta.get_job(&row.job_id).await {
                Ok(job) => job,
                Err(StoreError::NotFound(_)) => {
                    // Nothing left to dispatch; close the row.
                    let _ = self
                        .meta
                        .mark_outbox(&row.job_id, OutboxState::SentLocal, Some("job missing"))
                        .await;
                    continue;
                }
                Err(err) => {
                    warn!(job = %row.job_id, error = %err, "outbox job load failed");
                    continue;
                }
            };

            if job.state != JobState::Queued {
                let _ = self
                    .meta
                    .mark_outbox(&row.job_id, OutboxState::SentLocal, Some("not queued"))
                    .await;
                continue;
            }

            let submission = Submission {
                job_id: job.id.clone(),
                priority: job.priority,
                available_at: job.dispatch_after.unwrap_or_else(Utc::now),
                submitted_at: job.created_at,
            };

            match self.dispatch.route(submission).await {
                Ok(BackendKind::Redis) => {
                    let _ = self
                        .meta
                        .mark_outbox(&row.job_id, OutboxState::SentRedis, None)
                        .await;
                    settled += 1;
                }
                Ok(BackendKind::Local) => {
                    let _ = self
                        .meta
                        .mark_outbox(&row.job_id, OutboxState::SentLocal, None)
                        .await;
                    settled += 1;
                }
                Err(err) => {
                    debug!(job = %row.job_id, error = %err, "outbox flush attempt failed");
                    let _ = self
                        .meta
                        .mark_outbox(&row.job_id, OutboxState::Error, Some(&err.to_string()))
                        .await;
                }
            }
        }
        settled
    }

    /// Runs until `shutdown` flips true.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_once().await;
                }
                changed = shutdown.changed() => {
                    // A dropped sender means the supervisor is gone.
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auto::AutoPolicy;
    use crate::DispatchBackend;
    use redub_core::{ConsumerId, QueueBackendKind, UserId};
    use redub_events::EventHub;
    use redub_store::{InputRef, JobRecord};

    async fn fixture() -> (tempfile::TempDir, Arc<MetaStore>, Arc<AutoDispatch>, OutboxFlusher) {
        std::env::set_var("REDUB_ALLOW_UNSAFE_STATE_DIR", "1");
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(
            MetaStore::open(&dir.path().join("state"), &dir.path().join("logs"))
                .await
                .unwrap(),
        );
        let dispatch = Arc::new(
            AutoDispatch::new(
                QueueBackendKind::Local,
                None,
                64,
                AutoPolicy::default(),
                EventHub::default(),
                meta.clone(),
            )
            .await,
        );
        let flusher = OutboxFlusher::new(meta.clone(), dispatch.clone(), Duration::from_millis(100));
        (dir, meta, dispatch, flusher)
    }

    #[tokio::test]
    async fn queued_jobs_flow_from_outbox_to_backend() {
        let (_dir, meta, dispatch, flusher) = fixture().await;
        let job = JobRecord::new(
            UserId::new(),
            InputRef::Path { path: "/in".into() },
            serde_json::json!({}),
        );
        meta.create_job(&job).await.unwrap();

        assert_eq!(flusher.flush_once().await, 1);
        assert!(meta.pending_outbox(10).await.unwrap().is_empty());

        let claims = dispatch
            .claim(
                &ConsumerId::new("w"),
                1,
                Duration::from_millis(50),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].job_id, job.id);
    }

    #[tokio::test]
    async fn canceled_before_dispatch_closes_the_row() {
        let (_dir, meta, dispatch, flusher) = fixture().await;
        let job = JobRecord::new(
            UserId::new(),
            InputRef::Path { path: "/in".into() },
            serde_json::json!({}),
        );
        meta.create_job(&job).await.unwrap();
        meta.update_job(&job.id, None, |j| j.transition(JobState::Canceled))
            .await
            .unwrap();

        assert_eq!(flusher.flush_once().await, 0);
        assert!(meta.pending_outbox(10).await.unwrap().is_empty());
        assert_eq!(dispatch.depth().await.unwrap(), 0);
    }
}
