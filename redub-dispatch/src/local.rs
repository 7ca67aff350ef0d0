use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use redub_core::{ClaimToken, ConsumerId, JobId};

use crate::error::{DispatchError, DispatchResult};
use crate::{Claimed, DispatchBackend, Health, Submission};

/// Deterministic queue order: priority desc, then availability, then
/// submission time, then job ID lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority_rank: u8,
    available_at_ms: i64,
    submitted_at_ms: i64,
    job_id: JobId,
}

impl QueueKey {
    fn for_submission(sub: &Submission) -> Self {
        Self {
            // Invert so that the BTreeMap's ascending order yields High first.
            priority_rank: 3 - sub.priority.as_u8(),
            available_at_ms: sub.available_at.timestamp_millis(),
            submitted_at_ms: sub.submitted_at.timestamp_millis(),
            job_id: sub.job_id.clone(),
        }
    }
}

struct InflightClaim {
    token: ClaimToken,
    submission: Submission,
}

#[derive(Default)]
struct LocalState {
    entries: BTreeMap<QueueKey, Submission>,
    pending_ids: HashSet<JobId>,
    inflight: HashMap<JobId, InflightClaim>,
}

/// Bounded in-process dispatch queue. Survives nothing - durability comes
/// from the outbox and the boot-time requeue of `QUEUED` jobs.
pub struct LocalDispatch {
    state: Mutex<LocalState>,
    notify: Notify,
    max_depth: usize,
    closed: AtomicBool,
}

impl LocalDispatch {
    pub fn new(max_depth: usize) -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            notify: Notify::new(),
            max_depth,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DispatchBackend for LocalDispatch {
    async fn submit(&self, submission: Submission) -> DispatchResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DispatchError::Closed);
        }
        {
            let mut state = self.state.lock();
            if state.pending_ids.contains(&submission.job_id) {
                // Already queued; resubmission is idempotent.
                return Ok(());
            }
            if state.entries.len() >= self.max_depth {
                return Err(DispatchError::QueueFull {
                    depth: state.entries.len(),
                });
            }
            state.pending_ids.insert(submission.job_id.clone());
            state
                .entries
                .insert(QueueKey::for_submission(&submission), submission);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn claim(
        &self,
        _consumer: &ConsumerId,
        n: usize,
        wait: Duration,
        _visibility_ttl: Duration,
    ) -> DispatchResult<Vec<Claimed>> {
        let deadline = Instant::now() + wait;

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(DispatchError::Closed);
            }

            let now_ms = Utc::now().timestamp_millis();
            let mut claimed = Vec::new();
            {
                let mut state = self.state.lock();
                let eligible: Vec<QueueKey> = state
                    .entries
                    .keys()
                    .filter(|k| k.available_at_ms <= now_ms)
                    .take(n)
                    .cloned()
                    .collect();

                for key in eligible {
                    if let Some(submission) = state.entries.remove(&key) {
                        state.pending_ids.remove(&submission.job_id);
                        let token = ClaimToken::new();
                        state.inflight.insert(
                            submission.job_id.clone(),
                            InflightClaim {
                                token: token.clone(),
                                submission: submission.clone(),
                            },
                        );
                        claimed.push(Claimed {
                            job_id: submission.job_id,
                            token,
                            backend: "local",
                        });
                    }
                }
            }

            if !claimed.is_empty() {
                return Ok(claimed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let nap = (deadline - now).min(Duration::from_millis(100));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn ack(&self, claim: &Claimed) -> DispatchResult<()> {
        let mut state = self.state.lock();
        match state.inflight.get(&claim.job_id) {
            Some(held) if held.token == claim.token => {
                state.inflight.remove(&claim.job_id);
                Ok(())
            }
            _ => Err(DispatchError::UnknownClaim(claim.job_id.to_string())),
        }
    }

    async fn nack(&self, claim: &Claimed, delay: Duration) -> DispatchResult<()> {
        {
            let mut state = self.state.lock();
            match state.inflight.get(&claim.job_id) {
                Some(held) if held.token == claim.token => {
                    let held = state.inflight.remove(&claim.job_id).unwrap();
                    let mut submission = held.submission;
                    submission.available_at = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    state.pending_ids.insert(submission.job_id.clone());
                    state
                        .entries
                        .insert(QueueKey::for_submission(&submission), submission);
                }
                _ => return Err(DispatchError::UnknownClaim(claim.job_id.to_string())),
            }
        }
        debug!(job = %claim.job_id, "nacked back into local queue");
        self.notify.notify_waiters();
        Ok(())
    }

    async fn health(&self) -> Health {
        if self.closed.load(Ordering::Acquire) {
            Health::Degraded
        } else {
            Health::Ok
        }
    }

    async fn depth(&self) -> DispatchResult<usize> {
        Ok(self.state.lock().entries.len())
    }

    fn name(&self) -> &'static str {
        "local"
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redub_store::JobPriority;

    fn consumer() -> ConsumerId {
        ConsumerId::new("test")
    }

    #[tokio::test]
    async fn claims_follow_priority_then_fifo_then_id() {
        let queue = LocalDispatch::new(64);

        let low = Submission::now(JobId::from("job_a"), JobPriority::Low);
        let high = Submission::now(JobId::from("job_b"), JobPriority::High);
        let medium = Submission::now(JobId::from("job_c"), JobPriority::Medium);
        queue.submit(low).await.unwrap();
        queue.submit(high).await.unwrap();
        queue.submit(medium).await.unwrap();

        let claims = queue
            .claim(&consumer(), 3, Duration::from_millis(50), Duration::from_secs(60))
            .await
            .unwrap();
        let order: Vec<&str> = claims.iter().map(|c| c.job_id.as_str()).collect();
        assert_eq!(order, vec!["job_b", "job_c", "job_a"]);
    }

    #[tokio::test]
    async fn equal_submissions_tie_break_on_job_id() {
        let queue = LocalDispatch::new(64);
        let at = Utc::now();
        for id in ["job_z", "job_m", "job_a"] {
            queue
                .submit(Submission {
                    job_id: JobId::from(id),
                    priority: JobPriority::Medium,
                    available_at: at,
                    submitted_at: at,
                })
                .await
                .unwrap();
        }

        let claims = queue
            .claim(&consumer(), 3, Duration::from_millis(50), Duration::from_secs(60))
            .await
            .unwrap();
        let order: Vec<&str> = claims.iter().map(|c| c.job_id.as_str()).collect();
        assert_eq!(order, vec!["job_a", "job_m", "job_z"]);
    }

    #[tokio::test]
    async fn delayed_submissions_wait_for_eligibility() {
        let queue = LocalDispatch::new(64);
        queue
            .submit(Submission::delayed(
                JobId::from("job_later"),
                JobPriority::High,
                Duration::from_secs(60),
            ))
            .await
            .unwrap();
        queue
            .submit(Submission::now(JobId::from("job_now"), JobPriority::Low))
            .await
            .unwrap();

        let claims = queue
            .claim(&consumer(), 2, Duration::from_millis(50), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].job_id.as_str(), "job_now");
    }

    #[tokio::test]
    async fn overflow_reports_queue_full() {
        let queue = LocalDispatch::new(2);
        for i in 0..2 {
            queue
                .submit(Submission::now(
                    JobId::from(format!("job_{i}").as_str()),
                    JobPriority::Medium,
                ))
                .await
                .unwrap();
        }
        let err = queue
            .submit(Submission::now(JobId::from("job_over"), JobPriority::Medium))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::QueueFull { depth: 2 }));
    }

    #[tokio::test]
    async fn nack_redelivers_after_delay() {
        let queue = LocalDispatch::new(8);
        queue
            .submit(Submission::now(JobId::from("job_x"), JobPriority::Medium))
            .await
            .unwrap();

        let claims = queue
            .claim(&consumer(), 1, Duration::from_millis(50), Duration::from_secs(60))
            .await
            .unwrap();
        queue.nack(&claims[0], Duration::from_millis(0)).await.unwrap();

        let again = queue
            .claim(&consumer(), 1, Duration::from_millis(200), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].job_id.as_str(), "job_x");

        // Ack with the fresh token settles it.
        queue.ack(&again[0]).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ack_with_stale_token_is_rejected() {
        let queue = LocalDispatch::new(8);
        queue
            .submit(Submission::now(JobId::from("job_x"), JobPriority::Medium))
            .await
            .unwrap();
        let claims = queue
            .claim(&consumer(), 1, Duration::from_millis(50), Duration::from_secs(60))
            .await
            .unwrap();

        let stale = Claimed {
            job_id: claims[0].job_id.clone(),
            token: ClaimToken::new(),
            backend: "local",
        };
        let err = queue.ack(&stale).await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownClaim(_)));
    }

    #[tokio::test]
    async fn claim_blocks_until_submission_arrives() {
        let queue = std::sync::Arc::new(LocalDispatch::new(8));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .claim(
                        &ConsumerId::new("w"),
                        1,
                        Duration::from_secs(5),
                        Duration::from_secs(60),
                    )
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue
            .submit(Submission::now(JobId::from("job_wake"), JobPriority::Low))
            .await
            .unwrap();

        let claims = waiter.await.unwrap();
        assert_eq!(claims[0].job_id.as_str(), "job_wake");
    }
}
