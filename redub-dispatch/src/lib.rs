//! redub-dispatch: where job IDs come from next.
//!
//! A dispatch backend is a small capability set: submit, claim, ack, nack,
//! health. Two implementations exist - an in-process priority queue and a
//! Redis-streams consumer group - plus an `Auto` wrapper that selects
//! between them based on health probes with hysteresis.
//!
//! Backends move job IDs, nothing more. At-most-once execution is not
//! their job: every claimed ID still has to win the dispatch lease in the
//! metadata store before a worker may run it.

pub mod auto;
pub mod error;
pub mod flusher;
pub mod local;
pub mod redis_backend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use redub_core::{ClaimToken, ConsumerId, JobId};
use redub_store::JobPriority;

pub use auto::{AutoDispatch, AutoPolicy, AutoStatus, BackendKind};
pub use error::{DispatchError, DispatchResult};
pub use flusher::OutboxFlusher;
pub use local::LocalDispatch;
pub use redis_backend::RedisDispatch;

/// A submission: which job, how urgent, and from when it is eligible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job_id: JobId,
    pub priority: JobPriority,
    /// Earliest eligible claim time; delayed submissions sort behind
    /// currently-eligible work
    pub available_at: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
}

impl Submission {
    pub fn now(job_id: JobId, priority: JobPriority) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            priority,
            available_at: now,
            submitted_at: now,
        }
    }

    pub fn delayed(job_id: JobId, priority: JobPriority, delay: Duration) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            priority,
            available_at: now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
            submitted_at: now,
        }
    }
}

/// A claimed job ID with the token needed to ack or nack it. The backend
/// tag routes the settlement back to whichever implementation issued the
/// claim (the `Auto` wrapper hands out claims from both).
#[derive(Debug, Clone)]
pub struct Claimed {
    pub job_id: JobId,
    pub token: ClaimToken,
    pub backend: &'static str,
}

/// Backend health as seen by the most recent probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Ok,
    Degraded,
}

/// Capability set every backend provides.
#[async_trait]
pub trait DispatchBackend: Send + Sync {
    /// Non-blocking enqueue. Overflow surfaces as `QueueFull` so the
    /// scheduler can apply its backpressure policy.
    async fn submit(&self, submission: Submission) -> DispatchResult<()>;

    /// Claim up to `n` eligible jobs, waiting at most `wait`. Unacked
    /// claims become reclaimable after `visibility_ttl`.
    async fn claim(
        &self,
        consumer: &ConsumerId,
        n: usize,
        wait: Duration,
        visibility_ttl: Duration,
    ) -> DispatchResult<Vec<Claimed>>;

    /// Acknowledge a finished claim.
    async fn ack(&self, claim: &Claimed) -> DispatchResult<()>;

    /// Return a claim for redelivery after `delay`.
    async fn nack(&self, claim: &Claimed, delay: Duration) -> DispatchResult<()>;

    /// Probe backend health.
    async fn health(&self) -> Health;

    /// Pending entries (queue introspection).
    async fn depth(&self) -> DispatchResult<usize>;

    fn name(&self) -> &'static str;

    /// Release resources; subsequent calls may fail.
    async fn close(&self);
}
