use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use redub_core::{ConsumerId, QueueBackendKind, RequestId};
use redub_events::{EventHub, JobEvent};
use redub_store::{AuditEvent, AuditOutcome, MetaStore};

use crate::error::DispatchResult;
use crate::local::LocalDispatch;
use crate::redis_backend::RedisDispatch;
use crate::{Claimed, DispatchBackend, Health, Submission};

/// Which implementation is currently receiving new submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Redis,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Redis => "redis",
        }
    }
}

/// Selection policy knobs.
#[derive(Debug, Clone)]
pub struct AutoPolicy {
    /// Successful probes required at boot before Redis is selected
    pub boot_probes: u32,
    /// Consecutive probe failures before degrading to Local
    pub fail_threshold: u32,
    /// Consecutive probe successes required for recovery
    pub recover_threshold: u32,
    /// Minimum time the successes must span before switching back
    pub recover_window: Duration,
    /// Probe cadence
    pub probe_interval: Duration,
}

impl Default for AutoPolicy {
    fn default() -> Self {
        Self {
            boot_probes: 2,
            fail_threshold: 3,
            recover_threshold: 5,
            recover_window: Duration::from_secs(30),
            probe_interval: Duration::from_secs(5),
        }
    }
}

/// Introspection snapshot for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct AutoStatus {
    pub active: BackendKind,
    pub redis_configured: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub local_depth: usize,
    pub redis_depth: Option<usize>,
}

struct SelectionState {
    active: BackendKind,
    consecutive_failures: u32,
    consecutive_successes: u32,
    recovery_started_at: Option<Instant>,
}

/// Health-driven backend selection with hysteresis.
///
/// Boot: Redis is selected only after `boot_probes` consecutive healthy
/// probes; otherwise Local. Mid-run: `fail_threshold` consecutive failures
/// degrade new submissions to Local while in-flight Redis claims finish.
/// Recovery needs `recover_threshold` successes spanning at least
/// `recover_window` before new submissions return to Redis.
pub struct AutoDispatch {
    local: Arc<LocalDispatch>,
    redis: Option<Arc<RedisDispatch>>,
    state: RwLock<SelectionState>,
    policy: AutoPolicy,
    hub: EventHub,
    meta: Arc<MetaStore>,
}

impl AutoDispatch {
    /// Build the dispatch plane according to `QUEUE_BACKEND` and probe
    /// results. Never fails boot: an unreachable Redis just means Local.
    pub async fn new(
        kind: QueueBackendKind,
        redis_url: Option<&str>,
        local_depth: usize,
        policy: AutoPolicy,
        hub: EventHub,
        meta: Arc<MetaStore>,
    ) -> Self {
        let local = Arc::new(LocalDispatch::new(local_depth));

        let redis = match (kind, redis_url) {
            (QueueBackendKind::Local, _) | (_, None) => None,
            (_, Some(url)) => match RedisDispatch::connect(url).await {
                Ok(backend) => Some(Arc::new(backend)),
                Err(err) => {
                    warn!(error = %err, "redis dispatch unavailable at boot, using local");
                    None
                }
            },
        };

        let mut active = BackendKind::Local;
        if let Some(redis_backend) = &redis {
            let required = match kind {
                QueueBackendKind::Redis => 1,
                _ => policy.boot_probes.max(1),
            };
            let mut healthy = 0;
            for _ in 0..required {
                if redis_backend.health().await == Health::Ok {
                    healthy += 1;
                } else {
                    break;
                }
            }
            if healthy == required {
                active = BackendKind::Redis;
            }
        }

        info!(backend = active.name(), "dispatch backend selected");

        Self {
            local,
            redis,
            state: RwLock::new(SelectionState {
                active,
                consecutive_failures: 0,
                consecutive_successes: 0,
                recovery_started_at: None,
            }),
            policy,
            hub,
            meta,
        }
    }

    pub fn active(&self) -> BackendKind {
        self.state.read().active
    }

    /// Route a submission and report which backend accepted it (the
    /// outbox flusher records this). A Redis failure falls through to
    /// Local transparently.
    pub async fn route(&self, submission: Submission) -> DispatchResult<BackendKind> {
        if self.active() == BackendKind::Redis {
            if let Some(redis) = &self.redis {
                match redis.submit(submission.clone()).await {
                    Ok(()) => return Ok(BackendKind::Redis),
                    Err(err) => {
                        warn!(error = %err, "redis submit failed, falling back to local");
                        self.note_probe(false).await;
                    }
                }
            }
        }
        self.local.submit(submission).await?;
        Ok(BackendKind::Local)
    }

    /// One probe cycle; called by the supervised probe task.
    pub async fn probe_once(&self) {
        let Some(redis) = &self.redis else { return };
        let healthy = redis.health().await == Health::Ok;
        self.note_probe(healthy).await;
    }

    /// Runs until `shutdown` flips. Spawned by the lifecycle manager.
    pub async fn probe_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        if self.redis.is_none() {
            return;
        }
        let mut ticker = tokio::time::interval(self.policy.probe_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_once().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn note_probe(&self, healthy: bool) {
        let transition = {
            let mut state = self.state.write();
            if healthy {
                state.consecutive_failures = 0;
                match state.active {
                    BackendKind::Redis => None,
                    BackendKind::Local => {
                        if state.recovery_started_at.is_none() {
                            state.recovery_started_at = Some(Instant::now());
                            state.consecutive_successes = 0;
                        }
                        state.consecutive_successes += 1;
                        let spanned = state
                            .recovery_started_at
                            .map(|t| t.elapsed() >= self.policy.recover_window)
                            .unwrap_or(false);
                        if state.consecutive_successes >= self.policy.recover_threshold && spanned
                        {
                            state.active = BackendKind::Redis;
                            state.recovery_started_at = None;
                            state.consecutive_successes = 0;
                            Some(BackendKind::Redis)
                        } else {
                            None
                        }
                    }
                }
            } else {
                state.consecutive_successes = 0;
                state.recovery_started_at = None;
                state.consecutive_failures += 1;
                if state.active == BackendKind::Redis
                    && state.consecutive_failures >= self.policy.fail_threshold
                {
                    state.active = BackendKind::Local;
                    Some(BackendKind::Local)
                } else {
                    None
                }
            }
        };

        if let Some(now_active) = transition {
            self.announce_transition(now_active).await;
        }
    }

    async fn announce_transition(&self, now_active: BackendKind) {
        let healthy = now_active == BackendKind::Redis;
        info!(backend = now_active.name(), "dispatch backend switched");

        self.hub.publish_global(JobEvent::DispatchChanged {
            backend: now_active.name().to_string(),
            healthy,
            at: Utc::now(),
        });

        let event = AuditEvent::new(
            RequestId::new(),
            None,
            "dispatch.switch",
            format!("backend:{}", now_active.name()),
            AuditOutcome::Allowed,
            &format!("active={}", now_active.name()),
        );
        if let Err(err) = self.meta.record_audit(event).await {
            warn!(error = %err, "failed to audit dispatch transition");
        }
    }

    pub async fn status(&self) -> AutoStatus {
        let (active, failures, successes) = {
            let state = self.state.read();
            (
                state.active,
                state.consecutive_failures,
                state.consecutive_successes,
            )
        };
        let redis_depth = match &self.redis {
            Some(redis) => redis.depth().await.ok(),
            None => None,
        };
        AutoStatus {
            active,
            redis_configured: self.redis.is_some(),
            consecutive_failures: failures,
            consecutive_successes: successes,
            local_depth: self.local.depth().await.unwrap_or(0),
            redis_depth,
        }
    }
}

#[async_trait]
impl DispatchBackend for AutoDispatch {
    async fn submit(&self, submission: Submission) -> DispatchResult<()> {
        self.route(submission).await.map(|_| ())
    }

    /// Local entries are always claimable (they accumulate during
    /// degrade); Redis is consulted only while selected.
    async fn claim(
        &self,
        consumer: &ConsumerId,
        n: usize,
        wait: Duration,
        visibility_ttl: Duration,
    ) -> DispatchResult<Vec<Claimed>> {
        let mut claims = self
            .local
            .claim(consumer, n, Duration::from_millis(0), visibility_ttl)
            .await?;

        if claims.len() < n && self.active() == BackendKind::Redis {
            if let Some(redis) = &self.redis {
                match redis
                    .claim(consumer, n - claims.len(), wait, visibility_ttl)
                    .await
                {
                    Ok(more) => claims.extend(more),
                    Err(err) => {
                        warn!(error = %err, "redis claim failed");
                        self.note_probe(false).await;
                    }
                }
            }
        } else if claims.is_empty() {
            claims = self.local.claim(consumer, n, wait, visibility_ttl).await?;
        }

        Ok(claims)
    }

    async fn ack(&self, claim: &Claimed) -> DispatchResult<()> {
        match (claim.backend, &self.redis) {
            ("redis", Some(redis)) => redis.ack(claim).await,
            _ => self.local.ack(claim).await,
        }
    }

    async fn nack(&self, claim: &Claimed, delay: Duration) -> DispatchResult<()> {
        match (claim.backend, &self.redis) {
            ("redis", Some(redis)) => redis.nack(claim, delay).await,
            _ => self.local.nack(claim, delay).await,
        }
    }

    async fn health(&self) -> Health {
        match self.active() {
            BackendKind::Local => self.local.health().await,
            BackendKind::Redis => match &self.redis {
                Some(redis) => redis.health().await,
                None => Health::Degraded,
            },
        }
    }

    async fn depth(&self) -> DispatchResult<usize> {
        let mut depth = self.local.depth().await?;
        if let Some(redis) = &self.redis {
            depth += redis.depth().await.unwrap_or(0);
        }
        Ok(depth)
    }

    fn name(&self) -> &'static str {
        "auto"
    }

    async fn close(&self) {
        self.local.close().await;
        if let Some(redis) = &self.redis {
            redis.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redub_core::JobId;
    use redub_store::JobPriority;

    async fn fixture() -> (tempfile::TempDir, Arc<AutoDispatch>) {
        std::env::set_var("REDUB_ALLOW_UNSAFE_STATE_DIR", "1");
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(
            MetaStore::open(&dir.path().join("state"), &dir.path().join("logs"))
                .await
                .unwrap(),
        );
        let auto = Arc::new(
            AutoDispatch::new(
                QueueBackendKind::Auto,
                None,
                64,
                AutoPolicy::default(),
                EventHub::default(),
                meta,
            )
            .await,
        );
        (dir, auto)
    }

    #[tokio::test]
    async fn without_redis_local_is_selected_and_serves() {
        let (_dir, auto) = fixture().await;
        assert_eq!(auto.active(), BackendKind::Local);

        let routed = auto
            .route(Submission::now(JobId::from("job_1"), JobPriority::Medium))
            .await
            .unwrap();
        assert_eq!(routed, BackendKind::Local);

        let claims = auto
            .claim(
                &ConsumerId::new("w"),
                1,
                Duration::from_millis(50),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert_eq!(claims.len(), 1);
        auto.ack(&claims[0]).await.unwrap();
    }

    #[tokio::test]
    async fn probe_accounting_without_redis_is_inert() {
        let (_dir, auto) = fixture().await;
        auto.probe_once().await;
        let status = auto.status().await;
        assert!(!status.redis_configured);
        assert_eq!(status.active, BackendKind::Local);
    }
}
