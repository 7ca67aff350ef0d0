use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use redub_core::{Config, QuotaDetail, UserId};
use redub_dispatch::DispatchBackend;
use redub_events::{EventHub, JobEvent};
use redub_store::{JobPriority, MetaStore, StoreError};

use crate::error::{EngineError, EngineResult};

/// Scheduler knobs, derived from the operator configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_global: usize,
    /// Per-phase concurrency caps; phases not listed share the global cap
    pub phase_caps: HashMap<String, usize>,
    /// Per-priority running caps
    pub priority_caps: HashMap<JobPriority, usize>,
    pub max_active_per_user: u64,
    pub daily_job_cap: u64,
    pub daily_processing_minutes: u64,
    pub backpressure_q_max: usize,
    pub disk_min_free_bytes: u64,
    pub output_dir: PathBuf,
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        // The heavyweight phases default to single-file; everything else
        // shares the global cap.
        let mut phase_caps = HashMap::new();
        phase_caps.insert("transcribe".to_string(), 1);
        phase_caps.insert("tts".to_string(), 1);

        let mut priority_caps = HashMap::new();
        priority_caps.insert(JobPriority::High, config.max_concurrent_global);
        priority_caps.insert(JobPriority::Medium, config.max_concurrent_global);
        priority_caps.insert(JobPriority::Low, config.max_concurrent_global.max(1));

        Self {
            max_concurrent_global: config.max_concurrent_global,
            phase_caps,
            priority_caps,
            max_active_per_user: config.max_concurrent_per_user,
            daily_job_cap: config.daily_job_cap,
            daily_processing_minutes: config.daily_processing_minutes,
            backpressure_q_max: config.backpressure_q_max,
            disk_min_free_bytes: config.disk_min_free_bytes,
            output_dir: config.output_dir.clone(),
        }
    }
}

/// What admission decided for one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionOutcome {
    /// Possibly degraded from the requested priority under backpressure
    pub priority: JobPriority,
    /// Set when a low-priority submission is delayed instead of degraded
    pub dispatch_after: Option<DateTime<Utc>>,
}

/// Introspection snapshot for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running_global: usize,
    pub running_by_priority: HashMap<String, usize>,
    pub degrade_active: bool,
    pub admitting: bool,
}

#[derive(Default)]
struct RunningCounts {
    global: usize,
    per_priority: HashMap<JobPriority, usize>,
    per_user: HashMap<UserId, usize>,
}

/// Admission control and concurrency caps.
///
/// The scheduler owns only transient structures: running counts, phase
/// semaphores, the degrade flag. Everything durable stays in the store.
pub struct Scheduler {
    config: SchedulerConfig,
    meta: Arc<MetaStore>,
    dispatch: Arc<dyn DispatchBackend>,
    hub: EventHub,
    running: Mutex<RunningCounts>,
    phase_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    degrade_active: AtomicBool,
    admitting: AtomicBool,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        meta: Arc<MetaStore>,
        dispatch: Arc<dyn DispatchBackend>,
        hub: EventHub,
    ) -> Self {
        Self {
            config,
            meta,
            dispatch,
            hub,
            running: Mutex::new(RunningCounts::default()),
            phase_semaphores: Mutex::new(HashMap::new()),
            degrade_active: AtomicBool::new(false),
            admitting: AtomicBool::new(true),
        }
    }

    /// Admission check at submission time: drain gate, disk guard, daily
    /// and concurrent quotas, then the backpressure policy. On success the
    /// daily submission counter has been consumed.
    pub async fn admit(
        &self,
        owner: &UserId,
        requested: JobPriority,
        estimated_minutes: u64,
    ) -> EngineResult<AdmissionOutcome> {
        if !self.admitting.load(Ordering::Acquire) {
            return Err(EngineError::Draining);
        }

        self.check_disk()?;

        let cfg = self.config.clone();
        let quota_result = self
            .meta
            .update_quota(owner, |q| {
                if q.concurrent_running >= cfg.max_active_per_user {
                    return Err("concurrent_jobs_limit".into());
                }
                if q.jobs_submitted_today >= cfg.daily_job_cap {
                    return Err("daily_job_cap".into());
                }
                if q.processing_minutes_today + estimated_minutes > cfg.daily_processing_minutes {
                    return Err("daily_processing_minutes".into());
                }
                q.jobs_submitted_today += 1;
                Ok(())
            })
            .await;

        if let Err(StoreError::Conflict(reason)) = &quota_result {
            let snapshot = self.meta.quota(owner).await?;
            let (limit, current) = match reason.as_str() {
                "concurrent_jobs_limit" => (cfg.max_active_per_user, snapshot.concurrent_running),
                "daily_job_cap" => (cfg.daily_job_cap, snapshot.jobs_submitted_today),
                _ => (
                    cfg.daily_processing_minutes,
                    snapshot.processing_minutes_today,
                ),
            };
            return Err(EngineError::Quota(QuotaDetail::new(
                "submit_job",
                reason.clone(),
                limit,
                current,
            )));
        }
        quota_result?;

        Ok(self.apply_backpressure(requested).await)
    }

    /// Degrade policy: above `backpressure_q_max` pending entries, High
    /// and Medium submissions drop one priority step; Low submissions are
    /// delayed with a jittered backoff instead.
    async fn apply_backpressure(&self, requested: JobPriority) -> AdmissionOutcome {
        let depth = self.dispatch.depth().await.unwrap_or(0);
        let saturated = depth > self.config.backpressure_q_max;

        let was_active = self.degrade_active.swap(saturated, Ordering::AcqRel);
        if was_active != saturated {
            info!(depth, saturated, "backpressure state changed");
            self.hub.publish_global(JobEvent::DegradeChanged {
                active: saturated,
                queue_depth: depth,
                at: Utc::now(),
            });
        }

        if !saturated {
            return AdmissionOutcome {
                priority: requested,
                dispatch_after: None,
            };
        }

        if requested == JobPriority::Low {
            // Delay rather than degrade: jittered exponential-ish backoff
            // scaled by how far past the threshold the queue is.
            let overshoot =
                (depth as f64 / self.config.backpressure_q_max.max(1) as f64).clamp(1.0, 8.0);
            let base_ms = 4_000.0 * overshoot;
            let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
            let delay_ms = (base_ms * jitter) as i64;
            AdmissionOutcome {
                priority: requested,
                dispatch_after: Some(Utc::now() + chrono::Duration::milliseconds(delay_ms)),
            }
        } else {
            AdmissionOutcome {
                priority: requested.degraded(),
                dispatch_after: None,
            }
        }
    }

    fn check_disk(&self) -> EngineResult<()> {
        if self.config.disk_min_free_bytes == 0 {
            return Ok(());
        }
        match fs2::available_space(&self.config.output_dir) {
            Ok(free) if free < self.config.disk_min_free_bytes => Err(EngineError::DiskLow {
                free_bytes: free,
                min_bytes: self.config.disk_min_free_bytes,
            }),
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(error = %err, "disk space probe failed");
                Ok(())
            }
        }
    }

    /// Claim-side admission: take a running slot if the global and
    /// per-priority caps allow. Low-disk also refuses here, so a queue
    /// drained after the submit-side check cannot start work on a full
    /// disk.
    pub fn try_begin(&self, owner: &UserId, priority: JobPriority) -> bool {
        if self.check_disk().is_err() {
            return false;
        }
        let mut counts = self.running.lock();
        if counts.global >= self.config.max_concurrent_global {
            return false;
        }
        let priority_cap = self
            .config
            .priority_caps
            .get(&priority)
            .copied()
            .unwrap_or(self.config.max_concurrent_global);
        if counts.per_priority.get(&priority).copied().unwrap_or(0) >= priority_cap {
            return false;
        }
        if counts.per_user.get(owner).copied().unwrap_or(0) as u64
            >= self.config.max_active_per_user
        {
            return false;
        }

        counts.global += 1;
        *counts.per_priority.entry(priority).or_insert(0) += 1;
        *counts.per_user.entry(owner.clone()).or_insert(0) += 1;
        true
    }

    /// Release the slot taken by `try_begin`.
    pub fn end(&self, owner: &UserId, priority: JobPriority) {
        let mut counts = self.running.lock();
        counts.global = counts.global.saturating_sub(1);
        if let Some(n) = counts.per_priority.get_mut(&priority) {
            *n = n.saturating_sub(1);
        }
        if let Some(n) = counts.per_user.get_mut(owner) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                counts.per_user.remove(owner);
            }
        }
    }

    /// Semaphore guarding a stage phase. Unlisted phases share the global
    /// cap.
    pub fn phase_semaphore(&self, phase: &str) -> Arc<Semaphore> {
        let mut semaphores = self.phase_semaphores.lock();
        semaphores
            .entry(phase.to_string())
            .or_insert_with(|| {
                let cap = self
                    .config
                    .phase_caps
                    .get(phase)
                    .copied()
                    .unwrap_or(self.config.max_concurrent_global);
                Arc::new(Semaphore::new(cap.max(1)))
            })
            .clone()
    }

    /// Stop admitting new submissions (drain).
    pub fn stop_admitting(&self) {
        self.admitting.store(false, Ordering::Release);
        info!("scheduler stopped admitting");
    }

    pub fn is_admitting(&self) -> bool {
        self.admitting.load(Ordering::Acquire)
    }

    pub fn status(&self) -> SchedulerStatus {
        let counts = self.running.lock();
        SchedulerStatus {
            running_global: counts.global,
            running_by_priority: counts
                .per_priority
                .iter()
                .map(|(p, n)| (p.name().to_string(), *n))
                .collect(),
            degrade_active: self.degrade_active.load(Ordering::Acquire),
            admitting: self.admitting.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redub_dispatch::{AutoDispatch, AutoPolicy};
    use redub_core::QueueBackendKind;

    async fn fixture(max_per_user: u64, q_max: usize) -> (tempfile::TempDir, Arc<Scheduler>) {
        std::env::set_var("REDUB_ALLOW_UNSAFE_STATE_DIR", "1");
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::dev_defaults(dir.path());
        config.max_concurrent_per_user = max_per_user;
        config.backpressure_q_max = q_max;

        let meta = Arc::new(
            MetaStore::open(&config.state_dir, &config.log_dir)
                .await
                .unwrap(),
        );
        let hub = EventHub::default();
        let dispatch = Arc::new(
            AutoDispatch::new(
                QueueBackendKind::Local,
                None,
                1024,
                AutoPolicy::default(),
                hub.clone(),
                meta.clone(),
            )
            .await,
        );
        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig::from_config(&config),
            meta,
            dispatch,
            hub,
        ));
        (dir, scheduler)
    }

    #[tokio::test]
    async fn concurrent_cap_rejects_with_structured_detail() {
        let (_dir, scheduler) = fixture(1, 1000).await;
        let user = UserId::new();

        scheduler.admit(&user, JobPriority::Medium, 10).await.unwrap();
        // Simulate the first job running.
        scheduler
            .meta
            .update_quota(&user, |q| {
                q.concurrent_running = 1;
                Ok(())
            })
            .await
            .unwrap();

        let err = scheduler
            .admit(&user, JobPriority::Medium, 10)
            .await
            .unwrap_err();
        match err {
            EngineError::Quota(detail) => {
                assert_eq!(detail.reason, "concurrent_jobs_limit");
                assert_eq!(detail.limit, 1);
                assert_eq!(detail.current, 1);
            }
            other => panic!("expected quota error, got {other}"),
        }
    }

    #[tokio::test]
    async fn daily_cap_is_consumed_by_admission() {
        let (_dir, scheduler) = fixture(10, 1000).await;
        let user = UserId::new();

        for _ in 0..24 {
            scheduler.admit(&user, JobPriority::Low, 0).await.unwrap();
        }
        let err = scheduler.admit(&user, JobPriority::Low, 0).await.unwrap_err();
        assert!(matches!(err, EngineError::Quota(d) if d.reason == "daily_job_cap"));
    }

    #[tokio::test]
    async fn backpressure_degrades_high_and_delays_low() {
        let (_dir, scheduler) = fixture(100, 0).await;
        let user = UserId::new();

        // Queue depth 1 > q_max 0: saturated.
        scheduler
            .dispatch
            .submit(redub_dispatch::Submission::now(
                redub_core::JobId::new(),
                JobPriority::Medium,
            ))
            .await
            .unwrap();

        let outcome = scheduler.admit(&user, JobPriority::High, 0).await.unwrap();
        assert_eq!(outcome.priority, JobPriority::Medium);
        assert!(outcome.dispatch_after.is_none());

        let outcome = scheduler.admit(&user, JobPriority::Low, 0).await.unwrap();
        assert_eq!(outcome.priority, JobPriority::Low);
        assert!(outcome.dispatch_after.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn draining_refuses_admission() {
        let (_dir, scheduler) = fixture(10, 1000).await;
        scheduler.stop_admitting();
        let err = scheduler
            .admit(&UserId::new(), JobPriority::Medium, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Draining));
    }

    #[tokio::test]
    async fn running_slots_respect_global_cap() {
        let (_dir, scheduler) = fixture(10, 1000).await;
        let a = UserId::new();
        let b = UserId::new();

        // dev default global cap is 2
        assert!(scheduler.try_begin(&a, JobPriority::Medium));
        assert!(scheduler.try_begin(&b, JobPriority::Medium));
        assert!(!scheduler.try_begin(&b, JobPriority::High));

        scheduler.end(&a, JobPriority::Medium);
        assert!(scheduler.try_begin(&b, JobPriority::High));
    }
}
