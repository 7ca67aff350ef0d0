use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use redub_core::{redact, Config, ConsumerId, JobId};
use redub_dispatch::{Claimed, DispatchBackend, DispatchError};
use redub_events::{EventHub, JobEvent};
use redub_store::{
    JobRecord, JobState, LeaseOutcome, MetaStore, StoreError, UploadState,
};

use crate::cancel::CancelRegistry;
use crate::checkpoint::{checkpoint_for, checkpoint_valid, write_checkpoint_mirror};
use crate::error::{EngineError, EngineResult};
use crate::layout::OutputLayout;
use crate::scheduler::Scheduler;
use crate::stage::{marker_invalidates, Pipeline, StageContext, StageError, StageInput};

/// Worker pool knobs, derived from the operator configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    pub lease_ttl: Duration,
    pub claim_wait: Duration,
    pub visibility_ttl: Duration,
    pub stage_timeout: Duration,
    pub max_stage_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_active_per_user: u64,
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.max_concurrent_global.max(1),
            lease_ttl: config.lease_ttl,
            claim_wait: Duration::from_secs(1),
            visibility_ttl: config.redis_visibility_timeout,
            stage_timeout: config.stage_timeout,
            max_stage_attempts: config.max_stage_attempts.max(1),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_active_per_user: config.max_concurrent_per_user,
        }
    }
}

/// Why a pipeline run ended before completion.
enum PipelineEnd {
    Cancelled,
    Fatal(String),
    /// Drain requested; checkpoint persisted, job requeued by recovery
    Interrupted,
}

/// Long-lived workers executing the stage pipeline per claimed job.
pub struct WorkerPool {
    config: WorkerConfig,
    meta: Arc<MetaStore>,
    dispatch: Arc<dyn DispatchBackend>,
    scheduler: Arc<Scheduler>,
    hub: EventHub,
    cancels: Arc<CancelRegistry>,
    pipeline: Pipeline,
    layout: OutputLayout,
    uploads_dir: PathBuf,
    consumer: ConsumerId,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WorkerConfig,
        meta: Arc<MetaStore>,
        dispatch: Arc<dyn DispatchBackend>,
        scheduler: Arc<Scheduler>,
        hub: EventHub,
        cancels: Arc<CancelRegistry>,
        pipeline: Pipeline,
        layout: OutputLayout,
        uploads_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            meta,
            dispatch,
            scheduler,
            hub,
            cancels,
            pipeline,
            layout,
            uploads_dir,
            consumer: ConsumerId::new("redub-worker"),
        })
    }

    pub fn consumer(&self) -> &ConsumerId {
        &self.consumer
    }

    /// Spawn the worker tasks. They stop claiming when `shutdown` flips
    /// and finish their current stage before exiting.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|idx| {
                let pool = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.worker_loop(idx, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, idx: usize, shutdown: watch::Receiver<bool>) {
        info!(worker = idx, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self
                .dispatch
                .claim(
                    &self.consumer,
                    1,
                    self.config.claim_wait,
                    self.config.visibility_ttl,
                )
                .await
            {
                Ok(claims) => {
                    for claim in claims {
                        if *shutdown.borrow() {
                            // Return unstarted work promptly during drain.
                            let _ = self.dispatch.nack(&claim, Duration::from_secs(1)).await;
                            continue;
                        }
                        self.process(claim, &shutdown).await;
                    }
                }
                Err(DispatchError::Closed) => break,
                Err(err) => {
                    warn!(worker = idx, error = %err, "claim failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!(worker = idx, "worker stopped");
    }

    async fn process(&self, claim: Claimed, shutdown: &watch::Receiver<bool>) {
        let job_id = claim.job_id.clone();

        // The lease is what makes execution at-most-once; losing the race
        // is routine, not an error.
        match self
            .meta
            .acquire_lease(&job_id, &self.consumer, self.config.lease_ttl)
            .await
        {
            Ok(LeaseOutcome::Acquired { .. }) => {}
            Ok(LeaseOutcome::HeldByOther { consumer }) => {
                debug!(job = %job_id, holder = %consumer, "lease held elsewhere, skipping");
                let _ = self.dispatch.ack(&claim).await;
                return;
            }
            Err(err) => {
                warn!(job = %job_id, error = %err, "lease acquisition failed");
                let _ = self.dispatch.nack(&claim, Duration::from_secs(2)).await;
                return;
            }
        }

        let job = match self.meta.get_job(&job_id).await {
            Ok(job) => job,
            Err(err) => {
                warn!(job = %job_id, error = %err, "claimed job not loadable");
                let _ = self.meta.release_lease(&job_id, &self.consumer).await;
                let _ = self.dispatch.ack(&claim).await;
                return;
            }
        };

        if job.state != JobState::Queued {
            debug!(job = %job_id, state = %job.state, "claim for non-queued job, skipping");
            let _ = self.meta.release_lease(&job_id, &self.consumer).await;
            let _ = self.dispatch.ack(&claim).await;
            return;
        }

        // Cancellation that landed while the job sat in the queue.
        if job.cancel_requested {
            let settled = self
                .meta
                .update_job(&job_id, Some(JobState::Queued), |j| {
                    j.transition(JobState::Canceled)?;
                    j.message = "canceled before start".into();
                    Ok(())
                })
                .await;
            if let Ok(job) = settled {
                self.publish_state(&job);
            }
            let _ = self.meta.release_lease(&job_id, &self.consumer).await;
            let _ = self.dispatch.ack(&claim).await;
            return;
        }

        if !self.scheduler.try_begin(&job.owner_id, job.priority) {
            let _ = self.meta.release_lease(&job_id, &self.consumer).await;
            let jitter = rand::thread_rng().gen_range(1_000..4_000);
            let _ = self
                .dispatch
                .nack(&claim, Duration::from_millis(jitter))
                .await;
            return;
        }

        // Authoritative per-user concurrency: the counter increment under
        // the writer lock is what the quota property holds against.
        let cap = self.config.max_active_per_user;
        let admitted = self
            .meta
            .update_quota(&job.owner_id, |q| {
                if q.concurrent_running >= cap {
                    return Err("concurrent_jobs_limit".into());
                }
                q.concurrent_running += 1;
                Ok(())
            })
            .await;
        if admitted.is_err() {
            self.scheduler.end(&job.owner_id, job.priority);
            let _ = self.meta.release_lease(&job_id, &self.consumer).await;
            let _ = self.dispatch.nack(&claim, Duration::from_secs(5)).await;
            return;
        }

        let job = match self
            .meta
            .update_job(&job_id, Some(JobState::Queued), |j| {
                j.transition(JobState::Running)?;
                j.message = "running".into();
                Ok(())
            })
            .await
        {
            Ok(job) => job,
            Err(err) => {
                debug!(job = %job_id, error = %err, "queued->running race lost");
                self.rollback_slot(&job).await;
                let _ = self.meta.release_lease(&job_id, &self.consumer).await;
                let _ = self.dispatch.ack(&claim).await;
                return;
            }
        };
        self.publish_state(&job);

        let started = Instant::now();
        let outcome = self.run_pipeline(&job, shutdown).await;
        let minutes = (started.elapsed().as_secs() + 59) / 60;

        match outcome {
            Ok(()) => {
                let settled = self
                    .meta
                    .update_job(&job_id, Some(JobState::Running), |j| {
                        j.transition(JobState::Done)?;
                        j.progress = 1.0;
                        j.message = "complete".into();
                        j.rerun_marker = None;
                        j.cancel_requested = false;
                        Ok(())
                    })
                    .await;
                if let Ok(done) = settled {
                    if let Some(key) = &done.library_key {
                        if let Err(err) = self.meta.upsert_library_entry(key, &job_id).await {
                            warn!(job = %job_id, error = %err, "library index update failed");
                        }
                    }
                    self.publish_state(&done);
                    info!(job = %job_id, "job complete");
                }
                let _ = self.dispatch.ack(&claim).await;
            }
            Err(PipelineEnd::Cancelled) => {
                let settled = self
                    .meta
                    .update_job(&job_id, Some(JobState::Running), |j| {
                        j.transition(JobState::Canceled)?;
                        j.message = "canceled".into();
                        Ok(())
                    })
                    .await;
                if let Ok(job) = settled {
                    self.publish_state(&job);
                }
                info!(job = %job_id, "job canceled");
                let _ = self.dispatch.ack(&claim).await;
            }
            Err(PipelineEnd::Fatal(message)) => {
                let redacted = redact(&message);
                let settled = self
                    .meta
                    .update_job(&job_id, Some(JobState::Running), |j| {
                        j.transition(JobState::Failed)?;
                        j.message = "failed".into();
                        j.last_error = Some(redacted.clone());
                        Ok(())
                    })
                    .await;
                if let Ok(job) = settled {
                    self.publish_state(&job);
                }
                error!(job = %job_id, error = %redacted, "job failed");
                let _ = self.dispatch.ack(&claim).await;
            }
            Err(PipelineEnd::Interrupted) => {
                // Drain: checkpoints are already persisted; hand the job
                // back to the queue for the next boot or instance.
                let settled = self
                    .meta
                    .update_job(&job_id, Some(JobState::Running), |j| {
                        j.transition(JobState::Queued)?;
                        j.message = "interrupted, awaiting resume".into();
                        Ok(())
                    })
                    .await;
                if settled.is_ok() {
                    let _ = self.meta.reopen_outbox(&job_id).await;
                }
                info!(job = %job_id, "job interrupted by drain");
                let _ = self.dispatch.ack(&claim).await;
            }
        }

        let owner = job.owner_id.clone();
        let _ = self
            .meta
            .update_quota(&owner, |q| {
                q.concurrent_running = q.concurrent_running.saturating_sub(1);
                q.processing_minutes_today += minutes;
                Ok(())
            })
            .await;
        self.scheduler.end(&owner, job.priority);
        let _ = self.meta.release_lease(&job_id, &self.consumer).await;
        self.cancels.clear(&job_id);
    }

    async fn rollback_slot(&self, job: &JobRecord) {
        let _ = self
            .meta
            .update_quota(&job.owner_id, |q| {
                q.concurrent_running = q.concurrent_running.saturating_sub(1);
                Ok(())
            })
            .await;
        self.scheduler.end(&job.owner_id, job.priority);
    }

    async fn run_pipeline(
        &self,
        job: &JobRecord,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), PipelineEnd> {
        let input_path = self.resolve_input(job).await?;
        let work_dir = self
            .layout
            .prepare(job, &input_path)
            .await
            .map_err(|e| PipelineEnd::Fatal(format!("workspace setup failed: {e}")))?;

        let cancel_rx = self.cancels.watch(&job.id);
        let total = self.pipeline.len().max(1);
        let mut prior_artifacts: BTreeMap<String, PathBuf> = BTreeMap::new();

        for (idx, stage) in self.pipeline.stages().iter().enumerate() {
            // Stage-boundary checks: durable cancel flag, in-memory
            // signal, drain.
            let current = self
                .meta
                .get_job(&job.id)
                .await
                .map_err(|e| PipelineEnd::Fatal(format!("job reload failed: {e}")))?;
            if current.cancel_requested || *cancel_rx.borrow() {
                return Err(PipelineEnd::Cancelled);
            }
            if *shutdown.borrow() {
                return Err(PipelineEnd::Interrupted);
            }

            let marker_hit = current
                .rerun_marker
                .as_deref()
                .map(|m| marker_invalidates(m, stage.name()))
                .unwrap_or(false);

            if !marker_hit {
                if let Some(entry) = current.checkpoint.get(stage.name()) {
                    let paths: BTreeMap<String, PathBuf> = entry
                        .artifact_hashes
                        .keys()
                        .map(|name| (name.clone(), work_dir.join(name)))
                        .collect();
                    if checkpoint_valid(entry, &work_dir, &paths).await {
                        debug!(job = %job.id, stage = stage.name(), "checkpoint hit, skipping");
                        prior_artifacts.extend(paths);
                        self.hub.publish_job(
                            &job.id,
                            JobEvent::StageCompleted {
                                job_id: job.id.clone(),
                                stage: stage.name().to_string(),
                                at: Utc::now(),
                            },
                        );
                        continue;
                    }
                }
            }

            let semaphore = self.scheduler.phase_semaphore(stage.phase());
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| PipelineEnd::Fatal("phase semaphore closed".into()))?;

            self.hub.publish_job(
                &job.id,
                JobEvent::StageStarted {
                    job_id: job.id.clone(),
                    stage: stage.name().to_string(),
                    at: Utc::now(),
                },
            );
            self.log_line(&job.id, &work_dir, &format!("stage {} started", stage.name()))
                .await;

            let mut attempt = 0u32;
            let output = loop {
                attempt += 1;

                let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<(f64, String)>();
                let forwarder = {
                    let hub = self.hub.clone();
                    let job_id = job.id.clone();
                    let stage_name = stage.name().to_string();
                    let base = idx as f64;
                    let total = total as f64;
                    tokio::spawn(async move {
                        while let Some((fraction, message)) = progress_rx.recv().await {
                            hub.publish_job(
                                &job_id,
                                JobEvent::Progress {
                                    job_id: job_id.clone(),
                                    stage: stage_name.clone(),
                                    progress: ((base + fraction) / total).clamp(0.0, 1.0),
                                    message,
                                    at: Utc::now(),
                                },
                            );
                        }
                    })
                };

                let ctx = StageContext {
                    cancel: cancel_rx.clone(),
                    progress: progress_tx,
                };
                let input = StageInput {
                    job_id: job.id.clone(),
                    input_path: input_path.clone(),
                    work_dir: work_dir.clone(),
                    runtime: job.runtime.clone(),
                    prior_artifacts: prior_artifacts.clone(),
                };

                let result =
                    tokio::time::timeout(self.config.stage_timeout, stage.run(ctx, input)).await;
                forwarder.abort();

                match result {
                    Ok(Ok(output)) => break output,
                    Ok(Err(StageError::Cancelled)) => return Err(PipelineEnd::Cancelled),
                    Ok(Err(StageError::Fatal(message))) => {
                        return Err(PipelineEnd::Fatal(format!(
                            "stage {}: {message}",
                            stage.name()
                        )))
                    }
                    Ok(Err(StageError::Transient(message))) => {
                        if attempt >= self.config.max_stage_attempts {
                            return Err(PipelineEnd::Fatal(format!(
                                "stage {}: transient retries exhausted: {message}",
                                stage.name()
                            )));
                        }
                        let backoff = self.backoff_for(attempt);
                        warn!(
                            job = %job.id,
                            stage = stage.name(),
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            "transient stage failure, retrying"
                        );
                        self.log_line(
                            &job.id,
                            &work_dir,
                            &format!(
                                "stage {} attempt {attempt} failed (transient), retrying",
                                stage.name()
                            ),
                        )
                        .await;
                        let _ = self
                            .meta
                            .extend_lease(&job.id, &self.consumer, self.config.lease_ttl)
                            .await;
                        tokio::time::sleep(backoff).await;
                    }
                    Err(_elapsed) => {
                        error!(
                            job = %job.id,
                            stage = stage.name(),
                            timeout_s = self.config.stage_timeout.as_secs(),
                            "stage exceeded watchdog timeout"
                        );
                        return Err(PipelineEnd::Fatal(format!(
                            "stage {} exceeded its {}s watchdog",
                            stage.name(),
                            self.config.stage_timeout.as_secs()
                        )));
                    }
                }
            };

            // Checkpoint and progress persist atomically in one job write.
            let entry = checkpoint_for(&output)
                .await
                .map_err(|e| PipelineEnd::Fatal(format!("checkpoint hashing failed: {e}")))?;
            let overall = (idx + 1) as f64 / total as f64;
            let stage_name = stage.name().to_string();
            let message = output.message.clone();
            let updated = self
                .meta
                .update_job(&job.id, Some(JobState::Running), move |j| {
                    j.checkpoint.insert(stage_name.clone(), entry.clone());
                    j.last_stage = Some(stage_name.clone());
                    j.advance_progress(overall, message.clone());
                    Ok(())
                })
                .await
                .map_err(|e| PipelineEnd::Fatal(format!("checkpoint persist failed: {e}")))?;

            write_checkpoint_mirror(&updated, &work_dir).await.ok();
            prior_artifacts.extend(output.artifacts.clone());

            self.hub.publish_job(
                &job.id,
                JobEvent::StageCompleted {
                    job_id: job.id.clone(),
                    stage: stage.name().to_string(),
                    at: Utc::now(),
                },
            );
            self.hub.publish_job(
                &job.id,
                JobEvent::Progress {
                    job_id: job.id.clone(),
                    stage: stage.name().to_string(),
                    progress: overall,
                    message: output.message.clone(),
                    at: Utc::now(),
                },
            );
            self.log_line(
                &job.id,
                &work_dir,
                &format!("stage {} complete", stage.name()),
            )
            .await;
        }

        Ok(())
    }

    async fn resolve_input(&self, job: &JobRecord) -> Result<PathBuf, PipelineEnd> {
        match &job.input_ref {
            redub_store::InputRef::Path { path } => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    return Err(PipelineEnd::Fatal(format!(
                        "input path missing: {}",
                        path.display()
                    )));
                }
                Ok(path)
            }
            redub_store::InputRef::Upload { upload_id } => {
                let upload = self
                    .meta
                    .get_upload(upload_id)
                    .await
                    .map_err(|e| PipelineEnd::Fatal(format!("input upload missing: {e}")))?;
                if upload.state != UploadState::Complete {
                    return Err(PipelineEnd::Fatal(format!(
                        "input upload {} is {}",
                        upload_id, upload.state
                    )));
                }
                Ok(self
                    .uploads_dir
                    .join(upload_id.as_str())
                    .join(&upload.filename_safe))
            }
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .base_backoff
            .as_millis()
            .saturating_mul(1u128 << attempt.saturating_sub(1).min(16)) as u64;
        let capped = exp.min(self.config.max_backoff.as_millis() as u64);
        let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_millis(((capped as f64) * jitter) as u64)
    }

    async fn log_line(&self, job_id: &JobId, work_dir: &std::path::Path, line: &str) {
        let redacted = redact(line);
        if let Err(err) = self.meta.append_log(job_id, &redacted).await {
            warn!(job = %job_id, error = %err, "job log append failed");
        }
        let _ = self.layout.append_job_log(work_dir, &redacted).await;
        self.hub.publish_job(
            job_id,
            JobEvent::Log {
                job_id: job_id.clone(),
                lines: vec![redacted],
                at: Utc::now(),
            },
        );
    }

    fn publish_state(&self, job: &JobRecord) {
        self.hub.publish_job(
            &job.id,
            JobEvent::State {
                job_id: job.id.clone(),
                state: job.state.to_string(),
                progress: job.progress,
                message: job.message.clone(),
                at: Utc::now(),
            },
        );
    }
}

/// Boot-time recovery: jobs left `RUNNING` by a crashed or drained
/// instance (no live lease) go back to `QUEUED` with their checkpoints
/// intact, and their outbox rows reopen so the flusher re-routes them.
pub async fn recover_interrupted_jobs(meta: &MetaStore) -> EngineResult<usize> {
    let mut recovered = 0;
    for job_id in meta.running_job_ids().await? {
        if meta.has_active_lease(&job_id).await? {
            continue;
        }
        let result = meta
            .update_job(&job_id, Some(JobState::Running), |j| {
                j.transition(JobState::Queued)?;
                j.message = "recovered after interruption".into();
                Ok(())
            })
            .await;
        match result {
            Ok(_) => {
                meta.reopen_outbox(&job_id).await?;
                recovered += 1;
            }
            Err(StoreError::StateMismatch { .. }) => {}
            Err(err) => return Err(EngineError::Store(err)),
        }
    }
    if recovered > 0 {
        info!(count = recovered, "recovered interrupted jobs");
    }
    Ok(recovered)
}
