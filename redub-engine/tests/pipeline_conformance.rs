//! End-to-end engine conformance: claim, lease, checkpoint resume,
//! cancellation, watchdog, retries, and the two-pass rerun, all driven
//! through the real scheduler, dispatch plane and worker pool with
//! deterministic stages.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use redub_core::{Config, JobId, QueueBackendKind, UserId};
use redub_dispatch::{AutoDispatch, AutoPolicy, DispatchBackend, OutboxFlusher, Submission};
use redub_engine::stage::fake::{FakeBehavior, FakeStage};
use redub_engine::stage::VOICE_CLONE_RERUN;
use redub_engine::worker::recover_interrupted_jobs;
use redub_engine::{
    CancelRegistry, OutputLayout, Pipeline, Scheduler, SchedulerConfig, Stage, StageContext,
    StageError, StageInput, StageOutput, WorkerConfig, WorkerPool,
};
use redub_events::EventHub;
use redub_store::{InputRef, JobPriority, JobRecord, JobState, MetaStore};

/// A stage that counts its executions; optionally fails fatally on its
/// first run or hangs until canceled.
struct CountingStage {
    name: &'static str,
    runs: Arc<AtomicU32>,
    fatal_runs: u32,
    hang: bool,
}

impl CountingStage {
    fn new(name: &'static str, runs: Arc<AtomicU32>) -> Self {
        Self {
            name,
            runs,
            fatal_runs: 0,
            hang: false,
        }
    }

    fn fatal_first(mut self) -> Self {
        self.fatal_runs = 1;
        self
    }

    fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }
}

#[async_trait]
impl Stage for CountingStage {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, ctx: StageContext, input: StageInput) -> Result<StageOutput, StageError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;

        if self.hang {
            let mut cancel = ctx.cancel.clone();
            loop {
                if *cancel.borrow() {
                    return Err(StageError::Cancelled);
                }
                tokio::select! {
                    _ = cancel.changed() => {}
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
            }
        }

        if run <= self.fatal_runs {
            return Err(StageError::Fatal("scripted failure".into()));
        }

        let artifact = input.work_dir.join(format!("{}.out", self.name));
        tokio::fs::write(&artifact, format!("{}:{run}", self.name))
            .await
            .map_err(|e| StageError::Transient(e.to_string()))?;
        let mut artifacts = BTreeMap::new();
        artifacts.insert(format!("{}.out", self.name), artifact);
        Ok(StageOutput {
            artifacts,
            message: format!("{} done", self.name),
        })
    }
}

/// A stage whose artifact content is run-independent, so checkpoint
/// hashes stay valid across reruns.
struct StableStage {
    name: &'static str,
    runs: Arc<AtomicU32>,
}

#[async_trait]
impl Stage for StableStage {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, _ctx: StageContext, input: StageInput) -> Result<StageOutput, StageError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let artifact = input.work_dir.join(format!("{}.out", self.name));
        tokio::fs::write(&artifact, self.name)
            .await
            .map_err(|e| StageError::Transient(e.to_string()))?;
        let mut artifacts = BTreeMap::new();
        artifacts.insert(format!("{}.out", self.name), artifact);
        Ok(StageOutput {
            artifacts,
            message: format!("{} done", self.name),
        })
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    config: Config,
    meta: Arc<MetaStore>,
    dispatch: Arc<AutoDispatch>,
    scheduler: Arc<Scheduler>,
    cancels: Arc<CancelRegistry>,
    flusher: OutboxFlusher,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    workers: Vec<tokio::task::JoinHandle<()>>,
    input_path: std::path::PathBuf,
}

async fn harness_with(pipeline: Pipeline, worker_tweak: impl FnOnce(&mut WorkerConfig)) -> Harness {
    std::env::set_var("REDUB_ALLOW_UNSAFE_STATE_DIR", "1");
    let dir = tempfile::tempdir().unwrap();
    harness_in(dir, pipeline, worker_tweak).await
}

async fn harness_in(
    dir: tempfile::TempDir,
    pipeline: Pipeline,
    worker_tweak: impl FnOnce(&mut WorkerConfig),
) -> Harness {
    let config = Config::dev_defaults(dir.path());
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
            256,
            AutoPolicy::default(),
            hub.clone(),
            meta.clone(),
        )
        .await,
    );
    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig::from_config(&config),
        meta.clone(),
        dispatch.clone() as Arc<dyn DispatchBackend>,
        hub.clone(),
    ));
    let cancels = Arc::new(CancelRegistry::new());
    let layout = OutputLayout::new(&config.output_dir).unwrap();

    let input_path = dir.path().join("episode-01.mkv");
    std::fs::write(&input_path, b"source video bytes").unwrap();

    let mut worker_config = WorkerConfig::from_config(&config);
    worker_config.claim_wait = Duration::from_millis(50);
    worker_tweak(&mut worker_config);

    let pool = WorkerPool::new(
        worker_config,
        meta.clone(),
        dispatch.clone() as Arc<dyn DispatchBackend>,
        scheduler.clone(),
        hub.clone(),
        cancels.clone(),
        pipeline,
        layout,
        config.uploads_dir.clone(),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let workers = pool.start(shutdown_rx);

    let flusher = OutboxFlusher::new(meta.clone(), dispatch.clone(), Duration::from_millis(50));

    Harness {
        _dir: dir,
        config,
        meta,
        dispatch,
        scheduler,
        cancels,
        flusher,
        shutdown_tx,
        workers,
        input_path,
    }
}

impl Harness {
    async fn submit(&self, owner: &UserId) -> JobId {
        let job = JobRecord::new(
            owner.clone(),
            InputRef::Path {
                path: self.input_path.to_string_lossy().to_string(),
            },
            serde_json::json!({"target_lang": "de"}),
        );
        self.meta.create_job(&job).await.unwrap();
        self.flusher.flush_once().await;
        job.id
    }

    async fn wait_for(
        &self,
        job_id: &JobId,
        timeout: Duration,
        pred: impl Fn(&JobRecord) -> bool,
    ) -> JobRecord {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.meta.get_job(job_id).await.unwrap();
            if pred(&job) {
                return job;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out waiting for job {job_id}: state={} progress={}",
                    job.state, job.progress
                );
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.workers {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_pipeline_runs_to_done() {
    let harness = harness_with(FakeStage::standard_pipeline(), |_| {}).await;
    let owner = UserId::new();

    let job_id = harness.submit(&owner).await;
    let done = harness
        .wait_for(&job_id, Duration::from_secs(10), |j| j.state.is_terminal())
        .await;

    assert_eq!(done.state, JobState::Done);
    assert_eq!(done.progress, 1.0);
    assert_eq!(done.checkpoint.len(), 6);
    assert!(done.checkpoint.values().all(|c| c.done));
    assert_eq!(done.last_stage.as_deref(), Some("mux"));

    // Quota settled back to zero concurrent.
    let quota = harness.meta.quota(&owner).await.unwrap();
    assert_eq!(quota.concurrent_running, 0);
    assert!(quota.processing_minutes_today >= 1);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resume_runs_only_unfinished_stages() {
    std::env::set_var("REDUB_ALLOW_UNSAFE_STATE_DIR", "1");
    let dir = tempfile::tempdir().unwrap();

    let a_runs = Arc::new(AtomicU32::new(0));
    let b_runs = Arc::new(AtomicU32::new(0));
    let c_runs = Arc::new(AtomicU32::new(0));

    let pipeline = Pipeline::new(vec![
        Arc::new(StableStage {
            name: "separate",
            runs: a_runs.clone(),
        }),
        Arc::new(StableStage {
            name: "transcribe",
            runs: b_runs.clone(),
        }),
        Arc::new(CountingStage::new("translate", c_runs.clone()).fatal_first()),
    ]);

    let harness = harness_in(dir, pipeline, |_| {}).await;
    let owner = UserId::new();

    let job_id = harness.submit(&owner).await;
    let failed = harness
        .wait_for(&job_id, Duration::from_secs(10), |j| j.state.is_terminal())
        .await;
    assert_eq!(failed.state, JobState::Failed);
    assert!(failed.checkpoint["separate"].done);
    assert!(failed.checkpoint["transcribe"].done);
    assert!(!failed.checkpoint.contains_key("translate"));
    assert!(failed.last_error.is_some());

    // Rerun: terminal -> queued, outbox reopened, flusher re-routes.
    harness
        .meta
        .update_job(&job_id, None, |j| j.transition(JobState::Queued))
        .await
        .unwrap();
    harness.meta.reopen_outbox(&job_id).await.unwrap();
    harness.flusher.flush_once().await;

    let done = harness
        .wait_for(&job_id, Duration::from_secs(10), |j| j.state.is_terminal())
        .await;
    assert_eq!(done.state, JobState::Done);

    // Finished stages were skipped via checkpoint hashes; only the
    // failed stage ran again.
    assert_eq!(a_runs.load(Ordering::SeqCst), 1);
    assert_eq!(b_runs.load(Ordering::SeqCst), 1);
    assert_eq!(c_runs.load(Ordering::SeqCst), 2);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_mid_stage_preserves_earlier_checkpoints() {
    let runs = Arc::new(AtomicU32::new(0));
    let pipeline = Pipeline::new(vec![
        Arc::new(FakeStage::new(
            "separate",
            FakeBehavior::Succeed {
                delay: Duration::from_millis(0),
            },
        )) as Arc<dyn Stage>,
        Arc::new(CountingStage::new("tts", runs.clone()).hanging()),
    ]);
    let harness = harness_with(pipeline, |_| {}).await;
    let owner = UserId::new();

    let job_id = harness.submit(&owner).await;

    // Wait until the hanging stage is actually executing.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while runs.load(Ordering::SeqCst) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "tts never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // What the cancel endpoint does: durable flag plus in-memory signal.
    harness
        .meta
        .update_job(&job_id, None, |j| {
            j.cancel_requested = true;
            Ok(())
        })
        .await
        .unwrap();
    harness.cancels.signal(&job_id);

    let canceled = harness
        .wait_for(&job_id, Duration::from_secs(10), |j| j.state.is_terminal())
        .await;
    assert_eq!(canceled.state, JobState::Canceled);
    assert!(canceled.checkpoint["separate"].done);
    assert!(!canceled.checkpoint.contains_key("tts"));

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watchdog_times_out_hung_stages() {
    let runs = Arc::new(AtomicU32::new(0));
    let pipeline = Pipeline::new(vec![Arc::new(
        CountingStage::new("transcribe", runs).hanging(),
    ) as Arc<dyn Stage>]);

    let harness = harness_with(pipeline, |cfg| {
        cfg.stage_timeout = Duration::from_millis(200);
    })
    .await;
    let job_id = harness.submit(&UserId::new()).await;

    let failed = harness
        .wait_for(&job_id, Duration::from_secs(10), |j| j.state.is_terminal())
        .await;
    assert_eq!(failed.state, JobState::Failed);
    assert!(failed.last_error.as_deref().unwrap().contains("watchdog"));

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_failures_retry_then_succeed() {
    let pipeline = Pipeline::new(vec![Arc::new(FakeStage::new(
        "translate",
        FakeBehavior::FlakyThenSucceed {
            failures: AtomicU32::new(2),
        },
    )) as Arc<dyn Stage>]);

    let harness = harness_with(pipeline, |cfg| {
        cfg.base_backoff = Duration::from_millis(10);
        cfg.max_stage_attempts = 3;
    })
    .await;
    let job_id = harness.submit(&UserId::new()).await;

    let done = harness
        .wait_for(&job_id, Duration::from_secs(10), |j| j.state.is_terminal())
        .await;
    assert_eq!(done.state, JobState::Done);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_claims_execute_at_most_once() {
    let runs = Arc::new(AtomicU32::new(0));
    let pipeline = Pipeline::new(vec![Arc::new(StableStage {
        name: "separate",
        runs: runs.clone(),
    }) as Arc<dyn Stage>]);

    let harness = harness_with(pipeline, |cfg| {
        cfg.workers = 4;
    })
    .await;
    let job_id = harness.submit(&UserId::new()).await;

    // Force a duplicate dispatch entry for the same job: the lease, not
    // the queue, is what guarantees at-most-once.
    harness
        .dispatch
        .submit(Submission::now(job_id.clone(), JobPriority::Medium))
        .await
        .unwrap();

    let done = harness
        .wait_for(&job_id, Duration::from_secs(10), |j| j.state.is_terminal())
        .await;
    assert_eq!(done.state, JobState::Done);

    // Give the duplicate claim time to be observed and skipped.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1, "stage must run exactly once");

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn voice_clone_rerun_invalidates_tts_and_later_only() {
    std::env::set_var("REDUB_ALLOW_UNSAFE_STATE_DIR", "1");
    let dir = tempfile::tempdir().unwrap();

    let names: [&'static str; 6] = ["separate", "transcribe", "translate", "tts", "mix", "mux"];
    let counters: Vec<Arc<AtomicU32>> = names.iter().map(|_| Arc::new(AtomicU32::new(0))).collect();
    let stages: Vec<Arc<dyn Stage>> = names
        .iter()
        .zip(counters.iter())
        .map(|(name, runs)| {
            Arc::new(StableStage {
                name,
                runs: runs.clone(),
            }) as Arc<dyn Stage>
        })
        .collect();

    let harness = harness_in(dir, Pipeline::new(stages), |_| {}).await;
    let job_id = harness.submit(&UserId::new()).await;
    harness
        .wait_for(&job_id, Duration::from_secs(10), |j| j.state == JobState::Done)
        .await;

    // Operator-triggered two-pass voice-clone rerun.
    harness
        .meta
        .update_job(&job_id, None, |j| {
            j.transition(JobState::Queued)?;
            j.rerun_marker = Some(VOICE_CLONE_RERUN.to_string());
            Ok(())
        })
        .await
        .unwrap();
    harness.meta.reopen_outbox(&job_id).await.unwrap();
    harness.flusher.flush_once().await;

    let done = harness
        .wait_for(&job_id, Duration::from_secs(10), |j| j.state == JobState::Done)
        .await;
    assert!(done.rerun_marker.is_none(), "marker clears on completion");

    let run_counts: Vec<u32> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
    assert_eq!(run_counts, vec![1, 1, 1, 2, 2, 2]);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_running_jobs_are_recovered_at_boot() {
    std::env::set_var("REDUB_ALLOW_UNSAFE_STATE_DIR", "1");
    let dir = tempfile::tempdir().unwrap();
    let config = Config::dev_defaults(dir.path());
    let meta = Arc::new(
        MetaStore::open(&config.state_dir, &config.log_dir)
            .await
            .unwrap(),
    );

    // A job a dead instance left RUNNING with no live lease.
    let mut job = JobRecord::new(
        UserId::new(),
        InputRef::Path { path: "/in".into() },
        serde_json::json!({}),
    );
    job.state = JobState::Running;
    meta.put_job(&job).await.unwrap();

    assert_eq!(recover_interrupted_jobs(&meta).await.unwrap(), 1);
    let recovered = meta.get_job(&job.id).await.unwrap();
    assert_eq!(recovered.state, JobState::Queued);
    assert_eq!(meta.pending_outbox(10).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduler_harness_config_is_exercised() {
    // Sanity: the dev harness honors its own caps end to end.
    let harness = harness_with(FakeStage::standard_pipeline(), |_| {}).await;
    assert!(harness.scheduler.is_admitting());
    assert_eq!(harness.config.max_concurrent_global, 2);
    harness.stop().await;
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Terminal states admit no transition except the explicit rerun
        /// back to QUEUED.
        #[test]
        fn terminal_states_are_final_except_rerun(from in 0u8..6, to in 0u8..6) {
            let states = [
                JobState::Queued,
                JobState::Paused,
                JobState::Running,
                JobState::Done,
                JobState::Failed,
                JobState::Canceled,
            ];
            let from = states[from as usize];
            let to = states[to as usize];
            if from.is_terminal() && from.can_transition_to(to) {
                prop_assert_eq!(to, JobState::Queued);
            }
        }

        /// Progress is monotonic non-decreasing under arbitrary update
        /// sequences while running.
        #[test]
        fn progress_is_monotonic(updates in proptest::collection::vec(0.0f64..1.5, 1..50)) {
            let mut job = JobRecord::new(
                UserId::new(),
                InputRef::Path { path: "/in".into() },
                serde_json::json!({}),
            );
            job.transition(JobState::Running).unwrap();
            let mut last = job.progress;
            for update in updates {
                job.advance_progress(update, "step");
                prop_assert!(job.progress >= last);
                prop_assert!(job.progress <= 1.0);
                last = job.progress;
            }
        }

        /// The deterministic queue order is a total order: any permutation
        /// of the same submissions claims back in the same sequence.
        #[test]
        fn local_dispatch_order_is_deterministic(seed in proptest::collection::vec(0u8..3, 2..12)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async {
                use redub_dispatch::LocalDispatch;
                let at = chrono::Utc::now();
                let make = |i: usize, p: u8| Submission {
                    job_id: JobId::from(format!("job_{i:02}").as_str()),
                    priority: JobPriority::from_u8(p + 1).unwrap(),
                    available_at: at,
                    submitted_at: at,
                };

                let submissions: Vec<Submission> =
                    seed.iter().enumerate().map(|(i, p)| make(i, *p)).collect();

                let forward = LocalDispatch::new(64);
                for s in submissions.iter() {
                    forward.submit(s.clone()).await.unwrap();
                }
                let reverse = LocalDispatch::new(64);
                for s in submissions.iter().rev() {
                    reverse.submit(s.clone()).await.unwrap();
                }

                let consumer = redub_core::ConsumerId::new("prop");
                let a = forward
                    .claim(&consumer, 64, Duration::from_millis(10), Duration::from_secs(1))
                    .await
                    .unwrap();
                let b = reverse
                    .claim(&consumer, 64, Duration::from_millis(10), Duration::from_secs(1))
                    .await
                    .unwrap();

                let ids = |claims: &[redub_dispatch::Claimed]| {
                    claims.iter().map(|c| c.job_id.to_string()).collect::<Vec<_>>()
                };
                assert_eq!(ids(&a), ids(&b));
            });
        }
    }
}
