use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use redub_core::JobId;

/// The dubbing pipeline in declared order. Stage internals (ASR, MT, TTS,
/// mixing, muxing) live outside this repo; the engine only needs names,
/// phases and the run contract.
pub const STANDARD_STAGES: &[&str] = &["separate", "transcribe", "translate", "tts", "mix", "mux"];

/// Marker set by the operator-triggered two-pass voice-clone rerun.
pub const VOICE_CLONE_RERUN: &str = "voice_clone_two_pass";

/// Stages whose checkpoints a rerun marker invalidates: `tts`, `mix`, and
/// everything declared after them. Earlier checkpoints stay honored.
pub fn marker_invalidates(marker: &str, stage_name: &str) -> bool {
    if marker != VOICE_CLONE_RERUN {
        return false;
    }
    let cut = STANDARD_STAGES.iter().position(|s| *s == "tts").unwrap_or(0);
    STANDARD_STAGES
        .iter()
        .position(|s| *s == stage_name)
        .map(|idx| idx >= cut)
        .unwrap_or(false)
}

/// Error classes a stage may fail with; they drive retry behavior.
#[derive(Error, Debug, Clone)]
pub enum StageError {
    /// Retry with bounded attempts and jittered backoff
    #[error("transient stage failure: {0}")]
    Transient(String),

    /// The job's cancellation token fired; propagate without retry
    #[error("stage canceled")]
    Cancelled,

    /// Terminate the job as FAILED
    #[error("fatal stage failure: {0}")]
    Fatal(String),
}

/// What a stage gets to work with. All paths live under the job's working
/// directory; stages must be side-effect-contained within it.
#[derive(Debug, Clone)]
pub struct StageInput {
    pub job_id: JobId,
    pub input_path: PathBuf,
    pub work_dir: PathBuf,
    /// Runtime configuration snapshot taken at submit
    pub runtime: serde_json::Value,
    /// Artifacts produced by earlier stages, by artifact name
    pub prior_artifacts: BTreeMap<String, PathBuf>,
}

/// What a stage hands back on success.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    /// Artifact name -> path. Names are work-dir-relative (joining the
    /// work dir with the name resolves the artifact), which is what lets
    /// a resumed run re-locate artifacts from checkpoint hashes alone.
    pub artifacts: BTreeMap<String, PathBuf>,
    pub message: String,
}

/// Cooperative context: cancellation signal plus an intra-stage progress
/// channel the worker forwards to the event hub.
#[derive(Clone)]
pub struct StageContext {
    pub cancel: watch::Receiver<bool>,
    pub progress: mpsc::UnboundedSender<(f64, String)>,
}

impl StageContext {
    pub fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Report fractional progress within this stage (`0.0..=1.0`).
    pub fn report(&self, fraction: f64, message: impl Into<String>) {
        let _ = self.progress.send((fraction.clamp(0.0, 1.0), message.into()));
    }
}

/// One pipeline step. `phase` groups stages for concurrency caps (several
/// stages may share a GPU-bound phase).
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn phase(&self) -> &'static str {
        self.name()
    }

    async fn run(&self, ctx: StageContext, input: StageInput) -> Result<StageOutput, StageError>;
}

/// The ordered stage list a worker executes per job.
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

pub mod fake {
    //! Deterministic stages for the test suites and local dry runs. Each
    //! writes one artifact derived only from its name and the input path,
    //! so artifact hashes are reproducible across runs.

    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Scripted behavior for a fake stage.
    pub enum FakeBehavior {
        /// Succeed after an optional delay
        Succeed { delay: Duration },
        /// Fail with `Transient` this many times, then succeed
        FlakyThenSucceed { failures: AtomicU32 },
        /// Always fail fatally
        Fatal,
        /// Never return (watchdog fodder); checks cancellation every 10 ms
        Hang,
    }

    pub struct FakeStage {
        name: &'static str,
        phase: &'static str,
        behavior: FakeBehavior,
    }

    impl FakeStage {
        pub fn new(name: &'static str, behavior: FakeBehavior) -> Self {
            Self {
                name,
                phase: name,
                behavior,
            }
        }

        pub fn with_phase(mut self, phase: &'static str) -> Self {
            self.phase = phase;
            self
        }

        /// The standard six-stage pipeline, all succeeding instantly.
        pub fn standard_pipeline() -> Pipeline {
            Pipeline::new(
                STANDARD_STAGES
                    .iter()
                    .map(|name| {
                        Arc::new(FakeStage::new(
                            name,
                            FakeBehavior::Succeed {
                                delay: Duration::from_millis(0),
                            },
                        )) as Arc<dyn Stage>
                    })
                    .collect(),
            )
        }
    }

    #[async_trait]
    impl Stage for FakeStage {
        fn name(&self) -> &'static str {
            self.name
        }

        fn phase(&self) -> &'static str {
            self.phase
        }

        async fn run(
            &self,
            ctx: StageContext,
            input: StageInput,
        ) -> Result<StageOutput, StageError> {
            match &self.behavior {
                FakeBehavior::Succeed { delay } => {
                    if !delay.is_zero() {
                        tokio::time::sleep(*delay).await;
                    }
                    if ctx.cancelled() {
                        return Err(StageError::Cancelled);
                    }
                    ctx.report(0.5, format!("{} halfway", self.name));

                    let artifact = input.work_dir.join(format!("{}.out", self.name));
                    let input_name = input
                        .input_path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let content = format!("{}:{}", self.name, input_name);
                    tokio::fs::write(&artifact, content)
                        .await
                        .map_err(|e| StageError::Transient(e.to_string()))?;

                    let mut artifacts = BTreeMap::new();
                    artifacts.insert(format!("{}.out", self.name), artifact);
                    Ok(StageOutput {
                        artifacts,
                        message: format!("{} done", self.name),
                    })
                }
                FakeBehavior::FlakyThenSucceed { failures } => {
                    if failures.load(Ordering::SeqCst) > 0 {
                        failures.fetch_sub(1, Ordering::SeqCst);
                        return Err(StageError::Transient("simulated flake".into()));
                    }
                    let artifact = input.work_dir.join(format!("{}.out", self.name));
                    tokio::fs::write(&artifact, self.name)
                        .await
                        .map_err(|e| StageError::Transient(e.to_string()))?;
                    let mut artifacts = BTreeMap::new();
                    artifacts.insert(format!("{}.out", self.name), artifact);
                    Ok(StageOutput {
                        artifacts,
                        message: format!("{} done after retries", self.name),
                    })
                }
                FakeBehavior::Fatal => Err(StageError::Fatal("simulated fatal".into())),
                FakeBehavior::Hang => {
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
            }
        }
    }
}
