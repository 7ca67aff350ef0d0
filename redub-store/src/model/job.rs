use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use redub_core::{JobId, UploadId, UserId};

/// Job lifecycle states.
///
/// `Queued` exits only into `Running`, `Canceled` or `Failed`; `Running`
/// exits only into a terminal state. Terminal states never transition back
/// except through an explicit rerun, which resets to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Paused,
    Running,
    Done,
    Failed,
    Canceled,
}

impl JobState {
    /// Check if the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }

    /// Whether `next` is a legal direct successor of `self`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Queued, Running) | (Queued, Canceled) | (Queued, Failed) => true,
            (Queued, Paused) => true,
            (Paused, Queued) | (Paused, Canceled) => true,
            (Running, Done) | (Running, Failed) | (Running, Canceled) => true,
            // Interrupted-run recovery: a drained or crashed worker left
            // the job RUNNING with no live lease; boot requeues it and the
            // checkpoint drives the resume.
            (Running, Queued) => true,
            // Explicit rerun path out of a terminal state
            (Done, Queued) | (Failed, Queued) | (Canceled, Queued) => true,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Paused => "PAUSED",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "QUEUED" => Ok(Self::Queued),
            "PAUSED" => Ok(Self::Paused),
            "RUNNING" => Ok(Self::Running),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            _ => Err(format!("invalid job state: {}", s)),
        }
    }
}

/// Priority levels affecting scheduler ordering and per-mode caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Medium
    }
}

impl JobPriority {
    pub fn name(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Low),
            2 => Some(Self::Medium),
            3 => Some(Self::High),
            _ => None,
        }
    }

    /// One step down the priority ladder, used by backpressure degrade.
    pub fn degraded(self) -> Self {
        match self {
            Self::High => Self::Medium,
            Self::Medium | Self::Low => Self::Low,
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("invalid priority: {}", s)),
        }
    }
}

/// Whether authenticated non-owners may read the job and its artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Shared,
}

impl Default for Visibility {
    fn default() -> Self {
        Self::Private
    }
}

/// The job's source material: a completed upload or a validated server path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputRef {
    Upload { upload_id: UploadId },
    Path { path: String },
}

/// Library coordinates `(series_slug, season, episode)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LibraryKey {
    pub series_slug: String,
    pub season: u32,
    pub episode: u32,
}

/// Completion marker for one pipeline stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageCheckpoint {
    pub done: bool,
    pub done_at: Option<DateTime<Utc>>,
    /// Artifact name -> content hash, used for skip-on-resume verification
    #[serde(default)]
    pub artifact_hashes: BTreeMap<String, String>,
}

/// Stage name -> checkpoint, persisted atomically with progress updates.
pub type Checkpoint = BTreeMap<String, StageCheckpoint>;

/// The primary aggregate: one dubbing job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub owner_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub state: JobState,
    pub priority: JobPriority,
    pub visibility: Visibility,

    /// Monotonic non-decreasing while `Running`; reset only on rerun
    pub progress: f64,
    /// Short human-readable status line
    pub message: String,
    pub last_stage: Option<String>,
    pub last_error: Option<String>,

    pub input_ref: InputRef,
    /// Configuration snapshot taken at submit; immutable thereafter
    /// except for operator overrides
    pub runtime: Value,

    /// Bytes this job contributes to the owner's storage quota
    pub owner_storage_bytes_delta: i64,

    #[serde(default)]
    pub checkpoint: Checkpoint,

    pub library_key: Option<LibraryKey>,

    #[serde(default)]
    pub archived: bool,
    pub deleted_at: Option<DateTime<Utc>>,

    /// Durable cancellation request flag, observed by workers at stage
    /// boundaries
    #[serde(default)]
    pub cancel_requested: bool,

    /// Operator rerun marker; names the checkpoint set the worker must
    /// ignore (e.g. the two-pass voice-clone rerun)
    pub rerun_marker: Option<String>,

    /// Earliest dispatch eligibility, set by the scheduler when
    /// backpressure delays a low-priority submission
    #[serde(default)]
    pub dispatch_after: Option<DateTime<Utc>>,

    /// Unknown keys from older/newer writers, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobRecord {
    /// Create a freshly submitted job in `Queued` state.
    pub fn new(owner_id: UserId, input_ref: InputRef, runtime: Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            owner_id,
            created_at: now,
            updated_at: now,
            state: JobState::Queued,
            priority: JobPriority::default(),
            visibility: Visibility::default(),
            progress: 0.0,
            message: "queued".to_string(),
            last_stage: None,
            last_error: None,
            input_ref,
            runtime,
            owner_storage_bytes_delta: 0,
            checkpoint: Checkpoint::new(),
            library_key: None,
            archived: false,
            deleted_at: None,
            cancel_requested: false,
            rerun_marker: None,
            dispatch_after: None,
            extra: Map::new(),
        }
    }

    /// Apply a state transition, enforcing the lifecycle invariants.
    pub fn transition(&mut self, next: JobState) -> Result<(), String> {
        if !self.state.can_transition_to(next) {
            return Err(format!("illegal transition {} -> {}", self.state, next));
        }
        if next == JobState::Queued && self.state.is_terminal() {
            // Explicit rerun resets progress
            self.progress = 0.0;
            self.last_error = None;
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Raise progress; regressions are clamped away while running.
    pub fn advance_progress(&mut self, progress: f64, message: impl Into<String>) {
        if progress > self.progress {
            self.progress = progress.min(1.0);
        }
        self.message = message.into();
        self.updated_at = Utc::now();
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Filters for job listings. Owner scoping is applied by the caller based
/// on the requesting identity.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub owner_id: Option<UserId>,
    pub state: Option<JobState>,
    /// Include jobs shared by other owners (reads only)
    pub include_shared: bool,
    pub include_archived: bool,
}

/// One page of a job listing.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<JobRecord>,
    pub total: u64,
}

/// One persisted timeline entry for a job (state transitions, stage
/// completions, scheduler decisions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub seq: i64,
    pub at: DateTime<Utc>,
    pub kind: String,
    pub detail: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job() -> JobRecord {
        JobRecord::new(
            UserId::new(),
            InputRef::Path {
                path: "/data/in.mkv".into(),
            },
            serde_json::json!({"target_lang": "de"}),
        )
    }

    #[test]
    fn queued_exits_only_to_running_canceled_failed_paused() {
        for next in [JobState::Running, JobState::Canceled, JobState::Failed, JobState::Paused] {
            assert!(JobState::Queued.can_transition_to(next));
        }
        assert!(!JobState::Queued.can_transition_to(JobState::Done));
    }

    #[test]
    fn terminal_states_are_sticky_except_rerun() {
        for term in [JobState::Done, JobState::Failed, JobState::Canceled] {
            assert!(term.is_terminal());
            assert!(!term.can_transition_to(JobState::Running));
            assert!(term.can_transition_to(JobState::Queued));
        }
    }

    #[test]
    fn rerun_resets_progress() {
        let mut job = test_job();
        job.transition(JobState::Running).unwrap();
        job.advance_progress(0.7, "tts");
        job.transition(JobState::Done).unwrap();
        job.transition(JobState::Queued).unwrap();
        assert_eq!(job.progress, 0.0);
    }

    #[test]
    fn progress_never_regresses() {
        let mut job = test_job();
        job.transition(JobState::Running).unwrap();
        job.advance_progress(0.5, "transcribe");
        job.advance_progress(0.3, "stale update");
        assert_eq!(job.progress, 0.5);
        job.advance_progress(2.0, "overshoot");
        assert_eq!(job.progress, 1.0);
    }

    #[test]
    fn unknown_doc_keys_round_trip() {
        let mut job = test_job();
        job.extra
            .insert("future_field".into(), Value::String("kept".into()));
        let text = serde_json::to_string(&job).unwrap();
        let back: JobRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back.extra.get("future_field").unwrap(), "kept");
    }

    #[test]
    fn priority_degrade_ladder() {
        assert_eq!(JobPriority::High.degraded(), JobPriority::Medium);
        assert_eq!(JobPriority::Medium.degraded(), JobPriority::Low);
        assert_eq!(JobPriority::Low.degraded(), JobPriority::Low);
    }
}
