use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use redub_core::JobId;

/// Events published on job topics and the global topic.
///
/// State names travel as strings so that this crate stays a leaf: the
/// store owns the `JobState` enum, the hub only fans values out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A state transition (includes the resulting progress and message)
    State {
        job_id: JobId,
        state: String,
        progress: f64,
        message: String,
        at: DateTime<Utc>,
    },

    /// A progress increment inside a stage; coalesced per subscriber
    Progress {
        job_id: JobId,
        stage: String,
        progress: f64,
        message: String,
        at: DateTime<Utc>,
    },

    /// A batch of appended log lines
    Log {
        job_id: JobId,
        lines: Vec<String>,
        at: DateTime<Utc>,
    },

    StageStarted {
        job_id: JobId,
        stage: String,
        at: DateTime<Utc>,
    },

    StageCompleted {
        job_id: JobId,
        stage: String,
        at: DateTime<Utc>,
    },

    /// Dispatch backend selection changed (global topic)
    DispatchChanged {
        backend: String,
        healthy: bool,
        at: DateTime<Utc>,
    },

    /// Scheduler entered or left backpressure degrade (global topic)
    DegradeChanged {
        active: bool,
        queue_depth: usize,
        at: DateTime<Utc>,
    },

    /// The subscriber's buffer overflowed; events were lost
    DropNotice { dropped: u64, at: DateTime<Utc> },

    /// Terminal event sent when the hub closes during shutdown
    Shutdown { at: DateTime<Utc> },
}

impl JobEvent {
    /// Stable wire name, used as the SSE `event:` field.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::State { .. } => "state",
            Self::Progress { .. } => "progress",
            Self::Log { .. } => "log",
            Self::StageStarted { .. } => "stage_started",
            Self::StageCompleted { .. } => "stage_completed",
            Self::DispatchChanged { .. } => "dispatch_changed",
            Self::DegradeChanged { .. } => "degrade_changed",
            Self::DropNotice { .. } => "drop_notice",
            Self::Shutdown { .. } => "shutdown",
        }
    }

    /// The job this event belongs to, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Self::State { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Log { job_id, .. }
            | Self::StageStarted { job_id, .. }
            | Self::StageCompleted { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    /// Progress events are the only coalescible class.
    pub fn is_coalescible(&self) -> bool {
        matches!(self, Self::Progress { .. })
    }
}

/// An event stamped with its per-topic sequence number. Sequence numbers
/// back the SSE `Last-Event-ID` replay window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub seq: u64,
    pub event: JobEvent,
}
