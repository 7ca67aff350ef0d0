//! redub-engine: the job orchestration core.
//!
//! The scheduler decides what may run (caps, backpressure, admission);
//! workers claim dispatched job IDs, win the execution lease, and walk the
//! stage pipeline with checkpoint-aware resume; the retention sweeper
//! prunes artifacts once jobs settle. Stages themselves are opaque
//! collaborators behind the [`stage::Stage`] trait - this crate never
//! looks inside them.

pub mod cancel;
pub mod checkpoint;
pub mod error;
pub mod layout;
pub mod retention;
pub mod scheduler;
pub mod stage;
pub mod worker;

pub use cancel::CancelRegistry;
pub use error::{EngineError, EngineResult};
pub use layout::OutputLayout;
pub use retention::RetentionSweeper;
pub use scheduler::{AdmissionOutcome, Scheduler, SchedulerConfig, SchedulerStatus};
pub use stage::{Pipeline, Stage, StageContext, StageError, StageInput, StageOutput};
pub use worker::{WorkerConfig, WorkerPool};
