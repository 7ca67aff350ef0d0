//! redub-store: the single authoritative owner of durable records.
//!
//! Jobs, uploads, users, invites, sessions, API keys, quota counters,
//! dispatch leases, the submission outbox, the library index and the audit
//! trail all live here, in two embedded SQLite databases under `STATE_DIR`
//! (`auth.db` and `jobs.db`). Every other crate holds IDs only and resolves
//! them through this store.
//!
//! Writes follow a single-writer discipline: one process-wide async mutex
//! is taken for the duration of each write transaction and released before
//! any stage I/O can happen. Reads go straight to the pool.

pub mod audit;
pub mod db;
pub mod error;
pub mod joblog;
pub mod leases;
pub mod library;
pub mod model;
pub mod outbox;
pub mod quota;

mod jobs;
mod migrations;
mod time;
mod uploads;
mod users;

pub use audit::{AuditEvent, AuditOutcome};
pub use db::MetaStore;
pub use error::{StoreError, StoreResult};
pub use leases::LeaseOutcome;
pub use model::job::{
    Checkpoint, InputRef, JobFilter, JobPage, JobRecord, JobState, JobPriority, LibraryKey,
    StageCheckpoint, TimelineEntry, Visibility,
};
pub use model::quota::QuotaSnapshot;
pub use model::upload::{UploadRecord, UploadState};
pub use model::user::{ApiKeyRecord, InviteRecord, PairingCode, SessionRecord, UserRecord};
pub use outbox::{OutboxRow, OutboxState};
