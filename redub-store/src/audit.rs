use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use redub_core::{redact, RequestId, UserId};

use crate::error::StoreResult;

/// Outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Denied,
    Error,
}

/// One security event. `meta` is redacted at construction time; content
/// fields (transcripts, file bodies) must never be placed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    pub request_id: RequestId,
    pub actor_id: Option<UserId>,
    pub action: String,
    pub target: String,
    pub outcome: AuditOutcome,
    pub meta: String,
}

impl AuditEvent {
    pub fn new(
        request_id: RequestId,
        actor_id: Option<UserId>,
        action: impl Into<String>,
        target: impl Into<String>,
        outcome: AuditOutcome,
        meta: &str,
    ) -> Self {
        Self {
            ts: Utc::now(),
            request_id,
            actor_id,
            action: action.into(),
            target: target.into(),
            outcome,
            // Redaction happens at write time, not read time.
            meta: redact(meta),
        }
    }
}

/// Append-only audit trail, one JSONL file per UTC day.
pub struct AuditLog {
    dir: PathBuf,
    current: Mutex<Option<(String, File)>>,
}

impl AuditLog {
    pub fn open(log_dir: &std::path::Path) -> StoreResult<Self> {
        let dir = log_dir.join("audit");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            current: Mutex::new(None),
        })
    }

    /// Append one event. Rotates to a new file when the UTC day changes.
    pub fn append(&self, event: &AuditEvent) -> StoreResult<()> {
        let day = event.ts.format("%Y-%m-%d").to_string();
        let line = serde_json::to_string(event)?;

        let mut slot = self.current.lock();
        let rotate = match slot.as_ref() {
            Some((open_day, _)) => *open_day != day,
            None => true,
        };
        if rotate {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(format!("audit-{day}.jsonl")))?;
            *slot = Some((day, file));
        }

        let (_, file) = slot.as_mut().unwrap();
        writeln!(file, "{line}")?;
        Ok(())
    }
}

impl super::db::MetaStore {
    /// Record a security event in both the rotated audit file and the
    /// `audit_events` table.
    pub async fn record_audit(&self, event: AuditEvent) -> StoreResult<()> {
        self.audit.append(&event)?;

        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO audit_events (at, request_id, actor_id, action, target, outcome, meta)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(crate::time::to_millis(event.ts))
        .bind(event.request_id.as_str())
        .bind(event.actor_id.as_ref().map(|a| a.as_str().to_string()))
        .bind(&event.action)
        .bind(&event.target)
        .bind(match event.outcome {
            AuditOutcome::Allowed => "allowed",
            AuditOutcome::Denied => "denied",
            AuditOutcome::Error => "error",
        })
        .bind(&event.meta)
        .execute(&self.jobs_db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_redacted_at_construction() {
        let event = AuditEvent::new(
            RequestId::new(),
            None,
            "auth.login",
            "user:usr_x",
            AuditOutcome::Denied,
            "token=super-secret-value attempt 3",
        );
        assert!(!event.meta.contains("super-secret-value"));
    }

    #[test]
    fn append_rotates_by_day() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path()).unwrap();
        let event = AuditEvent::new(
            RequestId::new(),
            Some(UserId::new()),
            "jobs.submit",
            "job:job_a",
            AuditOutcome::Allowed,
            "priority=high",
        );
        log.append(&event).unwrap();

        let day = event.ts.format("%Y-%m-%d").to_string();
        let path = dir.path().join("audit").join(format!("audit-{day}.jsonl"));
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("jobs.submit"));
    }
}
