use std::path::{Path, PathBuf};
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::info;

use crate::audit::AuditLog;
use crate::error::{StoreError, StoreResult};
use crate::migrations;

/// The durable metadata store: two embedded SQLite databases plus the
/// per-job log directory and the audit trail.
///
/// All mutation methods take the process-wide writer lock for the duration
/// of their transaction (single-writer discipline); reads go straight to
/// the pools.
pub struct MetaStore {
    pub(crate) jobs_db: SqlitePool,
    pub(crate) auth_db: SqlitePool,
    pub(crate) write_lock: Arc<Mutex<()>>,
    pub(crate) log_dir: PathBuf,
    pub(crate) audit: AuditLog,
}

impl MetaStore {
    /// Open (or create) the store under `state_dir`.
    ///
    /// Refuses to open when the state directory lives somewhere unsafe
    /// (build output, temp scratch, a source checkout), when either
    /// database fails its integrity check, or when the schema version is
    /// newer than this binary supports.
    pub async fn open(state_dir: &Path, log_dir: &Path) -> StoreResult<Self> {
        // Operators can point the store at scratch space deliberately
        // (test suites do); everyone else gets the safety net.
        if std::env::var_os("REDUB_ALLOW_UNSAFE_STATE_DIR").is_none() {
            ensure_safe_state_path(state_dir)?;
        }

        std::fs::create_dir_all(state_dir)?;
        std::fs::create_dir_all(log_dir)?;

        let jobs_db = open_pool(&state_dir.join("jobs.db")).await?;
        let auth_db = open_pool(&state_dir.join("auth.db")).await?;

        integrity_check(&jobs_db, "jobs.db").await?;
        integrity_check(&auth_db, "auth.db").await?;

        migrations::migrate_jobs(&jobs_db).await?;
        migrations::migrate_auth(&auth_db).await?;

        let audit = AuditLog::open(log_dir)?;

        info!(state_dir = %state_dir.display(), "metadata store open");

        Ok(Self {
            jobs_db,
            auth_db,
            write_lock: Arc::new(Mutex::new(())),
            log_dir: log_dir.to_path_buf(),
            audit,
        })
    }

    /// The audit trail writer.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Flush and close both databases. Called last during shutdown, after
    /// every writer has stopped.
    pub async fn close(&self) {
        let _guard = self.write_lock.lock().await;
        self.jobs_db.close().await;
        self.auth_db.close().await;
        info!("metadata store closed");
    }
}

async fn open_pool(path: &Path) -> StoreResult<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    Ok(pool)
}

async fn integrity_check(pool: &SqlitePool, name: &str) -> StoreResult<()> {
    let row = sqlx::query("PRAGMA quick_check").fetch_one(pool).await?;
    let verdict: String = row.get(0);
    if verdict != "ok" {
        return Err(StoreError::Corruption(format!("{name}: {verdict}")));
    }
    Ok(())
}

/// Boot-time refusal for database locations that are routinely wiped or
/// checked in: build output, temp scratch, and source checkouts.
fn ensure_safe_state_path(state_dir: &Path) -> StoreResult<()> {
    let display = state_dir.display().to_string();

    let tmp = std::env::temp_dir();
    if state_dir.starts_with(&tmp) {
        return Err(StoreError::UnsafePath(display));
    }

    for component in state_dir.components() {
        if component.as_os_str() == "target" || component.as_os_str() == "node_modules" {
            return Err(StoreError::UnsafePath(display));
        }
    }

    // A .git ancestor means the state dir sits inside a source checkout.
    let mut cursor = Some(state_dir);
    while let Some(dir) = cursor {
        if dir.join(".git").exists() {
            return Err(StoreError::UnsafePath(display));
        }
        cursor = dir.parent();
    }

    Ok(())
}
