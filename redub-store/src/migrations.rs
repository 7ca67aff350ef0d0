use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::error::{StoreError, StoreResult};

/// Highest schema version this binary understands. A database stamped with
/// a newer version refuses to open; migrations are additive only.
const JOBS_SCHEMA_VERSION: i64 = 1;
const AUTH_SCHEMA_VERSION: i64 = 1;

async fn current_version(pool: &SqlitePool) -> StoreResult<i64> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
    )
    .execute(pool)
    .await?;
    let row = sqlx::query("SELECT version FROM schema_version LIMIT 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get::<i64, _>(0)).unwrap_or(0))
}

async fn stamp_version(pool: &SqlitePool, version: i64) -> StoreResult<()> {
    sqlx::query("DELETE FROM schema_version").execute(pool).await?;
    sqlx::query("INSERT INTO schema_version (version) VALUES (?1)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn migrate_jobs(pool: &SqlitePool) -> StoreResult<()> {
    let found = current_version(pool).await?;
    if found > JOBS_SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found,
            supported: JOBS_SCHEMA_VERSION,
        });
    }

    if found < 1 {
        for ddl in [
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                state TEXT NOT NULL,
                priority INTEGER NOT NULL,
                visibility TEXT NOT NULL,
                archived INTEGER NOT NULL DEFAULT 0,
                deleted_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                doc TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs (owner_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs (state)",
            "CREATE TABLE IF NOT EXISTS job_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                at INTEGER NOT NULL,
                kind TEXT NOT NULL,
                detail TEXT NOT NULL
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_job_events_seq ON job_events (job_id, seq)",
            "CREATE TABLE IF NOT EXISTS uploads (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                doc TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_uploads_owner ON uploads (owner_id)",
            "CREATE INDEX IF NOT EXISTS idx_uploads_expiry ON uploads (state, expires_at)",
            "CREATE TABLE IF NOT EXISTS quotas (
                user_id TEXT PRIMARY KEY,
                storage_bytes_used INTEGER NOT NULL DEFAULT 0,
                day TEXT NOT NULL,
                jobs_submitted_today INTEGER NOT NULL DEFAULT 0,
                processing_minutes_today INTEGER NOT NULL DEFAULT 0,
                concurrent_running INTEGER NOT NULL DEFAULT 0,
                uploads_inflight INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS leases (
                job_id TEXT PRIMARY KEY,
                consumer TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS outbox (
                job_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                updated_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS library (
                series_slug TEXT NOT NULL,
                season INTEGER NOT NULL,
                episode INTEGER NOT NULL,
                job_id TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (series_slug, season, episode)
            )",
            "CREATE TABLE IF NOT EXISTS job_log_positions (
                job_id TEXT PRIMARY KEY,
                lines INTEGER NOT NULL DEFAULT 0,
                bytes INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                at INTEGER NOT NULL,
                request_id TEXT NOT NULL,
                actor_id TEXT,
                action TEXT NOT NULL,
                target TEXT NOT NULL,
                outcome TEXT NOT NULL,
                meta TEXT NOT NULL
            )",
        ] {
            sqlx::query(ddl).execute(pool).await?;
        }
    }

    stamp_version(pool, JOBS_SCHEMA_VERSION).await
}

pub async fn migrate_auth(pool: &SqlitePool) -> StoreResult<()> {
    let found = current_version(pool).await?;
    if found > AUTH_SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found,
            supported: AUTH_SCHEMA_VERSION,
        });
    }

    if found < 1 {
        for ddl in [
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                login TEXT NOT NULL UNIQUE,
                role TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                totp_enabled INTEGER NOT NULL DEFAULT 0,
                totp_secret TEXT,
                created_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS invites (
                token TEXT PRIMARY KEY,
                created_by TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                redeemed_by TEXT,
                redeemed_at INTEGER
            )",
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                created_ip_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                revoked_at INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions (user_id)",
            "CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                prefix TEXT NOT NULL UNIQUE,
                secret_hash TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                scopes TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER,
                revoked_at INTEGER
            )",
            "CREATE TABLE IF NOT EXISTS pairing_codes (
                code TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                redeemed INTEGER NOT NULL DEFAULT 0
            )",
        ] {
            sqlx::query(ddl).execute(pool).await?;
        }
    }

    stamp_version(pool, AUTH_SCHEMA_VERSION).await
}
