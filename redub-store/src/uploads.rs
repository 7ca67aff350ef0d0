use chrono::Utc;
use sqlx::Row;

use redub_core::{UploadId, UserId};

use crate::db::MetaStore;
use crate::error::{StoreError, StoreResult};
use crate::model::upload::{UploadRecord, UploadState};
use crate::time::to_millis;

impl MetaStore {
    pub async fn put_upload(&self, upload: &UploadRecord) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.jobs_db.begin().await?;
        upsert_upload_row(&mut tx, upload).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_upload(&self, id: &UploadId) -> StoreResult<UploadRecord> {
        let row = sqlx::query("SELECT doc FROM uploads WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.jobs_db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))?;
        let doc: String = row.get("doc");
        Ok(serde_json::from_str(&doc)?)
    }

    /// Load, mutate and persist an upload session under the writer lock.
    pub async fn update_upload<F>(&self, id: &UploadId, mutator: F) -> StoreResult<UploadRecord>
    where
        F: FnOnce(&mut UploadRecord) -> Result<(), String>,
    {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.jobs_db.begin().await?;

        let row = sqlx::query("SELECT doc FROM uploads WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))?;
        let doc: String = row.get("doc");
        let mut upload: UploadRecord = serde_json::from_str(&doc)?;

        mutator(&mut upload).map_err(StoreError::Conflict)?;

        upsert_upload_row(&mut tx, &upload).await?;
        tx.commit().await?;
        Ok(upload)
    }

    /// Open sessions for one user, for the inflight-uploads quota check.
    pub async fn count_open_uploads(&self, owner: &UserId) -> StoreResult<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM uploads WHERE owner_id = ?1 AND state = 'open'",
        )
        .bind(owner.as_str())
        .fetch_one(&self.jobs_db)
        .await?;
        Ok(row.get::<i64, _>("n").max(0) as u64)
    }

    /// Sessions whose deadline has passed, for the abandonment sweeper.
    pub async fn expired_uploads(&self, now: chrono::DateTime<Utc>) -> StoreResult<Vec<UploadRecord>> {
        let rows = sqlx::query(
            "SELECT doc FROM uploads WHERE state = 'open' AND expires_at < ?1",
        )
        .bind(to_millis(now))
        .fetch_all(&self.jobs_db)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let doc: String = row.get("doc");
            out.push(serde_json::from_str(&doc)?);
        }
        Ok(out)
    }
}

async fn upsert_upload_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    upload: &UploadRecord,
) -> StoreResult<()> {
    let doc = serde_json::to_string(upload)?;
    sqlx::query(
        "INSERT INTO uploads (id, owner_id, state, created_at, expires_at, doc)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
             state = excluded.state,
             expires_at = excluded.expires_at,
             doc = excluded.doc",
    )
    .bind(upload.id.as_str())
    .bind(upload.owner_id.as_str())
    .bind(upload.state.name())
    .bind(to_millis(upload.created_at))
    .bind(to_millis(upload.expires_at))
    .bind(doc)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
