use chrono::Utc;
use sqlx::Row;

use redub_core::JobId;

use crate::db::MetaStore;
use crate::error::StoreResult;
use crate::model::job::LibraryKey;
use crate::time::to_millis;

/// A denormalized library row: the latest completed job for a
/// `(series, season, episode)` coordinate.
#[derive(Debug, Clone)]
pub struct LibraryEntry {
    pub key: LibraryKey,
    pub job_id: JobId,
    pub updated_at: chrono::DateTime<Utc>,
}

impl MetaStore {
    /// Point a library coordinate at `job_id`. Last completion wins.
    pub async fn upsert_library_entry(&self, key: &LibraryKey, job_id: &JobId) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO library (series_slug, season, episode, job_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(series_slug, season, episode) DO UPDATE SET
                 job_id = excluded.job_id,
                 updated_at = excluded.updated_at",
        )
        .bind(&key.series_slug)
        .bind(key.season as i64)
        .bind(key.episode as i64)
        .bind(job_id.as_str())
        .bind(to_millis(Utc::now()))
        .execute(&self.jobs_db)
        .await?;
        Ok(())
    }

    pub async fn library_entry(&self, key: &LibraryKey) -> StoreResult<Option<LibraryEntry>> {
        let row = sqlx::query(
            "SELECT job_id, updated_at FROM library
             WHERE series_slug = ?1 AND season = ?2 AND episode = ?3",
        )
        .bind(&key.series_slug)
        .bind(key.season as i64)
        .bind(key.episode as i64)
        .fetch_optional(&self.jobs_db)
        .await?;

        Ok(row.map(|row| LibraryEntry {
            key: key.clone(),
            job_id: JobId::from_string(row.get("job_id")),
            updated_at: crate::time::from_millis(row.get("updated_at")),
        }))
    }

    pub async fn list_library(&self, series_slug: Option<&str>) -> StoreResult<Vec<LibraryEntry>> {
        let rows = match series_slug {
            Some(slug) => {
                sqlx::query(
                    "SELECT series_slug, season, episode, job_id, updated_at FROM library
                     WHERE series_slug = ?1 ORDER BY season, episode",
                )
                .bind(slug)
                .fetch_all(&self.jobs_db)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT series_slug, season, episode, job_id, updated_at FROM library
                     ORDER BY series_slug, season, episode",
                )
                .fetch_all(&self.jobs_db)
                .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|row| LibraryEntry {
                key: LibraryKey {
                    series_slug: row.get("series_slug"),
                    season: row.get::<i64, _>("season").max(0) as u32,
                    episode: row.get::<i64, _>("episode").max(0) as u32,
                },
                job_id: JobId::from_string(row.get("job_id")),
                updated_at: crate::time::from_millis(row.get("updated_at")),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store() -> (tempfile::TempDir, MetaStore) {
        std::env::set_var("REDUB_ALLOW_UNSAFE_STATE_DIR", "1");
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(&dir.path().join("state"), &dir.path().join("logs"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn last_completion_wins() {
        let (_dir, store) = open_store().await;
        let key = LibraryKey {
            series_slug: "signal-hill".into(),
            season: 2,
            episode: 5,
        };
        let first = JobId::new();
        let second = JobId::new();

        store.upsert_library_entry(&key, &first).await.unwrap();
        store.upsert_library_entry(&key, &second).await.unwrap();

        let entry = store.library_entry(&key).await.unwrap().unwrap();
        assert_eq!(entry.job_id, second);
        assert_eq!(store.list_library(Some("signal-hill")).await.unwrap().len(), 1);
    }
}
