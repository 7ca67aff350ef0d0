use chrono::Utc;
use sqlx::Row;

use redub_core::UserId;

use crate::db::MetaStore;
use crate::error::StoreResult;
use crate::model::quota::QuotaSnapshot;
use crate::time::utc_day;

impl MetaStore {
    /// Current counters for a user, with the daily window rolled to today.
    pub async fn quota(&self, user: &UserId) -> StoreResult<QuotaSnapshot> {
        let today = utc_day(Utc::now());
        let row = sqlx::query("SELECT * FROM quotas WHERE user_id = ?1")
            .bind(user.as_str())
            .fetch_optional(&self.jobs_db)
            .await?;

        let mut snapshot = match row {
            Some(row) => QuotaSnapshot {
                user_id: user.clone(),
                storage_bytes_used: row.get::<i64, _>("storage_bytes_used").max(0) as u64,
                day: row.get("day"),
                jobs_submitted_today: row.get::<i64, _>("jobs_submitted_today").max(0) as u64,
                processing_minutes_today: row
                    .get::<i64, _>("processing_minutes_today")
                    .max(0) as u64,
                concurrent_running: row.get::<i64, _>("concurrent_running").max(0) as u64,
                uploads_inflight: row.get::<i64, _>("uploads_inflight").max(0) as u64,
            },
            None => QuotaSnapshot::empty(user.clone(), today.clone()),
        };
        snapshot.roll_day(&today);
        Ok(snapshot)
    }

    /// Mutate a user's counters under the writer lock. The mutator sees
    /// counters with the daily window already rolled; vetoing with an
    /// error string surfaces as `Conflict` and writes nothing.
    ///
    /// This is the linearization point for quota enforcement: concurrent
    /// submissions serialize here, so a check-and-increment in the mutator
    /// cannot race past the cap.
    pub async fn update_quota<F>(&self, user: &UserId, mutator: F) -> StoreResult<QuotaSnapshot>
    where
        F: FnOnce(&mut QuotaSnapshot) -> Result<(), String>,
    {
        let _guard = self.write_lock.lock().await;
        let today = utc_day(Utc::now());

        let mut tx = self.jobs_db.begin().await?;
        let row = sqlx::query("SELECT * FROM quotas WHERE user_id = ?1")
            .bind(user.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        let mut snapshot = match row {
            Some(row) => QuotaSnapshot {
                user_id: user.clone(),
                storage_bytes_used: row.get::<i64, _>("storage_bytes_used").max(0) as u64,
                day: row.get("day"),
                jobs_submitted_today: row.get::<i64, _>("jobs_submitted_today").max(0) as u64,
                processing_minutes_today: row
                    .get::<i64, _>("processing_minutes_today")
                    .max(0) as u64,
                concurrent_running: row.get::<i64, _>("concurrent_running").max(0) as u64,
                uploads_inflight: row.get::<i64, _>("uploads_inflight").max(0) as u64,
            },
            None => QuotaSnapshot::empty(user.clone(), today.clone()),
        };
        snapshot.roll_day(&today);

        mutator(&mut snapshot).map_err(crate::error::StoreError::Conflict)?;

        sqlx::query(
            "INSERT INTO quotas (user_id, storage_bytes_used, day, jobs_submitted_today,
                                 processing_minutes_today, concurrent_running, uploads_inflight)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id) DO UPDATE SET
                 storage_bytes_used = excluded.storage_bytes_used,
                 day = excluded.day,
                 jobs_submitted_today = excluded.jobs_submitted_today,
                 processing_minutes_today = excluded.processing_minutes_today,
                 concurrent_running = excluded.concurrent_running,
                 uploads_inflight = excluded.uploads_inflight",
        )
        .bind(user.as_str())
        .bind(snapshot.storage_bytes_used as i64)
        .bind(&snapshot.day)
        .bind(snapshot.jobs_submitted_today as i64)
        .bind(snapshot.processing_minutes_today as i64)
        .bind(snapshot.concurrent_running as i64)
        .bind(snapshot.uploads_inflight as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(snapshot)
    }

    /// All quota rows, for admin reports.
    pub async fn all_quotas(&self) -> StoreResult<Vec<QuotaSnapshot>> {
        let rows = sqlx::query("SELECT * FROM quotas ORDER BY user_id")
            .fetch_all(&self.jobs_db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| QuotaSnapshot {
                user_id: UserId::from_string(row.get("user_id")),
                storage_bytes_used: row.get::<i64, _>("storage_bytes_used").max(0) as u64,
                day: row.get("day"),
                jobs_submitted_today: row.get::<i64, _>("jobs_submitted_today").max(0) as u64,
                processing_minutes_today: row
                    .get::<i64, _>("processing_minutes_today")
                    .max(0) as u64,
                concurrent_running: row.get::<i64, _>("concurrent_running").max(0) as u64,
                uploads_inflight: row.get::<i64, _>("uploads_inflight").max(0) as u64,
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
    async fn counters_persist_and_veto_rolls_back() {
        let (_dir, store) = open_store().await;
        let user = UserId::new();

        store
            .update_quota(&user, |q| {
                q.concurrent_running += 1;
                q.jobs_submitted_today += 1;
                Ok(())
            })
            .await
            .unwrap();

        let err = store
            .update_quota(&user, |q| {
                if q.concurrent_running >= 1 {
                    return Err("concurrent_jobs_limit".into());
                }
                q.concurrent_running += 1;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("concurrent_jobs_limit"));

        let snapshot = store.quota(&user).await.unwrap();
        assert_eq!(snapshot.concurrent_running, 1);
        assert_eq!(snapshot.jobs_submitted_today, 1);
    }

    #[tokio::test]
    async fn concurrent_increments_serialize_under_the_cap() {
        let (_dir, store) = open_store().await;
        let store = std::sync::Arc::new(store);
        let user = UserId::new();
        let cap = 1u64;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let user = user.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_quota(&user, |q| {
                        if q.concurrent_running >= cap {
                            return Err("concurrent_jobs_limit".into());
                        }
                        q.concurrent_running += 1;
                        Ok(())
                    })
                    .await
                    .is_ok()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(store.quota(&user).await.unwrap().concurrent_running, 1);
    }
}
