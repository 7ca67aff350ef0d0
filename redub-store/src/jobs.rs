use chrono::Utc;
use sqlx::{QueryBuilder, Row, Sqlite};

use redub_core::JobId;

use crate::db::MetaStore;
use crate::error::{StoreError, StoreResult};
use crate::model::job::{JobFilter, JobPage, JobRecord, JobState, TimelineEntry};
use crate::time::{from_millis, to_millis};

impl MetaStore {
    /// Insert a newly submitted job together with its pending outbox row,
    /// in one transaction. This is the durable-submit path: even if the
    /// dispatch backend is down, the job exists and the flusher will route
    /// it once a backend is available.
    pub async fn create_job(&self, job: &JobRecord) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.jobs_db.begin().await?;

        insert_job_row(&mut tx, job).await?;
        sqlx::query(
            "INSERT INTO outbox (job_id, state, attempts, last_error, updated_at)
             VALUES (?1, 'pending', 0, NULL, ?2)",
        )
        .bind(job.id.as_str())
        .bind(to_millis(Utc::now()))
        .execute(&mut *tx)
        .await?;

        append_timeline_tx(&mut tx, &job.id, "submitted", serde_json::json!({
            "priority": job.priority,
        }))
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Upsert a job record without touching the outbox.
    pub async fn put_job(&self, job: &JobRecord) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.jobs_db.begin().await?;
        insert_job_row(&mut tx, job).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_job(&self, id: &JobId) -> StoreResult<JobRecord> {
        let row = sqlx::query("SELECT doc FROM jobs WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.jobs_db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        let doc: String = row.get("doc");
        Ok(serde_json::from_str(&doc)?)
    }

    /// Load, mutate and persist a job under the writer lock.
    ///
    /// When `expected_state` is given the update is optimistic: a state
    /// observed different from the expectation fails with `StateMismatch`
    /// and nothing is written. The mutator may veto with an error string,
    /// which surfaces as `Conflict`.
    pub async fn update_job<F>(
        &self,
        id: &JobId,
        expected_state: Option<JobState>,
        mutator: F,
    ) -> StoreResult<JobRecord>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), String>,
    {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.jobs_db.begin().await?;

        let row = sqlx::query("SELECT doc FROM jobs WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        let doc: String = row.get("doc");
        let mut job: JobRecord = serde_json::from_str(&doc)?;

        if let Some(expected) = expected_state {
            if job.state != expected {
                return Err(StoreError::StateMismatch {
                    expected: expected.to_string(),
                    actual: job.state.to_string(),
                });
            }
        }

        let before = job.state;
        mutator(&mut job).map_err(StoreError::Conflict)?;
        job.updated_at = Utc::now();

        insert_job_row(&mut tx, &job).await?;

        if job.state != before {
            append_timeline_tx(&mut tx, id, "state", serde_json::json!({
                "from": before,
                "to": job.state,
            }))
            .await?;
        }

        tx.commit().await?;
        Ok(job)
    }

    /// Page through jobs matching `filter`, newest first.
    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        limit: u32,
        offset: u32,
    ) -> StoreResult<JobPage> {
        let mut qb = select_jobs(filter, "SELECT doc FROM jobs WHERE 1=1");
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);

        let rows = qb.build().fetch_all(&self.jobs_db).await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let doc: String = row.get("doc");
            jobs.push(serde_json::from_str(&doc)?);
        }

        let mut count_qb = select_jobs(filter, "SELECT COUNT(*) AS n FROM jobs WHERE 1=1");
        let total: i64 = count_qb
            .build()
            .fetch_one(&self.jobs_db)
            .await?
            .get("n");

        Ok(JobPage {
            jobs,
            total: total.max(0) as u64,
        })
    }

    /// Append a timeline entry outside of a job mutation (scheduler
    /// decisions, dispatch transitions).
    pub async fn append_timeline(
        &self,
        id: &JobId,
        kind: &str,
        detail: serde_json::Value,
    ) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.jobs_db.begin().await?;
        append_timeline_tx(&mut tx, id, kind, detail).await?;
        tx.commit().await?;
        Ok(())
    }

    /// The persisted timeline of a job, oldest first.
    pub async fn timeline(&self, id: &JobId) -> StoreResult<Vec<TimelineEntry>> {
        let rows = sqlx::query(
            "SELECT seq, at, kind, detail FROM job_events WHERE job_id = ?1 ORDER BY seq ASC",
        )
        .bind(id.as_str())
        .fetch_all(&self.jobs_db)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(TimelineEntry {
                seq: row.get("seq"),
                at: from_millis(row.get("at")),
                kind: row.get("kind"),
                detail: serde_json::from_str(row.get::<String, _>("detail").as_str())
                    .unwrap_or(serde_json::Value::Null),
            });
        }
        Ok(out)
    }

    /// Jobs currently in `Queued` state, used by boot-time requeue sweeps.
    pub async fn queued_job_ids(&self) -> StoreResult<Vec<JobId>> {
        let rows = sqlx::query("SELECT id FROM jobs WHERE state = 'QUEUED' AND deleted_at IS NULL")
            .fetch_all(&self.jobs_db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| JobId::from_string(r.get("id")))
            .collect())
    }

    /// Jobs stuck in `Running`, candidates for interrupted-run recovery.
    pub async fn running_job_ids(&self) -> StoreResult<Vec<JobId>> {
        let rows =
            sqlx::query("SELECT id FROM jobs WHERE state = 'RUNNING' AND deleted_at IS NULL")
                .fetch_all(&self.jobs_db)
                .await?;
        Ok(rows
            .into_iter()
            .map(|r| JobId::from_string(r.get("id")))
            .collect())
    }
}

fn select_jobs<'a>(filter: &'a JobFilter, base: &str) -> QueryBuilder<'a, Sqlite> {
    let mut qb = QueryBuilder::new(base);
    qb.push(" AND deleted_at IS NULL");
    if !filter.include_archived {
        qb.push(" AND archived = 0");
    }
    if let Some(state) = filter.state {
        qb.push(" AND state = ").push_bind(state.name());
    }
    if let Some(owner) = &filter.owner_id {
        if filter.include_shared {
            qb.push(" AND (owner_id = ")
                .push_bind(owner.as_str())
                .push(" OR visibility = 'shared')");
        } else {
            qb.push(" AND owner_id = ").push_bind(owner.as_str());
        }
    }
    qb
}

async fn insert_job_row(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    job: &JobRecord,
) -> StoreResult<()> {
    let doc = serde_json::to_string(job)?;
    sqlx::query(
        "INSERT INTO jobs (id, owner_id, state, priority, visibility, archived,
                           deleted_at, created_at, updated_at, doc)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
             owner_id = excluded.owner_id,
             state = excluded.state,
             priority = excluded.priority,
             visibility = excluded.visibility,
             archived = excluded.archived,
             deleted_at = excluded.deleted_at,
             updated_at = excluded.updated_at,
             doc = excluded.doc",
    )
    .bind(job.id.as_str())
    .bind(job.owner_id.as_str())
    .bind(job.state.name())
    .bind(job.priority.as_u8() as i64)
    .bind(match job.visibility {
        crate::model::job::Visibility::Private => "private",
        crate::model::job::Visibility::Shared => "shared",
    })
    .bind(job.archived as i64)
    .bind(job.deleted_at.map(to_millis))
    .bind(to_millis(job.created_at))
    .bind(to_millis(job.updated_at))
    .bind(doc)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn append_timeline_tx(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    id: &JobId,
    kind: &str,
    detail: serde_json::Value,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO job_events (job_id, seq, at, kind, detail)
         VALUES (?1,
                 (SELECT COALESCE(MAX(seq), 0) + 1 FROM job_events WHERE job_id = ?1),
                 ?2, ?3, ?4)",
    )
    .bind(id.as_str())
    .bind(to_millis(Utc::now()))
    .bind(kind)
    .bind(detail.to_string())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::job::{InputRef, Visibility};
    use redub_core::UserId;

    async fn open_store() -> (tempfile::TempDir, MetaStore) {
        std::env::set_var("REDUB_ALLOW_UNSAFE_STATE_DIR", "1");
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(&dir.path().join("state"), &dir.path().join("logs"))
            .await
            .unwrap();
        (dir, store)
    }

    fn new_job(owner: &UserId) -> JobRecord {
        JobRecord::new(
            owner.clone(),
            InputRef::Path {
                path: "/data/in.mkv".into(),
            },
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn create_get_round_trip_with_outbox() {
        let (_dir, store) = open_store().await;
        let job = new_job(&UserId::new());
        store.create_job(&job).await.unwrap();

        let loaded = store.get_job(&job.id).await.unwrap();
        assert_eq!(loaded.state, JobState::Queued);

        let pending = store.pending_outbox(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_id, job.id);
    }

    #[tokio::test]
    async fn update_with_expected_state_rejects_mismatch() {
        let (_dir, store) = open_store().await;
        let job = new_job(&UserId::new());
        store.create_job(&job).await.unwrap();

        store
            .update_job(&job.id, Some(JobState::Queued), |j| {
                j.transition(JobState::Running)
            })
            .await
            .unwrap();

        let err = store
            .update_job(&job.id, Some(JobState::Queued), |j| {
                j.transition(JobState::Running)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StateMismatch { .. }));
    }

    #[tokio::test]
    async fn listing_excludes_other_owners_private_jobs() {
        let (_dir, store) = open_store().await;
        let alice = UserId::new();
        let bob = UserId::new();

        let private_job = new_job(&alice);
        store.create_job(&private_job).await.unwrap();

        let mut shared_job = new_job(&alice);
        shared_job.visibility = Visibility::Shared;
        store.create_job(&shared_job).await.unwrap();

        let page = store
            .list_jobs(
                &JobFilter {
                    owner_id: Some(bob.clone()),
                    include_shared: true,
                    ..Default::default()
                },
                50,
                0,
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.jobs[0].id, shared_job.id);

        let page = store
            .list_jobs(
                &JobFilter {
                    owner_id: Some(bob),
                    include_shared: false,
                    ..Default::default()
                },
                50,
                0,
            )
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn state_changes_append_to_the_timeline() {
        let (_dir, store) = open_store().await;
        let job = new_job(&UserId::new());
        store.create_job(&job).await.unwrap();
        store
            .update_job(&job.id, None, |j| j.transition(JobState::Running))
            .await
            .unwrap();
        store
            .update_job(&job.id, None, |j| j.transition(JobState::Done))
            .await
            .unwrap();

        let timeline = store.timeline(&job.id).await.unwrap();
        let kinds: Vec<_> = timeline.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["submitted", "state", "state"]);
        assert_eq!(timeline.last().unwrap().seq, 3);
    }
}
