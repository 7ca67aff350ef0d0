//! Durability conformance: everything the store owns survives a close
//! and reopen of the process.

use std::time::Duration;

use redub_core::{ConsumerId, Role, Scope, UserId};
use redub_store::{InputRef, JobRecord, JobState, LeaseOutcome, MetaStore, UploadRecord};

#[tokio::test]
async fn records_survive_reopen() {
    std::env::set_var("REDUB_ALLOW_UNSAFE_STATE_DIR", "1");
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state");
    let logs = dir.path().join("logs");

    let job_id;
    let upload_id;
    let user_id;
    let consumer = ConsumerId::new("instance-a");

    {
        let store = MetaStore::open(&state, &logs).await.unwrap();

        let user = store.create_user("keeper", "pw-longish", Role::Editor).await.unwrap();
        user_id = user.id.clone();

        let mut job = JobRecord::new(
            user.id.clone(),
            InputRef::Path {
                path: "/data/in.mkv".into(),
            },
            serde_json::json!({"voice": "warm"}),
        );
        job.transition(JobState::Running).unwrap();
        job.advance_progress(0.4, "transcribe");
        store.put_job(&job).await.unwrap();
        job_id = job.id.clone();

        let mut upload = UploadRecord::new(
            user.id.clone(),
            "in.mkv".into(),
            1024,
            512,
            chrono::Duration::hours(1),
        );
        upload.set_chunk(0, 512);
        store.put_upload(&upload).await.unwrap();
        upload_id = upload.id.clone();

        store
            .acquire_lease(&job.id, &consumer, Duration::from_secs(3600))
            .await
            .unwrap();
        store.append_log(&job.id, "transcribe step 1").await.unwrap();

        store
            .update_quota(&user.id, |q| {
                q.storage_bytes_used = 1024;
                Ok(())
            })
            .await
            .unwrap();

        store.close().await;
    }

    let store = MetaStore::open(&state, &logs).await.unwrap();

    let job = store.get_job(&job_id).await.unwrap();
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.progress, 0.4);
    assert_eq!(job.runtime["voice"], "warm");

    let upload = store.get_upload(&upload_id).await.unwrap();
    assert!(upload.has_chunk(0));
    assert_eq!(upload.received_bytes, 512);

    let user = store.get_user(&user_id).await.unwrap();
    assert_eq!(user.role, Role::Editor);

    // The lease is still held across the restart.
    let other = ConsumerId::new("instance-b");
    let outcome = store
        .acquire_lease(&job_id, &other, Duration::from_secs(60))
        .await
        .unwrap();
    assert!(matches!(outcome, LeaseOutcome::HeldByOther { .. }));

    let tail = store.tail_log(&job_id, 10).await.unwrap();
    assert_eq!(tail, vec!["transcribe step 1".to_string()]);

    assert_eq!(store.quota(&user_id).await.unwrap().storage_bytes_used, 1024);

    store.close().await;
}

#[tokio::test]
async fn api_key_scopes_round_trip_through_reopen() {
    std::env::set_var("REDUB_ALLOW_UNSAFE_STATE_DIR", "1");
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state");
    let logs = dir.path().join("logs");

    let prefix;
    {
        let store = MetaStore::open(&state, &logs).await.unwrap();
        let owner = store.create_user("ops", "pw-longish", Role::Operator).await.unwrap();
        let (record, plaintext) = store
            .create_api_key(
                &owner.id,
                vec![Scope::new("read:job"), Scope::new("submit:job")],
                None,
            )
            .await
            .unwrap();
        prefix = record.prefix.clone();
        assert!(plaintext.starts_with(&prefix));
        store.close().await;
    }

    let store = MetaStore::open(&state, &logs).await.unwrap();
    let key = store.find_api_key_by_prefix(&prefix).await.unwrap();
    assert_eq!(key.scopes.len(), 2);
    assert!(key.scopes.iter().any(|s| s.allows("submit:job")));
    store.close().await;
}

#[tokio::test]
async fn quota_day_window_rolls() {
    std::env::set_var("REDUB_ALLOW_UNSAFE_STATE_DIR", "1");
    let dir = tempfile::tempdir().unwrap();
    let store = MetaStore::open(&dir.path().join("state"), &dir.path().join("logs"))
        .await
        .unwrap();

    let user = UserId::new();
    store
        .update_quota(&user, |q| {
            // Pretend these counters were written yesterday.
            q.day = "2000-01-01".into();
            q.jobs_submitted_today = 9;
            q.processing_minutes_today = 480;
            q.storage_bytes_used = 2048;
            Ok(())
        })
        .await
        .unwrap();

    let rolled = store.quota(&user).await.unwrap();
    assert_eq!(rolled.jobs_submitted_today, 0);
    assert_eq!(rolled.processing_minutes_today, 0);
    // Non-daily counters are untouched by the roll.
    assert_eq!(rolled.storage_bytes_used, 2048);

    store.close().await;
}
