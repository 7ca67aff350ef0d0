//! API conformance against the full in-process stack: real store,
//! scheduler, workers (deterministic stages), dispatch plane and event
//! hub, driven through the router with `tower::ServiceExt`.

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use redub_core::{Config, Role};
use redub_engine::stage::fake::FakeStage;
use redub_server::lifecycle::{self, Lifecycle};
use redub_server::{build_router, AppState};

struct TestApp {
    _dir: tempfile::TempDir,
    router: Router,
    state: AppState,
    lifecycle: Option<Lifecycle>,
}

impl TestApp {
    async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    async fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        std::env::set_var("REDUB_ALLOW_UNSAFE_STATE_DIR", "1");
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::dev_defaults(dir.path());
        tweak(&mut config);

        let lifecycle = lifecycle::boot(config, FakeStage::standard_pipeline())
            .await
            .unwrap();
        let state = lifecycle.state.clone();
        let router = build_router(state.clone());

        Self {
            _dir: dir,
            router,
            state,
            lifecycle: Some(lifecycle),
        }
    }

    /// Create a user and return `(user_id, bearer token)`.
    async fn user(&self, login: &str, role: Role) -> (redub_core::UserId, String) {
        let user = self
            .state
            .meta
            .create_user(login, "password-123", role)
            .await
            .unwrap();
        let token = self.state.resolver.issue_bearer(&user.id, None).unwrap();
        (user.id, token)
    }

    async fn request(
        &self,
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let response = self.raw(method, uri, bearer, body, &[]).await;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn raw(
        &self,
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<Value>,
        extra_headers: &[(&str, &str)],
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        for (name, value) in extra_headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(value) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.router.clone().oneshot(request).await.unwrap()
    }

    async fn put_chunk(
        &self,
        token: &str,
        upload_id: &str,
        index: u64,
        offset: u64,
        bytes: Vec<u8>,
    ) -> StatusCode {
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!(
                "/api/uploads/{upload_id}/chunk?index={index}&offset={offset}"
            ))
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(bytes))
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap().status()
    }

    async fn wait_job_state(&self, id: &str, wanted: &str, timeout: Duration) -> Value {
        let job_id = redub_core::JobId::from(id);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.state.meta.get_job(&job_id).await.unwrap();
            if job.state.name() == wanted {
                return serde_json::to_value(&job).unwrap();
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {id} stuck in {} waiting for {wanted}",
                job.state
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn stop(mut self) {
        if let Some(lifecycle) = self.lifecycle.take() {
            lifecycle.shutdown(Duration::from_secs(5)).await;
        }
    }
}

/// S1: resumable upload, four chunks, complete, submit, job reaches DONE.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_submit_complete_cycle() {
    let app = TestApp::new().await;
    let (_user, token) = app.user("uploader", Role::Operator).await;

    let (status, init) = app
        .request(
            Method::POST,
            "/api/uploads/init",
            Some(&token),
            Some(json!({
                "filename": "feature.mkv",
                "total_bytes": 1_048_576,
                "chunk_bytes": 262_144,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let upload_id = init["upload_id"].as_str().unwrap().to_string();
    assert_eq!(init["expected_chunks"], 4);

    for i in 0u64..4 {
        let status = app
            .put_chunk(&token, &upload_id, i, i * 262_144, vec![i as u8; 262_144])
            .await;
        assert_eq!(status, StatusCode::OK, "chunk {i}");
    }

    let (status, complete) = app
        .request(
            Method::POST,
            &format!("/api/uploads/{upload_id}/complete"),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(complete["state"], "complete");
    assert!(complete["final_hash"].as_str().unwrap().len() == 64);

    let (status, submitted) = app
        .request(
            Method::POST,
            "/api/jobs",
            Some(&token),
            Some(json!({ "upload_id": upload_id })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(submitted["state"], "QUEUED");
    let job_id = submitted["id"].as_str().unwrap().to_string();

    let done = app
        .wait_job_state(&job_id, "DONE", Duration::from_secs(15))
        .await;
    assert_eq!(done["progress"], 1.0);

    app.stop().await;
}

/// S2: re-delivering a committed chunk with different bytes is a 409 with
/// the committed ranges; the stored bytes are untouched.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chunk_overlap_conflicts() {
    let app = TestApp::new().await;
    let (_user, token) = app.user("chunky", Role::Operator).await;

    let (_, init) = app
        .request(
            Method::POST,
            "/api/uploads/init",
            Some(&token),
            Some(json!({
                "filename": "feature.mkv",
                "total_bytes": 786_432,
                "chunk_bytes": 262_144,
            })),
        )
        .await;
    let upload_id = init["upload_id"].as_str().unwrap().to_string();

    assert_eq!(
        app.put_chunk(&token, &upload_id, 2, 524_288, vec![7u8; 262_144])
            .await,
        StatusCode::OK
    );
    // Identical re-delivery is an idempotent success.
    assert_eq!(
        app.put_chunk(&token, &upload_id, 2, 524_288, vec![7u8; 262_144])
            .await,
        StatusCode::OK
    );

    // Different bytes at the same index conflict.
    let status = app
        .put_chunk(&token, &upload_id, 2, 524_288, vec![9u8; 262_144])
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, upload_status) = app
        .request(
            Method::GET,
            &format!("/api/uploads/{upload_id}"),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(upload_status["received_bytes"], 262_144);

    app.stop().await;
}

/// S4: the second concurrent job for a capped user is a structured 429.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_quota_returns_structured_429() {
    let app = TestApp::new().await;
    let (user_id, token) = app.user("busy", Role::Operator).await;

    // Simulate one running job.
    app.state
        .meta
        .update_quota(&user_id, |q| {
            q.concurrent_running = 1;
            Ok(())
        })
        .await
        .unwrap();

    let input = app._dir.path().join("local.mkv");
    std::fs::write(&input, b"x").unwrap();

    let (status, body) = app
        .request(
            Method::POST,
            "/api/jobs",
            Some(&token),
            Some(json!({ "input_path": input.to_string_lossy() })),
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "quota_exceeded");
    assert_eq!(body["reason"], "concurrent_jobs_limit");
    assert_eq!(body["limit"], 1);
    assert_eq!(body["current"], 1);

    app.stop().await;
}

/// S6: nothing of user A's private work is visible to user B.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cross_user_isolation() {
    let app = TestApp::new().await;
    let (_alice_id, alice) = app.user("alice", Role::Operator).await;
    let (_bob_id, bob) = app.user("bob", Role::Operator).await;

    let input = app._dir.path().join("alice.mkv");
    std::fs::write(&input, b"alices video").unwrap();
    let (status, submitted) = app
        .request(
            Method::POST,
            "/api/jobs",
            Some(&alice),
            Some(json!({ "input_path": input.to_string_lossy() })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = submitted["id"].as_str().unwrap().to_string();
    app.wait_job_state(&job_id, "DONE", Duration::from_secs(15))
        .await;

    // Direct read: 403.
    let (status, _) = app
        .request(Method::GET, &format!("/api/jobs/{job_id}"), Some(&bob), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Listing: excluded.
    let (_, listing) = app
        .request(Method::GET, "/api/jobs", Some(&bob), None)
        .await;
    assert!(listing["jobs"].as_array().unwrap().is_empty());

    // File access: 403 through the files surface.
    let work_dir = app
        .state
        .layout
        .resolve(&redub_core::JobId::from(job_id.as_str()))
        .await
        .unwrap()
        .unwrap();
    let stem = work_dir.file_name().unwrap().to_string_lossy().to_string();
    let (status, _) = app
        .request(
            Method::GET,
            &format!("/files/{stem}/mux.out"),
            Some(&bob),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // The owner reads the same file fine.
    let (status, _) = app
        .request(
            Method::GET,
            &format!("/files/{stem}/mux.out"),
            Some(&alice),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    app.stop().await;
}

/// Property 7: a served range is byte-exact with correct headers.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn range_requests_are_byte_exact() {
    let app = TestApp::new().await;
    let (_user, token) = app.user("ranger", Role::Operator).await;

    let input = app._dir.path().join("media.mkv");
    std::fs::write(&input, b"y").unwrap();
    let (_, submitted) = app
        .request(
            Method::POST,
            "/api/jobs",
            Some(&token),
            Some(json!({ "input_path": input.to_string_lossy() })),
        )
        .await;
    let job_id = submitted["id"].as_str().unwrap().to_string();
    app.wait_job_state(&job_id, "DONE", Duration::from_secs(15))
        .await;

    let work_dir = app
        .state
        .layout
        .resolve(&redub_core::JobId::from(job_id.as_str()))
        .await
        .unwrap()
        .unwrap();
    let full = std::fs::read(work_dir.join("mux.out")).unwrap();
    let stem = work_dir.file_name().unwrap().to_string_lossy().to_string();

    let response = app
        .raw(
            Method::GET,
            &format!("/files/{stem}/mux.out"),
            Some(&token),
            None,
            &[("range", "bytes=2-5")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE],
        format!("bytes 2-5/{}", full.len())
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], &full[2..6]);

    // Unsatisfiable start offset.
    let response = app
        .raw(
            Method::GET,
            &format!("/files/{stem}/mux.out"),
            Some(&token),
            None,
            &[("range", &format!("bytes={}-", full.len()))],
        )
        .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);

    app.stop().await;
}

/// Property 8: cookie sessions need the CSRF pair on mutations; bearer
/// does not.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn csrf_applies_to_cookie_sessions_only() {
    let app = TestApp::new().await;
    app.user("webuser", Role::Operator).await;

    // Login to obtain session + CSRF cookies.
    let response = app
        .raw(
            Method::POST,
            "/auth/login",
            None,
            Some(json!({ "login": "webuser", "password": "password-123" })),
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let cookies: Vec<String> = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or_default().to_string())
        .collect();
    let cookie_header = cookies.join("; ");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let login_body: Value = serde_json::from_slice(&bytes).unwrap();
    let csrf = login_body["csrf"].as_str().unwrap().to_string();
    let bearer = login_body["token"].as_str().unwrap().to_string();

    let input = app._dir.path().join("csrf.mkv");
    std::fs::write(&input, b"z").unwrap();
    let submit_body = json!({ "input_path": input.to_string_lossy() });

    // Cookie auth without the CSRF header: 403.
    let response = app
        .raw(
            Method::POST,
            "/api/jobs",
            None,
            Some(submit_body.clone()),
            &[("cookie", &cookie_header)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Cookie auth with the matching header: accepted.
    let response = app
        .raw(
            Method::POST,
            "/api/jobs",
            None,
            Some(submit_body.clone()),
            &[("cookie", &cookie_header), ("x-csrf-token", &csrf)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // Bearer auth never needs CSRF. (GET is always exempt too.)
    let response = app
        .raw(Method::GET, "/api/jobs", Some(&bearer), None, &[])
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    app.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invites_are_one_shot_and_signup_is_404() {
    let app = TestApp::new().await;
    let (_admin_id, admin) = app.user("root", Role::Admin).await;

    let (status, invite) = app
        .request(Method::POST, "/api/admin/invites", Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let token = invite["token"].as_str().unwrap().to_string();

    let (status, redeemed) = app
        .request(
            Method::POST,
            "/api/invites/redeem",
            None,
            Some(json!({ "token": token, "login": "invitee", "password": "longenough" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(redeemed["user"]["role"], "viewer");

    // Second redemption of the same token: conflict.
    let (status, _) = app
        .request(
            Method::POST,
            "/api/invites/redeem",
            None,
            Some(json!({ "token": token, "login": "second", "password": "longenough" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Self-registration is not served.
    let (status, _) = app
        .request(
            Method::POST,
            "/auth/register",
            None,
            Some(json!({ "login": "walkin", "password": "longenough" })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    app.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn anonymous_requests_are_401() {
    let app = TestApp::new().await;
    let (status, _) = app.request(Method::GET, "/api/jobs", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    app.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn viewer_cannot_submit_jobs() {
    let app = TestApp::new().await;
    let (_user, token) = app.user("watcher", Role::Viewer).await;
    let (status, _) = app
        .request(
            Method::POST,
            "/api/jobs",
            Some(&token),
            Some(json!({ "input_path": "/nonexistent" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    app.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn draining_refuses_submissions_with_retry_after() {
    let app = TestApp::new().await;
    let (_user, token) = app.user("late", Role::Operator).await;

    app.state
        .draining
        .store(true, std::sync::atomic::Ordering::Release);

    let response = app
        .raw(
            Method::POST,
            "/api/uploads/init",
            Some(&token),
            Some(json!({ "filename": "x.mkv", "total_bytes": 1024 })),
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key(header::RETRY_AFTER));

    app.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_of_queued_job_settles_immediately() {
    let app = TestApp::new().await;
    let (user_id, token) = app.user("canceler", Role::Operator).await;

    // A dispatch eligibility far in the future keeps the job queued, so
    // the cancel is exercised on the pre-claim path.
    let mut job = redub_store::JobRecord::new(
        user_id,
        redub_store::InputRef::Path { path: "/nope".into() },
        json!({}),
    );
    job.dispatch_after = Some(chrono::Utc::now() + chrono::Duration::hours(1));
    app.state.meta.create_job(&job).await.unwrap();

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/jobs/{}/cancel", job.id),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["state"], "CANCELED");

    app.stop().await;
}
