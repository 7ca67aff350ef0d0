use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use redub_core::{JobId, Role, UploadId};
use redub_engine::stage::VOICE_CLONE_RERUN;
use redub_policy::EndpointClass;
use redub_store::{
    AuditEvent, AuditOutcome, InputRef, JobFilter, JobPriority, JobRecord, JobState, LibraryKey,
    UploadState, Visibility,
};

use crate::error::ApiError;
use crate::extract::{ReqId, RequireIdentity};
use crate::handlers::auth::require_role;
use crate::middleware::ClientIp;
use crate::AppState;

/// Client-facing view of a job.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: JobId,
    pub owner_id: redub_core::UserId,
    pub state: JobState,
    pub priority: JobPriority,
    pub visibility: Visibility,
    pub progress: f64,
    pub message: String,
    pub last_stage: Option<String>,
    pub last_error: Option<String>,
    pub library_key: Option<LibraryKey>,
    pub archived: bool,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

impl From<JobRecord> for JobResponse {
    fn from(job: JobRecord) -> Self {
        Self {
            id: job.id,
            owner_id: job.owner_id,
            state: job.state,
            priority: job.priority,
            visibility: job.visibility,
            progress: job.progress,
            message: job.message,
            last_stage: job.last_stage,
            last_error: job.last_error,
            library_key: job.library_key,
            archived: job.archived,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub upload_id: Option<String>,
    /// Server-local source path; operator role or better
    pub input_path: Option<String>,
    pub priority: Option<JobPriority>,
    pub visibility: Option<Visibility>,
    pub runtime: Option<serde_json::Value>,
    pub library_key: Option<LibraryKey>,
}

async fn build_job(
    state: &AppState,
    identity: &redub_core::Identity,
    body: &SubmitRequest,
) -> Result<JobRecord, ApiError> {
    let (input_ref, storage_delta) = match (&body.upload_id, &body.input_path) {
        (Some(upload_id), None) => {
            let upload_id = UploadId::from_string(upload_id.clone());
            let upload = state.uploads.get(&upload_id).await?;
            state.access.require_upload_access(identity, &upload)?;
            if upload.state != UploadState::Complete {
                return Err(ApiError::conflict(format!(
                    "upload {} is {}, expected complete",
                    upload_id, upload.state
                )));
            }
            (
                InputRef::Upload { upload_id },
                upload.total_bytes as i64,
            )
        }
        (None, Some(path)) => {
            // Local paths bypass the upload quota surface entirely, so
            // they stay an operator capability.
            require_role(identity, Role::Operator)?;
            if !std::path::Path::new(path).is_file() {
                return Err(ApiError::validation(format!("input path not found: {path}")));
            }
            (InputRef::Path { path: path.clone() }, 0)
        }
        _ => {
            return Err(ApiError::validation(
                "exactly one of upload_id or input_path is required",
            ))
        }
    };

    let mut job = JobRecord::new(
        identity.user_id.clone(),
        input_ref,
        body.runtime.clone().unwrap_or_else(|| json!({})),
    );
    job.visibility = body.visibility.unwrap_or_default();
    job.library_key = body.library_key.clone();
    job.owner_storage_bytes_delta = storage_delta;

    let requested = body.priority.unwrap_or_default();
    let outcome = state.scheduler.admit(&identity.user_id, requested, 30).await?;
    job.priority = outcome.priority;
    job.dispatch_after = outcome.dispatch_after;

    Ok(job)
}

/// `POST /api/jobs`: durable submit. The job row and its outbox row are
/// one transaction; the dispatch flusher takes it from there. Replies
/// `202` because execution is asynchronous.
pub async fn submit(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    ReqId(request_id): ReqId,
    Json(body): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    state.ensure_not_draining()?;
    state.rate(Some(&identity), ip, EndpointClass::Submit)?;
    if !identity.has_scope("submit:job") {
        return Err(ApiError::forbidden("missing submit:job scope"));
    }

    let job = build_job(&state, &identity, &body).await?;
    state.meta.create_job(&job).await?;

    state
        .meta
        .record_audit(AuditEvent::new(
            request_id,
            Some(identity.user_id.clone()),
            "jobs.submit",
            format!("job:{}", job.id),
            AuditOutcome::Allowed,
            &format!("priority={}", job.priority),
        ))
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "id": job.id, "state": job.state })),
    ))
}

#[derive(Deserialize)]
pub struct BatchRequest {
    pub jobs: Vec<SubmitRequest>,
}

/// `POST /api/jobs/batch`: per-item admission; one bad item does not sink
/// the rest.
pub async fn submit_batch(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    ReqId(request_id): ReqId,
    Json(body): Json<BatchRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    state.ensure_not_draining()?;
    state.rate(Some(&identity), ip, EndpointClass::Submit)?;
    if !identity.has_scope("submit:job") {
        return Err(ApiError::forbidden("missing submit:job scope"));
    }
    if body.jobs.is_empty() || body.jobs.len() > 50 {
        return Err(ApiError::validation("batch must contain 1..=50 jobs"));
    }

    let mut results = Vec::with_capacity(body.jobs.len());
    for item in &body.jobs {
        match build_job(&state, &identity, item).await {
            Ok(job) => match state.meta.create_job(&job).await {
                Ok(()) => results.push(json!({ "ok": true, "id": job.id })),
                Err(err) => results.push(json!({ "ok": false, "error": err.to_string() })),
            },
            Err(err) => results.push(json!({ "ok": false, "error": err.to_string() })),
        }
    }

    state
        .meta
        .record_audit(AuditEvent::new(
            request_id,
            Some(identity.user_id.clone()),
            "jobs.submit_batch",
            format!("count:{}", body.jobs.len()),
            AuditOutcome::Allowed,
            "",
        ))
        .await?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "results": results }))))
}

#[derive(Deserialize)]
pub struct ListParams {
    pub state: Option<JobState>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

/// `GET /api/jobs`: the caller's jobs plus shared ones; admins see all.
pub async fn list(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let per_page = params.per_page.unwrap_or(50).clamp(1, 200);
    let page = params.page.unwrap_or(0);

    let filter = JobFilter {
        owner_id: if identity.is_admin() {
            None
        } else {
            Some(identity.user_id.clone())
        },
        state: params.state,
        include_shared: !identity.is_admin(),
        include_archived: false,
    };
    let result = state.meta.list_jobs(&filter, per_page, page * per_page).await?;

    Ok(Json(json!({
        "jobs": result.jobs.into_iter().map(JobResponse::from).collect::<Vec<_>>(),
        "total": result.total,
    })))
}

async fn load_job_for(
    state: &AppState,
    identity: &redub_core::Identity,
    id: &str,
    allow_shared_read: bool,
) -> Result<JobRecord, ApiError> {
    let job = state
        .meta
        .get_job(&JobId::from(id))
        .await
        .map_err(|_| ApiError::not_found())?;
    state
        .access
        .require_job_access(identity, &job, allow_shared_read)?;
    Ok(job)
}

/// `GET /api/jobs/{id}`
pub async fn get(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = load_job_for(&state, &identity, &id, true).await?;
    Ok(Json(job.into()))
}

/// `POST /api/jobs/{id}/cancel`: queued jobs settle immediately; running
/// jobs get the durable flag plus the in-memory signal and the worker
/// finishes the transition.
pub async fn cancel(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    ReqId(request_id): ReqId,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let job = load_job_for(&state, &identity, &id, false).await?;

    if job.state.is_terminal() {
        return Err(ApiError::conflict(format!("job already {}", job.state)));
    }

    let updated = state
        .meta
        .update_job(&job.id, None, |j| {
            match j.state {
                JobState::Queued | JobState::Paused => {
                    j.transition(JobState::Canceled)?;
                    j.message = "canceled".into();
                }
                JobState::Running => {
                    j.cancel_requested = true;
                }
                _ => return Err(format!("job already {}", j.state)),
            }
            Ok(())
        })
        .await?;
    state.cancels.signal(&job.id);

    if updated.state == JobState::Canceled {
        state.hub.publish_job(
            &job.id,
            redub_events::JobEvent::State {
                job_id: job.id.clone(),
                state: updated.state.to_string(),
                progress: updated.progress,
                message: updated.message.clone(),
                at: Utc::now(),
            },
        );
    }

    state
        .meta
        .record_audit(AuditEvent::new(
            request_id,
            Some(identity.user_id),
            "jobs.cancel",
            format!("job:{}", job.id),
            AuditOutcome::Allowed,
            "",
        ))
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "id": job.id, "state": updated.state })),
    ))
}

/// `POST /api/jobs/{id}/pause`: queued jobs only.
pub async fn pause(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = load_job_for(&state, &identity, &id, false).await?;
    let updated = state
        .meta
        .update_job(&job.id, Some(JobState::Queued), |j| {
            j.transition(JobState::Paused)?;
            j.message = "paused".into();
            Ok(())
        })
        .await?;
    Ok(Json(json!({ "id": job.id, "state": updated.state })))
}

/// `POST /api/jobs/{id}/resume`: back to the queue and through the outbox
/// again.
pub async fn resume(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = load_job_for(&state, &identity, &id, false).await?;
    let updated = state
        .meta
        .update_job(&job.id, Some(JobState::Paused), |j| {
            j.transition(JobState::Queued)?;
            j.message = "queued".into();
            Ok(())
        })
        .await?;
    state.meta.reopen_outbox(&job.id).await?;
    Ok(Json(json!({ "id": job.id, "state": updated.state })))
}

#[derive(Deserialize, Default)]
pub struct RerunRequest {
    /// Two-pass voice-clone rerun: keeps checkpoints before `tts`,
    /// invalidates `tts`, `mix` and later stages
    #[serde(default)]
    pub voice_clone: bool,
}

/// `POST /api/jobs/{id}/rerun`: operator-triggered; the only legal exit
/// from a terminal state.
pub async fn rerun(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    ReqId(request_id): ReqId,
    Path(id): Path<String>,
    body: Option<Json<RerunRequest>>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    require_role(&identity, Role::Operator)?;
    let job = load_job_for(&state, &identity, &id, false).await?;
    if !job.state.is_terminal() {
        return Err(ApiError::conflict(format!("job is {}, not terminal", job.state)));
    }

    let voice_clone = body.map(|Json(b)| b.voice_clone).unwrap_or(false);
    let updated = state
        .meta
        .update_job(&job.id, None, |j| {
            j.transition(JobState::Queued)?;
            j.message = "queued for rerun".into();
            j.cancel_requested = false;
            if voice_clone {
                j.rerun_marker = Some(VOICE_CLONE_RERUN.to_string());
            } else {
                // Full rerun starts from scratch.
                j.checkpoint.clear();
                j.rerun_marker = None;
            }
            Ok(())
        })
        .await?;
    state.meta.reopen_outbox(&job.id).await?;

    state
        .meta
        .record_audit(AuditEvent::new(
            request_id,
            Some(identity.user_id),
            "jobs.rerun",
            format!("job:{}", job.id),
            AuditOutcome::Allowed,
            &format!("voice_clone={voice_clone}"),
        ))
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "id": job.id, "state": updated.state })),
    ))
}

#[derive(Deserialize)]
pub struct VisibilityRequest {
    pub visibility: Visibility,
}

/// `POST /api/jobs/{id}/visibility`
pub async fn set_visibility(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Path(id): Path<String>,
    Json(body): Json<VisibilityRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = load_job_for(&state, &identity, &id, false).await?;
    let updated = state
        .meta
        .update_job(&job.id, None, |j| {
            j.visibility = body.visibility;
            Ok(())
        })
        .await?;
    Ok(Json(json!({ "id": job.id, "visibility": updated.visibility })))
}

/// `DELETE /api/jobs/{id}`: soft delete.
pub async fn soft_delete(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    ReqId(request_id): ReqId,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let job = load_job_for(&state, &identity, &id, false).await?;
    if job.state == JobState::Running {
        return Err(ApiError::conflict("cancel the job before deleting it"));
    }
    state
        .meta
        .update_job(&job.id, None, |j| {
            j.deleted_at = Some(Utc::now());
            Ok(())
        })
        .await?;
    state
        .meta
        .record_audit(AuditEvent::new(
            request_id,
            Some(identity.user_id),
            "jobs.delete",
            format!("job:{}", job.id),
            AuditOutcome::Allowed,
            "",
        ))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/jobs/{id}/files`: artifact listing relative to the job's
/// working directory.
pub async fn files(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = load_job_for(&state, &identity, &id, true).await?;
    let Some(work_dir) = state.layout.resolve(&job.id).await.map_err(ApiError::from)? else {
        return Ok(Json(json!({ "files": [] })));
    };

    let mut files = Vec::new();
    let mut stack = vec![work_dir.clone()];
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata().await {
                if let Ok(rel) = path.strip_prefix(&work_dir) {
                    files.push(json!({
                        "path": rel.to_string_lossy(),
                        "size_bytes": meta.len(),
                    }));
                }
            }
        }
    }

    Ok(Json(json!({ "files": files })))
}

/// `GET /api/jobs/{id}/timeline`
pub async fn timeline(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = load_job_for(&state, &identity, &id, true).await?;
    let entries = state.meta.timeline(&job.id).await?;
    Ok(Json(json!({ "timeline": entries })))
}

#[derive(Deserialize)]
pub struct TailParams {
    pub n: Option<usize>,
}

/// `GET /api/jobs/{id}/logs/tail`
pub async fn logs_tail(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Path(id): Path<String>,
    Query(params): Query<TailParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = load_job_for(&state, &identity, &id, true).await?;
    let lines = state
        .meta
        .tail_log(&job.id, params.n.unwrap_or(100).min(1000))
        .await?;
    Ok(Json(json!({ "lines": lines })))
}
