use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use redub_core::Role;
use redub_store::{AuditEvent, AuditOutcome, JobFilter, JobState};

use crate::error::ApiError;
use crate::extract::{ReqId, RequireIdentity};
use crate::handlers::auth::require_role;
use crate::AppState;

/// `GET /api/admin/queue`: dispatch selection, scheduler counters and
/// event plane occupancy.
pub async fn queue_status(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_role(&identity, Role::Admin)?;
    let dispatch = state.dispatch.status().await;
    let scheduler = state.scheduler.status();
    Ok(Json(json!({
        "dispatch": dispatch,
        "scheduler": scheduler,
        "event_subscribers": state.hub.subscriber_count(),
    })))
}

/// `GET /api/admin/quotas`
pub async fn quotas(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_role(&identity, Role::Admin)?;
    let quotas = state.meta.all_quotas().await?;
    Ok(Json(json!({ "quotas": quotas })))
}

#[derive(Deserialize)]
pub struct CreateInviteRequest {
    pub ttl_hours: Option<i64>,
}

/// `POST /api/admin/invites`
pub async fn create_invite(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    ReqId(request_id): ReqId,
    body: Option<Json<CreateInviteRequest>>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    require_role(&identity, Role::Admin)?;
    let ttl_hours = body
        .and_then(|Json(b)| b.ttl_hours)
        .unwrap_or(72)
        .clamp(1, 24 * 30);
    let invite = state
        .meta
        .create_invite(&identity.user_id, chrono::Duration::hours(ttl_hours))
        .await?;

    state
        .meta
        .record_audit(AuditEvent::new(
            request_id,
            Some(identity.user_id),
            "admin.invite_create",
            "invite".to_string(),
            AuditOutcome::Allowed,
            &format!("ttl_hours={ttl_hours}"),
        ))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "token": invite.token,
            "expires_at": invite.expires_at,
        })),
    ))
}

/// `GET /api/admin/invites`
pub async fn list_invites(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_role(&identity, Role::Admin)?;
    let invites = state.meta.list_invites().await?;
    Ok(Json(json!({ "invites": invites })))
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub login: String,
    pub password: String,
    pub role: Role,
}

/// `POST /api/admin/users`: the admin-create path; the other way in is
/// invite redemption.
pub async fn create_user(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    ReqId(request_id): ReqId,
    Json(body): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    require_role(&identity, Role::Admin)?;
    if body.password.len() < 8 {
        return Err(ApiError::validation("password must be at least 8 characters"));
    }
    let user = state
        .meta
        .create_user(&body.login, &body.password, body.role)
        .await?;

    state
        .meta
        .record_audit(AuditEvent::new(
            request_id,
            Some(identity.user_id),
            "admin.user_create",
            format!("user:{}", user.id),
            AuditOutcome::Allowed,
            &format!("role={}", user.role),
        ))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "user": { "id": user.id, "login": user.login, "role": user.role },
        })),
    ))
}

/// `GET /api/admin/reports`: per-user aggregates for capacity planning.
pub async fn reports(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_role(&identity, Role::Admin)?;

    let quotas = state.meta.all_quotas().await?;
    let mut per_user = Vec::with_capacity(quotas.len());
    for quota in quotas {
        let jobs = state
            .meta
            .list_jobs(
                &JobFilter {
                    owner_id: Some(quota.user_id.clone()),
                    include_archived: true,
                    ..Default::default()
                },
                1,
                0,
            )
            .await?;
        let failed = state
            .meta
            .list_jobs(
                &JobFilter {
                    owner_id: Some(quota.user_id.clone()),
                    state: Some(JobState::Failed),
                    include_archived: true,
                    ..Default::default()
                },
                1,
                0,
            )
            .await?;
        per_user.push(json!({
            "user_id": quota.user_id,
            "storage_bytes_used": quota.storage_bytes_used,
            "jobs_total": jobs.total,
            "jobs_failed": failed.total,
            "jobs_submitted_today": quota.jobs_submitted_today,
            "processing_minutes_today": quota.processing_minutes_today,
        }));
    }

    Ok(Json(json!({ "users": per_user })))
}
