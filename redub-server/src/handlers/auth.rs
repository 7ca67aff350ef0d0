use axum::extract::{Extension, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use redub_core::{ErrorKind, Identity, SessionId};
use redub_policy::{totp, CsrfGuard, EndpointClass};
use redub_store::{AuditEvent, AuditOutcome};

use crate::error::ApiError;
use crate::extract::{ReqId, RequireIdentity};
use crate::middleware::ClientIp;
use crate::AppState;

#[derive(Deserialize)]
pub struct LoginRequest {
    pub login: String,
    pub password: String,
    pub totp_code: Option<String>,
    pub device_id: Option<String>,
}

fn session_cookie(state: &AppState, name: &str, value: &str) -> HeaderValue {
    let secure = if state.config.cookie_secure {
        "; Secure"
    } else {
        ""
    };
    let samesite = state.config.cookie_samesite.attribute();
    HeaderValue::from_str(&format!(
        "{name}={value}; Path=/; HttpOnly; SameSite={samesite}{secure}"
    ))
    .unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// `POST /auth/login`: password plus TOTP when enabled. Mints a session,
/// a signed session cookie, a CSRF cookie and a bearer token.
pub async fn login(
    State(state): State<AppState>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    ReqId(request_id): ReqId,
    Json(body): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    state.rate(None, ip, EndpointClass::Auth)?;

    let user = state
        .meta
        .verify_login(&body.login, &body.password)
        .await
        .map_err(|_| {
            ApiError::new(ErrorKind::Auth, "bad credentials")
        })?;

    if user.totp_enabled {
        let secret = user.totp_secret.as_deref().unwrap_or_default();
        let code = body.totp_code.as_deref().unwrap_or_default();
        if !totp::verify_code(secret, code, std::time::SystemTime::now()) {
            state
                .meta
                .record_audit(AuditEvent::new(
                    request_id,
                    Some(user.id.clone()),
                    "auth.login",
                    format!("user:{}", user.id),
                    AuditOutcome::Denied,
                    "totp rejected",
                ))
                .await?;
            return Err(ApiError::new(ErrorKind::Auth, "totp required"));
        }
    }

    let device = body.device_id.as_deref().unwrap_or("web");
    let ip_hash = state.resolver.hash_ip(&ip.to_string());
    let session = state.meta.create_session(&user.id, device, &ip_hash).await?;
    let token = state.resolver.issue_bearer(&user.id, Some(&session.id))?;
    let csrf_token = state.csrf.mint(&session.id);

    state
        .meta
        .record_audit(AuditEvent::new(
            request_id,
            Some(user.id.clone()),
            "auth.login",
            format!("user:{}", user.id),
            AuditOutcome::Allowed,
            &format!("device={device}"),
        ))
        .await?;

    let body = Json(json!({
        "token": token,
        "csrf": csrf_token,
        "user": { "id": user.id, "login": user.login, "role": user.role },
    }));

    let mut response = (StatusCode::OK, body).into_response();
    let cookie_value = state.resolver.sign_session(&session.id);
    response.headers_mut().append(
        header::SET_COOKIE,
        session_cookie(&state, redub_policy::SESSION_COOKIE, &cookie_value),
    );
    response.headers_mut().append(
        header::SET_COOKIE,
        session_cookie(&state, CsrfGuard::COOKIE, &csrf_token),
    );
    Ok(response)
}

/// `POST /auth/refresh`: a fresh bearer token for the current identity.
pub async fn refresh(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token = state
        .resolver
        .issue_bearer(&identity.user_id, identity.session_id.as_ref())?;
    Ok(Json(json!({ "token": token })))
}

/// `POST /auth/logout`: revoke the session behind the request.
pub async fn logout(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
) -> Result<Response, ApiError> {
    if let Some(session_id) = &identity.session_id {
        state.meta.revoke_session(session_id).await?;
    }
    let mut response = StatusCode::NO_CONTENT.into_response();
    response.headers_mut().append(
        header::SET_COOKIE,
        session_cookie(&state, redub_policy::SESSION_COOKIE, "deleted; Max-Age=0"),
    );
    Ok(response)
}

/// Self-registration is not served on this system.
pub async fn signup_disabled() -> ApiError {
    ApiError::not_found()
}

/// `POST /auth/totp/setup`: generate and stash a secret, return the
/// provisioning URL. Enablement waits for a verified code.
pub async fn totp_setup(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = state.meta.get_user(&identity.user_id).await?;
    let secret = totp::generate_secret();
    state.meta.set_totp_secret(&user.id, &secret).await?;
    Ok(Json(json!({
        "secret": secret,
        "otpauth_url": totp::otpauth_url(&user.login, &secret),
    })))
}

#[derive(Deserialize)]
pub struct TotpVerifyRequest {
    pub code: String,
}

/// `POST /auth/totp/verify`: a valid code flips TOTP on.
pub async fn totp_verify(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Json(body): Json<TotpVerifyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = state.meta.get_user(&identity.user_id).await?;
    let secret = user
        .totp_secret
        .as_deref()
        .ok_or_else(|| ApiError::conflict("totp setup not started"))?;
    if !totp::verify_code(secret, &body.code, std::time::SystemTime::now()) {
        return Err(ApiError::new(ErrorKind::Auth, "code rejected"));
    }
    state.meta.enable_totp(&user.id).await?;
    Ok(Json(json!({ "totp_enabled": true })))
}

/// `POST /auth/qr/init`: mint a short-lived one-shot pairing code the
/// second device redeems for its own session.
pub async fn qr_init(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
) -> Result<Json<serde_json::Value>, ApiError> {
    let code = state
        .meta
        .create_pairing_code(&identity.user_id, chrono::Duration::minutes(5))
        .await?;
    Ok(Json(json!({
        "code": code.code,
        "expires_at": code.expires_at,
    })))
}

#[derive(Deserialize)]
pub struct QrRedeemRequest {
    pub code: String,
    pub device_id: Option<String>,
}

/// `POST /auth/qr/redeem`: public, one-shot; the new device gets its own
/// session and bearer token.
pub async fn qr_redeem(
    State(state): State<AppState>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Json(body): Json<QrRedeemRequest>,
) -> Result<Response, ApiError> {
    state.rate(None, ip, EndpointClass::Auth)?;

    let user_id = state
        .meta
        .redeem_pairing_code(&body.code)
        .await
        .map_err(|_| ApiError::conflict("pairing code not redeemable"))?;

    let device = body.device_id.as_deref().unwrap_or("paired-device");
    let ip_hash = state.resolver.hash_ip(&ip.to_string());
    let session = state.meta.create_session(&user_id, device, &ip_hash).await?;
    let token = state.resolver.issue_bearer(&user_id, Some(&session.id))?;
    let csrf_token = state.csrf.mint(&session.id);

    let body = Json(json!({ "token": token, "csrf": csrf_token }));
    let mut response = (StatusCode::OK, body).into_response();
    let cookie_value = state.resolver.sign_session(&session.id);
    response.headers_mut().append(
        header::SET_COOKIE,
        session_cookie(&state, redub_policy::SESSION_COOKIE, &cookie_value),
    );
    response.headers_mut().append(
        header::SET_COOKIE,
        session_cookie(&state, CsrfGuard::COOKIE, &csrf_token),
    );
    Ok(response)
}

/// `GET /auth/sessions`: the caller's sessions, newest first.
pub async fn list_sessions(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sessions = state.meta.list_sessions(&identity.user_id).await?;
    Ok(Json(json!({ "sessions": sessions })))
}

/// `POST /auth/sessions/{id}/revoke`: callers revoke their own sessions;
/// admins anyone's.
pub async fn revoke_session(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    ReqId(request_id): ReqId,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session_id = SessionId::from_string(id);
    let session = state
        .meta
        .get_session(&session_id)
        .await
        .map_err(|_| ApiError::not_found())?;
    if !identity.is_admin() && session.user_id != identity.user_id {
        return Err(ApiError::forbidden("not your session"));
    }
    state.meta.revoke_session(&session_id).await?;
    state
        .meta
        .record_audit(AuditEvent::new(
            request_id,
            Some(identity.user_id),
            "auth.session_revoke",
            format!("session:{session_id}"),
            AuditOutcome::Allowed,
            "",
        ))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Shared guard: handlers that need an identity of at least a role.
pub fn require_role(identity: &Identity, role: redub_core::Role) -> Result<(), ApiError> {
    if identity.role >= role {
        Ok(())
    } else {
        Err(ApiError::forbidden(format!("requires {role} role")))
    }
}

/// Headers helper used by SSE handlers that need Last-Event-ID.
pub fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit(':').next())
        .and_then(|v| v.parse().ok())
}
