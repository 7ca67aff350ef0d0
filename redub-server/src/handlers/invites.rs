use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use redub_core::InviteToken;
use redub_policy::EndpointClass;
use redub_store::{AuditEvent, AuditOutcome};

use crate::error::ApiError;
use crate::extract::ReqId;
use crate::middleware::ClientIp;
use crate::AppState;

#[derive(Deserialize)]
pub struct RedeemRequest {
    pub token: String,
    pub login: String,
    pub password: String,
}

/// `POST /api/invites/redeem`: the only public account-creation path.
/// The token flip and the user insert are one transaction in the store,
/// so a raced token mints at most one account.
pub async fn redeem(
    State(state): State<AppState>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    ReqId(request_id): ReqId,
    Json(body): Json<RedeemRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    state.rate(None, ip, EndpointClass::Auth)?;

    if body.login.trim().is_empty() || body.password.len() < 8 {
        return Err(ApiError::validation(
            "login must be non-empty and password at least 8 characters",
        ));
    }

    let token = InviteToken::from_string(body.token.clone());
    let user = state
        .meta
        .redeem_invite(&token, body.login.trim(), &body.password)
        .await
        .map_err(|_| ApiError::conflict("invite not redeemable"))?;

    state
        .meta
        .record_audit(AuditEvent::new(
            request_id,
            Some(user.id.clone()),
            "invite.redeem",
            format!("user:{}", user.id),
            AuditOutcome::Allowed,
            "",
        ))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "user": { "id": user.id, "login": user.login, "role": user.role },
        })),
    ))
}
