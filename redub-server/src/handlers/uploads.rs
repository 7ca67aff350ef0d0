use axum::body::Bytes;
use axum::extract::{Extension, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use redub_core::UploadId;
use redub_policy::EndpointClass;

use crate::error::ApiError;
use crate::extract::RequireIdentity;
use crate::middleware::ClientIp;
use crate::AppState;

#[derive(Deserialize)]
pub struct InitRequest {
    pub filename: String,
    pub total_bytes: u64,
    pub chunk_bytes: Option<u64>,
    pub sha256: Option<String>,
}

/// `POST /api/uploads/init`
pub async fn init(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Json(body): Json<InitRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    state.ensure_not_draining()?;
    state.rate(Some(&identity), ip, EndpointClass::Upload)?;

    let chunk_bytes = body.chunk_bytes.unwrap_or(state.config.upload_chunk_bytes);
    let record = state
        .uploads
        .init(
            &identity.user_id,
            &body.filename,
            body.total_bytes,
            chunk_bytes,
            body.sha256,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "upload_id": record.id,
            "chunk_bytes": record.chunk_bytes,
            "expected_chunks": record.expected_chunks,
            "expires_at": record.expires_at,
        })),
    ))
}

#[derive(Deserialize)]
pub struct ChunkParams {
    pub index: Option<u64>,
    pub offset: Option<u64>,
}

/// Parse `Content-Range: bytes <start>-<end>/<total>`.
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get(axum::http::header::CONTENT_RANGE)?.to_str().ok()?;
    let rest = raw.trim().strip_prefix("bytes ")?;
    let (range, _total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    start.parse().ok()
}

/// `POST /api/uploads/{id}/chunk`: raw chunk body addressed either by
/// `index`+`offset` query parameters or a `Content-Range` header.
pub async fn chunk(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(id): Path<String>,
    Query(params): Query<ChunkParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.rate(Some(&identity), ip, EndpointClass::Upload)?;

    let upload_id = UploadId::from_string(id);
    let record = state.uploads.get(&upload_id).await?;
    state.access.require_upload_access(&identity, &record)?;

    let offset = params
        .offset
        .or_else(|| content_range_start(&headers))
        .ok_or_else(|| ApiError::validation("offset or Content-Range required"))?;
    let index = params.index.unwrap_or_else(|| {
        if record.chunk_bytes == 0 {
            0
        } else {
            offset / record.chunk_bytes
        }
    });

    state
        .uploads
        .write_chunk(&upload_id, index, offset, &body)
        .await?;

    let status = state.uploads.status(&upload_id).await?;
    Ok(Json(json!({
        "received_bytes": status.received_bytes,
        "missing_indices": status.missing_indices,
    })))
}

/// `POST /api/uploads/{id}/complete`
pub async fn complete(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.rate(Some(&identity), ip, EndpointClass::Upload)?;

    let upload_id = UploadId::from_string(id);
    let record = state.uploads.get(&upload_id).await?;
    state.access.require_upload_access(&identity, &record)?;

    state.uploads.complete(&upload_id).await?;
    let status = state.uploads.status(&upload_id).await?;
    let record = state.uploads.get(&upload_id).await?;

    Ok(Json(json!({
        "state": status.state,
        "final_hash": record.final_hash,
    })))
}

/// `GET /api/uploads/{id}`
pub async fn status(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let upload_id = UploadId::from_string(id);
    let record = state.uploads.get(&upload_id).await?;
    state.access.require_upload_access(&identity, &record)?;

    let status = state.uploads.status(&upload_id).await?;
    Ok(Json(serde_json::to_value(&status).unwrap_or_default()))
}
