use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use redub_core::{ErrorKind, QuotaDetail};

/// The one error type handlers return. Carries enough structure for the
/// response contract: quota refusals get `{error, action, reason, limit,
/// current}`, chunk conflicts get the committed ranges, 429/503 get
/// `Retry-After`.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub quota: Option<QuotaDetail>,
    pub retry_after_secs: Option<u64>,
    pub committed_chunks: Option<Vec<u64>>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            quota: None,
            retry_after_secs: None,
            committed_chunks: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn auth() -> Self {
        Self::new(ErrorKind::Auth, "not authenticated")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn not_found() -> Self {
        Self::new(ErrorKind::NotFound, "not found")
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn draining() -> Self {
        let mut err = Self::new(ErrorKind::Draining, "server is draining");
        err.retry_after_secs = Some(30);
        err
    }

    fn status(&self) -> StatusCode {
        // Byte quotas are 413, all other quota refusals 429.
        if self.kind == ErrorKind::QuotaExceeded {
            if let Some(quota) = &self.quota {
                if quota.reason.contains("bytes") {
                    return StatusCode::PAYLOAD_TOO_LARGE;
                }
            }
        }
        StatusCode::from_u16(self.kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.kind.name(),
            "message": self.message,
        });
        if let Some(quota) = &self.quota {
            body["action"] = json!(quota.action);
            body["reason"] = json!(quota.reason);
            body["limit"] = json!(quota.limit);
            body["current"] = json!(quota.current);
        }
        if let Some(committed) = &self.committed_chunks {
            body["committed"] = json!(committed);
        }

        let mut response = (self.status(), Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<redub_policy::PolicyError> for ApiError {
    fn from(err: redub_policy::PolicyError) -> Self {
        let retry_after = match &err {
            redub_policy::PolicyError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        let mut out = Self::new(err.kind(), err.to_string());
        out.retry_after_secs = retry_after;
        out
    }
}

impl From<redub_upload::UploadError> for ApiError {
    fn from(err: redub_upload::UploadError) -> Self {
        let mut out = Self::new(err.kind(), err.to_string());
        match err {
            redub_upload::UploadError::Quota(detail) => out.quota = Some(detail),
            redub_upload::UploadError::ChunkConflict { committed, .. } => {
                out.committed_chunks = Some(committed)
            }
            _ => {}
        }
        out
    }
}

impl From<redub_engine::EngineError> for ApiError {
    fn from(err: redub_engine::EngineError) -> Self {
        let mut out = Self::new(err.kind(), err.to_string());
        match err {
            redub_engine::EngineError::Quota(detail) => out.quota = Some(detail),
            redub_engine::EngineError::Draining => out.retry_after_secs = Some(30),
            redub_engine::EngineError::DiskLow { .. } => out.retry_after_secs = Some(60),
            _ => {}
        }
        out
    }
}

impl From<redub_store::StoreError> for ApiError {
    fn from(err: redub_store::StoreError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<redub_dispatch::DispatchError> for ApiError {
    fn from(err: redub_dispatch::DispatchError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_quota_maps_to_413() {
        let mut err = ApiError::new(ErrorKind::QuotaExceeded, "too big");
        err.quota = Some(QuotaDetail::new("upload_init", "max_upload_bytes", 10, 20));
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let mut err = ApiError::new(ErrorKind::QuotaExceeded, "too many");
        err.quota = Some(QuotaDetail::new("submit_job", "concurrent_jobs_limit", 1, 1));
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
