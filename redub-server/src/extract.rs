use std::collections::HashMap;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use redub_core::{Identity, RequestId};
use redub_policy::{RequestCredentials, SESSION_COOKIE};

use crate::error::ApiError;

/// Parse the `Cookie` header into name -> value pairs.
pub fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.split(';')
                .filter_map(|pair| {
                    let (name, value) = pair.trim().split_once('=')?;
                    Some((name.trim().to_string(), value.trim().to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Pull the three credential shapes out of the headers, in the order the
/// policy engine resolves them.
pub fn credentials_from_headers(headers: &HeaderMap) -> RequestCredentials {
    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string());

    let session_cookie = parse_cookies(headers).remove(SESSION_COOKIE);

    RequestCredentials {
        api_key,
        bearer,
        session_cookie,
    }
}

/// Extractor: the authenticated identity, injected by the auth
/// middleware. Responds `401` when absent.
pub struct RequireIdentity(pub Identity);

impl<S> FromRequestParts<S> for RequireIdentity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .map(RequireIdentity)
            .ok_or_else(ApiError::auth)
    }
}

/// Extractor: the request ID assigned by the context middleware.
pub struct ReqId(pub RequestId);

impl<S> FromRequestParts<S> for ReqId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ReqId(
            parts.extensions.get::<RequestId>().cloned().unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;

    #[test]
    fn cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "redub_session=abc.def; redub_csrf=tok.mac".parse().unwrap(),
        );
        let cookies = parse_cookies(&headers);
        assert_eq!(cookies["redub_session"], "abc.def");
        assert_eq!(cookies["redub_csrf"], "tok.mac");
    }

    #[test]
    fn credential_extraction_order() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "rdb_abc.secret".parse().unwrap());
        headers.insert(header::AUTHORIZATION, "Bearer tok".parse().unwrap());
        headers.insert(header::COOKIE, "redub_session=sid.mac".parse().unwrap());

        let creds = credentials_from_headers(&headers);
        assert_eq!(creds.api_key.as_deref(), Some("rdb_abc.secret"));
        assert_eq!(creds.bearer.as_deref(), Some("tok"));
        assert_eq!(creds.session_cookie.as_deref(), Some("sid.mac"));
    }
}
