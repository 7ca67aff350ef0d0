use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::Response;

use redub_core::{Identity, RequestId};
use redub_policy::CsrfGuard;

use crate::error::ApiError;
use crate::extract::{credentials_from_headers, parse_cookies};
use crate::AppState;

/// Client address after trusted-proxy resolution; rate-limit key for
/// anonymous requests.
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub IpAddr);

/// Outermost layer: remote-access gate plus request context (request ID,
/// client IP). Requests refused by the gate never reach routing.
pub async fn gate_and_context(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));

    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let access_jwt = request
        .headers()
        .get("cf-access-jwt-assertion")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    state.gate.check(peer, access_jwt.as_deref())?;
    let client_ip = state.gate.client_ip(peer, forwarded.as_deref());

    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| RequestId::from_string(v.to_string()))
        .unwrap_or_default();

    request.extensions_mut().insert(ClientIp(client_ip));
    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        response.headers_mut().insert("x-request-id", value);
    }
    Ok(response)
}

/// Resolve credentials into an [`Identity`] extension. A present but
/// invalid credential is a hard `401`; absent credentials continue
/// anonymously and handlers decide.
pub async fn auth_identity(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let creds = credentials_from_headers(request.headers());
    if !creds.is_empty() {
        let identity = state.resolver.resolve(&creds).await?;
        if let Some(identity) = identity {
            request.extensions_mut().insert(identity);
        }
    }
    Ok(next.run(request).await)
}

/// Endpoints that establish credentials rather than act on them; a stale
/// session cookie must not block a fresh login.
const CSRF_EXEMPT_PATHS: &[&str] = &["/auth/login", "/auth/qr/redeem", "/api/invites/redeem"];

/// CSRF enforcement for state-mutating cookie-session requests. GET and
/// HEAD never require a token; bearer and API-key auth are exempt.
pub async fn csrf_enforce(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let mutating = !matches!(*request.method(), Method::GET | Method::HEAD | Method::OPTIONS)
        && !CSRF_EXEMPT_PATHS.contains(&request.uri().path());
    if mutating {
        if let Some(identity) = request.extensions().get::<Identity>() {
            if identity.method.requires_csrf() {
                let session_id = identity.session_id.clone().ok_or_else(ApiError::auth)?;
                let cookies = parse_cookies(request.headers());
                let cookie_token = cookies.get(CsrfGuard::COOKIE).map(String::as_str);
                let header_token = request
                    .headers()
                    .get(CsrfGuard::HEADER)
                    .and_then(|v| v.to_str().ok());
                state
                    .csrf
                    .verify(&session_id, cookie_token, header_token)?;
            }
        }
    }
    Ok(next.run(request).await)
}

/// Baseline security headers on every response.
pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    response
}
