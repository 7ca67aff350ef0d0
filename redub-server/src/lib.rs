//! redub-server: the HTTP surface and process lifecycle.
//!
//! Middleware order, outer to inner: remote-access gate + request context,
//! security headers, CORS, identity resolution, CSRF. Rate limits and
//! drain checks are explicit calls inside handlers, and every per-resource
//! decision goes through `redub_policy::ObjectAccess`.

pub mod error;
pub mod extract;
pub mod handlers;
pub mod lifecycle;
pub mod middleware;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::header::HeaderName;
use axum::http::{HeaderValue, Method};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use redub_core::{Config, Identity};
use redub_dispatch::AutoDispatch;
use redub_engine::{CancelRegistry, OutputLayout, Scheduler};
use redub_events::EventHub;
use redub_policy::{
    CsrfGuard, EndpointClass, IdentityResolver, NetGate, ObjectAccess, RateLimiter,
};
use redub_store::MetaStore;
use redub_upload::UploadStore;

use crate::error::ApiError;

/// Everything handlers need, cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub meta: Arc<MetaStore>,
    pub uploads: Arc<UploadStore>,
    pub dispatch: Arc<AutoDispatch>,
    pub scheduler: Arc<Scheduler>,
    pub hub: EventHub,
    pub cancels: Arc<CancelRegistry>,
    pub resolver: Arc<IdentityResolver>,
    pub csrf: Arc<CsrfGuard>,
    pub limiter: Arc<RateLimiter>,
    pub gate: Arc<NetGate>,
    pub access: Arc<ObjectAccess>,
    pub layout: OutputLayout,
    pub draining: Arc<AtomicBool>,
}

impl AppState {
    /// Handler-level rate limit check, keyed by identity when present,
    /// otherwise by client IP.
    pub fn rate(
        &self,
        identity: Option<&Identity>,
        ip: IpAddr,
        class: EndpointClass,
    ) -> Result<(), ApiError> {
        let caller = match identity {
            Some(ident) => ident.user_id.to_string(),
            None => ip.to_string(),
        };
        self.limiter.check(&caller, class).map_err(ApiError::from)
    }

    /// Submission endpoints refuse while draining.
    pub fn ensure_not_draining(&self) -> Result<(), ApiError> {
        if self.draining.load(Ordering::Acquire) {
            return Err(ApiError::draining());
        }
        Ok(())
    }
}

/// The full route table with the layered middleware stack.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    let routes = Router::new()
        // Auth. Self-registration intentionally responds 404.
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/register", post(handlers::auth::signup_disabled))
        .route("/auth/signup", post(handlers::auth::signup_disabled))
        .route("/auth/totp/setup", post(handlers::auth::totp_setup))
        .route("/auth/totp/verify", post(handlers::auth::totp_verify))
        .route("/auth/qr/init", post(handlers::auth::qr_init))
        .route("/auth/qr/redeem", post(handlers::auth::qr_redeem))
        .route("/auth/sessions", get(handlers::auth::list_sessions))
        .route(
            "/auth/sessions/{id}/revoke",
            post(handlers::auth::revoke_session),
        )
        // Invites
        .route("/api/invites/redeem", post(handlers::invites::redeem))
        // Uploads
        .route("/api/uploads/init", post(handlers::uploads::init))
        .route("/api/uploads/{id}/chunk", post(handlers::uploads::chunk))
        .route(
            "/api/uploads/{id}/complete",
            post(handlers::uploads::complete),
        )
        .route("/api/uploads/{id}", get(handlers::uploads::status))
        // Jobs
        .route(
            "/api/jobs",
            post(handlers::jobs::submit).get(handlers::jobs::list),
        )
        .route("/api/jobs/batch", post(handlers::jobs::submit_batch))
        .route("/api/jobs/events", get(handlers::events::global_sse))
        .route(
            "/api/jobs/{id}",
            get(handlers::jobs::get).delete(handlers::jobs::soft_delete),
        )
        .route("/api/jobs/{id}/cancel", post(handlers::jobs::cancel))
        .route("/api/jobs/{id}/pause", post(handlers::jobs::pause))
        .route("/api/jobs/{id}/resume", post(handlers::jobs::resume))
        .route("/api/jobs/{id}/rerun", post(handlers::jobs::rerun))
        .route(
            "/api/jobs/{id}/visibility",
            post(handlers::jobs::set_visibility),
        )
        .route("/api/jobs/{id}/files", get(handlers::jobs::files))
        .route("/api/jobs/{id}/timeline", get(handlers::jobs::timeline))
        .route("/api/jobs/{id}/logs/tail", get(handlers::jobs::logs_tail))
        .route(
            "/api/jobs/{id}/logs/stream",
            get(handlers::events::job_logs_sse),
        )
        // Event plane
        .route("/events/jobs/{id}", get(handlers::events::job_sse))
        .route("/ws/jobs/{id}", get(handlers::events::job_ws))
        // Library
        .route("/api/library", get(handlers::library::list))
        .route(
            "/api/library/{series}/{season}/{episode}",
            get(handlers::library::get_entry),
        )
        // Files
        .route("/files/{*path}", get(handlers::files::serve))
        .route("/video/{id}", get(handlers::files::video_alias))
        // Admin
        .route("/api/admin/queue", get(handlers::admin::queue_status))
        .route("/api/admin/quotas", get(handlers::admin::quotas))
        .route(
            "/api/admin/invites",
            get(handlers::admin::list_invites).post(handlers::admin::create_invite),
        )
        .route("/api/admin/users", post(handlers::admin::create_user))
        .route("/api/admin/reports", get(handlers::admin::reports));

    routes
        .layer(from_fn_with_state(state.clone(), middleware::csrf_enforce))
        .layer(from_fn_with_state(state.clone(), middleware::auth_identity))
        .layer(cors)
        .layer(from_fn(middleware::security_headers))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::gate_and_context,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    if config.cors_origins.is_empty() {
        return CorsLayer::new();
    }
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-csrf-token"),
        ])
        .allow_credentials(true)
}
