use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use futures_core::Stream;
use tracing::debug;

use redub_core::{Identity, JobId};
use redub_events::{JobEvent, Subscription, Topic};
use redub_policy::EndpointClass;

use crate::error::ApiError;
use crate::extract::RequireIdentity;
use crate::handlers::auth::last_event_id;
use crate::handlers::jobs::JobResponse;
use crate::middleware::ClientIp;
use crate::AppState;

fn sse_event(topic_tag: &str, seq: u64, event: &JobEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default()
        .id(format!("{topic_tag}:{seq}"))
        .event(event.event_name())
        .data(data)
}

fn event_stream(
    mut sub: Subscription,
    topic_tag: String,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        while let Some(sequenced) = sub.recv().await {
            let terminal = matches!(sequenced.event, JobEvent::Shutdown { .. });
            yield Ok(sse_event(&topic_tag, sequenced.seq, &sequenced.event));
            if terminal {
                break;
            }
        }
    }
}

/// `GET /events/jobs/{id}`: one job's event stream over SSE, with
/// `Last-Event-ID` replay inside the hub's window and 15s heartbeats.
pub async fn job_sse(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state.rate(Some(&identity), ip, EndpointClass::Stream)?;

    let job = state
        .meta
        .get_job(&JobId::from(id.as_str()))
        .await
        .map_err(|_| ApiError::not_found())?;
    state.access.require_job_access(&identity, &job, true)?;

    let since = last_event_id(&headers);
    let sub = state.hub.subscribe(Topic::Job(job.id.clone()), since);

    Ok(Sse::new(event_stream(sub, job.id.to_string())).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}

/// `GET /api/jobs/{id}/logs/stream`: only the log batches of one job.
pub async fn job_logs_sse(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state.rate(Some(&identity), ip, EndpointClass::Stream)?;

    let job = state
        .meta
        .get_job(&JobId::from(id.as_str()))
        .await
        .map_err(|_| ApiError::not_found())?;
    state.access.require_job_access(&identity, &job, true)?;

    let mut sub = state.hub.subscribe(Topic::Job(job.id.clone()), None);
    let tag = job.id.to_string();
    let stream = async_stream::stream! {
        while let Some(sequenced) = sub.recv().await {
            match &sequenced.event {
                JobEvent::Log { .. } => {
                    yield Ok(sse_event(&tag, sequenced.seq, &sequenced.event));
                }
                JobEvent::Shutdown { .. } => {
                    yield Ok(sse_event(&tag, sequenced.seq, &sequenced.event));
                    break;
                }
                _ => {}
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}

/// `GET /api/jobs/events`: the global feed. Non-admins only see events
/// for jobs they could read directly; operational events (dispatch,
/// degrade) pass through.
pub async fn global_sse(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state.rate(Some(&identity), ip, EndpointClass::Stream)?;

    let since = last_event_id(&headers);
    let mut sub = state.hub.subscribe(Topic::Global, since);
    let stream_state = state.clone();

    let stream = async_stream::stream! {
        // Visibility verdicts are cached per connection; a job's owner
        // and visibility are stable enough for a live feed.
        let mut verdicts: HashMap<JobId, bool> = HashMap::new();
        while let Some(sequenced) = sub.recv().await {
            let terminal = matches!(sequenced.event, JobEvent::Shutdown { .. });
            let visible = match sequenced.event.job_id() {
                None => true,
                Some(job_id) => {
                    if let Some(cached) = verdicts.get(job_id) {
                        *cached
                    } else {
                        let allowed = job_visible(&stream_state, &identity, job_id).await;
                        verdicts.insert(job_id.clone(), allowed);
                        allowed
                    }
                }
            };
            if visible {
                yield Ok(sse_event("jobs", sequenced.seq, &sequenced.event));
            }
            if terminal {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}

async fn job_visible(state: &AppState, identity: &Identity, job_id: &JobId) -> bool {
    match state.meta.get_job(job_id).await {
        Ok(job) => state
            .access
            .require_job_access(identity, &job, true)
            .is_ok(),
        Err(_) => false,
    }
}

/// `WS /ws/jobs/{id}`: server-push job events as JSON text frames. Client
/// frames are ignored except for close; pings are answered at the
/// protocol layer.
pub async fn job_ws(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    state.rate(Some(&identity), ip, EndpointClass::Stream)?;

    let job = state
        .meta
        .get_job(&JobId::from(id.as_str()))
        .await
        .map_err(|_| ApiError::not_found())?;
    state.access.require_job_access(&identity, &job, true)?;

    // Send a snapshot first so late subscribers have current state.
    let snapshot = serde_json::to_string(&JobResponse::from(job.clone())).ok();
    let sub = state.hub.subscribe(Topic::Job(job.id.clone()), None);

    Ok(upgrade.on_upgrade(move |socket| push_loop(socket, sub, snapshot)))
}

async fn push_loop(mut socket: WebSocket, mut sub: Subscription, snapshot: Option<String>) {
    if let Some(snapshot) = snapshot {
        if socket.send(Message::Text(snapshot.into())).await.is_err() {
            return;
        }
    }
    loop {
        tokio::select! {
            event = sub.recv() => {
                let Some(sequenced) = event else { break };
                let terminal = matches!(sequenced.event, JobEvent::Shutdown { .. });
                let payload = serde_json::to_string(&sequenced.event)
                    .unwrap_or_else(|_| "{}".to_string());
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
                if terminal {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // only server-to-client frames carry meaning
                    Some(Err(err)) => {
                        debug!(error = %err, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}
