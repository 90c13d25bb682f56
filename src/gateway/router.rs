//! HTTP router and handlers
//!
//! `/mcp` is the client surface, `/pools` and `/metrics` the operator
//! surface, and `/internal/forward` the peer relay endpoint.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, info};
use uuid::Uuid;

use super::dispatch::{Dispatcher, error_response};
use super::forward::{ForwardEnvelope, ForwardReply, LocalExecutor};
use super::registry::{ChannelTransport, LocalSessionRegistry};
use crate::affinity::OwnershipDirectory;
use crate::config::{PoolConfig, humantime_serde};
use crate::error::rpc_codes;
use crate::pool::{HealthStatus, PoolKey};
use crate::protocol::{JsonRpcResponse, request_id};
use crate::{Error, Result};

/// Header naming the end-user identity a pool key is built for
pub const IDENTITY_HEADER: &str = "x-mcp-identity";

/// Messages buffered per streaming session in each direction
const SESSION_BUFFER: usize = 64;

/// Shared application state
pub struct AppState {
    /// Request dispatcher
    pub dispatcher: Arc<Dispatcher>,
    /// Sessions terminated on this worker
    pub registry: Arc<LocalSessionRegistry>,
    /// Ownership directory (and through it the pool manager)
    pub directory: Arc<OwnershipDirectory>,
    /// Default grace period for operator-triggered drains
    pub drain_timeout: Duration,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/mcp",
            post(mcp_post_handler)
                .get(mcp_stream_handler)
                .delete(mcp_delete_handler),
        )
        .route("/pools", get(pools_handler))
        .route("/pools/{key}", get(pool_handler))
        .route("/pools/{key}/config", put(update_config_handler))
        .route("/pools/{key}/drain", post(drain_handler))
        .route("/pools/{key}/reset", post(reset_handler))
        .route("/pools/{key}/recommendation", get(recommendation_handler))
        .route("/metrics/affinity", get(affinity_metrics_handler))
        .route("/internal/forward", post(internal_forward_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn identity(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn with_session_header(mut response: Response, header: &str, session_id: Option<&str>) -> Response {
    if let Some(value) = session_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        if let Ok(name) = axum::http::HeaderName::from_bytes(header.as_bytes()) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pools = state.directory.pools();
    let status = pools.global_health();
    let body = json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "worker_id": state.directory.worker_id(),
        "pools": pools.keys().len(),
        "local_sessions": state.registry.len(),
    });
    let code = if status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(body))
}

/// POST /mcp
///
/// Messages for a session streaming from this worker are delivered to that
/// stream and acknowledged with 202; everything else is answered inline.
async fn mcp_post_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let message: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            let response =
                JsonRpcResponse::error(None, rpc_codes::PARSE_ERROR, format!("Invalid JSON: {e}"));
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    let session_header = state.directory.session_header();
    let session_id = state.directory.session_id_from_headers(&headers);
    let identity = identity(&headers);

    if let Some(sid) = session_id.as_deref() {
        if state.registry.contains(sid) {
            return match state
                .registry
                .broadcast(sid, message.clone(), identity.as_deref())
                .await
            {
                Ok(true) => with_session_header(
                    (StatusCode::ACCEPTED, Json(json!({}))).into_response(),
                    session_header,
                    Some(sid),
                ),
                Ok(false) | Err(_) => {
                    state.registry.remove(sid).await;
                    let err = Error::SessionUnhealthy(sid.to_string());
                    Json(error_response(request_id(&message), &err)).into_response()
                }
            };
        }
    }

    let id = request_id(&message);
    let response = match state
        .dispatcher
        .dispatch(session_id.as_deref(), identity.as_deref(), message)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            debug!(error = %e, "Dispatch failed");
            error_response(id, &e)
        }
    };
    with_session_header(
        Json(response).into_response(),
        session_header,
        session_id.as_deref(),
    )
}

/// GET /mcp opens a streaming session terminated on this worker
async fn mcp_stream_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let session_id = state
        .directory
        .session_id_from_headers(&headers)
        .unwrap_or_else(|| format!("gw-{}", Uuid::new_v4()));
    let identity = identity(&headers);

    let (transport, mut inbound) = ChannelTransport::new(SESSION_BUFFER);
    let (out_tx, out_rx) = mpsc::channel::<Value>(SESSION_BUFFER);
    state
        .registry
        .register(&session_id, Arc::new(transport))
        .await;

    let dispatcher = Arc::clone(&state.dispatcher);
    let sid = session_id.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                next = inbound.recv() => {
                    let Some(message) = next else { break };
                    let id = request_id(&message);
                    let response = dispatcher
                        .dispatch(Some(&sid), identity.as_deref(), message)
                        .await
                        .unwrap_or_else(|e| error_response(id, &e));
                    if out_tx.send(response).await.is_err() {
                        break;
                    }
                }
                () = out_tx.closed() => break,
            }
        }
        debug!(session_id = %sid, "Session stream closed");
    });

    info!(session_id = %session_id, "Client connected to stream");
    let stream = futures::stream::unfold(out_rx, |mut rx| async move {
        let message = rx.recv().await?;
        let event = Event::default().event("message").data(message.to_string());
        Some((Ok::<_, Infallible>(event), rx))
    });
    with_session_header(
        Sse::new(stream).keep_alive(KeepAlive::default()).into_response(),
        state.directory.session_header(),
        Some(&session_id),
    )
}

/// DELETE /mcp ends a local session
async fn mcp_delete_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> StatusCode {
    match state.directory.session_id_from_headers(&headers) {
        Some(sid) if state.registry.remove(&sid).await => StatusCode::NO_CONTENT,
        Some(_) => StatusCode::NOT_FOUND,
        None => StatusCode::BAD_REQUEST,
    }
}

fn parse_key(raw: &str) -> Result<PoolKey> {
    raw.parse()
}

async fn pools_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.directory.pools().get_all_stats())
}

async fn pool_handler(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse> {
    let key = parse_key(&raw)?;
    let pool = state
        .directory
        .pools()
        .get_pool(&key)
        .ok_or_else(|| Error::PoolNotFound(raw.clone()))?;
    Ok(Json(json!({
        "stats": pool.get_stats(),
        "connections": pool.connections(),
        "config": pool.config(),
    })))
}

async fn update_config_handler(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
    Json(config): Json<PoolConfig>,
) -> Result<impl IntoResponse> {
    let key = parse_key(&raw)?;
    let pools = state.directory.pools();
    pools.update_config(&key, config).await?;
    let stats = pools
        .get_pool(&key)
        .map(|pool| pool.get_stats())
        .ok_or(Error::PoolNotFound(raw))?;
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
struct DrainParams {
    timeout: Option<String>,
}

async fn drain_handler(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
    Query(params): Query<DrainParams>,
) -> Result<impl IntoResponse> {
    let key = parse_key(&raw)?;
    let timeout = match params.timeout.as_deref() {
        Some(t) => humantime_serde::parse(t)
            .map_err(|e| Error::Config(format!("invalid timeout {t:?}: {e}")))?,
        None => state.drain_timeout,
    };
    let status = state.directory.pools().drain_pool(&key, timeout).await?;
    info!(pool = %key, status = %status, "Pool drained by operator");
    Ok(Json(json!({ "pool": key.to_string(), "status": status })))
}

async fn reset_handler(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse> {
    let key = parse_key(&raw)?;
    let pools = state.directory.pools();
    pools.reset_pool(&key, state.drain_timeout).await?;
    let stats = pools
        .get_pool(&key)
        .map(|pool| pool.get_stats())
        .ok_or(Error::PoolNotFound(raw))?;
    info!(pool = %key, "Pool reset by operator");
    Ok(Json(stats))
}

async fn recommendation_handler(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse> {
    let key = parse_key(&raw)?;
    let pool = state
        .directory
        .pools()
        .get_pool(&key)
        .ok_or(Error::PoolNotFound(raw))?;
    Ok(Json(pool.get_strategy_recommendation()))
}

async fn affinity_metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "worker_id": state.directory.worker_id(),
        "enabled": state.directory.is_enabled(),
        "mapped_sessions": state.directory.mapping_count(),
        "local_sessions": state.registry.len(),
        "counters": state.directory.metrics().snapshot(),
    }))
}

/// POST /internal/forward, the direct relay used by peers
async fn internal_forward_handler(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<ForwardEnvelope>,
) -> Json<ForwardReply> {
    debug!(
        request_id = %envelope.request_id,
        session_id = %envelope.session_id,
        origin = %envelope.origin,
        "Serving forwarded request"
    );
    let request_id = envelope.request_id.clone();
    let response = state.dispatcher.execute_forwarded(envelope).await;
    Json(ForwardReply {
        request_id,
        response,
    })
}
