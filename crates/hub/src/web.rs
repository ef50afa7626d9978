//! Operator HTTP API.

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::dispatcher::{CommandOutcome, Dispatcher};
use crate::engine::EngineHandle;
use crate::error::EngineError;
use crate::model::{ChannelRange, DataPoint, RelayKey, SensorChannel};
use crate::reconciler::Snapshot;

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub dispatcher: Arc<Dispatcher>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/snapshot", get(api_snapshot))
        .route("/api/history/{channel}", get(api_history))
        .route("/api/relays/{relay}/toggle", post(api_toggle_relay))
        .route("/api/auto-mode", put(api_auto_mode))
        .route("/api/profiles/{id}/activate", put(api_activate_profile))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct SnapshotView<'a> {
    #[serde(flatten)]
    snapshot: &'a Snapshot,
    ranges: Vec<ChannelRange>,
}

async fn api_snapshot(State(state): State<AppState>) -> Response {
    let snapshot = state.engine.snapshot();
    Json(SnapshotView {
        snapshot: &snapshot,
        ranges: snapshot.ranges(),
    })
    .into_response()
}

#[derive(Serialize)]
struct HistoryView<'a> {
    channel: SensorChannel,
    points: &'a [DataPoint],
}

async fn api_history(State(state): State<AppState>, Path(channel): Path<String>) -> Response {
    let channel: SensorChannel = match channel.parse() {
        Ok(c) => c,
        Err(msg) => return bad_request(msg),
    };
    let snapshot = state.engine.snapshot();
    Json(HistoryView {
        channel,
        points: snapshot.history.channel(channel),
    })
    .into_response()
}

async fn api_toggle_relay(State(state): State<AppState>, Path(relay): Path<String>) -> Response {
    let key: RelayKey = match relay.parse() {
        Ok(k) => k,
        Err(msg) => return bad_request(msg),
    };
    outcome(state.dispatcher.toggle_relay(key).await)
}

#[derive(Deserialize)]
struct AutoModeBody {
    enabled: bool,
}

async fn api_auto_mode(State(state): State<AppState>, Json(body): Json<AutoModeBody>) -> Response {
    outcome(state.dispatcher.set_auto_mode(body.enabled).await)
}

async fn api_activate_profile(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    outcome(state.dispatcher.activate_profile(&id).await)
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

fn outcome(result: Result<CommandOutcome, EngineError>) -> Response {
    match result {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => e.into_response(),
    }
}

fn bad_request(msg: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
}

fn status_for(e: &EngineError) -> StatusCode {
    match e {
        EngineError::AutoModeActive | EngineError::AxisBusy(_) => StatusCode::CONFLICT,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::CommandRejected(_) | EngineError::MalformedMessage(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        EngineError::RequestFailed(_) => StatusCode::BAD_GATEWAY,
        EngineError::TransportUnavailable | EngineError::EngineStopped => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        (
            status,
            Json(json!({
                "error": self.to_string(),
                "transient": self.is_transient(),
            })),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "operator api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
