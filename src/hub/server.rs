//! HTTP surface: websocket event stream, state snapshot, health.
//!
//! Three routes. `GET /ws` upgrades into the event stream: the client first
//! receives a hydration frame built from a fresh snapshot, then live frames
//! as they land. The listener attaches to the hub *before* the snapshot is
//! read, so a change racing the connect shows up in the snapshot, in the
//! stream, or both — never in neither. `GET /state` serves the same snapshot
//! over plain HTTP; `GET /health` answers liveness probes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::errors::{EngineError, ValidationError};
use crate::events::{ClientCommand, sync_frame};
use crate::hub::{EventHub, ListenerHandle};
use crate::store::StateStore;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: StateStore,
    pub hub: EventHub,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match &err {
            EngineError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            EngineError::Validation(ValidationError::Schema(_) | ValidationError::Semantic(_))
            | EngineError::InvalidTransition { .. } => ApiError::BadRequest(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/state", get(get_state))
        .route("/health", get(health_check))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the shutdown signal flips.
pub async fn serve(
    state: SharedState,
    bind: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), EngineError> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    let local = listener.local_addr().context("no local address")?;
    info!(address = %local, "serving events and state");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // Resolves when the signal flips or its sender goes away.
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("server error")?;
    Ok(())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn get_state(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.store.snapshot()?;
    Ok(Json(snapshot))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    // Attach before reading the snapshot so nothing can land in the window
    // between hydration and the first live frame.
    let listener = state.hub.register();
    let (mut sender, receiver) = socket.split();

    match hydration_frame(&state) {
        Ok(frame) => {
            if sender
                .send(Message::Text(frame.to_string().into()))
                .await
                .is_err()
            {
                return;
            }
        }
        Err(err) => {
            warn!(listener = listener.id(), %err, "state unreadable at connect; closing");
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    }

    run_socket(sender, receiver, state, listener).await;
}

/// Core socket loop: forward hub frames, accept client commands, keep the
/// connection alive with ping/pong.
async fn run_socket(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    state: SharedState,
    listener: ListenerHandle,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            frame = listener.next() => {
                let Some(frame) = frame else { break };
                if sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_command(&state, &listener, &text),
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
    debug!(listener = listener.id(), "socket closed");
}

fn handle_command(state: &SharedState, listener: &ListenerHandle, text: &str) {
    match ClientCommand::parse(text) {
        Some(ClientCommand::Subscribe { topics }) => listener.subscribe(&topics),
        Some(ClientCommand::Unsubscribe { topics }) => listener.unsubscribe(&topics),
        Some(ClientCommand::RequestSync) => match hydration_frame(state) {
            Ok(frame) => listener.send(frame),
            Err(err) => warn!(listener = listener.id(), %err, "sync request failed"),
        },
        None => debug!(listener = listener.id(), "ignoring unrecognized client frame"),
    }
}

fn hydration_frame(state: &SharedState) -> Result<Value, EngineError> {
    let snapshot = state.store.snapshot()?;
    let data =
        serde_json::to_value(&snapshot).map_err(|err| EngineError::Other(anyhow::Error::new(err)))?;
    Ok(sync_frame(data))
}

// ── Tests ─────────────────────────────────────────────────────────────
