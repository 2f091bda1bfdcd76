//! Control-plane HTTP + observer duplex channel (spec §6), mirroring the
//! teacher's `serve_cmd.rs` router/handler/`AppError` shape.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path as AxumPath, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use haivemind_core::orchestrator::SessionOrchestrator;
use haivemind_core::snapshot::{self, Checkpoint};
use haivemind_core::Broadcaster;
use haivemind_state::models::{Project, SessionStatus};
use haivemind_state::{Engine, Protocol};

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: msg.into() }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: format!("{err:#}") }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Shared application state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub broadcaster: Broadcaster,
    pub orchestrator: Arc<SessionOrchestrator>,
    pub base_dir: PathBuf,
    /// Project registry (`<baseDir>/projects.json`), keyed by slug.
    pub projects: Arc<RwLock<HashMap<String, Project>>>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/rollback", post(rollback_session))
        .route("/sessions/{id}/diff", get(diff_session))
        .route("/checkpoints", get(list_checkpoints))
        .route("/interrupted", get(list_interrupted))
        .route("/interrupted/{id}/resume", post(resume_interrupted))
        .route("/interrupted/{id}/discard", post(discard_interrupted))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

pub async fn run_server(state: AppState, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().context("invalid bind address")?;
    info!(%addr, "haivemind control plane listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SessionSummary {
    id: Uuid,
    project_slug: String,
    status: SessionStatus,
    prompt: String,
    task_count: usize,
}

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let mut summaries = Vec::new();
    for id in state.engine.list_session_ids().await {
        if let Some(session_arc) = state.engine.get_session(id).await {
            let session = session_arc.lock().await;
            summaries.push(SessionSummary {
                id: session.id,
                project_slug: session.project_slug.clone(),
                status: session.status,
                prompt: session.prompt.clone(),
                task_count: session.plan.len(),
            });
        }
    }
    Json(summaries)
}

async fn get_session(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let session_arc = state
        .engine
        .get_session(id)
        .await
        .ok_or_else(|| AppError::not_found(format!("session {id} not found")))?;
    let session = session_arc.lock().await;
    Ok(Json(session.clone()))
}

async fn rollback_session(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let session_arc = state
        .engine
        .get_session(id)
        .await
        .ok_or_else(|| AppError::not_found(format!("session {id} not found")))?;
    let session = session_arc.lock().await;
    snapshot::rollback_to_snapshot(&session.work_dir, &session.snapshot).map_err(AppError::internal)?;
    Ok(Json(json!({ "sessionId": id, "rolledBack": true })))
}

async fn diff_session(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let session_arc = state
        .engine
        .get_session(id)
        .await
        .ok_or_else(|| AppError::not_found(format!("session {id} not found")))?;
    let session = session_arc.lock().await;
    let diff = snapshot::get_snapshot_diff(&session.work_dir, &session.snapshot).map_err(AppError::internal)?;
    Ok(Json(diff))
}

// ---------------------------------------------------------------------------
// Checkpoints / interrupted inbox
// ---------------------------------------------------------------------------

fn read_checkpoints(dir: PathBuf) -> Vec<Checkpoint> {
    let Ok(entries) = std::fs::read_dir(&dir) else { return Vec::new(); };
    entries
        .flatten()
        .filter(|e| e.path().extension().and_then(|e| e.to_str()) == Some("json"))
        .filter_map(|e| std::fs::read_to_string(e.path()).ok())
        .filter_map(|contents| serde_json::from_str::<Checkpoint>(&contents).ok())
        .collect()
}

async fn list_checkpoints(State(state): State<AppState>) -> impl IntoResponse {
    let projects = state.projects.read().await;
    let mut checkpoints = Vec::new();
    for project in projects.values() {
        checkpoints.extend(read_checkpoints(project.dir.join(".haivemind").join("checkpoints")));
    }
    Json(checkpoints)
}

async fn list_interrupted(State(state): State<AppState>) -> impl IntoResponse {
    Json(read_checkpoints(state.base_dir.join(".haivemind").join("interrupted")))
}

fn interrupted_path(base_dir: &std::path::Path, id: Uuid) -> PathBuf {
    base_dir.join(".haivemind").join("interrupted").join(format!("{id}.json"))
}

async fn resume_interrupted(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let path = interrupted_path(&state.base_dir, id);
    let contents = std::fs::read_to_string(&path)
        .map_err(|_| AppError::not_found(format!("interrupted session {id} not found")))?;
    let checkpoint: Checkpoint = serde_json::from_str(&contents).map_err(|e| AppError::internal(e.into()))?;

    let projects = state.projects.read().await;
    let project = projects
        .get(&checkpoint.project_slug)
        .cloned()
        .ok_or_else(|| AppError::not_found(format!("project {} not registered", checkpoint.project_slug)))?;
    drop(projects);

    state
        .orchestrator
        .start_session(project, checkpoint.prompt.clone(), None)
        .await
        .map_err(AppError::internal)?;
    let _ = std::fs::remove_file(&path);
    Ok(Json(json!({ "sessionId": id, "resumed": true })))
}

async fn discard_interrupted(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let path = interrupted_path(&state.base_dir, id);
    if !path.exists() {
        return Err(AppError::not_found(format!("interrupted session {id} not found")));
    }
    std::fs::remove_file(&path).map_err(|e| AppError::internal(e.into()))?;
    Ok(Json(json!({ "sessionId": id, "discarded": true })))
}

// ---------------------------------------------------------------------------
// Observer duplex channel
// ---------------------------------------------------------------------------

/// Heartbeat interval for the observer socket (spec §4.7).
const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Bridge one observer's `WebSocket` to the broadcast plane: forward every
/// `Protocol` message the observer is subscribed to out over the socket,
/// and every client->server frame into `orchestrator`/`engine` handlers.
/// Terminates the connection if a ping goes unanswered for one interval.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (observer_id, mut rx) = state.broadcaster.register().await;
    let mut pong_pending = false;
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break; };
                let Ok(text) = serde_json::to_string(&msg) else { continue; };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(err) = handle_client_frame(&state, observer_id, &text).await {
                            warn!(%err, "failed to handle observer frame");
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_pending = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                if pong_pending {
                    warn!(%observer_id, "observer missed heartbeat pong, closing");
                    break;
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                pong_pending = true;
            }
        }
    }

    state.broadcaster.unregister(observer_id).await;
}

async fn handle_client_frame(state: &AppState, observer_id: Uuid, text: &str) -> Result<()> {
    let envelope: Protocol = serde_json::from_str(text).context("invalid client frame")?;
    match &envelope {
        Protocol::SessionStart(payload) => {
            let slug = payload
                .get("projectSlug")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("SESSION_START missing projectSlug"))?;
            let prompt = payload
                .get("prompt")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("SESSION_START missing prompt"))?
                .to_string();
            let projects = state.projects.read().await;
            let project = projects.get(slug).cloned().ok_or_else(|| anyhow::anyhow!("project {slug} not registered"))?;
            drop(projects);
            let orchestrator = state.orchestrator.clone();
            tokio::spawn(async move {
                if let Err(err) = orchestrator.start_session(project, prompt, None).await {
                    warn!(%err, "session run failed");
                }
            });
        }
        Protocol::GateResponse(payload) => {
            let session_id = envelope
                .session_id()
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| anyhow::anyhow!("GATE_RESPONSE missing sessionId"))?;
            let task_id = envelope.task_id().ok_or_else(|| anyhow::anyhow!("GATE_RESPONSE missing taskId"))?;
            let approved = payload.get("approved").and_then(|v| v.as_bool()).unwrap_or(false);
            let feedback = payload.get("feedback").and_then(|v| v.as_str()).map(|s| s.to_string());
            state.orchestrator.resolve_gate(session_id, task_id, approved, feedback).await;
        }
        Protocol::ChatMessage(payload) => {
            let session_id = envelope
                .session_id()
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| anyhow::anyhow!("CHAT_MESSAGE missing sessionId"))?;
            let message = payload
                .get("message")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("CHAT_MESSAGE missing message"))?
                .to_string();
            let session_arc = state
                .engine
                .get_session(session_id)
                .await
                .ok_or_else(|| anyhow::anyhow!("unknown session {session_id}"))?;
            let project_slug = session_arc.lock().await.project_slug.clone();
            let projects = state.projects.read().await;
            let project = projects
                .get(&project_slug)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("project {project_slug} not registered"))?;
            drop(projects);
            state.orchestrator.handle_chat_message(session_id, &project, message).await?;
        }
        Protocol::WsSubscribe(payload) => {
            let slug = payload
                .get("projectSlug")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("WS_SUBSCRIBE missing projectSlug"))?;
            state.broadcaster.subscribe(observer_id, slug).await;
        }
        Protocol::WsUnsubscribe(payload) => {
            let slug = payload
                .get("projectSlug")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("WS_UNSUBSCRIBE missing projectSlug"))?;
            state.broadcaster.unsubscribe(observer_id, slug).await;
        }
        other => {
            warn!(tag = other.type_tag(), "unhandled client->server frame type");
        }
    }
    Ok(())
}
