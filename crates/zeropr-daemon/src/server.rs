//! HTTP API + WebSocket relay
//!
//! Features:
//! - JSON API for peers, status, broadcast, presence, sessions and files
//! - `/ws/sync/:session_id` attaches one socket to the session's relay group
//! - Errors map to status codes with a `{"error": ...}` body

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use zeropr_core::{CursorPosition, Error, Peer, Presence, Session};

use crate::files::{self, FileError};
use crate::state::{DaemonState, DaemonStatus};

/// Time a closing socket gets to flush queued payloads
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type AppState = Arc<DaemonState>;

/// Error response: status code plus `{"error": message}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::SessionNotFound(_) | Error::PeerNotFound(_) | Error::ConnectionRejected(_) => {
                StatusCode::NOT_FOUND
            }
            Error::AlreadyBroadcasting => StatusCode::CONFLICT,
            Error::RegistrationFailed(_) | Error::TransientDiscovery(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<FileError> for ApiError {
    fn from(err: FileError) -> Self {
        let status = match &err {
            FileError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            FileError::NotFound(_) => StatusCode::NOT_FOUND,
            FileError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("API error: {}", self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresenceRequest {
    active_file: Option<String>,
    cursor: Option<CursorPosition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    file_path: String,
    initiator: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MembershipRequest {
    session_id: String,
    participant_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileSendRequest {
    file_path: String,
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SyncQuery {
    participant: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/peers", get(list_peers))
        .route("/api/peers/:id", get(get_peer))
        .route("/api/status", get(status))
        .route("/api/broadcast/start", post(start_broadcast))
        .route("/api/broadcast/stop", post(stop_broadcast))
        .route("/api/presence", post(update_presence))
        .route("/api/session/create", post(create_session))
        .route("/api/session/join", post(join_session))
        .route("/api/session/leave", post(leave_session))
        .route("/api/sessions", get(list_sessions))
        .route("/api/file/get", get(file_get))
        .route("/api/file/send", post(file_send))
        .route("/ws/sync/:session_id", get(ws_sync))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Serve until the daemon's shutdown token fires
pub async fn serve(state: AppState, listener: TcpListener) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    info!("🌐 HTTP API listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn list_peers(State(state): State<AppState>) -> Json<Value> {
    let peers = state.registry.get_all().await;
    Json(json!({ "peers": peers }))
}

async fn get_peer(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Peer>> {
    state
        .registry
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| Error::PeerNotFound(id).into())
}

async fn status(State(state): State<AppState>) -> Json<DaemonStatus> {
    Json(state.status().await)
}

async fn start_broadcast(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.broadcast.start_broadcast().await?;
    Ok(Json(json!({ "status": "started" })))
}

async fn stop_broadcast(State(state): State<AppState>) -> Json<Value> {
    state.broadcast.stop_broadcast().await;
    Json(json!({ "status": "stopped" }))
}

async fn update_presence(
    State(state): State<AppState>,
    Json(req): Json<PresenceRequest>,
) -> ApiResult<Json<Value>> {
    let active_file = req.active_file.filter(|f| !f.trim().is_empty());
    let presence: Presence = state.broadcast.update_presence(active_file, req.cursor).await?;
    debug!(status = %presence.status, file = ?presence.active_file, "Presence updated");
    Ok(Json(json!({ "status": "updated", "presence": presence })))
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<Json<Value>> {
    if req.file_path.trim().is_empty() || req.initiator.trim().is_empty() {
        return Err(ApiError::bad_request("filePath and initiator are required"));
    }

    let session = state.sessions.create_session(&req.file_path, &req.initiator).await;
    Ok(Json(json!({
        "sessionId": session.id,
        "filePath": session.file_path,
        "wsUrl": format!("ws://localhost:{}/ws/sync/{}", state.config.http_port, session.id),
    })))
}

async fn join_session(
    State(state): State<AppState>,
    Json(req): Json<MembershipRequest>,
) -> ApiResult<Json<Value>> {
    let session = state.relay.join(&req.session_id, &req.participant_id).await?;
    Ok(Json(json!({ "status": "joined", "session": session })))
}

async fn leave_session(
    State(state): State<AppState>,
    Json(req): Json<MembershipRequest>,
) -> ApiResult<Json<Value>> {
    let still_open = state.relay.leave(&req.session_id, &req.participant_id).await?;
    Ok(Json(json!({ "status": "left", "sessionClosed": !still_open })))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions: Vec<Session> = state.sessions.get_all_sessions().await;
    Json(json!({ "sessions": sessions }))
}

async fn file_get(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Json<Value>> {
    let path = query
        .path
        .ok_or_else(|| ApiError::bad_request("missing path parameter"))?;
    file_response(&state, path).await
}

async fn file_send(
    State(state): State<AppState>,
    Json(req): Json<FileSendRequest>,
) -> ApiResult<Json<Value>> {
    file_response(&state, req.file_path).await
}

async fn file_response(state: &DaemonState, path: String) -> ApiResult<Json<Value>> {
    let content = files::read_shared(state.workspace(), &path).await?;
    Ok(Json(json!({
        "filePath": path,
        "content": content,
        "status": "success",
    })))
}

async fn health_check() -> &'static str {
    "OK"
}

/// GET /ws/sync/:session_id - unknown sessions are refused before the upgrade
async fn ws_sync(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<SyncQuery>,
) -> ApiResult<Response> {
    if !state.sessions.contains(&session_id).await {
        return Err(Error::ConnectionRejected(session_id).into());
    }

    let participant = query
        .participant
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| "anonymous".to_string());

    Ok(ws.on_upgrade(move |socket| relay_socket(socket, state, session_id, participant)))
}

async fn relay_socket(socket: WebSocket, state: AppState, session_id: String, participant: String) {
    let (conn, mut outbound) = match state.relay.attach(&session_id, &participant).await {
        Ok(attached) => attached,
        Err(e) => {
            warn!(session = %session_id, "Relay attach failed: {}", e);
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    // Ends when the relay drops our queue (detach, leave, stalled, shutdown)
    let mut writer = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if sink.send(Message::Binary(payload.to_vec())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });
    let mut writer_done = false;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(bytes))) => {
                    state.relay.dispatch(&conn, Arc::new(bytes)).await;
                }
                Some(Ok(Message::Text(text))) => {
                    state.relay.dispatch(&conn, Arc::new(text.into_bytes())).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Ping/pong are answered by the transport
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn = conn.id(), "WebSocket read error: {}", e);
                    break;
                }
            },
        }
    }

    state.relay.detach(&conn).await;

    if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}
