//! HTTP management API and WebSocket chat endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use parley_config::GatewayConfig;
use parley_core::{
    AgentContext, AgentRegistry, AuthenticatedUser, KeyStatus, SessionKey, StartError,
    StartOutcome,
};

use crate::hub::ChatHub;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ChatHub>,
    pub registry: Arc<AgentRegistry>,
}

#[derive(Deserialize)]
struct StartRequest {
    channel_id: String,
    user_id: String,
    #[serde(default)]
    agreement_summary: Option<String>,
    #[serde(default)]
    user_email: Option<String>,
}

#[derive(Deserialize)]
struct StopRequest {
    channel_id: String,
    user_id: String,
}

#[derive(Serialize)]
struct AgentReply {
    agent_id: String,
    status: &'static str,
    active_agents: usize,
}

#[derive(Serialize)]
struct ErrorReply {
    error: String,
}

#[derive(Deserialize)]
struct WsParams {
    conversation: String,
    #[serde(default = "default_sender")]
    sender: String,
}

fn default_sender() -> String {
    "anonymous".to_string()
}

#[derive(Deserialize)]
struct WsInFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    message_id: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/agent/start", post(start_agent))
        .route("/api/agent/stop", post(stop_agent))
        .route("/api/agent/status", get(agent_status))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Bind and serve until `shutdown` fires.
pub async fn run(
    config: &GatewayConfig,
    state: AppState,
    shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid gateway listen address: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("gateway listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = shutdown.await;
        })
        .await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn start_agent(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Response {
    if req.channel_id.trim().is_empty() || req.user_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorReply {
                error: "channel_id and user_id are required".to_string(),
            }),
        )
            .into_response();
    }

    let key = SessionKey::derive(&req.user_id, &req.channel_id);
    let ctx = AgentContext {
        conversation_id: req.channel_id.clone(),
        agreement_summary: req.agreement_summary.clone(),
        user: Some(AuthenticatedUser {
            uid: req.user_id.clone(),
            email: req.user_email.clone(),
        }),
    };

    match state.registry.get_or_create(&key, &ctx).await {
        Ok(outcome) => {
            let status = match outcome {
                StartOutcome::Created(_) => "created",
                StartOutcome::Existing(_) => "exists",
                StartOutcome::Pending => "pending",
            };
            let reply = AgentReply {
                agent_id: key.as_str().to_string(),
                status,
                active_agents: state.registry.active_count().await,
            };
            Json(reply).into_response()
        }
        Err(StartError::MissingCredential(e)) => {
            error!("agent start rejected for {key}: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorReply {
                    error: format!("provider credentials missing: {e}"),
                }),
            )
                .into_response()
        }
        Err(StartError::CreationFailed(e)) => {
            error!("agent start failed for {key}: {e:#}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorReply {
                    error: format!("failed to create agent: {e}"),
                }),
            )
                .into_response()
        }
    }
}

async fn stop_agent(State(state): State<AppState>, Json(req): Json<StopRequest>) -> Response {
    let key = SessionKey::derive(&req.user_id, &req.channel_id);
    state.registry.remove(&key).await;
    let reply = AgentReply {
        agent_id: key.as_str().to_string(),
        status: "disposed",
        active_agents: state.registry.active_count().await,
    };
    Json(reply).into_response()
}

#[derive(Deserialize)]
struct StatusParams {
    channel_id: Option<String>,
    user_id: Option<String>,
}

/// Aggregate status, or a per-key connection state when the caller names a
/// user/channel pair.
async fn agent_status(
    State(state): State<AppState>,
    Query(params): Query<StatusParams>,
) -> Response {
    if let (Some(channel_id), Some(user_id)) = (&params.channel_id, &params.user_id) {
        let key = SessionKey::derive(user_id, channel_id);
        let status = match state.registry.key_status(&key).await {
            KeyStatus::Active => "connected",
            KeyStatus::Pending => "connecting",
            KeyStatus::Absent => "disconnected",
        };
        return Json(serde_json::json!({
            "agent_id": key.as_str(),
            "status": status,
            "active_agents": state.registry.active_count().await,
        }))
        .into_response();
    }
    Json(state.registry.status().await).into_response()
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state, params))
        .into_response()
}

async fn handle_ws(socket: WebSocket, state: AppState, params: WsParams) {
    let conversation_id = params.conversation;
    let sender_id = params.sender;
    info!("ws connected: conversation={conversation_id} sender={sender_id}");

    let (ws_write, mut ws_read) = socket.split();
    let (conn_id, rx) = state.hub.attach_socket(&conversation_id);
    let write_handle = tokio::spawn(ws_write_loop(ws_write, rx));

    while let Some(result) = ws_read.next().await {
        let msg = match result {
            Ok(m) => m,
            Err(e) => {
                warn!("ws read error for conversation={conversation_id}: {e}");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                let frame: WsInFrame = match serde_json::from_str(&text) {
                    Ok(f) => f,
                    Err(_) => continue,
                };
                match frame.frame_type.as_str() {
                    "message" => {
                        if frame.text.trim().is_empty() {
                            continue;
                        }
                        state
                            .hub
                            .post_human_message(&conversation_id, &sender_id, &frame.text);
                    }
                    "stop" => {
                        if frame.message_id.is_empty() {
                            continue;
                        }
                        state.hub.request_stop(&frame.message_id);
                    }
                    _ => {}
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.hub.detach_socket(&conversation_id, conn_id);
    write_handle.abort();
    info!("ws disconnected: conversation={conversation_id}");
}

async fn ws_write_loop(
    mut ws_write: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(json) = rx.recv().await {
        if let Err(e) = ws_write.send(Message::Text(json.into())).await {
            warn!("ws write error: {e}");
            break;
        }
    }
}
