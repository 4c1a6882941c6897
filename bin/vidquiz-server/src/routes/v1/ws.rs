//! Live task events over WebSocket.
//!
//! The socket is greeted with `connected`, then receives every progress,
//! segment and terminal event of the task as JSON text frames. The server
//! pings every 30 seconds and drops connections that never answer.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vidquiz_core::TaskEvent;
use vidquiz_core::store::DurableStore;

use crate::error::ServerError;
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const EVENT_BUFFER: usize = 64;
const PONG_REPLY: &str = r#"{"type":"pong"}"#;

#[utoipa::path(
    get,
    path = "/v1/tasks/{id}/ws",
    tag = "tasks",
    params(("id" = String, Path, description = "Task identifier")),
    responses(
        (status = 101, description = "Switching to the WebSocket event stream"),
        (status = 404, description = "Task not found"),
    )
)]
pub async fn task_events(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ServerError> {
    let known = state.orchestrator.status(&id).await.is_some()
        || state.store.load_task(&id).await?.is_some();
    if !known {
        return Err(ServerError::NotFound(format!("task {id} not found")));
    }
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, id)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, task_id: String) {
    let (tx, mut rx) = mpsc::channel::<TaskEvent>(EVENT_BUFFER);
    let subscriber = state.orchestrator.subscribe(&task_id, Arc::new(tx)).await;
    debug!(task_id = %task_id, subscriber, "event subscriber attached");

    let (mut sender, mut receiver) = socket.split();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if is_ping(text.as_str())
                            && sender.send(Message::Text(PONG_REPLY.into())).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Err(e)) => {
                        debug!(task_id = %task_id, error = %e, "websocket receive failed");
                        break;
                    }
                }
            }
            event = rx.recv() => {
                let Some(event) = event else { break };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(task_id = %task_id, error = %e, "failed to serialize task event");
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if awaiting_pong {
                    debug!(task_id = %task_id, "websocket heartbeat timed out");
                    break;
                }
                awaiting_pong = true;
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.orchestrator.unsubscribe(&task_id, subscriber);
    let _ = sender.close().await;
    debug!(task_id = %task_id, subscriber, "event subscriber detached");
}

/// Application-level keepalive sent by browser clients that cannot issue
/// protocol pings.
fn is_ping(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "ping"))
        .unwrap_or(false)
}
