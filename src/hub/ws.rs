//! Worker WebSocket endpoint: `/ws/worker`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, ServerMessage};
use super::registry::{TaskReport, WorkerHub};
use crate::error::HubError;
use crate::events::{ChannelFilter, EventBroadcaster};

/// How long a new connection may take to send `auth`.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct WorkerSocketState {
    hub: Arc<WorkerHub>,
    events: EventBroadcaster,
}

/// Build the router for `/ws/worker`.
pub fn worker_routes(hub: Arc<WorkerHub>, events: EventBroadcaster) -> Router {
    Router::new()
        .route("/ws/worker", get(ws_handler))
        .with_state(WorkerSocketState { hub, events })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WorkerSocketState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send(socket: &mut WebSocket, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode worker message");
            true
        }
    }
}

async fn reject(socket: &mut WebSocket, reason: String) {
    debug!(reason = %reason, "Worker connection rejected");
    let _ = send(socket, &ServerMessage::AuthFailed { reason }).await;
    let _ = socket.send(Message::Close(None)).await;
}

/// Run the handshake. Returns the registered worker id and its outbound queue.
async fn handshake(
    socket: &mut WebSocket,
    hub: &WorkerHub,
) -> Option<(String, mpsc::Receiver<ServerMessage>)> {
    let first = match tokio::time::timeout(AUTH_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<ClientMessage>(&text).ok(),
        Ok(_) => None,
        Err(_) => {
            reject(socket, "authentication timed out".to_string()).await;
            return None;
        }
    };

    let Some(ClientMessage::Auth {
        token,
        capabilities,
        metadata,
    }) = first
    else {
        reject(socket, "authentication required".to_string()).await;
        return None;
    };

    let scope = match hub.authenticate(token.as_deref()).await {
        Ok(scope) => scope,
        Err(e) => {
            let reason = match e {
                HubError::AuthFailed { reason } => reason,
                other => other.to_string(),
            };
            reject(socket, reason).await;
            return None;
        }
    };

    let (tx, rx) = mpsc::channel(hub.config().outbound_buffer.max(1));
    let (worker_id, granted) = hub.register(scope, capabilities, metadata, tx).await;

    let ok = send(
        socket,
        &ServerMessage::AuthSuccess {
            worker_id: Some(worker_id.clone()),
            capabilities: granted,
        },
    )
    .await;
    if !ok {
        hub.remove_worker(&worker_id, "connection closed").await;
        return None;
    }
    Some((worker_id, rx))
}

async fn handle_socket(mut socket: WebSocket, state: WorkerSocketState) {
    let hub = state.hub;
    let Some((worker_id, mut outbound)) = handshake(&mut socket, &hub).await else {
        return;
    };

    let mut filter = ChannelFilter::default();
    let mut events = state.events.subscribe();
    let mut reason = "connection closed";

    loop {
        tokio::select! {
            // Messages the hub queued for this worker. `None` means the hub dropped it.
            queued = outbound.recv() => {
                match queued {
                    Some(msg) => {
                        if !send(&mut socket, &msg).await {
                            break;
                        }
                    }
                    None => {
                        debug!(worker_id = %worker_id, "Worker removed by hub");
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            result = events.recv() => {
                match result {
                    Ok(event) => {
                        if filter.matches(&event)
                            && !send(&mut socket, &ServerMessage::Event { event }).await
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        if !filter.is_empty() {
                            let notice = ServerMessage::Error {
                                message: format!("missed {n} events"),
                            };
                            if !send(&mut socket, &notice).await {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(worker_id = %worker_id, "Event channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        match handle_client_message(&hub, &worker_id, &text, &mut filter).await {
                            Ok(Some(reply)) => {
                                if !send(&mut socket, &reply).await {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(HubError::AuthFailed { reason: why }) => {
                                warn!(worker_id = %worker_id, reason = %why, "Worker credential rejected");
                                let _ = send(&mut socket, &ServerMessage::AuthFailed { reason: why }).await;
                                let _ = socket.send(Message::Close(None)).await;
                                reason = "credential rejected";
                                break;
                            }
                            Err(HubError::WorkerNotFound { .. }) => break,
                            Err(e) => {
                                debug!(worker_id = %worker_id, error = %e, "Worker message not handled");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(worker_id = %worker_id, error = %e, "Worker WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    hub.remove_worker(&worker_id, reason).await;
    info!(worker_id = %worker_id, "Worker connection closed");
}

/// Handle one frame from an authenticated worker, returning an optional reply.
async fn handle_client_message(
    hub: &WorkerHub,
    worker_id: &str,
    text: &str,
    filter: &mut ChannelFilter,
) -> Result<Option<ServerMessage>, HubError> {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(worker_id = %worker_id, error = %e, "Malformed worker message ignored");
            return Ok(None);
        }
    };

    // A ping is the worker's heartbeat; both paths re-check its token.
    match msg {
        ClientMessage::Ping => hub.heartbeat(worker_id).await?,
        _ => hub.check_credentials(worker_id).await?,
    }

    let report = match msg {
        ClientMessage::Ping => return Ok(Some(ServerMessage::Pong)),
        ClientMessage::Auth { .. } => {
            return Ok(Some(ServerMessage::Error {
                message: "already authenticated".to_string(),
            }));
        }
        ClientMessage::Subscribe { channels } => {
            filter.subscribe(channels);
            return Ok(Some(ServerMessage::Subscribed {
                channels: filter.channels(),
            }));
        }
        ClientMessage::Unsubscribe { channels } => {
            filter.unsubscribe(&channels);
            return Ok(Some(ServerMessage::Unsubscribed { channels }));
        }
        ClientMessage::TaskStarted { task_id } => TaskReport::Started { task_id },
        ClientMessage::TaskProgress {
            task_id,
            progress,
            message,
        } => TaskReport::Progress {
            task_id,
            progress,
            message,
        },
        ClientMessage::TaskComplete { task_id, result } => TaskReport::Complete { task_id, result },
        ClientMessage::TaskError { task_id, error } => TaskReport::Error { task_id, error },
    };

    debug!(worker_id = %worker_id, task_id = %report.task_id(), "Task report");
    hub.report(worker_id, report).await?;
    Ok(None)
}
