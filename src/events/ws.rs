//! Dashboard event stream: `/ws/events` WebSocket and `/api/events` SSE.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::broadcaster::{ChannelFilter, EventBroadcaster};
use crate::federation::secret_matches;
use crate::hub::protocol::{ClientMessage, ServerMessage};

/// Shared state for dashboard subscribers.
#[derive(Clone)]
pub struct DashboardState {
    pub events: EventBroadcaster,
    /// Credential dashboards must present; `None` accepts an empty `auth`.
    pub token: Option<Arc<SecretString>>,
}

/// Build the router for `/ws/events` and `/api/events`.
pub fn dashboard_routes(state: DashboardState) -> Router {
    Router::new()
        .route("/ws/events", get(ws_handler))
        .route("/api/events", get(sse_handler))
        .with_state(state)
}

impl DashboardState {
    fn accepts(&self, presented: Option<&str>) -> bool {
        match (&self.token, presented) {
            (None, _) => true,
            (Some(expected), Some(given)) => secret_matches(expected.expose_secret(), given),
            (Some(_), None) => false,
        }
    }
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<DashboardState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send(socket: &mut WebSocket, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode dashboard message");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: DashboardState) {
    // Authentication must be the first frame.
    let authenticated = match socket.recv().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Auth { token, .. }) => state.accepts(token.as_deref()),
            _ => false,
        },
        _ => false,
    };

    if !authenticated {
        let _ = send(
            &mut socket,
            &ServerMessage::AuthFailed {
                reason: "authentication required".to_string(),
            },
        )
        .await;
        let _ = socket.send(Message::Close(None)).await;
        debug!("Dashboard subscriber rejected");
        return;
    }

    if !send(
        &mut socket,
        &ServerMessage::AuthSuccess {
            worker_id: None,
            capabilities: Vec::new(),
        },
    )
    .await
    {
        return;
    }
    info!("Dashboard subscriber connected");

    let mut filter = ChannelFilter::default();
    let mut rx = state.events.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if filter.matches(&event)
                            && !send(&mut socket, &ServerMessage::Event { event }).await
                        {
                            debug!("Dashboard subscriber disconnected during send");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Dashboard subscriber lagged behind broadcast");
                        let notice = ServerMessage::Error {
                            message: format!("missed {n} events"),
                        };
                        if !send(&mut socket, &notice).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Subscribe { channels }) => {
                                filter.subscribe(channels);
                                Some(ServerMessage::Subscribed { channels: filter.channels() })
                            }
                            Ok(ClientMessage::Unsubscribe { channels }) => {
                                filter.unsubscribe(&channels);
                                Some(ServerMessage::Unsubscribed { channels })
                            }
                            Ok(ClientMessage::Ping) => Some(ServerMessage::Pong),
                            Ok(other) => {
                                debug!(kind = other.kind(), "Ignoring dashboard message");
                                None
                            }
                            Err(e) => {
                                debug!(error = %e, "Malformed dashboard message");
                                None
                            }
                        };
                        if let Some(reply) = reply {
                            if !send(&mut socket, &reply).await {
                                break;
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
                        warn!(error = %e, "Dashboard WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("Dashboard subscriber disconnected");
}

// ── Server-sent events ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SseQuery {
    /// Comma-separated channel list; defaults to everything.
    channels: Option<String>,
    token: Option<String>,
}

async fn sse_handler(
    State(state): State<DashboardState>,
    Query(query): Query<SseQuery>,
) -> axum::response::Response {
    if !state.accepts(query.token.as_deref()) {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }

    let filter = match query.channels {
        Some(list) => {
            let mut filter = ChannelFilter::default();
            filter.subscribe(
                list.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
            );
            filter
        }
        None => ChannelFilter::all(),
    };

    let stream = state.events.stream(filter).map(|event| {
        Ok::<Event, Infallible>(
            Event::default()
                .event(event.kind.as_str())
                .json_data(&event)
                .unwrap_or_else(|_| Event::default().comment("unserializable event")),
        )
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}
