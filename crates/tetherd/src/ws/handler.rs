//! WebSocket handler for streaming subscribers.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::time::Duration;

use super::hub::EventHub;
use crate::agent::Notification;
use crate::api::AppState;

/// Keep-alive interval to detect dead connections.
const PING_INTERVAL_SECS: u64 = 30;

/// Interval between synthesized status snapshots.
const STATUS_INTERVAL_SECS: u64 = 15;

const PING_FRAME: &str = r#"{"kind":"ping"}"#;

/// WebSocket upgrade handler.
///
/// GET /ws (authentication enforced by the route middleware)
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (mut notifications, subscriber_id) = state.hub.subscribe();
    info!("stream subscriber {subscriber_id} connected");

    // Late subscribers get no backlog; seed them with one status snapshot
    // so they know what they connected to.
    let snapshot = Notification::status(state.supervisor.health().await);
    if send_notification(&mut sender, &snapshot).await.is_err() {
        state.hub.unsubscribe(subscriber_id);
        return;
    }

    let supervisor = state.supervisor.clone();
    let send_task = tokio::spawn(async move {
        let mut ping_interval =
            tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        let mut status_interval =
            tokio::time::interval(Duration::from_secs(STATUS_INTERVAL_SECS));
        // Both fire immediately on the first tick; the snapshot above
        // already covered that.
        ping_interval.tick().await;
        status_interval.tick().await;

        loop {
            tokio::select! {
                notification = notifications.recv() => {
                    let Some(notification) = notification else { break };
                    if send_notification(&mut sender, &notification).await.is_err() {
                        break;
                    }
                }

                _ = status_interval.tick() => {
                    let snapshot = Notification::status(supervisor.health().await);
                    if send_notification(&mut sender, &snapshot).await.is_err() {
                        break;
                    }
                }

                _ = ping_interval.tick() => {
                    if sender.send(Message::Text(PING_FRAME.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Drain the client side until it closes; inbound frames carry nothing
    // the bridge acts on.
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Close(_)) => {
                debug!("subscriber {subscriber_id} sent close");
                break;
            }
            Ok(Message::Text(text)) => {
                debug!("subscriber {subscriber_id} sent text frame, ignoring: {text}");
            }
            Ok(_) => {}
            Err(err) => {
                warn!("subscriber {subscriber_id} socket error: {err}");
                break;
            }
        }
    }

    send_task.abort();
    state.hub.unsubscribe(subscriber_id);
    info!("stream subscriber {subscriber_id} disconnected");
}

async fn send_notification(
    sender: &mut SplitSink<WebSocket, Message>,
    notification: &Notification,
) -> Result<(), ()> {
    let json = match serde_json::to_string(notification) {
        Ok(json) => json,
        Err(err) => {
            warn!("failed to serialize notification: {err}");
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}
