//! Real-time result delivery over WebSockets.
//!
//! A client joins the room for a batch by sending a `join` event carrying
//! the batch id and the issuer's bearer token. Room membership is bound to
//! the verified identity that submitted the batch: knowing or guessing a
//! batch id is not enough to observe another user's results.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use mast_proto::ResultMessage;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Join { batch_id: String, token: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Joined { batch_id: String },
    Result(mast_proto::CommandResult),
    Completed(mast_proto::BatchCompleted),
    Error { message: String },
}

impl From<ResultMessage> for ServerMessage {
    fn from(message: ResultMessage) -> Self {
        match message {
            ResultMessage::Result(r) => ServerMessage::Result(r),
            ResultMessage::Completed(c) => ServerMessage::Completed(c),
        }
    }
}

/// Decide whether the presented token may join the room for `batch_id`.
pub(crate) async fn authorize_join(
    state: &AppState,
    batch_id: &str,
    token: &str,
) -> Result<(), String> {
    let claims = state
        .verifier
        .verify(token)
        .await
        .map_err(|err| format!("invalid token: {err}"))?;
    match state.submitters.get(batch_id) {
        Some(submitter) if *submitter.value() == claims.subject => Ok(()),
        Some(_) => Err("batch was submitted by a different user".into()),
        None => Err("unknown batch".into()),
    }
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Forward outbound frames from the channel to the socket.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&msg) else {
                continue;
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Rooms this connection joined, for cleanup on disconnect.
    let mut subscriptions: Vec<(String, u64)> = Vec::new();
    let mut forwarders = Vec::new();

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "websocket receive error");
                break;
            }
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let message = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => message,
            Err(err) => {
                let _ = tx.send(ServerMessage::Error {
                    message: format!("invalid message format: {err}"),
                });
                continue;
            }
        };

        match message {
            ClientMessage::Join { batch_id, token } => {
                handle_join(
                    &state,
                    batch_id,
                    token,
                    &tx,
                    &mut subscriptions,
                    &mut forwarders,
                )
                .await;
            }
        }
    }

    for (batch_id, subscriber) in subscriptions {
        state.rooms.unsubscribe(&batch_id, subscriber);
    }
    for forwarder in forwarders {
        forwarder.abort();
    }
    writer.abort();
    debug!("websocket disconnected");
}

/// Authorize and register one room join: subscribe to the room, spawn a
/// forwarder pumping room frames onto the outbound channel, then ack with
/// `Joined`. The forwarder owns its own sender clone so the connection's
/// sender stays available for later joins and errors.
async fn handle_join(
    state: &AppState,
    batch_id: String,
    token: String,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    subscriptions: &mut Vec<(String, u64)>,
    forwarders: &mut Vec<tokio::task::JoinHandle<()>>,
) {
    if let Err(reason) = authorize_join(state, &batch_id, &token).await {
        warn!(%batch_id, %reason, "room join refused");
        let _ = tx.send(ServerMessage::Error { message: reason });
        return;
    }
    let (subscriber, mut room_rx) = state.rooms.subscribe(&batch_id);
    subscriptions.push((batch_id.clone(), subscriber));
    let forward_tx = tx.clone();
    forwarders.push(tokio::spawn(async move {
        while let Some(result) = room_rx.recv().await {
            if forward_tx.send(ServerMessage::from(result)).is_err() {
                break;
            }
        }
    }));
    let _ = tx.send(ServerMessage::Joined { batch_id });
}
