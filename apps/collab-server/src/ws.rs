use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use collaboration::{SyncMessage, UserId};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use crate::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    // Every connection is a fresh participant
    let user_id = UserId::new();
    info!("New WebSocket connection: user={}", user_id);

    let mut outbox = state.relay.connect(user_id.clone());

    // Split socket
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Spawn task to drain the relay outbox into the WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbox.recv().await {
            let json = match msg.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize {} message: {}", msg.kind(), e);
                    continue;
                }
            };

            if let Err(e) = ws_tx.send(Message::Text(json)).await {
                debug!("Failed to send message to WebSocket: {}", e);
                break;
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => match SyncMessage::from_json(&text) {
                Ok(msg) => {
                    if let Err(e) = state.relay.handle_message(&user_id, msg).await {
                        warn!("Error handling message from {}: {}", user_id, e);
                    }
                }
                Err(e) => {
                    warn!("Dropping malformed message from {}: {}", user_id, e);
                }
            },
            Ok(Message::Binary(data)) => {
                debug!("Ignoring binary message ({} bytes)", data.len());
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // Pong replies are queued by the protocol layer
            }
            Ok(Message::Close(_)) => {
                info!("WebSocket closed by client");
                break;
            }
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
        }
    }

    // Cleanup
    state.relay.disconnect(&user_id).await;
    send_task.abort();
    info!("WebSocket disconnected: user={}", user_id);
}
