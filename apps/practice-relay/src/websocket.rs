use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::relay::{Relay, RelayError};
use crate::server::AppState;

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, relay, remote_addr))
}

/// Pumps one client connection until it closes.
async fn handle_socket(socket: WebSocket, relay: Relay, remote_addr: SocketAddr) {
    let (connection_id, mut rx) = relay.connect();
    let (mut sender, mut receiver) = socket.split();

    // Writer task: one ordered queue per connection keeps per-sender order.
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match message.to_text() {
                Ok(text) => text,
                Err(err) => {
                    warn!(connection_id = %connection_id, error = %err, "failed to encode outbound frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
        debug!(connection_id = %connection_id, "writer task ended");
    });

    debug!(connection_id = %connection_id, remote_addr = %remote_addr, "websocket connected");

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "websocket error");
                break;
            }
        };

        match frame {
            Message::Text(text) => dispatch(&relay, connection_id, &text),
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => dispatch(&relay, connection_id, &text),
                Err(_) => {
                    debug!(connection_id = %connection_id, "ignoring non-UTF8 binary frame");
                }
            },
            Message::Close(_) => {
                debug!(connection_id = %connection_id, "received close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    relay.disconnect(connection_id);
    debug!(connection_id = %connection_id, remote_addr = %remote_addr, "websocket disconnected");
}

/// Fire-and-forget: failures are logged and counted, never echoed back.
fn dispatch(relay: &Relay, connection_id: signal_proto::ConnectionId, text: &str) {
    match relay.handle_text(connection_id, text) {
        Ok(delivery) => {
            debug!(connection_id = %connection_id, ?delivery, "message handled");
        }
        Err(RelayError::Protocol(err)) => {
            counter!("relay_rejected_frames_total", 1);
            warn!(connection_id = %connection_id, error = %err, "rejected client frame");
        }
        Err(err) => {
            warn!(connection_id = %connection_id, error = %err, "failed to handle client frame");
        }
    }
}
