use futures_util::{SinkExt, StreamExt};
use signal_proto::{ClientMessage, PeerId, RelayMode, ServerMessage};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};

use crate::error::SignalingError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket connection to the relay, split into an outbound queue and an
/// inbound stream of relay messages.
pub struct SignalingClient {
    sender: mpsc::UnboundedSender<ClientMessage>,
    inbound: Option<mpsc::UnboundedReceiver<ServerMessage>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingClient {
    /// Connects and, against an addressed relay, registers `local_id`.
    pub async fn connect(
        url: &str,
        mode: RelayMode,
        local_id: &PeerId,
    ) -> Result<Self, SignalingError> {
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| SignalingError::Timeout(url.to_string()))??;
        tracing::debug!(target = "webrtc", url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (sender, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<ServerMessage>();

        let writer_handle = tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.tick().await;
            loop {
                let frame = tokio::select! {
                    message = send_rx.recv() => match message {
                        Some(message) => match message.to_text() {
                            Ok(text) => Message::Text(text),
                            Err(err) => {
                                tracing::warn!(target = "webrtc", error = %err, "failed to encode signaling message");
                                continue;
                            }
                        },
                        None => break,
                    },
                    _ = keepalive.tick() => Message::Ping(Vec::new()),
                };
                if ws_write.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_handle = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "webrtc", "signaling websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "webrtc", "signaling websocket error: {err}");
                            }
                        }
                        break;
                    }
                };

                match ServerMessage::from_text(&text) {
                    Ok(message) => {
                        tracing::trace!(target = "webrtc", event = "ws_in", kind = message.kind());
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "unparseable relay frame dropped");
                    }
                }
            }
        });

        let client = SignalingClient {
            sender,
            inbound: Some(inbound),
            tasks: vec![writer_handle, reader_handle],
        };

        if mode == RelayMode::Addressed {
            client.send(ClientMessage::Register {
                peer_id: local_id.clone(),
            })?;
            tracing::debug!(target = "webrtc", peer_id = %local_id, "sent register");
        }
        Ok(client)
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        self.sender
            .send(message)
            .map_err(|_| SignalingError::ChannelClosed)
    }

    /// Queue the controller writes outbound envelopes into.
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.sender.clone()
    }

    /// Relay messages, in arrival order. Can be taken once.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<ServerMessage>> {
        self.inbound.take()
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
    }
}
