use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::Serialize;
use signal_proto::{
    ClientMessage, ConnectionId, Envelope, PeerId, ProtocolError, RelayMode, ServerMessage,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::PeerRegistry;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("connection {0} is not attached to the relay")]
    UnknownConnection(ConnectionId),
}

/// What the relay did with one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Registered {
        peer_id: PeerId,
        superseded: Option<ConnectionId>,
    },
    Forwarded {
        kind: &'static str,
        to: PeerId,
    },
    Broadcast {
        kind: &'static str,
        delivered: usize,
    },
    Dropped(RoutingMiss),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingMiss {
    /// Nobody registered under the recipient id.
    Unregistered(PeerId),
    /// The registration points at a connection that is already gone.
    Closed(PeerId),
}

/// Cleanup performed when a transport connection closes.
#[derive(Debug, Default)]
pub struct Disconnection {
    pub unregistered: Vec<PeerId>,
    pub stopped_sharing: Option<PeerId>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RelayStats {
    pub mode: RelayMode,
    pub connections: usize,
    pub registered_peers: usize,
}

struct ConnectionEntry {
    tx: mpsc::UnboundedSender<ServerMessage>,
    /// User id announced through `start-sharing` (broadcast profile only).
    sharing: Option<PeerId>,
}

/// In-memory signaling relay. Cloning shares the same state.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    mode: RelayMode,
    registry: PeerRegistry,
    connections: DashMap<ConnectionId, ConnectionEntry>,
}

impl Relay {
    pub fn new(mode: RelayMode) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                mode,
                registry: PeerRegistry::new(),
                connections: DashMap::new(),
            }),
        }
    }

    pub fn mode(&self) -> RelayMode {
        self.inner.mode
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    /// Attaches a new transport connection. Everything routed to it arrives,
    /// in order, on the returned receiver.
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let connection_id = ConnectionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.connections.insert(
            connection_id,
            ConnectionEntry { tx, sharing: None },
        );
        counter!("relay_connections_total", 1);
        self.record_gauges();
        debug!(connection_id = %connection_id, "connection attached");
        (connection_id, rx)
    }

    pub fn handle_text(
        &self,
        connection_id: ConnectionId,
        text: &str,
    ) -> Result<Delivery, RelayError> {
        let message = ClientMessage::from_text(text)?;
        self.handle(connection_id, message)
    }

    pub fn handle(
        &self,
        connection_id: ConnectionId,
        message: ClientMessage,
    ) -> Result<Delivery, RelayError> {
        if !self.inner.connections.contains_key(&connection_id) {
            return Err(RelayError::UnknownConnection(connection_id));
        }
        counter!("relay_messages_received_total", 1, "type" => message.kind());

        match message.into_envelope() {
            Ok(envelope) => self.route(connection_id, envelope),
            Err(control) => self.control(connection_id, control),
        }
    }

    pub fn disconnect(&self, connection_id: ConnectionId) -> Disconnection {
        let entry = self
            .inner
            .connections
            .remove(&connection_id)
            .map(|(_, entry)| entry);
        let unregistered = self.inner.registry.remove(connection_id);
        let stopped_sharing = entry.and_then(|entry| entry.sharing);

        if self.inner.mode == RelayMode::Broadcast {
            if let Some(user_id) = &stopped_sharing {
                let delivered = self.broadcast_except(
                    connection_id,
                    ServerMessage::UserDisconnected {
                        user_id: user_id.clone(),
                    },
                );
                info!(
                    user_id = %user_id,
                    delivered,
                    "sharer disconnected without stop-sharing"
                );
            }
        }

        self.record_gauges();
        info!(
            connection_id = %connection_id,
            unregistered = unregistered.len(),
            "connection detached"
        );
        Disconnection {
            unregistered,
            stopped_sharing,
        }
    }

    /// Forgets every registration and connection. Dropping the queues ends
    /// the per-connection writer tasks, which close their sockets.
    pub fn shutdown(&self) {
        let connections = self.inner.connections.len();
        self.inner.registry.clear();
        self.inner.connections.clear();
        self.record_gauges();
        info!(connections, "relay state cleared");
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            mode: self.inner.mode,
            connections: self.inner.connections.len(),
            registered_peers: self.inner.registry.len(),
        }
    }

    fn route(
        &self,
        sender: ConnectionId,
        envelope: Envelope,
    ) -> Result<Delivery, RelayError> {
        envelope.check(self.inner.mode)?;
        match self.inner.mode {
            RelayMode::Addressed => self.forward(envelope),
            RelayMode::Broadcast => {
                let kind = envelope.kind();
                let delivered = self.broadcast_except(sender, ServerMessage::from(envelope));
                counter!("relay_envelopes_forwarded_total", delivered as u64, "type" => kind);
                debug!(kind, delivered, "envelope broadcast");
                Ok(Delivery::Broadcast { kind, delivered })
            }
        }
    }

    fn forward(&self, envelope: Envelope) -> Result<Delivery, RelayError> {
        let kind = envelope.kind();
        let Some(to) = envelope.to.clone() else {
            return Err(ProtocolError::MissingAddress { kind, field: "to" }.into());
        };

        let Some(target) = self.inner.registry.lookup(&to) else {
            warn!(peer_id = %to, kind, "recipient not registered; dropping envelope");
            counter!("relay_routing_miss_total", 1, "type" => kind, "reason" => "unregistered");
            return Ok(Delivery::Dropped(RoutingMiss::Unregistered(to)));
        };

        let tx = self
            .inner
            .connections
            .get(&target)
            .map(|entry| entry.tx.clone());
        let sent = match tx {
            Some(tx) => tx.send(ServerMessage::from(envelope)).is_ok(),
            None => false,
        };
        if !sent {
            warn!(
                peer_id = %to,
                connection_id = %target,
                kind,
                "recipient connection closed; dropping envelope"
            );
            counter!("relay_routing_miss_total", 1, "type" => kind, "reason" => "closed");
            return Ok(Delivery::Dropped(RoutingMiss::Closed(to)));
        }

        counter!("relay_envelopes_forwarded_total", 1, "type" => kind);
        debug!(peer_id = %to, connection_id = %target, kind, "envelope forwarded");
        Ok(Delivery::Forwarded { kind, to })
    }

    fn control(
        &self,
        connection_id: ConnectionId,
        message: ClientMessage,
    ) -> Result<Delivery, RelayError> {
        match (self.inner.mode, message) {
            (RelayMode::Addressed, ClientMessage::Register { peer_id }) => {
                let superseded = self.inner.registry.register(peer_id.clone(), connection_id);
                match superseded {
                    Some(previous) if previous != connection_id => info!(
                        peer_id = %peer_id,
                        previous = %previous,
                        current = %connection_id,
                        "peer re-registered; previous connection superseded"
                    ),
                    _ => info!(peer_id = %peer_id, connection_id = %connection_id, "peer registered"),
                }
                self.record_gauges();
                Ok(Delivery::Registered {
                    peer_id,
                    superseded,
                })
            }
            (RelayMode::Broadcast, ClientMessage::StartSharing { user_id }) => {
                if let Some(mut entry) = self.inner.connections.get_mut(&connection_id) {
                    entry.sharing = Some(user_id.clone());
                }
                let delivered =
                    self.broadcast_except(connection_id, ServerMessage::NewUser { user_id: user_id.clone() });
                info!(user_id = %user_id, delivered, "sharing started");
                Ok(Delivery::Broadcast {
                    kind: "new-user",
                    delivered,
                })
            }
            (RelayMode::Broadcast, ClientMessage::StopSharing { user_id }) => {
                if let Some(mut entry) = self.inner.connections.get_mut(&connection_id) {
                    if entry.sharing.as_ref() == Some(&user_id) {
                        entry.sharing = None;
                    }
                }
                let delivered = self.broadcast_except(
                    connection_id,
                    ServerMessage::UserDisconnected {
                        user_id: user_id.clone(),
                    },
                );
                info!(user_id = %user_id, delivered, "sharing stopped");
                Ok(Delivery::Broadcast {
                    kind: "user-disconnected",
                    delivered,
                })
            }
            (mode, other) => Err(ProtocolError::WrongMode {
                message: other.kind(),
                mode,
            }
            .into()),
        }
    }

    fn broadcast_except(&self, sender: ConnectionId, message: ServerMessage) -> usize {
        let mut delivered = 0;
        for entry in self.inner.connections.iter() {
            if *entry.key() == sender {
                continue;
            }
            if entry.value().tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn record_gauges(&self) {
        gauge!(
            "relay_connections_active",
            self.inner.connections.len() as f64
        );
        gauge!(
            "relay_registered_peers",
            self.inner.registry.len() as f64
        );
    }
}
