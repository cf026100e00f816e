use dashmap::DashMap;
use signal_proto::{ConnectionId, PeerId};

/// Maps a stable peer id to the connection currently serving it.
///
/// A peer id has at most one connection at a time; registering again simply
/// replaces the previous mapping. Nothing here survives a relay restart, so
/// clients must register again after reconnecting.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: DashMap<PeerId, ConnectionId>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the connection id that was superseded, if any.
    pub fn register(&self, peer_id: PeerId, connection_id: ConnectionId) -> Option<ConnectionId> {
        self.peers.insert(peer_id, connection_id)
    }

    pub fn lookup(&self, peer_id: &PeerId) -> Option<ConnectionId> {
        self.peers.get(peer_id).map(|entry| *entry.value())
    }

    /// Drops every peer id that points at `connection_id`.
    pub fn remove(&self, connection_id: ConnectionId) -> Vec<PeerId> {
        let candidates: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|entry| *entry.value() == connection_id)
            .map(|entry| entry.key().clone())
            .collect();

        // A peer may have re-registered from a new connection between the
        // scan and the removal; only drop entries that still match.
        candidates
            .into_iter()
            .filter(|peer_id| {
                self.peers
                    .remove_if(peer_id, |_, current| *current == connection_id)
                    .is_some()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&self) {
        self.peers.clear();
    }
}
