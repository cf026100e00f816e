use async_trait::async_trait;
use signal_proto::{IceCandidate, PeerId, SessionDescription};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::IceServer;
use crate::error::PeerError;
use crate::media::{LocalTrack, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerConnectionState::New => "new",
            PeerConnectionState::Connecting => "connecting",
            PeerConnectionState::Connected => "connected",
            PeerConnectionState::Disconnected => "disconnected",
            PeerConnectionState::Failed => "failed",
            PeerConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
    /// ICE gathering produced a candidate that must reach the remote.
    LocalCandidate(IceCandidate),
    StateChanged(PeerConnectionState),
    RemoteTrack { id: String, kind: TrackKind },
}

/// Something a peer connection reported asynchronously. `generation`
/// identifies which peer connection for `remote` produced it, so events from
/// a replaced connection can be discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub remote: PeerId,
    pub generation: u64,
    pub kind: PeerEventKind,
}

/// Handed to each new peer connection for reporting its events.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    remote: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(remote: PeerId, generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            remote,
            generation,
            tx,
        }
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the controller is gone.
    pub fn emit(&self, kind: PeerEventKind) -> bool {
        self.tx
            .send(PeerEvent {
                remote: self.remote.clone(),
                generation: self.generation,
                kind,
            })
            .is_ok()
    }
}

/// The subset of a WebRTC peer connection the controller drives. Session
/// descriptions and candidates travel as the opaque JSON blobs the relay
/// forwards.
#[async_trait]
pub trait MediaPeer: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    async fn add_track(&self, track: &LocalTrack, stream_id: &str) -> Result<(), PeerError>;
    async fn close(&self) -> Result<(), PeerError>;
    fn connection_state(&self) -> PeerConnectionState;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn MediaPeer>, PeerError>;
}
