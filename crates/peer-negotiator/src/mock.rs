//! In-process stand-ins for the WebRTC primitive and the capture devices.

use async_trait::async_trait;
use serde_json::json;
use signal_proto::{IceCandidate, PeerId, SessionDescription};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::IceServer;
use crate::error::{MediaError, PeerError};
use crate::media::{LocalMedia, LocalTrack, MediaConstraints, MediaSource, TrackCodec, TrackKind};
use crate::peer::{MediaPeer, PeerConnectionState, PeerEventKind, PeerEventSink, PeerFactory};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records every call the controller makes. Like a real peer connection, it
/// refuses candidates until a remote description is set.
pub struct MockPeer {
    events: PeerEventSink,
    reject_remote_description: bool,
    state: Mutex<PeerConnectionState>,
    local_descriptions: Mutex<Vec<SessionDescription>>,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    tracks: Mutex<Vec<String>>,
}

impl MockPeer {
    fn new(events: PeerEventSink, reject_remote_description: bool) -> Self {
        Self {
            events,
            reject_remote_description,
            state: Mutex::new(PeerConnectionState::New),
            local_descriptions: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
        }
    }

    pub fn remote(&self) -> &PeerId {
        self.events.remote()
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        lock(&self.local_descriptions).clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        lock(&self.remote_descriptions).clone()
    }

    /// Remote candidates applied so far, in order.
    pub fn candidates(&self) -> Vec<IceCandidate> {
        lock(&self.candidates).clone()
    }

    pub fn track_ids(&self) -> Vec<String> {
        lock(&self.tracks).clone()
    }

    /// Simulates ICE gathering producing a local candidate.
    pub fn emit_candidate(&self, candidate: IceCandidate) -> bool {
        self.events.emit(PeerEventKind::LocalCandidate(candidate))
    }

    pub fn emit_state(&self, state: PeerConnectionState) -> bool {
        *lock(&self.state) = state;
        self.events.emit(PeerEventKind::StateChanged(state))
    }

    pub fn emit_remote_track(&self, id: &str, kind: TrackKind) -> bool {
        self.events.emit(PeerEventKind::RemoteTrack {
            id: id.to_string(),
            kind,
        })
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if *lock(&self.state) == PeerConnectionState::Closed {
            return Err(PeerError::Closed);
        }
        Ok(())
    }

    fn description(&self, kind: &str) -> SessionDescription {
        SessionDescription(json!({
            "type": kind,
            "sdp": format!("v=0\r\ns=mock-{kind} {} {}\r\n", self.remote(), self.generation()),
        }))
    }
}

#[async_trait]
impl MediaPeer for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        Ok(self.description("offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        if lock(&self.remote_descriptions).is_empty() {
            return Err(PeerError::Rejected {
                op: "create answer",
                reason: "no remote offer".to_string(),
            });
        }
        Ok(self.description("answer"))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        lock(&self.local_descriptions).push(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        if self.reject_remote_description {
            return Err(PeerError::Rejected {
                op: "set remote description",
                reason: "malformed sdp".to_string(),
            });
        }
        lock(&self.remote_descriptions).push(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;
        if lock(&self.remote_descriptions).is_empty() {
            return Err(PeerError::Rejected {
                op: "add ice candidate",
                reason: "remote description not set".to_string(),
            });
        }
        lock(&self.candidates).push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack, _stream_id: &str) -> Result<(), PeerError> {
        self.ensure_open()?;
        lock(&self.tracks).push(track.id().to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        let mut state = lock(&self.state);
        if *state != PeerConnectionState::Closed {
            *state = PeerConnectionState::Closed;
            drop(state);
            self.events
                .emit(PeerEventKind::StateChanged(PeerConnectionState::Closed));
        }
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        *lock(&self.state)
    }
}

/// Hands out [`MockPeer`]s and keeps a handle to each one.
#[derive(Default)]
pub struct MockPeerFactory {
    created: Mutex<Vec<Arc<MockPeer>>>,
    reject_remote_descriptions: AtomicBool,
}

impl MockPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers created after this call fail `set_remote_description`.
    pub fn reject_remote_descriptions(&self, reject: bool) {
        self.reject_remote_descriptions
            .store(reject, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<MockPeer>> {
        lock(&self.created).clone()
    }

    /// Most recent peer connection opened towards `remote`.
    pub fn latest_for(&self, remote: &PeerId) -> Option<Arc<MockPeer>> {
        lock(&self.created)
            .iter()
            .rev()
            .find(|peer| peer.remote() == remote)
            .cloned()
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn MediaPeer>, PeerError> {
        let peer = Arc::new(MockPeer::new(
            events,
            self.reject_remote_descriptions.load(Ordering::SeqCst),
        ));
        lock(&self.created).push(Arc::clone(&peer));
        Ok(peer as Arc<dyn MediaPeer>)
    }
}

/// Capture source that never touches a device.
#[derive(Default)]
pub struct MockMediaSource {
    failure: Option<MediaError>,
    issued: Mutex<Vec<LocalMedia>>,
}

impl MockMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failure: MediaError) -> Self {
        Self {
            failure: Some(failure),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Every capture handed out; the tracks share state with the
    /// controller's copies.
    pub fn issued(&self) -> Vec<LocalMedia> {
        lock(&self.issued).clone()
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        let kinds = constraints.requested();
        if kinds.is_empty() {
            return Err(MediaError::NothingRequested);
        }

        let mut issued = lock(&self.issued);
        let serial = issued.len();
        let tracks = kinds
            .into_iter()
            .map(|kind| {
                let codec = match kind {
                    TrackKind::Audio => TrackCodec::opus(),
                    TrackKind::Video => TrackCodec::vp8(),
                };
                LocalTrack::new(format!("mock-{kind}-{serial}"), kind, codec)
            })
            .collect();
        let media = LocalMedia::new(format!("mock-stream-{serial}"), tracks);
        issued.push(media.clone());
        Ok(media)
    }
}
