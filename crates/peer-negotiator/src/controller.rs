use signal_proto::{
    ClientMessage, Envelope, IceCandidate, PeerId, RelayMode, ServerMessage, SessionDescription,
    Signal,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::NegotiatorConfig;
use crate::error::{NegotiationError, PeerError};
use crate::media::{LocalMedia, MediaConstraints, MediaSource, TrackKind};
use crate::peer::{
    MediaPeer, PeerConnectionState, PeerEvent, PeerEventKind, PeerEventSink, PeerFactory,
};
use crate::state::{AnswerDisposition, CallDisposition, NegotiationState, OfferDisposition};

/// Key of the single shared session used against a broadcast relay, where
/// envelopes carry no peer ids.
pub const SHARED_REMOTE: &str = "*";

/// Per-remote cap on candidates held before a session exists. The oldest
/// are dropped first.
pub const MAX_EARLY_CANDIDATES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

struct PeerSession {
    peer: Arc<dyn MediaPeer>,
    generation: u64,
    state: NegotiationState,
    remote_description_set: bool,
    /// Remote candidates received before the remote description, in
    /// receipt order.
    pending_ice: VecDeque<IceCandidate>,
    opened_at: Instant,
    connection_state: PeerConnectionState,
    remote_tracks: Vec<RemoteTrack>,
}

/// Candidates that arrived before any session with their remote.
struct EarlyCandidates {
    first_seen: Instant,
    queue: VecDeque<IceCandidate>,
}

impl EarlyCandidates {
    fn new(now: Instant) -> Self {
        Self {
            first_seen: now,
            queue: VecDeque::new(),
        }
    }

    fn push(&mut self, candidate: IceCandidate) -> bool {
        let overflowed = self.queue.len() >= MAX_EARLY_CANDIDATES;
        if overflowed {
            self.queue.pop_front();
        }
        self.queue.push_back(candidate);
        overflowed
    }
}

impl PeerSession {
    fn transition(&mut self, remote: &PeerId, to: NegotiationState) {
        debug!(peer_id = %remote, from = %self.state, to = %to, "negotiation state");
        self.state = to;
    }
}

fn peer_failure(remote: &PeerId, op: &'static str) -> impl FnOnce(PeerError) -> NegotiationError {
    let remote = remote.clone();
    move |source| NegotiationError::Peer { remote, op, source }
}

/// Drives offer/answer/ICE for one local participant.
///
/// Owned by a single task; every entry point takes `&mut self`, so inbound
/// signaling, peer events and user commands never run concurrently.
pub struct NegotiationController {
    local_id: PeerId,
    config: NegotiatorConfig,
    factory: Arc<dyn PeerFactory>,
    media_source: Arc<dyn MediaSource>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    local_media: Option<LocalMedia>,
    sessions: HashMap<PeerId, PeerSession>,
    /// Candidates for remotes that have no session yet.
    early_ice: HashMap<PeerId, EarlyCandidates>,
    /// Remotes whose session was closed. Their candidates are dropped until
    /// they offer again or we call them.
    closed: HashSet<PeerId>,
    sharers: HashSet<PeerId>,
    next_generation: u64,
}

impl NegotiationController {
    /// Returns the controller and the stream of events its peer connections
    /// report. Feed those back through [`handle_peer_event`].
    ///
    /// [`handle_peer_event`]: NegotiationController::handle_peer_event
    pub fn new(
        local_id: PeerId,
        config: NegotiatorConfig,
        factory: Arc<dyn PeerFactory>,
        media_source: Arc<dyn MediaSource>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            local_id,
            config,
            factory,
            media_source,
            outbound,
            events_tx,
            local_media: None,
            sessions: HashMap::new(),
            early_ice: HashMap::new(),
            closed: HashSet::new(),
            sharers: HashSet::new(),
            next_generation: 0,
        };
        (controller, events_rx)
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    pub fn state(&self, remote: &PeerId) -> Option<NegotiationState> {
        self.sessions
            .get(&self.session_key(remote))
            .map(|session| session.state)
    }

    pub fn connection_state(&self, remote: &PeerId) -> Option<PeerConnectionState> {
        self.sessions
            .get(&self.session_key(remote))
            .map(|session| session.connection_state)
    }

    pub fn remote_tracks(&self, remote: &PeerId) -> &[RemoteTrack] {
        self.sessions
            .get(&self.session_key(remote))
            .map(|session| session.remote_tracks.as_slice())
            .unwrap_or(&[])
    }

    /// Remote candidates waiting for a remote description.
    pub fn buffered_candidates(&self, remote: &PeerId) -> usize {
        let key = self.session_key(remote);
        let pending = self
            .sessions
            .get(&key)
            .map_or(0, |session| session.pending_ice.len());
        pending + self.early_ice.get(&key).map_or(0, |early| early.queue.len())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.local_media.as_ref()
    }

    pub fn is_sharing(&self) -> bool {
        self.local_media.is_some()
    }

    /// Users announced through `new-user` and not yet disconnected.
    pub fn known_sharers(&self) -> impl Iterator<Item = &PeerId> {
        self.sharers.iter()
    }

    /// Starts negotiating with `remote`. A repeated call while an offer is
    /// outstanding (or the session is connected) does nothing.
    pub async fn call(&mut self, remote: PeerId) -> Result<(), NegotiationError> {
        let remote = self.session_key(&remote);
        let state = self
            .sessions
            .get(&remote)
            .map_or(NegotiationState::Idle, |session| session.state);

        match state.on_call() {
            CallDisposition::Start => {}
            CallDisposition::AlreadyNegotiating => {
                debug!(peer_id = %remote, state = %state, "call ignored; negotiation already under way");
                return Ok(());
            }
            CallDisposition::Conflict => {
                return Err(NegotiationError::StateConflict {
                    remote,
                    state,
                    action: "call",
                })
            }
        }

        self.closed.remove(&remote);
        if !self.sessions.contains_key(&remote) {
            self.open_session(&remote).await?;
        }
        self.send_offer(&remote).await
    }

    /// Acquires local media and, against a broadcast relay, announces the
    /// share and offers it to every viewer. Media failures are returned and
    /// leave the controller not sharing.
    pub async fn start_sharing(
        &mut self,
        constraints: MediaConstraints,
    ) -> Result<(), NegotiationError> {
        if self.local_media.is_some() {
            debug!("start_sharing ignored; already sharing");
            return Ok(());
        }

        let media = match self.media_source.acquire(constraints).await {
            Ok(media) => media,
            Err(err) => {
                warn!(error = %err, "could not acquire local media");
                return Err(err.into());
            }
        };
        info!(
            stream_id = media.stream_id(),
            tracks = media.tracks().len(),
            "local media acquired"
        );
        self.local_media = Some(media);

        if self.config.mode == RelayMode::Broadcast {
            self.send(ClientMessage::StartSharing {
                user_id: self.local_id.clone(),
            })?;
            self.call(PeerId::from(SHARED_REMOTE)).await?;
        }
        Ok(())
    }

    /// Ends every local track and closes every peer connection before
    /// returning.
    pub async fn stop_sharing(&mut self) {
        let media = self.local_media.take();
        if let Some(media) = &media {
            media.stop();
        }

        let remotes: Vec<PeerId> = self.sessions.keys().cloned().collect();
        for remote in &remotes {
            self.close_session(remote).await;
        }
        self.early_ice.clear();

        if media.is_some() && self.config.mode == RelayMode::Broadcast {
            if let Err(err) = self.send(ClientMessage::StopSharing {
                user_id: self.local_id.clone(),
            }) {
                warn!(error = %err, "could not announce stop-sharing");
            }
        }
        info!(closed = remotes.len(), "sharing stopped");
    }

    /// Closes the session with `remote`. Closing the last session also stops
    /// local media; closing a remote with no session leaves it running.
    pub async fn close_peer(&mut self, remote: &PeerId) -> bool {
        let remote = self.session_key(remote);
        self.early_ice.remove(&remote);
        let closed = self.close_session(&remote).await;

        if closed && self.sessions.is_empty() {
            if let Some(media) = self.local_media.take() {
                media.stop();
                info!("last peer connection closed; local media stopped");
            }
        }
        closed
    }

    /// Closes sessions that have not reached `Connected` within the
    /// configured stall timeout and discards early candidates no offer
    /// claimed in that time. Does nothing without a timeout.
    pub async fn reap_stalled(&mut self, now: Instant) -> Vec<PeerId> {
        let Some(timeout) = self.config.policy.stall_timeout else {
            return Vec::new();
        };

        self.early_ice.retain(|remote, early| {
            let fresh = now.saturating_duration_since(early.first_seen) < timeout;
            if !fresh {
                debug!(peer_id = %remote, dropped = early.queue.len(), "early candidates expired");
            }
            fresh
        });

        let stalled: Vec<PeerId> = self
            .sessions
            .iter()
            .filter(|(_, session)| {
                session.state != NegotiationState::Connected
                    && now.saturating_duration_since(session.opened_at) >= timeout
            })
            .map(|(remote, _)| remote.clone())
            .collect();

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        for remote in &stalled {
            warn!(peer_id = %remote, timeout_ms, "negotiation stalled; closing");
            self.close_peer(remote).await;
        }
        stalled
    }

    /// Applies one message from the relay. Failures are logged and never
    /// tear down the session they concern.
    ///
    /// `new-user` only records the sharer. Viewers never start a negotiation
    /// themselves: the sharer offers once, right after announcing, so a
    /// viewer that connects after that offer receives no stream until the
    /// sharer shares again.
    pub async fn handle_server_message(&mut self, message: ServerMessage) {
        let kind = message.kind();
        let result = match message.into_envelope() {
            Ok(Envelope { from, signal, .. }) => match self.remote_for(from, kind) {
                Some(remote) => match signal {
                    Signal::Offer(offer) => self.accept_offer(remote, offer).await,
                    Signal::Answer(answer) => self.accept_answer(remote, answer).await,
                    Signal::IceCandidate(candidate) => {
                        self.accept_candidate(remote, candidate).await;
                        Ok(())
                    }
                },
                None => Ok(()),
            },
            Err(ServerMessage::NewUser { user_id }) => {
                info!(user_id = %user_id, "sharer announced");
                self.sharers.insert(user_id);
                Ok(())
            }
            Err(ServerMessage::UserDisconnected { user_id }) => {
                self.user_disconnected(user_id).await;
                Ok(())
            }
            Err(other) => {
                debug!(kind = other.kind(), "unhandled relay message");
                Ok(())
            }
        };

        if let Err(err) = result {
            warn!(kind, error = %err, "signaling step failed");
        }
    }

    /// Applies an event reported by a peer connection. Events from replaced
    /// or closed connections are dropped.
    pub fn handle_peer_event(&mut self, event: PeerEvent) {
        let Some(session) = self.sessions.get_mut(&event.remote) else {
            debug!(peer_id = %event.remote, "event for closed session dropped");
            return;
        };
        if session.generation != event.generation {
            debug!(
                peer_id = %event.remote,
                generation = event.generation,
                current = session.generation,
                "event from replaced peer connection dropped"
            );
            return;
        }

        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                let message = self.envelope_to(&event.remote, Signal::IceCandidate(candidate));
                if let Err(err) = self.send(message) {
                    warn!(peer_id = %event.remote, error = %err, "could not send local candidate");
                }
            }
            PeerEventKind::StateChanged(state) => {
                session.connection_state = state;
                match state {
                    PeerConnectionState::Failed | PeerConnectionState::Disconnected => {
                        warn!(peer_id = %event.remote, state = %state, "peer connection degraded")
                    }
                    _ => info!(peer_id = %event.remote, state = %state, "peer connection state"),
                }
            }
            PeerEventKind::RemoteTrack { id, kind } => {
                info!(peer_id = %event.remote, track_id = %id, kind = %kind, "remote track received");
                session.remote_tracks.push(RemoteTrack { id, kind });
            }
        }
    }

    /// Closes every session and stops local media.
    pub async fn shutdown(&mut self) {
        self.stop_sharing().await;
        self.sharers.clear();
        self.closed.clear();
    }

    fn session_key(&self, remote: &PeerId) -> PeerId {
        match self.config.mode {
            RelayMode::Addressed => remote.clone(),
            RelayMode::Broadcast => PeerId::from(SHARED_REMOTE),
        }
    }

    fn remote_for(&self, from: Option<PeerId>, kind: &'static str) -> Option<PeerId> {
        match (self.config.mode, from) {
            (RelayMode::Broadcast, _) => Some(PeerId::from(SHARED_REMOTE)),
            (RelayMode::Addressed, Some(from)) => Some(from),
            (RelayMode::Addressed, None) => {
                warn!(kind, "addressed envelope without sender dropped");
                None
            }
        }
    }

    fn envelope_to(&self, remote: &PeerId, signal: Signal) -> ClientMessage {
        let envelope = match self.config.mode {
            RelayMode::Addressed => {
                Envelope::addressed(self.local_id.clone(), remote.clone(), signal)
            }
            RelayMode::Broadcast => Envelope::unaddressed(signal),
        };
        ClientMessage::from(envelope)
    }

    fn send(&self, message: ClientMessage) -> Result<(), NegotiationError> {
        self.outbound
            .send(message)
            .map_err(|_| NegotiationError::SignalingClosed)
    }

    fn peer(&self, remote: &PeerId) -> Option<Arc<dyn MediaPeer>> {
        self.sessions
            .get(remote)
            .map(|session| Arc::clone(&session.peer))
    }

    async fn open_session(&mut self, remote: &PeerId) -> Result<(), NegotiationError> {
        let generation = self.next_generation;
        self.next_generation += 1;

        let sink = PeerEventSink::new(remote.clone(), generation, self.events_tx.clone());
        let peer = self
            .factory
            .create(&self.config.ice_servers, sink)
            .await
            .map_err(peer_failure(remote, "create peer connection"))?;

        if let Some(media) = &self.local_media {
            for track in media.live_tracks() {
                if let Err(err) = peer.add_track(track, media.stream_id()).await {
                    let _ = peer.close().await;
                    return Err(peer_failure(remote, "add track")(err));
                }
            }
        }

        let pending_ice = self
            .early_ice
            .remove(remote)
            .map(|early| early.queue)
            .unwrap_or_default();
        debug!(
            peer_id = %remote,
            generation,
            buffered = pending_ice.len(),
            "peer connection opened"
        );
        self.sessions.insert(
            remote.clone(),
            PeerSession {
                peer,
                generation,
                state: NegotiationState::Idle,
                remote_description_set: false,
                pending_ice,
                opened_at: Instant::now(),
                connection_state: PeerConnectionState::New,
                remote_tracks: Vec::new(),
            },
        );
        Ok(())
    }

    /// Drops the session and closes its peer connection. Buffered candidates
    /// go back to the early queue so they survive a replacement.
    async fn replace_session(&mut self, remote: &PeerId) -> Result<(), NegotiationError> {
        if let Some(session) = self.sessions.remove(remote) {
            if !session.pending_ice.is_empty() {
                let early = self
                    .early_ice
                    .entry(remote.clone())
                    .or_insert_with(|| EarlyCandidates::new(session.opened_at));
                for candidate in session.pending_ice {
                    early.push(candidate);
                }
            }
            if let Err(err) = session.peer.close().await {
                warn!(peer_id = %remote, error = %err, "failed to close replaced peer connection");
            }
        }
        self.open_session(remote).await
    }

    async fn close_session(&mut self, remote: &PeerId) -> bool {
        let Some(mut session) = self.sessions.remove(remote) else {
            return false;
        };
        session.transition(remote, NegotiationState::Closed);
        self.closed.insert(remote.clone());
        if let Err(err) = session.peer.close().await {
            warn!(peer_id = %remote, error = %err, "failed to close peer connection");
        }
        info!(peer_id = %remote, "peer connection closed");
        true
    }

    async fn send_offer(&mut self, remote: &PeerId) -> Result<(), NegotiationError> {
        let Some(peer) = self.peer(remote) else {
            return Ok(());
        };
        let offer = peer
            .create_offer()
            .await
            .map_err(peer_failure(remote, "create offer"))?;
        peer.set_local_description(offer.clone())
            .await
            .map_err(peer_failure(remote, "set local offer"))?;

        if let Some(session) = self.sessions.get_mut(remote) {
            session.transition(remote, NegotiationState::HaveLocalOffer);
        }
        self.send(self.envelope_to(remote, Signal::Offer(offer)))?;
        info!(peer_id = %remote, "offer sent");
        Ok(())
    }

    async fn accept_offer(
        &mut self,
        remote: PeerId,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.closed.remove(&remote);
        let state = self
            .sessions
            .get(&remote)
            .map_or(NegotiationState::Idle, |session| session.state);
        let local = match self.config.mode {
            RelayMode::Addressed => Some(&self.local_id),
            RelayMode::Broadcast => None,
        };

        match state.on_offer(local, &remote) {
            OfferDisposition::Accept => {
                if !self.sessions.contains_key(&remote) {
                    self.open_session(&remote).await?;
                }
            }
            OfferDisposition::Renegotiate => {
                debug!(peer_id = %remote, "renegotiation offer received");
            }
            OfferDisposition::KeepLocalOffer => {
                info!(peer_id = %remote, "offer collision; keeping local offer");
                return Ok(());
            }
            OfferDisposition::YieldToRemote => {
                info!(peer_id = %remote, "offer collision; yielding to remote offer");
                self.replace_session(&remote).await?;
            }
            OfferDisposition::Conflict => {
                return Err(NegotiationError::StateConflict {
                    remote,
                    state,
                    action: "accept offer",
                })
            }
        }

        let Some(peer) = self.peer(&remote) else {
            return Ok(());
        };
        let resting = self
            .sessions
            .get(&remote)
            .map_or(NegotiationState::Idle, |session| session.state);
        if let Some(session) = self.sessions.get_mut(&remote) {
            session.transition(&remote, NegotiationState::HaveRemoteOffer);
        }

        if let Err(err) = peer.set_remote_description(offer).await {
            if let Some(session) = self.sessions.get_mut(&remote) {
                session.transition(&remote, resting);
            }
            return Err(peer_failure(&remote, "set remote offer")(err));
        }
        self.flush_candidates(&remote, &peer).await;

        let answer = peer
            .create_answer()
            .await
            .map_err(peer_failure(&remote, "create answer"))?;
        peer.set_local_description(answer.clone())
            .await
            .map_err(peer_failure(&remote, "set local answer"))?;
        if let Some(session) = self.sessions.get_mut(&remote) {
            session.transition(&remote, NegotiationState::HaveLocalAnswer);
        }

        self.send(self.envelope_to(&remote, Signal::Answer(answer)))?;
        if let Some(session) = self.sessions.get_mut(&remote) {
            session.transition(&remote, NegotiationState::Connected);
        }
        info!(peer_id = %remote, "answer sent");
        Ok(())
    }

    async fn accept_answer(
        &mut self,
        remote: PeerId,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let state = self
            .sessions
            .get(&remote)
            .map_or(NegotiationState::Idle, |session| session.state);

        match state.on_answer() {
            AnswerDisposition::Apply => {}
            AnswerDisposition::AlreadyConnected => {
                debug!(peer_id = %remote, "duplicate answer ignored");
                return Ok(());
            }
            AnswerDisposition::Conflict => {
                return Err(NegotiationError::StateConflict {
                    remote,
                    state,
                    action: "accept answer",
                })
            }
        }

        let Some(peer) = self.peer(&remote) else {
            return Ok(());
        };
        if let Some(session) = self.sessions.get_mut(&remote) {
            session.transition(&remote, NegotiationState::HaveRemoteAnswer);
        }
        if let Err(err) = peer.set_remote_description(answer).await {
            if let Some(session) = self.sessions.get_mut(&remote) {
                session.transition(&remote, NegotiationState::HaveLocalOffer);
            }
            return Err(peer_failure(&remote, "set remote answer")(err));
        }
        self.flush_candidates(&remote, &peer).await;

        if let Some(session) = self.sessions.get_mut(&remote) {
            session.transition(&remote, NegotiationState::Connected);
        }
        info!(peer_id = %remote, "answer applied");
        Ok(())
    }

    async fn accept_candidate(&mut self, remote: PeerId, candidate: IceCandidate) {
        let peer = match self.sessions.get_mut(&remote) {
            Some(session) if session.remote_description_set => Arc::clone(&session.peer),
            Some(session) => {
                session.pending_ice.push_back(candidate);
                debug!(peer_id = %remote, buffered = session.pending_ice.len(), "candidate buffered");
                return;
            }
            None if self.closed.contains(&remote) => {
                debug!(peer_id = %remote, "candidate for closed session dropped");
                return;
            }
            None => {
                let early = self
                    .early_ice
                    .entry(remote.clone())
                    .or_insert_with(|| EarlyCandidates::new(Instant::now()));
                if early.push(candidate) {
                    warn!(peer_id = %remote, cap = MAX_EARLY_CANDIDATES, "early candidate buffer full; oldest dropped");
                }
                debug!(peer_id = %remote, buffered = early.queue.len(), "candidate buffered for unknown peer");
                return;
            }
        };

        if let Err(err) = peer.add_ice_candidate(candidate).await {
            warn!(peer_id = %remote, error = %err, "failed to add remote candidate");
        }
    }

    /// Marks the remote description applied and replays buffered candidates
    /// in receipt order.
    async fn flush_candidates(&mut self, remote: &PeerId, peer: &Arc<dyn MediaPeer>) {
        let pending = match self.sessions.get_mut(remote) {
            Some(session) => {
                session.remote_description_set = true;
                std::mem::take(&mut session.pending_ice)
            }
            None => return,
        };
        if pending.is_empty() {
            return;
        }

        let count = pending.len();
        for candidate in pending {
            if let Err(err) = peer.add_ice_candidate(candidate).await {
                warn!(peer_id = %remote, error = %err, "failed to add buffered candidate");
            }
        }
        debug!(peer_id = %remote, count, "buffered candidates applied");
    }

    async fn user_disconnected(&mut self, user_id: PeerId) {
        self.sharers.remove(&user_id);
        match self.config.mode {
            RelayMode::Addressed => {
                self.close_peer(&user_id).await;
            }
            // The shared session belongs to the sharer; viewers follow it.
            RelayMode::Broadcast if !self.is_sharing() => {
                info!(user_id = %user_id, "sharer left");
                self.close_peer(&user_id).await;
            }
            RelayMode::Broadcast => {
                debug!(user_id = %user_id, "another user stopped sharing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockMediaSource, MockPeerFactory};
    use serde_json::json;

    struct Harness {
        controller: NegotiationController,
        factory: Arc<MockPeerFactory>,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
        _events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    fn harness(local: &str, config: NegotiatorConfig) -> Harness {
        let factory = Arc::new(MockPeerFactory::new());
        let (tx, outbound) = mpsc::unbounded_channel();
        let (controller, events) = NegotiationController::new(
            PeerId::from(local),
            config,
            factory.clone(),
            Arc::new(MockMediaSource::new()),
            tx,
        );
        Harness {
            controller,
            factory,
            outbound,
            _events: events,
        }
    }

    fn sdp(kind: &str) -> SessionDescription {
        SessionDescription(json!({ "type": kind, "sdp": format!("v=0 {kind}") }))
    }

    fn offer_from(remote: &PeerId) -> ServerMessage {
        ServerMessage::Offer {
            to: Some(PeerId::from("bob")),
            from: Some(remote.clone()),
            offer: sdp("offer"),
        }
    }

    fn candidate_from(remote: &PeerId, label: String) -> ServerMessage {
        ServerMessage::IceCandidate {
            to: Some(PeerId::from("bob")),
            from: Some(remote.clone()),
            candidate: IceCandidate(json!({ "candidate": label })),
        }
    }

    fn labels(candidates: &[IceCandidate]) -> Vec<String> {
        candidates
            .iter()
            .map(|candidate| candidate.0["candidate"].as_str().unwrap().to_string())
            .collect()
    }

    #[test_timeout::tokio_timeout_test]
    async fn closing_an_unknown_peer_keeps_sharing() {
        let mut h = harness("bob", NegotiatorConfig::default());
        h.controller
            .start_sharing(MediaConstraints::default())
            .await
            .unwrap();

        assert!(!h.controller.close_peer(&PeerId::from("stranger")).await);
        assert!(h.controller.is_sharing());
        assert!(!h.controller.local_media().unwrap().all_ended());
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_after_close_never_reach_the_next_session() {
        let mut h = harness("bob", NegotiatorConfig::default());
        let alice = PeerId::from("alice");

        h.controller.handle_server_message(offer_from(&alice)).await;
        assert!(h.controller.close_peer(&alice).await);
        for i in 0..1000 {
            h.controller
                .handle_server_message(candidate_from(&alice, format!("stale-{i}")))
                .await;
        }
        assert_eq!(h.controller.buffered_candidates(&alice), 0);

        h.controller.handle_server_message(offer_from(&alice)).await;
        h.controller
            .handle_server_message(candidate_from(&alice, "fresh".to_string()))
            .await;

        let peer = h.factory.latest_for(&alice).unwrap();
        assert_eq!(h.factory.created().len(), 2);
        assert_eq!(labels(&peer.candidates()), vec!["fresh".to_string()]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn early_candidates_are_capped_oldest_first() {
        let mut h = harness("bob", NegotiatorConfig::default());
        let carol = PeerId::from("carol");

        for i in 0..MAX_EARLY_CANDIDATES + 10 {
            h.controller
                .handle_server_message(candidate_from(&carol, format!("c-{i}")))
                .await;
        }
        assert_eq!(h.controller.buffered_candidates(&carol), MAX_EARLY_CANDIDATES);

        h.controller.handle_server_message(offer_from(&carol)).await;
        let applied = labels(&h.factory.latest_for(&carol).unwrap().candidates());
        assert_eq!(applied.len(), MAX_EARLY_CANDIDATES);
        assert_eq!(applied[0], "c-10");
        assert_eq!(applied[MAX_EARLY_CANDIDATES - 1], format!("c-{}", MAX_EARLY_CANDIDATES + 9));
    }

    #[test_timeout::tokio_timeout_test]
    async fn reaper_expires_unclaimed_early_candidates() {
        let config = NegotiatorConfig::default()
            .with_stall_timeout(std::time::Duration::from_millis(50));
        let mut h = harness("bob", config);
        let dave = PeerId::from("dave");
        h.controller
            .handle_server_message(candidate_from(&dave, "orphan".to_string()))
            .await;

        assert!(h.controller.reap_stalled(Instant::now()).await.is_empty());
        assert_eq!(h.controller.buffered_candidates(&dave), 1);

        let later = Instant::now() + std::time::Duration::from_secs(1);
        h.controller.reap_stalled(later).await;
        assert_eq!(h.controller.buffered_candidates(&dave), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn second_call_while_offering_sends_nothing() {
        let mut h = harness("alice", NegotiatorConfig::default());
        let bob = PeerId::from("bob");

        h.controller.call(bob.clone()).await.unwrap();
        h.controller.call(bob.clone()).await.unwrap();

        assert_eq!(h.controller.state(&bob), Some(NegotiationState::HaveLocalOffer));
        assert_eq!(h.outbound.recv().await.unwrap().kind(), "offer");
        assert!(h.outbound.try_recv().is_err());
        assert_eq!(h.factory.created().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn answer_without_offer_is_a_logged_conflict() {
        let mut h = harness("alice", NegotiatorConfig::default());
        let bob = PeerId::from("bob");

        h.controller
            .handle_server_message(ServerMessage::Answer {
                to: Some(PeerId::from("alice")),
                from: Some(bob.clone()),
                answer: sdp("answer"),
            })
            .await;

        assert_eq!(h.controller.state(&bob), None);
        assert!(h.factory.created().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn stall_reaper_closes_unanswered_offers() {
        let config = NegotiatorConfig::default()
            .with_stall_timeout(std::time::Duration::from_millis(50));
        let mut h = harness("alice", config);
        let bob = PeerId::from("bob");
        h.controller.call(bob.clone()).await.unwrap();

        assert!(h.controller.reap_stalled(Instant::now()).await.is_empty());
        let later = Instant::now() + std::time::Duration::from_secs(1);
        assert_eq!(h.controller.reap_stalled(later).await, vec![bob.clone()]);
        assert_eq!(h.controller.state(&bob), None);
        assert_eq!(
            h.factory.created()[0].connection_state(),
            PeerConnectionState::Closed
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn reaper_is_inert_without_a_timeout() {
        let mut h = harness("alice", NegotiatorConfig::default());
        h.controller.call(PeerId::from("bob")).await.unwrap();
        let later = Instant::now() + std::time::Duration::from_secs(3600);
        assert!(h.controller.reap_stalled(later).await.is_empty());
        assert_eq!(h.controller.session_count(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn events_from_replaced_connections_are_ignored() {
        let mut h = harness("alice", NegotiatorConfig::default());
        let bob = PeerId::from("bob");
        h.controller.call(bob.clone()).await.unwrap();
        let _offer = h.outbound.recv().await.unwrap();

        h.controller.handle_peer_event(PeerEvent {
            remote: bob.clone(),
            generation: 99,
            kind: PeerEventKind::LocalCandidate(IceCandidate(json!({ "candidate": "stale" }))),
        });
        assert!(h.outbound.try_recv().is_err());

        h.controller.handle_peer_event(PeerEvent {
            remote: bob.clone(),
            generation: 0,
            kind: PeerEventKind::LocalCandidate(IceCandidate(json!({ "candidate": "fresh" }))),
        });
        match h.outbound.recv().await.unwrap() {
            ClientMessage::IceCandidate { to, from, candidate } => {
                assert_eq!(to, Some(bob));
                assert_eq!(from, Some(PeerId::from("alice")));
                assert_eq!(candidate.0["candidate"], "fresh");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
