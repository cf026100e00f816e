use peer_negotiator::controller::NegotiationController;
use peer_negotiator::driver;
use peer_negotiator::mock::{MockMediaSource, MockPeerFactory};
use peer_negotiator::{
    MediaConstraints, MediaError, MediaPeer, NegotiationError, NegotiationState, NegotiatorConfig,
    PeerConnectionState, PeerEvent, TrackKind, TrackState,
};
use serde_json::json;
use signal_proto::{ClientMessage, IceCandidate, PeerId, RelayMode, ServerMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Participant {
    controller: NegotiationController,
    factory: Arc<MockPeerFactory>,
    media: Arc<MockMediaSource>,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    _events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl Participant {
    fn new(id: &str, config: NegotiatorConfig) -> Self {
        Self::with_media(id, config, MockMediaSource::new())
    }

    fn with_media(id: &str, config: NegotiatorConfig, media: MockMediaSource) -> Self {
        let factory = Arc::new(MockPeerFactory::new());
        let media = Arc::new(media);
        let (tx, outbound) = mpsc::unbounded_channel();
        let (controller, events) = NegotiationController::new(
            PeerId::from(id),
            config,
            factory.clone(),
            media.clone(),
            tx,
        );
        Self {
            controller,
            factory,
            media,
            outbound,
            _events: events,
        }
    }

    /// Next outbound message, as the relay would deliver it.
    fn relayed(&mut self) -> ServerMessage {
        let message = self.outbound.try_recv().expect("expected an outbound message");
        match message.into_envelope() {
            Ok(envelope) => ServerMessage::from(envelope),
            Err(control) => panic!("expected an envelope, got {control:?}"),
        }
    }

    fn next_kind(&mut self) -> Option<&'static str> {
        self.outbound.try_recv().ok().map(|message| message.kind())
    }
}

fn candidate(tag: &str) -> IceCandidate {
    IceCandidate(json!({
        "candidate": format!("candidate:{tag} 1 udp 2122260223 192.0.2.1 54321 typ host"),
        "sdpMid": "0",
        "sdpMLineIndex": 0
    }))
}

fn ice_from(from: &str, to: &str, tag: &str) -> ServerMessage {
    ServerMessage::IceCandidate {
        to: Some(PeerId::from(to)),
        from: Some(PeerId::from(from)),
        candidate: candidate(tag),
    }
}

#[test_timeout::tokio_timeout_test]
async fn alice_and_bob_connect_and_a_repeated_answer_is_ignored() {
    let alice_id = PeerId::from("alice");
    let bob_id = PeerId::from("bob");
    let mut alice = Participant::new("alice", NegotiatorConfig::default());
    let mut bob = Participant::new("bob", NegotiatorConfig::default());

    alice.controller.call(bob_id.clone()).await.unwrap();
    let offer = alice.relayed();
    assert_eq!(offer.kind(), "offer");

    bob.controller.handle_server_message(offer).await;
    assert_eq!(bob.controller.state(&alice_id), Some(NegotiationState::Connected));
    let answer = bob.relayed();
    assert_eq!(answer.kind(), "answer");

    alice.controller.handle_server_message(answer.clone()).await;
    assert_eq!(alice.controller.state(&bob_id), Some(NegotiationState::Connected));

    alice.controller.handle_server_message(answer).await;
    assert_eq!(alice.controller.state(&bob_id), Some(NegotiationState::Connected));
    let peer = alice.factory.latest_for(&bob_id).unwrap();
    assert_eq!(peer.remote_descriptions().len(), 1);
    assert_eq!(alice.next_kind(), None);
}

#[test_timeout::tokio_timeout_test]
async fn early_candidates_for_an_unknown_peer_apply_in_order_after_the_offer() {
    let alice_id = PeerId::from("alice");
    let mut alice = Participant::new("alice", NegotiatorConfig::default());
    let mut bob = Participant::new("bob", NegotiatorConfig::default());

    bob.controller
        .handle_server_message(ice_from("alice", "bob", "IC1"))
        .await;
    bob.controller
        .handle_server_message(ice_from("alice", "bob", "IC2"))
        .await;
    assert_eq!(bob.controller.buffered_candidates(&alice_id), 2);
    assert_eq!(bob.controller.state(&alice_id), None);

    alice.controller.call(PeerId::from("bob")).await.unwrap();
    bob.controller.handle_server_message(alice.relayed()).await;

    let peer = bob.factory.latest_for(&alice_id).unwrap();
    assert_eq!(peer.candidates(), vec![candidate("IC1"), candidate("IC2")]);
    assert_eq!(bob.controller.buffered_candidates(&alice_id), 0);

    bob.controller
        .handle_server_message(ice_from("alice", "bob", "IC3"))
        .await;
    assert_eq!(peer.candidates().len(), 3);
}

#[test_timeout::tokio_timeout_test]
async fn candidates_before_the_answer_wait_for_it() {
    let bob_id = PeerId::from("bob");
    let mut alice = Participant::new("alice", NegotiatorConfig::default());
    let mut bob = Participant::new("bob", NegotiatorConfig::default());

    alice.controller.call(bob_id.clone()).await.unwrap();
    bob.controller.handle_server_message(alice.relayed()).await;
    let answer = bob.relayed();

    alice
        .controller
        .handle_server_message(ice_from("bob", "alice", "B1"))
        .await;
    alice
        .controller
        .handle_server_message(ice_from("bob", "alice", "B2"))
        .await;
    let peer = alice.factory.latest_for(&bob_id).unwrap();
    assert!(peer.candidates().is_empty());
    assert_eq!(alice.controller.buffered_candidates(&bob_id), 2);

    alice.controller.handle_server_message(answer).await;
    assert_eq!(peer.candidates(), vec![candidate("B1"), candidate("B2")]);
}

#[test_timeout::tokio_timeout_test]
async fn stop_sharing_ends_every_track_and_closes_the_connection() {
    let bob_id = PeerId::from("bob");
    let mut alice = Participant::new("alice", NegotiatorConfig::default());
    let mut bob = Participant::new("bob", NegotiatorConfig::default());

    alice
        .controller
        .start_sharing(MediaConstraints::default())
        .await
        .unwrap();
    alice.controller.call(bob_id.clone()).await.unwrap();
    bob.controller.handle_server_message(alice.relayed()).await;
    alice.controller.handle_server_message(bob.relayed()).await;

    let peer = alice.factory.latest_for(&bob_id).unwrap();
    assert_eq!(peer.track_ids().len(), 2);

    alice.controller.stop_sharing().await;

    let issued = alice.media.issued();
    assert_eq!(issued.len(), 1);
    assert!(issued[0]
        .tracks()
        .iter()
        .all(|track| track.ready_state() == TrackState::Ended));
    assert_eq!(peer.connection_state(), PeerConnectionState::Closed);
    assert_eq!(alice.controller.session_count(), 0);
    assert!(!alice.controller.is_sharing());
    // Addressed relays have no stop-sharing message.
    assert_eq!(alice.next_kind(), None);
}

#[test_timeout::tokio_timeout_test]
async fn closing_the_last_peer_stops_local_media() {
    let bob_id = PeerId::from("bob");
    let carol_id = PeerId::from("carol");
    let mut alice = Participant::new("alice", NegotiatorConfig::default());

    alice
        .controller
        .start_sharing(MediaConstraints::default())
        .await
        .unwrap();
    alice.controller.call(bob_id.clone()).await.unwrap();
    alice.controller.call(carol_id.clone()).await.unwrap();

    assert!(alice.controller.close_peer(&bob_id).await);
    assert!(alice.controller.is_sharing());

    assert!(alice.controller.close_peer(&carol_id).await);
    assert!(!alice.controller.is_sharing());
    assert!(alice.media.issued()[0].all_ended());
    assert!(!alice.controller.close_peer(&carol_id).await);
}

#[test_timeout::tokio_timeout_test]
async fn glare_is_won_by_the_smaller_peer_id() {
    let alice_id = PeerId::from("alice");
    let bob_id = PeerId::from("bob");
    let mut alice = Participant::new("alice", NegotiatorConfig::default());
    let mut bob = Participant::new("bob", NegotiatorConfig::default());

    alice.controller.call(bob_id.clone()).await.unwrap();
    bob.controller.call(alice_id.clone()).await.unwrap();
    let alice_offer = alice.relayed();
    let bob_offer = bob.relayed();

    // "alice" < "bob": alice keeps her offer and ignores bob's.
    alice.controller.handle_server_message(bob_offer).await;
    assert_eq!(
        alice.controller.state(&bob_id),
        Some(NegotiationState::HaveLocalOffer)
    );
    assert_eq!(alice.next_kind(), None);

    // bob abandons his offer on a fresh connection and answers.
    bob.controller.handle_server_message(alice_offer).await;
    let bob_peers = bob.factory.created();
    assert_eq!(bob_peers.len(), 2);
    assert_eq!(bob_peers[0].connection_state(), PeerConnectionState::Closed);
    assert_eq!(bob.controller.state(&alice_id), Some(NegotiationState::Connected));

    alice.controller.handle_server_message(bob.relayed()).await;
    assert_eq!(alice.controller.state(&bob_id), Some(NegotiationState::Connected));
}

#[test_timeout::tokio_timeout_test]
async fn media_failure_means_sharing_never_starts() {
    let mut alice = Participant::with_media(
        "alice",
        NegotiatorConfig::new(RelayMode::Broadcast),
        MockMediaSource::failing(MediaError::PermissionDenied),
    );

    let err = alice
        .controller
        .start_sharing(MediaConstraints::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        NegotiationError::Media(MediaError::PermissionDenied)
    ));
    assert!(!alice.controller.is_sharing());
    assert_eq!(alice.controller.session_count(), 0);
    assert_eq!(alice.next_kind(), None);
}

#[test_timeout::tokio_timeout_test]
async fn rejected_remote_description_keeps_the_session() {
    let alice_id = PeerId::from("alice");
    let mut alice = Participant::new("alice", NegotiatorConfig::default());
    let mut bob = Participant::new("bob", NegotiatorConfig::default());
    bob.factory.reject_remote_descriptions(true);

    alice.controller.call(PeerId::from("bob")).await.unwrap();
    bob.controller.handle_server_message(alice.relayed()).await;

    assert_eq!(bob.next_kind(), None);
    assert_eq!(bob.controller.state(&alice_id), Some(NegotiationState::Idle));
    let peer = bob.factory.latest_for(&alice_id).unwrap();
    assert_ne!(peer.connection_state(), PeerConnectionState::Closed);
}

#[test_timeout::tokio_timeout_test]
async fn broadcast_sharer_and_viewer_use_one_shared_session() {
    let mut sharer = Participant::new("host", NegotiatorConfig::new(RelayMode::Broadcast));
    let mut viewer = Participant::new("viewer", NegotiatorConfig::new(RelayMode::Broadcast));
    let host_id = PeerId::from("host");

    sharer
        .controller
        .start_sharing(MediaConstraints::default())
        .await
        .unwrap();
    match sharer.outbound.try_recv().unwrap() {
        ClientMessage::StartSharing { user_id } => assert_eq!(user_id, host_id),
        other => panic!("expected start-sharing, got {other:?}"),
    }
    viewer
        .controller
        .handle_server_message(ServerMessage::NewUser {
            user_id: host_id.clone(),
        })
        .await;
    assert_eq!(viewer.controller.known_sharers().count(), 1);

    let offer = sharer.relayed();
    match &offer {
        ServerMessage::Offer { to, from, .. } => assert!(to.is_none() && from.is_none()),
        other => panic!("expected offer, got {other:?}"),
    }
    viewer.controller.handle_server_message(offer).await;
    sharer.controller.handle_server_message(viewer.relayed()).await;
    assert_eq!(
        sharer.controller.state(&PeerId::from("anyone")),
        Some(NegotiationState::Connected)
    );

    viewer
        .controller
        .handle_server_message(ServerMessage::UserDisconnected { user_id: host_id })
        .await;
    assert_eq!(viewer.controller.session_count(), 0);
    assert_eq!(viewer.controller.known_sharers().count(), 0);

    sharer.controller.stop_sharing().await;
    match sharer.outbound.try_recv().unwrap() {
        ClientMessage::StopSharing { user_id } => assert_eq!(user_id.as_str(), "host"),
        other => panic!("expected stop-sharing, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn drive_loop_forwards_candidates_and_reaps_stalled_offers() {
    let factory = Arc::new(MockPeerFactory::new());
    let (outbound_tx, mut outbound) = mpsc::unbounded_channel();
    let (server_tx, server_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let config = NegotiatorConfig::default().with_stall_timeout(Duration::from_millis(100));
    let (controller, events) = NegotiationController::new(
        PeerId::from("alice"),
        config,
        factory.clone(),
        Arc::new(MockMediaSource::new()),
        outbound_tx,
    );
    let (handle, join) = driver::spawn(controller, server_rx, events);

    handle
        .start_sharing(MediaConstraints {
            audio: true,
            video: false,
        })
        .await
        .unwrap();
    handle.call(PeerId::from("bob")).unwrap();
    assert_eq!(outbound.recv().await.unwrap().kind(), "offer");

    let peer = factory.created().pop().unwrap();
    assert!(peer.emit_candidate(candidate("A1")));
    assert!(peer.emit_remote_track("bob-audio", TrackKind::Audio));
    assert_eq!(outbound.recv().await.unwrap().kind(), "ice-candidate");

    for _ in 0..100 {
        if peer.connection_state() == PeerConnectionState::Closed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(peer.connection_state(), PeerConnectionState::Closed);

    handle.shutdown();
    let controller = join.await.unwrap();
    assert_eq!(controller.session_count(), 0);
    assert!(!controller.is_sharing());
    drop(server_tx);
}
