//! Client side of the practice hub signaling: a per-participant controller
//! that drives WebRTC offer/answer/ICE exchanges through the relay.
//!
//! [`NegotiationController`] holds the state machine and is transport
//! agnostic; [`SignalingClient`] connects it to a relay over WebSocket and
//! [`driver`] runs both on one task. [`rtc`] binds the peer abstraction to
//! webrtc-rs, [`mock`] to in-process fakes.

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod media;
pub mod mock;
pub mod peer;
pub mod rtc;
pub mod signaling;
pub mod state;

pub use config::{IceServer, NegotiationPolicy, NegotiatorConfig};
pub use controller::{NegotiationController, RemoteTrack, SHARED_REMOTE};
pub use driver::{Command, NegotiatorHandle};
pub use error::{MediaError, NegotiationError, PeerError, SignalingError};
pub use media::{LocalMedia, LocalTrack, MediaConstraints, MediaSource, TrackKind, TrackState};
pub use peer::{MediaPeer, PeerConnectionState, PeerEvent, PeerEventKind, PeerFactory};
pub use signaling::SignalingClient;
pub use state::NegotiationState;
