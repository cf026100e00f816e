use signal_proto::{PeerId, ProtocolError};
use thiserror::Error;

use crate::media::TrackKind;
use crate::state::NegotiationState;

/// Failure reported by a peer-connection primitive.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("webrtc error: {0}")]
    Rtc(#[from] webrtc::Error),
    #[error("malformed signaling blob: {0}")]
    Blob(#[from] serde_json::Error),
    #[error("peer connection rejected {op}: {reason}")]
    Rejected { op: &'static str, reason: String },
    #[error("peer connection is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("media permission denied")]
    PermissionDenied,
    #[error("no {0} capture device available")]
    NoDevice(TrackKind),
    #[error("neither audio nor video was requested")]
    NothingRequested,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("{op} failed for peer {remote}: {source}")]
    Peer {
        remote: PeerId,
        op: &'static str,
        #[source]
        source: PeerError,
    },
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("cannot {action} peer {remote} while {state}")]
    StateConflict {
        remote: PeerId,
        state: NegotiationState,
        action: &'static str,
    },
    #[error("signaling channel closed")]
    SignalingClosed,
    #[error("negotiator has shut down")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("websocket connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("timed out connecting to {0}")]
    Timeout(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("signaling channel closed")]
    ChannelClosed,
}
