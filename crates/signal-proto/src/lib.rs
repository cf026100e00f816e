//! Shared signaling protocol for the relay and the negotiation clients.
//! Frames travel as JSON text over a WebSocket and are tagged by `type`,
//! so browser clients can speak the same dialect without extra bindings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Stable identifier of a participant, usually the authenticated user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of one live transport connection on the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque `RTCSessionDescriptionInit` blob. The relay never looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(pub serde_json::Value);

/// Opaque `RTCIceCandidateInit` blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(pub serde_json::Value);

/// Deployment profile of the relay. One process runs exactly one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Envelopes carry `to`/`from` and are routed through the peer registry.
    Addressed,
    /// Envelopes carry no addressing and fan out to every other socket.
    Broadcast,
}

impl RelayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayMode::Addressed => "addressed",
            RelayMode::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayMode {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "addressed" => Ok(RelayMode::Addressed),
            "broadcast" => Ok(RelayMode::Broadcast),
            other => Err(ProtocolError::UnknownMode(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{kind} envelope is missing `{field}` in addressed mode")]
    MissingAddress {
        kind: &'static str,
        field: &'static str,
    },
    #[error("{kind} envelope carries addressing in broadcast mode")]
    UnexpectedAddress { kind: &'static str },
    #[error("`{message}` is not part of the {mode} protocol")]
    WrongMode {
        message: &'static str,
        mode: RelayMode,
    },
    #[error("unknown relay mode `{0}`")]
    UnknownMode(String),
}

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Register {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        offer: SessionDescription,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        answer: SessionDescription,
    },
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        candidate: IceCandidate,
    },
    StartSharing {
        #[serde(rename = "userId")]
        user_id: PeerId,
    },
    StopSharing {
        #[serde(rename = "userId")]
        user_id: PeerId,
    },
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        offer: SessionDescription,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        answer: SessionDescription,
    },
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        candidate: IceCandidate,
    },
    NewUser {
        #[serde(rename = "userId")]
        user_id: PeerId,
    },
    UserDisconnected {
        #[serde(rename = "userId")]
        user_id: PeerId,
    },
}

/// Body of a signaling envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::IceCandidate(_) => "ice-candidate",
        }
    }
}

/// A single-use signaling envelope, independent of direction.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub to: Option<PeerId>,
    pub from: Option<PeerId>,
    pub signal: Signal,
}

impl Envelope {
    pub fn addressed(from: PeerId, to: PeerId, signal: Signal) -> Self {
        Self {
            to: Some(to),
            from: Some(from),
            signal,
        }
    }

    pub fn unaddressed(signal: Signal) -> Self {
        Self {
            to: None,
            from: None,
            signal,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.signal.kind()
    }

    /// Checks the addressing against the relay profile. Blob contents are
    /// never inspected.
    pub fn check(&self, mode: RelayMode) -> Result<(), ProtocolError> {
        let kind = self.kind();
        match mode {
            RelayMode::Addressed => {
                if self.to.is_none() {
                    return Err(ProtocolError::MissingAddress { kind, field: "to" });
                }
                if self.from.is_none() {
                    return Err(ProtocolError::MissingAddress {
                        kind,
                        field: "from",
                    });
                }
                Ok(())
            }
            RelayMode::Broadcast => {
                if self.to.is_some() || self.from.is_some() {
                    return Err(ProtocolError::UnexpectedAddress { kind });
                }
                Ok(())
            }
        }
    }
}

impl ClientMessage {
    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Name of the `type` tag, for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "register",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::StartSharing { .. } => "start-sharing",
            ClientMessage::StopSharing { .. } => "stop-sharing",
        }
    }

    /// Splits signaling envelopes from control messages. Control messages are
    /// handed back unchanged.
    pub fn into_envelope(self) -> Result<Envelope, ClientMessage> {
        match self {
            ClientMessage::Offer { to, from, offer } => Ok(Envelope {
                to,
                from,
                signal: Signal::Offer(offer),
            }),
            ClientMessage::Answer { to, from, answer } => Ok(Envelope {
                to,
                from,
                signal: Signal::Answer(answer),
            }),
            ClientMessage::IceCandidate {
                to,
                from,
                candidate,
            } => Ok(Envelope {
                to,
                from,
                signal: Signal::IceCandidate(candidate),
            }),
            other => Err(other),
        }
    }
}

impl From<Envelope> for ClientMessage {
    fn from(envelope: Envelope) -> Self {
        let Envelope { to, from, signal } = envelope;
        match signal {
            Signal::Offer(offer) => ClientMessage::Offer { to, from, offer },
            Signal::Answer(answer) => ClientMessage::Answer { to, from, answer },
            Signal::IceCandidate(candidate) => ClientMessage::IceCandidate {
                to,
                from,
                candidate,
            },
        }
    }
}

impl ServerMessage {
    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::IceCandidate { .. } => "ice-candidate",
            ServerMessage::NewUser { .. } => "new-user",
            ServerMessage::UserDisconnected { .. } => "user-disconnected",
        }
    }

    pub fn into_envelope(self) -> Result<Envelope, ServerMessage> {
        match self {
            ServerMessage::Offer { to, from, offer } => Ok(Envelope {
                to,
                from,
                signal: Signal::Offer(offer),
            }),
            ServerMessage::Answer { to, from, answer } => Ok(Envelope {
                to,
                from,
                signal: Signal::Answer(answer),
            }),
            ServerMessage::IceCandidate {
                to,
                from,
                candidate,
            } => Ok(Envelope {
                to,
                from,
                signal: Signal::IceCandidate(candidate),
            }),
            other => Err(other),
        }
    }
}

impl From<Envelope> for ServerMessage {
    fn from(envelope: Envelope) -> Self {
        let Envelope { to, from, signal } = envelope;
        match signal {
            Signal::Offer(offer) => ServerMessage::Offer { to, from, offer },
            Signal::Answer(answer) => ServerMessage::Answer { to, from, answer },
            Signal::IceCandidate(candidate) => ServerMessage::IceCandidate {
                to,
                from,
                candidate,
            },
        }
    }
}
