use signal_proto::PeerId;
use std::fmt;

/// Negotiation progress for one remote peer.
///
/// `HaveRemoteAnswer` and `HaveLocalAnswer` are passed through while an
/// answer is being applied or produced; a session only rests in `Idle`,
/// `HaveLocalOffer`, `HaveRemoteOffer`, `Connected` or `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalAnswer,
    HaveRemoteAnswer,
    Connected,
    Closed,
}

impl NegotiationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::HaveLocalOffer => "have-local-offer",
            NegotiationState::HaveRemoteOffer => "have-remote-offer",
            NegotiationState::HaveLocalAnswer => "have-local-answer",
            NegotiationState::HaveRemoteAnswer => "have-remote-answer",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
        }
    }

    /// What `call()` should do from this state.
    pub fn on_call(self) -> CallDisposition {
        match self {
            NegotiationState::Idle => CallDisposition::Start,
            NegotiationState::HaveLocalOffer | NegotiationState::Connected => {
                CallDisposition::AlreadyNegotiating
            }
            _ => CallDisposition::Conflict,
        }
    }

    /// What an inbound answer does from this state.
    pub fn on_answer(self) -> AnswerDisposition {
        match self {
            NegotiationState::HaveLocalOffer => AnswerDisposition::Apply,
            NegotiationState::Connected => AnswerDisposition::AlreadyConnected,
            _ => AnswerDisposition::Conflict,
        }
    }

    /// What an inbound offer from `remote` does from this state, given the
    /// local peer id. `None` for `local` means there is no id to compare
    /// (shared broadcast session), in which case a pending local offer wins.
    pub fn on_offer(self, local: Option<&PeerId>, remote: &PeerId) -> OfferDisposition {
        match self {
            NegotiationState::Idle | NegotiationState::Closed => OfferDisposition::Accept,
            NegotiationState::Connected => OfferDisposition::Renegotiate,
            NegotiationState::HaveLocalOffer => match local {
                Some(local) if local > remote => OfferDisposition::YieldToRemote,
                _ => OfferDisposition::KeepLocalOffer,
            },
            _ => OfferDisposition::Conflict,
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDisposition {
    Start,
    AlreadyNegotiating,
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerDisposition {
    Apply,
    AlreadyConnected,
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDisposition {
    Accept,
    Renegotiate,
    /// Glare, and the local side is the designated offerer.
    KeepLocalOffer,
    /// Glare, and the remote side is the designated offerer: drop the local
    /// offer and answer theirs on a fresh peer connection.
    YieldToRemote,
    Conflict,
}
