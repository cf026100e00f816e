use signal_proto::RelayMode;
use std::time::Duration;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// How long-lived negotiations are policed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationPolicy {
    /// Sessions that have not reached `Connected` within this window are
    /// closed by the reaper. `None` keeps them open until closed explicitly.
    pub stall_timeout: Option<Duration>,
}

/// Configuration for a negotiation controller.
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Relay profile the controller talks to.
    pub mode: RelayMode,
    /// ICE servers handed to every new peer connection.
    pub ice_servers: Vec<IceServer>,
    pub policy: NegotiationPolicy,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            mode: RelayMode::Addressed,
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
            policy: NegotiationPolicy::default(),
        }
    }
}

impl NegotiatorConfig {
    pub fn new(mode: RelayMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Host candidates only; used for loopback tests.
    pub fn localhost(mode: RelayMode) -> Self {
        Self {
            mode,
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.policy.stall_timeout = Some(timeout);
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(IceServer {
            urls,
            username,
            credential,
        });
        self
    }
}
