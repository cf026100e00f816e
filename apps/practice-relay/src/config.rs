use anyhow::Context;
use signal_proto::RelayMode;
use std::net::SocketAddr;
use std::time::Duration;

use crate::cli::ServeArgs;

pub const DEFAULT_PORT: u16 = 5001;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// Single origin allowed by CORS; `None` allows any origin.
    pub allowed_origin: Option<String>,
    pub mode: RelayMode,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let raw = format!("{}:{}", args.host, args.port);
        let listen_addr: SocketAddr = raw
            .parse()
            .with_context(|| format!("invalid listen address: {raw}"))?;
        let allowed_origin = args
            .allowed_origin
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty());

        Ok(RelayConfig {
            listen_addr,
            allowed_origin,
            mode: args.mode,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            allowed_origin: None,
            mode: RelayMode::Addressed,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}
