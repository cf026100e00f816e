use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use signal_proto::{ClientMessage, PeerId, RelayMode, ServerMessage, SessionDescription};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::config::DEFAULT_PORT;

#[derive(Parser, Debug)]
#[command(name = "practice-relay")]
#[command(about = "Practice hub WebRTC signaling relay and probe client")]
pub struct Cli {
    #[command(flatten)]
    pub serve: ServeArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Interface to bind.
    #[arg(long, env = "PRACTICE_RELAY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Frontend origin allowed by CORS. Any origin when unset.
    #[arg(long, env = "FRONTEND_URL")]
    pub allowed_origin: Option<String>,

    /// Deployment profile: `addressed` or `broadcast`.
    #[arg(long, env = "PRACTICE_RELAY_MODE", default_value = "addressed")]
    pub mode: RelayMode,

    /// Seconds to wait after the shutdown signal.
    #[arg(long, env = "PRACTICE_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a running relay, optionally register and send, then print
    /// whatever arrives within the wait window.
    Probe(ProbeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    /// Relay WebSocket URL.
    #[arg(short, long, default_value = "ws://localhost:5001/ws")]
    pub url: String,

    /// Register under this peer id (addressed mode).
    #[arg(long)]
    pub peer_id: Option<String>,

    /// Send a placeholder offer to this peer (requires --peer-id).
    #[arg(long)]
    pub offer_to: Option<String>,

    /// Announce start-sharing under this user id (broadcast mode).
    #[arg(long)]
    pub share_as: Option<String>,

    /// Seconds to keep listening for relayed frames.
    #[arg(long, default_value_t = 5)]
    pub wait_secs: u64,
}

fn placeholder_offer() -> SessionDescription {
    SessionDescription(json!({ "type": "offer", "sdp": "v=0\r\ns=practice-relay probe\r\n" }))
}

/// Builds the frames the probe sends, in order.
pub fn probe_script(args: &ProbeArgs) -> Result<Vec<ClientMessage>> {
    let mut script = Vec::new();
    let peer_id = args.peer_id.as_deref().map(PeerId::from);

    if let Some(peer_id) = &peer_id {
        script.push(ClientMessage::Register {
            peer_id: peer_id.clone(),
        });
    }
    if let Some(user_id) = &args.share_as {
        script.push(ClientMessage::StartSharing {
            user_id: PeerId::from(user_id.as_str()),
        });
    }
    if let Some(target) = &args.offer_to {
        let Some(from) = peer_id else {
            bail!("--offer-to requires --peer-id");
        };
        script.push(ClientMessage::Offer {
            to: Some(PeerId::from(target.as_str())),
            from: Some(from),
            offer: placeholder_offer(),
        });
    }
    Ok(script)
}

/// Returns the relayed messages seen before the wait window closed.
pub async fn run_probe(args: ProbeArgs) -> Result<Vec<ServerMessage>> {
    let script = probe_script(&args)?;
    debug!("connecting to {}", args.url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(args.url.as_str())).await
    {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("failed to connect to {}: {}", args.url, e);
            return Err(anyhow!("connection failed: {e}"));
        }
        Err(_) => {
            error!("connection timeout after 5 seconds");
            return Err(anyhow!("connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    for message in &script {
        let text = message.to_text()?;
        write
            .send(Message::Text(text))
            .await
            .with_context(|| format!("failed to send {}", message.kind()))?;
        println!("-> {}", message.kind());
    }

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(args.wait_secs);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let frame = match timeout(remaining, read.next()).await {
            Err(_) => break,
            Ok(None) => {
                debug!("relay closed the connection");
                break;
            }
            Ok(Some(frame)) => frame?,
        };
        match frame {
            Message::Text(text) => match ServerMessage::from_text(&text) {
                Ok(message) => {
                    println!("<- {}: {}", message.kind(), text);
                    received.push(message);
                }
                Err(err) => println!("<- unparseable frame ({err}): {text}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    let _ = write.send(Message::Close(None)).await;
    println!("{} message(s) relayed within {}s", received.len(), args.wait_secs);
    Ok(received)
}
