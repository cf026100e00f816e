use signal_proto::{PeerId, ServerMessage};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::controller::NegotiationController;
use crate::error::NegotiationError;
use crate::media::MediaConstraints;
use crate::peer::PeerEvent;

const MIN_REAP_PERIOD: Duration = Duration::from_millis(10);

/// User-facing requests serialized onto the drive loop.
#[derive(Debug)]
pub enum Command {
    Call(PeerId),
    Close(PeerId),
    StartSharing {
        constraints: MediaConstraints,
        reply: oneshot::Sender<Result<(), NegotiationError>>,
    },
    StopSharing {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Cloneable handle to a running drive loop.
#[derive(Debug, Clone)]
pub struct NegotiatorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl NegotiatorHandle {
    fn submit(&self, command: Command) -> Result<(), NegotiationError> {
        self.commands
            .send(command)
            .map_err(|_| NegotiationError::Stopped)
    }

    pub fn call(&self, remote: PeerId) -> Result<(), NegotiationError> {
        self.submit(Command::Call(remote))
    }

    pub fn close(&self, remote: PeerId) -> Result<(), NegotiationError> {
        self.submit(Command::Close(remote))
    }

    pub async fn start_sharing(
        &self,
        constraints: MediaConstraints,
    ) -> Result<(), NegotiationError> {
        let (reply, done) = oneshot::channel();
        self.submit(Command::StartSharing { constraints, reply })?;
        done.await.map_err(|_| NegotiationError::Stopped)?
    }

    /// Resolves once every track has ended and every peer connection is
    /// closed.
    pub async fn stop_sharing(&self) -> Result<(), NegotiationError> {
        let (reply, done) = oneshot::channel();
        self.submit(Command::StopSharing { reply })?;
        done.await.map_err(|_| NegotiationError::Stopped)
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Spawns the drive loop. The join handle yields the controller after
/// shutdown.
pub fn spawn(
    controller: NegotiationController,
    server_messages: mpsc::UnboundedReceiver<ServerMessage>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
) -> (NegotiatorHandle, JoinHandle<NegotiationController>) {
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let handle = tokio::spawn(drive(controller, server_messages, peer_events, commands));
    (
        NegotiatorHandle {
            commands: commands_tx,
        },
        handle,
    )
}

/// Owns the controller and feeds it relay messages, peer events, commands
/// and reaper ticks one at a time. Returns when the relay connection ends or
/// a shutdown is requested, after closing everything.
pub async fn drive(
    mut controller: NegotiationController,
    mut server_messages: mpsc::UnboundedReceiver<ServerMessage>,
    mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) -> NegotiationController {
    let mut reaper = controller.config().policy.stall_timeout.map(|timeout| {
        let mut interval = tokio::time::interval((timeout / 2).max(MIN_REAP_PERIOD));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    loop {
        tokio::select! {
            message = server_messages.recv() => match message {
                Some(message) => controller.handle_server_message(message).await,
                None => {
                    info!(peer_id = %controller.local_id(), "relay connection closed");
                    break;
                }
            },
            Some(event) = peer_events.recv() => controller.handle_peer_event(event),
            command = commands.recv() => match command {
                Some(Command::Shutdown) | None => break,
                Some(command) => apply(&mut controller, command).await,
            },
            now = reaper_tick(&mut reaper) => {
                controller.reap_stalled(now).await;
            }
        }
    }

    controller.shutdown().await;
    controller
}

async fn apply(controller: &mut NegotiationController, command: Command) {
    match command {
        Command::Call(remote) => {
            if let Err(err) = controller.call(remote).await {
                warn!(error = %err, "call failed");
            }
        }
        Command::Close(remote) => {
            controller.close_peer(&remote).await;
        }
        Command::StartSharing { constraints, reply } => {
            let _ = reply.send(controller.start_sharing(constraints).await);
        }
        Command::StopSharing { reply } => {
            controller.stop_sharing().await;
            let _ = reply.send(());
        }
        Command::Shutdown => {}
    }
}

async fn reaper_tick(reaper: &mut Option<Interval>) -> Instant {
    match reaper {
        Some(interval) => interval.tick().await,
        None => std::future::pending().await,
    }
}
