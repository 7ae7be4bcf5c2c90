//! Broker service: one task that owns the [`Broker`] and serializes every
//! mutation.
//!
//! Connections, timers and the embedding application talk to the task
//! through a [`BrokerHandle`]. Each command is applied to completion before
//! the next is taken off the channel, so registry mutations and fetch
//! re-evaluation never interleave. The command channel is bounded: senders
//! wait while the broker is behind. The broker itself never waits on a peer;
//! a peer whose outbound queue overflows is disconnected.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::dispatch;
use crate::error::{JetError, Result};
use crate::peer::{PeerId, PeerSender};
use crate::router::{RouteId, TimeoutHandle, TimeoutScheduler};

/// Capacity of the broker's command channel.
pub const COMMAND_QUEUE_LEN: usize = 1024;

/// Work for the broker task.
#[derive(Debug)]
pub enum Command {
    Connect { peer: PeerId, sender: PeerSender },
    Inbound { peer: PeerId, message: Value },
    Disconnect { peer: PeerId },
    RouteTimeout { route: RouteId },
    Shutdown,
}

/// Cloneable entry point to a running broker.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<Command>,
}

impl BrokerHandle {
    /// Register a new connection. Outbound messages for it arrive on the
    /// receiving half of `sender`, which should be created with
    /// [`PEER_QUEUE_LEN`](crate::peer::PEER_QUEUE_LEN) slots.
    pub async fn connect(&self, sender: PeerSender) -> Result<PeerId> {
        let peer = PeerId::generate();
        self.send(Command::Connect {
            peer: peer.clone(),
            sender,
        })
        .await?;
        Ok(peer)
    }

    /// Hand a decoded frame from `peer` to the broker.
    pub async fn inbound(&self, peer: &PeerId, message: Value) -> Result<()> {
        self.send(Command::Inbound {
            peer: peer.clone(),
            message,
        })
        .await
    }

    pub async fn disconnect(&self, peer: &PeerId) -> Result<()> {
        self.send(Command::Disconnect { peer: peer.clone() }).await
    }

    /// Ask the broker task to stop after the commands already queued.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).await.map_err(|_| JetError::Stopped)
    }
}

/// Arms route timeouts as sleeping tasks that post [`Command::RouteTimeout`]
/// back to the broker. Holds only a weak sender so pending timers do not
/// keep the broker alive.
struct TokioScheduler {
    tx: mpsc::WeakSender<Command>,
}

impl TimeoutScheduler for TokioScheduler {
    fn schedule(&self, route: RouteId, after: Duration) -> TimeoutHandle {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::RouteTimeout { route }).await;
            }
        });
        TimeoutHandle::new(task.abort_handle())
    }
}

/// Start a broker task. It runs until [`BrokerHandle::shutdown`] is called
/// or every handle is dropped.
pub fn spawn(config: BrokerConfig) -> (BrokerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_LEN);
    let scheduler = TokioScheduler { tx: tx.downgrade() };
    let broker = Broker::new(config, Box::new(scheduler));
    let task = tokio::spawn(run(broker, rx));
    (BrokerHandle { tx }, task)
}

async fn run(mut broker: Broker, mut rx: mpsc::Receiver<Command>) {
    info!(
        "Broker {} started (fetch: {}, route timeout: {:?})",
        broker.config().name,
        broker.config().fetch.as_str(),
        broker.config().route_timeout
    );

    while let Some(command) = rx.recv().await {
        match command {
            Command::Connect { peer, sender } => broker.connect(peer, sender),
            Command::Inbound { peer, message } => {
                if broker.peers().contains(&peer) {
                    dispatch::handle(&mut broker, &peer, message);
                } else {
                    debug!("Dropping message from unknown peer {peer}");
                }
            }
            Command::Disconnect { peer } => broker.disconnect(&peer),
            Command::RouteTimeout { route } => broker.expire_route(route),
            Command::Shutdown => break,
        }
        broker.drop_stalled();
    }

    info!(
        "Broker stopped ({} peers, {} elements)",
        broker.peers().len(),
        broker.elements().len()
    );
}
