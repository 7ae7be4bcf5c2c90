//! Peer table: connected clients and the resources they own.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::message::Outbound;
use crate::router::RouteId;

/// A unique identifier for a connected peer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a new random peer ID (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create a PeerId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capacity of a peer's outbound queue. A peer that lets it fill up is
/// disconnected.
pub const PEER_QUEUE_LEN: usize = 256;

/// Sending half of a peer's outbound queue. The connection task owns the
/// receiving half and writes whatever arrives to the socket.
pub type PeerSender = mpsc::Sender<Outbound>;

/// One connected client.
///
/// Elements, fetchers and routes are tracked by key only; the registry, the
/// fetch engine and the router own the actual entries.
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    name: Option<String>,
    sender: PeerSender,
    elements: BTreeSet<String>,
    fetchers: BTreeSet<String>,
    routes: BTreeSet<RouteId>,
    connected_at: DateTime<Utc>,
}

impl Peer {
    pub fn new(id: PeerId, sender: PeerSender) -> Self {
        Self {
            id,
            name: None,
            sender,
            elements: BTreeSet::new(),
            fetchers: BTreeSet::new(),
            routes: BTreeSet::new(),
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Display name set through `config`.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Time since the peer connected.
    pub fn session_duration(&self) -> chrono::Duration {
        Utc::now() - self.connected_at
    }

    /// Paths of the elements this peer registered.
    pub fn elements(&self) -> &BTreeSet<String> {
        &self.elements
    }

    /// Ids of this peer's active fetches.
    pub fn fetchers(&self) -> &BTreeSet<String> {
        &self.fetchers
    }

    /// Routes this peer is waiting on.
    pub fn routes(&self) -> &BTreeSet<RouteId> {
        &self.routes
    }

    pub fn track_element(&mut self, path: &str) {
        self.elements.insert(path.to_string());
    }

    pub fn untrack_element(&mut self, path: &str) {
        self.elements.remove(path);
    }

    pub fn track_fetcher(&mut self, fetch_id: &str) {
        self.fetchers.insert(fetch_id.to_string());
    }

    pub fn untrack_fetcher(&mut self, fetch_id: &str) {
        self.fetchers.remove(fetch_id);
    }

    pub fn track_route(&mut self, route: RouteId) {
        self.routes.insert(route);
    }

    pub fn untrack_route(&mut self, route: RouteId) {
        self.routes.remove(&route);
    }
}

/// Registry of connected peers.
#[derive(Debug, Default)]
pub struct Peers {
    peers: HashMap<PeerId, Peer>,
    /// Peers whose outbound queue overflowed, pending disconnect.
    stalled: BTreeSet<PeerId>,
}

impl Peers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. Replaces any previous peer with the same id.
    pub fn add_peer(&mut self, peer: Peer) {
        self.peers.insert(peer.id.clone(), peer);
    }

    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<Peer> {
        self.stalled.remove(peer_id);
        self.peers.remove(peer_id)
    }

    pub fn get_peer(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn get_peer_mut(&mut self, peer_id: &PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(peer_id)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Deliver to a peer by id without waiting. Messages for unknown peers
    /// are dropped. A full queue marks the peer as stalled; it is not sent
    /// anything more and should be disconnected with [`Peers::take_stalled`].
    /// A closed queue is not an error: the disconnect is already on its way.
    pub fn send(&mut self, peer_id: &PeerId, message: Outbound) {
        let Some(peer) = self.peers.get(peer_id) else {
            debug!("Dropping message for unknown peer {peer_id}");
            return;
        };
        if self.stalled.contains(peer_id) {
            return;
        }
        match peer.sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue of peer {peer_id} is full, disconnecting it");
                self.stalled.insert(peer_id.clone());
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Dropping message for closed peer {peer_id}");
            }
        }
    }

    /// Next peer whose outbound queue overflowed.
    pub fn take_stalled(&mut self) -> Option<PeerId> {
        self.stalled.pop_first()
    }
}
