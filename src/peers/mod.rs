//! # Peer Registry & State Machine
//!
//! The in-memory table of peers, keyed by their current pairing code.
//!
//! ## State machine
//!
//! ```text
//! Disconnected ──connect_to(code)──▶ Connecting
//! Connecting   ──pair matched─────▶ Connecting   (public key attached)
//! Connecting   ──channel open─────▶ Handshaking
//! Handshaking  ──handshake done───▶ Connected
//! Connecting   ──pair rejected────▶ removed
//! Connecting   ──pair timeout─────▶ removed
//! Connecting   ──pair error───────▶ removed (all currently connecting)
//! any          ──peer left────────▶ Disconnected
//! any          ──close────────────▶ Disconnected
//! ```
//!
//! Every mutation ends with a snapshot emission on the `peers` broadcast.
//! Observers never mutate the table from inside a subscription callback;
//! they hand control back to the orchestrator.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the snapshot broadcast; slow subscribers drop snapshots.
const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Pairing or signaling exchange in progress
    Connecting,
    /// Data channel open, encryption handshake running
    Handshaking,
    /// Fully connected
    Connected,
    /// Connection attempt failed
    Failed,
}

/// An entity known to this node, addressed by its ephemeral pairing code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    /// Current pairing code (ephemeral address)
    pub code: String,
    /// Display name; placeholders get `"Peer <code>"`
    pub display_name: String,
    /// User-chosen alias
    pub alias: Option<String>,
    /// Long-term public key, Base64, once learned
    pub public_key: Option<String>,
    /// Connection state
    pub state: PeerConnectionState,
    /// Last activity timestamp
    pub last_seen: Option<i64>,
    /// Whether the peer was discovered on the local network
    pub is_local: bool,
}

impl Peer {
    /// A placeholder for a peer whose key we have not learned yet.
    pub fn placeholder(code: &str) -> Self {
        Self {
            code: code.to_string(),
            display_name: format!("Peer {}", code),
            alias: None,
            public_key: None,
            state: PeerConnectionState::Connecting,
            last_seen: None,
            is_local: false,
        }
    }

    /// Update the last-seen timestamp.
    pub fn touch(&mut self) {
        self.last_seen = Some(crate::time::now_timestamp());
    }
}

/// The peer table. Owned by the orchestrator; components mutate it through
/// these methods and every mutation broadcasts a fresh snapshot.
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Peer>>,
    snapshot_tx: broadcast::Sender<Vec<Peer>>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (snapshot_tx, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        Self {
            peers: RwLock::new(HashMap::new()),
            snapshot_tx,
        }
    }

    /// Subscribe to peer-list snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<Peer>> {
        self.snapshot_tx.subscribe()
    }

    /// Current peer list, sorted by code.
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut list: Vec<Peer> = self.peers.read().values().cloned().collect();
        list.sort_by(|a, b| a.code.cmp(&b.code));
        list
    }

    /// Look a peer up by code.
    pub fn get(&self, code: &str) -> Option<Peer> {
        self.peers.read().get(code).cloned()
    }

    /// Whether a peer exists at `code`.
    pub fn contains(&self, code: &str) -> bool {
        self.peers.read().contains_key(code)
    }

    /// Insert or replace a peer.
    pub fn insert(&self, peer: Peer) {
        self.peers.write().insert(peer.code.clone(), peer);
        self.notify();
    }

    /// Transition a peer's state. Returns false when the code is unknown.
    pub fn set_state(&self, code: &str, state: PeerConnectionState) -> bool {
        let changed = {
            let mut peers = self.peers.write();
            match peers.get_mut(code) {
                Some(peer) => {
                    peer.state = state;
                    if state == PeerConnectionState::Connected {
                        peer.touch();
                    }
                    true
                }
                None => false,
            }
        };
        if changed {
            self.notify();
        }
        changed
    }

    /// Attach a learned public key to a peer.
    pub fn attach_public_key(&self, code: &str, public_key: &str) -> bool {
        let changed = {
            let mut peers = self.peers.write();
            match peers.get_mut(code) {
                Some(peer) => {
                    peer.public_key = Some(public_key.to_string());
                    true
                }
                None => false,
            }
        };
        if changed {
            self.notify();
        }
        changed
    }

    /// Set a peer's user-chosen alias.
    pub fn set_alias(&self, code: &str, alias: Option<String>) -> bool {
        let changed = {
            let mut peers = self.peers.write();
            match peers.get_mut(code) {
                Some(peer) => {
                    peer.alias = alias;
                    true
                }
                None => false,
            }
        };
        if changed {
            self.notify();
        }
        changed
    }

    /// Update a peer's last-seen timestamp.
    pub fn touch(&self, code: &str) {
        let changed = {
            let mut peers = self.peers.write();
            match peers.get_mut(code) {
                Some(peer) => {
                    peer.touch();
                    true
                }
                None => false,
            }
        };
        if changed {
            self.notify();
        }
    }

    /// Remove a peer from the table.
    pub fn remove(&self, code: &str) -> Option<Peer> {
        let removed = self.peers.write().remove(code);
        if removed.is_some() {
            self.notify();
        }
        removed
    }

    /// Remove every peer currently in `Connecting`. Used for `pair_error`,
    /// which carries no peer field. Returns the purged codes.
    pub fn remove_all_connecting(&self) -> Vec<String> {
        let purged: Vec<String> = {
            let mut peers = self.peers.write();
            let codes: Vec<String> = peers
                .values()
                .filter(|p| p.state == PeerConnectionState::Connecting)
                .map(|p| p.code.clone())
                .collect();
            for code in &codes {
                peers.remove(code);
            }
            codes
        };
        if !purged.is_empty() {
            self.notify();
        }
        purged
    }

    /// Transition every peer to `Disconnected` (signaling close).
    pub fn mark_all_disconnected(&self) {
        {
            let mut peers = self.peers.write();
            for peer in peers.values_mut() {
                peer.state = PeerConnectionState::Disconnected;
            }
        }
        self.notify();
    }

    /// Number of peers in the table.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    fn notify(&self) {
        let _ = self.snapshot_tx.send(self.snapshot());
    }
}

// ============================================================================
// TESTS
// ============================================================================
