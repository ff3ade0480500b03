//! WebRTC engine contract.
//!
//! The engine consumes two streams from the transport engine: a broadcast
//! of connection/data events and a single outbound-signaling stream
//! multiplexed by peer id. Per-peer ordering (offer, then ICE, then data)
//! is the transport engine's guarantee; the coordination engine preserves
//! it by forwarding from one subscription.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;

/// A signaling message the transport engine wants delivered to a peer.
#[derive(Debug, Clone)]
pub struct OutboundSignal {
    /// Destination peer id (pairing code or `link_<code>`)
    pub peer_id: String,
    /// Message body; `message["type"]` distinguishes offers, answers, and
    /// ICE candidates
    pub message: Value,
}

/// Events emitted by the transport engine.
#[derive(Debug, Clone)]
pub enum WebRtcEvent {
    /// The data channel to a peer opened; the encryption handshake begins.
    ChannelOpen {
        /// Peer the channel belongs to
        peer_id: String,
    },
    /// The encryption handshake completed; the peer is fully connected.
    HandshakeComplete {
        /// Peer the handshake was with
        peer_id: String,
    },
    /// A decrypted application message arrived.
    MessageReceived {
        /// Sending peer
        peer_id: String,
        /// Decrypted body
        plaintext: String,
    },
    /// A file transfer began.
    FileStart {
        /// Sending peer
        peer_id: String,
        /// Transfer id
        file_id: String,
        /// Original file name
        name: String,
        /// Total size in bytes
        total_size: u64,
        /// Number of chunks to expect
        total_chunks: u32,
    },
    /// A file chunk arrived.
    FileChunk {
        /// Sending peer
        peer_id: String,
        /// Transfer id
        file_id: String,
        /// Chunk payload
        data: Vec<u8>,
        /// Chunk index
        index: u32,
        /// Number of chunks in the transfer
        total: u32,
    },
    /// A file transfer finished.
    FileComplete {
        /// Sending peer
        peer_id: String,
        /// Transfer id
        file_id: String,
    },
    /// The connection to a peer closed.
    PeerClosed {
        /// Peer whose connection closed
        peer_id: String,
    },
}

/// Operations the engine invokes on the transport engine.
#[async_trait]
pub trait WebRtcEngine: Send + Sync {
    /// Create an SDP offer for `peer_id`.
    async fn create_offer(&self, peer_id: &str) -> Result<Value>;

    /// Apply a remote offer and produce the answer.
    async fn handle_offer(&self, peer_id: &str, offer: Value) -> Result<Value>;

    /// Apply a remote answer.
    async fn handle_answer(&self, peer_id: &str, answer: Value) -> Result<()>;

    /// Apply a remote ICE candidate.
    async fn add_ice_candidate(&self, peer_id: &str, candidate: Value) -> Result<()>;

    /// Encrypt and send an application message over the data channel.
    async fn send_message(&self, peer_id: &str, plaintext: &str) -> Result<()>;

    /// Chunk, encrypt, and send a file.
    async fn send_file(&self, peer_id: &str, name: &str, bytes: Vec<u8>) -> Result<()>;

    /// Feed a relay-carried file chunk into the transfer pipeline.
    async fn ingest_relay_chunk(&self, raw: Value) -> Result<()>;

    /// Close the connection to a peer.
    async fn close_peer(&self, peer_id: &str);

    /// Subscribe to connection and data events.
    fn subscribe_events(&self) -> broadcast::Receiver<WebRtcEvent>;

    /// Subscribe to the outbound-signaling stream.
    fn subscribe_signaling(&self) -> broadcast::Receiver<OutboundSignal>;
}
