//! # Zajel Core
//!
//! The client-side coordination engine of the Zajel privacy-preserving
//! P2P messaging network: pairing, trusted-peer reconnection via meeting
//! points, signaling dispatch, per-peer connection state, cross-session
//! identity migration, and linked-device proxying.
//!
//! Relay servers facilitate only rendezvous and signaling; they never see
//! plaintext, peer identities, or which peers are communicating beyond
//! opaque meeting-point tokens.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        ZAJEL CORE MODULES                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌──────────────┐   │
//! │  │   Codes     │  │  Signaling  │  │ Rendezvous  │  │   Pairing    │   │
//! │  │             │  │             │  │             │  │              │   │
//! │  │ - Generate  │  │ - Dispatch  │  │ - Tokens    │  │ - Handshake  │   │
//! │  │ - Validate  │  │ - Heartbeat │  │ - Redirects │  │ - Trust gate │   │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘  └──────┬───────┘   │
//! │         │                │                │                │           │
//! │         └────────────────┴───────┬────────┴────────────────┘           │
//! │                                  │                                     │
//! │  ┌─────────────┐  ┌─────────────┐│┌─────────────┐  ┌──────────────┐   │
//! │  │   Peers     │  │    Trust    │││    Link     │  │    Engine    │   │
//! │  │             │  │             │││             │  │              │   │
//! │  │ - Registry  │  │ - Records   │◄┤ - Sessions  │  │ - Composition│   │
//! │  │ - States    │  │ - Migration │ │ - Tunnel    │  │ - Streams    │   │
//! │  └─────────────┘  └─────────────┘ └─────────────┘  └──────────────┘   │
//! │                                                                         │
//! │  External collaborators (contracts module):                            │
//! │  WebRTC engine · crypto service · trusted/message/secure stores ·      │
//! │  signaling transport                                                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! Inbound: bytes → signaling dispatcher → sealed event → engine →
//! (pairing | rendezvous | WebRTC engine) → peer-registry transitions →
//! observer notifications. Outbound: engine → typed send → dispatcher →
//! bytes.
//!
//! ## Privacy Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        WHAT THE SERVER SEES                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Pairing codes      : six-symbol ephemeral addresses, rotated per      │
//! │                       session                                          │
//! │  Meeting points     : SHA-256 / HMAC-SHA256 derived opaque tokens;     │
//! │                       daily tokens bind to key pairs, hourly tokens    │
//! │                       to session secrets                               │
//! │  Dead drops         : ciphertext only; a token collision yields a      │
//! │                       blob the wrong peer cannot decrypt               │
//! │                                                                         │
//! │  Never: plaintext, long-term identities, or the social graph           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod codes;
pub mod contracts;
pub mod engine;
pub mod error;
pub mod link;
pub mod pairing;
pub mod peers;
pub mod rendezvous;
pub mod signaling;
pub mod trust;
/// Time utilities shared across the engine.
pub mod time;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use engine::{ConnectionEngine, ConnectionState, EngineConfig};
pub use error::{Error, Result};
pub use peers::{Peer, PeerConnectionState};
pub use signaling::{SignalingEvent, SignalingState};
pub use trust::TrustedPeer;

/// Returns the version of Zajel Core.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// ============================================================================
// TESTS
// ============================================================================
