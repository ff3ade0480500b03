//! # Error Handling
//!
//! Error types for the Zajel coordination engine.
//!
//! ## Error Categories
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR CATEGORIES                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Pairing Errors                                                    │
//! │  │   ├── InvalidPairingCode   - Code fails alphabet/length validation  │
//! │  │   └── PeerNotFound         - Operation names an unknown peer        │
//! │  │                                                                      │
//! │  ├── Signaling Errors                                                  │
//! │  │   ├── NotConnected         - Operation requires a live dispatcher   │
//! │  │   ├── ConnectionFailed     - Transport connect/send failure         │
//! │  │   └── InvalidMessageFrame  - Malformed inbound frame (warn + drop)  │
//! │  │                                                                      │
//! │  ├── Rendezvous Errors                                                 │
//! │  │   ├── RedirectFailed       - Federated redirect unreachable         │
//! │  │   └── DeadDropDecrypt      - Dead-drop blob failed to decrypt       │
//! │  │                                                                      │
//! │  ├── Link Errors                                                       │
//! │  │   ├── LinkSessionExpired   - Link code presented past its TTL       │
//! │  │   └── InvalidLinkPayload   - QR payload failed to parse             │
//! │  │                                                                      │
//! │  └── Collaborator Errors                                               │
//! │      ├── Crypto               - CryptoService failure                  │
//! │      ├── Storage              - Storage contract failure               │
//! │      └── Serialization        - JSON encode/decode failure             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Dispatch-path errors (malformed frames, dead-drop failures, redirect
//! failures) are logged and dropped so a single bad event never tears down
//! a subscription. Caller-initiated operations propagate.

use thiserror::Error;

/// Result type alias for coordination-engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the coordination engine
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Pairing Errors (100-199)
    // ========================================================================
    /// Pairing code failed validation
    #[error("Invalid pairing code: {0}")]
    InvalidPairingCode(String),

    /// Operation references a peer that is not in the table
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    // ========================================================================
    // Signaling Errors (200-299)
    // ========================================================================
    /// A signaling-requiring operation was invoked outside `Connected`
    #[error("Not connected to a signaling server.")]
    NotConnected,

    /// Transport-level connect or send failure
    #[error("Signaling connection failed: {0}")]
    ConnectionFailed(String),

    /// Malformed inbound signaling frame
    #[error("Invalid signaling frame: {0}")]
    InvalidMessageFrame(String),

    // ========================================================================
    // Rendezvous Errors (300-399)
    // ========================================================================
    /// A federated redirect could not be opened
    #[error("Rendezvous redirect failed: {0}")]
    RedirectFailed(String),

    /// A dead-drop ciphertext did not decrypt under the inferred session
    #[error("Dead drop from {peer_id} failed to decrypt")]
    DeadDropDecrypt {
        /// Peer the blob was attributed to
        peer_id: String,
    },

    // ========================================================================
    // Link Errors (400-499)
    // ========================================================================
    /// A link code was presented after the session expired
    #[error("Link session expired.")]
    LinkSessionExpired,

    /// A QR link payload failed to parse
    #[error("Invalid link payload: {0}")]
    InvalidLinkPayload(String),

    // ========================================================================
    // Collaborator Errors (500-599)
    // ========================================================================
    /// Crypto service failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Storage contract failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Numeric code, grouped by category
    ///
    /// - 100-199: Pairing
    /// - 200-299: Signaling
    /// - 300-399: Rendezvous
    /// - 400-499: Link
    /// - 500-599: Collaborators
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidPairingCode(_) => 100,
            Error::PeerNotFound(_) => 101,

            Error::NotConnected => 200,
            Error::ConnectionFailed(_) => 201,
            Error::InvalidMessageFrame(_) => 202,

            Error::RedirectFailed(_) => 300,
            Error::DeadDropDecrypt { .. } => 301,

            Error::LinkSessionExpired => 400,
            Error::InvalidLinkPayload(_) => 401,

            Error::Crypto(_) => 500,
            Error::Storage(_) => 501,
            Error::Serialization(_) => 502,
        }
    }

    /// Whether retrying or a state change can resolve this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NotConnected
                | Error::ConnectionFailed(_)
                | Error::RedirectFailed(_)
                | Error::PeerNotFound(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
