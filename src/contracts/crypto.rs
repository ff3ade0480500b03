//! Cryptographic primitive service contract.
//!
//! All key material is owned by the implementing service. The engine only
//! ever sees public keys, session-key bytes for hourly-token derivation,
//! and ciphertexts.

use async_trait::async_trait;

use crate::error::Result;

/// An ephemeral key pair generated for a link session.
#[derive(Debug, Clone)]
pub struct EphemeralKeyPair {
    /// X25519 public key bytes
    pub public: Vec<u8>,
    /// Handle to the secret half; opaque to the engine, meaningful to the
    /// crypto service that produced it
    pub secret_handle: String,
}

/// Operations the engine invokes on the crypto collaborator.
#[async_trait]
pub trait CryptoService: Send + Sync {
    /// Prime the service (load or create the long-term identity key).
    async fn initialize(&self) -> Result<()>;

    /// This node's long-term public key, Base64 as it appears on the wire.
    async fn public_key_base64(&self) -> Result<String>;

    /// This node's long-term public key, raw bytes.
    async fn public_key_bytes(&self) -> Result<Vec<u8>>;

    /// The established session secret with `peer_id`, if any. Feeds
    /// hourly-token derivation.
    async fn session_key_bytes(&self, peer_id: &str) -> Result<Option<Vec<u8>>>;

    /// Record a peer's public key without establishing a session.
    async fn set_peer_public_key(&self, peer_id: &str, public_key: &[u8]) -> Result<()>;

    /// A previously recorded peer public key.
    async fn get_peer_public_key(&self, peer_id: &str) -> Result<Option<Vec<u8>>>;

    /// Run the key agreement with `their_public` and install the resulting
    /// session for `peer_id`, replacing any prior session.
    async fn establish_session(&self, peer_id: &str, their_public: &[u8]) -> Result<()>;

    /// Encrypt under the session established with `peer_id`.
    async fn encrypt_for_peer(&self, peer_id: &str, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt under the session established with `peer_id`.
    async fn decrypt_from_peer(&self, peer_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Encrypt under an explicit raw key.
    async fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt under an explicit raw key.
    async fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Generate an ephemeral key pair for a link session.
    async fn generate_ephemeral_key_pair(&self) -> Result<EphemeralKeyPair>;
}
