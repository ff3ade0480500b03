//! Storage contracts.
//!
//! Trusted peers, chat history, and the secure key-value namespace are
//! persisted by collaborators; the engine reconciles against them but
//! never owns the data.

use async_trait::async_trait;

use crate::error::Result;
use crate::trust::TrustedPeer;

/// Persisted trusted-peer records. At most one record per public key;
/// records are addressed by the code last seen.
#[async_trait]
pub trait TrustedPeerStore: Send + Sync {
    /// Every persisted record, blocked ones included.
    async fn get_all(&self) -> Result<Vec<TrustedPeer>>;

    /// Look a record up by its stable identity.
    async fn get_by_public_key(&self, public_key: &str) -> Result<Option<TrustedPeer>>;

    /// Whether a non-blocked record exists for this public key.
    async fn is_trusted_by_public_key(&self, public_key: &str) -> Result<bool>;

    /// Insert or replace the record stored under `record.code`.
    async fn save(&self, record: &TrustedPeer) -> Result<()>;

    /// Delete the record stored under `code`.
    async fn remove(&self, code: &str) -> Result<()>;

    /// Raw public-key bytes of the record stored under `code`.
    async fn get_public_key_bytes(&self, code: &str) -> Result<Option<Vec<u8>>>;
}

/// Persisted chat history.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Re-key history from `old_id` to `new_id`; returns the row count moved.
    async fn migrate(&self, old_id: &str, new_id: &str) -> Result<u64>;

    /// Append a message. `system` marks engine-generated notices such as
    /// key-rotation warnings.
    async fn save(&self, peer_id: &str, body: &str, system: bool) -> Result<()>;
}

/// Secure key-value store. Linked-device records live here as JSON under
/// `<prefix>_linked_device_<id>`.
#[async_trait]
pub trait SecureStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value.
    async fn remove(&self, key: &str) -> Result<()>;

    /// All keys beginning with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}
