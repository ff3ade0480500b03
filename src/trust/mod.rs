//! # Trusted Peers & Identity Continuity
//!
//! A peer's stable identity is its public key; its pairing code is an
//! ephemeral address that rotates across sessions. This module owns the
//! reconciliation between the two:
//!
//! - **Code rotation** (same key, new code): message history and aliases
//!   are migrated to the new code and the old record is atomically
//!   replaced.
//! - **Key rotation** (same code, new key): trust-on-first-use with a
//!   record-and-warn policy. The old and new keys are recorded, the
//!   session is re-established, a rotation event is emitted, and a system
//!   message lands in chat history. Rotations are never refused.
//!
//! Storage failures along either path are logged and do not abort the
//! connection; only historical continuity degrades.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::contracts::{CryptoService, MessageStore, TrustedPeerStore};
use crate::peers::{Peer, PeerConnectionState, PeerRegistry};

/// A recorded public-key change for a trusted peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRotation {
    /// The key the record previously carried, Base64
    pub old_key: String,
    /// The key now in use, Base64
    pub new_key: String,
    /// When the rotation was observed
    pub rotated_at: i64,
    /// Whether the user has acknowledged the warning
    pub acknowledged: bool,
}

/// A persisted trusted-peer record, keyed by stable public key and stored
/// under the code last seen. At most one record exists per public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedPeer {
    /// Long-term public key, Base64 (the stable identity)
    pub public_key: String,
    /// Pairing code last seen for this peer
    pub code: String,
    /// Display name
    pub display_name: String,
    /// User-chosen alias
    pub alias: Option<String>,
    /// When trust was first established
    pub trusted_at: i64,
    /// Last activity timestamp
    pub last_seen: i64,
    /// Whether the user blocked this peer
    pub blocked: bool,
    /// Unacknowledged or acknowledged key rotation, if one occurred
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_rotation: Option<KeyRotation>,
}

impl TrustedPeer {
    /// A fresh record for a newly trusted peer.
    pub fn new(public_key: &str, code: &str, display_name: &str) -> Self {
        let now = crate::time::now_timestamp();
        Self {
            public_key: public_key.to_string(),
            code: code.to_string(),
            display_name: display_name.to_string(),
            alias: None,
            trusted_at: now,
            last_seen: now,
            blocked: false,
            key_rotation: None,
        }
    }
}

/// Emitted when a trusted peer's public key changes.
#[derive(Debug, Clone)]
pub struct KeyRotationEvent {
    /// The code the rotation was observed under
    pub peer_code: String,
    /// Previous key, Base64
    pub old_key: String,
    /// New key, Base64
    pub new_key: String,
}

/// Outcome of a code-rotation migration.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    /// The code the peer was previously known under
    pub old_code: String,
    /// Rows of history moved to the new code
    pub migrated_messages: u64,
}

/// Reconciles a freshly matched `(code, public key)` pair against trusted
/// storage. Invoked on every pair match.
pub struct IdentityReconciler {
    trust: Arc<dyn TrustedPeerStore>,
    messages: Arc<dyn MessageStore>,
    crypto: Arc<dyn CryptoService>,
    registry: Arc<PeerRegistry>,
    rotation_tx: broadcast::Sender<KeyRotationEvent>,
}

impl IdentityReconciler {
    /// Wire the reconciler to its collaborators.
    pub fn new(
        trust: Arc<dyn TrustedPeerStore>,
        messages: Arc<dyn MessageStore>,
        crypto: Arc<dyn CryptoService>,
        registry: Arc<PeerRegistry>,
        rotation_tx: broadcast::Sender<KeyRotationEvent>,
    ) -> Self {
        Self {
            trust,
            messages,
            crypto,
            registry,
            rotation_tx,
        }
    }

    /// Reconcile a matched peer. Returns the migration outcome when the
    /// public key was previously trusted under a different code.
    pub async fn reconcile(&self, new_code: &str, public_key: &str) -> Option<MigrationOutcome> {
        match self.trust.get_by_public_key(public_key).await {
            Ok(Some(record)) if record.code != new_code => {
                Some(self.migrate(record, new_code).await)
            }
            Ok(_) => {
                self.detect_key_rotation(new_code, public_key).await;
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "trusted-peer lookup failed during reconcile");
                None
            }
        }
    }

    /// Atomic re-key of registry, history, and trusted storage from
    /// `record.code` to `new_code`.
    async fn migrate(&self, record: TrustedPeer, new_code: &str) -> MigrationOutcome {
        let old_code = record.code.clone();
        tracing::info!(%old_code, %new_code, "migrating trusted peer to new code");

        let migrated_messages = match self.messages.migrate(&old_code, new_code).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, %old_code, "message migration failed");
                0
            }
        };

        // carry the old identity forward under the new code
        let carried = Peer {
            code: new_code.to_string(),
            display_name: record.display_name.clone(),
            alias: record.alias.clone(),
            public_key: Some(record.public_key.clone()),
            state: PeerConnectionState::Connecting,
            last_seen: Some(crate::time::now_timestamp()),
            is_local: false,
        };
        self.registry.insert(carried);
        self.registry.remove(&old_code);

        let mut renewed = record;
        renewed.code = new_code.to_string();
        renewed.last_seen = crate::time::now_timestamp();
        if let Err(e) = self.trust.remove(&old_code).await {
            tracing::warn!(error = %e, %old_code, "failed to delete old trusted record");
        }
        if let Err(e) = self.trust.save(&renewed).await {
            tracing::warn!(error = %e, %new_code, "failed to save migrated trusted record");
        }

        MigrationOutcome {
            old_code,
            migrated_messages,
        }
    }

    /// TOFU record-and-warn when the key stored under `code` differs from
    /// the one just presented.
    async fn detect_key_rotation(&self, code: &str, new_key: &str) {
        let existing = match self.trust.get_all().await {
            Ok(all) => all.into_iter().find(|r| r.code == code),
            Err(e) => {
                tracing::warn!(error = %e, "trusted-peer scan failed during rotation check");
                return;
            }
        };
        let Some(mut record) = existing else {
            return;
        };
        if record.public_key == new_key {
            return;
        }

        let old_key = record.public_key.clone();
        tracing::warn!(peer = %code, "public key rotated for trusted peer");

        record.key_rotation = Some(KeyRotation {
            old_key: old_key.clone(),
            new_key: new_key.to_string(),
            rotated_at: crate::time::now_timestamp(),
            acknowledged: false,
        });
        record.public_key = new_key.to_string();
        if let Err(e) = self.trust.save(&record).await {
            tracing::warn!(error = %e, "failed to persist key rotation");
        }

        match BASE64.decode(new_key) {
            Ok(key_bytes) => {
                if let Err(e) = self.crypto.establish_session(code, &key_bytes).await {
                    tracing::warn!(error = %e, peer = %code, "session swap after rotation failed");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, peer = %code, "rotated key is not valid Base64");
            }
        }

        if let Err(e) = self
            .messages
            .save(
                code,
                "Security notice: this contact's encryption key changed.",
                true,
            )
            .await
        {
            tracing::warn!(error = %e, "failed to write rotation system message");
        }

        let _ = self.rotation_tx.send(KeyRotationEvent {
            peer_code: code.to_string(),
            old_key,
            new_key: new_key.to_string(),
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::testing::{FakeCrypto, MemoryMessageStore, MemoryTrustStore};

    fn reconciler() -> (
        IdentityReconciler,
        Arc<MemoryTrustStore>,
        Arc<MemoryMessageStore>,
        Arc<PeerRegistry>,
        broadcast::Receiver<KeyRotationEvent>,
    ) {
        let trust = Arc::new(MemoryTrustStore::new());
        let messages = Arc::new(MemoryMessageStore::new());
        let crypto = Arc::new(FakeCrypto::new(b"my-public-key"));
        let registry = Arc::new(PeerRegistry::new());
        let (rotation_tx, rotation_rx) = broadcast::channel(8);
        let reconciler = IdentityReconciler::new(
            trust.clone(),
            messages.clone(),
            crypto,
            registry.clone(),
            rotation_tx,
        );
        (reconciler, trust, messages, registry, rotation_rx)
    }

    #[tokio::test]
    async fn test_unknown_key_is_a_no_op() {
        let (reconciler, trust, _messages, registry, _rx) = reconciler();
        let outcome = reconciler.reconcile("A2K9M4", "bmV3a2V5").await;
        assert!(outcome.is_none());
        assert!(trust.get_all().await.unwrap().is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_code_rotation_migrates_history_and_rekeys_records() {
        let (reconciler, trust, messages, registry, _rx) = reconciler();

        trust
            .save(&TrustedPeer::new("c3RhYmxl", "OLDCDE", "Nadia"))
            .await
            .unwrap();
        messages.save("OLDCDE", "hello", false).await.unwrap();
        messages.save("OLDCDE", "again", false).await.unwrap();
        registry.insert(Peer::placeholder("OLDCDE"));

        let outcome = reconciler
            .reconcile("NEWCDE", "c3RhYmxl")
            .await
            .expect("migration expected");
        assert_eq!(outcome.old_code, "OLDCDE");
        assert_eq!(outcome.migrated_messages, 2);

        // old code gone from both table and storage
        assert!(!registry.contains("OLDCDE"));
        assert!(trust.get_public_key_bytes("OLDCDE").await.unwrap().is_none());

        // new code carries the old name and the key, in Connecting
        let peer = registry.get("NEWCDE").unwrap();
        assert_eq!(peer.display_name, "Nadia");
        assert_eq!(peer.public_key.as_deref(), Some("c3RhYmxl"));
        assert_eq!(peer.state, PeerConnectionState::Connecting);

        let record = trust.get_by_public_key("c3RhYmxl").await.unwrap().unwrap();
        assert_eq!(record.code, "NEWCDE");
        assert_eq!(messages.count_for("NEWCDE").await, 2);
        assert_eq!(messages.count_for("OLDCDE").await, 0);
    }

    #[tokio::test]
    async fn test_migration_preserves_trusted_at_and_alias() {
        let (reconciler, trust, _messages, _registry, _rx) = reconciler();

        let mut record = TrustedPeer::new("c3RhYmxl", "OLDCDE", "Nadia");
        record.trusted_at = 1_700_000_000;
        record.alias = Some("bestie".into());
        trust.save(&record).await.unwrap();

        reconciler.reconcile("NEWCDE", "c3RhYmxl").await.unwrap();

        let renewed = trust.get_by_public_key("c3RhYmxl").await.unwrap().unwrap();
        assert_eq!(renewed.trusted_at, 1_700_000_000);
        assert_eq!(renewed.alias.as_deref(), Some("bestie"));
    }

    #[tokio::test]
    async fn test_same_code_same_key_changes_nothing() {
        let (reconciler, trust, _messages, _registry, mut rx) = reconciler();
        trust
            .save(&TrustedPeer::new("c3RhYmxl", "A2K9M4", "Nadia"))
            .await
            .unwrap();

        let outcome = reconciler.reconcile("A2K9M4", "c3RhYmxl").await;
        assert!(outcome.is_none());
        assert!(rx.try_recv().is_err());
        let record = trust.get_by_public_key("c3RhYmxl").await.unwrap().unwrap();
        assert!(record.key_rotation.is_none());
    }

    #[tokio::test]
    async fn test_key_rotation_records_warns_and_keeps_connecting() {
        let (reconciler, trust, messages, _registry, mut rx) = reconciler();
        trust
            .save(&TrustedPeer::new("b2xka2V5", "A2K9M4", "Nadia"))
            .await
            .unwrap();

        let outcome = reconciler.reconcile("A2K9M4", "bmV3a2V5").await;
        assert!(outcome.is_none(), "rotation is not a migration");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.peer_code, "A2K9M4");
        assert_eq!(event.old_key, "b2xka2V5");
        assert_eq!(event.new_key, "bmV3a2V5");

        let record = trust.get_by_public_key("bmV3a2V5").await.unwrap().unwrap();
        let rotation = record.key_rotation.expect("rotation recorded");
        assert!(!rotation.acknowledged);
        assert_eq!(rotation.old_key, "b2xka2V5");

        // a system message landed in history
        assert_eq!(messages.system_count_for("A2K9M4").await, 1);
    }

}
