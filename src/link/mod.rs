//! # Linked-Device Proxy
//!
//! A browser cannot pin certificates against a signaling server; linking
//! it to this node lets it ride this node's pinned, authenticated link as
//! a plaintext sibling.
//!
//! ## Tunnel
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      LINKED-DEVICE TUNNEL                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  peer P ──plaintext──► this node ──encrypt(device key)──► browser D    │
//! │                          {type:"message", from:P, data:<ct>}           │
//! │                                                                         │
//! │  browser D ──{type:"send", to:P, data:<ct>}──► this node               │
//! │    decrypt(device key) ──► WebRTC send_message(P, plaintext)           │
//! │    (re-encrypted under the P session by the transport engine)          │
//! │                                                                         │
//! │  peer transitions ──► {type:"peer_state", peerId, state} to every      │
//! │                       connected device                                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The proxy never forwards a plaintext it did not itself decrypt under a
//! known linked-device key, and never forwards to a device that is not
//! `Connected`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::codes;
use crate::contracts::{CryptoService, EphemeralKeyPair, SecureStore, WebRtcEngine};
use crate::error::{Error, Result};

/// URI scheme of the QR payload.
pub const LINK_SCHEME: &str = "zajel-link://";

/// Runtime state of a linked device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkDeviceState {
    /// Tunnel is up
    Connected,
    /// No tunnel
    #[default]
    Disconnected,
}

/// A short-lived capability granting one second client tunnelled access.
#[derive(Debug, Clone)]
pub struct LinkSession {
    /// The link code (pairing-code alphabet)
    pub code: String,
    /// Ephemeral key pair for this session
    pub key_pair: EphemeralKeyPair,
    /// The signaling server the browser should join
    pub server_url: String,
    /// Creation timestamp
    pub created_at: i64,
    /// Expiry timestamp (creation + 5 minutes)
    pub expires_at: i64,
}

impl LinkSession {
    /// The QR payload: `zajel-link://<code>:<pubkey>:<url-encoded-server>`.
    pub fn qr_payload(&self) -> String {
        format!(
            "{}{}:{}:{}",
            LINK_SCHEME,
            self.code,
            BASE64.encode(&self.key_pair.public),
            urlencoding::encode(&self.server_url)
        )
    }

    /// Whether the session has passed its expiry.
    pub fn is_expired(&self) -> bool {
        crate::time::now_timestamp() >= self.expires_at
    }
}

/// Parse a QR payload back into `(code, public_key_base64, server_url)`.
///
/// The server URL itself contains `:`, so the parser keeps the first two
/// `:`-separated parts and rejoins the remainder before URL-decoding.
pub fn parse_link_payload(payload: &str) -> Result<(String, String, String)> {
    let rest = payload
        .strip_prefix(LINK_SCHEME)
        .ok_or_else(|| Error::InvalidLinkPayload("missing scheme".into()))?;
    let mut parts = rest.splitn(3, ':');
    let code = parts
        .next()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::InvalidLinkPayload("missing link code".into()))?;
    let public_key = parts
        .next()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| Error::InvalidLinkPayload("missing public key".into()))?;
    let encoded_url = parts
        .next()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| Error::InvalidLinkPayload("missing server url".into()))?;
    let server_url = urlencoding::decode(encoded_url)
        .map_err(|e| Error::InvalidLinkPayload(format!("bad url encoding: {}", e)))?
        .into_owned();
    Ok((code.to_string(), public_key.to_string(), server_url))
}

/// A persisted record for an accepted link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedDevice {
    /// Stable device id (`web_<uuid>`)
    pub device_id: String,
    /// Self-reported device name
    pub device_name: String,
    /// The device's public key, Base64
    pub public_key: String,
    /// When the link was accepted
    pub linked_at: i64,
    /// Last activity timestamp
    pub last_seen: i64,
    /// Runtime tunnel state; always `Disconnected` after a load
    #[serde(skip)]
    pub state: LinkDeviceState,
    /// WebRTC peer id of the live tunnel (`link_<code>`)
    #[serde(skip)]
    pub channel: Option<String>,
}

/// An incoming link request waiting for the UI's verdict.
#[derive(Debug, Clone)]
pub struct PendingLinkRequest {
    /// The presented link code
    pub code: String,
    /// The device's ephemeral public key, Base64
    pub public_key: String,
    /// The device's self-reported name
    pub device_name: String,
}

/// Owns link sessions, linked-device records, and the tunnel glue.
pub struct LinkManager {
    me: Weak<LinkManager>,
    crypto: Arc<dyn CryptoService>,
    webrtc: Arc<dyn WebRtcEngine>,
    secure: Arc<dyn SecureStore>,
    storage_prefix: String,
    session_ttl: Duration,
    session: RwLock<Option<LinkSession>>,
    pending: RwLock<Option<PendingLinkRequest>>,
    devices: RwLock<HashMap<String, LinkedDevice>>,
    expiry_task: Mutex<Option<JoinHandle<()>>>,
}

impl LinkManager {
    /// Wire the manager to its collaborators.
    pub fn new(
        crypto: Arc<dyn CryptoService>,
        webrtc: Arc<dyn WebRtcEngine>,
        secure: Arc<dyn SecureStore>,
        storage_prefix: String,
        session_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            crypto,
            webrtc,
            secure,
            storage_prefix,
            session_ttl,
            session: RwLock::new(None),
            pending: RwLock::new(None),
            devices: RwLock::new(HashMap::new()),
            expiry_task: Mutex::new(None),
        })
    }

    fn storage_key(&self, device_id: &str) -> String {
        format!("{}_linked_device_{}", self.storage_prefix, device_id)
    }

    /// Load persisted devices; all start `Disconnected`.
    pub async fn load_devices(&self) {
        let prefix = format!("{}_linked_device_", self.storage_prefix);
        let keys = match self.secure.keys_with_prefix(&prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "linked-device scan failed");
                return;
            }
        };
        let mut loaded = 0usize;
        for key in keys {
            match self.secure.get(&key).await {
                Ok(Some(raw)) => match serde_json::from_str::<LinkedDevice>(&raw) {
                    Ok(device) => {
                        self.devices
                            .write()
                            .insert(device.device_id.clone(), device);
                        loaded += 1;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, %key, "corrupt linked-device record");
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, %key, "linked-device read failed");
                }
            }
        }
        if loaded > 0 {
            tracing::info!(count = loaded, "loaded linked devices");
        }
    }

    /// Create a link session: fresh code, ephemeral key pair, 5-minute
    /// expiry. Replaces any prior session.
    pub async fn create_link_session(&self, server_url: &str) -> Result<LinkSession> {
        let key_pair = self.crypto.generate_ephemeral_key_pair().await?;
        let now = crate::time::now_timestamp();
        let session = LinkSession {
            code: codes::generate(),
            key_pair,
            server_url: server_url.to_string(),
            created_at: now,
            expires_at: now + self.session_ttl.as_secs() as i64,
        };
        *self.session.write() = Some(session.clone());

        // the session cancels itself on expiry
        if let Some(prior) = self.expiry_task.lock().take() {
            prior.abort();
        }
        let manager = self.me.clone();
        let code = session.code.clone();
        let ttl = self.session_ttl;
        let task = tokio::spawn(async move {
            eprintln!("DEBUG: task started, sleeping {:?}", ttl);
            tokio::time::sleep(ttl).await;
            eprintln!("DEBUG: task woke up");
            let Some(manager) = manager.upgrade() else {
                eprintln!("DEBUG: upgrade failed");
                return;
            };
            let mut guard = manager.session.write();
            eprintln!("DEBUG: guard code={:?} expect={}", guard.as_ref().map(|s| s.code.clone()), code);
            if guard.as_ref().map(|s| s.code == code).unwrap_or(false) {
                tracing::info!(%code, "link session expired");
                *guard = None;
            }
        });
        *self.expiry_task.lock() = Some(task);

        tracing::info!(code = %session.code, "link session created");
        Ok(session)
    }

    /// The current session, if any.
    pub fn current_session(&self) -> Option<LinkSession> {
        self.session.read().clone()
    }

    /// Record an inbound link request. Returns the pending request when
    /// the presented code matches a live session; `Err` when it does not.
    pub fn note_request(
        &self,
        code: &str,
        public_key: &str,
        device_name: &str,
    ) -> Result<PendingLinkRequest> {
        let session = self.session.read().clone();
        let matches = match &session {
            Some(s) if s.code == code => {
                if s.is_expired() {
                    return Err(Error::LinkSessionExpired);
                }
                true
            }
            _ => false,
        };
        if !matches {
            return Err(Error::InvalidLinkPayload(format!(
                "no session for code {}",
                code
            )));
        }
        let pending = PendingLinkRequest {
            code: code.to_string(),
            public_key: public_key.to_string(),
            device_name: device_name.to_string(),
        };
        *self.pending.write() = Some(pending.clone());
        Ok(pending)
    }

    /// Accept the pending request: establish the device session, persist
    /// the record, and bind the tunnel to `link_<code>`. Returns the
    /// device id (`preferred_id` when relinking a known device).
    pub async fn admit_pending(&self, preferred_id: Option<String>) -> Result<String> {
        let pending = self
            .pending
            .write()
            .take()
            .ok_or_else(|| Error::InvalidLinkPayload("no pending link request".into()))?;

        let session_live = self
            .session
            .read()
            .as_ref()
            .map(|s| s.code == pending.code && !s.is_expired())
            .unwrap_or(false);
        if !session_live {
            return Err(Error::LinkSessionExpired);
        }

        let key_bytes = BASE64
            .decode(&pending.public_key)
            .map_err(|e| Error::InvalidLinkPayload(format!("device key not Base64: {}", e)))?;

        let device_id =
            preferred_id.unwrap_or_else(|| format!("web_{}", Uuid::new_v4().simple()));
        self.crypto.establish_session(&device_id, &key_bytes).await?;

        let now = crate::time::now_timestamp();
        let device = LinkedDevice {
            device_id: device_id.clone(),
            device_name: pending.device_name,
            public_key: pending.public_key,
            linked_at: now,
            last_seen: now,
            state: LinkDeviceState::Connected,
            channel: Some(format!("link_{}", pending.code)),
        };
        match serde_json::to_string(&device) {
            Ok(raw) => {
                if let Err(e) = self.secure.set(&self.storage_key(&device_id), &raw).await {
                    tracing::warn!(error = %e, "failed to persist linked device");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode linked device");
            }
        }
        self.devices.write().insert(device_id.clone(), device);

        // the session is single-use
        *self.session.write() = None;
        if let Some(task) = self.expiry_task.lock().take() {
            task.abort();
        }

        tracing::info!(%device_id, "linked device admitted");
        Ok(device_id)
    }

    /// Reject and clear the pending request.
    pub fn reject_pending(&self) {
        *self.pending.write() = None;
    }

    /// Device id whose live tunnel is bound to `channel`.
    pub fn device_for_channel(&self, channel: &str) -> Option<String> {
        self.devices
            .read()
            .values()
            .find(|d| d.channel.as_deref() == Some(channel))
            .map(|d| d.device_id.clone())
    }

    /// Bind a loaded device's tunnel to a channel and mark it connected.
    pub fn bind_channel(&self, device_id: &str, channel: &str) {
        if let Some(device) = self.devices.write().get_mut(device_id) {
            device.channel = Some(channel.to_string());
            device.state = LinkDeviceState::Connected;
            device.last_seen = crate::time::now_timestamp();
        }
    }

    /// Current device list.
    pub fn devices(&self) -> Vec<LinkedDevice> {
        let mut list: Vec<LinkedDevice> = self.devices.read().values().cloned().collect();
        list.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        list
    }

    /// Flip a device's runtime state.
    pub fn set_device_state(&self, device_id: &str, state: LinkDeviceState) {
        if let Some(device) = self.devices.write().get_mut(device_id) {
            device.state = state;
            device.last_seen = crate::time::now_timestamp();
        }
    }

    /// Mobile → browser direction: encrypt a peer's plaintext under each
    /// connected device's key and tunnel it through.
    pub async fn forward_to_devices(&self, from_peer: &str, plaintext: &str) {
        let targets: Vec<(String, String)> = self
            .devices
            .read()
            .values()
            .filter(|d| d.state == LinkDeviceState::Connected)
            .filter_map(|d| d.channel.clone().map(|c| (d.device_id.clone(), c)))
            .collect();

        for (device_id, channel) in targets {
            let ciphertext = match self
                .crypto
                .encrypt_for_peer(&device_id, plaintext.as_bytes())
                .await
            {
                Ok(ct) => ct,
                Err(e) => {
                    tracing::warn!(error = %e, %device_id, "tunnel encryption failed");
                    continue;
                }
            };
            let frame = json!({
                "type": "message",
                "from": from_peer,
                "data": BASE64.encode(ciphertext),
            });
            if let Err(e) = self.webrtc.send_message(&channel, &frame.to_string()).await {
                tracing::warn!(error = %e, %device_id, "tunnel send failed");
            }
        }
    }

    /// Browser → peer direction: decrypt a `send` frame under the device
    /// key and hand the plaintext to the transport engine, which
    /// re-encrypts it for the destination peer. Frames that do not decrypt
    /// are dropped.
    pub async fn handle_device_frame(&self, device_id: &str, frame: &Value) {
        let kind = frame.get("type").and_then(Value::as_str).unwrap_or("");
        if kind != "send" {
            tracing::debug!(%device_id, %kind, "ignoring tunnel frame");
            return;
        }
        let Some(to) = frame.get("to").and_then(Value::as_str) else {
            tracing::warn!(%device_id, "send frame without destination");
            return;
        };
        let Some(data) = frame.get("data").and_then(Value::as_str) else {
            tracing::warn!(%device_id, "send frame without data");
            return;
        };
        let ciphertext = match BASE64.decode(data) {
            Ok(ct) => ct,
            Err(e) => {
                tracing::warn!(error = %e, %device_id, "tunnel data is not Base64");
                return;
            }
        };
        let plaintext = match self.crypto.decrypt_from_peer(device_id, &ciphertext).await {
            Ok(pt) => pt,
            Err(e) => {
                tracing::warn!(error = %e, %device_id, "tunnel decryption failed; dropping");
                return;
            }
        };
        let text = String::from_utf8_lossy(&plaintext).into_owned();
        if let Err(e) = self.webrtc.send_message(to, &text).await {
            tracing::warn!(error = %e, peer = %to, "proxied send failed");
        }
        self.set_device_state(device_id, LinkDeviceState::Connected);
    }

    /// Fan a peer-state transition out to every connected device.
    pub async fn broadcast_peer_state(&self, peer_id: &str, state: &str) {
        let channels: Vec<String> = self
            .devices
            .read()
            .values()
            .filter(|d| d.state == LinkDeviceState::Connected)
            .filter_map(|d| d.channel.clone())
            .collect();
        let frame = json!({
            "type": "peer_state",
            "peerId": peer_id,
            "state": state,
        });
        for channel in channels {
            if let Err(e) = self.webrtc.send_message(&channel, &frame.to_string()).await {
                tracing::warn!(error = %e, %channel, "peer-state fan-out failed");
            }
        }
    }

    /// Cancel the expiry timer and drop any live session.
    pub fn shutdown(&self) {
        if let Some(task) = self.expiry_task.lock().take() {
            task.abort();
        }
        *self.session.write() = None;
        *self.pending.write() = None;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::testing::{FakeCrypto, FakeWebRtc, MemorySecureStore};

    fn manager() -> (
        Arc<LinkManager>,
        Arc<FakeCrypto>,
        Arc<FakeWebRtc>,
        Arc<MemorySecureStore>,
    ) {
        let crypto = Arc::new(FakeCrypto::new(b"my-public"));
        let webrtc = Arc::new(FakeWebRtc::new());
        let secure = Arc::new(MemorySecureStore::new());
        let manager = LinkManager::new(
            crypto.clone(),
            webrtc.clone(),
            secure.clone(),
            "zajel".into(),
            Duration::from_secs(300),
        );
        (manager, crypto, webrtc, secure)
    }

    #[test]
    fn test_qr_payload_round_trip_with_colons_in_url() {
        let session = LinkSession {
            code: "M3W7K2".into(),
            key_pair: EphemeralKeyPair {
                public: b"ephemeral".to_vec(),
                secret_handle: "h".into(),
            },
            server_url: "wss://signal.example:8443/ws".into(),
            created_at: 0,
            expires_at: i64::MAX,
        };
        let payload = session.qr_payload();
        assert!(payload.starts_with("zajel-link://M3W7K2:"));

        let (code, key, url) = parse_link_payload(&payload).unwrap();
        assert_eq!(code, "M3W7K2");
        assert_eq!(key, BASE64.encode(b"ephemeral"));
        assert_eq!(url, "wss://signal.example:8443/ws");
    }

    #[test]
    fn test_parse_rejects_malformed_payloads() {
        assert!(parse_link_payload("https://nope").is_err());
        assert!(parse_link_payload("zajel-link://").is_err());
        assert!(parse_link_payload("zajel-link://CODE").is_err());
        assert!(parse_link_payload("zajel-link://CODE:KEY").is_err());
        assert!(parse_link_payload("zajel-link://CODE:KEY:").is_err());
    }

    #[tokio::test]
    async fn test_create_session_generates_valid_code() {
        let (manager, _crypto, _webrtc, _secure) = manager();
        let session = manager
            .create_link_session("wss://signal.example/ws")
            .await
            .unwrap();
        assert!(crate::codes::validate(&session.code));
        assert!(!session.is_expired());
        assert_eq!(session.expires_at - session.created_at, 300);
        assert!(manager.current_session().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_cancels_itself_on_expiry() {
        let (manager, _crypto, _webrtc, _secure) = manager();
        manager
            .create_link_session("wss://signal.example/ws")
            .await
            .unwrap();
        assert!(manager.current_session().is_some());

        tokio::time::advance(Duration::from_secs(301)).await;
        tokio::task::yield_now().await;
        assert!(manager.current_session().is_none());
    }

    #[tokio::test]
    async fn test_note_request_rejects_wrong_code() {
        let (manager, _crypto, _webrtc, _secure) = manager();
        manager
            .create_link_session("wss://signal.example/ws")
            .await
            .unwrap();
        let err = manager
            .note_request("WRONGC", "a2V5", "Browser")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidLinkPayload(_)));
    }

    #[tokio::test]
    async fn test_expired_session_rejects_its_own_code() {
        let (manager, _crypto, _webrtc, _secure) = manager();
        let session = manager
            .create_link_session("wss://signal.example/ws")
            .await
            .unwrap();
        // force the expiry into the past
        manager.session.write().as_mut().unwrap().expires_at =
            crate::time::now_timestamp() - 1;

        let err = manager
            .note_request(&session.code, "a2V5", "Browser")
            .unwrap_err();
        assert!(matches!(err, Error::LinkSessionExpired));
    }

    #[tokio::test]
    async fn test_admission_establishes_session_and_persists() {
        let (manager, crypto, _webrtc, secure) = manager();
        let session = manager
            .create_link_session("wss://signal.example/ws")
            .await
            .unwrap();
        manager
            .note_request(&session.code, &BASE64.encode(b"device-public"), "Firefox")
            .unwrap();

        let device_id = manager.admit_pending(None).await.unwrap();
        assert!(device_id.starts_with("web_"));

        // crypto session installed under the device id
        assert!(crypto
            .session_key_bytes(&device_id)
            .await
            .unwrap()
            .is_some());

        // record persisted under the namespaced key
        let raw = secure
            .get(&format!("zajel_linked_device_{}", device_id))
            .await
            .unwrap()
            .expect("record persisted");
        let stored: LinkedDevice = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored.device_name, "Firefox");

        // runtime state is connected with the tunnel bound to link_<code>
        let device = &manager.devices()[0];
        assert_eq!(device.state, LinkDeviceState::Connected);
        assert_eq!(
            device.channel.as_deref(),
            Some(format!("link_{}", session.code).as_str())
        );

        // the session is consumed
        assert!(manager.current_session().is_none());
    }

    #[tokio::test]
    async fn test_loaded_devices_start_disconnected() {
        let (manager, _crypto, _webrtc, secure) = manager();
        let device = LinkedDevice {
            device_id: "web_abc".into(),
            device_name: "Safari".into(),
            public_key: "a2V5".into(),
            linked_at: 1,
            last_seen: 2,
            state: LinkDeviceState::Connected,
            channel: Some("link_OLDOLD".into()),
        };
        secure
            .set(
                "zajel_linked_device_web_abc",
                &serde_json::to_string(&device).unwrap(),
            )
            .await
            .unwrap();

        manager.load_devices().await;
        let loaded = manager.devices();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].state, LinkDeviceState::Disconnected);
        assert!(loaded[0].channel.is_none(), "tunnel binding is not persisted");
    }

    async fn admitted_device(
        manager: &Arc<LinkManager>,
    ) -> (String, String) {
        let session = manager
            .create_link_session("wss://signal.example/ws")
            .await
            .unwrap();
        manager
            .note_request(&session.code, &BASE64.encode(b"device-public"), "Firefox")
            .unwrap();
        let device_id = manager.admit_pending(None).await.unwrap();
        (device_id, format!("link_{}", session.code))
    }

    #[tokio::test]
    async fn test_forward_to_devices_encrypts_per_device() {
        let (manager, crypto, webrtc, _secure) = manager();
        let (device_id, channel) = admitted_device(&manager).await;

        manager.forward_to_devices("Q7P3R8", "ping").await;

        let sent = webrtc.messages_sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, channel);
        let frame: Value = serde_json::from_str(&sent[0].1).unwrap();
        assert_eq!(frame["type"], "message");
        assert_eq!(frame["from"], "Q7P3R8");

        // the data round-trips under the device session
        let ct = BASE64.decode(frame["data"].as_str().unwrap()).unwrap();
        let pt = crypto.decrypt_from_peer(&device_id, &ct).await.unwrap();
        assert_eq!(pt, b"ping");
    }

    #[tokio::test]
    async fn test_disconnected_devices_get_nothing() {
        let (manager, _crypto, webrtc, _secure) = manager();
        let (device_id, _channel) = admitted_device(&manager).await;
        manager.set_device_state(&device_id, LinkDeviceState::Disconnected);

        manager.forward_to_devices("Q7P3R8", "ping").await;
        manager.broadcast_peer_state("Q7P3R8", "connected").await;
        assert!(webrtc.messages_sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_device_send_frame_is_decrypted_and_proxied() {
        let (manager, crypto, webrtc, _secure) = manager();
        let (device_id, _channel) = admitted_device(&manager).await;

        let ct = crypto
            .encrypt_for_peer(&device_id, b"reply")
            .await
            .unwrap();
        let frame = json!({"type": "send", "to": "Q7P3R8", "data": BASE64.encode(ct)});
        manager.handle_device_frame(&device_id, &frame).await;

        let sent = webrtc.messages_sent.lock().clone();
        assert_eq!(sent, vec![("Q7P3R8".to_string(), "reply".to_string())]);
    }

    #[tokio::test]
    async fn test_undecryptable_tunnel_frame_is_dropped() {
        let (manager, _crypto, webrtc, _secure) = manager();
        let (device_id, _channel) = admitted_device(&manager).await;

        let frame = json!({"type": "send", "to": "Q7P3R8", "data": BASE64.encode(b"junk")});
        manager.handle_device_frame(&device_id, &frame).await;
        assert!(webrtc.messages_sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_peer_state_fans_out_to_connected_devices() {
        let (manager, _crypto, webrtc, _secure) = manager();
        let (_device_id, channel) = admitted_device(&manager).await;

        manager.broadcast_peer_state("Q7P3R8", "connected").await;

        let sent = webrtc.messages_sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, channel);
        let frame: Value = serde_json::from_str(&sent[0].1).unwrap();
        assert_eq!(frame["type"], "peer_state");
        assert_eq!(frame["peerId"], "Q7P3R8");
        assert_eq!(frame["state"], "connected");
    }
}
