//! In-memory collaborator doubles shared by the test suites.
//!
//! The fakes implement the contract traits faithfully enough for
//! scenario tests: the transport hands the server end back to the test,
//! the crypto service derives the same session secret on both sides of a
//! pair, and the stores are plain maps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Notify};

use crate::error::{Error, Result};
use crate::trust::TrustedPeer;

use super::{
    CryptoService, EphemeralKeyPair, MessageStore, OutboundSignal, SecureStore,
    SignalingTransport, TransportLink, TrustedPeerStore, WebRtcEngine, WebRtcEvent,
};

// ============================================================================
// TRANSPORT
// ============================================================================

/// The server half of an in-memory signaling link.
pub struct ServerEnd {
    /// URL the client connected to
    pub url: String,
    /// Frames the client sent
    pub sent: mpsc::Receiver<String>,
    /// Push frames to the client
    pub push: mpsc::Sender<String>,
}

impl ServerEnd {
    /// Receive the next client frame as parsed JSON.
    pub async fn next_frame(&mut self) -> Value {
        let raw = self.sent.recv().await.expect("client closed");
        serde_json::from_str(&raw).expect("client sent invalid JSON")
    }

    /// Receive frames until one of the given type arrives.
    pub async fn next_frame_of_type(&mut self, kind: &str) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame["type"] == kind {
                return frame;
            }
        }
    }

    /// Push a frame to the client.
    pub async fn push_json(&self, frame: Value) {
        self.push.send(frame.to_string()).await.expect("client gone");
    }
}

/// In-memory [`SignalingTransport`]. Every `connect` yields a fresh link;
/// the matching [`ServerEnd`] is queued for the test to take.
pub struct MemoryTransport {
    server_ends_tx: mpsc::UnboundedSender<ServerEnd>,
    server_ends_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerEnd>>,
    failing_urls: Mutex<Vec<String>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create a transport with no scripted failures.
    pub fn new() -> Self {
        let (server_ends_tx, server_ends_rx) = mpsc::unbounded_channel();
        Self {
            server_ends_tx,
            server_ends_rx: tokio::sync::Mutex::new(server_ends_rx),
            failing_urls: Mutex::new(Vec::new()),
        }
    }

    /// Make future connects to `url` fail.
    pub fn fail_url(&self, url: &str) {
        self.failing_urls.lock().push(url.to_string());
    }

    /// Take the server end of the next link that was opened.
    pub async fn take_server_end(&self) -> ServerEnd {
        self.server_ends_rx
            .lock()
            .await
            .recv()
            .await
            .expect("no link was opened")
    }
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    async fn connect(&self, url: &str) -> Result<TransportLink> {
        if self.failing_urls.lock().iter().any(|u| u == url) {
            return Err(Error::ConnectionFailed(format!("unreachable: {}", url)));
        }
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let _ = self.server_ends_tx.send(ServerEnd {
            url: url.to_string(),
            sent: out_rx,
            push: in_tx,
        });
        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// ============================================================================
// CRYPTO
// ============================================================================

/// Deterministic [`CryptoService`] double. Sessions derive from the sorted
/// key pair so both sides of a pair agree on the secret, and ciphertexts
/// are reversible tagged concatenations.
pub struct FakeCrypto {
    my_public: Vec<u8>,
    peer_keys: Mutex<HashMap<String, Vec<u8>>>,
    sessions: Mutex<HashMap<String, Vec<u8>>>,
    ephemeral_counter: AtomicU64,
}

impl FakeCrypto {
    /// A service whose long-term public key is `my_public`.
    pub fn new(my_public: &[u8]) -> Self {
        Self {
            my_public: my_public.to_vec(),
            peer_keys: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            ephemeral_counter: AtomicU64::new(0),
        }
    }

    /// Install a session secret directly (for rendezvous-token tests).
    pub fn set_session(&self, peer_id: &str, secret: &[u8]) {
        self.sessions
            .lock()
            .insert(peer_id.to_string(), secret.to_vec());
    }

    fn shared_secret(&self, their_public: &[u8]) -> Vec<u8> {
        let (min, max) = if self.my_public.as_slice() <= their_public {
            (self.my_public.as_slice(), their_public)
        } else {
            (their_public, self.my_public.as_slice())
        };
        let mut secret = b"ss:".to_vec();
        secret.extend_from_slice(min);
        secret.push(b'|');
        secret.extend_from_slice(max);
        secret
    }

    fn seal(key: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let mut out = b"ct:".to_vec();
        out.extend_from_slice(&BASE64.encode(key).into_bytes());
        out.push(b':');
        out.extend_from_slice(plaintext);
        out
    }

    fn open(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut expected = b"ct:".to_vec();
        expected.extend_from_slice(&BASE64.encode(key).into_bytes());
        expected.push(b':');
        if ciphertext.starts_with(&expected) {
            Ok(ciphertext[expected.len()..].to_vec())
        } else {
            Err(Error::Crypto("wrong key".into()))
        }
    }
}

#[async_trait]
impl CryptoService for FakeCrypto {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn public_key_base64(&self) -> Result<String> {
        Ok(BASE64.encode(&self.my_public))
    }

    async fn public_key_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.my_public.clone())
    }

    async fn session_key_bytes(&self, peer_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.sessions.lock().get(peer_id).cloned())
    }

    async fn set_peer_public_key(&self, peer_id: &str, public_key: &[u8]) -> Result<()> {
        self.peer_keys
            .lock()
            .insert(peer_id.to_string(), public_key.to_vec());
        Ok(())
    }

    async fn get_peer_public_key(&self, peer_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.peer_keys.lock().get(peer_id).cloned())
    }

    async fn establish_session(&self, peer_id: &str, their_public: &[u8]) -> Result<()> {
        let secret = self.shared_secret(their_public);
        self.peer_keys
            .lock()
            .insert(peer_id.to_string(), their_public.to_vec());
        self.sessions.lock().insert(peer_id.to_string(), secret);
        Ok(())
    }

    async fn encrypt_for_peer(&self, peer_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sessions = self.sessions.lock();
        let key = sessions
            .get(peer_id)
            .ok_or_else(|| Error::Crypto(format!("no session with {}", peer_id)))?;
        Ok(Self::seal(key, plaintext))
    }

    async fn decrypt_from_peer(&self, peer_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let key = {
            let sessions = self.sessions.lock();
            sessions
                .get(peer_id)
                .ok_or_else(|| Error::Crypto(format!("no session with {}", peer_id)))?
                .clone()
        };
        Self::open(&key, ciphertext)
    }

    async fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(Self::seal(key, plaintext))
    }

    async fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        Self::open(key, ciphertext)
    }

    async fn generate_ephemeral_key_pair(&self) -> Result<EphemeralKeyPair> {
        let n = self.ephemeral_counter.fetch_add(1, Ordering::SeqCst);
        Ok(EphemeralKeyPair {
            public: format!("ephemeral-public-{}", n).into_bytes(),
            secret_handle: format!("ephemeral-secret-{}", n),
        })
    }
}

// ============================================================================
// STORAGE
// ============================================================================

/// Map-backed [`TrustedPeerStore`], keyed by code.
pub struct MemoryTrustStore {
    records: Mutex<HashMap<String, TrustedPeer>>,
}

impl Default for MemoryTrustStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTrustStore {
    /// An empty store.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TrustedPeerStore for MemoryTrustStore {
    async fn get_all(&self) -> Result<Vec<TrustedPeer>> {
        let mut all: Vec<TrustedPeer> = self.records.lock().values().cloned().collect();
        all.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(all)
    }

    async fn get_by_public_key(&self, public_key: &str) -> Result<Option<TrustedPeer>> {
        Ok(self
            .records
            .lock()
            .values()
            .find(|r| r.public_key == public_key)
            .cloned())
    }

    async fn is_trusted_by_public_key(&self, public_key: &str) -> Result<bool> {
        Ok(self
            .records
            .lock()
            .values()
            .any(|r| r.public_key == public_key && !r.blocked))
    }

    async fn save(&self, record: &TrustedPeer) -> Result<()> {
        self.records
            .lock()
            .insert(record.code.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, code: &str) -> Result<()> {
        self.records.lock().remove(code);
        Ok(())
    }

    async fn get_public_key_bytes(&self, code: &str) -> Result<Option<Vec<u8>>> {
        match self.records.lock().get(code) {
            Some(record) => BASE64
                .decode(&record.public_key)
                .map(Some)
                .map_err(|e| Error::Storage(format!("stored key not Base64: {}", e))),
            None => Ok(None),
        }
    }
}

/// Map-backed [`MessageStore`].
pub struct MemoryMessageStore {
    history: Mutex<HashMap<String, Vec<(String, bool)>>>,
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMessageStore {
    /// An empty store.
    pub fn new() -> Self {
        Self {
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Message count for a peer.
    pub async fn count_for(&self, peer_id: &str) -> u64 {
        self.history
            .lock()
            .get(peer_id)
            .map(|v| v.len() as u64)
            .unwrap_or(0)
    }

    /// System-message count for a peer.
    pub async fn system_count_for(&self, peer_id: &str) -> u64 {
        self.history
            .lock()
            .get(peer_id)
            .map(|v| v.iter().filter(|(_, system)| *system).count() as u64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn migrate(&self, old_id: &str, new_id: &str) -> Result<u64> {
        let mut history = self.history.lock();
        match history.remove(old_id) {
            Some(rows) => {
                let count = rows.len() as u64;
                history.entry(new_id.to_string()).or_default().extend(rows);
                Ok(count)
            }
            None => Ok(0),
        }
    }

    async fn save(&self, peer_id: &str, body: &str, system: bool) -> Result<()> {
        self.history
            .lock()
            .entry(peer_id.to_string())
            .or_default()
            .push((body.to_string(), system));
        Ok(())
    }
}

/// Map-backed [`SecureStore`].
pub struct MemorySecureStore {
    values: Mutex<HashMap<String, String>>,
}

impl Default for MemorySecureStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySecureStore {
    /// An empty store.
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SecureStore for MemorySecureStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .values
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// ============================================================================
// WEBRTC
// ============================================================================

/// Recording [`WebRtcEngine`] double. Calls are captured for assertions
/// and tests feed events in through [`FakeWebRtc::emit`].
pub struct FakeWebRtc {
    event_tx: broadcast::Sender<WebRtcEvent>,
    signal_tx: broadcast::Sender<OutboundSignal>,
    /// Peers offers were created for
    pub offers_created: Mutex<Vec<String>>,
    /// Remote offers applied
    pub offers_handled: Mutex<Vec<(String, Value)>>,
    /// Remote answers applied
    pub answers_handled: Mutex<Vec<(String, Value)>>,
    /// Remote ICE candidates applied
    pub ice_added: Mutex<Vec<(String, Value)>>,
    /// Messages sent over data channels
    pub messages_sent: Mutex<Vec<(String, String)>>,
    /// Files sent over data channels
    pub files_sent: Mutex<Vec<(String, String)>>,
    /// Relay chunks ingested
    pub chunks_ingested: Mutex<Vec<Value>>,
    /// Peers closed
    pub peers_closed: Mutex<Vec<String>>,
    offer_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl Default for FakeWebRtc {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeWebRtc {
    /// A fresh recording engine.
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let (signal_tx, _) = broadcast::channel(64);
        Self {
            event_tx,
            signal_tx,
            offers_created: Mutex::new(Vec::new()),
            offers_handled: Mutex::new(Vec::new()),
            answers_handled: Mutex::new(Vec::new()),
            ice_added: Mutex::new(Vec::new()),
            messages_sent: Mutex::new(Vec::new()),
            files_sent: Mutex::new(Vec::new()),
            chunks_ingested: Mutex::new(Vec::new()),
            peers_closed: Mutex::new(Vec::new()),
            offer_gate: Mutex::new(None),
        }
    }

    /// Emit an engine event to subscribers.
    pub fn emit(&self, event: WebRtcEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Emit an outbound signaling message to subscribers.
    pub fn emit_signal(&self, peer_id: &str, message: Value) {
        let _ = self.signal_tx.send(OutboundSignal {
            peer_id: peer_id.to_string(),
            message,
        });
    }

    /// Make `create_offer` block until released. Returns
    /// `(entered, release)`: `entered` is notified when a caller reaches
    /// the gate, `release` lets it proceed.
    pub fn gate_offers(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.offer_gate.lock() = Some((entered.clone(), release.clone()));
        (entered, release)
    }
}

#[async_trait]
impl WebRtcEngine for FakeWebRtc {
    async fn create_offer(&self, peer_id: &str) -> Result<Value> {
        self.offers_created.lock().push(peer_id.to_string());
        let gate = self.offer_gate.lock().clone();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
        Ok(json!({"type": "offer", "sdp": format!("offer-sdp-{}", peer_id)}))
    }

    async fn handle_offer(&self, peer_id: &str, offer: Value) -> Result<Value> {
        self.offers_handled
            .lock()
            .push((peer_id.to_string(), offer));
        Ok(json!({"type": "answer", "sdp": format!("answer-sdp-{}", peer_id)}))
    }

    async fn handle_answer(&self, peer_id: &str, answer: Value) -> Result<()> {
        self.answers_handled
            .lock()
            .push((peer_id.to_string(), answer));
        Ok(())
    }

    async fn add_ice_candidate(&self, peer_id: &str, candidate: Value) -> Result<()> {
        self.ice_added.lock().push((peer_id.to_string(), candidate));
        Ok(())
    }

    async fn send_message(&self, peer_id: &str, plaintext: &str) -> Result<()> {
        self.messages_sent
            .lock()
            .push((peer_id.to_string(), plaintext.to_string()));
        Ok(())
    }

    async fn send_file(&self, peer_id: &str, name: &str, _bytes: Vec<u8>) -> Result<()> {
        self.files_sent
            .lock()
            .push((peer_id.to_string(), name.to_string()));
        Ok(())
    }

    async fn ingest_relay_chunk(&self, raw: Value) -> Result<()> {
        self.chunks_ingested.lock().push(raw);
        Ok(())
    }

    async fn close_peer(&self, peer_id: &str) {
        self.peers_closed.lock().push(peer_id.to_string());
    }

    fn subscribe_events(&self) -> broadcast::Receiver<WebRtcEvent> {
        self.event_tx.subscribe()
    }

    fn subscribe_signaling(&self) -> broadcast::Receiver<OutboundSignal> {
        self.signal_tx.subscribe()
    }
}
