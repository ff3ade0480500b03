//! # Connection Orchestrator
//!
//! The top-level composition that wires signaling events to the WebRTC
//! engine, the pairing controller, the rendezvous coordinator, and the
//! linked-device proxy.
//!
//! ## Ownership
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      CONNECTION ENGINE                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  owns: peer table, signaling state enum, every broadcast stream,       │
//! │        the federated-redirect map, and the subscriptions to the        │
//! │        signaling, WebRTC-event, and rendezvous streams                 │
//! │                                                                         │
//! │  inbound bytes ─► dispatcher ─► sealed event ─► this engine            │
//! │        ─► (pairing | rendezvous | webrtc) ─► peer transitions          │
//! │        ─► observer notifications                                       │
//! │                                                                         │
//! │  outbound: typed send ─► dispatcher ─► bytes                           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! Single-subscription dispatch: inbound signaling frames are handled in
//! receipt order and each handler runs to its next suspension point before
//! the following frame is taken. Handlers follow the capture rule — bind
//! the `Connected` interior before the first await, re-check after every
//! await. `disconnect` and `dispose` are idempotent and cancel
//! subscriptions in the order redirects → rendezvous → WebRTC events →
//! signaling before disposing the dispatcher.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::codes;
use crate::contracts::{
    CryptoService, MessageStore, SecureStore, SignalingTransport, TrustedPeerStore, WebRtcEngine,
    WebRtcEvent,
};
use crate::error::{Error, Result};
use crate::link::{LinkManager, PendingLinkRequest};
use crate::pairing::{PairRequestEvent, PairingController};
use crate::peers::{Peer, PeerConnectionState, PeerRegistry};
use crate::rendezvous::RendezvousCoordinator;
use crate::signaling::{CallEvent, ClientFrame, SignalingClient, SignalingEvent, SignalingState};
use crate::trust::{IdentityReconciler, KeyRotationEvent, TrustedPeer};

/// Capacity shared by the engine's broadcast streams. Producers never
/// block; lagging subscribers drop.
const STREAM_CAPACITY: usize = 256;

/// Engine configuration. A constructor argument, never global state.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Auto-accept every pair request (end-to-end test rigs only)
    pub is_e2e_test: bool,
    /// Signaling heartbeat period
    pub heartbeat_interval: Duration,
    /// Link-session lifetime
    pub link_session_ttl: Duration,
    /// Delay before the rendezvous registration is re-sent
    pub rendezvous_reregister_delay: Duration,
    /// Namespace for secure key-value entries
    pub storage_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            is_e2e_test: false,
            heartbeat_interval: Duration::from_secs(30),
            link_session_ttl: Duration::from_secs(5 * 60),
            rendezvous_reregister_delay: Duration::from_secs(5),
            storage_prefix: "zajel".to_string(),
        }
    }
}

/// Connection state surfaced to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No signaling link
    Disconnected,
    /// Opening the signaling link
    Connecting,
    /// Registered with a signaling server
    Connected {
        /// The pairing code this node registered under
        pairing_code: String,
    },
}

/// A file transfer began.
#[derive(Debug, Clone)]
pub struct FileStart {
    /// Sending peer
    pub peer_id: String,
    /// Transfer id
    pub file_id: String,
    /// Original file name
    pub name: String,
    /// Total size in bytes
    pub total_size: u64,
    /// Number of chunks to expect
    pub total_chunks: u32,
}

/// A file chunk arrived.
#[derive(Debug, Clone)]
pub struct FileChunk {
    /// Sending peer
    pub peer_id: String,
    /// Transfer id
    pub file_id: String,
    /// Chunk payload
    pub data: Vec<u8>,
    /// Chunk index
    pub index: u32,
    /// Number of chunks in the transfer
    pub total: u32,
}

/// A file transfer finished.
#[derive(Debug, Clone)]
pub struct FileComplete {
    /// Sending peer
    pub peer_id: String,
    /// Transfer id
    pub file_id: String,
}

/// The connection orchestrator.
pub struct ConnectionEngine {
    me: Weak<ConnectionEngine>,
    config: EngineConfig,
    transport: Arc<dyn SignalingTransport>,
    webrtc: Arc<dyn WebRtcEngine>,
    crypto: Arc<dyn CryptoService>,
    trust: Arc<dyn TrustedPeerStore>,
    message_store: Arc<dyn MessageStore>,
    registry: Arc<PeerRegistry>,
    signaling: Arc<RwLock<SignalingState>>,
    pairing: Arc<PairingController>,
    rendezvous: Arc<RendezvousCoordinator>,
    link: Arc<LinkManager>,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
    message_tx: broadcast::Sender<(String, String)>,
    file_start_tx: broadcast::Sender<FileStart>,
    file_chunk_tx: broadcast::Sender<FileChunk>,
    file_complete_tx: broadcast::Sender<FileComplete>,
    pair_request_tx: broadcast::Sender<PairRequestEvent>,
    link_request_tx: broadcast::Sender<PendingLinkRequest>,
    connection_tx: broadcast::Sender<ConnectionState>,
    rotation_tx: broadcast::Sender<KeyRotationEvent>,
    call_tx: broadcast::Sender<CallEvent>,
}

impl ConnectionEngine {
    /// Compose the engine from its collaborators.
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn SignalingTransport>,
        webrtc: Arc<dyn WebRtcEngine>,
        crypto: Arc<dyn CryptoService>,
        trust: Arc<dyn TrustedPeerStore>,
        message_store: Arc<dyn MessageStore>,
        secure: Arc<dyn SecureStore>,
    ) -> Arc<Self> {
        let registry = Arc::new(PeerRegistry::new());
        let signaling = Arc::new(RwLock::new(SignalingState::Disconnected));

        let (message_tx, _) = broadcast::channel(STREAM_CAPACITY);
        let (file_start_tx, _) = broadcast::channel(STREAM_CAPACITY);
        let (file_chunk_tx, _) = broadcast::channel(STREAM_CAPACITY);
        let (file_complete_tx, _) = broadcast::channel(STREAM_CAPACITY);
        let (pair_request_tx, _) = broadcast::channel(STREAM_CAPACITY);
        let (link_request_tx, _) = broadcast::channel(STREAM_CAPACITY);
        let (connection_tx, _) = broadcast::channel(STREAM_CAPACITY);
        let (rotation_tx, _) = broadcast::channel(STREAM_CAPACITY);
        let (call_tx, _) = broadcast::channel(STREAM_CAPACITY);

        let reconciler = Arc::new(IdentityReconciler::new(
            trust.clone(),
            message_store.clone(),
            crypto.clone(),
            registry.clone(),
            rotation_tx.clone(),
        ));
        let pairing = Arc::new(PairingController::new(
            signaling.clone(),
            registry.clone(),
            webrtc.clone(),
            crypto.clone(),
            trust.clone(),
            reconciler,
            pair_request_tx.clone(),
            config.is_e2e_test,
        ));
        let rendezvous = RendezvousCoordinator::new(
            signaling.clone(),
            transport.clone(),
            trust.clone(),
            crypto.clone(),
            message_store.clone(),
            registry.clone(),
            pairing.clone(),
            message_tx.clone(),
            config.rendezvous_reregister_delay,
            config.heartbeat_interval,
        );
        let link = LinkManager::new(
            crypto.clone(),
            webrtc.clone(),
            secure,
            config.storage_prefix.clone(),
            config.link_session_ttl,
        );

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            transport,
            webrtc,
            crypto,
            trust,
            message_store,
            registry,
            signaling,
            pairing,
            rendezvous,
            link,
            subscriptions: Mutex::new(Vec::new()),
            message_tx,
            file_start_tx,
            file_chunk_tx,
            file_complete_tx,
            pair_request_tx,
            link_request_tx,
            connection_tx,
            rotation_tx,
            call_tx,
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Prime the crypto service, seed the peer table from trusted storage,
    /// and load persisted linked devices.
    pub async fn initialize(&self) -> Result<()> {
        self.crypto.initialize().await?;

        match self.trust.get_all().await {
            Ok(records) => {
                for record in records.into_iter().filter(|r| !r.blocked) {
                    self.registry.insert(Peer {
                        code: record.code.clone(),
                        display_name: record.display_name,
                        alias: record.alias,
                        public_key: Some(record.public_key),
                        state: PeerConnectionState::Disconnected,
                        last_seen: Some(record.last_seen),
                        is_local: false,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to seed peer table from trusted storage");
            }
        }

        self.link.load_devices().await;
        tracing::info!(peers = self.registry.len(), "engine initialized");
        Ok(())
    }

    /// Open a signaling link, register, and start dispatching. Generates a
    /// fresh code unless one is supplied. Safe to call repeatedly; a prior
    /// connection and its subscriptions are torn down first.
    pub async fn connect(
        &self,
        server_url: &str,
        pairing_code: Option<&str>,
    ) -> Result<String> {
        let code = match pairing_code {
            Some(code) => {
                let code = codes::normalize(code);
                if !codes::validate(&code) {
                    return Err(Error::InvalidPairingCode(code));
                }
                code
            }
            None => codes::generate(),
        };

        self.teardown_connection().await;
        let _ = self.connection_tx.send(ConnectionState::Connecting);

        let public_key = match self.crypto.public_key_base64().await {
            Ok(key) => key,
            Err(e) => {
                let _ = self.connection_tx.send(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let client = match SignalingClient::connect(
            self.transport.as_ref(),
            server_url,
            &code,
            &public_key,
            self.config.heartbeat_interval,
        )
        .await
        {
            Ok(client) => client,
            Err(e) => {
                let _ = self.connection_tx.send(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        *self.signaling.write() = SignalingState::Connected {
            client: client.clone(),
            my_pairing_code: code.clone(),
        };

        // one subscription each: signaling events, WebRTC events, WebRTC
        // outbound signaling, plus the connected watch. Subscriptions are
        // taken here so no event emitted after this point can be missed.
        let signaling_events = client.subscribe();
        let webrtc_events = self.webrtc.subscribe_events();
        let webrtc_signals = self.webrtc.subscribe_signaling();
        let connected_rx = client.subscribe_connected();
        let mut tasks = Vec::with_capacity(5);
        tasks.push(tokio::spawn(signaling_loop(self.me.clone(), signaling_events)));
        tasks.push(tokio::spawn(webrtc_event_loop(self.me.clone(), webrtc_events)));
        tasks.push(tokio::spawn(webrtc_signal_loop(
            self.me.clone(),
            webrtc_signals,
        )));
        tasks.push(tokio::spawn(connected_watch(
            self.me.clone(),
            client.clone(),
            connected_rx,
        )));

        // kick trusted-peer rediscovery
        let rendezvous = self.rendezvous.clone();
        tasks.push(tokio::spawn(async move {
            rendezvous.reconnect_all_trusted().await;
        }));
        self.subscriptions.lock().extend(tasks);

        let _ = self.connection_tx.send(ConnectionState::Connected {
            pairing_code: code.clone(),
        });
        tracing::info!(%server_url, %code, "connected to signaling");
        Ok(code)
    }

    /// Tear the connection down: redirects, rendezvous, WebRTC-event and
    /// signaling subscriptions, then the dispatcher. Idempotent.
    pub async fn disconnect(&self) {
        if self.teardown_connection().await {
            let _ = self.connection_tx.send(ConnectionState::Disconnected);
        }
    }

    /// Full shutdown, link sessions included.
    pub async fn dispose(&self) {
        self.disconnect().await;
        self.link.shutdown();
        tracing::info!("engine disposed");
    }

    /// Returns true when a live connection was actually torn down.
    async fn teardown_connection(&self) -> bool {
        self.rendezvous.shutdown().await;
        let tasks: Vec<JoinHandle<()>> = self.subscriptions.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        let prior = {
            let mut guard = self.signaling.write();
            std::mem::replace(&mut *guard, SignalingState::Disconnected)
        };
        match prior {
            SignalingState::Connected { client, .. } => {
                client.close().await;
                self.registry.mark_all_disconnected();
                true
            }
            SignalingState::Disconnected => false,
        }
    }

    // ========================================================================
    // Peer operations
    // ========================================================================

    /// Start pairing with the peer registered at `code` (initiator side).
    pub async fn connect_to_peer(&self, code: &str, proposed_name: Option<String>) -> Result<()> {
        self.pairing.connect_to_peer(code, proposed_name).await
    }

    /// UI verdict on an incoming pair request.
    pub async fn respond_to_pair_request(&self, code: &str, accept: bool) -> Result<()> {
        self.pairing.respond_to_pair_request(code, accept).await
    }

    /// UI verdict on an incoming link request.
    pub async fn respond_to_link_request(
        &self,
        code: &str,
        accept: bool,
        device_id: Option<String>,
    ) -> Result<()> {
        let captured = self.signaling.read().captured();
        let Some((client, _my_code)) = captured else {
            return Err(Error::NotConnected);
        };

        if !accept {
            self.link.reject_pending();
            return client
                .send(&ClientFrame::LinkResponse {
                    link_code: code.to_string(),
                    accepted: false,
                    device_id: None,
                })
                .await;
        }

        let device_id = self.link.admit_pending(device_id).await?;
        if !client.is_connected() {
            return Err(Error::NotConnected);
        }
        client
            .send(&ClientFrame::LinkResponse {
                link_code: code.to_string(),
                accepted: true,
                device_id: Some(device_id),
            })
            .await
    }

    /// Create a link session for a second device.
    pub async fn create_link_session(&self, server_url: &str) -> Result<crate::link::LinkSession> {
        self.link.create_link_session(server_url).await
    }

    /// Send an application message to a connected peer.
    pub async fn send_message(&self, peer_id: &str, plaintext: &str) -> Result<()> {
        if !self.registry.contains(peer_id) {
            return Err(Error::PeerNotFound(peer_id.to_string()));
        }
        self.webrtc.send_message(peer_id, plaintext).await?;
        if let Err(e) = self.message_store.save(peer_id, plaintext, false).await {
            tracing::warn!(error = %e, "failed to persist outbound message");
        }
        Ok(())
    }

    /// Send a file to a connected peer.
    pub async fn send_file(&self, peer_id: &str, name: &str, bytes: Vec<u8>) -> Result<()> {
        if !self.registry.contains(peer_id) {
            return Err(Error::PeerNotFound(peer_id.to_string()));
        }
        self.webrtc.send_file(peer_id, name, bytes).await
    }

    /// Close a peer's transport and mark it disconnected.
    pub async fn disconnect_peer(&self, peer_id: &str) {
        self.webrtc.close_peer(peer_id).await;
        self.registry
            .set_state(peer_id, PeerConnectionState::Disconnected);
    }

    /// Abort an in-progress connection attempt.
    pub async fn cancel_connection(&self, peer_id: &str) {
        self.disconnect_peer(peer_id).await;
    }

    /// Set a peer's alias in the table and, when trusted, in storage.
    pub async fn set_peer_alias(&self, code: &str, alias: Option<String>) -> Result<()> {
        if !self.registry.set_alias(code, alias.clone()) {
            return Err(Error::PeerNotFound(code.to_string()));
        }
        if let Some(peer) = self.registry.get(code) {
            if let Some(public_key) = peer.public_key {
                if let Ok(Some(mut record)) = self.trust.get_by_public_key(&public_key).await {
                    record.alias = alias;
                    if let Err(e) = self.trust.save(&record).await {
                        tracing::warn!(error = %e, "failed to persist alias");
                    }
                }
            }
        }
        Ok(())
    }

    /// Block a peer by public key; it disappears from rendezvous bundles
    /// and its pair requests are silently rejected.
    pub async fn block_peer(&self, public_key: &str) -> Result<()> {
        match self.trust.get_by_public_key(public_key).await? {
            Some(mut record) => {
                record.blocked = true;
                self.trust.save(&record).await
            }
            None => Err(Error::PeerNotFound(public_key.to_string())),
        }
    }

    /// Lift a block.
    pub async fn unblock_peer(&self, public_key: &str) -> Result<()> {
        match self.trust.get_by_public_key(public_key).await? {
            Some(mut record) => {
                record.blocked = false;
                self.trust.save(&record).await
            }
            None => Err(Error::PeerNotFound(public_key.to_string())),
        }
    }

    // ========================================================================
    // Observable streams
    // ========================================================================

    /// Peer-list snapshots, one per mutation.
    pub fn subscribe_peers(&self) -> broadcast::Receiver<Vec<Peer>> {
        self.registry.subscribe()
    }

    /// Current peer list.
    pub fn peers(&self) -> Vec<Peer> {
        self.registry.snapshot()
    }

    /// Inbound plaintext messages `(peer, text)`.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<(String, String)> {
        self.message_tx.subscribe()
    }

    /// File-transfer starts.
    pub fn subscribe_file_starts(&self) -> broadcast::Receiver<FileStart> {
        self.file_start_tx.subscribe()
    }

    /// File chunks.
    pub fn subscribe_file_chunks(&self) -> broadcast::Receiver<FileChunk> {
        self.file_chunk_tx.subscribe()
    }

    /// File-transfer completions.
    pub fn subscribe_file_completes(&self) -> broadcast::Receiver<FileComplete> {
        self.file_complete_tx.subscribe()
    }

    /// Incoming pair requests awaiting a UI verdict.
    pub fn subscribe_pair_requests(&self) -> broadcast::Receiver<PairRequestEvent> {
        self.pair_request_tx.subscribe()
    }

    /// Incoming link requests awaiting a UI verdict.
    pub fn subscribe_link_requests(&self) -> broadcast::Receiver<PendingLinkRequest> {
        self.link_request_tx.subscribe()
    }

    /// Signaling connection transitions.
    pub fn subscribe_connection_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.connection_tx.subscribe()
    }

    /// Trusted-peer key rotations.
    pub fn subscribe_key_rotations(&self) -> broadcast::Receiver<KeyRotationEvent> {
        self.rotation_tx.subscribe()
    }

    /// Call-signaling passthrough.
    pub fn subscribe_call_events(&self) -> broadcast::Receiver<CallEvent> {
        self.call_tx.subscribe()
    }

    // ========================================================================
    // Event dispatch
    // ========================================================================

    async fn handle_signaling_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Offer { from, payload } => {
                self.pairing.handle_offer(&from, payload).await;
            }
            SignalingEvent::Answer { from, payload } => {
                if let Err(e) = self.webrtc.handle_answer(&from, payload).await {
                    tracing::warn!(error = %e, peer = %from, "answer handling failed");
                    self.registry.set_state(&from, PeerConnectionState::Failed);
                }
            }
            SignalingEvent::IceCandidate { from, payload } => {
                if let Err(e) = self.webrtc.add_ice_candidate(&from, payload).await {
                    tracing::warn!(error = %e, peer = %from, "ICE candidate rejected");
                }
            }
            SignalingEvent::PeerJoined { id } => {
                tracing::debug!(peer = %id, "peer joined the server");
                if self.registry.contains(&id) {
                    self.registry.touch(&id);
                }
            }
            SignalingEvent::PeerLeft { id } => {
                if self.registry.contains(&id) {
                    self.registry
                        .set_state(&id, PeerConnectionState::Disconnected);
                    self.link.broadcast_peer_state(&id, "disconnected").await;
                }
            }
            SignalingEvent::PairIncoming {
                from_code,
                from_public_key,
                proposed_name,
            } => {
                self.pairing
                    .handle_pair_incoming(&from_code, &from_public_key, proposed_name)
                    .await;
            }
            SignalingEvent::PairMatched {
                peer_code,
                peer_public_key,
                is_initiator,
            } => {
                self.pairing
                    .handle_pair_matched(&peer_code, &peer_public_key, is_initiator)
                    .await;
            }
            SignalingEvent::PairRejected { peer_code } => {
                self.pairing.handle_pair_rejected(&peer_code);
            }
            SignalingEvent::PairTimeout { peer_code } => {
                self.pairing.handle_pair_timeout(&peer_code);
            }
            SignalingEvent::PairError { error } => {
                self.pairing.handle_pair_error(&error);
            }
            SignalingEvent::Error { message } => {
                tracing::warn!(%message, "server error");
            }
            SignalingEvent::LinkRequest {
                code,
                public_key,
                device_name,
            } => {
                match self.link.note_request(&code, &public_key, &device_name) {
                    Ok(pending) => {
                        let _ = self.link_request_tx.send(pending);
                    }
                    Err(e) => {
                        tracing::info!(error = %e, %code, "rejecting link request");
                        let captured = self.signaling.read().captured();
                        if let Some((client, _)) = captured {
                            let _ = client
                                .send(&ClientFrame::LinkResponse {
                                    link_code: code,
                                    accepted: false,
                                    device_id: None,
                                })
                                .await;
                        }
                    }
                }
            }
            SignalingEvent::LinkMatched {
                code,
                peer_public_key: _,
                is_initiator,
            } => {
                let channel = format!("link_{}", code);
                if let Some(device_id) = self.link.device_for_channel(&channel) {
                    self.link
                        .bind_channel(&device_id, &channel);
                }
                if !is_initiator {
                    return;
                }
                let captured = self.signaling.read().captured();
                let Some((client, _my_code)) = captured else {
                    return;
                };
                let offer = match self.webrtc.create_offer(&channel).await {
                    Ok(offer) => offer,
                    Err(e) => {
                        tracing::warn!(error = %e, %channel, "link offer creation failed");
                        return;
                    }
                };
                if !client.is_connected() {
                    return;
                }
                if let Err(e) = client
                    .send(&ClientFrame::Offer {
                        target: code,
                        payload: offer,
                    })
                    .await
                {
                    tracing::warn!(error = %e, "link offer send failed");
                }
            }
            SignalingEvent::LinkRejected { code } | SignalingEvent::LinkTimeout { code } => {
                tracing::info!(%code, "link attempt ended without admission");
                self.link.reject_pending();
            }
            SignalingEvent::Call(call) => {
                let _ = self.call_tx.send(call);
            }
            SignalingEvent::Rendezvous(event) => {
                self.rendezvous.handle_event(event).await;
            }
            SignalingEvent::ChunkMessage { raw } => {
                if let Err(e) = self.webrtc.ingest_relay_chunk(raw).await {
                    tracing::warn!(error = %e, "relay chunk rejected");
                }
            }
        }
    }

    async fn handle_webrtc_event(&self, event: WebRtcEvent) {
        match event {
            WebRtcEvent::ChannelOpen { peer_id } => {
                if peer_id.starts_with("link_") {
                    return;
                }
                self.registry
                    .set_state(&peer_id, PeerConnectionState::Handshaking);
            }
            WebRtcEvent::HandshakeComplete { peer_id } => {
                if let Some(device_id) = self.link.device_for_channel(&peer_id) {
                    self.link.bind_channel(&device_id, &peer_id);
                    return;
                }
                self.registry
                    .set_state(&peer_id, PeerConnectionState::Connected);
                self.persist_trusted(&peer_id).await;
                self.link.broadcast_peer_state(&peer_id, "connected").await;
            }
            WebRtcEvent::MessageReceived { peer_id, plaintext } => {
                if let Some(device_id) = self.link.device_for_channel(&peer_id) {
                    // browser tunnel frame, not an application message
                    match serde_json::from_str::<serde_json::Value>(&plaintext) {
                        Ok(frame) => self.link.handle_device_frame(&device_id, &frame).await,
                        Err(e) => {
                            tracing::warn!(error = %e, %device_id, "malformed tunnel frame");
                        }
                    }
                    return;
                }
                self.registry.touch(&peer_id);
                if let Err(e) = self.message_store.save(&peer_id, &plaintext, false).await {
                    tracing::warn!(error = %e, "failed to persist inbound message");
                }
                self.link.forward_to_devices(&peer_id, &plaintext).await;
                let _ = self.message_tx.send((peer_id, plaintext));
            }
            WebRtcEvent::FileStart {
                peer_id,
                file_id,
                name,
                total_size,
                total_chunks,
            } => {
                let _ = self.file_start_tx.send(FileStart {
                    peer_id,
                    file_id,
                    name,
                    total_size,
                    total_chunks,
                });
            }
            WebRtcEvent::FileChunk {
                peer_id,
                file_id,
                data,
                index,
                total,
            } => {
                let _ = self.file_chunk_tx.send(FileChunk {
                    peer_id,
                    file_id,
                    data,
                    index,
                    total,
                });
            }
            WebRtcEvent::FileComplete { peer_id, file_id } => {
                let _ = self.file_complete_tx.send(FileComplete { peer_id, file_id });
            }
            WebRtcEvent::PeerClosed { peer_id } => {
                if let Some(device_id) = self.link.device_for_channel(&peer_id) {
                    self.link
                        .set_device_state(&device_id, crate::link::LinkDeviceState::Disconnected);
                    return;
                }
                self.registry
                    .set_state(&peer_id, PeerConnectionState::Disconnected);
                self.link
                    .broadcast_peer_state(&peer_id, "disconnected")
                    .await;
            }
        }
    }

    /// First entry into `Connected` persists the peer as trusted when its
    /// public key is known.
    async fn persist_trusted(&self, code: &str) {
        let Some(peer) = self.registry.get(code) else {
            return;
        };
        let Some(public_key) = peer.public_key else {
            return;
        };
        match self.trust.get_by_public_key(&public_key).await {
            Ok(Some(mut record)) => {
                record.code = code.to_string();
                record.last_seen = crate::time::now_timestamp();
                if let Err(e) = self.trust.save(&record).await {
                    tracing::warn!(error = %e, "failed to refresh trusted record");
                }
            }
            Ok(None) => {
                let mut record = TrustedPeer::new(&public_key, code, &peer.display_name);
                record.alias = peer.alias;
                if let Err(e) = self.trust.save(&record).await {
                    tracing::warn!(error = %e, "failed to persist trusted peer");
                }
                tracing::info!(%code, "peer persisted as trusted");
            }
            Err(e) => {
                tracing::warn!(error = %e, "trusted lookup failed on connect");
            }
        }
    }
}

// ============================================================================
// Subscription loops
// ============================================================================

/// Single-subscription signaling dispatch: frames are handled in receipt
/// order and each handler runs before the next frame is taken.
async fn signaling_loop(
    engine: Weak<ConnectionEngine>,
    mut events: broadcast::Receiver<SignalingEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(engine) = engine.upgrade() else { break };
                engine.handle_signaling_event(event).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "signaling subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn webrtc_event_loop(
    engine: Weak<ConnectionEngine>,
    mut events: broadcast::Receiver<WebRtcEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(engine) = engine.upgrade() else { break };
                engine.handle_webrtc_event(event).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "webrtc subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Forward the transport engine's outbound signaling. Only ICE candidates
/// go to the server; offers and answers travel through the pairing flow.
async fn webrtc_signal_loop(
    engine: Weak<ConnectionEngine>,
    mut signals: broadcast::Receiver<crate::contracts::OutboundSignal>,
) {
    loop {
        let signal = match signals.recv().await {
            Ok(signal) => signal,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "webrtc signal subscriber lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let kind = signal
            .message
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("");
        if kind != "ice_candidate" {
            continue;
        }
        let Some(engine) = engine.upgrade() else { break };
        let captured = engine.signaling.read().captured();
        let Some((client, _my_code)) = captured else {
            continue;
        };
        if let Err(e) = client
            .send(&ClientFrame::IceCandidate {
                target: signal.peer_id.clone(),
                payload: signal.message,
            })
            .await
        {
            tracing::warn!(error = %e, peer = %signal.peer_id, "ICE forward failed");
        }
    }
}

/// Observe the dispatcher's connected flag; on transport loss, converge
/// the engine to `Disconnected`.
async fn connected_watch(
    engine: Weak<ConnectionEngine>,
    client: Arc<SignalingClient>,
    mut connected: tokio::sync::watch::Receiver<bool>,
) {
    while *connected.borrow() {
        if connected.changed().await.is_err() {
            break;
        }
    }
    let Some(engine) = engine.upgrade() else {
        return;
    };
    // only react if this client is still the current one
    let is_current = match &*engine.signaling.read() {
        SignalingState::Connected { client: current, .. } => Arc::ptr_eq(current, &client),
        SignalingState::Disconnected => false,
    };
    if !is_current {
        return;
    }
    tracing::warn!("signaling transport lost");
    *engine.signaling.write() = SignalingState::Disconnected;
    engine.registry.mark_all_disconnected();
    let _ = engine.connection_tx.send(ConnectionState::Disconnected);
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::testing::{
        FakeCrypto, FakeWebRtc, MemoryMessageStore, MemorySecureStore, MemoryTransport,
        MemoryTrustStore, ServerEnd,
    };
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde_json::json;

    struct Node {
        engine: Arc<ConnectionEngine>,
        transport: Arc<MemoryTransport>,
        webrtc: Arc<FakeWebRtc>,
        crypto: Arc<FakeCrypto>,
        trust: Arc<MemoryTrustStore>,
        messages: Arc<MemoryMessageStore>,
        secure: Arc<MemorySecureStore>,
    }

    fn node_with(config: EngineConfig, public: &[u8]) -> Node {
        let transport = Arc::new(MemoryTransport::new());
        let webrtc = Arc::new(FakeWebRtc::new());
        let crypto = Arc::new(FakeCrypto::new(public));
        let trust = Arc::new(MemoryTrustStore::new());
        let messages = Arc::new(MemoryMessageStore::new());
        let secure = Arc::new(MemorySecureStore::new());
        let engine = ConnectionEngine::new(
            config,
            transport.clone(),
            webrtc.clone(),
            crypto.clone(),
            trust.clone(),
            messages.clone(),
            secure.clone(),
        );
        Node {
            engine,
            transport,
            webrtc,
            crypto,
            trust,
            messages,
            secure,
        }
    }

    fn node(public: &[u8]) -> Node {
        node_with(EngineConfig::default(), public)
    }

    async fn connected_node(public: &[u8]) -> (Node, String, ServerEnd) {
        let node = node(public);
        node.engine.initialize().await.unwrap();
        let code = node
            .engine
            .connect("wss://signal.example", None)
            .await
            .unwrap();
        let mut server = node.transport.take_server_end().await;
        let register = server.next_frame().await;
        assert_eq!(register["type"], "register");
        (node, code, server)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never held");
    }

    #[tokio::test]
    async fn test_connect_registers_and_reports_state() {
        let node = node(b"alice");
        let mut states = node.engine.subscribe_connection_state();
        let code = node
            .engine
            .connect("wss://signal.example", None)
            .await
            .unwrap();
        assert!(crate::codes::validate(&code));

        assert_eq!(states.recv().await.unwrap(), ConnectionState::Connecting);
        assert_eq!(
            states.recv().await.unwrap(),
            ConnectionState::Connected {
                pairing_code: code.clone()
            }
        );

        let mut server = node.transport.take_server_end().await;
        let register = server.next_frame().await;
        assert_eq!(register["pairingCode"], code);
        assert_eq!(
            register["publicKey"],
            BASE64.encode(b"alice")
        );
    }

    #[tokio::test]
    async fn test_connect_reuses_supplied_code_and_rejects_bad_ones() {
        let node = node(b"alice");
        let code = node
            .engine
            .connect("wss://signal.example", Some(" q7p3r8 "))
            .await
            .unwrap();
        assert_eq!(code, "Q7P3R8");

        let err = node
            .engine
            .connect("wss://signal.example", Some("bogus!"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPairingCode(_)));
    }

    #[tokio::test]
    async fn test_initialize_seeds_peer_table_from_trusted_storage() {
        let node = node(b"alice");
        node.trust
            .save(&TrustedPeer::new("cGsx", "AAAAAA", "Nadia"))
            .await
            .unwrap();
        let mut blocked = TrustedPeer::new("cGsy", "BBBBBB", "Mallory");
        blocked.blocked = true;
        node.trust.save(&blocked).await.unwrap();

        node.engine.initialize().await.unwrap();

        let peers = node.engine.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].code, "AAAAAA");
        assert_eq!(peers[0].state, PeerConnectionState::Disconnected);
        assert_eq!(peers[0].public_key.as_deref(), Some("cGsx"));
    }

    #[tokio::test]
    async fn test_connect_twice_does_not_leak_the_first_client() {
        let node = node(b"alice");
        node.engine
            .connect("wss://one.example", None)
            .await
            .unwrap();
        let first = node.transport.take_server_end().await;

        node.engine
            .connect("wss://two.example", None)
            .await
            .unwrap();
        let _second = node.transport.take_server_end().await;

        // the first link is dead: pushing to it eventually fails because
        // its read loop was torn down
        wait_for(|| {
            first
                .push
                .try_send(r#"{"type":"pong"}"#.to_string())
                .is_err()
        })
        .await;
    }

    #[tokio::test]
    async fn test_disconnect_converges_to_disconnected() {
        let (node, _code, _server) = connected_node(b"alice").await;
        node.engine.disconnect().await;

        assert!(!node.engine.signaling.read().is_connected());
        assert!(node.engine.subscriptions.lock().is_empty());
        // idempotent
        node.engine.disconnect().await;
        node.engine.dispose().await;
    }

    #[tokio::test]
    async fn test_transport_loss_marks_peers_disconnected() {
        let (node, _code, server) = connected_node(b"alice").await;
        let mut states = node.engine.subscribe_connection_state();
        node.engine.registry.insert({
            let mut p = Peer::placeholder("Q7P3R8");
            p.state = PeerConnectionState::Connected;
            p
        });

        drop(server);
        wait_for(|| !node.engine.signaling.read().is_connected()).await;
        assert_eq!(
            node.engine.peers()[0].state,
            PeerConnectionState::Disconnected
        );
        // the stream converges on Disconnected
        let mut saw_disconnect = false;
        while let Ok(state) = states.try_recv() {
            saw_disconnect = state == ConnectionState::Disconnected;
        }
        assert!(saw_disconnect);
    }

    #[tokio::test]
    async fn test_fresh_pair_end_to_end() {
        let (alice, a_code, mut a_server) = connected_node(b"alice").await;
        let (bob, b_code, mut b_server) = connected_node(b"bob").await;
        let mut bob_requests = bob.engine.subscribe_pair_requests();
        let mut bob_messages = bob.engine.subscribe_messages();

        // A initiates
        alice.engine.connect_to_peer(&b_code, None).await.unwrap();
        let request = a_server.next_frame_of_type("pair_request").await;
        assert_eq!(request["targetCode"], b_code);

        // server relays to B; B's UI sees the request and accepts
        b_server
            .push_json(json!({
                "type": "pair_incoming",
                "fromCode": a_code,
                "fromPublicKey": BASE64.encode(b"alice"),
            }))
            .await;
        let incoming = bob_requests.recv().await.unwrap();
        assert_eq!(incoming.code, a_code);
        bob.engine
            .respond_to_pair_request(&a_code, true)
            .await
            .unwrap();
        let response = b_server.next_frame_of_type("pair_response").await;
        assert_eq!(response["accepted"], true);

        // the server matches both sides
        a_server
            .push_json(json!({
                "type": "pair_matched",
                "peerCode": b_code,
                "peerPublicKey": BASE64.encode(b"bob"),
                "isInitiator": true,
            }))
            .await;
        b_server
            .push_json(json!({
                "type": "pair_matched",
                "peerCode": a_code,
                "peerPublicKey": BASE64.encode(b"alice"),
                "isInitiator": false,
            }))
            .await;

        // A's offer crosses to B, B answers back to A
        let offer = a_server.next_frame_of_type("offer").await;
        assert_eq!(offer["target"], b_code);
        b_server
            .push_json(json!({
                "type": "offer",
                "from": a_code,
                "payload": offer["payload"],
            }))
            .await;
        let answer = b_server.next_frame_of_type("answer").await;
        assert_eq!(answer["target"], a_code);
        a_server
            .push_json(json!({
                "type": "answer",
                "from": b_code,
                "payload": answer["payload"],
            }))
            .await;
        wait_for(|| !alice.webrtc.answers_handled.lock().is_empty()).await;

        // the data channels come up and the handshake completes
        alice.webrtc.emit(WebRtcEvent::ChannelOpen {
            peer_id: b_code.clone(),
        });
        alice.webrtc.emit(WebRtcEvent::HandshakeComplete {
            peer_id: b_code.clone(),
        });
        bob.webrtc.emit(WebRtcEvent::ChannelOpen {
            peer_id: a_code.clone(),
        });
        bob.webrtc.emit(WebRtcEvent::HandshakeComplete {
            peer_id: a_code.clone(),
        });

        wait_for(|| {
            alice
                .engine
                .peers()
                .iter()
                .any(|p| p.code == b_code && p.state == PeerConnectionState::Connected)
        })
        .await;
        wait_for(|| {
            bob.engine
                .peers()
                .iter()
                .any(|p| p.code == a_code && p.state == PeerConnectionState::Connected)
        })
        .await;

        // both sides persisted the other as trusted
        let bob_key = BASE64.encode(b"bob");
        for _ in 0..400 {
            if alice.trust.is_trusted_by_public_key(&bob_key).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(alice.trust.is_trusted_by_public_key(&bob_key).await.unwrap());

        // A says hello; B's stream carries it attributed to A's code
        alice.engine.send_message(&b_code, "hello").await.unwrap();
        assert!(alice
            .webrtc
            .messages_sent
            .lock()
            .contains(&(b_code.clone(), "hello".to_string())));

        bob.webrtc.emit(WebRtcEvent::MessageReceived {
            peer_id: a_code.clone(),
            plaintext: "hello".into(),
        });
        let (from, text) = bob_messages.recv().await.unwrap();
        assert_eq!(from, a_code);
        assert_eq!(text, "hello");
        assert_eq!(bob.messages.count_for(&a_code).await, 1);
    }

    #[tokio::test]
    async fn test_reconnect_match_migrates_history_to_new_code() {
        let node = node(b"bob");
        // previously trusted under OLDCDE with chat history
        node.trust
            .save(&TrustedPeer::new(&BASE64.encode(b"alice"), "OLDCDE", "Alice"))
            .await
            .unwrap();
        node.messages.save("OLDCDE", "old chat", false).await.unwrap();
        node.engine.initialize().await.unwrap();

        let _code = node
            .engine
            .connect("wss://signal.example", None)
            .await
            .unwrap();
        let mut server = node.transport.take_server_end().await;
        let _ = server.next_frame().await; // register

        // the server matched us with Alice's new code; larger side waits,
        // so we receive the responder-side match
        server
            .push_json(json!({
                "type": "pair_matched",
                "peerCode": "NEWCDE",
                "peerPublicKey": BASE64.encode(b"alice"),
                "isInitiator": false,
            }))
            .await;

        wait_for(|| {
            let peers = node.engine.peers();
            peers.iter().any(|p| p.code == "NEWCDE")
                && !peers.iter().any(|p| p.code == "OLDCDE")
        })
        .await;
        let peers = node.engine.peers();
        let migrated = peers.iter().find(|p| p.code == "NEWCDE").unwrap();
        assert_eq!(migrated.state, PeerConnectionState::Connecting);
        assert_eq!(migrated.display_name, "Alice");
        assert_eq!(node.messages.count_for("NEWCDE").await, 1);
        assert_eq!(node.messages.count_for("OLDCDE").await, 0);
    }

    #[tokio::test]
    async fn test_pair_rejection_removes_placeholder() {
        let (node, _code, mut server) = connected_node(b"alice").await;
        node.engine.connect_to_peer("Q7P3R8", None).await.unwrap();
        let _ = server.next_frame_of_type("pair_request").await;

        server
            .push_json(json!({"type": "pair_rejected", "peerCode": "Q7P3R8"}))
            .await;
        wait_for(|| !node.engine.peers().iter().any(|p| p.code == "Q7P3R8")).await;
    }

    #[tokio::test]
    async fn test_only_ice_candidates_are_forwarded_to_signaling() {
        let (node, _code, mut server) = connected_node(b"alice").await;

        node.webrtc
            .emit_signal("Q7P3R8", json!({"type": "offer", "sdp": "v=0"}));
        node.webrtc.emit_signal(
            "Q7P3R8",
            json!({"type": "ice_candidate", "candidate": "c=1"}),
        );

        let frame = server.next_frame_of_type("ice_candidate").await;
        assert_eq!(frame["target"], "Q7P3R8");
        assert_eq!(frame["payload"]["candidate"], "c=1");
        // the offer was never forwarded
        assert!(server.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_call_frames_surface_on_the_call_stream() {
        let (node, _code, server) = connected_node(b"alice").await;
        let mut calls = node.engine.subscribe_call_events();

        server
            .push_json(json!({
                "type": "call_offer",
                "from": "Q7P3R8",
                "payload": {"callId": "c1", "sdp": "v=0"},
            }))
            .await;

        let call = calls.recv().await.unwrap();
        assert_eq!(call.kind, crate::signaling::CallKind::Offer);
        assert_eq!(call.counterpart, "Q7P3R8");
        assert_eq!(call.payload["callId"], "c1");
    }

    #[tokio::test]
    async fn test_chunk_messages_reach_the_transfer_pipeline() {
        let (node, _code, server) = connected_node(b"alice").await;
        server
            .push_json(json!({"type": "chunk_message", "fileId": "f1", "index": 0}))
            .await;
        wait_for(|| !node.webrtc.chunks_ingested.lock().is_empty()).await;
        assert_eq!(node.webrtc.chunks_ingested.lock()[0]["fileId"], "f1");
    }

    #[tokio::test]
    async fn test_file_events_fan_out() {
        let (node, _code, _server) = connected_node(b"alice").await;
        let mut starts = node.engine.subscribe_file_starts();
        let mut chunks = node.engine.subscribe_file_chunks();
        let mut completes = node.engine.subscribe_file_completes();

        node.webrtc.emit(WebRtcEvent::FileStart {
            peer_id: "Q7P3R8".into(),
            file_id: "f1".into(),
            name: "photo.jpg".into(),
            total_size: 2048,
            total_chunks: 2,
        });
        node.webrtc.emit(WebRtcEvent::FileChunk {
            peer_id: "Q7P3R8".into(),
            file_id: "f1".into(),
            data: vec![1, 2, 3],
            index: 0,
            total: 2,
        });
        node.webrtc.emit(WebRtcEvent::FileComplete {
            peer_id: "Q7P3R8".into(),
            file_id: "f1".into(),
        });

        let start = starts.recv().await.unwrap();
        assert_eq!(start.name, "photo.jpg");
        assert_eq!(start.total_chunks, 2);
        let chunk = chunks.recv().await.unwrap();
        assert_eq!(chunk.data, vec![1, 2, 3]);
        let complete = completes.recv().await.unwrap();
        assert_eq!(complete.file_id, "f1");
    }

    #[tokio::test]
    async fn test_send_message_requires_known_peer() {
        let (node, _code, _server) = connected_node(b"alice").await;
        let err = node
            .engine
            .send_message("UNKNWN", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerNotFound(_)));
    }

    #[tokio::test]
    async fn test_linked_device_relay_round_trip() {
        let (node, _code, mut server) = connected_node(b"alice").await;
        let mut link_requests = node.engine.subscribe_link_requests();
        let mut messages = node.engine.subscribe_messages();

        // a peer must exist so the tunnel has something to proxy for
        node.engine.registry.insert({
            let mut p = Peer::placeholder("Q7P3R8");
            p.state = PeerConnectionState::Connected;
            p
        });

        // link a browser
        let session = node
            .engine
            .create_link_session("wss://signal.example")
            .await
            .unwrap();
        server
            .push_json(json!({
                "type": "link_request",
                "linkCode": session.code,
                "publicKey": BASE64.encode(b"device-public"),
                "deviceName": "Firefox",
            }))
            .await;
        let pending = link_requests.recv().await.unwrap();
        assert_eq!(pending.device_name, "Firefox");
        node.engine
            .respond_to_link_request(&session.code, true, None)
            .await
            .unwrap();
        let response = server.next_frame_of_type("link_response").await;
        assert_eq!(response["accepted"], true);
        let device_id = response["deviceId"].as_str().unwrap().to_string();
        let channel = format!("link_{}", session.code);

        // peer P sends "ping": the app stream gets it AND the device gets
        // an encrypted tunnel copy
        node.webrtc.emit(WebRtcEvent::MessageReceived {
            peer_id: "Q7P3R8".into(),
            plaintext: "ping".into(),
        });
        let (from, text) = messages.recv().await.unwrap();
        assert_eq!((from.as_str(), text.as_str()), ("Q7P3R8", "ping"));

        wait_for(|| {
            node.webrtc
                .messages_sent
                .lock()
                .iter()
                .any(|(to, _)| to == &channel)
        })
        .await;
        let tunnel_frame: serde_json::Value = {
            let sent = node.webrtc.messages_sent.lock();
            let (_, raw) = sent.iter().find(|(to, _)| to == &channel).unwrap();
            serde_json::from_str(raw).unwrap()
        };
        assert_eq!(tunnel_frame["type"], "message");
        assert_eq!(tunnel_frame["from"], "Q7P3R8");
        let ct = BASE64
            .decode(tunnel_frame["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(
            node.crypto.decrypt_from_peer(&device_id, &ct).await.unwrap(),
            b"ping"
        );

        // the browser replies through the tunnel; the node decrypts and
        // re-sends to P in plaintext (the engine re-encrypts per session)
        let reply_ct = node
            .crypto
            .encrypt_for_peer(&device_id, b"reply")
            .await
            .unwrap();
        node.webrtc.emit(WebRtcEvent::MessageReceived {
            peer_id: channel.clone(),
            plaintext: json!({
                "type": "send",
                "to": "Q7P3R8",
                "data": BASE64.encode(reply_ct),
            })
            .to_string(),
        });
        wait_for(|| {
            node.webrtc
                .messages_sent
                .lock()
                .contains(&("Q7P3R8".to_string(), "reply".to_string()))
        })
        .await;
        // tunnel frames never surface as application messages
        assert!(messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_link_request_for_unknown_code_is_rejected() {
        let (node, _code, mut server) = connected_node(b"alice").await;
        server
            .push_json(json!({
                "type": "link_request",
                "linkCode": "NOSUCH",
                "publicKey": BASE64.encode(b"device-public"),
                "deviceName": "Firefox",
            }))
            .await;
        let response = server.next_frame_of_type("link_response").await;
        assert_eq!(response["accepted"], false);
        assert_eq!(response["linkCode"], "NOSUCH");
    }

    #[tokio::test]
    async fn test_block_peer_flips_the_stored_flag() {
        let node = node(b"alice");
        node.trust
            .save(&TrustedPeer::new("cGsx", "AAAAAA", "Nadia"))
            .await
            .unwrap();

        node.engine.block_peer("cGsx").await.unwrap();
        assert!(node
            .trust
            .get_by_public_key("cGsx")
            .await
            .unwrap()
            .unwrap()
            .blocked);
        assert!(!node.trust.is_trusted_by_public_key("cGsx").await.unwrap());

        node.engine.unblock_peer("cGsx").await.unwrap();
        assert!(node.trust.is_trusted_by_public_key("cGsx").await.unwrap());

        let err = node.engine.block_peer("bWlzc2luZw").await.unwrap_err();
        assert!(matches!(err, Error::PeerNotFound(_)));
    }

    #[tokio::test]
    async fn test_set_peer_alias_updates_table_and_record() {
        let node = node(b"alice");
        node.trust
            .save(&TrustedPeer::new("cGsx", "AAAAAA", "Nadia"))
            .await
            .unwrap();
        node.engine.initialize().await.unwrap();

        node.engine
            .set_peer_alias("AAAAAA", Some("bestie".into()))
            .await
            .unwrap();
        assert_eq!(
            node.engine.peers()[0].alias.as_deref(),
            Some("bestie")
        );
        assert_eq!(
            node.trust
                .get_by_public_key("cGsx")
                .await
                .unwrap()
                .unwrap()
                .alias
                .as_deref(),
            Some("bestie")
        );
    }

    #[tokio::test]
    async fn test_peer_left_marks_disconnected() {
        let (node, _code, server) = connected_node(b"alice").await;
        node.engine.registry.insert({
            let mut p = Peer::placeholder("Q7P3R8");
            p.state = PeerConnectionState::Connected;
            p
        });

        server
            .push_json(json!({"type": "peer_left", "peerId": "Q7P3R8"}))
            .await;
        wait_for(|| {
            node.engine
                .peers()
                .iter()
                .any(|p| p.code == "Q7P3R8" && p.state == PeerConnectionState::Disconnected)
        })
        .await;
    }

    #[tokio::test]
    async fn test_handshake_complete_persists_trusted_peer() {
        let (node, _code, _server) = connected_node(b"alice").await;
        let mut peer = Peer::placeholder("Q7P3R8");
        peer.public_key = Some(BASE64.encode(b"their-public"));
        node.engine.registry.insert(peer);

        node.webrtc.emit(WebRtcEvent::ChannelOpen {
            peer_id: "Q7P3R8".into(),
        });
        node.webrtc.emit(WebRtcEvent::HandshakeComplete {
            peer_id: "Q7P3R8".into(),
        });

        wait_for(|| {
            node.engine
                .peers()
                .iter()
                .any(|p| p.code == "Q7P3R8" && p.state == PeerConnectionState::Connected)
        })
        .await;
        assert!(node
            .trust
            .is_trusted_by_public_key(&BASE64.encode(b"their-public"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_dispose_clears_link_session() {
        let (node, _code, _server) = connected_node(b"alice").await;
        node.engine
            .create_link_session("wss://signal.example")
            .await
            .unwrap();
        node.engine.dispose().await;
        assert!(node.secure.keys_with_prefix("zajel").await.unwrap().is_empty());
        assert!(!node.engine.signaling.read().is_connected());
    }
}
