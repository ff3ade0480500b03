//! # Rendezvous Coordinator
//!
//! Trusted-peer rediscovery through meeting-point tokens.
//!
//! ## Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      RENDEZVOUS FLOW                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  reconnect_all_trusted()                                               │
//! │    ├─ daily tokens   : per trusted peer, from the sorted key pair      │
//! │    ├─ hourly tokens  : per trusted peer, from the session secret       │
//! │    ├─ register_rendezvous (daily duplicated into hourly)               │
//! │    └─ after 5 s: the identical frame again                             │
//! │                                                                         │
//! │  server responses                                                      │
//! │    ├─ rendezvous_result  : live matches + dead drops, all local        │
//! │    ├─ rendezvous_partial : some tokens live on federated servers ──►   │
//! │    │                       open auxiliary client, register subset      │
//! │    └─ rendezvous_match   : asynchronous single-match push              │
//! │                                                                         │
//! │  live match ──► deterministic initiator election:                      │
//! │                 the lexicographically smaller code sends pair_request  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The second registration mitigates the dual-restart race: when both
//! peers reboot concurrently each may register before the other's tokens
//! were recorded, and the server clears tokens on disconnect.
//!
//! Redirect failures are logged and skipped; the primary flow never fails
//! because a federated server was unreachable.

pub mod tokens;

pub use tokens::{daily_points, daily_points_from_ids, hourly_tokens};

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::contracts::{CryptoService, MessageStore, SignalingTransport, TrustedPeerStore};
use crate::error::Error;
use crate::pairing::PairingController;
use crate::peers::{PeerConnectionState, PeerRegistry};
use crate::signaling::{
    DeadDrop, RendezvousEvent, RendezvousRedirect, RendezvousRegistration, SignalingClient,
    SignalingEvent, SignalingState,
};

/// Builds token bundles, registers them with the primary and federated
/// servers, and reacts to match events.
pub struct RendezvousCoordinator {
    me: Weak<RendezvousCoordinator>,
    signaling: Arc<RwLock<SignalingState>>,
    transport: Arc<dyn SignalingTransport>,
    trust: Arc<dyn TrustedPeerStore>,
    crypto: Arc<dyn CryptoService>,
    messages: Arc<dyn MessageStore>,
    registry: Arc<PeerRegistry>,
    pairing: Arc<PairingController>,
    message_tx: broadcast::Sender<(String, String)>,
    redirects: Mutex<HashMap<String, Arc<SignalingClient>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reregister_delay: Duration,
    heartbeat_interval: Duration,
}

impl RendezvousCoordinator {
    /// Wire the coordinator to its collaborators. `message_tx` carries
    /// decrypted dead-drop plaintexts onto the engine's `messages` stream.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signaling: Arc<RwLock<SignalingState>>,
        transport: Arc<dyn SignalingTransport>,
        trust: Arc<dyn TrustedPeerStore>,
        crypto: Arc<dyn CryptoService>,
        messages: Arc<dyn MessageStore>,
        registry: Arc<PeerRegistry>,
        pairing: Arc<PairingController>,
        message_tx: broadcast::Sender<(String, String)>,
        reregister_delay: Duration,
        heartbeat_interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            signaling,
            transport,
            trust,
            crypto,
            messages,
            registry,
            pairing,
            message_tx,
            redirects: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            reregister_delay,
            heartbeat_interval,
        })
    }

    /// Register meeting points for every non-blocked trusted peer, then
    /// send the identical frame again after the re-registration delay.
    pub async fn reconnect_all_trusted(&self) {
        let captured = self.signaling.read().captured();
        let Some((client, my_code)) = captured else {
            tracing::debug!("rendezvous skipped: not connected");
            return;
        };

        let registration = match self.build_registration(&my_code).await {
            Some(reg) => reg,
            None => return,
        };
        if registration.daily_points.is_empty() && registration.hourly_tokens.is_empty() {
            tracing::debug!("no trusted peers to rendezvous with");
            return;
        }

        let frame = registration.to_frame();
        if let Err(e) = client.send(&frame).await {
            tracing::warn!(error = %e, "rendezvous registration failed");
            return;
        }
        tracing::info!(
            daily = registration.daily_points.len(),
            hourly = registration.hourly_tokens.len(),
            "registered rendezvous tokens"
        );

        // both-peers-rebooted race: the server clears tokens on disconnect,
        // so each side re-sends once after the other had a chance to land
        let delay = self.reregister_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !client.is_connected() {
                return;
            }
            if let Err(e) = client.send(&frame).await {
                tracing::warn!(error = %e, "rendezvous re-registration failed");
            }
        });
        self.tasks.lock().push(task);
    }

    /// Union of daily and hourly tokens across all non-blocked trusted
    /// peers. Daily tokens are duplicated into the hourly set by
    /// [`RendezvousRegistration::new`].
    async fn build_registration(&self, my_code: &str) -> Option<RendezvousRegistration> {
        let my_public = match self.crypto.public_key_bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "cannot build rendezvous bundle without own key");
                return None;
            }
        };
        let records = match self.trust.get_all().await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "trusted-peer scan failed for rendezvous");
                return None;
            }
        };

        let mut daily = Vec::new();
        let mut hourly = Vec::new();
        for record in records.iter().filter(|r| !r.blocked) {
            match BASE64.decode(&record.public_key) {
                Ok(their_public) => {
                    for token in tokens::daily_points(&my_public, &their_public) {
                        if !daily.contains(&token) {
                            daily.push(token);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, code = %record.code, "stored key is not Base64");
                }
            }
            match self.crypto.session_key_bytes(&record.code).await {
                Ok(Some(secret)) => {
                    for token in tokens::hourly_tokens(&secret) {
                        if !hourly.contains(&token) {
                            hourly.push(token);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, code = %record.code, "session lookup failed");
                }
            }
        }

        Some(RendezvousRegistration::new(
            my_code.to_string(),
            daily,
            hourly,
        ))
    }

    /// Dispatch a rendezvous event from the primary or an auxiliary server.
    pub async fn handle_event(&self, event: RendezvousEvent) {
        match event {
            RendezvousEvent::Result {
                live_matches,
                dead_drops,
            } => {
                for m in live_matches {
                    self.on_live_match(&m.peer_id).await;
                }
                for drop in dead_drops {
                    self.handle_dead_drop(drop).await;
                }
            }
            RendezvousEvent::Partial {
                live_matches,
                dead_drops,
                redirects,
            } => {
                for m in live_matches {
                    self.on_live_match(&m.peer_id).await;
                }
                for drop in dead_drops {
                    self.handle_dead_drop(drop).await;
                }
                for redirect in redirects {
                    if redirect.endpoint.is_empty() {
                        tracing::debug!("skipping redirect without endpoint");
                        continue;
                    }
                    self.open_redirect(redirect).await;
                }
            }
            RendezvousEvent::Match { peer_id, relay_id, .. } => {
                tracing::debug!(peer = %peer_id, relay = ?relay_id, "rendezvous match push");
                self.on_live_match(&peer_id).await;
            }
        }
    }

    /// Live-match reaction with deterministic initiator election: the side
    /// with the lexicographically smaller code sends the pair request, the
    /// other waits for `pair_incoming`.
    pub async fn on_live_match(&self, peer_id: &str) {
        if let Some(peer) = self.registry.get(peer_id) {
            if matches!(
                peer.state,
                PeerConnectionState::Connecting
                    | PeerConnectionState::Handshaking
                    | PeerConnectionState::Connected
            ) {
                tracing::debug!(peer = %peer_id, state = ?peer.state, "already engaged; ignoring match");
                return;
            }
        }

        let captured = self.signaling.read().captured();
        let Some((_client, my_code)) = captured else {
            return;
        };
        if my_code == peer_id {
            tracing::debug!("ignoring self-match");
            return;
        }
        if my_code.as_str() > peer_id {
            tracing::debug!(peer = %peer_id, "larger code waits for the peer to initiate");
            return;
        }

        tracing::info!(peer = %peer_id, "smaller code initiates reconnection");
        if let Err(e) = self.pairing.connect_to_peer(peer_id, None).await {
            tracing::warn!(error = %e, peer = %peer_id, "reconnect attempt failed");
        }
    }

    /// Decrypt a dead drop under the inferred peer session; failures are
    /// logged and the blob is dropped.
    async fn handle_dead_drop(&self, drop: DeadDrop) {
        let ciphertext = match BASE64.decode(&drop.payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, peer = %drop.peer_id, "dead drop is not Base64");
                return;
            }
        };
        let plaintext = match self.crypto.decrypt_from_peer(&drop.peer_id, &ciphertext).await {
            Ok(bytes) => bytes,
            Err(_) => {
                let err = Error::DeadDropDecrypt {
                    peer_id: drop.peer_id.clone(),
                };
                tracing::warn!(error = %err, "discarding undecryptable dead drop");
                return;
            }
        };
        let text = String::from_utf8_lossy(&plaintext).into_owned();
        if let Err(e) = self.messages.save(&drop.peer_id, &text, false).await {
            tracing::warn!(error = %e, "failed to persist dead-drop message");
        }
        let _ = self.message_tx.send((drop.peer_id, text));
    }

    /// Open an auxiliary client to a federated server, register the
    /// redirected subset there, and process its rendezvous stream exactly
    /// like the primary's. Reopening an endpoint disposes the prior client.
    fn open_redirect<'a>(
        &'a self,
        redirect: RendezvousRedirect,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(self.open_redirect_inner(redirect))
    }

    async fn open_redirect_inner(&self, redirect: RendezvousRedirect) {
        let captured = self.signaling.read().captured();
        let Some((_client, my_code)) = captured else {
            return;
        };
        let public_key = match self.crypto.public_key_base64().await {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(error = %e, "cannot register redirect without own key");
                return;
            }
        };

        let prior = self.redirects.lock().remove(&redirect.endpoint);
        if let Some(prior) = prior {
            prior.close().await;
        }

        let aux = match SignalingClient::connect(
            self.transport.as_ref(),
            &redirect.endpoint,
            &my_code,
            &public_key,
            self.heartbeat_interval,
        )
        .await
        {
            Ok(aux) => aux,
            Err(e) => {
                let err = Error::RedirectFailed(format!("{}: {}", redirect.endpoint, e));
                tracing::warn!(error = %err, "skipping federated redirect");
                return;
            }
        };

        let registration = RendezvousRegistration::new(
            my_code,
            redirect.daily_points,
            redirect.hourly_tokens,
        );
        if let Err(e) = aux.send(&registration.to_frame()).await {
            tracing::warn!(error = %e, endpoint = %redirect.endpoint, "redirect registration failed");
            aux.close().await;
            return;
        }

        let mut events = aux.subscribe();
        let coordinator = self.me.clone();
        let endpoint = redirect.endpoint.clone();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SignalingEvent::Rendezvous(event)) => {
                        let Some(coordinator) = coordinator.upgrade() else {
                            break;
                        };
                        coordinator.handle_event(event).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%endpoint, skipped, "redirect stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.redirects
            .lock()
            .insert(redirect.endpoint.clone(), aux);
        self.tasks.lock().push(task);
        tracing::info!(endpoint = %redirect.endpoint, "federated redirect registered");
    }

    /// Tear every auxiliary client down in parallel and cancel the
    /// coordinator's tasks. Idempotent.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        let clients: Vec<Arc<SignalingClient>> =
            self.redirects.lock().drain().map(|(_, c)| c).collect();
        let mut closers = Vec::new();
        for client in clients {
            closers.push(tokio::spawn(async move { client.close().await }));
        }
        for closer in closers {
            let _ = closer.await;
        }
    }

    /// Number of live auxiliary connections.
    pub fn redirect_count(&self) -> usize {
        self.redirects.lock().len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
