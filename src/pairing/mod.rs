//! # Pairing Controller
//!
//! The two-phase, mutually approved pairing handshake.
//!
//! ## Flow
//!
//! ```text
//! Initiator                         Server                       Responder
//! ─────────────────────────────────────────────────────────────────────────
//! connect_to_peer(code)
//!   validate code
//!   insert placeholder (Connecting)
//!   pair_request ────────────────────► pair_incoming ──────────► blocked?
//!                                                                trusted?  auto-accept
//!                                                                e2e flag? auto-accept
//!                                                                else      ask the UI
//!                                      ◄──────────── pair_response
//!   ◄──── pair_matched (initiator)          pair_matched (responder) ────►
//!   attach key, reconcile identity          install placeholder + key
//!   create_offer ──► offer ───────────────────────────────────► answer
//! ```
//!
//! Every handler captures the `Connected` variant's interior into locals
//! at entry and re-checks the captured handle after each await; a
//! dispatcher torn down mid-offer leaves the peer `Failed` with no frame
//! sent.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::codes;
use crate::contracts::{CryptoService, TrustedPeerStore, WebRtcEngine};
use crate::error::{Error, Result};
use crate::peers::{Peer, PeerConnectionState, PeerRegistry};
use crate::signaling::{ClientFrame, SignalingState};
use crate::trust::IdentityReconciler;

/// An incoming pair request surfaced to the UI.
#[derive(Debug, Clone)]
pub struct PairRequestEvent {
    /// Requester's pairing code
    pub code: String,
    /// Requester's public key, Base64
    pub public_key: String,
    /// Name the requester proposes for itself
    pub proposed_name: Option<String>,
}

/// Drives pairing for both the initiator and responder paths.
pub struct PairingController {
    signaling: Arc<RwLock<SignalingState>>,
    registry: Arc<PeerRegistry>,
    webrtc: Arc<dyn WebRtcEngine>,
    crypto: Arc<dyn CryptoService>,
    trust: Arc<dyn TrustedPeerStore>,
    reconciler: Arc<IdentityReconciler>,
    pair_request_tx: broadcast::Sender<PairRequestEvent>,
    is_e2e_test: bool,
}

impl PairingController {
    /// Wire the controller to its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signaling: Arc<RwLock<SignalingState>>,
        registry: Arc<PeerRegistry>,
        webrtc: Arc<dyn WebRtcEngine>,
        crypto: Arc<dyn CryptoService>,
        trust: Arc<dyn TrustedPeerStore>,
        reconciler: Arc<IdentityReconciler>,
        pair_request_tx: broadcast::Sender<PairRequestEvent>,
        is_e2e_test: bool,
    ) -> Self {
        Self {
            signaling,
            registry,
            webrtc,
            crypto,
            trust,
            reconciler,
            pair_request_tx,
            is_e2e_test,
        }
    }

    /// Initiator entry point: validate the code, install a placeholder,
    /// and send the pair request.
    pub async fn connect_to_peer(
        &self,
        code: &str,
        proposed_name: Option<String>,
    ) -> Result<()> {
        let code = codes::normalize(code);
        if !codes::validate(&code) {
            return Err(Error::InvalidPairingCode(code));
        }

        // capture before the first suspension
        let captured = self.signaling.read().captured();
        let Some((client, _my_code)) = captured else {
            return Err(Error::NotConnected);
        };

        self.registry.insert(Peer::placeholder(&code));

        if let Err(e) = client
            .send(&ClientFrame::PairRequest {
                target_code: code.clone(),
                proposed_name,
            })
            .await
        {
            self.registry.set_state(&code, PeerConnectionState::Failed);
            return Err(e);
        }
        Ok(())
    }

    /// UI response to an incoming pair request.
    pub async fn respond_to_pair_request(&self, code: &str, accept: bool) -> Result<()> {
        let captured = self.signaling.read().captured();
        let Some((client, _my_code)) = captured else {
            return Err(Error::NotConnected);
        };
        client
            .send(&ClientFrame::PairResponse {
                target_code: codes::normalize(code),
                accepted: accept,
            })
            .await
    }

    /// `pair_matched` handler, both directions. Attaches the key,
    /// reconciles identity continuity, and on the initiator side drives
    /// the offer.
    pub async fn handle_pair_matched(
        &self,
        peer_code: &str,
        peer_public_key: &str,
        is_initiator: bool,
    ) {
        let captured = self.signaling.read().captured();

        if !self.registry.contains(peer_code) {
            // responder side: no placeholder was installed yet
            self.registry.insert(Peer::placeholder(peer_code));
        }
        self.registry.attach_public_key(peer_code, peer_public_key);

        match BASE64.decode(peer_public_key) {
            Ok(key_bytes) => {
                if let Err(e) = self.crypto.establish_session(peer_code, &key_bytes).await {
                    tracing::warn!(error = %e, peer = %peer_code, "session establishment failed");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, peer = %peer_code, "matched key is not valid Base64");
            }
        }

        if let Some(outcome) = self.reconciler.reconcile(peer_code, peer_public_key).await {
            tracing::info!(
                old_code = %outcome.old_code,
                new_code = %peer_code,
                migrated = outcome.migrated_messages,
                "trusted peer migrated to new code"
            );
        }

        if !is_initiator {
            // the counterpart drives; we wait for its offer
            return;
        }

        let Some((client, _my_code)) = captured else {
            tracing::warn!(peer = %peer_code, "matched while disconnected");
            self.registry
                .set_state(peer_code, PeerConnectionState::Failed);
            return;
        };

        let offer = match self.webrtc.create_offer(peer_code).await {
            Ok(offer) => offer,
            Err(e) => {
                tracing::error!(error = %e, peer = %peer_code, "offer creation failed");
                self.registry
                    .set_state(peer_code, PeerConnectionState::Failed);
                return;
            }
        };

        // the dispatcher may have been torn down during the await
        if !client.is_connected() {
            tracing::warn!(peer = %peer_code, "signaling dropped during offer creation");
            self.registry
                .set_state(peer_code, PeerConnectionState::Failed);
            return;
        }

        if let Err(e) = client
            .send(&ClientFrame::Offer {
                target: peer_code.to_string(),
                payload: offer,
            })
            .await
        {
            tracing::warn!(error = %e, peer = %peer_code, "offer send failed");
            self.registry
                .set_state(peer_code, PeerConnectionState::Failed);
        }
    }

    /// Incoming pair request: blocked keys are silently rejected, trusted
    /// keys auto-accept, the test flag auto-accepts, everything else is
    /// surfaced to the UI.
    pub async fn handle_pair_incoming(
        &self,
        from_code: &str,
        from_public_key: &str,
        proposed_name: Option<String>,
    ) {
        let blocked = match self.trust.get_by_public_key(from_public_key).await {
            Ok(Some(record)) => record.blocked,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "blocked-peer lookup failed; treating as unknown");
                false
            }
        };
        if blocked {
            tracing::info!(from = %from_code, "rejecting pair request from blocked key");
            if let Err(e) = self.respond_to_pair_request(from_code, false).await {
                tracing::warn!(error = %e, "failed to send silent rejection");
            }
            return;
        }

        let trusted = self
            .trust
            .is_trusted_by_public_key(from_public_key)
            .await
            .unwrap_or(false);
        if trusted || self.is_e2e_test {
            tracing::info!(from = %from_code, trusted, "auto-accepting pair request");
            if let Err(e) = self.respond_to_pair_request(from_code, true).await {
                tracing::warn!(error = %e, "auto-accept send failed");
            }
            return;
        }

        let _ = self.pair_request_tx.send(PairRequestEvent {
            code: from_code.to_string(),
            public_key: from_public_key.to_string(),
            proposed_name,
        });
    }

    /// Remote offer: answer it over the freshly captured dispatcher.
    pub async fn handle_offer(&self, from: &str, payload: serde_json::Value) {
        // re-capture at entry; the dispatcher may have been replaced
        let captured = self.signaling.read().captured();

        if !self.registry.contains(from) {
            self.registry.insert(Peer::placeholder(from));
        }

        let answer = match self.webrtc.handle_offer(from, payload).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::error!(error = %e, peer = %from, "answer creation failed");
                self.registry.set_state(from, PeerConnectionState::Failed);
                return;
            }
        };

        match captured {
            Some((client, _my_code)) if client.is_connected() => {
                if let Err(e) = client
                    .send(&ClientFrame::Answer {
                        target: from.to_string(),
                        payload: answer,
                    })
                    .await
                {
                    tracing::warn!(error = %e, peer = %from, "answer send failed");
                    self.registry.set_state(from, PeerConnectionState::Failed);
                }
            }
            _ => {
                tracing::warn!(peer = %from, "signaling dropped while answering offer");
                self.registry.set_state(from, PeerConnectionState::Failed);
            }
        }
    }

    /// `pair_rejected`: the placeholder leaves the table.
    pub fn handle_pair_rejected(&self, peer_code: &str) {
        tracing::info!(peer = %peer_code, "pair request rejected");
        self.registry.remove(peer_code);
    }

    /// `pair_timeout`: the placeholder leaves the table.
    pub fn handle_pair_timeout(&self, peer_code: &str) {
        tracing::info!(peer = %peer_code, "pair request timed out");
        self.registry.remove(peer_code);
    }

    /// `pair_error` carries no peer field; every connecting peer is purged.
    pub fn handle_pair_error(&self, error: &str) {
        let purged = self.registry.remove_all_connecting();
        tracing::warn!(%error, purged = purged.len(), "pair error; purged connecting peers");
    }
}

// ============================================================================
// TESTS
// ============================================================================
