//! # Signaling Dispatcher
//!
//! The duplex link to a rendezvous server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SIGNALING DISPATCHER                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  transport frames ──► read loop ──► SignalingEvent ──► broadcast       │
//! │       ▲                  │              (parsed)       (subscribers)   │
//! │       │                  └── malformed: warn + drop                    │
//! │       │                                                                 │
//! │  typed sends ◄── ClientFrame::to_wire ◄── send()                       │
//! │       ▲                                                                 │
//! │       └── heartbeat task: {"type":"ping"} every 30 s                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! On connect the client immediately sends `register` with this node's
//! pairing code and Base64 public key, then starts the heartbeat. The
//! transport closing (or a failed send) flips the connected flag, which
//! the engine observes through [`SignalingClient::subscribe_connected`].
//!
//! ## The capture rule
//!
//! [`SignalingState`] is a two-variant sum. Every handler that awaits must
//! destructure `Connected` into local bindings before its first suspension
//! and re-check [`SignalingClient::is_connected`] after each await. No
//! handler consults an ambient "maybe connected" predicate across a
//! suspension point.

pub mod messages;

pub use messages::{
    CallEvent, CallKind, ClientFrame, DeadDrop, LiveMatch, RendezvousEvent,
    RendezvousRedirect, RendezvousRegistration, SignalingEvent,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::contracts::SignalingTransport;
use crate::error::{Error, Result};

/// Capacity of the parsed-event broadcast. Slow subscribers lag and drop
/// rather than backpressure the read loop.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Signaling connection state. The interior of `Connected` is what
/// handlers capture into locals before suspending.
#[derive(Clone)]
pub enum SignalingState {
    /// No dispatcher.
    Disconnected,
    /// Live dispatcher and the code it registered under.
    Connected {
        /// The dispatcher handle
        client: Arc<SignalingClient>,
        /// This node's current pairing code
        my_pairing_code: String,
    },
}

impl SignalingState {
    /// Destructure `Connected` into owned bindings, or `None`.
    pub fn captured(&self) -> Option<(Arc<SignalingClient>, String)> {
        match self {
            SignalingState::Disconnected => None,
            SignalingState::Connected {
                client,
                my_pairing_code,
            } => Some((Arc::clone(client), my_pairing_code.clone())),
        }
    }

    /// Whether this is the `Connected` variant.
    pub fn is_connected(&self) -> bool {
        matches!(self, SignalingState::Connected { .. })
    }
}

impl std::fmt::Debug for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalingState::Disconnected => write!(f, "Disconnected"),
            SignalingState::Connected {
                my_pairing_code, ..
            } => f
                .debug_struct("Connected")
                .field("my_pairing_code", my_pairing_code)
                .finish(),
        }
    }
}

/// A connected signaling dispatcher.
///
/// Created by [`SignalingClient::connect`], which opens the transport,
/// sends `register`, spawns the read loop, and starts the heartbeat.
pub struct SignalingClient {
    url: String,
    pairing_code: String,
    outbound: mpsc::Sender<String>,
    event_tx: broadcast::Sender<SignalingEvent>,
    connected: AtomicBool,
    connected_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Open a link to `url`, register as `pairing_code`, and start the
    /// read loop and heartbeat.
    pub async fn connect(
        transport: &dyn SignalingTransport,
        url: &str,
        pairing_code: &str,
        public_key_base64: &str,
        heartbeat_interval: Duration,
    ) -> Result<Arc<Self>> {
        tracing::info!(url, pairing_code, "connecting to signaling server");
        let link = transport.connect(url).await?;

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (connected_tx, _) = watch::channel(true);
        let client = Arc::new(Self {
            url: url.to_string(),
            pairing_code: pairing_code.to_string(),
            outbound: link.outbound,
            event_tx,
            connected: AtomicBool::new(true),
            connected_tx,
            tasks: Mutex::new(Vec::new()),
        });

        // register must precede every other outbound frame
        client
            .send(&ClientFrame::Register {
                pairing_code: pairing_code.to_string(),
                public_key: public_key_base64.to_string(),
            })
            .await?;

        let reader = tokio::spawn(read_loop(Arc::clone(&client), link.inbound));
        let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(&client), heartbeat_interval));
        client.tasks.lock().extend([reader, heartbeat]);

        Ok(client)
    }

    /// Subscribe to parsed inbound events. Frames are broadcast in receipt
    /// order; multiple subscribers are supported.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Watch the connected flag. Flips to false exactly once, when the
    /// transport closes or a send fails.
    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    /// Whether the link is still up. Handlers re-check this after every
    /// await before sending.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The pairing code this client registered under.
    pub fn pairing_code(&self) -> &str {
        &self.pairing_code
    }

    /// The server this client is linked to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Serialize and send a frame. Frames are written in call order.
    pub async fn send(&self, frame: &ClientFrame) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let wire = frame.to_wire()?;
        tracing::debug!(frame = %wire, "sending signaling frame");
        if self.outbound.send(wire).await.is_err() {
            self.mark_disconnected();
            return Err(Error::ConnectionFailed("transport closed".into()));
        }
        Ok(())
    }

    /// Tear the dispatcher down: stop the read loop and heartbeat and flip
    /// the connected flag. Idempotent.
    pub async fn close(&self) {
        self.mark_disconnected();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        tracing::info!(url = %self.url, "signaling client closed");
    }

    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.connected_tx.send(false);
        }
    }
}

/// Pump transport frames through the parser into the event broadcast.
async fn read_loop(client: Arc<SignalingClient>, mut inbound: mpsc::Receiver<String>) {
    while let Some(raw) = inbound.recv().await {
        match SignalingEvent::parse(&raw) {
            Ok(Some(event)) => {
                // a lagging subscriber must not stall the read loop
                let _ = client.event_tx.send(event);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, frame = %raw, "dropping malformed signaling frame");
            }
        }
    }
    tracing::info!(url = %client.url, "signaling transport closed");
    client.mark_disconnected();
}

/// Send `ping` on a fixed interval until the link dies.
async fn heartbeat_loop(client: Arc<SignalingClient>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately; skip it
    loop {
        ticker.tick().await;
        if client.send(&ClientFrame::Ping).await.is_err() {
            break;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
