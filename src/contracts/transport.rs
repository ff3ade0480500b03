//! Signaling transport seam.
//!
//! The engine assumes WebSocket semantics: framed text messages, ordered
//! delivery, and a lifecycle that either side can end. Bootstrap discovery
//! and certificate pinning happen behind this trait.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// An open duplex link to a signaling server.
///
/// Dropping either half tears the link down. Closure of `inbound` is the
/// transport's disconnect signal.
pub struct TransportLink {
    /// Frames written here reach the server in call order.
    pub outbound: mpsc::Sender<String>,
    /// Frames from the server, in receipt order.
    pub inbound: mpsc::Receiver<String>,
}

/// Factory for signaling links.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open a link to `url`.
    async fn connect(&self, url: &str) -> Result<TransportLink>;
}
