//! # Signaling Wire Protocol
//!
//! JSON text frames with a `type` tag. Outbound frames are typed as
//! [`ClientFrame`]; inbound frames parse into the sealed [`SignalingEvent`]
//! enum that every consumer pattern-matches exhaustively.
//!
//! Unknown or unparseable inbound frames are logged at warn level and
//! dropped; `registered` acknowledgments and `pong` heartbeats are
//! silently consumed. A malformed frame never closes the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Frames sent from this node to the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Announce this node's pairing code and public key. Must precede any
    /// other outbound frame.
    Register {
        #[serde(rename = "pairingCode")]
        pairing_code: String,
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    /// Ask the server to match us with the peer registered at `target_code`.
    PairRequest {
        #[serde(rename = "targetCode")]
        target_code: String,
        #[serde(rename = "proposedName", skip_serializing_if = "Option::is_none")]
        proposed_name: Option<String>,
    },
    /// Accept or reject an incoming pair request.
    PairResponse {
        #[serde(rename = "targetCode")]
        target_code: String,
        accepted: bool,
    },
    /// Forward an SDP offer.
    Offer { target: String, payload: Value },
    /// Forward an SDP answer.
    Answer { target: String, payload: Value },
    /// Forward an ICE candidate.
    IceCandidate { target: String, payload: Value },
    /// Register meeting-point tokens for trusted-peer rediscovery.
    RegisterRendezvous {
        #[serde(rename = "peerId")]
        peer_id: String,
        daily_points: Vec<String>,
        hourly_tokens: Vec<String>,
        dead_drops: serde_json::Map<String, Value>,
    },
    /// Forward a call offer.
    CallOffer { target: String, payload: Value },
    /// Forward a call answer.
    CallAnswer { target: String, payload: Value },
    /// Reject a call.
    CallReject { target: String, payload: Value },
    /// Hang a call up.
    CallHangup { target: String, payload: Value },
    /// Forward a call ICE candidate.
    CallIce { target: String, payload: Value },
    /// Accept or reject a linked-device request.
    LinkResponse {
        #[serde(rename = "linkCode")]
        link_code: String,
        accepted: bool,
        #[serde(rename = "deviceId", skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
    },
    /// Heartbeat.
    Ping,
}

impl ClientFrame {
    /// Serialize to the wire form.
    pub fn to_wire(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }
}

/// Rendezvous registration bundle. The single place `register_rendezvous`
/// frames are built, so the hourly field always carries the daily tokens
/// too — the server pushes live matches only for hourly-token overlap.
#[derive(Debug, Clone)]
pub struct RendezvousRegistration {
    /// This node's pairing code
    pub peer_id: String,
    /// Daily meeting points
    pub daily_points: Vec<String>,
    /// Hourly tokens, daily points included
    pub hourly_tokens: Vec<String>,
}

impl RendezvousRegistration {
    /// Build a registration, copying every daily point into the hourly set.
    pub fn new(peer_id: String, daily_points: Vec<String>, hourly_tokens: Vec<String>) -> Self {
        let mut all_hourly = hourly_tokens;
        for day in &daily_points {
            if !all_hourly.contains(day) {
                all_hourly.push(day.clone());
            }
        }
        Self {
            peer_id,
            daily_points,
            hourly_tokens: all_hourly,
        }
    }

    /// The wire frame for this registration.
    pub fn to_frame(&self) -> ClientFrame {
        ClientFrame::RegisterRendezvous {
            peer_id: self.peer_id.clone(),
            daily_points: self.daily_points.clone(),
            hourly_tokens: self.hourly_tokens.clone(),
            dead_drops: serde_json::Map::new(),
        }
    }
}

/// The kind of an inbound call frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// `call_offer`
    Offer,
    /// `call_answer`
    Answer,
    /// `call_reject`
    Reject,
    /// `call_hangup`
    Hangup,
    /// `call_ice`
    Ice,
}

/// An inbound call-signaling frame. The counterpart id falls back between
/// `from`, `target`, and `payload.targetId`, in that order.
#[derive(Debug, Clone)]
pub struct CallEvent {
    /// Which call frame this is
    pub kind: CallKind,
    /// The other party
    pub counterpart: String,
    /// Nested payload (`callId`, `sdp` or `candidate`, ...)
    pub payload: Value,
}

/// One live match inside a rendezvous result.
#[derive(Debug, Clone, Deserialize)]
pub struct LiveMatch {
    /// The matched peer's pairing code
    #[serde(alias = "peerId")]
    pub peer_id: String,
    /// The token that matched, when the server reports it
    #[serde(default, alias = "meetingPoint")]
    pub meeting_point: Option<String>,
}

/// An encrypted blob left for us at a meeting point.
#[derive(Debug, Clone, Deserialize)]
pub struct DeadDrop {
    /// Peer the drop is attributed to
    #[serde(alias = "peerId")]
    pub peer_id: String,
    /// Base64 ciphertext
    pub payload: String,
}

/// A federated-redirect entry: these tokens belong to another server.
#[derive(Debug, Clone, Deserialize)]
pub struct RendezvousRedirect {
    /// The federated server, empty when unroutable
    #[serde(default)]
    pub endpoint: String,
    /// Daily tokens to re-register there
    #[serde(default, alias = "daily")]
    pub daily_points: Vec<String>,
    /// Hourly tokens to re-register there
    #[serde(default, alias = "hourly")]
    pub hourly_tokens: Vec<String>,
}

/// Rendezvous outcomes pushed by the server.
#[derive(Debug, Clone)]
pub enum RendezvousEvent {
    /// All registered tokens were handled by this server.
    Result {
        /// Peers currently registered at overlapping tokens
        live_matches: Vec<LiveMatch>,
        /// Blobs waiting at our tokens
        dead_drops: Vec<DeadDrop>,
    },
    /// Some tokens belong to federated servers.
    Partial {
        /// Matches this server could resolve
        live_matches: Vec<LiveMatch>,
        /// Drops this server held
        dead_drops: Vec<DeadDrop>,
        /// Where the remaining tokens live
        redirects: Vec<RendezvousRedirect>,
    },
    /// Asynchronous single-match push.
    Match {
        /// The matched peer's pairing code
        peer_id: String,
        /// Relay the match came through
        relay_id: Option<String>,
        /// The token that matched
        meeting_point: Option<String>,
    },
}

/// Inbound signaling events. Sealed: consumers match exhaustively.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Remote SDP offer
    Offer {
        /// Sending peer
        from: String,
        /// SDP payload
        payload: Value,
    },
    /// Remote SDP answer
    Answer {
        /// Sending peer
        from: String,
        /// SDP payload
        payload: Value,
    },
    /// Remote ICE candidate
    IceCandidate {
        /// Sending peer
        from: String,
        /// Candidate payload
        payload: Value,
    },
    /// A peer joined the server
    PeerJoined {
        /// Their pairing code
        id: String,
    },
    /// A peer left the server
    PeerLeft {
        /// Their pairing code
        id: String,
    },
    /// Someone asked to pair with us
    PairIncoming {
        /// Requester's pairing code
        from_code: String,
        /// Requester's public key, Base64
        from_public_key: String,
        /// Name the requester proposes for itself
        proposed_name: Option<String>,
    },
    /// The server matched a pair request
    PairMatched {
        /// Counterpart's pairing code
        peer_code: String,
        /// Counterpart's public key, Base64
        peer_public_key: String,
        /// Whether this side drives the offer
        is_initiator: bool,
    },
    /// The counterpart rejected us
    PairRejected {
        /// Counterpart's pairing code
        peer_code: String,
    },
    /// The server timed the pair request out
    PairTimeout {
        /// Counterpart's pairing code
        peer_code: String,
    },
    /// The server failed the pairing without naming a peer
    PairError {
        /// Server-reported reason
        error: String,
    },
    /// Server-side error report
    Error {
        /// Server-reported message
        message: String,
    },
    /// A second device asked to link through us
    LinkRequest {
        /// The link code it presented
        code: String,
        /// Its ephemeral public key, Base64
        public_key: String,
        /// Its self-reported name
        device_name: String,
    },
    /// The server matched a link session
    LinkMatched {
        /// The link code
        code: String,
        /// The device's public key, Base64
        peer_public_key: String,
        /// Whether this side drives the offer
        is_initiator: bool,
    },
    /// The link was rejected
    LinkRejected {
        /// The link code
        code: String,
    },
    /// The link timed out
    LinkTimeout {
        /// The link code
        code: String,
    },
    /// Call signaling passthrough
    Call(CallEvent),
    /// Rendezvous outcome
    Rendezvous(RendezvousEvent),
    /// Relay-carried file chunk, passed through untouched
    ChunkMessage {
        /// The raw frame
        raw: Value,
    },
}

impl SignalingEvent {
    /// Parse a wire frame.
    ///
    /// Returns `Ok(None)` for frames that are consumed silently (`pong`,
    /// `registered`), `Err` for malformed input, and `Ok(Some(event))`
    /// otherwise. Unknown `type` values are an error so the dispatcher can
    /// warn-and-drop them.
    pub fn parse(raw: &str) -> Result<Option<Self>> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| Error::InvalidMessageFrame(format!("not JSON: {}", e)))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidMessageFrame("missing type field".into()))?
            .to_string();

        let event = match kind.as_str() {
            "pong" | "registered" => return Ok(None),

            "offer" => Self::Offer {
                from: required_str(&value, "from")?,
                payload: payload_of(&value),
            },
            "answer" => Self::Answer {
                from: required_str(&value, "from")?,
                payload: payload_of(&value),
            },
            "ice_candidate" => Self::IceCandidate {
                from: required_str(&value, "from")?,
                payload: payload_of(&value),
            },

            "peer_joined" => Self::PeerJoined {
                id: first_str(&value, &["peerId", "id"])?,
            },
            "peer_left" => Self::PeerLeft {
                id: first_str(&value, &["peerId", "id"])?,
            },

            "pair_incoming" => Self::PairIncoming {
                from_code: required_str(&value, "fromCode")?,
                from_public_key: required_str(&value, "fromPublicKey")?,
                proposed_name: optional_str(&value, "proposedName"),
            },
            "pair_matched" => Self::PairMatched {
                peer_code: required_str(&value, "peerCode")?,
                peer_public_key: required_str(&value, "peerPublicKey")?,
                is_initiator: value
                    .get("isInitiator")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            "pair_rejected" => Self::PairRejected {
                peer_code: required_str(&value, "peerCode")?,
            },
            "pair_timeout" => Self::PairTimeout {
                peer_code: required_str(&value, "peerCode")?,
            },
            "pair_error" => Self::PairError {
                error: optional_str(&value, "error").unwrap_or_default(),
            },
            "error" => Self::Error {
                message: optional_str(&value, "message").unwrap_or_default(),
            },

            "link_request" => Self::LinkRequest {
                code: first_str(&value, &["linkCode", "code"])?,
                public_key: required_str(&value, "publicKey")?,
                device_name: optional_str(&value, "deviceName").unwrap_or_default(),
            },
            "link_matched" => Self::LinkMatched {
                code: first_str(&value, &["linkCode", "code"])?,
                peer_public_key: required_str(&value, "peerPublicKey")?,
                is_initiator: value
                    .get("isInitiator")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            "link_rejected" => Self::LinkRejected {
                code: first_str(&value, &["linkCode", "code"])?,
            },
            "link_timeout" => Self::LinkTimeout {
                code: first_str(&value, &["linkCode", "code"])?,
            },

            "call_offer" => Self::Call(parse_call(CallKind::Offer, &value)?),
            "call_answer" => Self::Call(parse_call(CallKind::Answer, &value)?),
            "call_reject" => Self::Call(parse_call(CallKind::Reject, &value)?),
            "call_hangup" => Self::Call(parse_call(CallKind::Hangup, &value)?),
            "call_ice" => Self::Call(parse_call(CallKind::Ice, &value)?),

            "rendezvous_result" => Self::Rendezvous(RendezvousEvent::Result {
                live_matches: list_of(&value, "live_matches")?,
                dead_drops: list_of(&value, "dead_drops")?,
            }),
            "rendezvous_partial" => Self::Rendezvous(RendezvousEvent::Partial {
                live_matches: list_of(&value, "live_matches")?,
                dead_drops: list_of(&value, "dead_drops")?,
                redirects: list_of(&value, "redirects")?,
            }),
            "rendezvous_match" => Self::Rendezvous(RendezvousEvent::Match {
                peer_id: first_str(&value, &["peerId", "peer_id"])?,
                relay_id: optional_str(&value, "relayId")
                    .or_else(|| optional_str(&value, "relay_id")),
                meeting_point: optional_str(&value, "meetingPoint")
                    .or_else(|| optional_str(&value, "meeting_point")),
            }),

            "chunk_message" => Self::ChunkMessage { raw: value },

            other => {
                return Err(Error::InvalidMessageFrame(format!(
                    "unknown frame type: {}",
                    other
                )))
            }
        };

        Ok(Some(event))
    }
}

/// Call frames identify the counterpart via `from`, then `target`, then
/// `payload.targetId`.
fn parse_call(kind: CallKind, value: &Value) -> Result<CallEvent> {
    let payload = payload_of(value);
    let counterpart = optional_str(value, "from")
        .or_else(|| optional_str(value, "target"))
        .or_else(|| {
            payload
                .get("targetId")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .ok_or_else(|| Error::InvalidMessageFrame("call frame without counterpart".into()))?;
    Ok(CallEvent {
        kind,
        counterpart,
        payload,
    })
}

fn payload_of(value: &Value) -> Value {
    value.get("payload").cloned().unwrap_or(Value::Null)
}

fn required_str(value: &Value, field: &str) -> Result<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidMessageFrame(format!("missing field: {}", field)))
}

fn optional_str(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(str::to_string)
}

fn first_str(value: &Value, fields: &[&str]) -> Result<String> {
    for field in fields {
        if let Some(s) = optional_str(value, field) {
            return Ok(s);
        }
    }
    Err(Error::InvalidMessageFrame(format!(
        "missing field: {}",
        fields[0]
    )))
}

fn list_of<T: serde::de::DeserializeOwned>(value: &Value, field: &str) -> Result<Vec<T>> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(vec![]),
        Some(list) => serde_json::from_value(list.clone())
            .map_err(|e| Error::InvalidMessageFrame(format!("bad {}: {}", field, e))),
    }
}

// ============================================================================
// TESTS
// ============================================================================
