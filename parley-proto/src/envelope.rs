//! JSON envelopes exchanged with the signaling relay.
//!
//! Every frame on the wire is one of:
//!
//! - `{"s": topic}`            — subscribe to an additional topic
//! - `{"t": topic, "d": data}` — broadcast on a topic
//! - `{"t": topic, "d": data, "p": "peerId;connId"}` — direct message;
//!   inbound frames carry the *sender* in `p`, outbound frames carry the
//!   *receiver*
//! - `{"t": topic, "d": data, "r": requestId}` — request, answered by a
//!   frame with `t == "response"` and the same `r`
//!
//! Reserved topics (`peers`, `add-peer`, `remove-peer`, `all`, `server`,
//! `response`) are claimed by the relay; everything else is application
//! traffic.

use crate::ids::CombinedId;
use crate::signal::SignalPayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Full membership snapshot, sent once after every (re)connect.
pub const TOPIC_PEERS: &str = "peers";
/// Single-peer membership delta.
pub const TOPIC_ADD_PEER: &str = "add-peer";
/// Single-peer membership delta.
pub const TOPIC_REMOVE_PEER: &str = "remove-peer";
/// Room-wide broadcast channel.
pub const TOPIC_ALL: &str = "all";
/// Events originated by the room backend or SFU.
pub const TOPIC_SERVER: &str = "server";
/// Reply half of the request/response mechanism.
pub const TOPIC_RESPONSE: &str = "response";

/// One frame as it appears on the WebSocket, both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubFrame {
    /// Topic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    /// Payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    /// Sender (inbound) or receiver (outbound) as `peerId;connId`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    /// Request id for request/response frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r: Option<String>,
    /// Subscribe to an additional topic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<String>,
}

impl HubFrame {
    #[must_use]
    pub fn broadcast(topic: impl Into<String>, data: Value) -> Self {
        Self {
            t: Some(topic.into()),
            d: Some(data),
            p: None,
            r: None,
            s: None,
        }
    }

    #[must_use]
    pub fn direct(receiver: &CombinedId, topic: impl Into<String>, data: Value) -> Self {
        Self {
            t: Some(topic.into()),
            d: Some(data),
            p: Some(receiver.to_string()),
            r: None,
            s: None,
        }
    }

    #[must_use]
    pub fn request(topic: impl Into<String>, data: Value, request_id: impl Into<String>) -> Self {
        Self {
            t: Some(topic.into()),
            d: Some(data),
            p: None,
            r: Some(request_id.into()),
            s: None,
        }
    }

    #[must_use]
    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self {
            t: None,
            d: None,
            p: None,
            r: None,
            s: Some(topic.into()),
        }
    }
}

/// A shared-state value stamped with its origin time (unix millis).
///
/// The timestamp orders states of competing connections of the same
/// peer; the reducer's `latest` pointer follows the greatest `time`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimedState {
    pub state: Value,
    pub time: u64,
}

/// Body of a direct frame carrying WebRTC negotiation traffic.
///
/// `your_conn_id` names the session the sender believes it is talking
/// to; a mismatch with the local connection id marks the whole message
/// as addressed to a dead session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: SignalPayload,
    #[serde(rename = "yourConnId")]
    pub your_conn_id: String,
    /// Sender's shared state, piggybacked on first signals so a new
    /// peer is never observed without state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TimedState>,
}

impl SignalMessage {
    pub const KIND: &'static str = "signal";

    #[must_use]
    pub fn new(data: SignalPayload, your_conn_id: String, state: Option<TimedState>) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            data,
            your_conn_id,
            state,
        }
    }
}

/// Body of a broadcast frame carrying a peer's shared state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedStateMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub state: TimedState,
}

impl SharedStateMessage {
    pub const KIND: &'static str = "shared-state";

    #[must_use]
    pub fn new(state: TimedState) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            state,
        }
    }
}

/// Body of a broadcast frame carrying an application-level peer event
/// (e.g. `identity-update`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEventMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl PeerEventMessage {
    pub const KIND: &'static str = "peer-event";

    #[must_use]
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            event: event.into(),
            payload,
        }
    }
}

/// Discriminated view over the body of a direct/broadcast frame.
#[derive(Debug, Clone)]
pub enum DirectPayload {
    Signal(SignalMessage),
    SharedState(SharedStateMessage),
    PeerEvent(PeerEventMessage),
    /// Unknown `type` tag; kept for forward compatibility.
    Other(Value),
}

impl DirectPayload {
    /// Classify a frame body by its `type` tag.
    #[must_use]
    pub fn classify(data: Value) -> Self {
        let kind = data.get("type").and_then(Value::as_str).unwrap_or("");
        match kind {
            SignalMessage::KIND => match serde_json::from_value(data.clone()) {
                Ok(msg) => Self::Signal(msg),
                Err(_) => Self::Other(data),
            },
            SharedStateMessage::KIND => match serde_json::from_value(data.clone()) {
                Ok(msg) => Self::SharedState(msg),
                Err(_) => Self::Other(data),
            },
            PeerEventMessage::KIND => match serde_json::from_value(data.clone()) {
                Ok(msg) => Self::PeerEvent(msg),
                Err(_) => Self::Other(data),
            },
            _ => Self::Other(data),
        }
    }
}
