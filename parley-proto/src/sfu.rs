//! SFU control-plane payloads.
//!
//! The SFU is driven over the hub's request/response channel: requests
//! go out as `{t: "mediasoup", d: {type, data}, r: requestId}` and the
//! reply comes back with the same `r`. The server also pushes two
//! notices without a request id: `mediasoup-info` (router RTP
//! capabilities, once per room/connection) and `new-consumer` (a remote
//! producer this client should start consuming).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request topic for all SFU control-plane calls.
pub const SFU_TOPIC: &str = "mediasoup";

/// Media kind of a producer/consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// `{type, data}` body of an SFU request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SfuRequest {
    #[serde(rename = "createWebRtcTransport")]
    CreateWebRtcTransport(CreateTransportRequest),
    #[serde(rename = "connectWebRtcTransport")]
    ConnectWebRtcTransport(ConnectTransportRequest),
    #[serde(rename = "produce")]
    Produce(ProduceRequest),
    #[serde(rename = "closeProducer")]
    CloseProducer {
        #[serde(rename = "producerId")]
        producer_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest {
    pub producing: bool,
    pub consuming: bool,
    pub rtp_capabilities: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_tcp: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub transport_id: String,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    #[serde(default)]
    pub app_data: Value,
}

/// Result of `produce`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProduceResponse {
    pub id: String,
}

/// Result of `createWebRtcTransport`: everything the client needs to
/// construct its side of the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<Value>,
}

/// Server-pushed `mediasoup-info` notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterInfo {
    pub rtp_capabilities: Value,
}

/// Server-pushed `new-consumer` notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerNotice {
    /// Producer-side peer as `peerId` or dotted `peerId.connId`.
    pub peer_id: String,
    pub producer_id: String,
    pub id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    #[serde(rename = "type", default)]
    pub consumer_type: Option<String>,
    #[serde(default)]
    pub app_data: Value,
    #[serde(default)]
    pub producer_paused: bool,
}

impl ConsumerNotice {
    /// Split the producer peer address into its peer and optional
    /// connection halves.
    #[must_use]
    pub fn peer_parts(&self) -> (&str, Option<&str>) {
        match self.peer_id.split_once('.') {
            Some((peer, conn)) => (peer, Some(conn)),
            None => (self.peer_id.as_str(), None),
        }
    }
}
