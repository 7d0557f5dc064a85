//! Wire-protocol types for the parley signaling plane.
//!
//! Everything that crosses the signaling WebSocket is defined here:
//!
//! - typed identifiers (`PeerId`, `ConnId`, the `peerId;connId` combined
//!   address form)
//! - the JSON envelopes exchanged with the relay (`{t, d}` broadcast,
//!   `{t, d, p}` direct, `{t, d, r}` request/response, `{s}` subscribe)
//! - WebRTC signal payloads (SDP offer/answer, trickle ICE candidates,
//!   the `you-start` initiator handoff)
//! - the SFU control-plane request/response payloads and server notices
//!
//! The crate is deliberately free of any networking or runtime code so
//! both the client engine and test harnesses can share it.

mod envelope;
mod ids;
mod sfu;
mod signal;

pub use envelope::{
    DirectPayload, HubFrame, PeerEventMessage, SharedStateMessage, SignalMessage, TimedState,
    TOPIC_ADD_PEER, TOPIC_ALL, TOPIC_PEERS, TOPIC_REMOVE_PEER, TOPIC_RESPONSE, TOPIC_SERVER,
};
pub use ids::{CombinedId, ConnId, PeerId};
pub use sfu::{
    ConnectTransportRequest, ConsumerNotice, CreateTransportRequest, MediaKind, ProduceRequest,
    ProduceResponse, RouterInfo, SfuRequest, TransportParams, SFU_TOPIC,
};
pub use signal::{CandidateInit, SignalBody, SignalMeta, SignalPayload, StreamIdEntry};
