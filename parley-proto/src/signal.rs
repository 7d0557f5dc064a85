//! WebRTC negotiation payloads.
//!
//! A signal is one step of an SDP/ICE exchange between two connections.
//! Payloads are tagged with the sending transport's per-attempt `from`
//! nonce so a receiver can discard traffic from an abandoned attempt,
//! and the first payload of an attempt carries `first: true`, which is
//! the only point at which the non-initiating side may create its local
//! peer-connection object.

use serde::{Deserialize, Serialize};

/// A `(name, stream id)` pair telling the receiver which logical stream
/// name an incoming media stream id belongs to.
pub type StreamIdEntry = (String, String);

/// Metadata piggybacked on every signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SignalMeta {
    #[serde(rename = "remoteStreamIds", default)]
    pub remote_stream_ids: Vec<StreamIdEntry>,
}

/// Trickle-ICE candidate in `RTCIceCandidateInit` JSON form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// The negotiation step itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalBody {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: CandidateInit },
    /// Initiator handoff: "you are the greater pair, you create the
    /// offer". Carries no SDP.
    YouStart,
}

/// A complete signal payload as carried inside a [`SignalMessage`].
///
/// [`SignalMessage`]: crate::envelope::SignalMessage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalPayload {
    #[serde(flatten)]
    pub body: SignalBody,
    /// Per-attempt nonce of the sending transport instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Set on the first signal of an attempt.
    #[serde(default, skip_serializing_if = "is_false")]
    pub first: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<SignalMeta>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !*b
}

impl SignalPayload {
    #[must_use]
    pub fn new(body: SignalBody) -> Self {
        Self {
            body,
            from: None,
            first: false,
            meta: None,
        }
    }

    #[must_use]
    pub const fn you_start() -> Self {
        Self {
            body: SignalBody::YouStart,
            from: None,
            first: false,
            meta: None,
        }
    }

    #[must_use]
    pub const fn is_you_start(&self) -> bool {
        matches!(self.body, SignalBody::YouStart)
    }
}
