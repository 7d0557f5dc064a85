//! The seam between connection management and the actual WebRTC stack.
//!
//! Connection lifecycle logic never touches `webrtc` types directly; it
//! drives a [`PeerTransport`] and reacts to [`TransportEvent`]s. The
//! production implementation lives in [`crate::rtc`]; tests substitute
//! scripted transports.

use crate::config::IceConfig;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parley_proto::{ConnId, MediaKind, PeerId, SignalBody, SignalPayload};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::track::track_local::TrackLocal;

/// A local media track attachable to transports.
pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// A remote media source surfaced by a transport.
///
/// Kept behind a trait because remote tracks cannot be fabricated
/// outside the WebRTC stack, which tests need to do.
pub trait RemoteSource: Send + Sync {
    fn media_kind(&self) -> MediaKind;
    /// Stream id as announced in the remote SDP; matched against the
    /// `remoteStreamIds` signal metadata to recover the logical name.
    fn msid(&self) -> String;
}

pub type RemoteMedia = Arc<dyn RemoteSource>;

/// What a transport reports back to its manager.
#[derive(Clone)]
pub enum TransportEvent {
    /// An outbound negotiation step to be relayed to the remote side.
    /// The manager stamps `from`, `first` and stream metadata before
    /// it leaves the machine.
    Signal(SignalPayload),
    /// ICE reached connected/completed.
    Connected,
    /// ICE dropped; often recoverable, so the manager only shortens
    /// the connect timeout.
    IceDisconnected,
    /// ICE failed or the connection closed; not recoverable.
    Failed,
    Data(Bytes),
    Track(RemoteMedia),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal(p) => f.debug_tuple("Signal").field(p).finish(),
            Self::Connected => write!(f, "Connected"),
            Self::IceDisconnected => write!(f, "IceDisconnected"),
            Self::Failed => write!(f, "Failed"),
            Self::Data(d) => f.debug_tuple("Data").field(&d.len()).finish(),
            Self::Track(t) => f.debug_tuple("Track").field(&t.msid()).finish(),
        }
    }
}

/// Identifies which transport instance an event came from, so events of
/// replaced instances can be recognized as stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportHandle {
    pub peer_id: PeerId,
    pub conn_id: ConnId,
    /// The per-attempt `from` nonce of the emitting instance.
    pub transport_id: String,
}

pub type TransportEventTx = mpsc::UnboundedSender<(TransportHandle, TransportEvent)>;
pub type TransportEventRx = mpsc::UnboundedReceiver<(TransportHandle, TransportEvent)>;

/// One attempt at a peer-to-peer connection.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Per-attempt nonce, carried as `from` on every outbound signal.
    fn id(&self) -> &str;

    fn initiator(&self) -> bool;

    /// Marks the instance as replaced. A garbage transport must go
    /// silent: no further events, all applied signals ignored.
    fn mark_garbage(&self);

    fn is_garbage(&self) -> bool;

    /// Kick off negotiation. Only meaningful for the initiating side,
    /// which creates the data channel and the first offer here.
    async fn start(&self) -> Result<()>;

    /// Apply a remote negotiation step.
    async fn apply(&self, body: SignalBody) -> Result<()>;

    /// Attach or replace the local track under `name`; `None` detaches.
    /// Detaching a name that was never attached is a no-op.
    async fn set_track(&self, name: &str, track: Option<LocalTrack>) -> Result<()>;

    /// `(name, stream id)` pairs of the currently attached local
    /// tracks, sent as signal metadata.
    fn attached_tracks(&self) -> Vec<(String, String)>;

    async fn send_data(&self, data: Bytes) -> Result<()>;

    async fn close(&self);
}

/// Creates transports; swapped out in tests.
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &PeerId,
        conn_id: &ConnId,
        initiator: bool,
        ice: &IceConfig,
        local_tracks: &[(String, LocalTrack)],
        events: TransportEventTx,
    ) -> Result<Arc<dyn PeerTransport>>;
}
