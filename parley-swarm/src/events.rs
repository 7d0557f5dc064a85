//! Event fan-out to swarm subscribers.

use crate::transport::RemoteMedia;
use bytes::Bytes;
use parking_lot::Mutex;
use parley_proto::{ConnId, PeerId};
use serde_json::Value;
use tokio::sync::mpsc;

/// Lifecycle of the hub connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Initial,
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initial => "initial",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        write!(f, "{s}")
    }
}

/// A remote media stream surfaced by a peer connection.
#[derive(Clone)]
pub struct RemoteStream {
    pub peer_id: PeerId,
    pub conn_id: ConnId,
    /// Logical name announced by the sender in signal metadata, when
    /// the stream id could be matched.
    pub name: Option<String>,
    pub source: RemoteMedia,
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("peer_id", &self.peer_id)
            .field("conn_id", &self.conn_id)
            .field("name", &self.name)
            .field("kind", &self.source.media_kind())
            .finish()
    }
}

/// Everything a swarm reports to its subscribers.
#[derive(Debug, Clone)]
pub enum SwarmEvent {
    ConnectState(ConnectState),
    /// A peer was seen in the room for the first time.
    NewPeer { peer_id: PeerId },
    /// The hub reported the peer's last connection gone.
    PeerLeft { peer_id: PeerId },
    /// A peer connection reached ICE-connected.
    PeerConnected { peer_id: PeerId, conn_id: ConnId },
    StreamAdded(RemoteStream),
    StreamsRemoved { peer_id: PeerId, conn_id: ConnId },
    /// A connection attempt was abandoned past the failure ceiling.
    ConnectionFailed { peer_id: PeerId, conn_id: ConnId },
    Data {
        peer_id: PeerId,
        conn_id: ConnId,
        data: Bytes,
    },
    /// Raw per-connection shared state, before reduction.
    ConnectionState {
        peer_id: PeerId,
        conn_id: ConnId,
        state: Value,
    },
    /// Reduced per-peer state; `None` when the peer's last connection
    /// was removed.
    PeerState {
        peer_id: PeerId,
        state: Option<Value>,
    },
    /// Application-level event broadcast by a peer.
    PeerEvent {
        peer_id: PeerId,
        event: String,
        payload: Value,
    },
    /// Identity record resolved from the directory.
    PeerIdentity { peer_id: PeerId, identity: Value },
    /// Message pushed by the room backend or SFU.
    ServerEvent {
        topic: String,
        payload: Value,
        request_id: Option<String>,
    },
}

/// Multi-subscriber event dispatch. Dead subscribers are pruned on the
/// next emit.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SwarmEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SwarmEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: &SwarmEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_reaches_all_subscribers() {
        let hub = EventHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        hub.emit(&SwarmEvent::NewPeer {
            peer_id: PeerId::from("pk1"),
        });
        assert!(matches!(a.recv().await, Some(SwarmEvent::NewPeer { .. })));
        assert!(matches!(b.recv().await, Some(SwarmEvent::NewPeer { .. })));
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let hub = EventHub::new();
        let rx = hub.subscribe();
        drop(rx);
        hub.emit(&SwarmEvent::PeerLeft {
            peer_id: PeerId::from("pk1"),
        });
        assert!(hub.subscribers.lock().is_empty());
    }
}
