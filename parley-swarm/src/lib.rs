//! Peer connection lifecycle and signaling-state synchronization for
//! audio rooms.
//!
//! A [`Swarm`] joins a room on a signaling hub, elects a deterministic
//! initiator for every peer pair, negotiates WebRTC connections with
//! per-attempt nonces and coalescing timeouts, and keeps a reduced
//! per-peer view of every peer's shared state.

pub mod config;
pub mod error;
pub mod events;
pub mod hub;
pub mod identity;
pub mod reducer;
pub mod rtc;
pub mod timeout;
pub mod transport;

mod peer;
mod swarm;

pub use config::{IceConfig, IceServer, StateVerifier, SwarmOptions, TokenSigner};
pub use error::{Error, Result};
pub use events::{ConnectState, EventHub, RemoteStream, SwarmEvent};
pub use hub::{HubConfig, HubEvent, SignalingHub, REQUEST_TIMEOUT};
pub use identity::IdentityDirectory;
pub use peer::{
    HandleStage, MAX_CONNECT_TIME, MAX_CONNECT_TIME_AFTER_ICE_DISCONNECT, MAX_FAIL_TIME,
    MIN_MAX_CONNECT_TIME_AFTER_SIGNAL,
};
pub use reducer::{MostRecentWins, PeerStates, ReducePolicy, ReduceState, Removal, StateStore};
pub use rtc::RtcTransportFactory;
pub use swarm::Swarm;
pub use timeout::TimeoutRegistry;
pub use transport::{
    LocalTrack, PeerTransport, PeerTransportFactory, RemoteMedia, RemoteSource, TransportEvent,
    TransportEventTx, TransportHandle,
};
