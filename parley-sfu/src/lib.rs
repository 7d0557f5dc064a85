//! SFU media session for large rooms.
//!
//! Past a handful of peers, full-mesh WebRTC stops scaling; the room
//! backend then runs a selective forwarding unit and this crate drives
//! the client side of it: one send transport for the local track, one
//! receive transport consuming every remote producer the server
//! announces, all negotiated over the same signaling hub the swarm
//! already uses.

pub mod device;
pub mod error;
pub mod session;

pub use device::{
    ConnectHook, MediaConsumer, MediaDevice, MediaProducer, MediaTransport, ProduceHook,
    TransportHooks,
};
pub use error::{Error, Result};
pub use session::{SfuEvent, SfuSession, SignalingClient, CONSUMER_TOPIC, INFO_TOPIC};
