//! Seams between the SFU session and the media stack.
//!
//! The session only speaks the SFU control plane; actual encoder,
//! transport and track plumbing sits behind these traits so it can be
//! provided by any mediasoup-compatible client stack, and mocked in
//! tests.

use crate::error::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parley_proto::{ConsumerNotice, MediaKind, TransportParams};
use parley_swarm::{LocalTrack, RemoteMedia};
use serde_json::Value;
use std::sync::Arc;

/// Fired by a transport when it needs the server to complete the DTLS
/// handshake. Receives the local `dtlsParameters`.
pub type ConnectHook = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Fired by a send transport when a producer must be announced.
/// Receives `(kind, rtpParameters, appData)` and returns the
/// server-assigned producer id.
pub type ProduceHook =
    Arc<dyn Fn(MediaKind, Value, Value) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Server-call hooks handed to a transport at creation.
#[derive(Clone)]
pub struct TransportHooks {
    pub on_connect: ConnectHook,
    pub on_produce: ProduceHook,
}

/// A mediasoup-style device: loads router capabilities once, then
/// builds transports.
#[async_trait]
pub trait MediaDevice: Send + Sync {
    async fn load(&self, router_rtp_capabilities: &Value) -> Result<()>;

    fn loaded(&self) -> bool;

    /// The client RTP capabilities, valid after [`load`](Self::load).
    fn rtp_capabilities(&self) -> Value;

    fn can_produce(&self, kind: MediaKind) -> bool;

    async fn create_send_transport(
        &self,
        params: &TransportParams,
        hooks: TransportHooks,
    ) -> Result<Arc<dyn MediaTransport>>;

    async fn create_recv_transport(
        &self,
        params: &TransportParams,
        hooks: TransportHooks,
    ) -> Result<Arc<dyn MediaTransport>>;
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> String;

    /// Send-side only: start producing the given local track.
    async fn produce(&self, track: LocalTrack, app_data: Value) -> Result<Arc<dyn MediaProducer>>;

    /// Receive-side only: start consuming a remote producer.
    async fn consume(&self, notice: &ConsumerNotice) -> Result<Arc<dyn MediaConsumer>>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    async fn close(&self);
}

#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> String;
    fn producer_id(&self) -> String;
    fn kind(&self) -> MediaKind;
    /// The decoded remote media surfaced to the application.
    fn media(&self) -> RemoteMedia;
    async fn close(&self);
}
