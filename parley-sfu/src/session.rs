//! SFU session: drives the `mediasoup` control plane over the hub.
//!
//! The server announces the room router once per connection with a
//! `mediasoup-info` push and then streams `new-consumer` notices for
//! every remote producer this client should pick up. Everything we ask
//! of the server goes through `request("mediasoup", {type, data})`.
//!
//! Ordering is the tricky part: `new-consumer` can arrive before the
//! device is loaded or before the receive transport exists, so notices
//! are queued and drained once both are ready.

use crate::device::{MediaConsumer, MediaDevice, MediaProducer, MediaTransport, TransportHooks};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parley_proto::{
    ConnectTransportRequest, ConsumerNotice, CreateTransportRequest, MediaKind, ProduceRequest,
    ProduceResponse, RouterInfo, SfuRequest, TransportParams, SFU_TOPIC,
};
use parley_swarm::{ConnectState, LocalTrack, RemoteMedia, Swarm, SwarmEvent};
use parking_lot::Mutex as SyncMutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Server push carrying the router RTP capabilities.
pub const INFO_TOPIC: &str = "mediasoup-info";
/// Server push announcing a remote producer to consume.
pub const CONSUMER_TOPIC: &str = "new-consumer";

/// The slice of the signaling layer the SFU session needs. Implemented
/// by [`Swarm`]; mocked in tests.
#[async_trait]
pub trait SignalingClient: Send + Sync {
    async fn request(&self, topic: &str, data: Value) -> Result<Value>;
    fn respond(&self, request_id: &str, data: Value) -> Result<()>;
    /// Register interest in a push topic. Implementations keep the
    /// subscription across hub reconnects.
    fn subscribe(&self, topic: &str) -> Result<()>;
}

#[async_trait]
impl SignalingClient for Swarm {
    async fn request(&self, topic: &str, data: Value) -> Result<Value> {
        Ok(Swarm::request(self, topic, data).await?)
    }

    fn respond(&self, request_id: &str, data: Value) -> Result<()> {
        Ok(Swarm::respond(self, request_id, data)?)
    }

    fn subscribe(&self, topic: &str) -> Result<()> {
        Ok(Swarm::subscribe_topic(self, topic)?)
    }
}

/// What an SFU session reports to its subscribers.
#[derive(Clone)]
pub enum SfuEvent {
    /// The router capabilities arrived and the device finished loading.
    RouterReady,
    /// A remote producer is now being consumed.
    RemoteTrack {
        peer_id: String,
        conn_id: Option<String>,
        consumer_id: String,
        kind: MediaKind,
        media: RemoteMedia,
    },
}

impl std::fmt::Debug for SfuEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RouterReady => write!(f, "RouterReady"),
            Self::RemoteTrack {
                peer_id,
                conn_id,
                consumer_id,
                kind,
                ..
            } => f
                .debug_struct("RemoteTrack")
                .field("peer_id", peer_id)
                .field("conn_id", conn_id)
                .field("consumer_id", consumer_id)
                .field("kind", kind)
                .finish(),
        }
    }
}

/// One consumer slot per remote source: `(peer, conn, kind)`. A new
/// notice for an occupied slot replaces the consumer in it.
type ConsumerKey = (String, String, MediaKind);

fn consumer_key(notice: &ConsumerNotice) -> ConsumerKey {
    let (peer, conn) = notice.peer_parts();
    (
        peer.to_string(),
        conn.unwrap_or_default().to_string(),
        notice.kind,
    )
}

struct SessionState {
    router_capabilities: Option<Value>,
    send_transport: Option<Arc<dyn MediaTransport>>,
    recv_transport: Option<Arc<dyn MediaTransport>>,
    producer: Option<Arc<dyn MediaProducer>>,
    consumers: HashMap<ConsumerKey, Arc<dyn MediaConsumer>>,
    /// Notices that arrived before the device/recv transport was ready,
    /// with the request id to ack once consumed.
    pending_consumers: Vec<(ConsumerNotice, Option<String>)>,
    want_send: Option<LocalTrack>,
    receiving: bool,
    closed: bool,
}

/// One client's media session against the room SFU.
pub struct SfuSession {
    client: Arc<dyn SignalingClient>,
    device: Arc<dyn MediaDevice>,
    state: Mutex<SessionState>,
    subscribers: SyncMutex<Vec<mpsc::UnboundedSender<SfuEvent>>>,
}

impl SfuSession {
    /// Build a session and subscribe the hub to the SFU push topics.
    /// Subscription failures are logged, not fatal: the session can be
    /// created before the hub is connected.
    pub fn new(client: Arc<dyn SignalingClient>, device: Arc<dyn MediaDevice>) -> Arc<Self> {
        for topic in [INFO_TOPIC, CONSUMER_TOPIC] {
            if let Err(err) = client.subscribe(topic) {
                debug!(topic, %err, "sfu topic subscription deferred");
            }
        }
        Arc::new(Self {
            client,
            device,
            state: Mutex::new(SessionState {
                router_capabilities: None,
                send_transport: None,
                recv_transport: None,
                producer: None,
                consumers: HashMap::new(),
                pending_consumers: Vec::new(),
                want_send: None,
                receiving: false,
                closed: false,
            }),
            subscribers: SyncMutex::new(Vec::new()),
        })
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SfuEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn emit(&self, event: &SfuEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Spawn a task forwarding the swarm's server pushes into this
    /// session. Stops when the event stream ends or the session closes.
    pub fn drive(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<SwarmEvent>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if session.state.lock().await.closed {
                    break;
                }
                match event {
                    SwarmEvent::ServerEvent {
                        topic,
                        payload,
                        request_id,
                    } => {
                        if let Err(err) = session
                            .handle_server_event(&topic, payload, request_id.as_deref())
                            .await
                        {
                            warn!(topic, %err, "sfu server event failed");
                        }
                    }
                    SwarmEvent::ConnectState(
                        ConnectState::Disconnected | ConnectState::Initial,
                    ) => {
                        session.reset().await;
                    }
                    _ => {}
                }
            }
        });
    }

    /// Dispatch one server push. `request_id` is present when the
    /// server expects an ack (`new-consumer`).
    pub async fn handle_server_event(
        &self,
        topic: &str,
        payload: Value,
        request_id: Option<&str>,
    ) -> Result<()> {
        match topic {
            INFO_TOPIC => self.handle_router_info(payload).await,
            CONSUMER_TOPIC => {
                let notice: ConsumerNotice = serde_json::from_value(payload)?;
                self.handle_new_consumer(notice, request_id.map(str::to_string))
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn handle_router_info(&self, payload: Value) -> Result<()> {
        let info: RouterInfo = serde_json::from_value(payload)?;
        if !self.device.loaded() {
            self.device.load(&info.rtp_capabilities).await?;
        }
        {
            let mut state = self.state.lock().await;
            state.router_capabilities = Some(info.rtp_capabilities);
        }
        self.emit(&SfuEvent::RouterReady);
        self.sync().await
    }

    async fn handle_new_consumer(
        &self,
        notice: ConsumerNotice,
        request_id: Option<String>,
    ) -> Result<()> {
        let ready = {
            let state = self.state.lock().await;
            self.device.loaded() && state.recv_transport.is_some()
        };
        if ready {
            self.consume(notice, request_id).await
        } else {
            debug!(
                producer = %notice.producer_id,
                "consumer notice queued until media session is ready"
            );
            self.state
                .lock()
                .await
                .pending_consumers
                .push((notice, request_id));
            Ok(())
        }
    }

    /// Start (or replace) the outgoing track. Takes effect immediately
    /// when the router is known, otherwise when `mediasoup-info` lands.
    pub async fn set_send_track(&self, track: LocalTrack) -> Result<()> {
        if self.state.lock().await.producer.is_some() {
            // Replacing: tear the old producer down first.
            self.stop_sending().await?;
        }
        self.state.lock().await.want_send = Some(track);
        self.sync().await
    }

    /// Stop producing and tell the server to drop the producer.
    pub async fn stop_sending(&self) -> Result<()> {
        let producer = {
            let mut state = self.state.lock().await;
            state.want_send = None;
            state.producer.take()
        };
        let Some(producer) = producer else {
            return Ok(());
        };
        let req = SfuRequest::CloseProducer {
            producer_id: producer.id(),
        };
        self.client
            .request(SFU_TOPIC, serde_json::to_value(&req)?)
            .await?;
        producer.close().await;
        Ok(())
    }

    /// Opt in to receiving remote producers. Queued notices are drained
    /// once the receive transport exists.
    pub async fn enable_receiving(&self) -> Result<()> {
        self.state.lock().await.receiving = true;
        self.sync().await
    }

    /// Drop all negotiated media but keep the application's
    /// send/receive intent. Used when the hub drops; the next
    /// `mediasoup-info` rebuilds everything.
    pub async fn reset(&self) {
        let (send, recv, producer, consumers) = {
            let mut state = self.state.lock().await;
            state.router_capabilities = None;
            state.pending_consumers.clear();
            (
                state.send_transport.take(),
                state.recv_transport.take(),
                state.producer.take(),
                std::mem::take(&mut state.consumers),
            )
        };
        if let Some(producer) = producer {
            producer.close().await;
        }
        for consumer in consumers.into_values() {
            consumer.close().await;
        }
        if let Some(transport) = send {
            transport.close().await;
        }
        if let Some(transport) = recv {
            transport.close().await;
        }
    }

    pub async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.want_send = None;
            state.receiving = false;
        }
        self.reset().await;
    }

    /// Bring the transports and producer in line with what the
    /// application asked for. No-op until the router is known.
    async fn sync(&self) -> Result<()> {
        let (ready, want_send, receiving) = {
            let state = self.state.lock().await;
            (
                state.router_capabilities.is_some() && !state.closed,
                state.want_send.clone(),
                state.receiving,
            )
        };
        if !ready {
            return Ok(());
        }
        if let Some(track) = want_send {
            self.ensure_producing(track).await?;
        }
        if receiving {
            self.ensure_recv_transport().await?;
            self.drain_pending().await?;
        }
        Ok(())
    }

    async fn ensure_producing(&self, track: LocalTrack) -> Result<()> {
        if self.state.lock().await.producer.is_some() {
            return Ok(());
        }
        let transport = self.ensure_send_transport().await?;
        let producer = transport.produce(track, json!({})).await?;
        debug!(producer = %producer.id(), kind = %producer.kind(), "producing");
        let mut state = self.state.lock().await;
        if state.closed {
            drop(state);
            producer.close().await;
            return Ok(());
        }
        state.producer = Some(producer);
        Ok(())
    }

    async fn ensure_send_transport(&self) -> Result<Arc<dyn MediaTransport>> {
        if let Some(transport) = self.state.lock().await.send_transport.clone() {
            return Ok(transport);
        }
        let transport = self.create_transport(true, false).await?;
        self.state.lock().await.send_transport = Some(Arc::clone(&transport));
        Ok(transport)
    }

    async fn ensure_recv_transport(&self) -> Result<Arc<dyn MediaTransport>> {
        if let Some(transport) = self.state.lock().await.recv_transport.clone() {
            return Ok(transport);
        }
        let transport = self.create_transport(false, true).await?;
        self.state.lock().await.recv_transport = Some(Arc::clone(&transport));
        Ok(transport)
    }

    /// Ask the server for a transport, then build the device side with
    /// hooks that route its connect/produce events back over the hub.
    async fn create_transport(
        &self,
        producing: bool,
        consuming: bool,
    ) -> Result<Arc<dyn MediaTransport>> {
        let req = SfuRequest::CreateWebRtcTransport(CreateTransportRequest {
            producing,
            consuming,
            rtp_capabilities: self.device.rtp_capabilities(),
            force_tcp: None,
        });
        let reply = self
            .client
            .request(SFU_TOPIC, serde_json::to_value(&req)?)
            .await?;
        let params: TransportParams = serde_json::from_value(reply)
            .map_err(|err| Error::BadPayload(format!("createWebRtcTransport reply: {err}")))?;
        let hooks = self.hooks_for(params.id.clone());
        if producing {
            self.device.create_send_transport(&params, hooks).await
        } else {
            self.device.create_recv_transport(&params, hooks).await
        }
    }

    fn hooks_for(&self, transport_id: String) -> TransportHooks {
        let client = Arc::clone(&self.client);
        let connect_id = transport_id.clone();
        let on_connect = Arc::new(move |dtls_parameters: Value| {
            let client = Arc::clone(&client);
            let transport_id = connect_id.clone();
            Box::pin(async move {
                let req = SfuRequest::ConnectWebRtcTransport(ConnectTransportRequest {
                    transport_id,
                    dtls_parameters,
                });
                client
                    .request(SFU_TOPIC, serde_json::to_value(&req)?)
                    .await?;
                Ok(())
            }) as futures::future::BoxFuture<'static, Result<()>>
        });
        let client = Arc::clone(&self.client);
        let on_produce = Arc::new(move |kind: MediaKind, rtp_parameters: Value, app_data: Value| {
            let client = Arc::clone(&client);
            let transport_id = transport_id.clone();
            Box::pin(async move {
                let req = SfuRequest::Produce(ProduceRequest {
                    transport_id,
                    kind,
                    rtp_parameters,
                    app_data,
                });
                let reply = client
                    .request(SFU_TOPIC, serde_json::to_value(&req)?)
                    .await?;
                let produced: ProduceResponse = serde_json::from_value(reply)
                    .map_err(|err| Error::BadPayload(format!("produce reply: {err}")))?;
                Ok(produced.id)
            }) as futures::future::BoxFuture<'static, Result<String>>
        });
        TransportHooks {
            on_connect,
            on_produce,
        }
    }

    async fn drain_pending(&self) -> Result<()> {
        loop {
            let next = {
                let mut state = self.state.lock().await;
                if state.pending_consumers.is_empty() {
                    return Ok(());
                }
                state.pending_consumers.remove(0)
            };
            let (notice, request_id) = next;
            if let Err(err) = self.consume(notice, request_id).await {
                warn!(%err, "queued consumer failed");
            }
        }
    }

    async fn consume(&self, notice: ConsumerNotice, request_id: Option<String>) -> Result<()> {
        let transport = self
            .state
            .lock()
            .await
            .recv_transport
            .clone()
            .ok_or(Error::NotReady("no receive transport"))?;
        let consumer = transport.consume(&notice).await?;
        let media = consumer.media();
        let consumer_id = consumer.id();
        let displaced = {
            let mut state = self.state.lock().await;
            if state.closed {
                drop(state);
                consumer.close().await;
                return Ok(());
            }
            state.consumers.insert(consumer_key(&notice), consumer)
        };
        if let Some(old) = displaced {
            // The remote producer was swapped; the old consumer is dead
            // weight from here on.
            debug!(consumer = %old.id(), "replacing consumer for the same source");
            old.close().await;
        }
        if let Some(request_id) = request_id {
            if let Err(err) = self.client.respond(&request_id, json!({})) {
                warn!(%err, "consumer ack failed");
            }
        }
        let (peer, conn) = notice.peer_parts();
        self.emit(&SfuEvent::RemoteTrack {
            peer_id: peer.to_string(),
            conn_id: conn.map(str::to_string),
            consumer_id,
            kind: notice.kind,
            media,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MediaConsumer, MediaDevice, MediaProducer, MediaTransport};
    use parley_swarm::RemoteSource;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

    fn audio_track() -> LocalTrack {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "me".to_owned(),
        ))
    }

    #[derive(Default)]
    struct MockClient {
        requests: SyncMutex<Vec<Value>>,
        responses: SyncMutex<Vec<(String, Value)>>,
        subscriptions: SyncMutex<Vec<String>>,
        transport_seq: AtomicUsize,
        fail_requests: AtomicBool,
    }

    impl MockClient {
        fn request_types(&self) -> Vec<String> {
            self.requests
                .lock()
                .iter()
                .map(|v| v["type"].as_str().unwrap_or("?").to_string())
                .collect()
        }
    }

    #[async_trait]
    impl SignalingClient for MockClient {
        async fn request(&self, topic: &str, data: Value) -> Result<Value> {
            assert_eq!(topic, SFU_TOPIC);
            let kind = data["type"].as_str().unwrap_or("").to_string();
            self.requests.lock().push(data);
            if self.fail_requests.load(Ordering::SeqCst) {
                return Err(Error::Signaling(parley_swarm::Error::RequestTimeout(
                    SFU_TOPIC.to_string(),
                )));
            }
            Ok(match kind.as_str() {
                "createWebRtcTransport" => {
                    let n = self.transport_seq.fetch_add(1, Ordering::SeqCst);
                    json!({
                        "id": format!("t{n}"),
                        "iceParameters": {},
                        "iceCandidates": [],
                        "dtlsParameters": {},
                    })
                }
                "produce" => json!({"id": "prod1"}),
                _ => json!({}),
            })
        }

        fn respond(&self, request_id: &str, data: Value) -> Result<()> {
            self.responses.lock().push((request_id.to_string(), data));
            Ok(())
        }

        fn subscribe(&self, topic: &str) -> Result<()> {
            self.subscriptions.lock().push(topic.to_string());
            Ok(())
        }
    }

    struct MockDevice {
        loaded: AtomicBool,
        consumers_made: Arc<SyncMutex<Vec<Arc<MockConsumer>>>>,
    }

    #[async_trait]
    impl MediaDevice for MockDevice {
        async fn load(&self, _caps: &Value) -> Result<()> {
            self.loaded.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn loaded(&self) -> bool {
            self.loaded.load(Ordering::SeqCst)
        }

        fn rtp_capabilities(&self) -> Value {
            json!({"codecs": []})
        }

        fn can_produce(&self, _kind: MediaKind) -> bool {
            true
        }

        async fn create_send_transport(
            &self,
            params: &TransportParams,
            hooks: TransportHooks,
        ) -> Result<Arc<dyn MediaTransport>> {
            Ok(Arc::new(MockTransport {
                id: params.id.clone(),
                hooks,
                connected: AtomicBool::new(false),
                consumers_made: Arc::clone(&self.consumers_made),
            }))
        }

        async fn create_recv_transport(
            &self,
            params: &TransportParams,
            hooks: TransportHooks,
        ) -> Result<Arc<dyn MediaTransport>> {
            Ok(Arc::new(MockTransport {
                id: params.id.clone(),
                hooks,
                connected: AtomicBool::new(false),
                consumers_made: Arc::clone(&self.consumers_made),
            }))
        }
    }

    struct MockTransport {
        id: String,
        hooks: TransportHooks,
        connected: AtomicBool,
        consumers_made: Arc<SyncMutex<Vec<Arc<MockConsumer>>>>,
    }

    impl MockTransport {
        // Real client stacks fire `connect` on the first produce or
        // consume, once the DTLS parameters are known.
        async fn connect_once(&self) -> Result<()> {
            if !self.connected.swap(true, Ordering::SeqCst) {
                (self.hooks.on_connect)(json!({"role": "client"})).await?;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MediaTransport for MockTransport {
        fn id(&self) -> String {
            self.id.clone()
        }

        async fn produce(
            &self,
            _track: LocalTrack,
            app_data: Value,
        ) -> Result<Arc<dyn MediaProducer>> {
            self.connect_once().await?;
            let id = (self.hooks.on_produce)(MediaKind::Audio, json!({"codecs": []}), app_data)
                .await?;
            Ok(Arc::new(MockProducer {
                id,
                closed: AtomicBool::new(false),
            }))
        }

        async fn consume(&self, notice: &ConsumerNotice) -> Result<Arc<dyn MediaConsumer>> {
            self.connect_once().await?;
            let consumer = Arc::new(MockConsumer {
                id: notice.id.clone(),
                producer_id: notice.producer_id.clone(),
                kind: notice.kind,
                closed: AtomicBool::new(false),
            });
            self.consumers_made.lock().push(Arc::clone(&consumer));
            Ok(consumer)
        }

        async fn close(&self) {}
    }

    struct MockProducer {
        id: String,
        closed: AtomicBool,
    }

    #[async_trait]
    impl MediaProducer for MockProducer {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn kind(&self) -> MediaKind {
            MediaKind::Audio
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct MockConsumer {
        id: String,
        producer_id: String,
        kind: MediaKind,
        closed: AtomicBool,
    }

    struct FakeMedia;

    impl RemoteSource for FakeMedia {
        fn media_kind(&self) -> MediaKind {
            MediaKind::Audio
        }

        fn msid(&self) -> String {
            "remote".to_string()
        }
    }

    #[async_trait]
    impl MediaConsumer for MockConsumer {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn producer_id(&self) -> String {
            self.producer_id.clone()
        }

        fn kind(&self) -> MediaKind {
            self.kind
        }

        fn media(&self) -> RemoteMedia {
            Arc::new(FakeMedia)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn session() -> (Arc<SfuSession>, Arc<MockClient>, Arc<MockDevice>) {
        let client = Arc::new(MockClient::default());
        let device = Arc::new(MockDevice {
            loaded: AtomicBool::new(false),
            consumers_made: Arc::new(SyncMutex::new(Vec::new())),
        });
        let session = SfuSession::new(
            Arc::clone(&client) as Arc<dyn SignalingClient>,
            Arc::clone(&device) as Arc<dyn MediaDevice>,
        );
        (session, client, device)
    }

    fn router_info() -> Value {
        json!({"rtpCapabilities": {"codecs": []}})
    }

    #[tokio::test]
    async fn send_flow_runs_the_full_request_sequence() {
        let (session, client, _device) = session();
        session.set_send_track(audio_track()).await.unwrap();
        assert!(client.requests.lock().is_empty());

        session
            .handle_server_event(INFO_TOPIC, router_info(), None)
            .await
            .unwrap();

        assert_eq!(
            client.request_types(),
            vec!["createWebRtcTransport", "connectWebRtcTransport", "produce"]
        );
        let produce = client.requests.lock().last().cloned().unwrap();
        assert_eq!(produce["data"]["transportId"], "t0");
        assert_eq!(produce["data"]["kind"], "audio");
    }

    #[tokio::test]
    async fn early_consumer_notice_is_queued_then_acked() {
        let (session, client, _device) = session();
        let mut events = session.subscribe();
        session.enable_receiving().await.unwrap();

        let notice = json!({
            "peerId": "pk9.c3",
            "producerId": "p1",
            "id": "cons1",
            "kind": "audio",
            "rtpParameters": {},
        });
        session
            .handle_server_event(CONSUMER_TOPIC, notice, Some("req-7"))
            .await
            .unwrap();
        assert!(client.responses.lock().is_empty());

        session
            .handle_server_event(INFO_TOPIC, router_info(), None)
            .await
            .unwrap();

        assert_eq!(client.responses.lock()[0].0, "req-7");
        let mut saw_track = false;
        while let Ok(event) = events.try_recv() {
            if let SfuEvent::RemoteTrack {
                peer_id,
                conn_id,
                consumer_id,
                ..
            } = event
            {
                assert_eq!(peer_id, "pk9");
                assert_eq!(conn_id.as_deref(), Some("c3"));
                assert_eq!(consumer_id, "cons1");
                saw_track = true;
            }
        }
        assert!(saw_track);
        let key = ("pk9".to_string(), "c3".to_string(), MediaKind::Audio);
        assert!(session.state.lock().await.consumers.contains_key(&key));
    }

    #[tokio::test]
    async fn stop_sending_closes_the_producer_on_the_server() {
        let (session, client, _device) = session();
        session.set_send_track(audio_track()).await.unwrap();
        session
            .handle_server_event(INFO_TOPIC, router_info(), None)
            .await
            .unwrap();

        session.stop_sending().await.unwrap();

        let last = client.requests.lock().last().cloned().unwrap();
        assert_eq!(last["type"], "closeProducer");
        assert_eq!(last["data"]["producerId"], "prod1");
        assert!(session.state.lock().await.producer.is_none());
    }

    #[tokio::test]
    async fn session_subscribes_to_push_topics() {
        let (_session, client, _device) = session();
        assert_eq!(
            *client.subscriptions.lock(),
            vec![INFO_TOPIC.to_string(), CONSUMER_TOPIC.to_string()]
        );
    }

    #[tokio::test]
    async fn failed_transport_request_leaves_the_session_retryable() {
        let (session, client, _device) = session();
        session.set_send_track(audio_track()).await.unwrap();

        client.fail_requests.store(true, Ordering::SeqCst);
        assert!(session
            .handle_server_event(INFO_TOPIC, router_info(), None)
            .await
            .is_err());
        assert!(session.state.lock().await.send_transport.is_none());

        // The server re-pushes the router info; this time it works.
        client.fail_requests.store(false, Ordering::SeqCst);
        session
            .handle_server_event(INFO_TOPIC, router_info(), None)
            .await
            .unwrap();
        assert!(session.state.lock().await.producer.is_some());
    }

    #[tokio::test]
    async fn ready_session_consumes_immediately() {
        let (session, client, _device) = session();
        session.enable_receiving().await.unwrap();
        session
            .handle_server_event(INFO_TOPIC, router_info(), None)
            .await
            .unwrap();

        let notice = json!({
            "peerId": "pk2",
            "producerId": "p2",
            "id": "cons2",
            "kind": "audio",
            "rtpParameters": {},
        });
        session
            .handle_server_event(CONSUMER_TOPIC, notice, Some("req-1"))
            .await
            .unwrap();

        assert_eq!(client.responses.lock()[0].0, "req-1");
        assert!(session.state.lock().await.pending_consumers.is_empty());
    }

    #[tokio::test]
    async fn repeated_notice_for_a_source_replaces_its_consumer() {
        let (session, _client, device) = session();
        session.enable_receiving().await.unwrap();
        session
            .handle_server_event(INFO_TOPIC, router_info(), None)
            .await
            .unwrap();

        // The remote side swapped its producer: same peer and kind,
        // new producer and consumer ids.
        for (producer, id) in [("p1", "cons1"), ("p1b", "cons1b")] {
            let notice = json!({
                "peerId": "pk2.c1",
                "producerId": producer,
                "id": id,
                "kind": "audio",
                "rtpParameters": {},
            });
            session
                .handle_server_event(CONSUMER_TOPIC, notice, None)
                .await
                .unwrap();
        }

        {
            let state = session.state.lock().await;
            assert_eq!(state.consumers.len(), 1);
            let key = ("pk2".to_string(), "c1".to_string(), MediaKind::Audio);
            assert_eq!(state.consumers[&key].id(), "cons1b");
        }
        let made = device.consumers_made.lock();
        assert!(made[0].closed.load(Ordering::SeqCst));
        assert!(!made[1].closed.load(Ordering::SeqCst));
    }
}
