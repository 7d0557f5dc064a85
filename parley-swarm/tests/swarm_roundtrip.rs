//! End-to-end swarm behavior against a loopback signaling relay.
//!
//! The relay implements just enough of the hub protocol: a `peers`
//! snapshot on join, `add-peer`/`remove-peer` deltas, direct routing by
//! the `p` field, `all` broadcasts, and topic delivery filtered by each
//! client's subscriptions (from the `subs` query and `{s}` frames).

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use nanoid::nanoid;
use parking_lot::Mutex;
use parley_proto::{
    ConnId, HubFrame, MediaKind, PeerId, SignalBody, SignalPayload,
};
use parley_swarm::{
    ConnectState, IceConfig, LocalTrack, PeerTransport, PeerTransportFactory, RemoteSource,
    SwarmEvent, SwarmOptions, Swarm, TransportEvent, TransportEventTx, TransportHandle,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

struct ClientEntry {
    tx: mpsc::UnboundedSender<String>,
    subs: HashSet<String>,
}

type Clients = Arc<Mutex<HashMap<String, ClientEntry>>>;

#[derive(Clone, Copy, Default)]
struct RelayOpts {
    /// Deliver the join snapshot twice, like a snapshot racing its own
    /// add-peer delta.
    resend_snapshot: bool,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn send_to_others(clients: &Clients, sender: &str, frame: &HubFrame) {
    let Ok(text) = serde_json::to_string(frame) else {
        return;
    };
    for (_, entry) in clients.lock().iter().filter(|(id, _)| *id != sender) {
        entry.tx.send(text.clone()).ok();
    }
}

fn send_to_subscribers(clients: &Clients, sender: &str, topic: &str, frame: &HubFrame) {
    let Ok(text) = serde_json::to_string(frame) else {
        return;
    };
    for (_, entry) in clients
        .lock()
        .iter()
        .filter(|(id, entry)| *id != sender && entry.subs.contains(topic))
    {
        entry.tx.send(text.clone()).ok();
    }
}

async fn serve_client(stream: tokio::net::TcpStream, clients: Clients, opts: RelayOpts) {
    let client_id = Arc::new(Mutex::new(String::new()));
    let subscriptions = Arc::new(Mutex::new(HashSet::new()));
    let id_capture = Arc::clone(&client_id);
    let subs_capture = Arc::clone(&subscriptions);
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| {
        if let Some(query) = req.uri().query() {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                if key == "id" {
                    *id_capture.lock() = value.into_owned();
                } else if key == "subs" {
                    subs_capture
                        .lock()
                        .extend(value.split(',').map(str::to_string));
                }
            }
        }
        Ok(resp)
    })
    .await
    else {
        return;
    };
    let client_id = client_id.lock().clone();
    let subs = std::mem::take(&mut *subscriptions.lock());
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let all_ids: Vec<String> = {
        let mut map = clients.lock();
        map.insert(
            client_id.clone(),
            ClientEntry {
                tx: tx.clone(),
                subs,
            },
        );
        map.keys().cloned().collect()
    };
    let snapshot = serde_json::to_string(&HubFrame::broadcast("peers", json!(all_ids))).unwrap();
    tx.send(snapshot.clone()).ok();
    if opts.resend_snapshot {
        tx.send(snapshot).ok();
    }
    send_to_others(
        &clients,
        &client_id,
        &HubFrame::broadcast("add-peer", json!(client_id)),
    );

    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else { continue };
        let Ok(mut frame) = serde_json::from_str::<HubFrame>(text.as_str()) else {
            continue;
        };
        if let Some(topic) = frame.s.take() {
            if let Some(entry) = clients.lock().get_mut(&client_id) {
                entry.subs.insert(topic);
            }
            continue;
        }
        if let Some(target) = frame.p.take() {
            frame.p = Some(client_id.clone());
            if let (Some(tx), Ok(text)) = (
                clients.lock().get(&target).map(|e| e.tx.clone()),
                serde_json::to_string(&frame),
            ) {
                tx.send(text).ok();
            }
        } else if frame.t.as_deref() == Some("all") {
            frame.p = Some(client_id.clone());
            send_to_others(&clients, &client_id, &frame);
        } else if let Some(topic) = frame.t.clone() {
            // Server-style topic push, delivered only to subscribers.
            send_to_subscribers(&clients, &client_id, &topic, &frame);
        }
    }

    clients.lock().remove(&client_id);
    send_to_others(
        &clients,
        &client_id,
        &HubFrame::broadcast("remove-peer", json!(client_id)),
    );
}

async fn start_relay() -> SocketAddr {
    start_relay_with(RelayOpts::default()).await
}

async fn start_relay_with(opts: RelayOpts) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let clients: Clients = Arc::default();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve_client(stream, Arc::clone(&clients), opts));
        }
    });
    addr
}

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    /// Offer/answer succeeds and both sides report connected.
    Handshake,
    /// Signals flow but the connection never comes up.
    NeverConnect,
}

struct MockTransport {
    id: String,
    initiator: bool,
    mode: Mode,
    garbage: AtomicBool,
    handle: TransportHandle,
    events: TransportEventTx,
    tracks: Mutex<HashMap<String, String>>,
}

impl MockTransport {
    fn emit(&self, event: TransportEvent) {
        if !self.garbage.load(Ordering::Acquire) {
            let _ = self.events.send((self.handle.clone(), event));
        }
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn initiator(&self) -> bool {
        self.initiator
    }

    fn mark_garbage(&self) {
        self.garbage.store(true, Ordering::Release);
    }

    fn is_garbage(&self) -> bool {
        self.garbage.load(Ordering::Acquire)
    }

    async fn start(&self) -> parley_swarm::Result<()> {
        if self.initiator {
            self.emit(TransportEvent::Signal(SignalPayload::new(
                SignalBody::Offer {
                    sdp: format!("offer-from-{}", self.id),
                },
            )));
        }
        Ok(())
    }

    async fn apply(&self, body: SignalBody) -> parley_swarm::Result<()> {
        if self.is_garbage() || self.mode == Mode::NeverConnect {
            return Ok(());
        }
        match body {
            SignalBody::Offer { .. } => {
                self.emit(TransportEvent::Signal(SignalPayload::new(
                    SignalBody::Answer {
                        sdp: format!("answer-from-{}", self.id),
                    },
                )));
                self.emit(TransportEvent::Connected);
            }
            SignalBody::Answer { .. } => self.emit(TransportEvent::Connected),
            _ => {}
        }
        Ok(())
    }

    async fn set_track(&self, name: &str, track: Option<LocalTrack>) -> parley_swarm::Result<()> {
        let mut tracks = self.tracks.lock();
        match track {
            Some(_) => {
                tracks.insert(name.to_string(), format!("stream-{name}"));
            }
            None => {
                tracks.remove(name);
            }
        }
        Ok(())
    }

    fn attached_tracks(&self) -> Vec<(String, String)> {
        self.tracks
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    async fn send_data(&self, _data: Bytes) -> parley_swarm::Result<()> {
        Ok(())
    }

    async fn close(&self) {
        self.mark_garbage();
    }
}

#[derive(Default)]
struct Created {
    initiator: bool,
}

struct MockFactory {
    mode: Mode,
    created: Mutex<Vec<Created>>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            created: Mutex::new(Vec::new()),
            transports: Mutex::new(Vec::new()),
        })
    }

    fn created_initiators(&self) -> Vec<bool> {
        self.created.lock().iter().map(|c| c.initiator).collect()
    }

    fn transport(&self, index: usize) -> Arc<MockTransport> {
        Arc::clone(&self.transports.lock()[index])
    }
}

#[async_trait]
impl PeerTransportFactory for MockFactory {
    async fn create(
        &self,
        peer_id: &PeerId,
        conn_id: &ConnId,
        initiator: bool,
        _ice: &IceConfig,
        local_tracks: &[(String, LocalTrack)],
        events: TransportEventTx,
    ) -> parley_swarm::Result<Arc<dyn PeerTransport>> {
        self.created.lock().push(Created { initiator });
        let id = nanoid!(12);
        let transport = Arc::new(MockTransport {
            handle: TransportHandle {
                peer_id: peer_id.clone(),
                conn_id: conn_id.clone(),
                transport_id: id.clone(),
            },
            id,
            initiator,
            mode: self.mode,
            garbage: AtomicBool::new(false),
            events,
            tracks: Mutex::new(
                local_tracks
                    .iter()
                    .map(|(name, _)| (name.clone(), format!("stream-{name}")))
                    .collect(),
            ),
        });
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

struct FakeRemote {
    msid: &'static str,
}

impl RemoteSource for FakeRemote {
    fn media_kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn msid(&self) -> String {
        self.msid.to_string()
    }
}

fn options(peer: &str, url: &str) -> SwarmOptions {
    SwarmOptions {
        url: Some(url.to_string()),
        my_peer_id: Some(PeerId::from(peer)),
        ..Default::default()
    }
}

async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<SwarmEvent>,
    mut pred: impl FnMut(&SwarmEvent) -> bool,
) -> SwarmEvent {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn two_swarms_handshake_with_exactly_one_initiator() {
    init_tracing();
    let addr = start_relay().await;
    let url = format!("ws://{addr}/rooms");

    let factory_a = MockFactory::new(Mode::Handshake);
    let swarm_a = Swarm::with_factory(options("alice", &url), factory_a.clone());
    let mut events_a = swarm_a.subscribe();
    swarm_a.connect(Some("lobby")).await.unwrap();
    assert_eq!(swarm_a.connect_state(), ConnectState::Connected);

    let factory_b = MockFactory::new(Mode::Handshake);
    let swarm_b = Swarm::with_factory(options("bob", &url), factory_b.clone());
    let mut events_b = swarm_b.subscribe();
    swarm_b.connect(Some("lobby")).await.unwrap();

    wait_for(&mut events_a, |e| {
        matches!(e, SwarmEvent::PeerConnected { peer_id, .. } if peer_id.as_str() == "bob")
    })
    .await;
    wait_for(&mut events_b, |e| {
        matches!(e, SwarmEvent::PeerConnected { peer_id, .. } if peer_id.as_str() == "alice")
    })
    .await;

    // Exactly one side initiated, and neither created a duplicate handle.
    let a = factory_a.created_initiators();
    let b = factory_b.created_initiators();
    assert_eq!(a.len(), 1, "alice created {} transports", a.len());
    assert_eq!(b.len(), 1, "bob created {} transports", b.len());
    assert_ne!(a[0], b[0]);
    // "bob" > "alice", so bob is the active side.
    assert!(b[0]);

    assert!(swarm_a.peer_ids().contains(&PeerId::from("bob")));
    assert!(swarm_b.peer_ids().contains(&PeerId::from("alice")));
}

#[tokio::test]
async fn shared_state_reaches_the_other_side() {
    init_tracing();
    let addr = start_relay().await;
    let url = format!("ws://{addr}/rooms");

    let swarm_a = Swarm::with_factory(options("alice", &url), MockFactory::new(Mode::Handshake));
    swarm_a
        .set_shared_state(json!({"inRoom": true, "micMuted": false}))
        .unwrap();
    swarm_a.connect(Some("lobby")).await.unwrap();

    let swarm_b = Swarm::with_factory(options("bob", &url), MockFactory::new(Mode::Handshake));
    let mut events_b = swarm_b.subscribe();
    swarm_b.connect(Some("lobby")).await.unwrap();

    let event = wait_for(&mut events_b, |e| {
        matches!(e, SwarmEvent::PeerState { peer_id, state: Some(_) } if peer_id.as_str() == "alice")
    })
    .await;
    let SwarmEvent::PeerState { state: Some(state), .. } = event else {
        unreachable!();
    };
    assert_eq!(state["inRoom"], true);
    assert_eq!(swarm_b.peer_state(&PeerId::from("alice")).unwrap()["micMuted"], false);
}

#[tokio::test]
async fn signal_for_a_stale_session_is_ignored() {
    init_tracing();
    let addr = start_relay().await;
    let url = format!("ws://{addr}/rooms");

    let factory_a = MockFactory::new(Mode::Handshake);
    let swarm_a = Swarm::with_factory(options("alice", &url), factory_a.clone());
    swarm_a.connect(Some("lobby")).await.unwrap();
    let alice_conn = swarm_a.my_conn_id().unwrap();

    // A raw client posing as another peer.
    let (mut ws, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/rooms/lobby?id=mallory%3Bc9"
    ))
    .await
    .unwrap();

    let direct = |your_conn_id: &str, first: bool| {
        serde_json::to_string(&HubFrame {
            t: Some("direct".to_string()),
            d: Some(json!({
                "type": "signal",
                "yourConnId": your_conn_id,
                "data": {"type": "offer", "sdp": "v=0", "from": "nonce-1", "first": first},
            })),
            p: Some(format!("alice;{alice_conn}")),
            r: None,
            s: None,
        })
        .unwrap()
    };

    // Addressed to a connection id alice never had: dropped without
    // creating a handle. Alice is the lesser pair against mallory, so
    // nothing else creates one either.
    ws.send(Message::Text(direct("bogus", true).into()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(factory_a.created_initiators().is_empty());

    // Correctly addressed first signal: alice creates her handle as
    // non-initiator.
    ws.send(Message::Text(direct(alice_conn.as_str(), true).into()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(factory_a.created_initiators(), vec![false]);
}

#[tokio::test(start_paused = true)]
async fn unreachable_peer_is_abandoned_past_the_fail_ceiling() {
    init_tracing();
    let addr = start_relay().await;
    let url = format!("ws://{addr}/rooms");

    let swarm_a = Swarm::with_factory(options("alice", &url), MockFactory::new(Mode::NeverConnect));
    let mut events_a = swarm_a.subscribe();
    swarm_a.connect(Some("lobby")).await.unwrap();

    let swarm_b = Swarm::with_factory(options("bob", &url), MockFactory::new(Mode::NeverConnect));
    swarm_b.connect(Some("lobby")).await.unwrap();

    // Attempts fail by timeout and retry until the failing streak
    // crosses the ceiling, then the connection is abandoned.
    wait_for(&mut events_a, |e| {
        matches!(e, SwarmEvent::ConnectionFailed { peer_id, .. } if peer_id.as_str() == "bob")
    })
    .await;
    wait_for(&mut events_a, |e| {
        matches!(e, SwarmEvent::PeerLeft { peer_id } if peer_id.as_str() == "bob")
    })
    .await;
    assert!(!swarm_a.peer_ids().contains(&PeerId::from("bob")));
}

#[tokio::test]
async fn replacement_track_keeps_one_stream_entry_per_key() {
    init_tracing();
    let addr = start_relay().await;
    let url = format!("ws://{addr}/rooms");

    let factory_a = MockFactory::new(Mode::Handshake);
    let swarm_a = Swarm::with_factory(options("alice", &url), factory_a.clone());
    let mut events_a = swarm_a.subscribe();
    swarm_a.connect(Some("lobby")).await.unwrap();

    let swarm_b = Swarm::with_factory(options("bob", &url), MockFactory::new(Mode::Handshake));
    swarm_b.connect(Some("lobby")).await.unwrap();

    wait_for(&mut events_a, |e| {
        matches!(e, SwarmEvent::PeerConnected { peer_id, .. } if peer_id.as_str() == "bob")
    })
    .await;

    // Renegotiation surfaces the same remote stream again; the old
    // entry must be replaced, not kept alongside the new one.
    let transport = factory_a.transport(0);
    transport.emit(TransportEvent::Track(Arc::new(FakeRemote { msid: "ms-1" })));
    transport.emit(TransportEvent::Track(Arc::new(FakeRemote { msid: "ms-1" })));
    wait_for(&mut events_a, |e| matches!(e, SwarmEvent::StreamAdded(_))).await;
    wait_for(&mut events_a, |e| matches!(e, SwarmEvent::StreamAdded(_))).await;

    let streams = swarm_a.remote_streams();
    assert_eq!(streams.len(), 1, "kept {} entries for one source", streams.len());
    assert_eq!(streams[0].peer_id.as_str(), "bob");
    assert_eq!(streams[0].source.msid(), "ms-1");
}

#[tokio::test]
async fn extra_topic_subscriptions_survive_a_reconnect() {
    init_tracing();
    let addr = start_relay().await;
    let url = format!("ws://{addr}/rooms");

    let swarm = Swarm::with_factory(options("alice", &url), MockFactory::new(Mode::Handshake));
    // Subscribed before any session exists; must ride along on connect.
    swarm.subscribe_topic("router-info").unwrap();
    let mut events = swarm.subscribe();
    swarm.connect(Some("lobby")).await.unwrap();

    // A raw client playing the media server.
    let (mut ws, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/rooms/lobby?id=srv%3Bc1"
    ))
    .await
    .unwrap();
    let push = serde_json::to_string(&HubFrame::broadcast(
        "router-info",
        json!({"rtpCapabilities": {}}),
    ))
    .unwrap();

    ws.send(Message::Text(push.clone().into())).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SwarmEvent::ServerEvent { topic, .. } if topic == "router-info")
    })
    .await;

    // A fresh session gets a fresh hub; the topic must be subscribed
    // again without anyone re-asking.
    swarm.disconnect();
    swarm.connect(Some("lobby")).await.unwrap();
    ws.send(Message::Text(push.into())).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SwarmEvent::ServerEvent { topic, .. } if topic == "router-info")
    })
    .await;
}

#[tokio::test]
async fn duplicate_membership_events_do_not_recreate_a_live_transport() {
    init_tracing();
    let addr = start_relay_with(RelayOpts {
        resend_snapshot: true,
    })
    .await;
    let url = format!("ws://{addr}/rooms");

    let factory_a = MockFactory::new(Mode::Handshake);
    let swarm_a = Swarm::with_factory(options("alice", &url), factory_a.clone());
    let mut events_a = swarm_a.subscribe();
    swarm_a.connect(Some("lobby")).await.unwrap();

    let factory_b = MockFactory::new(Mode::Handshake);
    let swarm_b = Swarm::with_factory(options("bob", &url), factory_b.clone());
    let mut events_b = swarm_b.subscribe();
    swarm_b.connect(Some("lobby")).await.unwrap();

    wait_for(&mut events_a, |e| {
        matches!(e, SwarmEvent::PeerConnected { peer_id, .. } if peer_id.as_str() == "bob")
    })
    .await;
    wait_for(&mut events_b, |e| {
        matches!(e, SwarmEvent::PeerConnected { peer_id, .. } if peer_id.as_str() == "alice")
    })
    .await;

    // Bob saw alice announced twice; the second sighting must not tear
    // down the attempt the first one started.
    assert_eq!(factory_b.created_initiators(), vec![true]);
    assert_eq!(factory_a.created_initiators(), vec![false]);
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out() {
    init_tracing();
    let addr = start_relay().await;
    let url = format!("ws://{addr}/rooms");

    let swarm = Swarm::with_factory(options("alice", &url), MockFactory::new(Mode::Handshake));
    swarm.connect(Some("lobby")).await.unwrap();

    // The relay never answers request frames.
    let err = swarm
        .request("mediasoup", json!({"type": "createWebRtcTransport"}))
        .await
        .unwrap_err();
    assert!(matches!(err, parley_swarm::Error::RequestTimeout(_)));
}
