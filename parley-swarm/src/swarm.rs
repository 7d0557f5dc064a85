//! The swarm: one room's worth of peer connections and shared state.
//!
//! A `Swarm` joins a room through the signaling hub, connects to every
//! announced peer, keeps per-peer reduced state, and reconnects the hub
//! when it drops. All mutable state lives behind one lock inside
//! [`SwarmInner`]; the hub reader, transport event pump, health check
//! and timeout handlers all funnel through it.

use crate::config::SwarmOptions;
use crate::error::{Error, Result};
use crate::events::{ConnectState, EventHub, RemoteStream, SwarmEvent};
use crate::hub::{HubConfig, HubEvent, SignalingHub, REQUEST_TIMEOUT};
use crate::peer::{self, Connection, ConnectTimeouts};
use crate::reducer::{MostRecentWins, ReducePolicy, StateStore};
use crate::rtc::RtcTransportFactory;
use crate::transport::{LocalTrack, PeerTransport, PeerTransportFactory, TransportEventTx};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use parking_lot::Mutex;
use parley_proto::{
    CombinedId, ConnId, DirectPayload, PeerEventMessage, PeerId, SharedStateMessage, TimedState,
    TOPIC_ALL, TOPIC_SERVER,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval of the hub health check.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) type ConnectionKey = (PeerId, ConnId);

pub(crate) struct SwarmState {
    pub connect: ConnectState,
    /// Bumped on every (re)connect; tasks of an older session bail out.
    pub epoch: u64,
    pub room: Option<String>,
    pub my_conn_id: Option<ConnId>,
    pub hub: Option<SignalingHub>,
    pub peers: HashMap<PeerId, HashMap<ConnId, Connection>>,
    pub store: StateStore,
    /// Our own shared state, broadcast and piggybacked on signals.
    pub my_state: Option<TimedState>,
    pub local_tracks: HashMap<String, LocalTrack>,
    pub remote_streams: Vec<RemoteStream>,
    pub identity_tasks: HashMap<PeerId, CancellationToken>,
    /// Topics subscribed beyond the defaults. Survives teardown so
    /// every new hub session re-subscribes them.
    pub extra_subscriptions: Vec<String>,
}

impl Default for SwarmState {
    fn default() -> Self {
        Self {
            connect: ConnectState::Initial,
            epoch: 0,
            room: None,
            my_conn_id: None,
            hub: None,
            peers: HashMap::new(),
            store: StateStore::new(),
            my_state: None,
            local_tracks: HashMap::new(),
            remote_streams: Vec::new(),
            identity_tasks: HashMap::new(),
            extra_subscriptions: Vec::new(),
        }
    }
}

impl SwarmState {
    pub(crate) fn connection_mut(
        &mut self,
        peer_id: &PeerId,
        conn_id: &ConnId,
    ) -> Option<&mut Connection> {
        self.peers
            .get_mut(peer_id)
            .and_then(|conns| conns.get_mut(conn_id))
    }

    /// Track the pair; returns whether the peer itself is new.
    pub(crate) fn ensure_connection(&mut self, peer_id: &PeerId, conn_id: &ConnId) -> bool {
        let new_peer = !self.peers.contains_key(peer_id);
        self.peers
            .entry(peer_id.clone())
            .or_default()
            .entry(conn_id.clone())
            .or_default();
        new_peer
    }
}

pub(crate) struct SwarmInner {
    pub(crate) opts: Mutex<SwarmOptions>,
    pub(crate) state: Mutex<SwarmState>,
    pub(crate) events: EventHub,
    pub(crate) timeouts: ConnectTimeouts,
    pub(crate) factory: Arc<dyn PeerTransportFactory>,
    pub(crate) transport_tx: TransportEventTx,
}

impl SwarmInner {
    pub(crate) fn policy(&self) -> ReducePolicy {
        self.opts
            .lock()
            .reduce
            .clone()
            .unwrap_or_else(|| Arc::new(MostRecentWins))
    }
}

/// Handle to a running swarm. Cheap to clone; the swarm's background
/// tasks stop when the last handle is dropped.
#[derive(Clone)]
pub struct Swarm {
    inner: Arc<SwarmInner>,
}

impl Swarm {
    /// Build a swarm using real WebRTC transports. Must be called
    /// inside a tokio runtime.
    pub fn new(opts: SwarmOptions) -> Self {
        Self::with_factory(opts, Arc::new(RtcTransportFactory))
    }

    /// Build a swarm with a custom transport factory.
    pub fn with_factory(opts: SwarmOptions, factory: Arc<dyn PeerTransportFactory>) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SwarmInner {
            opts: Mutex::new(opts),
            state: Mutex::new(SwarmState::default()),
            events: EventHub::new(),
            timeouts: ConnectTimeouts::new(),
            factory,
            transport_tx,
        });
        spawn_transport_pump(&inner, transport_rx);
        spawn_health_loop(&inner);
        Self { inner }
    }

    /// Merge new options over the current configuration.
    pub fn configure(&self, patch: SwarmOptions) {
        self.inner.opts.lock().merge(patch);
    }

    /// Subscribe to swarm events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SwarmEvent> {
        self.inner.events.subscribe()
    }

    /// Join `room` (or the configured room). Idempotent while a healthy
    /// session to the same room exists; otherwise tears the old session
    /// down and starts over with a fresh connection id.
    pub async fn connect(&self, room: Option<&str>) -> Result<()> {
        connect_internal(&self.inner, room.map(str::to_string)).await
    }

    /// Leave the room and go quiet. The health check will not reconnect
    /// until the next explicit [`connect`](Self::connect).
    pub fn disconnect(&self) {
        let old = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            state.connect = ConnectState::Initial;
            state.my_conn_id = None;
            teardown(&mut state)
        };
        self.inner.timeouts.cancel_all();
        close_all(old);
        self.inner
            .events
            .emit(&SwarmEvent::ConnectState(ConnectState::Initial));
        info!("disconnected from room");
    }

    pub fn connect_state(&self) -> ConnectState {
        self.inner.state.lock().connect
    }

    pub fn my_conn_id(&self) -> Option<ConnId> {
        self.inner.state.lock().my_conn_id.clone()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.inner.state.lock().peers.keys().cloned().collect()
    }

    pub fn remote_streams(&self) -> Vec<RemoteStream> {
        self.inner.state.lock().remote_streams.clone()
    }

    /// Reduced state of a peer, if any of its connections shared one.
    pub fn peer_state(&self, peer_id: &PeerId) -> Option<Value> {
        self.inner.state.lock().store.reduced(peer_id).cloned()
    }

    /// Publish our shared state to the room and remember it for
    /// piggybacking on future signals.
    pub fn set_shared_state(&self, value: Value) -> Result<()> {
        let stamped = TimedState {
            state: value,
            time: now_millis(),
        };
        let hub = {
            let mut state = self.inner.state.lock();
            state.my_state = Some(stamped.clone());
            state.hub.clone()
        };
        if let Some(hub) = hub {
            if !hub.is_closed() {
                let msg = SharedStateMessage::new(stamped);
                hub.broadcast(TOPIC_ALL, serde_json::to_value(&msg)?)?;
            }
        }
        Ok(())
    }

    /// Send our current shared state directly to every connection of
    /// one peer. No-op when we have no state yet.
    pub fn share_state_with_peer(&self, peer_id: &PeerId) -> Result<()> {
        let (hub, my_state, conns) = {
            let state = self.inner.state.lock();
            let hub = state.hub.clone().ok_or(Error::HubNotConnected)?;
            let conns: Vec<ConnId> = state
                .peers
                .get(peer_id)
                .map(|c| c.keys().cloned().collect())
                .unwrap_or_default();
            (hub, state.my_state.clone(), conns)
        };
        let Some(stamped) = my_state else {
            return Ok(());
        };
        if conns.is_empty() {
            return Err(Error::UnknownPeer(peer_id.to_string()));
        }
        let value = serde_json::to_value(&SharedStateMessage::new(stamped))?;
        for conn_id in conns {
            let to = CombinedId::new(peer_id.clone(), conn_id);
            hub.send_direct(&to, value.clone())?;
        }
        Ok(())
    }

    /// Broadcast an application-level event to the room.
    pub fn send_peer_event(&self, event: &str, payload: Value) -> Result<()> {
        let hub = self
            .inner
            .state
            .lock()
            .hub
            .clone()
            .ok_or(Error::HubNotConnected)?;
        let msg = PeerEventMessage::new(event, payload);
        hub.broadcast(TOPIC_ALL, serde_json::to_value(&msg)?)
    }

    /// Send bytes over the data channels of every live connection of a
    /// peer.
    pub async fn send_data(&self, peer_id: &PeerId, data: Bytes) -> Result<()> {
        let transports: Vec<Arc<dyn PeerTransport>> = {
            let state = self.inner.state.lock();
            state
                .peers
                .get(peer_id)
                .map(|conns| {
                    conns
                        .values()
                        .filter(|c| c.connected)
                        .filter_map(|c| c.transport.clone())
                        .filter(|t| !t.is_garbage())
                        .collect()
                })
                .unwrap_or_default()
        };
        if transports.is_empty() {
            return Err(Error::UnknownPeer(peer_id.to_string()));
        }
        let mut sent = false;
        for transport in transports {
            match transport.send_data(data.clone()).await {
                Ok(()) => sent = true,
                Err(err) => warn!(peer_id = %peer_id, error = %err, "data send failed"),
            }
        }
        if sent {
            Ok(())
        } else {
            Err(Error::Transport("no open data channel".to_string()))
        }
    }

    /// Attach (or replace) a named local media track on every current
    /// and future peer connection.
    pub async fn add_local_stream(&self, name: &str, track: LocalTrack) -> Result<()> {
        let transports = {
            let mut state = self.inner.state.lock();
            state
                .local_tracks
                .insert(name.to_string(), Arc::clone(&track));
            live_transports(&state)
        };
        for transport in transports {
            if let Err(err) = transport.set_track(name, Some(Arc::clone(&track))).await {
                warn!(name, error = %err, "failed to attach local track");
            }
        }
        Ok(())
    }

    /// Detach a named local track everywhere. Detaching a name that was
    /// never attached is a logged no-op.
    pub async fn remove_local_stream(&self, name: &str) -> Result<()> {
        let (was_attached, transports) = {
            let mut state = self.inner.state.lock();
            let was = state.local_tracks.remove(name).is_some();
            (was, live_transports(&state))
        };
        if !was_attached {
            debug!(name, "remove of unattached local stream ignored");
            return Ok(());
        }
        for transport in transports {
            if let Err(err) = transport.set_track(name, None).await {
                warn!(name, error = %err, "failed to detach local track");
            }
        }
        Ok(())
    }

    /// Request/response against the room backend over the hub.
    pub async fn request(&self, topic: &str, data: Value) -> Result<Value> {
        let hub = self
            .inner
            .state
            .lock()
            .hub
            .clone()
            .ok_or(Error::HubNotConnected)?;
        hub.send_request(topic, data, REQUEST_TIMEOUT).await
    }

    /// Answer a server-initiated request (e.g. a `new-consumer` ack).
    pub fn respond(&self, request_id: &str, data: Value) -> Result<()> {
        let hub = self
            .inner
            .state
            .lock()
            .hub
            .clone()
            .ok_or(Error::HubNotConnected)?;
        hub.respond(request_id, data)
    }

    /// Subscribe to an additional topic. Takes effect on the live hub
    /// session immediately and is carried into every future session,
    /// so pushes keep arriving after a reconnect.
    pub fn subscribe_topic(&self, topic: &str) -> Result<()> {
        let hub = {
            let mut state = self.inner.state.lock();
            if !state.extra_subscriptions.iter().any(|t| t == topic) {
                state.extra_subscriptions.push(topic.to_string());
            }
            state.hub.clone()
        };
        match hub {
            Some(hub) if !hub.is_closed() => hub.subscribe(topic),
            // No session yet; the subscription rides along on the next
            // connect.
            _ => Ok(()),
        }
    }
}

fn live_transports(state: &SwarmState) -> Vec<Arc<dyn PeerTransport>> {
    state
        .peers
        .values()
        .flat_map(HashMap::values)
        .filter_map(|c| c.transport.clone())
        .filter(|t| !t.is_garbage())
        .collect()
}

/// Close the hub and drop all per-session state. Returns the transports
/// so the caller can close them outside the lock.
fn teardown(state: &mut SwarmState) -> Vec<Arc<dyn PeerTransport>> {
    let mut old = Vec::new();
    if let Some(hub) = state.hub.take() {
        hub.close();
    }
    for (_, conns) in state.peers.drain() {
        for (_, conn) in conns {
            if let Some(transport) = conn.transport {
                transport.mark_garbage();
                old.push(transport);
            }
        }
    }
    state.store.clear();
    state.remote_streams.clear();
    for (_, token) in state.identity_tasks.drain() {
        token.cancel();
    }
    old
}

fn close_all(transports: Vec<Arc<dyn PeerTransport>>) {
    for transport in transports {
        tokio::spawn(async move { transport.close().await });
    }
}

pub(crate) async fn connect_internal(
    inner: &Arc<SwarmInner>,
    room_override: Option<String>,
) -> Result<()> {
    let (url, room, my_peer, token) = {
        let mut opts = inner.opts.lock();
        if let Some(room) = room_override {
            opts.room = Some(room);
        }
        let url = opts.url.clone().ok_or(Error::NotConfigured("url"))?;
        let room = opts.room.clone().ok_or(Error::NotConfigured("room"))?;
        let my_peer = opts
            .my_peer_id
            .clone()
            .ok_or(Error::NotConfigured("my_peer_id"))?;
        let token = match &opts.signer {
            Some(signer) => Some(encode_token(&signer.sign(&Value::Object(Default::default()))?)?),
            None => None,
        };
        (url, room, my_peer, token)
    };

    let (epoch, my_conn, extras, old) = {
        let mut state = inner.state.lock();
        match state.connect {
            ConnectState::Connecting => return Ok(()),
            ConnectState::Connected
                if state.room.as_deref() == Some(room.as_str())
                    && state.hub.as_ref().is_some_and(|h| !h.is_closed()) =>
            {
                return Ok(());
            }
            _ => {}
        }
        state.connect = ConnectState::Connecting;
        state.epoch += 1;
        state.room = Some(room.clone());
        let my_conn = ConnId::random();
        state.my_conn_id = Some(my_conn.clone());
        let old = teardown(&mut state);
        let extras = state.extra_subscriptions.clone();
        (state.epoch, my_conn, extras, old)
    };
    inner.timeouts.cancel_all();
    close_all(old);
    inner
        .events
        .emit(&SwarmEvent::ConnectState(ConnectState::Connecting));
    info!(room = %room, conn_id = %my_conn, "joining room");

    let mut subscriptions = vec![
        TOPIC_ALL.to_string(),
        my_peer.as_str().to_string(),
        TOPIC_SERVER.to_string(),
    ];
    for topic in extras {
        if !subscriptions.contains(&topic) {
            subscriptions.push(topic);
        }
    }
    let config = HubConfig {
        url,
        room,
        my_id: CombinedId::new(my_peer.clone(), my_conn),
        token,
        subscriptions,
    };
    match SignalingHub::connect(config).await {
        Ok((hub, events)) => {
            let my_state = {
                let mut state = inner.state.lock();
                if state.epoch != epoch {
                    hub.close();
                    return Ok(());
                }
                state.hub = Some(hub.clone());
                state.connect = ConnectState::Connected;
                state.my_state.clone()
            };
            inner
                .events
                .emit(&SwarmEvent::ConnectState(ConnectState::Connected));
            if let Some(stamped) = my_state {
                let msg = SharedStateMessage::new(stamped);
                if let Ok(value) = serde_json::to_value(&msg) {
                    let _ = hub.broadcast(TOPIC_ALL, value);
                }
            }
            tokio::spawn(run_session(Arc::clone(inner), epoch, events));
            Ok(())
        }
        Err(err) => {
            let stale = {
                let mut state = inner.state.lock();
                if state.epoch == epoch {
                    state.connect = ConnectState::Disconnected;
                    false
                } else {
                    true
                }
            };
            if !stale {
                inner
                    .events
                    .emit(&SwarmEvent::ConnectState(ConnectState::Disconnected));
            }
            Err(err)
        }
    }
}

async fn run_session(
    inner: Arc<SwarmInner>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<HubEvent>,
) {
    while let Some(event) = events.recv().await {
        if inner.state.lock().epoch != epoch {
            break;
        }
        match event {
            HubEvent::Peers(ids) => {
                debug!(count = ids.len(), "membership snapshot");
                for id in ids {
                    peer::connect_peer(&inner, &id.peer_id, &id.conn_id).await;
                }
            }
            HubEvent::AddPeer(id) => {
                peer::connect_peer(&inner, &id.peer_id, &id.conn_id).await;
            }
            HubEvent::RemovePeer(id) => {
                debug!(peer_id = %id.peer_id, conn_id = %id.conn_id, "peer left");
                peer::remove_connection(&inner, &id.peer_id, &id.conn_id);
            }
            HubEvent::Direct { from, data } => {
                handle_payload(&inner, from, data).await;
            }
            HubEvent::Broadcast { from, data } => {
                let Some(from) = from else { continue };
                let own = inner
                    .opts
                    .lock()
                    .my_peer_id
                    .as_ref()
                    .is_some_and(|me| *me == from.peer_id);
                if !own {
                    handle_payload(&inner, from, data).await;
                }
            }
            HubEvent::Topic {
                topic,
                data,
                request_id,
            } => {
                inner.events.emit(&SwarmEvent::ServerEvent {
                    topic,
                    payload: data,
                    request_id,
                });
            }
            HubEvent::Closed => {
                let lost = {
                    let mut state = inner.state.lock();
                    if state.epoch == epoch && state.connect == ConnectState::Connected {
                        state.connect = ConnectState::Disconnected;
                        true
                    } else {
                        false
                    }
                };
                if lost {
                    warn!("hub connection lost");
                    inner
                        .events
                        .emit(&SwarmEvent::ConnectState(ConnectState::Disconnected));
                }
                break;
            }
        }
    }
}

async fn handle_payload(inner: &Arc<SwarmInner>, from: CombinedId, data: Value) {
    match DirectPayload::classify(data) {
        DirectPayload::Signal(msg) => {
            peer::handle_signal(inner, &from, msg).await;
        }
        DirectPayload::SharedState(msg) => {
            let new_peer = inner
                .state
                .lock()
                .ensure_connection(&from.peer_id, &from.conn_id);
            if new_peer {
                on_new_peer(inner, &from.peer_id);
            }
            apply_connection_state(inner, &from.peer_id, &from.conn_id, msg.state);
        }
        DirectPayload::PeerEvent(msg) => {
            inner.events.emit(&SwarmEvent::PeerEvent {
                peer_id: from.peer_id,
                event: msg.event,
                payload: msg.payload,
            });
        }
        DirectPayload::Other(value) => {
            debug!(from = %from, payload = %value, "unrecognized peer message");
        }
    }
}

/// Verify, store and publish a connection's shared state.
pub(crate) fn apply_connection_state(
    inner: &Arc<SwarmInner>,
    peer_id: &PeerId,
    conn_id: &ConnId,
    stamped: TimedState,
) {
    if let Some(verifier) = inner.opts.lock().verifier.clone() {
        if !verifier.verify(&stamped.state, peer_id) {
            warn!(peer_id = %peer_id, "dropping state that failed verification");
            return;
        }
    }
    let policy = inner.policy();
    let reduced = inner
        .state
        .lock()
        .store
        .update(peer_id, conn_id, stamped.clone(), policy.as_ref());
    inner.events.emit(&SwarmEvent::ConnectionState {
        peer_id: peer_id.clone(),
        conn_id: conn_id.clone(),
        state: stamped.state,
    });
    inner.events.emit(&SwarmEvent::PeerState {
        peer_id: peer_id.clone(),
        state: Some(reduced),
    });
}

/// First sight of a peer: announce it and kick off the identity lookup.
pub(crate) fn on_new_peer(inner: &Arc<SwarmInner>, peer_id: &PeerId) {
    inner.events.emit(&SwarmEvent::NewPeer {
        peer_id: peer_id.clone(),
    });
    let Some(directory) = inner.opts.lock().identity.clone() else {
        return;
    };
    let token = CancellationToken::new();
    {
        let mut state = inner.state.lock();
        if !state.peers.contains_key(peer_id) || state.identity_tasks.contains_key(peer_id) {
            return;
        }
        state.identity_tasks.insert(peer_id.clone(), token.clone());
    }
    let weak = Arc::downgrade(inner);
    let peer_id = peer_id.clone();
    tokio::spawn(async move {
        let found = crate::identity::lookup(directory.as_ref(), &peer_id, &token).await;
        let Some(inner) = weak.upgrade() else { return };
        inner.state.lock().identity_tasks.remove(&peer_id);
        if let Some(identity) = found {
            inner.events.emit(&SwarmEvent::PeerIdentity {
                peer_id,
                identity,
            });
        }
    });
}

fn spawn_transport_pump(inner: &Arc<SwarmInner>, mut rx: crate::transport::TransportEventRx) {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        while let Some((handle, event)) = rx.recv().await {
            let Some(inner) = weak.upgrade() else { break };
            peer::handle_transport_event(&inner, handle, event).await;
        }
    });
}

/// Watch the hub and reconnect when it drops while we believe we are
/// connected.
fn spawn_health_loop(inner: &Arc<SwarmInner>) {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            let (reconnect, lost_now) = {
                let mut state = inner.state.lock();
                match state.connect {
                    ConnectState::Initial | ConnectState::Connecting => (false, false),
                    ConnectState::Connected => {
                        if state.hub.as_ref().is_none_or(SignalingHub::is_closed) {
                            state.connect = ConnectState::Disconnected;
                            (true, true)
                        } else {
                            (false, false)
                        }
                    }
                    ConnectState::Disconnected => (true, false),
                }
            };
            if lost_now {
                warn!("hub closed, reconnecting");
                inner
                    .events
                    .emit(&SwarmEvent::ConnectState(ConnectState::Disconnected));
            }
            if reconnect {
                if let Err(err) = connect_internal(&inner, None).await {
                    debug!(error = %err, "reconnect attempt failed");
                }
            }
        }
    });
}

fn encode_token(signed: &Value) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(signed)?))
}

pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
