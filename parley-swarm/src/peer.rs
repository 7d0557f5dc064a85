//! Peer connection lifecycle.
//!
//! For every `(peer, connection)` pair the swarm keeps at most one live
//! transport attempt. Which side initiates is decided without any
//! round-trip: the lexicographically greater `(peerId, connId)` pair
//! creates the offer, the lesser side sends a `you-start` handoff and
//! waits for the first signal before it creates its own handle. Each
//! attempt is watched by a coalescing timeout; failures retry until a
//! ceiling, then the connection is abandoned.

use crate::error::Result;
use crate::events::{RemoteStream, SwarmEvent};
use crate::swarm::{ConnectionKey, SwarmInner, SwarmState};
use crate::timeout::TimeoutRegistry;
use crate::transport::{PeerTransport, TransportEvent, TransportHandle};
use parley_proto::{
    CombinedId, ConnId, PeerId, SignalMessage, SignalMeta, SignalPayload,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Budget for an attempt to reach ICE-connected.
pub const MAX_CONNECT_TIME: Duration = Duration::from_millis(6000);
/// Shorter budget after an established connection loses ICE.
pub const MAX_CONNECT_TIME_AFTER_ICE_DISCONNECT: Duration = Duration::from_millis(2000);
/// Every accepted signal buys the attempt at least this much more time.
pub const MIN_MAX_CONNECT_TIME_AFTER_SIGNAL: Duration = Duration::from_millis(2000);
/// Total failing time after which a connection is abandoned instead of
/// retried.
pub const MAX_FAIL_TIME: Duration = Duration::from_millis(20_000);

/// Whether this connection currently has a transport handle, and how it
/// got there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStage {
    /// Tracked, but no transport exists.
    NoHandle,
    /// We sent `you-start` and wait for the remote's first signal,
    /// which is the only thing allowed to create our handle.
    AwaitingFirstSignal,
    HandleCreated,
}

/// Book-keeping for one remote connection.
pub(crate) struct Connection {
    pub stage: HandleStage,
    pub transport: Option<Arc<dyn PeerTransport>>,
    /// `from` nonce of the remote attempt we are negotiating with.
    pub remote_from: Option<String>,
    /// Whether our transport already emitted its first signal.
    pub sent_first: bool,
    /// Start of the current failing streak.
    pub fail_since: Option<Instant>,
    pub connected: bool,
    /// Remote stream id to logical name, from signal metadata.
    pub remote_stream_names: HashMap<String, String>,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            stage: HandleStage::NoHandle,
            transport: None,
            remote_from: None,
            sent_first: false,
            fail_since: None,
            connected: false,
            remote_stream_names: HashMap::new(),
        }
    }
}

/// Deterministic initiator election: the greater `(peerId, connId)`
/// pair creates the offer. Both sides evaluate this identically, so
/// exactly one of them is active.
pub(crate) fn i_am_active(
    my_peer: &PeerId,
    my_conn: &ConnId,
    peer: &PeerId,
    conn: &ConnId,
) -> bool {
    (my_peer, my_conn) > (peer, conn)
}

pub(crate) fn arm_connect_timeout(inner: &Arc<SwarmInner>, key: ConnectionKey, delay: Duration) {
    let weak = Arc::downgrade(inner);
    let handler_key = key.clone();
    inner.timeouts.schedule(key, delay, move |elapsed| {
        let Some(inner) = weak.upgrade() else { return };
        debug!(
            peer_id = %handler_key.0,
            conn_id = %handler_key.1,
            elapsed_ms = elapsed.as_millis() as u64,
            "connect timeout"
        );
        tokio::spawn(async move {
            handle_peer_fail(&inner, &handler_key.0, &handler_key.1, false).await;
        });
    });
}

/// Start (or restart) connecting to a remote connection.
pub(crate) async fn connect_peer(inner: &Arc<SwarmInner>, peer_id: &PeerId, conn_id: &ConnId) {
    let key = (peer_id.clone(), conn_id.clone());
    let my_peer = inner.opts.lock().my_peer_id.clone();
    let Some(my_peer) = my_peer else { return };

    enum Plan {
        Active,
        Passive(crate::hub::SignalingHub, serde_json::Value),
        Skip,
    }
    let (plan, new_peer) = {
        let mut state = inner.state.lock();
        let Some(hub) = state.hub.clone() else { return };
        if hub.is_closed() {
            return;
        }
        let Some(my_conn) = state.my_conn_id.clone() else { return };
        let new_peer = state.ensure_connection(peer_id, conn_id);
        let attempt_live = state.connection_mut(peer_id, conn_id).is_some_and(|conn| {
            conn.fail_since.is_none()
                && conn.transport.as_ref().is_some_and(|t| !t.is_garbage())
        });
        if attempt_live {
            // Duplicate membership events (a snapshot racing its own
            // add-peer delta) must not tear down a live attempt. Only
            // a pending failure warrants recreating the transport.
            (Plan::Skip, new_peer)
        } else if i_am_active(&my_peer, &my_conn, peer_id, conn_id) {
            (Plan::Active, new_peer)
        } else {
            let my_state = state.my_state.clone();
            if let Some(conn) = state.connection_mut(peer_id, conn_id) {
                if conn.transport.is_none() {
                    conn.stage = HandleStage::AwaitingFirstSignal;
                }
            }
            let msg = SignalMessage::new(SignalPayload::you_start(), conn_id.to_string(), my_state);
            match serde_json::to_value(&msg) {
                Ok(value) => (Plan::Passive(hub, value), new_peer),
                Err(err) => {
                    warn!(error = %err, "failed to serialize you-start");
                    return;
                }
            }
        }
    };
    if new_peer {
        crate::swarm::on_new_peer(inner, peer_id);
    }

    match plan {
        Plan::Skip => {
            debug!(peer_id = %peer_id, conn_id = %conn_id, "attempt already live, not recreating");
        }
        Plan::Active => {
            arm_connect_timeout(inner, key, MAX_CONNECT_TIME);
            debug!(peer_id = %peer_id, conn_id = %conn_id, "connecting as initiator");
            match create_transport(inner, peer_id, conn_id, true).await {
                Ok(transport) => {
                    if let Err(err) = transport.start().await {
                        warn!(peer_id = %peer_id, error = %err, "failed to start negotiation");
                    }
                }
                Err(err) => {
                    warn!(peer_id = %peer_id, error = %err, "failed to create transport");
                }
            }
        }
        Plan::Passive(hub, msg) => {
            arm_connect_timeout(inner, key, MAX_CONNECT_TIME);
            debug!(peer_id = %peer_id, conn_id = %conn_id, "sending you-start");
            let to = CombinedId::new(peer_id.clone(), conn_id.clone());
            if let Err(err) = hub.send_direct(&to, msg) {
                warn!(peer_id = %peer_id, error = %err, "failed to send you-start");
            }
        }
    }
}

/// Replace the connection's transport with a fresh attempt. The old
/// instance is marked garbage first so nothing of it is ever awaited.
pub(crate) async fn create_transport(
    inner: &Arc<SwarmInner>,
    peer_id: &PeerId,
    conn_id: &ConnId,
    initiator: bool,
) -> Result<Arc<dyn PeerTransport>> {
    let ice = inner.opts.lock().ice.clone().unwrap_or_default();
    let (old, tracks) = {
        let mut state = inner.state.lock();
        let tracks: Vec<_> = state
            .local_tracks
            .iter()
            .map(|(name, track)| (name.clone(), Arc::clone(track)))
            .collect();
        let Some(conn) = state.connection_mut(peer_id, conn_id) else {
            return Err(crate::error::Error::UnknownPeer(peer_id.to_string()));
        };
        let old = conn.transport.take();
        conn.stage = HandleStage::NoHandle;
        conn.connected = false;
        (old, tracks)
    };
    if let Some(old) = old {
        old.mark_garbage();
        tokio::spawn(async move { old.close().await });
    }
    remove_streams_of(inner, peer_id, conn_id);

    let transport = inner
        .factory
        .create(
            peer_id,
            conn_id,
            initiator,
            &ice,
            &tracks,
            inner.transport_tx.clone(),
        )
        .await?;
    {
        let mut state = inner.state.lock();
        let Some(conn) = state.connection_mut(peer_id, conn_id) else {
            // The connection disappeared while we were building.
            let orphan = Arc::clone(&transport);
            orphan.mark_garbage();
            tokio::spawn(async move { orphan.close().await });
            return Err(crate::error::Error::UnknownPeer(peer_id.to_string()));
        };
        conn.transport = Some(Arc::clone(&transport));
        conn.stage = HandleStage::HandleCreated;
        conn.sent_first = false;
        conn.remote_from = None;
    }
    debug!(
        peer_id = %peer_id,
        conn_id = %conn_id,
        initiator,
        transport_id = %transport.id(),
        "created transport"
    );
    Ok(transport)
}

/// Handle a signal addressed to us.
pub(crate) async fn handle_signal(inner: &Arc<SwarmInner>, from: &CombinedId, msg: SignalMessage) {
    let peer_id = &from.peer_id;
    let conn_id = &from.conn_id;
    let key = (peer_id.clone(), conn_id.clone());

    let my_peer = inner.opts.lock().my_peer_id.clone();
    let Some(my_peer) = my_peer else { return };

    enum Next {
        CreateAsInitiator,
        CreateAsNonInitiator { from_nonce: Option<String> },
        Apply(Arc<dyn PeerTransport>),
        Reconnect,
        Drop,
    }
    let (next, new_peer) = {
        let mut state = inner.state.lock();
        let Some(my_conn) = state.my_conn_id.clone() else { return };
        if msg.your_conn_id != my_conn.as_str() {
            debug!(
                peer_id = %peer_id,
                your_conn_id = %msg.your_conn_id,
                "dropping signal addressed to an old session"
            );
            return;
        }
        let new_peer = state.ensure_connection(peer_id, conn_id);
        let active = i_am_active(&my_peer, &my_conn, peer_id, conn_id);
        let payload = &msg.data;

        let next = if payload.is_you_start() {
            match state.connection_mut(peer_id, conn_id) {
                Some(conn) => match &conn.transport {
                    Some(t) if !t.is_garbage() => Next::Drop,
                    _ => Next::CreateAsInitiator,
                },
                None => Next::CreateAsInitiator,
            }
        } else if payload.first && !active {
            // The one place where the passive side creates its handle.
            Next::CreateAsNonInitiator {
                from_nonce: payload.from.clone(),
            }
        } else {
            match state.connection_mut(peer_id, conn_id) {
                Some(conn) => match &conn.transport {
                    None => Next::Reconnect,
                    Some(t) if t.is_garbage() => Next::Reconnect,
                    Some(t) => {
                        if conn.remote_from.is_none() {
                            conn.remote_from = payload.from.clone();
                        }
                        if conn.remote_from != payload.from {
                            warn!(
                                peer_id = %peer_id,
                                conn_id = %conn_id,
                                "dropping signal from an abandoned attempt"
                            );
                            Next::Drop
                        } else {
                            Next::Apply(Arc::clone(t))
                        }
                    }
                },
                None => Next::Reconnect,
            }
        };
        (next, new_peer)
    };
    if new_peer {
        crate::swarm::on_new_peer(inner, peer_id);
    }

    // Shared state piggybacked on the signal.
    if let Some(ts) = msg.state.clone() {
        crate::swarm::apply_connection_state(inner, peer_id, conn_id, ts);
    }

    match next {
        Next::Drop => {}
        Next::CreateAsInitiator => match create_transport(inner, peer_id, conn_id, true).await {
            Ok(transport) => {
                if let Err(err) = transport.start().await {
                    warn!(peer_id = %peer_id, error = %err, "failed to start negotiation");
                }
            }
            Err(err) => warn!(peer_id = %peer_id, error = %err, "failed to create transport"),
        },
        Next::CreateAsNonInitiator { from_nonce } => {
            match create_transport(inner, peer_id, conn_id, false).await {
                Ok(transport) => {
                    {
                        let mut state = inner.state.lock();
                        if let Some(conn) = state.connection_mut(peer_id, conn_id) {
                            conn.remote_from = from_nonce;
                        }
                    }
                    record_stream_meta(inner, peer_id, conn_id, msg.data.meta.as_ref());
                    if let Err(err) = transport.apply(msg.data.body.clone()).await {
                        warn!(peer_id = %peer_id, error = %err, "failed to apply first signal");
                        handle_peer_fail(inner, peer_id, conn_id, false).await;
                    }
                }
                Err(err) => warn!(peer_id = %peer_id, error = %err, "failed to create transport"),
            }
        }
        Next::Apply(transport) => {
            inner.timeouts.extend(&key, MIN_MAX_CONNECT_TIME_AFTER_SIGNAL);
            record_stream_meta(inner, peer_id, conn_id, msg.data.meta.as_ref());
            if let Err(err) = transport.apply(msg.data.body.clone()).await {
                warn!(peer_id = %peer_id, error = %err, "failed to apply signal");
                handle_peer_fail(inner, peer_id, conn_id, false).await;
            }
        }
        Next::Reconnect => {
            warn!(
                peer_id = %peer_id,
                conn_id = %conn_id,
                "signal for a dead handle, reconnecting"
            );
            connect_peer(inner, peer_id, conn_id).await;
        }
    }
}

/// React to something our own transport reported.
pub(crate) async fn handle_transport_event(
    inner: &Arc<SwarmInner>,
    handle: TransportHandle,
    event: TransportEvent,
) {
    let peer_id = handle.peer_id.clone();
    let conn_id = handle.conn_id.clone();
    let key = (peer_id.clone(), conn_id.clone());

    enum Act {
        Send(crate::hub::SignalingHub, CombinedId, serde_json::Value),
        Success,
        IceLost,
        Fail,
        Data(bytes::Bytes),
        Stream(RemoteStream),
    }
    let act = {
        let mut state = inner.state.lock();
        let SwarmState {
            peers,
            remote_streams,
            hub,
            my_state,
            ..
        } = &mut *state;
        let Some(conn) = peers
            .get_mut(&peer_id)
            .and_then(|conns| conns.get_mut(&conn_id))
        else {
            return;
        };
        // Events of a replaced instance are stale.
        let current = conn.transport.as_ref().map(|t| t.id().to_string());
        if current.as_deref() != Some(handle.transport_id.as_str()) {
            return;
        }
        match event {
            TransportEvent::Signal(mut payload) => {
                let Some(hub) = hub.clone() else { return };
                payload.from = Some(handle.transport_id.clone());
                if !conn.sent_first {
                    conn.sent_first = true;
                    payload.first = true;
                }
                if let Some(transport) = &conn.transport {
                    payload.meta = Some(SignalMeta {
                        remote_stream_ids: transport.attached_tracks(),
                    });
                }
                let msg = SignalMessage::new(payload, conn_id.to_string(), my_state.clone());
                match serde_json::to_value(&msg) {
                    Ok(value) => Act::Send(
                        hub,
                        CombinedId::new(peer_id.clone(), conn_id.clone()),
                        value,
                    ),
                    Err(err) => {
                        warn!(error = %err, "failed to serialize signal");
                        return;
                    }
                }
            }
            TransportEvent::Connected => {
                conn.connected = true;
                conn.fail_since = None;
                Act::Success
            }
            TransportEvent::IceDisconnected => {
                conn.connected = false;
                Act::IceLost
            }
            TransportEvent::Failed => Act::Fail,
            TransportEvent::Data(data) => Act::Data(data),
            TransportEvent::Track(media) => {
                let name = conn.remote_stream_names.get(&media.msid()).cloned();
                let stream = RemoteStream {
                    peer_id: peer_id.clone(),
                    conn_id: conn_id.clone(),
                    name,
                    source: media,
                };
                // At most one entry per (peer, name); a replacement
                // track supersedes the old entry.
                remote_streams
                    .retain(|s| !(s.peer_id == stream.peer_id && s.name == stream.name));
                remote_streams.push(stream.clone());
                Act::Stream(stream)
            }
        }
    };

    match act {
        Act::Send(hub, to, msg) => {
            if let Err(err) = hub.send_direct(&to, msg) {
                warn!(peer_id = %peer_id, error = %err, "failed to relay signal");
            }
        }
        Act::Success => {
            debug!(peer_id = %peer_id, conn_id = %conn_id, "peer connected");
            inner.timeouts.cancel(&key);
            inner.events.emit(&SwarmEvent::PeerConnected { peer_id, conn_id });
        }
        Act::IceLost => {
            debug!(peer_id = %peer_id, conn_id = %conn_id, "ice disconnected");
            arm_connect_timeout(inner, key, MAX_CONNECT_TIME_AFTER_ICE_DISCONNECT);
        }
        Act::Fail => handle_peer_fail(inner, &peer_id, &conn_id, false).await,
        Act::Data(data) => inner.events.emit(&SwarmEvent::Data {
            peer_id,
            conn_id,
            data,
        }),
        Act::Stream(stream) => inner.events.emit(&SwarmEvent::StreamAdded(stream)),
    }
}

/// A connection attempt failed, either by timeout or error. Retry while
/// the failing streak is inside the ceiling, abandon beyond it.
pub(crate) async fn handle_peer_fail(
    inner: &Arc<SwarmInner>,
    peer_id: &PeerId,
    conn_id: &ConnId,
    forced: bool,
) {
    enum After {
        Retry,
        Remove,
        Nothing,
    }
    let after = {
        let mut state = inner.state.lock();
        if state.hub.is_none() {
            After::Nothing
        } else {
            let Some(conn) = state.connection_mut(peer_id, conn_id) else {
                return;
            };
            let now = Instant::now();
            let since = *conn.fail_since.get_or_insert(now);
            conn.connected = false;
            if !forced && now.duration_since(since) < MAX_FAIL_TIME {
                After::Retry
            } else {
                After::Remove
            }
        }
    };
    match after {
        After::Retry => {
            debug!(peer_id = %peer_id, conn_id = %conn_id, "connection failed, retrying");
            connect_peer(inner, peer_id, conn_id).await;
        }
        After::Remove => {
            warn!(peer_id = %peer_id, conn_id = %conn_id, "abandoning connection");
            inner.events.emit(&SwarmEvent::ConnectionFailed {
                peer_id: peer_id.clone(),
                conn_id: conn_id.clone(),
            });
            remove_connection(inner, peer_id, conn_id);
        }
        After::Nothing => {}
    }
}

/// Drop everything known about a remote connection.
pub(crate) fn remove_connection(inner: &Arc<SwarmInner>, peer_id: &PeerId, conn_id: &ConnId) {
    let key = (peer_id.clone(), conn_id.clone());
    inner.timeouts.cancel(&key);
    let policy = inner.policy();

    let mut emits = Vec::new();
    let old = {
        let mut state = inner.state.lock();
        let SwarmState {
            peers,
            remote_streams,
            store,
            identity_tasks,
            ..
        } = &mut *state;
        let Some(conns) = peers.get_mut(peer_id) else {
            return;
        };
        let Some(conn) = conns.remove(conn_id) else {
            return;
        };
        let peer_gone = conns.is_empty();
        if peer_gone {
            peers.remove(peer_id);
            if let Some(token) = identity_tasks.remove(peer_id) {
                token.cancel();
            }
        }
        let before = remote_streams.len();
        remote_streams.retain(|s| !(s.peer_id == *peer_id && s.conn_id == *conn_id));
        if remote_streams.len() != before {
            emits.push(SwarmEvent::StreamsRemoved {
                peer_id: peer_id.clone(),
                conn_id: conn_id.clone(),
            });
        }
        match store.remove(peer_id, conn_id, policy.as_ref()) {
            crate::reducer::Removal::PeerRemoved => emits.push(SwarmEvent::PeerState {
                peer_id: peer_id.clone(),
                state: None,
            }),
            crate::reducer::Removal::Reduced(value) => emits.push(SwarmEvent::PeerState {
                peer_id: peer_id.clone(),
                state: Some(value),
            }),
            crate::reducer::Removal::NotTracked => {}
        }
        if peer_gone {
            emits.push(SwarmEvent::PeerLeft {
                peer_id: peer_id.clone(),
            });
        }
        conn.transport
    };
    if let Some(transport) = old {
        transport.mark_garbage();
        tokio::spawn(async move { transport.close().await });
    }
    for event in &emits {
        inner.events.emit(event);
    }
}

fn remove_streams_of(inner: &Arc<SwarmInner>, peer_id: &PeerId, conn_id: &ConnId) {
    let removed = {
        let mut state = inner.state.lock();
        let before = state.remote_streams.len();
        state
            .remote_streams
            .retain(|s| !(s.peer_id == *peer_id && s.conn_id == *conn_id));
        state.remote_streams.len() != before
    };
    if removed {
        inner.events.emit(&SwarmEvent::StreamsRemoved {
            peer_id: peer_id.clone(),
            conn_id: conn_id.clone(),
        });
    }
}

fn record_stream_meta(
    inner: &Arc<SwarmInner>,
    peer_id: &PeerId,
    conn_id: &ConnId,
    meta: Option<&SignalMeta>,
) {
    let Some(meta) = meta else { return };
    if meta.remote_stream_ids.is_empty() {
        return;
    }
    let mut state = inner.state.lock();
    let SwarmState {
        peers,
        remote_streams,
        ..
    } = &mut *state;
    let Some(conn) = peers
        .get_mut(peer_id)
        .and_then(|conns| conns.get_mut(conn_id))
    else {
        return;
    };
    for (name, stream_id) in &meta.remote_stream_ids {
        conn.remote_stream_names
            .insert(stream_id.clone(), name.clone());
    }
    // Name streams that surfaced before the metadata arrived.
    for stream in remote_streams
        .iter_mut()
        .filter(|s| s.peer_id == *peer_id && s.conn_id == *conn_id && s.name.is_none())
    {
        stream.name = conn.remote_stream_names.get(&stream.source.msid()).cloned();
    }
}

// Re-exported for the swarm's timeout registry type.
pub(crate) type ConnectTimeouts = TimeoutRegistry<ConnectionKey>;
