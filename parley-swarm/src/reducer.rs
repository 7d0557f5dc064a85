//! Per-peer state reduction.
//!
//! Every connection of a peer broadcasts its own timestamped state; the
//! store keeps all of them plus a `latest` pointer, and collapses them
//! into a single per-peer value through a pluggable [`ReduceState`]
//! policy. A panicking policy must never poison the store, so it runs
//! under `catch_unwind` and falls back to the previous reduced value.

use parley_proto::{ConnId, PeerId, TimedState};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::error;

/// Collapses the states of a peer's connections into one value.
///
/// `find_latest` walks that peer's states from newest to oldest and
/// returns the first one matching the predicate.
pub trait ReduceState: Send + Sync {
    fn reduce(
        &self,
        all_states: &[&Value],
        previous: Option<&Value>,
        latest: &Value,
        find_latest: &dyn Fn(&dyn Fn(&Value) -> bool) -> Option<Value>,
    ) -> Value;
}

pub type ReducePolicy = Arc<dyn ReduceState>;

impl<F> ReduceState for F
where
    F: Fn(&[&Value], Option<&Value>, &Value, &dyn Fn(&dyn Fn(&Value) -> bool) -> Option<Value>) -> Value
        + Send
        + Sync,
{
    fn reduce(
        &self,
        all_states: &[&Value],
        previous: Option<&Value>,
        latest: &Value,
        find_latest: &dyn Fn(&dyn Fn(&Value) -> bool) -> Option<Value>,
    ) -> Value {
        self(all_states, previous, latest, find_latest)
    }
}

/// Default policy: the most recently stamped state wins outright.
pub struct MostRecentWins;

impl ReduceState for MostRecentWins {
    fn reduce(
        &self,
        _all_states: &[&Value],
        _previous: Option<&Value>,
        latest: &Value,
        _find_latest: &dyn Fn(&dyn Fn(&Value) -> bool) -> Option<Value>,
    ) -> Value {
        latest.clone()
    }
}

/// All known states of one peer's connections.
#[derive(Debug, Default, Clone)]
pub struct PeerStates {
    /// Connection holding the newest timestamp.
    pub latest: Option<ConnId>,
    pub states: HashMap<ConnId, TimedState>,
}

/// Outcome of removing a connection's state.
#[derive(Debug, PartialEq)]
pub enum Removal {
    /// That was the peer's last connection; the peer is gone.
    PeerRemoved,
    /// Other connections remain; carries the new reduced state.
    Reduced(Value),
    NotTracked,
}

/// Store of raw per-connection states and reduced per-peer states.
#[derive(Default)]
pub struct StateStore {
    connections: HashMap<PeerId, PeerStates>,
    reduced: HashMap<PeerId, Value>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection's state and recompute the peer's reduced
    /// state. Returns the new reduced value.
    pub fn update(
        &mut self,
        peer_id: &PeerId,
        conn_id: &ConnId,
        state: TimedState,
        policy: &dyn ReduceState,
    ) -> Value {
        let peer = self.connections.entry(peer_id.clone()).or_default();
        let newest = match &peer.latest {
            Some(latest) => peer
                .states
                .get(latest)
                .is_none_or(|current| state.time >= current.time),
            None => true,
        };
        peer.states.insert(conn_id.clone(), state);
        if newest {
            peer.latest = Some(conn_id.clone());
        }
        self.reduce(peer_id, policy)
    }

    /// Forget a connection's state, repointing `latest` if it was
    /// removed.
    pub fn remove(
        &mut self,
        peer_id: &PeerId,
        conn_id: &ConnId,
        policy: &dyn ReduceState,
    ) -> Removal {
        let Some(peer) = self.connections.get_mut(peer_id) else {
            return Removal::NotTracked;
        };
        if peer.states.remove(conn_id).is_none() {
            return Removal::NotTracked;
        }
        if peer.states.is_empty() {
            self.connections.remove(peer_id);
            self.reduced.remove(peer_id);
            return Removal::PeerRemoved;
        }
        if peer.latest.as_ref() == Some(conn_id) {
            peer.latest = peer
                .states
                .iter()
                .max_by_key(|(_, ts)| ts.time)
                .map(|(id, _)| id.clone());
        }
        Removal::Reduced(self.reduce(peer_id, policy))
    }

    /// Reduced state of a peer, if any connection reported one.
    pub fn reduced(&self, peer_id: &PeerId) -> Option<&Value> {
        self.reduced.get(peer_id)
    }

    pub fn peer_states(&self, peer_id: &PeerId) -> Option<&PeerStates> {
        self.connections.get(peer_id)
    }

    pub fn clear(&mut self) {
        self.connections.clear();
        self.reduced.clear();
    }

    fn reduce(&mut self, peer_id: &PeerId, policy: &dyn ReduceState) -> Value {
        let peer = &self.connections[peer_id];
        let mut ordered: Vec<&TimedState> = peer.states.values().collect();
        ordered.sort_by(|a, b| b.time.cmp(&a.time));
        let all_states: Vec<&Value> = ordered.iter().map(|ts| &ts.state).collect();
        let latest = peer
            .latest
            .as_ref()
            .and_then(|id| peer.states.get(id))
            .map_or(&Value::Null, |ts| &ts.state);
        let previous = self.reduced.get(peer_id);

        let find_latest = |pred: &dyn Fn(&Value) -> bool| -> Option<Value> {
            ordered
                .iter()
                .find(|ts| pred(&ts.state))
                .map(|ts| ts.state.clone())
        };

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            policy.reduce(&all_states, previous, latest, &find_latest)
        }));
        let value = match outcome {
            Ok(value) => value,
            Err(_) => {
                error!(peer_id = %peer_id, "state reduce policy panicked, keeping previous state");
                previous.cloned().unwrap_or_else(|| latest.clone())
            }
        };
        self.reduced.insert(peer_id.clone(), value.clone());
        value
    }
}
