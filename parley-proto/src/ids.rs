//! Identifier types shared across the signaling plane.

use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a freshly minted connection id.
const CONN_ID_LEN: usize = 8;

/// Stable identifier of a room participant (a public-key-like string).
///
/// A peer may be present through several simultaneous connections
/// (tabs, devices); those are distinguished by [`ConnId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Ephemeral identifier of one signaling session of a peer.
///
/// Minted once per hub connect; a reconnect always produces a fresh id,
/// which is what lets both sides recognize stale signaling traffic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(String);

impl ConnId {
    /// Mint a fresh random connection id.
    #[must_use]
    pub fn random() -> Self {
        Self(nanoid!(CONN_ID_LEN))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The `peerId;connId` address form used on the wire for membership
/// events and direct-message routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CombinedId {
    pub peer_id: PeerId,
    pub conn_id: ConnId,
}

impl CombinedId {
    #[must_use]
    pub const fn new(peer_id: PeerId, conn_id: ConnId) -> Self {
        Self { peer_id, conn_id }
    }

    /// Parse a `peerId;connId` string. Returns `None` when the separator
    /// is missing or either half is empty.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (peer, conn) = s.split_once(';')?;
        if peer.is_empty() || conn.is_empty() {
            return None;
        }
        Some(Self {
            peer_id: PeerId::from(peer),
            conn_id: ConnId::from(conn),
        })
    }
}

impl fmt::Display for CombinedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.peer_id, self.conn_id)
    }
}

impl Serialize for CombinedId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CombinedId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).ok_or_else(|| serde::de::Error::custom("expected `peerId;connId`"))
    }
}
