//! Swarm configuration.
//!
//! Options are merged rather than replaced: `configure` may be called
//! repeatedly (and after `connect`) and only the provided fields change.

use crate::identity::IdentityDirectory;
use crate::reducer::ReducePolicy;
use parley_proto::PeerId;
use serde_json::Value;
use std::sync::Arc;

/// Signs the authentication payload presented to the hub on connect.
pub trait TokenSigner: Send + Sync {
    /// Produce the signed record that is base64url-encoded into the
    /// `token` query parameter.
    fn sign(&self, payload: &Value) -> anyhow::Result<Value>;
}

/// Verifies that a peer's shared state was authored by that peer.
///
/// States failing verification are dropped before they reach the
/// reducer.
pub trait StateVerifier: Send + Sync {
    fn verify(&self, state: &Value, peer_id: &PeerId) -> bool;
}

/// A single STUN/TURN server entry.
#[derive(Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// ICE configuration handed to every peer transport.
#[derive(Debug, Clone)]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
        }
    }
}

/// Options for a [`Swarm`](crate::Swarm). All fields are optional so a
/// patch can be merged over the current configuration; `url` and
/// `my_peer_id` must be present by the time `connect` is called.
#[derive(Clone, Default)]
pub struct SwarmOptions {
    /// Base URL of the signaling hub, e.g. `wss://hub.example.com/~/rooms`.
    pub url: Option<String>,
    /// Room to join; may also be passed to `connect` directly.
    pub room: Option<String>,
    /// Our stable peer identity.
    pub my_peer_id: Option<PeerId>,
    pub ice: Option<IceConfig>,
    pub signer: Option<Arc<dyn TokenSigner>>,
    pub verifier: Option<Arc<dyn StateVerifier>>,
    /// Policy collapsing per-connection states into one peer state.
    pub reduce: Option<ReducePolicy>,
    /// Optional directory for resolving peer identities on first sight.
    pub identity: Option<Arc<dyn IdentityDirectory>>,
}

impl std::fmt::Debug for SwarmOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmOptions")
            .field("url", &self.url)
            .field("room", &self.room)
            .field("my_peer_id", &self.my_peer_id)
            .field("ice", &self.ice)
            .field("signer", &self.signer.is_some())
            .field("verifier", &self.verifier.is_some())
            .field("reduce", &self.reduce.is_some())
            .field("identity", &self.identity.is_some())
            .finish()
    }
}

impl SwarmOptions {
    /// Merge `patch` over `self`; only fields set in the patch change.
    pub fn merge(&mut self, patch: Self) {
        let Self {
            url,
            room,
            my_peer_id,
            ice,
            signer,
            verifier,
            reduce,
            identity,
        } = patch;
        if url.is_some() {
            self.url = url;
        }
        if room.is_some() {
            self.room = room;
        }
        if my_peer_id.is_some() {
            self.my_peer_id = my_peer_id;
        }
        if ice.is_some() {
            self.ice = ice;
        }
        if signer.is_some() {
            self.signer = signer;
        }
        if verifier.is_some() {
            self.verifier = verifier;
        }
        if reduce.is_some() {
            self.reduce = reduce;
        }
        if identity.is_some() {
            self.identity = identity;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_unset_fields() {
        let mut opts = SwarmOptions {
            url: Some("wss://hub.example".to_string()),
            my_peer_id: Some(PeerId::from("pk1")),
            ..Default::default()
        };
        opts.merge(SwarmOptions {
            room: Some("lobby".to_string()),
            ..Default::default()
        });
        assert_eq!(opts.url.as_deref(), Some("wss://hub.example"));
        assert_eq!(opts.room.as_deref(), Some("lobby"));
        assert_eq!(opts.my_peer_id, Some(PeerId::from("pk1")));
    }
}
