//! Peer identity resolution.
//!
//! When a peer is first seen, its identity record (display name,
//! avatar, ...) is fetched from a directory with a short bounded retry,
//! and the lookup is abandoned when the peer leaves before it resolves.

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use parley_proto::PeerId;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Delay between lookup attempts.
const LOOKUP_DELAY: Duration = Duration::from_secs(1);
/// Retries after the first attempt (five attempts total).
const LOOKUP_RETRIES: usize = 4;

/// Source of identity records.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn fetch(&self, peer_id: &PeerId) -> anyhow::Result<Value>;
}

/// Fetch with retry, aborting promptly when `cancel` fires. Returns
/// `None` when cancelled or when every attempt failed.
pub(crate) async fn lookup(
    directory: &dyn IdentityDirectory,
    peer_id: &PeerId,
    cancel: &CancellationToken,
) -> Option<Value> {
    let attempt = || directory.fetch(peer_id);
    let retried = attempt.retry(
        ConstantBuilder::default()
            .with_delay(LOOKUP_DELAY)
            .with_max_times(LOOKUP_RETRIES),
    );
    tokio::select! {
        () = cancel.cancelled() => {
            debug!(peer_id = %peer_id, "identity lookup cancelled");
            None
        }
        result = retried => match result {
            Ok(identity) => Some(identity),
            Err(err) => {
                debug!(peer_id = %peer_id, error = %err, "identity lookup failed");
                None
            }
        },
    }
}
