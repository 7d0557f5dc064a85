//! Coalescing per-owner timeouts.
//!
//! At most one timeout is pending per owner key. Re-scheduling while a
//! timeout is pending never shortens it: the deadline becomes the
//! further of the two and the handler is replaced, so competing code
//! paths watching the same connection collapse into a single firing.
//! The handler receives the total time elapsed since the earliest
//! schedule of the pending run.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

type Handler = Box<dyn FnOnce(Duration) + Send + 'static>;

struct Entry {
    generation: u64,
    started: Instant,
    deadline: Instant,
    handler: Handler,
}

/// Registry of coalescing timeouts keyed by owner.
pub struct TimeoutRegistry<K> {
    inner: Arc<Mutex<HashMap<K, Entry>>>,
}

impl<K> Clone for TimeoutRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> Default for TimeoutRegistry<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TimeoutRegistry<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Arm (or re-arm) the owner's timeout. The deadline is the further
    /// of the pending one and `now + delay`; the handler always becomes
    /// the one passed here.
    pub fn schedule(&self, owner: K, delay: Duration, handler: impl FnOnce(Duration) + Send + 'static) {
        let now = Instant::now();
        let (generation, deadline) = {
            let mut map = self.inner.lock();
            let entry = map.entry(owner.clone()).or_insert_with(|| Entry {
                generation: 0,
                started: now,
                deadline: now,
                handler: Box::new(|_| {}),
            });
            entry.generation += 1;
            entry.deadline = entry.deadline.max(now + delay);
            entry.handler = Box::new(handler);
            (entry.generation, entry.deadline)
        };
        self.spawn_sleeper(owner, generation, deadline);
    }

    /// Push the owner's pending deadline further out, keeping its
    /// handler. No-op when nothing is pending; returns whether a
    /// timeout was pending.
    pub fn extend(&self, owner: &K, delay: Duration) -> bool {
        let now = Instant::now();
        let armed = {
            let mut map = self.inner.lock();
            let Some(entry) = map.get_mut(owner) else {
                return false;
            };
            let deadline = entry.deadline.max(now + delay);
            if deadline > entry.deadline {
                entry.deadline = deadline;
                entry.generation += 1;
                Some((entry.generation, deadline))
            } else {
                None
            }
        };
        if let Some((generation, deadline)) = armed {
            self.spawn_sleeper(owner.clone(), generation, deadline);
        }
        true
    }

    /// Disarm the owner's timeout; returns whether one was pending.
    pub fn cancel(&self, owner: &K) -> bool {
        self.inner.lock().remove(owner).is_some()
    }

    pub fn cancel_all(&self) {
        self.inner.lock().clear();
    }

    pub fn is_pending(&self, owner: &K) -> bool {
        self.inner.lock().contains_key(owner)
    }

    fn spawn_sleeper(&self, owner: K, generation: u64, deadline: Instant) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(map) = inner.upgrade() else { return };
            // A later schedule/extend bumped the generation; this
            // sleeper is stale then and must not fire.
            let fired = {
                let mut map = map.lock();
                match map.get(&owner) {
                    Some(entry) if entry.generation == generation => map.remove(&owner),
                    _ => None,
                }
            };
            if let Some(entry) = fired {
                (entry.handler)(Instant::now() - entry.started);
            }
        });
    }
}
