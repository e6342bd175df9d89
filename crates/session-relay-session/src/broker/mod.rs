//! Broker implementations.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "memory")]
pub use memory::MemoryBroker;

#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use tokio::sync::mpsc;

struct Route {
    id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

/// Local routing table from channel name to subscriber feeds.
///
/// Backends push every payload received for a channel through here; each
/// live [`Subscription`](session_relay_core::Subscription) owns one feed.
#[derive(Default)]
pub(crate) struct Fanout {
    routes: Mutex<HashMap<String, Vec<Route>>>,
    next_id: AtomicU64,
}

impl Fanout {
    fn routes(&self) -> MutexGuard<'_, HashMap<String, Vec<Route>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a subscriber feed. Returns its id, the receiving end, and
    /// whether it is the first subscriber on the channel.
    pub(crate) fn attach(&self, channel: &str) -> (u64, mpsc::UnboundedReceiver<Bytes>, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.routes();
        let entry = routes.entry(channel.to_string()).or_default();
        let first = entry.is_empty();
        entry.push(Route { id, tx });
        (id, rx, first)
    }

    /// Remove a subscriber feed. Returns true if the channel has no
    /// subscribers left.
    pub(crate) fn detach(&self, channel: &str, id: u64) -> bool {
        let mut routes = self.routes();
        let Some(entry) = routes.get_mut(channel) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|route| route.id != id);
        let removed = entry.len() < before;
        if entry.is_empty() {
            routes.remove(channel);
        }
        removed && !routes.contains_key(channel)
    }

    /// Deliver a payload to every subscriber of a channel.
    pub(crate) fn deliver(&self, channel: &str, payload: &Bytes) -> usize {
        let routes = self.routes();
        routes.get(channel).map_or(0, |entry| {
            entry
                .iter()
                .filter(|route| route.tx.send(payload.clone()).is_ok())
                .count()
        })
    }

    /// Number of live subscribers on a channel.
    pub(crate) fn subscriber_count(&self, channel: &str) -> usize {
        self.routes().get(channel).map_or(0, Vec::len)
    }

    /// Channels with at least one subscriber.
    pub(crate) fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.routes().keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Drop every feed, ending all subscription streams.
    pub(crate) fn close_all(&self) {
        self.routes().clear();
    }
}
