//! In-memory broker.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use session_relay_core::{Broker, BrokerError, Subscription};

use super::Fanout;

/// In-memory broker implementation.
///
/// Useful for development, tests and single-process deployments: only
/// sessions inside this process are reachable. Also records what was
/// published so tests can assert on broker traffic.
pub struct MemoryBroker {
    fanout: Arc<Fanout>,
    published: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MemoryBroker {
    /// Create a new in-memory broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            fanout: Arc::new(Fanout::default()),
            published: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Channels published to, in order.
    #[must_use]
    pub fn published_channels(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of publishes so far.
    #[must_use]
    pub fn publish_count(&self) -> usize {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of live subscriptions on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.fanout.subscriber_count(channel)
    }

    /// Channels that currently have subscribers.
    #[must_use]
    pub fn active_channels(&self) -> Vec<String> {
        self.fanout.channels()
    }

    /// Simulate losing the broker connection: every subscription ends
    /// and further operations fail.
    pub fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.fanout.close_all();
        tracing::warn!("memory broker disconnected");
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(channel.to_string());
        let delivered = self.fanout.deliver(channel, &payload);
        tracing::trace!(channel, delivered, "published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        self.ensure_open()?;
        let (id, rx, _) = self.fanout.attach(channel);
        let fanout = Arc::clone(&self.fanout);
        let name = channel.to_string();
        Ok(Subscription::new(channel, rx, move || {
            fanout.detach(&name, id);
        }))
    }
}
