//! Redis pub/sub broker (feature-gated).

use std::sync::Arc;

use ::redis::{
    AsyncCommands, Client, RedisError,
    aio::{MultiplexedConnection, PubSubSink},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use session_relay_core::{Broker, BrokerError, Subscription};
use tokio::{sync::Mutex, task::JoinHandle};

use super::Fanout;

/// Redis broker implementation.
///
/// Holds one multiplexed connection for publishing and one pub/sub
/// connection for receiving, both shared by every session in the
/// process. Channel subscriptions are reference counted locally: Redis
/// sees one `SUBSCRIBE` per channel no matter how many local handles
/// listen on it.
pub struct RedisBroker {
    publisher: MultiplexedConnection,
    sink: Arc<Mutex<PubSubSink>>,
    fanout: Arc<Fanout>,
    reader: JoinHandle<()>,
}

fn connection_error(e: &RedisError) -> BrokerError {
    BrokerError::Connection(e.to_string())
}

impl RedisBroker {
    /// Connect both the publisher and the subscriber connection.
    ///
    /// `rediss://` URLs use TLS.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or either connection fails.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = Client::open(url).map_err(|e| connection_error(&e))?;

        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| connection_error(&e))?;
        tracing::info!("Redis publisher connected");

        let (sink, mut stream) = client
            .get_async_pubsub()
            .await
            .map_err(|e| connection_error(&e))?
            .split();
        tracing::info!("Redis subscriber connected");

        let fanout = Arc::new(Fanout::default());
        let routes = Arc::clone(&fanout);
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let payload = Bytes::copy_from_slice(msg.get_payload_bytes());
                let channel = msg.get_channel_name();
                let delivered = routes.deliver(channel, &payload);
                tracing::trace!(channel, delivered, "Redis message received");
            }
            tracing::error!("Redis subscriber connection closed");
            routes.close_all();
        });

        Ok(Self {
            publisher,
            sink: Arc::new(Mutex::new(sink)),
            fanout,
            reader,
        })
    }
}

impl Drop for RedisBroker {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(channel, &payload[..])
            .await
            .map_err(|e| BrokerError::Publish {
                channel: channel.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        if self.reader.is_finished() {
            return Err(BrokerError::Closed);
        }

        // Holding the sink lock across attach + SUBSCRIBE means a second
        // local subscriber cannot return before Redis acknowledged the first.
        let mut sink = self.sink.lock().await;
        let (id, rx, first) = self.fanout.attach(channel);
        if first {
            if let Err(e) = sink.subscribe(channel).await {
                self.fanout.detach(channel, id);
                return Err(BrokerError::Subscribe {
                    channel: channel.to_string(),
                    reason: e.to_string(),
                });
            }
            tracing::debug!(channel, "subscribed");
        }
        drop(sink);

        let fanout = Arc::clone(&self.fanout);
        let sink = Arc::clone(&self.sink);
        let name = channel.to_string();
        Ok(Subscription::new(channel, rx, move || {
            if fanout.detach(&name, id) {
                release_channel(fanout, sink, name);
            }
        }))
    }
}

/// Issue `UNSUBSCRIBE` for a channel whose last local handle went away.
fn release_channel(fanout: Arc<Fanout>, sink: Arc<Mutex<PubSubSink>>, channel: String) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        tracing::warn!(channel = %channel, "no runtime available to unsubscribe");
        return;
    };
    handle.spawn(async move {
        let mut sink = sink.lock().await;
        // A new local subscriber may have arrived in the meantime.
        if fanout.subscriber_count(&channel) > 0 {
            return;
        }
        match sink.unsubscribe(channel.as_str()).await {
            Ok(()) => tracing::debug!(channel = %channel, "unsubscribed"),
            Err(e) => tracing::warn!(channel = %channel, "unsubscribe failed: {e}"),
        }
    });
}
