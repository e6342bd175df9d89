//! Broker subscription handle.

use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

type Release = Box<dyn FnOnce() + Send>;

/// A live subscription to one broker channel.
///
/// Yields payloads in publish order. The stream ends when the broker
/// connection is lost. Dropping the handle unsubscribes.
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<Bytes>,
    release: Option<Release>,
}

impl Subscription {
    /// Wrap a payload feed. `release` runs exactly once, when the
    /// subscription is dropped or unsubscribed.
    #[must_use]
    pub fn new(
        channel: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Bytes>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            channel: channel.into(),
            rx,
            release: Some(Box::new(release)),
        }
    }

    /// Channel this subscription listens on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next payload. `None` means the broker went away.
    pub async fn next_message(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Unsubscribe explicitly.
    pub fn unsubscribe(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if let Some(release) = self.release.take() {
            self.rx.close();
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl Stream for Subscription {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("active", &self.release.is_some())
            .finish()
    }
}
