//! Server-sent events transport for live sessions.

use std::{
    convert::Infallible,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
};

use async_trait::async_trait;
use axum::response::sse::Event;
use futures::{Stream, StreamExt};
use session_relay_core::{SessionId, Transport, TransportError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::protocol::{StreamEvent, endpoint_url};

/// Transport writing to an open SSE response.
///
/// The paired [`SseStream`] is handed to axum as the response body.
/// Dropping it (the client went away) cancels the hang-up token;
/// [`Transport::close`] ends it from this side.
pub struct SseTransport {
    session_id: SessionId,
    outbound: Mutex<Option<mpsc::UnboundedSender<StreamEvent>>>,
    hang_up: CancellationToken,
    closed: CancellationToken,
}

impl SseTransport {
    /// Create a transport and the event stream it feeds.
    #[must_use]
    pub fn new(session_id: SessionId) -> (Arc<Self>, SseStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hang_up = CancellationToken::new();
        let stream = SseStream {
            events: UnboundedReceiverStream::new(rx),
            _hang_up: hang_up.clone().drop_guard(),
        };
        let transport = Arc::new(Self {
            session_id,
            outbound: Mutex::new(Some(tx)),
            hang_up,
            closed: CancellationToken::new(),
        });
        (transport, stream)
    }

    fn push(&self, event: StreamEvent) -> Result<(), TransportError> {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = outbound.as_ref().ok_or(TransportError::Closed)?;
        tx.send(event).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    async fn start(&self) -> Result<(), TransportError> {
        let endpoint = endpoint_url(&self.session_id);
        tracing::debug!(session_id = %self.session_id, endpoint = %endpoint, "Announcing endpoint");
        self.push(StreamEvent::Endpoint(endpoint))
    }

    async fn send(&self, message: String) -> Result<(), TransportError> {
        self.push(StreamEvent::Message(message))
    }

    fn close(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.closed.cancel();
    }

    fn hang_up(&self) -> CancellationToken {
        self.hang_up.clone()
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Event stream backing an SSE response. Ends when the transport closes.
pub struct SseStream {
    events: UnboundedReceiverStream<StreamEvent>,
    _hang_up: DropGuard,
}

impl Stream for SseStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events
            .poll_next_unpin(cx)
            .map(|event| event.map(|event| Ok(event.to_sse())))
    }
}
