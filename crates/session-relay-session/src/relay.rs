//! Session relay: owns an open session's broker subscription and message loop.

use std::{collections::HashSet, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{FutureExt, StreamExt, stream::FuturesUnordered};
use session_relay_core::{
    Broker, BrokerError, CapturedResponse, EngineError, EngineInit, EnvelopeRequest,
    ProtocolEngine, RequestEnvelope, ResponseEnvelope, SessionId, Subscription, Transport,
    TransportError, requests_channel, responses_channel,
};

use crate::{
    events::{CloseReason, SessionEvent, SessionEvents},
    registry::{RegistryError, SessionRegistry},
};

/// Default bound on finishing in-flight messages once a session ends.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Session relay error.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl RelayError {
    const fn close_reason(&self) -> CloseReason {
        match self {
            Self::Broker(_) => CloseReason::BrokerFailure,
            Self::Registry(_) | Self::Transport(_) | Self::Engine(_) => CloseReason::OpenFailed,
        }
    }
}

/// Runs sessions whose streaming connection is held by this process.
///
/// Each open session listens on `requests:{session}`; every envelope
/// published there is replayed into the session's protocol engine and
/// the outcome is published on `responses:{session}:{request}`.
pub struct SessionRelay {
    broker: Arc<dyn Broker>,
    registry: Arc<SessionRegistry>,
    events: SessionEvents,
    max_duration: Duration,
    drain_timeout: Duration,
}

impl SessionRelay {
    /// Create a relay sharing the process-wide broker and registry.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<SessionRegistry>,
        max_duration: Duration,
    ) -> Self {
        Self {
            broker,
            registry,
            events: SessionEvents::new(),
            max_duration,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Bound the time spent finishing in-flight messages after a session
    /// ends. Messages still unanswered after it get a 503 response.
    #[must_use]
    pub const fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Registry of sessions open in this process.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Lifecycle event stream.
    #[must_use]
    pub const fn events(&self) -> &SessionEvents {
        &self.events
    }

    /// Serve a session until it ends.
    ///
    /// Registers the session, subscribes to its request channel, starts
    /// the transport and binds a fresh engine to it, then relays messages
    /// until the duration limit, a client hang-up, or an engine close.
    /// Messages already handed to the engine are still answered before the
    /// session is torn down. Cleanup runs exactly once on every exit path,
    /// including the returned future being dropped.
    ///
    /// # Errors
    /// Returns error if the session cannot be opened or the broker fails
    /// while it is open.
    pub async fn open(
        &self,
        init: &EngineInit,
        transport: Arc<dyn Transport>,
    ) -> Result<CloseReason, RelayError> {
        let session_id = match self.registry.register(Arc::clone(&transport)) {
            Ok(session_id) => session_id,
            Err(e) => {
                tracing::error!(session_id = %transport.session_id(), "Session rejected: {e}");
                transport.close();
                return Err(e.into());
            }
        };
        let mut guard = SessionGuard {
            session_id: session_id.clone(),
            registry: Arc::clone(&self.registry),
            transport: Arc::clone(&transport),
            events: self.events.clone(),
            finished: false,
        };
        tracing::info!(session_id = %session_id, "Session opened");
        self.events.emit(SessionEvent::Opened {
            session_id: session_id.clone(),
        });

        match self.serve(&session_id, init, &transport).await {
            Ok(reason) => {
                guard.finish(reason);
                Ok(reason)
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, "Session failed: {e}");
                guard.finish(e.close_reason());
                Err(e)
            }
        }
    }

    async fn serve(
        &self,
        session_id: &SessionId,
        init: &EngineInit,
        transport: &Arc<dyn Transport>,
    ) -> Result<CloseReason, RelayError> {
        let channel = requests_channel(session_id);
        let mut subscription = self.broker.subscribe(&channel).await?;
        tracing::debug!(session_id = %session_id, channel = %channel, "Subscribed");
        self.events.emit(SessionEvent::Subscribed {
            session_id: session_id.clone(),
            channel,
        });

        transport.start().await?;
        let engine = init();
        engine.connect(Arc::clone(transport)).await?;

        let reason = self
            .run(session_id, &engine, transport.as_ref(), &mut subscription)
            .await?;
        subscription.unsubscribe();
        Ok(reason)
    }

    async fn run(
        &self,
        session_id: &SessionId,
        engine: &Arc<dyn ProtocolEngine>,
        transport: &dyn Transport,
        subscription: &mut Subscription,
    ) -> Result<CloseReason, RelayError> {
        let deadline = tokio::time::sleep(self.max_duration);
        tokio::pin!(deadline);
        let hang_up = transport.hang_up();
        let closed = transport.closed();
        let concurrent = engine.concurrent();
        let mut in_flight = FuturesUnordered::new();
        let mut pending = HashSet::new();

        let reason = loop {
            tokio::select! {
                () = &mut deadline => break CloseReason::MaxDuration,
                () = hang_up.cancelled() => break CloseReason::ClientHangUp,
                () = closed.cancelled() => break CloseReason::EngineClosed,
                Some((request_id, handled)) = in_flight.next(), if !in_flight.is_empty() => {
                    pending.remove(&request_id);
                    handled?;
                }
                payload = subscription.next_message(), if concurrent || in_flight.is_empty() => {
                    let Some(payload) = payload else {
                        return Err(BrokerError::Closed.into());
                    };
                    let Some(envelope) = self.decode(session_id, &payload) else {
                        continue;
                    };
                    let request_id = envelope.request_id.clone();
                    pending.insert(request_id.clone());
                    let handled = relay_message(
                        session_id.clone(),
                        Arc::clone(engine),
                        Arc::clone(&self.broker),
                        self.events.clone(),
                        envelope,
                    );
                    in_flight.push(handled.map(move |handled| (request_id, handled)));
                }
            }
        };

        if !in_flight.is_empty() {
            tracing::debug!(
                session_id = %session_id,
                in_flight = in_flight.len(),
                "Finishing in-flight messages"
            );
            let drained = tokio::time::timeout(self.drain_timeout, async {
                while let Some((request_id, handled)) = in_flight.next().await {
                    pending.remove(&request_id);
                    handled?;
                }
                Ok::<_, BrokerError>(())
            })
            .await;
            if let Ok(result) = drained {
                result?;
            }
        }
        drop(in_flight);

        for request_id in pending {
            self.abandon(session_id, &request_id).await?;
        }
        Ok(reason)
    }

    fn decode(&self, session_id: &SessionId, payload: &Bytes) -> Option<RequestEnvelope> {
        match RequestEnvelope::decode(payload) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    "Dropping malformed request envelope: {e}"
                );
                self.events.emit(SessionEvent::MessageRejected {
                    session_id: session_id.clone(),
                    error: e.to_string(),
                });
                None
            }
        }
    }

    /// Answer a message the engine did not finish before the session ended.
    async fn abandon(&self, session_id: &SessionId, request_id: &str) -> Result<(), BrokerError> {
        tracing::warn!(
            session_id = %session_id,
            request_id = %request_id,
            "Session ended before the message was handled"
        );
        let reply = ResponseEnvelope::new(503, "Session closed before the message was handled");
        let Ok(encoded) = reply.encode() else {
            return Ok(());
        };
        self.broker
            .publish(&responses_channel(session_id, request_id), encoded)
            .await?;
        self.events.emit(SessionEvent::MessageHandled {
            session_id: session_id.clone(),
            request_id: request_id.to_owned(),
            status: reply.status,
        });
        Ok(())
    }
}

/// Run one envelope through the engine and publish the outcome. Only a
/// failed publish is reported as an error.
async fn relay_message(
    session_id: SessionId,
    engine: Arc<dyn ProtocolEngine>,
    broker: Arc<dyn Broker>,
    events: SessionEvents,
    envelope: RequestEnvelope,
) -> Result<(), BrokerError> {
    let request_id = envelope.request_id.clone();
    tracing::debug!(session_id = %session_id, request_id = %request_id, "Received message");
    events.emit(SessionEvent::MessageReceived {
        session_id: session_id.clone(),
        request_id: request_id.clone(),
    });

    let reply = handle_envelope(engine.as_ref(), envelope).await;
    let encoded = match reply.encode() {
        Ok(encoded) => encoded,
        Err(e) => {
            tracing::error!(
                session_id = %session_id,
                request_id = %request_id,
                "Failed to encode response: {e}"
            );
            return Ok(());
        }
    };
    broker
        .publish(&responses_channel(&session_id, &request_id), encoded)
        .await?;

    if reply.is_success() {
        tracing::debug!(
            session_id = %session_id,
            request_id = %request_id,
            status = reply.status,
            "Request succeeded"
        );
    } else {
        tracing::warn!(
            session_id = %session_id,
            request_id = %request_id,
            status = reply.status,
            body = %String::from_utf8_lossy(&reply.body),
            "Request failed"
        );
    }
    events.emit(SessionEvent::MessageHandled {
        session_id,
        request_id,
        status: reply.status,
    });
    Ok(())
}

/// Replay an envelope through the engine, always producing a response.
async fn handle_envelope(
    engine: &dyn ProtocolEngine,
    envelope: RequestEnvelope,
) -> ResponseEnvelope {
    let mut request = EnvelopeRequest::new(envelope);
    let mut response = CapturedResponse::new();

    let outcome = AssertUnwindSafe(engine.handle_post_message(&mut request, &mut response))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => response
            .into_envelope()
            .unwrap_or_else(|| ResponseEnvelope::new(500, "Protocol engine produced no response")),
        Ok(Err(e)) => match response.into_envelope() {
            Some(reply) if reply.status >= 400 => reply,
            _ => ResponseEnvelope::new(500, e.to_string()),
        },
        Err(_) => {
            tracing::error!("Protocol engine panicked while handling a message");
            ResponseEnvelope::new(500, "Protocol engine panicked")
        }
    }
}

/// Cleanup for one session. Runs once, on finish or on drop.
struct SessionGuard {
    session_id: SessionId,
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    events: SessionEvents,
    finished: bool,
}

impl SessionGuard {
    fn finish(&mut self, reason: CloseReason) {
        if std::mem::replace(&mut self.finished, true) {
            return;
        }
        self.registry.unregister(&self.session_id);
        self.transport.close();
        tracing::info!(session_id = %self.session_id, %reason, "Session closed");
        self.events.emit(SessionEvent::Closed {
            session_id: self.session_id.clone(),
            reason,
        });
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.finish(CloseReason::Cancelled);
    }
}
