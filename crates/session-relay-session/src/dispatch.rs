//! Dispatch relay: forwards a follow-up request to whichever process owns
//! the session and waits for the correlated response.

use std::{sync::Arc, time::Duration};

use session_relay_core::{
    Broker, BrokerError, EnvelopeError, RelayRequest, RequestEnvelope, ResponseEnvelope,
    SessionId, requests_channel, responses_channel,
};
use tokio::time::Instant;
use uuid::Uuid;

/// Dispatch error.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No sessionId provided")]
    NoSession,
    #[error("Request timed out")]
    TimedOut,
    #[error("Invalid request body: {0}")]
    InvalidBody(std::io::Error),
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl DispatchError {
    /// HTTP status reported to the client.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::NoSession | Self::InvalidBody(_) => 400,
            Self::TimedOut => 408,
            Self::Envelope(_) | Self::Broker(_) => 500,
        }
    }
}

/// Forwards follow-up messages over the broker.
///
/// Never consults the local registry: the session may live in any
/// process, including this one.
pub struct DispatchRelay {
    broker: Arc<dyn Broker>,
    timeout: Duration,
}

impl DispatchRelay {
    /// Create a dispatcher waiting at most `timeout` for each response.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, timeout: Duration) -> Self {
        Self { broker, timeout }
    }

    /// Response wait limit.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forward one request to the session owner.
    ///
    /// Subscribes to the response channel before publishing, so a fast
    /// reply is never missed. Dropping the returned future unsubscribes.
    ///
    /// # Errors
    /// Returns error if the session id is missing, the body cannot be
    /// read, the broker fails, or no response arrives in time.
    pub async fn dispatch(
        &self,
        session_id: Option<&str>,
        request: &mut dyn RelayRequest,
    ) -> Result<ResponseEnvelope, DispatchError> {
        let session_id = match session_id {
            Some(id) if !id.is_empty() => SessionId::from(id),
            _ => return Err(DispatchError::NoSession),
        };

        let request_id = Uuid::new_v4().to_string();
        let envelope = RequestEnvelope::capture(request_id.clone(), request)
            .await
            .map_err(DispatchError::InvalidBody)?;
        let payload = envelope.encode()?;

        let mut replies = self
            .broker
            .subscribe(&responses_channel(&session_id, &request_id))
            .await?;
        self.broker
            .publish(&requests_channel(&session_id), payload)
            .await?;
        tracing::debug!(session_id = %session_id, request_id = %request_id, "Dispatched request");

        let deadline = Instant::now() + self.timeout;
        loop {
            match tokio::time::timeout_at(deadline, replies.next_message()).await {
                Ok(Some(payload)) => match ResponseEnvelope::decode(&payload) {
                    Ok(reply) => {
                        replies.unsubscribe();
                        return Ok(reply);
                    }
                    Err(e) => {
                        tracing::warn!(
                            session_id = %session_id,
                            request_id = %request_id,
                            "Ignoring malformed response: {e}"
                        );
                    }
                },
                Ok(None) => return Err(BrokerError::Closed.into()),
                Err(_) => {
                    tracing::warn!(
                        session_id = %session_id,
                        request_id = %request_id,
                        "No response before timeout"
                    );
                    return Err(DispatchError::TimedOut);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::{StreamExt, stream};
    use session_relay_core::{EnvelopeRequest, HeaderValue, Headers, http::BodyStream};

    use super::*;
    use crate::{
        broker::MemoryBroker,
        events::SessionEvent,
        registry::SessionRegistry,
        relay::SessionRelay,
        testing::{ChannelTransport, TestEngine, wait_for},
    };

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn post(body: &str) -> EnvelopeRequest {
        let mut headers = Headers::new();
        headers.insert(
            "content-type".into(),
            HeaderValue::One("application/json".into()),
        );
        EnvelopeRequest::new(RequestEnvelope {
            request_id: String::new(),
            url: "/message?sessionId=s".into(),
            method: "POST".into(),
            body: Bytes::from(body.to_string()),
            headers,
        })
    }

    struct BrokenBody(Headers);

    impl RelayRequest for BrokenBody {
        fn method(&self) -> &str {
            "POST"
        }

        fn url(&self) -> &str {
            "/message?sessionId=s"
        }

        fn headers(&self) -> &Headers {
            &self.0
        }

        fn take_body(&mut self) -> BodyStream {
            let reset = std::io::Error::other("connection reset");
            stream::once(async { Err::<Bytes, _>(reset) }).boxed()
        }
    }

    fn dispatcher(broker: &Arc<MemoryBroker>) -> DispatchRelay {
        DispatchRelay::new(Arc::clone(broker) as Arc<dyn Broker>, TIMEOUT)
    }

    /// Answer every request on `requests:{session}` with the given status.
    async fn responder(broker: &Arc<MemoryBroker>, session: &str, reply: ResponseEnvelope) {
        let mut requests = broker
            .subscribe(&requests_channel(&SessionId::from(session)))
            .await
            .unwrap();
        let broker = Arc::clone(broker);
        let session = SessionId::from(session);
        tokio::spawn(async move {
            while let Some(payload) = requests.next_message().await {
                let request = RequestEnvelope::decode(&payload).unwrap();
                broker
                    .publish(
                        &responses_channel(&session, &request.request_id),
                        reply.encode().unwrap(),
                    )
                    .await
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_missing_session_id_touches_nothing() {
        let broker = Arc::new(MemoryBroker::new());
        let dispatcher = dispatcher(&broker);

        let err = dispatcher.dispatch(None, &mut post("{}")).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoSession));
        assert_eq!(err.status(), 400);
        assert_eq!(err.to_string(), "No sessionId provided");

        let err = dispatcher.dispatch(Some(""), &mut post("{}")).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoSession));

        assert_eq!(broker.publish_count(), 0);
        assert!(broker.active_channels().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_body_is_bad_request() {
        let broker = Arc::new(MemoryBroker::new());
        let dispatcher = dispatcher(&broker);

        let err = dispatcher
            .dispatch(Some("s"), &mut BrokenBody(Headers::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::InvalidBody(_)));
        assert_eq!(err.status(), 400);
        assert_eq!(broker.publish_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_session_times_out() {
        let broker = Arc::new(MemoryBroker::new());
        let dispatcher = dispatcher(&broker);
        let started = Instant::now();

        let err = dispatcher
            .dispatch(Some("nobody"), &mut post("{}"))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::TimedOut));
        assert_eq!(err.status(), 408);
        assert_eq!(err.to_string(), "Request timed out");
        assert!(started.elapsed() >= TIMEOUT);
        assert_eq!(broker.published_channels(), vec!["requests:nobody"]);
        assert!(broker.active_channels().is_empty());
    }

    #[tokio::test]
    async fn test_subscribes_before_publishing() {
        let broker = Arc::new(MemoryBroker::new());
        // The responder replies as soon as the request lands; the reply is
        // lost unless the response channel was subscribed first.
        responder(&broker, "s", ResponseEnvelope::new(202, "Accepted")).await;

        let reply = dispatcher(&broker)
            .dispatch(Some("s"), &mut post("{}"))
            .await
            .unwrap();

        assert_eq!(reply, ResponseEnvelope::new(202, "Accepted"));
        let published = broker.published_channels();
        assert_eq!(published[0], "requests:s");
        assert!(published[1].starts_with("responses:s:"));
        assert_eq!(broker.active_channels(), vec!["requests:s"]);
    }

    #[tokio::test]
    async fn test_error_status_is_passed_through() {
        let broker = Arc::new(MemoryBroker::new());
        responder(&broker, "s", ResponseEnvelope::new(500, "boom")).await;

        let reply = dispatcher(&broker)
            .dispatch(Some("s"), &mut post("{}"))
            .await
            .unwrap();

        assert_eq!(reply.status, 500);
        assert_eq!(reply.body, "boom");
    }

    #[tokio::test]
    async fn test_malformed_response_is_skipped() {
        let broker = Arc::new(MemoryBroker::new());
        let mut requests = broker.subscribe("requests:s").await.unwrap();
        let answering = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                let payload = requests.next_message().await.unwrap();
                let request = RequestEnvelope::decode(&payload).unwrap();
                let channel = responses_channel(&SessionId::from("s"), &request.request_id);
                broker
                    .publish(&channel, Bytes::from_static(b"garbage"))
                    .await
                    .unwrap();
                broker
                    .publish(&channel, ResponseEnvelope::new(200, "ok").encode().unwrap())
                    .await
                    .unwrap();
            })
        };

        let reply = dispatcher(&broker)
            .dispatch(Some("s"), &mut post("{}"))
            .await
            .unwrap();

        assert_eq!(reply, ResponseEnvelope::new(200, "ok"));
        answering.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_dispatch_unsubscribes() {
        let broker = Arc::new(MemoryBroker::new());
        let _requests = broker.subscribe("requests:s").await.unwrap();
        let dispatcher = Arc::new(dispatcher(&broker));

        let task = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.dispatch(Some("s"), &mut post("{}")).await }
        });
        while broker.publish_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(broker.active_channels().len(), 2);

        task.abort();
        let _ = task.await;
        assert_eq!(broker.active_channels(), vec!["requests:s"]);
    }

    #[tokio::test]
    async fn test_broker_loss_while_waiting() {
        let broker = Arc::new(MemoryBroker::new());
        let _requests = broker.subscribe("requests:s").await.unwrap();
        let dispatcher = Arc::new(dispatcher(&broker));

        let task = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.dispatch(Some("s"), &mut post("{}")).await }
        });
        while broker.publish_count() == 0 {
            tokio::task::yield_now().await;
        }
        broker.disconnect();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, DispatchError::Broker(BrokerError::Closed)));
        assert_eq!(err.status(), 500);
    }

    #[tokio::test]
    async fn test_relay_across_processes() {
        // Two "processes" share only the broker.
        let broker = Arc::new(MemoryBroker::new());
        let owner = Arc::new(SessionRelay::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::new(SessionRegistry::new()),
            Duration::from_secs(795),
        ));
        let other_registry = SessionRegistry::new();
        let other = dispatcher(&broker);

        let (transport, _out) = ChannelTransport::new("shared");
        let init = TestEngine::new(true).init();
        let mut events = owner.events().subscribe();
        let session = tokio::spawn({
            let owner = Arc::clone(&owner);
            let transport = Arc::clone(&transport);
            async move { owner.open(&init, transport).await }
        });
        wait_for(&mut events, |e| matches!(e, SessionEvent::Subscribed { .. })).await;

        assert!(other_registry.is_empty());
        let reply = other
            .dispatch(Some("shared"), &mut post("{\"id\":1}"))
            .await
            .unwrap();
        assert_eq!(reply, ResponseEnvelope::new(200, "echo: {\"id\":1}"));

        let handled = wait_for(&mut events, |e| {
            matches!(e, SessionEvent::MessageHandled { .. })
        })
        .await;
        assert!(matches!(handled, SessionEvent::MessageHandled { status: 200, .. }));

        transport.hang_up_now();
        session.await.unwrap().unwrap();
        assert!(broker.active_channels().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_dispatches_are_correlated() {
        let broker = Arc::new(MemoryBroker::new());
        let owner = Arc::new(SessionRelay::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::new(SessionRegistry::new()),
            Duration::from_secs(795),
        ));
        let (transport, _out) = ChannelTransport::new("multi");
        let init = TestEngine::new(true).init();
        let mut events = owner.events().subscribe();
        let session = tokio::spawn({
            let owner = Arc::clone(&owner);
            let transport = Arc::clone(&transport);
            async move { owner.open(&init, transport).await }
        });
        wait_for(&mut events, |e| matches!(e, SessionEvent::Subscribed { .. })).await;

        let dispatcher = Arc::new(dispatcher(&broker));
        let calls: Vec<_> = (0..5)
            .map(|i| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    let body = format!("slow:{i}");
                    let reply = dispatcher
                        .dispatch(Some("multi"), &mut post(&body))
                        .await
                        .unwrap();
                    (body, reply)
                })
            })
            .collect();

        for call in calls {
            let (body, reply) = call.await.unwrap();
            assert_eq!(reply.body, Bytes::from(format!("echo: {body}")));
        }

        transport.hang_up_now();
        session.await.unwrap().unwrap();
    }
}
