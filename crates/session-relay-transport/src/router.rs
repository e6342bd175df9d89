//! HTTP routes: `GET /sse` opens a session, `POST /message` forwards a
//! follow-up message to whichever process owns it.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Query, Request, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{KeepAlive, KeepAliveStream, Sse},
    },
    routing::{get, post},
};
use serde::Deserialize;
use session_relay_core::{
    Broker, EngineInit, RelayConfig, ResponseEnvelope, SessionId, Transport,
};
use session_relay_session::{DispatchError, DispatchRelay, SessionRegistry, SessionRelay};
use tower_http::trace::TraceLayer;

use crate::{
    http::HttpRequest,
    protocol::{MESSAGE_PATH, SSE_PATH},
    sse::{SseStream, SseTransport},
};

/// Shared handler state.
#[derive(Clone)]
pub struct RelayState {
    relay: Arc<SessionRelay>,
    dispatch: Arc<DispatchRelay>,
    init: EngineInit,
}

impl RelayState {
    /// Wire both relays to the process-wide broker and registry.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<SessionRegistry>,
        config: &RelayConfig,
        init: EngineInit,
    ) -> Self {
        Self {
            relay: Arc::new(
                SessionRelay::new(
                    Arc::clone(&broker),
                    registry,
                    config.max_session_duration(),
                )
                .with_drain_timeout(config.safety_margin),
            ),
            dispatch: Arc::new(DispatchRelay::new(broker, config.response_timeout)),
            init,
        }
    }

    /// The session relay serving streams opened on this process.
    #[must_use]
    pub const fn relay(&self) -> &Arc<SessionRelay> {
        &self.relay
    }
}

#[derive(Debug, Deserialize)]
struct MessageParams {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// Build the relay router.
#[must_use]
pub fn relay_router(state: RelayState) -> Router {
    Router::new()
        .route(SSE_PATH, get(open_session))
        .route(MESSAGE_PATH, post(post_message))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn open_session(State(state): State<RelayState>) -> Sse<KeepAliveStream<SseStream>> {
    let (transport, stream) = SseTransport::new(SessionId::generate());
    let session_id = transport.session_id().clone();
    tokio::spawn(async move {
        match state.relay.open(&state.init, transport).await {
            Ok(reason) => tracing::debug!(session_id = %session_id, %reason, "Stream finished"),
            Err(e) => tracing::warn!(session_id = %session_id, "Stream ended with error: {e}"),
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn post_message(
    State(state): State<RelayState>,
    Query(params): Query<MessageParams>,
    request: Request,
) -> Response {
    let mut request = HttpRequest::new(request);
    match state
        .dispatch
        .dispatch(params.session_id.as_deref(), &mut request)
        .await
    {
        Ok(reply) => reply_response(reply),
        Err(e) => dispatch_error_response(&e),
    }
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found")
}

fn reply_response(reply: ResponseEnvelope) -> Response {
    let status = StatusCode::from_u16(reply.status)
        .ok()
        .filter(|status| !status.is_informational());
    match status {
        Some(status) => (status, Body::from(reply.body)).into_response(),
        None => {
            tracing::warn!(status = reply.status, "Engine produced an unusable status");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn dispatch_error_response(e: &DispatchError) -> Response {
    let status = StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!("Dispatch failed: {e}");
    }
    (status, e.to_string()).into_response()
}
