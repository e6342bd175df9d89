//! Server-sent event framing for session streams.

use session_relay_core::SessionId;

/// Path that opens a session stream.
pub const SSE_PATH: &str = "/sse";

/// Path that accepts follow-up messages.
pub const MESSAGE_PATH: &str = "/message";

/// Query parameter carrying the session id on follow-up messages.
pub const SESSION_ID_PARAM: &str = "sessionId";

/// Where a client must POST follow-up messages for a session.
#[must_use]
pub fn endpoint_url(session_id: &SessionId) -> String {
    format!("{MESSAGE_PATH}?{SESSION_ID_PARAM}={session_id}")
}

/// An event pushed to the client over a session stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Announces the follow-up endpoint. Sent once when the session starts.
    Endpoint(String),
    /// A protocol message from the engine.
    Message(String),
}

impl StreamEvent {
    /// SSE event name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Endpoint(_) => "endpoint",
            Self::Message(_) => "message",
        }
    }

    /// SSE data payload.
    #[must_use]
    pub fn data(&self) -> &str {
        match self {
            Self::Endpoint(data) | Self::Message(data) => data,
        }
    }

    /// Render as an axum SSE event.
    #[cfg(feature = "sse")]
    #[must_use]
    pub fn to_sse(&self) -> axum::response::sse::Event {
        axum::response::sse::Event::default()
            .event(self.name())
            .data(self.data())
    }
}
