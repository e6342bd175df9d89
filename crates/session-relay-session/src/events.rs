//! Session lifecycle events for diagnostics.

use std::fmt;

use serde::{Deserialize, Serialize};
use session_relay_core::SessionId;
use tokio::sync::broadcast;

/// Capacity of the lifecycle event channel. Slow receivers lag, senders
/// never wait.
const EVENT_CAPACITY: usize = 1024;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The maximum session duration elapsed.
    MaxDuration,
    /// The streaming client went away.
    ClientHangUp,
    /// The protocol engine closed the transport.
    EngineClosed,
    /// The broker connection was lost.
    BrokerFailure,
    /// Opening the session failed before it was serving.
    OpenFailed,
    /// The relay task was dropped mid-session.
    Cancelled,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MaxDuration => "max duration reached",
            Self::ClientHangUp => "client hang up",
            Self::EngineClosed => "engine closed",
            Self::BrokerFailure => "broker failure",
            Self::OpenFailed => "open failed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// A session lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Session registered.
    Opened { session_id: SessionId },
    /// Listening on the session's request channel.
    Subscribed { session_id: SessionId, channel: String },
    /// An envelope arrived for the session.
    MessageReceived { session_id: SessionId, request_id: String },
    /// A response envelope was published.
    MessageHandled {
        session_id: SessionId,
        request_id: String,
        status: u16,
    },
    /// An inbound payload could not be decoded.
    MessageRejected { session_id: SessionId, error: String },
    /// Cleanup ran.
    Closed {
        session_id: SessionId,
        reason: CloseReason,
    },
}

/// Fan-out of lifecycle events. Emitting never blocks.
#[derive(Clone)]
pub struct SessionEvents {
    sender: broadcast::Sender<SessionEvent>,
}

impl SessionEvents {
    /// Create an event channel.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Emit an event; dropped if nobody listens.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    /// Get a receiver for events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new()
    }
}
