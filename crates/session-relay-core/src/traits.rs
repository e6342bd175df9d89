//! Core traits for brokers, transports and protocol engines.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    http::{RelayRequest, ResponseSink},
    subscription::Subscription,
};

/// Session identifier.
///
/// Opaque to everything but the owning transport. Ids arriving on
/// follow-up requests are never validated, so any string is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random session id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Broker error.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("Broker connection closed")]
    Closed,
    #[error("Broker connection failed: {0}")]
    Connection(String),
    #[error("Publish to {channel} failed: {reason}")]
    Publish { channel: String, reason: String },
    #[error("Subscribe to {channel} failed: {reason}")]
    Subscribe { channel: String, reason: String },
}

/// Publish/subscribe broker shared by every session in the process.
///
/// Delivery is at-least-once per live subscriber and FIFO per channel.
/// Nothing is retained for subscribers that join later.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload on a channel.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Subscribe to a channel.
    ///
    /// Resolves once the broker has acknowledged the subscription, so a
    /// publish issued afterwards is guaranteed to be delivered.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError>;
}

/// Transport error.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
    #[error("Transport send failed: {0}")]
    Send(String),
}

/// The live, server-push half of a session.
///
/// Owned by the process that accepted the streaming connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Session id bound to this connection.
    fn session_id(&self) -> &SessionId;

    /// Announce the session to the client. Called once the relay is
    /// ready to receive follow-up messages.
    async fn start(&self) -> Result<(), TransportError>;

    /// Push a protocol message to the client.
    async fn send(&self, message: String) -> Result<(), TransportError>;

    /// Close the connection. Idempotent.
    fn close(&self);

    /// Cancelled when the remote client hangs up.
    fn hang_up(&self) -> CancellationToken;

    /// Cancelled when the transport is closed from this side.
    fn closed(&self) -> CancellationToken;
}

/// Protocol engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Engine not connected")]
    NotConnected,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// The streaming protocol engine, one instance per session.
///
/// The relay only knows this boundary: a transport at open time and a
/// request/response pair per follow-up message.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Bind the engine to the session transport.
    async fn connect(&self, transport: Arc<dyn Transport>) -> Result<(), EngineError>;

    /// Handle one posted message, writing the HTTP outcome to `response`.
    async fn handle_post_message(
        &self,
        request: &mut dyn RelayRequest,
        response: &mut dyn ResponseSink,
    ) -> Result<(), EngineError>;

    /// Whether messages on the same session may be handled concurrently.
    fn concurrent(&self) -> bool {
        true
    }
}

/// Factory producing a fresh engine for each opened session.
pub type EngineInit = Arc<dyn Fn() -> Arc<dyn ProtocolEngine> + Send + Sync>;
