//! Core abstractions for relaying streaming sessions across stateless processes.
//!
//! This crate provides the shared vocabulary:
//! - `Broker`, `Transport` and `ProtocolEngine` traits
//! - `Subscription` - Handle on a single broker channel
//! - Envelope codec and broker channel naming
//! - `RelayRequest` / `ResponseSink` - Engine-facing request/response interfaces
//! - `RelayConfig` - Environment-driven configuration

pub mod channel;
pub mod config;
pub mod envelope;
pub mod http;
pub mod subscription;
pub mod traits;

pub use channel::{requests_channel, responses_channel};
pub use config::{ConfigError, RelayConfig};
pub use envelope::{EnvelopeError, HeaderValue, Headers, RequestEnvelope, ResponseEnvelope};
pub use http::{CapturedResponse, EnvelopeRequest, RelayRequest, ResponseSink};
pub use subscription::Subscription;
pub use traits::{
    Broker, BrokerError, EngineError, EngineInit, ProtocolEngine, SessionId, Transport,
    TransportError,
};
