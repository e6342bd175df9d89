//! HTTP surface for the session relay.
//!
//! Provides:
//! - SSE event framing and endpoint naming
//! - SSE session transport (feature: sse)
//! - Live request adapter and `/sse` + `/message` router (feature: sse)

pub mod protocol;

#[cfg(feature = "sse")]
pub mod http;
#[cfg(feature = "sse")]
pub mod router;
#[cfg(feature = "sse")]
pub mod sse;

pub use protocol::{StreamEvent, endpoint_url};

#[cfg(feature = "sse")]
pub use router::{RelayState, relay_router};
#[cfg(feature = "sse")]
pub use sse::{SseStream, SseTransport};
