//! Session ownership and cross-process message relay.
//!
//! Provides:
//! - `SessionRelay` - Serve a session held by this process
//! - `DispatchRelay` - Forward follow-up messages to the owning process
//! - `SessionRegistry` - Process-local table of open sessions
//! - Broker implementations (memory, Redis)

pub mod broker;
pub mod dispatch;
pub mod events;
pub mod registry;
pub mod relay;

#[cfg(test)]
mod testing;

#[cfg(feature = "memory")]
pub use broker::MemoryBroker;
#[cfg(feature = "redis")]
pub use broker::RedisBroker;
pub use dispatch::{DispatchError, DispatchRelay};
pub use events::{CloseReason, SessionEvent, SessionEvents};
pub use registry::{RegistryError, SessionInfo, SessionRegistry};
pub use relay::{RelayError, SessionRelay};
