//! Event mechanics: the `Event` trait, tenant-scoped envelopes, and pub/sub.
//!
//! Nothing in here knows about stock; the ledger crate implements `Event` for
//! its movement events and infra publishes committed envelopes on a bus.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
