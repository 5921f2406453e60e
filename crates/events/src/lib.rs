//! `policybatch-events`: event bus and cache-invalidation events.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::{CacheChange, CacheEvent, Event};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
