//! Append-only event store: one stream per aggregate instance, scoped by tenant.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
