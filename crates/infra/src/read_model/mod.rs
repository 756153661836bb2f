//! Disposable, tenant-partitioned storage for projections.
//!
//! Everything here can be thrown away and rebuilt from the event store.

pub mod tenant_store;

pub use tenant_store::{InMemoryTenantStore, TenantStore};
