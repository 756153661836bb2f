//! `factorops-core`: domain primitives shared by the discounting crates.
//!
//! Identifiers, money, the aggregate contract and the domain error taxonomy. No IO.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod money;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, TenantId};
pub use money::{Money, Rate};
