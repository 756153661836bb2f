//! Infrastructure layer: event store, command dispatch, projections, external
//! collaborators (eligibility, ledger, document bundles) and the discounting service.

pub mod bundle;
pub mod claims;
pub mod command_dispatcher;
pub mod eligibility;
pub mod event_store;
pub mod ledger;
pub mod projections;
pub mod read_model;
pub mod service;

#[cfg(test)]
mod integration_tests;

pub use service::{
    ConcludeOutcome, DiscountingService, FactorInput, FactorPatch, InMemoryDiscountingService,
    NewItem, ServiceError,
};
