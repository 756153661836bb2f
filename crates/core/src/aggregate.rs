//! The event-sourced aggregate contract.

use crate::error::{DomainError, DomainResult};

pub trait AggregateRoot {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;

    /// Number of events applied so far, which is also the stream revision.
    fn version(&self) -> u64;
}

/// What the writer believes the stream revision to be.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    Any,
    /// The stream must not exist yet (first write of a new factor or operation).
    NoStream,
    Exact(u64),
}

impl ExpectedVersion {
    /// Expectation for a stream last seen at `revision`.
    pub fn for_stream(revision: u64) -> Self {
        if revision == 0 {
            ExpectedVersion::NoStream
        } else {
            ExpectedVersion::Exact(revision)
        }
    }

    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => actual == 0,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "stream moved on (expected {self}, actual {actual})"
            )))
        }
    }
}

impl core::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("any revision"),
            ExpectedVersion::NoStream => f.write_str("no stream"),
            ExpectedVersion::Exact(v) => write!(f, "revision {v}"),
        }
    }
}

/// Pure decision and evolution.
///
/// `handle` never performs IO and never mutates; it answers with the events a command
/// produces. An empty answer means the command is accepted and changes nothing, which is
/// how repeated conclusions stay idempotent. `apply` folds one event into state.
pub trait Aggregate: AggregateRoot {
    type Command: Clone + core::fmt::Debug;
    type Event: Clone + core::fmt::Debug;
    type Error: core::fmt::Debug;

    fn apply(&mut self, event: &Self::Event);

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;
}
