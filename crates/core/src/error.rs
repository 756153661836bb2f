//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic business failures only. Infrastructure failures (storage, ledger
/// transport) are modelled by the infra crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Input failed validation; `field` names the offending input.
    #[error("validation failed on `{field}`: {message}")]
    Validation { field: String, message: String },

    /// A mutation was attempted outside its allowed status set.
    ///
    /// Retryable after the caller refreshes its view of the aggregate.
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// A referenced resource does not exist (or is no longer eligible).
    #[error("not found: {0}")]
    NotFound(String),

    /// A domain invariant was violated (arithmetic overflow, corrupted history).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Optimistic concurrency conflict (stale stream revision).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn state_conflict(msg: impl Into<String>) -> Self {
        Self::StateConflict(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Offending field for validation errors.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Validation { field, .. } => Some(field),
            _ => None,
        }
    }
}
