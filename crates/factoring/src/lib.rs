//! Receivables discounting domain (event-sourced).
//!
//! Business rules for factors and factor operations: package assembly, immutable
//! versions, reconciliation of the factor's per-item response, and the settlement
//! figures produced when an operation concludes. Pure domain logic only.

pub mod factor;
pub mod installment;
pub mod item;
pub mod operation;
pub mod response;
pub mod settlement;
pub mod version;

pub use factor::{
    DeactivateFactor, Factor, FactorCommand, FactorDeactivated, FactorEvent, FactorId,
    FactorRegistered, FactorTerms, FactorUpdated, RegisterFactor, UpdateFactor,
};
pub use installment::{Custody, Installment, InstallmentId, InstallmentStatus};
pub use item::{ActionType, FactorOperationItem, ItemId, ItemStatus};
pub use operation::{
    AddItem, ApplyResponses, CancelOperation, ConcludeOperation, CreateOperation,
    FactorOperation, FactorOperationId, GenerateVersion, ItemAdded, ItemRemoved,
    OperationCancelled, OperationCommand, OperationConcluded, OperationCreated,
    OperationDetails, OperationDetailsUpdated, OperationEvent, OperationSent, OperationStatus,
    RemoveItem, ResponsesApplied, SendToFactor, UpdateOperationDetails, VersionGenerated,
};
pub use response::{CostBreakdown, FactorOperationResponse, ItemResponse, Resolution, ResponseStatus};
pub use settlement::SettlementSummary;
pub use version::{FactorOperationVersion, VersionId};
