//! Projections (read model builders).
//!
//! Projections consume published envelopes and build tenant-isolated read models. They
//! are idempotent under at-least-once delivery (per-stream cursors) and rebuildable from
//! the event stream.

pub mod cursor;
pub mod factors;
pub mod operations;

pub use cursor::{CursorCheck, StreamCursors};
pub use factors::{FACTOR_AGGREGATE, FactorDirectoryProjection, FactorProjectionError, FactorReadModel};
pub use operations::{
    OPERATION_AGGREGATE, OperationProjectionError, OperationSummary, OperationSummaryProjection,
};
