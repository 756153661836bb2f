//! Process-wide tracing setup shared by the binaries.

/// Initialize tracing with the default `info` filter (overridable via `RUST_LOG`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(tracing::DEFAULT_FILTER);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
