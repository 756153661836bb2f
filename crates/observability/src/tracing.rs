//! Tracing/logging initialization.
//!
//! JSON lines with timestamps; the filter comes from `RUST_LOG` when set.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber. Returns `false` if one was already installed.
pub fn init(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init()
        .is_ok()
}
