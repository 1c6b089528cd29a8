//! Tracing setup.
//!
//! Call [`init`] once at process start. Filtering follows `RUST_LOG`
//! (e.g. `RUST_LOG=tidemark=debug`), defaulting to `info`.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber. Safe to call more than once;
/// later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
