//! Diagnostic tracing for deepdb.
//!
//! - **Tracing (this module)**: `RUST_LOG`-filtered diagnostics on stderr.
//!   Not persisted.
//! - **Run log (`io/run_log`)**: Prompts, replies and state snapshots under
//!   `.deepdb/runs/`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`, so unresolved query errors and
/// malformed evaluations are visible without extra flags.
///
/// ```bash
/// RUST_LOG=deepdb=debug deepdb run
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
