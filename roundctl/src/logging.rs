//! Diagnostic tracing for the controller.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: phase transitions and process plumbing,
//!   filtered by `RUST_LOG`, written to stderr.
//!
//! - **Round records (`io/round_log`)**: `rounds/<n>/round.json` and the
//!   generator log under the data home. Always written, unaffected by
//!   `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `info` so phase transitions show up in batch
/// logs.
///
/// # Example
/// ```bash
/// RUST_LOG=roundctl=debug roundctl round 3 traj 16 50000 120 /lustre/admd
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
