//! Tracing initialization for embedding hosts
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! host's job. This helper gives hosts and tests a one-call setup honoring
//! `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; subsequent calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
