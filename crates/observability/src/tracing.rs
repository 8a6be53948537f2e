//! Tracing subscriber initialization.
//!
//! Log level comes from `RUST_LOG` (default `info`). Reservation conflicts log
//! at `debug`, store refresh failures at `warn` and protocol violations at
//! `error`, so `RUST_LOG=dcbkit_infra=debug` shows every refused reservation.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// JSON logs with timestamps for long-running processes.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(DEFAULT_FILTER))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

/// Human-readable logs captured by the test harness (`cargo test -- --nocapture`
/// to see them). Defaults to `debug` for the workspace crates.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("dcbkit_core=debug,dcbkit_events=debug,dcbkit_infra=debug"))
        .with_test_writer()
        .try_init();
}
