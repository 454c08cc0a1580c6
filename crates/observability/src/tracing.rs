//! Tracing/logging initialization.
//!
//! Every initializer reads `RUST_LOG` through `EnvFilter` and is safe to call
//! more than once: only the first successful call installs a subscriber, the
//! rest return `false`.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// JSON logs with timestamps, for production processes.
pub fn init() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(DEFAULT_FILTER))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Human-readable multi-line logs for local runs.
pub fn init_pretty() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(DEFAULT_FILTER))
        .pretty()
        .try_init()
        .is_ok()
}

/// Compact logs routed through the test harness so they only show for
/// failing tests. Quiet unless `RUST_LOG` says otherwise.
pub fn init_for_tests() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter("warn"))
        .compact()
        .with_test_writer()
        .try_init()
        .is_ok()
}
