//! Tracing setup.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize stdout logging. `filter` falls back to `RUST_LOG`, then to
/// `info`. Safe to call more than once; later calls are no-ops.
pub fn init(filter: Option<&str>, json: bool) {
    INIT.call_once(|| {
        let env_filter = match filter {
            Some(filter) => EnvFilter::new(filter),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        };
        let builder = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true);
        let result = if json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
        if result.is_err() {
            // Another subscriber won the race; keep theirs.
        }
    });
}

/// Quiet default for tests: respects RUST_LOG, otherwise warnings only.
pub fn init_for_tests() {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_test_writer()
            .try_init();
    });
}
