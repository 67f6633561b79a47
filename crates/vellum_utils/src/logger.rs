use std::sync::Once;

use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Filter applied when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "vellum=info";

/// Initialise the tracing subscriber once per process.
///
/// Safe to call from every entry point (CLI, tests, embedders); only the
/// first call installs a subscriber.
pub fn init_logging() {
    init_logging_with(DEFAULT_FILTER);
}

/// Initialise the tracing subscriber with an explicit fallback filter.
///
/// `RUST_LOG` still takes precedence when set.
pub fn init_logging_with(fallback: &str) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

        fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    });
}
