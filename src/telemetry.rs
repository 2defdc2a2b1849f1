//! Tracing initialization.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

const ENV_VAR: &str = "ENTDB_LOG";
const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber. Safe to call more than once (tests);
/// later calls are no-ops.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::builder()
        .with_env_var(ENV_VAR)
        .try_from_env()
        .unwrap_or_else(|_| {
            EnvFilter::new(config.filter.as_deref().unwrap_or(DEFAULT_FILTER))
        });

    if config.stdout {
        let _ = fmt().with_env_filter(filter).with_target(true).try_init();
    } else {
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init();
    }
}
