//! Structured logging setup.
//!
//! `RUST_LOG` wins over the configured level when set, so a deployment can turn
//! on `login_proxy::protocol=trace` without editing the config file.

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber. Later calls are ignored.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()));

    let installed = if config.json_format {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .try_init()
    };

    if installed.is_ok() {
        info!(app = %config.app_name, level = %config.log_level, json = config.json_format, "Logging initialized");
    }
}
