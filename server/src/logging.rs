//! Logging initialization.
//!
//! `RUST_LOG` takes precedence over the configured level.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogFormat, LoggingConfig};

pub fn init(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => registry.with(fmt::layer()).init(),
        (LogFormat::Pretty, false) => registry.with(fmt::layer().without_time()).init(),
        (LogFormat::Compact, true) => registry.with(fmt::layer().compact()).init(),
        (LogFormat::Compact, false) => {
            registry.with(fmt::layer().compact().without_time()).init()
        }
        (LogFormat::Json, true) => registry.with(fmt::layer().json()).init(),
        (LogFormat::Json, false) => registry.with(fmt::layer().json().without_time()).init(),
    }
}
