//! Logging setup
//!
//! `CONVEYOR_LOG_FORMAT=json|pretty` (default pretty), `RUST_LOG` filter
//! (default `conveyor=info`), optional daily-rolling file copy in
//! `CONVEYOR_LOG_DIR`.

use crate::telemetry;
use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FORMAT_ENV: &str = "CONVEYOR_LOG_FORMAT";
const LOG_DIR_ENV: &str = "CONVEYOR_LOG_DIR";
const DEFAULT_FILTER: &str = "conveyor=info";
const LOG_FILE_PREFIX: &str = "conveyor.log";

/// Install the global subscriber
///
/// The returned guard flushes the file writer on drop and must live until exit.
pub fn init() -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .context("Failed to create env filter")?;

    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let stdout_layer = if json {
        // Production: JSON structured logging
        fmt::layer().json().boxed()
    } else {
        // Development: Pretty formatting with colors
        fmt::layer().pretty().boxed()
    };

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .with(telemetry::layer()?)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
