//! Tracing subscriber setup.
//!
//! Human-readable output goes to stderr. With a log file, events are written
//! as JSON lines through a non-blocking writer; keep the returned guard alive
//! until exit so buffered lines are flushed.

use crate::{Error, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// `RUST_LOG`, when set, wins over `level`.
fn build_filter(level: &str, env: Option<&str>) -> Result<EnvFilter> {
    let directives = env.filter(|s| !s.trim().is_empty()).unwrap_or(level);
    EnvFilter::try_new(directives)
        .map_err(|e| Error::Config(format!("Invalid log filter '{}': {}", directives, e)))
}

/// Install the global subscriber.
pub fn init(level: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(level, env.as_deref())?;

    match log_file {
        Some(path) => {
            let file_name = path.file_name().ok_or_else(|| {
                Error::Config(format!("Invalid log file path: {}", path.display()))
            })?;
            let dir = match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => Path::new("."),
            };
            std::fs::create_dir_all(dir)?;

            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_writer(writer)
                .try_init()
                .map_err(|e| Error::Other(format!("Unable to initialize logging: {}", e)))?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| Error::Other(format!("Unable to initialize logging: {}", e)))?;
            Ok(None)
        }
    }
}
