//! Tracing setup: stderr plus a daily-rolling log file.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::paths;

const LOG_PREFIX: &str = "esi-sync.log";

/// Default log directory: `logs` under [`paths::data_dir`].
pub fn default_log_dir() -> Result<PathBuf> {
  Ok(paths::data_dir()?.join("logs"))
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `verbose`. Keep the returned guard alive for the
/// life of the process or buffered file output is lost.
pub fn init(log_dir: Option<PathBuf>, verbose: bool) -> Result<WorkerGuard> {
  let log_dir = match log_dir {
    Some(dir) => dir,
    None => default_log_dir()?,
  };
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, LOG_PREFIX);
  let (file_writer, guard) = tracing_appender::non_blocking(appender);

  let default_level = if verbose { "debug" } else { "info" };
  let env_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

  let stderr_layer = fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(false);
  let file_layer = fmt::layer()
    .with_writer(file_writer)
    .with_target(true)
    .with_ansi(false);

  tracing_subscriber::registry()
    .with(env_filter)
    .with(stderr_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
