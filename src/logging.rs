//! Log setup for the `sfkv` binary.
//!
//! Logs go to `sfkv.log` in the data directory so stdout stays clean for
//! command output. The filter comes from `SFKV_LOG` (default `info`).

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config;

pub const LOG_FILE: &str = "sfkv.log";

/// Install the global subscriber. Keep the guard alive until exit so buffered
/// lines are flushed.
pub fn init(verbose: bool) -> Result<WorkerGuard> {
  let dir = config::data_dir()?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, LOG_FILE));

  let filter = EnvFilter::try_from_env("SFKV_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr = verbose.then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(stderr)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
