//! File logging for the `pairgate` binary.
//!
//! Stdout belongs to the command's own output, so diagnostics go to
//! `<PAIRGATE_HOME>/logs/pairgate.log` through a non-blocking writer.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::paths;

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "PAIRGATE_LOG";

const LOG_FILE: &str = "pairgate.log";

/// Filter used when `PAIRGATE_LOG` is unset or invalid.
pub fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "pairgate=debug,pairgate_core=debug"
    } else {
        "pairgate=info,pairgate_core=info"
    }
}

/// Installs the global subscriber writing to the default log directory.
///
/// Keep the returned guard alive until exit so buffered lines are flushed.
///
/// # Errors
/// Returns an error if the log directory cannot be created or a subscriber is
/// already installed.
pub fn init(verbose: bool) -> Result<WorkerGuard> {
    init_in(&paths::logs_dir(), verbose)
}

/// Installs the global subscriber writing to `dir`.
///
/// # Errors
/// Returns an error if `dir` cannot be created or a subscriber is already
/// installed.
pub fn init_in(dir: &Path, verbose: bool) -> Result<WorkerGuard> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let appender = tracing_appender::rolling::never(dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(guard)
}
