//! Tracing subscriber setup

use std::fs;

use eyre::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install a global fmt subscriber
///
/// `RUST_LOG` takes precedence over `config.level`. Logs go to `config.file`
/// when set, stderr otherwise. Calling this again after a subscriber is
/// installed is a no-op.
pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).context(format!("Invalid log level: {}", config.level))?,
    };

    let installed = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("Failed to create log directory")?;
            }
            let log_file = fs::File::create(path).context("Failed to create log file")?;
            tracing_subscriber::fmt()
                .with_writer(log_file)
                .with_ansi(false)
                .with_env_filter(filter)
                .try_init()
                .is_ok()
        }
        None => tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .try_init()
            .is_ok(),
    };

    if installed {
        info!(level = %config.level, file = ?config.file, "Logging initialized");
    }
    Ok(())
}
