use std::process::ExitCode;

use anyhow::{anyhow, Result};
use tollgate_core::config::{AppConfig, LoadOptions, LogFormat};
use tracing::Level;

// Logs go to stderr; stdout carries the JSON command payload.
fn init_logging(config: &AppConfig) -> Result<()> {
    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    let initialized = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    initialized.map_err(|error| anyhow!("failed to initialize logging: {error}"))
}

fn main() -> Result<ExitCode> {
    // Commands report config problems themselves, so logging only starts from a valid config.
    if let Ok(config) = AppConfig::load(LoadOptions::default()) {
        init_logging(&config)?;
    }

    Ok(tollgate_cli::run())
}
