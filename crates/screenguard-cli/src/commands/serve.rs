//! Daemon process commands

use anyhow::Result;
use screenguard_core::{config::get_data_dir, Daemon, ScreenGuardConfig};
use std::fs::{create_dir_all, OpenOptions};

pub async fn run_daemon(config: &ScreenGuardConfig) -> Result<()> {
    log::info!("Starting ScreenGuard daemon...");
    let daemon = Daemon::new(config).await?;
    if let Err(e) = daemon.run_with_signals().await {
        log::error!("Daemon exited with a fatal error: {e:#}");
        return Err(e);
    }
    Ok(())
}

/// Route logs to `<data dir>/screenguard.log`
pub fn setup_file_logging() -> Result<()> {
    let log_path = get_data_dir()?.join("screenguard.log");

    if let Some(parent) = log_path.parent() {
        create_dir_all(parent)?;
    }

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .format_timestamp_secs()
        .init();

    Ok(())
}
