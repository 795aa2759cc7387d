mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use screenguard_core::ScreenGuardConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "screenguard")]
#[command(about = "Screen peeking detection daemon", long_about = None)]
struct Cli {
    /// Config file (defaults to <config dir>/screenguard/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the detection daemon in the foreground
    Serve {
        /// Write logs to <data dir>/screenguard.log instead of stderr
        #[arg(long)]
        log_file: bool,
    },
    /// Start detection for a user and print frames until Ctrl-C
    Watch {
        #[arg(short, long)]
        user: String,
        /// Print raw JSON frames
        #[arg(long)]
        json: bool,
    },
    /// Show a user's session status and alert statistics
    Status {
        #[arg(short, long)]
        user: String,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Commands::Serve { log_file: true }) {
        commands::serve::setup_file_logging()?;
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .init();
    }

    let config = ScreenGuardConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { .. } => commands::serve::run_daemon(&config).await,
        Commands::Watch { user, json } => commands::watch::watch_user(&config, &user, json).await,
        Commands::Status { user } => commands::status::show_status(&config, &user).await,
        Commands::Config => commands::config::show_config(&config),
    }
}
