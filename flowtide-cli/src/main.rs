//! ## flowtide
//! **Command line front end of the capture import pipeline**
//!
//! Loads the layered configuration, configures an in-memory application
//! context and runs imports over capture files (or, with the `live`
//! feature, a network interface).

use clap::Parser;
use flowtide_telemetry::EventLogger;

mod commands;
mod error;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;
    EventLogger::init(&config.telemetry.log_level, config.telemetry.json);

    match cli.command {
        Commands::Import(args) => commands::import(config, args).await,
        Commands::Validate(args) => commands::validate(config, args).await,
        #[cfg(feature = "live")]
        Commands::Live(args) => commands::live(config, args).await,
    }
}
