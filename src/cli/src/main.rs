//! eventlog CLI - operator tool for eventlog stores.
//!
//! Reads, appends, truncates and deletes streams, follows subscriptions,
//! inspects processor checkpoints and applies the relational schema.

mod commands;
mod output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use eventlog_core::config::{BackendKind, Config, DatabaseConfig, LogServerConfig};
use eventlog_core::telemetry::{init_telemetry, shutdown_tracing, LogFormat, LogOutput, TelemetryConfig};

use commands::{checkpoint, migrate, stream, tail};
use output::OutputFormat;

/// eventlog - event-sourcing log store CLI
#[derive(Parser)]
#[command(
    name = "eventlog",
    version,
    about = "Inspect and operate eventlog stores",
    long_about = "CLI tool for reading and writing event streams, following subscriptions and managing processor checkpoints.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true, env = "EVENTLOG_CONFIG")]
    config: Option<PathBuf>,

    /// Use the postgres backend at this URL
    #[arg(long, global = true, conflicts_with = "log_server_url")]
    database_url: Option<String>,

    /// Use the log server at this URL
    #[arg(long, global = true)]
    log_server_url: Option<String>,

    /// Log store activity to stderr at the configured level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream operations
    #[command(subcommand)]
    Stream(stream::StreamCommands),

    /// Follow a stream until interrupted
    Tail(tail::TailArgs),

    /// Processor checkpoint operations
    #[command(subcommand)]
    Checkpoint(checkpoint::CheckpointCommands),

    /// Apply the relational schema
    Migrate,
}

impl Cli {
    /// Load configuration and apply command-line overrides.
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                let path = path.to_str().context("configuration path is not valid UTF-8")?;
                Config::from_file(path).with_context(|| format!("failed to load configuration from {path}"))?
            }
            None => Config::load().context("failed to load configuration from the environment")?,
        };

        if let Some(url) = &self.database_url {
            config.store.backend = BackendKind::Postgres;
            match config.database.as_mut() {
                Some(database) => database.url = url.clone(),
                None => config.database = Some(DatabaseConfig::new(url.clone())),
            }
        }

        if let Some(url) = &self.log_server_url {
            config.store.backend = BackendKind::LogServer;
            match config.log_server.as_mut() {
                Some(log_server) => log_server.url = url.clone(),
                None => config.log_server = Some(LogServerConfig::new(url.clone())),
            }
        }

        let logging = &mut config.observability.logging;
        logging.format = LogFormat::Compact;
        logging.output = LogOutput::Stderr;
        if !self.verbose {
            logging.level = "warn".to_string();
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let format = cli.output;
    let result = match cli.load_config() {
        Ok(config) => {
            let _metrics = init_telemetry(&TelemetryConfig::from(&config.observability))?;
            let result = match cli.command {
                Commands::Stream(cmd) => stream::execute(cmd, &config, format).await,
                Commands::Tail(args) => tail::execute(args, &config, format).await,
                Commands::Checkpoint(cmd) => checkpoint::execute(cmd, &config, format).await,
                Commands::Migrate => migrate::execute(&config).await,
            };
            shutdown_tracing();
            result
        }
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
