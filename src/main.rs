#![forbid(unsafe_code)]

//! `acp-broker` binary entrypoint.
//!
//! Wires the broker to stdin/stdout. All logging goes to stderr: stdout is
//! the upstream protocol channel.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use acp_broker::broker::Broker;
use acp_broker::{AppError, Config, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "acp-broker", about = "Local ACP workspace broker", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    ///
    /// Missing file is not an error; built-in defaults apply, and
    /// `session/new` will fail until `agent.command` is configured.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Log output format (text or json). Logs are written to stderr.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("acp-broker bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = match Config::load_from_path(&args.config) {
        Ok(config) => config,
        Err(err) => {
            warn!(%err, "could not load config, using defaults");
            Config::default()
        }
    };

    let broker = Broker::new(Arc::new(config));
    broker
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await?;

    info!("acp-broker shut down");
    Ok(())
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
