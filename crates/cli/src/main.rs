//! cairn CLI
//!
//! Operator tool for cairn session stores: encrypts configuration secrets,
//! inspects stored sessions and runs expiration headless.

mod commands;
mod config;

use std::path::PathBuf;

use cairn_crypto::{MasterKey, parse_master_key};
use cairn_redis::RedisConfig;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::{CairnConfig, LogFormat, LoggingConfig};

/// cairn: distributed session store tooling.
#[derive(Parser, Debug)]
#[command(name = "cairn", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "CAIRN_CONFIG", default_value = "cairn.toml", global = true)]
    config: PathBuf,

    /// Output format.
    #[arg(long, default_value = "text", global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encrypt a secret for the store configuration. Reads plaintext from stdin.
    Encrypt(commands::encrypt::EncryptArgs),
    /// Show the metadata and attribute names of a stored session.
    Inspect(commands::inspect::InspectArgs),
    /// Run session expiration without serving requests, until Ctrl+C.
    Sweep,
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Master key from `CAIRN_MASTER_KEY`, if set.
fn master_key() -> anyhow::Result<Option<MasterKey>> {
    match std::env::var("CAIRN_MASTER_KEY") {
        Ok(raw) => Ok(Some(
            parse_master_key(&raw).map_err(|e| anyhow::anyhow!("invalid CAIRN_MASTER_KEY: {e}"))?,
        )),
        Err(_) => Ok(None),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = CairnConfig::load(&cli.config)?;
    init_logging(&config.logging);

    let master_key = master_key()?;
    match cli.command {
        Command::Encrypt(args) => commands::encrypt::run(&args, master_key.as_ref()),
        Command::Inspect(args) => {
            let redis = RedisConfig::parse_with_master_key(&config.redis.url, master_key.as_ref())?;
            commands::inspect::run(&config, &redis, &args, &cli.format).await
        }
        Command::Sweep => {
            let redis = RedisConfig::parse_with_master_key(&config.redis.url, master_key.as_ref())?;
            commands::sweep::run(&config, &redis).await
        }
    }
}
