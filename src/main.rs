//! `openerp-physical`: inspect and edit a physical storage backend.
//!
//! Usage:
//!   openerp-physical -c <config.toml> list [prefix]
//!   openerp-physical -c <config.toml> get <key>
//!   openerp-physical -c <config.toml> put <key> <value>
//!   openerp-physical -c <config.toml> delete <key>

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use openerp_physical::{BackendConfig, Entry, new_backend};
use tracing::info;

/// Physical storage CLI.
#[derive(Parser, Debug)]
#[command(name = "openerp-physical", about = "Physical storage backend tool")]
struct Cli {
    /// Path to a TOML file with a [backend] section.
    #[arg(short = 'c', long = "config", required = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the immediate children of a prefix.
    List {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Print the value stored under a key.
    Get { key: String },
    /// Store a value under a key.
    Put { key: String, value: String },
    /// Delete a key.
    Delete { key: String },
}

fn main() -> anyhow::Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    info!("Loading configuration from {}", cli.config.display());
    let config = BackendConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let backend = new_backend(&config)
        .with_context(|| format!("failed to open {} backend", config.kind))?;

    match cli.command {
        Command::List { prefix } => {
            for child in backend.list(&prefix)? {
                println!("{}", child);
            }
        }
        Command::Get { key } => match backend.get(&key)? {
            Some(entry) => println!("{}", String::from_utf8_lossy(&entry.value)),
            None => anyhow::bail!("no entry at {:?}", key),
        },
        Command::Put { key, value } => {
            backend.put(&Entry::new(key.as_str(), value.into_bytes()))?;
            info!("Stored {}", key);
        }
        Command::Delete { key } => {
            backend.delete(&key)?;
            info!("Deleted {}", key);
        }
    }

    Ok(())
}
