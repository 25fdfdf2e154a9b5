use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mvengine::common::{ObjectId, ObjectIds, COMPACT_FULLY};
use mvengine::engine::{MapName, Resolution, StorageEngine};
use mvengine::{Database, DatabaseConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Inspect and maintain mvengine store files")]
struct Cli {
    #[arg(long, help = "Database path, without the .mv.db suffix")]
    data: PathBuf,

    #[arg(long, help = "File encryption key, hex encoded")]
    cipher_key: Option<String>,

    #[arg(long)]
    compress: bool,

    #[arg(long)]
    read_only: bool,

    #[arg(long, default_value = "info", help = "trace, debug, info, warn or error")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the maps of the store
    Info,
    /// List prepared transactions waiting for a decision
    InDoubt,
    /// Commit or roll back a prepared transaction, by name or id
    Resolve {
        transaction: String,
        #[arg(value_enum)]
        decision: Decision,
    },
    /// Drop temporary maps and maps of objects not listed in --keep
    Gc {
        #[arg(long, value_delimiter = ',')]
        keep: Vec<ObjectId>,
    },
    /// Compact the store file
    Compact {
        #[arg(long, default_value_t = 1000)]
        max_millis: u64,
        #[arg(long, help = "Rewrite the whole file after closing")]
        fully: bool,
    },
}

#[derive(Copy, Clone, ValueEnum)]
enum Decision {
    Commit,
    Rollback,
}

fn parse_hex(key: &str) -> Result<Vec<u8>> {
    if !key.is_ascii() || key.len() % 2 != 0 {
        bail!("Hex key must consist of an even number of hex digits");
    }
    (0..key.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&key[i..i + 2], 16)
                .with_context(|| format!("Invalid hex digits at {i}"))
        })
        .collect()
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("mvengine={level}")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let name = cli
        .data
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("Invalid database path {}", cli.data.display()))?
        .to_owned();
    let mut config = DatabaseConfig::with_path(name.clone(), &cli.data)
        .compress(cli.compress)
        .read_only(cli.read_only);
    if let Some(key) = &cli.cipher_key {
        config = config.encryption_key(parse_hex(key)?);
    }

    let engine = StorageEngine::global();
    let store = engine
        .open_store(&Database::new(config))
        .with_context(|| format!("Failed to open {}", cli.data.display()))?;

    let mut max_compact_time = Duration::ZERO;
    match cli.command {
        Command::Info => {
            for map in store.map_names()? {
                let kind = match map {
                    MapName::Temporary(_) => "temporary",
                    MapName::Table(_) => "table",
                    MapName::Index(_) => "index",
                    MapName::Other(_) => "system",
                };
                println!("{:<24} {kind}", map.to_string());
            }
            println!("in-doubt transactions: {}", store.in_doubt_transactions().len());
        }
        Command::InDoubt => {
            for transaction in store.in_doubt_transactions() {
                let description = transaction.describe()?;
                println!(
                    "{:>8} {:<10} {}",
                    transaction.transaction_id(),
                    description.state.to_string(),
                    description.name.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Resolve {
            transaction,
            decision,
        } => {
            let target = store
                .in_doubt_transactions()
                .into_iter()
                .find(|t| {
                    t.name() == Some(transaction.as_str())
                        || t.transaction_id().to_string() == transaction
                })
                .ok_or_else(|| anyhow!("No in-doubt transaction {transaction}"))?;
            let resolution = match decision {
                Decision::Commit => Resolution::Commit,
                Decision::Rollback => Resolution::Rollback,
            };
            target
                .resolve(resolution)
                .with_context(|| format!("Failed to resolve {transaction}"))?;
            println!("{transaction}: {}", target.describe()?.state);
        }
        Command::Gc { keep } => {
            let live: ObjectIds = keep.into_iter().collect();
            let report = store.remove_temporary_maps(&live)?;
            println!(
                "dropped {} temporary and {} orphaned maps",
                report.temporary, report.orphaned
            );
        }
        Command::Compact { max_millis, fully } => {
            store.compact_file(Duration::from_millis(max_millis))?;
            if fully {
                max_compact_time = COMPACT_FULLY;
            }
        }
    }

    engine
        .close_store(&name, max_compact_time)
        .with_context(|| format!("Failed to close {}", cli.data.display()))?;
    Ok(())
}
