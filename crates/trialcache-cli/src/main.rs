//! trialcache - inspect and maintain a local replica database.
//!
//! Usage:
//!   trialcache stats [table...]
//!   trialcache dump <table>
//!   trialcache clean-expired <table>
//!   trialcache evict <table> <budget-bytes>
//!   trialcache pending [table]
//!   trialcache reset
//!
//! The database path comes from the config file, or `TRIALCACHE_DB` when set.

use std::io;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use trialcache_core::store::{MutationStatus, RowStore, SqliteOpener, StoreOpener, VersionedRow};
use trialcache_core::{
    BootstrapCoordinator, ExpirationPolicy, NetworkStatus, ReplicaConfig, ReplicaTable, TableOptions,
};

const USAGE: &str = "\
Usage: trialcache <command> [args]

Commands:
  stats [table...]              Row counts, size, and sync state per table
  dump <table>                  Print every row of a table as JSON lines
  clean-expired <table>         Purge stale clean rows
  evict <table> <budget-bytes>  Shrink a table to a byte budget
  pending [table]               List queued local mutations
  reset                         Delete the local database";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // RUST_LOG controls the level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

fn load_config() -> Result<ReplicaConfig> {
    let mut config = ReplicaConfig::load()?;
    if let Ok(path) = std::env::var("TRIALCACHE_DB") {
        config.database_path = Some(PathBuf::from(path));
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };
    let rest = &args[1..];

    let config = load_config()?;
    info!(command = %command, "trialcache starting");

    match command.as_str() {
        "stats" => stats(&config, rest).await,
        "dump" => dump(&config, required(rest, 0, "table")?).await,
        "clean-expired" => clean_expired(&config, required(rest, 0, "table")?).await,
        "evict" => {
            let table = required(rest, 0, "table")?;
            let budget: u64 = required(rest, 1, "budget-bytes")?
                .parse()
                .context("budget-bytes must be a whole number of bytes")?;
            evict(&config, table, budget).await
        }
        "pending" => pending(&config, rest.first().map(String::as_str)).await,
        "reset" => reset(&config),
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
}

fn required<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("Missing <{}>\n\n{}", name, USAGE))
}

fn coordinator(config: &ReplicaConfig) -> Result<BootstrapCoordinator> {
    BootstrapCoordinator::from_config(config).context("Failed to locate replica database")
}

async fn open_store(config: &ReplicaConfig) -> Result<RowStore> {
    let db = coordinator(config)?
        .bootstrap()
        .await
        .context("Failed to open replica database")?;
    Ok(RowStore::new(db))
}

fn open_table(config: &ReplicaConfig, table: &str) -> Result<ReplicaTable<Value>> {
    Ok(ReplicaTable::new(
        table,
        coordinator(config)?,
        NetworkStatus::default(),
        TableOptions::from_config(config, table),
    ))
}

async fn stats(config: &ReplicaConfig, tables: &[String]) -> Result<()> {
    let store = open_store(config).await?;
    let names = if tables.is_empty() {
        store.tables().await?
    } else {
        tables.to_vec()
    };
    if names.is_empty() {
        println!("No cached tables");
        return Ok(());
    }

    println!(
        "{:<24} {:>8} {:>8} {:>12} {:>8}  {:<10} LAST SYNC",
        "TABLE", "ROWS", "DIRTY", "BYTES", "PENDING", "STATUS"
    );
    for name in &names {
        let stats = store.stats(name).await?;
        let meta = store.load_metadata(name).await?;
        let (status, age) = match &meta {
            Some(m) => (m.sync_status.as_str(), m.age_display()),
            None => ("-", "never".to_string()),
        };
        println!(
            "{:<24} {:>8} {:>8} {:>12} {:>8}  {:<10} {}",
            name,
            stats.row_count,
            stats.dirty_count,
            stats.estimated_bytes,
            stats.pending_mutations,
            status,
            age
        );
        if let Some(error) = meta.as_ref().and_then(|m| m.error_message.as_deref()) {
            println!("  last error: {}", error);
        }
    }
    Ok(())
}

/// Print every stored row, stale ones included. Dumping never purges.
async fn dump(config: &ReplicaConfig, table: &str) -> Result<()> {
    let store = open_store(config).await?;
    let rows: Vec<VersionedRow<Value>> = store
        .scan(table, None, ExpirationPolicy::never())
        .await
        .with_context(|| format!("Failed to read table '{}'", table))?;
    for row in &rows {
        println!("{}", serde_json::to_string(&row.data)?);
    }
    eprintln!("{} rows", rows.len());
    Ok(())
}

async fn clean_expired(config: &ReplicaConfig, table: &str) -> Result<()> {
    let replica = open_table(config, table)?;
    let removed = replica.clean_expired().await?;
    println!(
        "Removed {} expired rows from '{}' (ttl {}s)",
        removed,
        table,
        replica.options().ttl.as_secs()
    );
    Ok(())
}

async fn evict(config: &ReplicaConfig, table: &str, budget: u64) -> Result<()> {
    let replica = open_table(config, table)?;
    let report = replica.evict(budget).await?;
    println!(
        "Evicted {} rows from '{}': {} -> {} bytes (budget {})",
        report.evicted, table, report.bytes_before, report.bytes_after, budget
    );
    if report.over_budget {
        println!("Still over budget: remaining rows are dirty or recently modified");
    }
    Ok(())
}

async fn pending(config: &ReplicaConfig, table: Option<&str>) -> Result<()> {
    let store = open_store(config).await?;
    let mutations = store
        .list_mutations(
            table,
            &[
                MutationStatus::Queued,
                MutationStatus::Sending,
                MutationStatus::Failed,
            ],
        )
        .await?;
    if mutations.is_empty() {
        println!("No pending mutations");
        return Ok(());
    }
    for m in &mutations {
        println!(
            "{}  {:<20} {:<24} {:<8} attempts={} {}",
            m.mutation_id,
            m.table,
            m.row_id,
            m.status.as_str(),
            m.attempts,
            m.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn reset(config: &ReplicaConfig) -> Result<()> {
    let path = config.database_path()?;
    let opener = SqliteOpener::new(&path, config.operation_timeout());
    opener
        .destroy()
        .with_context(|| format!("Failed to delete {}", path.display()))?;
    println!("Deleted {}", path.display());
    Ok(())
}
