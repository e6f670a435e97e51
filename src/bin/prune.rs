use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;

use er_stats::cli::{env_value, flag_present, flag_value};
use er_stats::db::{SqliteStore, parse_iso};

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");

    let args: Vec<String> = std::env::args().skip(1).collect();

    let db_path = flag_value(&args, "--db")
        .or_else(|| env_value("ER_DB_PATH"))
        .map(PathBuf::from)
        .context("database path required via --db or ER_DB_PATH")?;
    let cutoff = flag_value(&args, "--before")
        .context("--before <ISO-8601 timestamp> is required")?;
    if parse_iso(&cutoff).is_none() {
        return Err(anyhow!(
            "--before must be an ISO-8601 timestamp with offset, got '{cutoff}'"
        ));
    }
    let reason = flag_value(&args, "--reason").unwrap_or_else(|| "retention_prune".to_string());

    let store = SqliteStore::open(&db_path)?;
    store.setup_schema()?;

    let prunable = store.count_matches_before(&cutoff)?;
    if !flag_present(&args, "--apply") {
        println!(
            "Would delete {prunable} matches starting before {cutoff} (dry run; pass --apply)"
        );
        return Ok(());
    }

    let summary = store.prune_matches_before(&cutoff, &reason, &Utc::now().to_rfc3339())?;
    println!("Prune complete");
    println!("Deleted: {}", summary.deleted);
    println!("Tombstoned: {}", summary.tombstoned);
    println!("Prune floor recorded at {cutoff}");
    Ok(())
}
