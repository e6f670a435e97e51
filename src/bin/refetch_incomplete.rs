use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use er_stats::api_client::{
    DEFAULT_BASE_URL, DEFAULT_MAX_RETRIES, DEFAULT_MIN_INTERVAL, ErApiClient,
};
use er_stats::cli::{env_value, flag_present, flag_value, flag_values, parse_matching_mode};
use er_stats::db::SqliteStore;
use er_stats::ingest::{IngestOptions, IngestionManager};

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");

    let args: Vec<String> = std::env::args().skip(1).collect();

    let db_path = flag_value(&args, "--db")
        .or_else(|| env_value("ER_DB_PATH"))
        .map(PathBuf::from)
        .context("database path required via --db or ER_DB_PATH")?;
    let base_url = flag_value(&args, "--base-url")
        .or_else(|| env_value("ER_BASE_URL"))
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let api_key = flag_value(&args, "--api-key").or_else(|| env_value("ER_API_KEY"));
    let min_interval = match flag_value(&args, "--min-interval") {
        Some(raw) => Duration::from_secs_f64(
            raw.parse::<f64>()
                .context("--min-interval must be a number of seconds")?,
        ),
        None => DEFAULT_MIN_INTERVAL,
    };

    let store = SqliteStore::open(&db_path)?;
    store.setup_schema()?;

    let explicit: Vec<i64> = flag_values(&args, "--game-id")
        .iter()
        .filter_map(|raw| raw.parse::<i64>().ok())
        .collect();
    let game_ids = if explicit.is_empty() {
        let season_id = match flag_value(&args, "--season") {
            Some(raw) => Some(raw.parse::<i64>().context("--season must be an integer")?),
            None => None,
        };
        let matching_mode = flag_value(&args, "--mode")
            .as_deref()
            .and_then(parse_matching_mode);
        let limit = match flag_value(&args, "--limit") {
            Some(raw) => Some(raw.parse::<usize>().context("--limit must be an integer")?),
            None => None,
        };
        store.list_refetch_candidates(
            season_id,
            matching_mode,
            flag_present(&args, "--include-missing"),
            flag_present(&args, "--include-not-due"),
            &Utc::now().to_rfc3339(),
            limit,
        )?
    } else {
        explicit
    };

    if game_ids.is_empty() {
        println!("No incomplete matches are due for a re-fetch");
        return Ok(());
    }
    println!("Re-fetching {} incomplete matches", game_ids.len());

    let client = ErApiClient::new(&base_url, api_key, min_interval, DEFAULT_MAX_RETRIES)?;
    let mut manager = IngestionManager::new(client, &store, IngestOptions::default())
        .with_progress(report_progress);
    let summary = manager.refetch_incomplete_games(&game_ids)?;

    println!("Refetch complete");
    println!("Total: {}", summary.total);
    println!("Cleared: {}", summary.cleared);
    println!("Not found: {}", summary.not_found);
    println!("Empty: {}", summary.empty);
    println!("Still incomplete: {}", summary.still_incomplete);
    Ok(())
}

fn report_progress(message: &str) {
    println!("{}: {message}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
}
