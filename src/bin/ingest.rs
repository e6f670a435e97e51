use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;

use er_stats::api_client::{
    DEFAULT_BASE_URL, DEFAULT_MAX_RETRIES, DEFAULT_MIN_INTERVAL, ErApiClient,
};
use er_stats::cli::{env_value, flag_present, flag_value, flag_values, split_list};
use er_stats::db::SqliteStore;
use er_stats::ingest::{IngestOptions, IngestionManager, Seed};
use er_stats::parquet_export::ParquetExporter;

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
    let max_retries = match flag_value(&args, "--max-retries") {
        Some(raw) => raw
            .parse::<u32>()
            .context("--max-retries must be an integer")?,
        None => DEFAULT_MAX_RETRIES,
    };
    let depth = match flag_value(&args, "--depth") {
        Some(raw) => raw.parse::<u32>().context("--depth must be an integer")?,
        None => 1,
    };
    let max_games = match flag_value(&args, "--max-games") {
        Some(raw) => Some(
            raw.parse::<usize>()
                .context("--max-games must be an integer")?,
        ),
        None => None,
    };

    let seeds = collect_seeds(&args);
    if seeds.is_empty() {
        return Err(anyhow!(
            "no seeds provided; pass --uid/--nickname or set ER_SEED_UIDS/ER_SEED_NICKNAMES"
        ));
    }

    let store = SqliteStore::open(&db_path)?;
    store.setup_schema()?;

    let mut client = ErApiClient::new(&base_url, api_key, min_interval, max_retries)?;

    if !flag_present(&args, "--skip-catalog-refresh") {
        let catalogs_ok = refresh_catalogs(&store, &mut client);
        if !catalogs_ok && flag_present(&args, "--require-catalog-refresh") {
            return Err(anyhow!(
                "character or item catalog refresh failed; aborting due to --require-catalog-refresh"
            ));
        }
    }

    let options = IngestOptions {
        max_games_per_user: max_games,
        only_newer_games: !flag_present(&args, "--include-older-games"),
        ..IngestOptions::default()
    };
    let mut manager =
        IngestionManager::new(client, &store, options).with_progress(report_progress);
    if let Some(parquet_dir) = flag_value(&args, "--parquet-dir").or_else(|| env_value("ER_PARQUET_DIR")) {
        manager = manager.with_parquet(ParquetExporter::new(&PathBuf::from(parquet_dir))?);
    }

    let result = manager.ingest_from_seeds(&seeds, depth);
    // Flush the columnar buffers even when the traversal failed part-way.
    let flush_result = manager.finish_parquet();
    result?;
    flush_result?;

    println!("Ingest complete");
    println!("DB: {}", db_path.display());
    println!("Seeds: {}", seeds.len());
    Ok(())
}

fn report_progress(message: &str) {
    println!("{}: {message}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
}

fn collect_seeds(args: &[String]) -> Vec<Seed> {
    let mut seeds = Vec::new();
    for uid in flag_values(args, "--uid") {
        seeds.push(Seed::Uid(uid));
    }
    if let Some(raw) = env_value("ER_SEED_UIDS") {
        for uid in split_list(&raw) {
            seeds.push(Seed::Uid(uid));
        }
    }
    for nickname in flag_values(args, "--nickname") {
        seeds.push(Seed::Nickname(nickname));
    }
    if let Some(raw) = env_value("ER_SEED_NICKNAMES") {
        for nickname in split_list(&raw) {
            seeds.push(Seed::Nickname(nickname));
        }
    }
    seeds
}

fn refresh_catalogs(store: &SqliteStore, client: &mut ErApiClient) -> bool {
    let characters_ok = match client.fetch_character_attributes() {
        Ok(entries) => match store.refresh_characters(&entries) {
            Ok(count) => {
                report_progress(&format!("Stored {count} character definitions"));
                true
            }
            Err(err) => {
                report_progress(&format!("Failed to store character catalog: {err}"));
                false
            }
        },
        Err(err) => {
            report_progress(&format!("Failed to refresh character catalog: {err}"));
            false
        }
    };

    let items_ok = match client
        .fetch_item_armor()
        .and_then(|mut armor| {
            let weapons = client.fetch_item_weapon()?;
            armor.extend(weapons);
            Ok(armor)
        }) {
        Ok(entries) => match store.refresh_items(&entries) {
            Ok(count) => {
                report_progress(&format!("Stored {count} item definitions"));
                true
            }
            Err(err) => {
                report_progress(&format!("Failed to store item catalog: {err}"));
                false
            }
        },
        Err(err) => {
            report_progress(&format!("Failed to refresh item catalog: {err}"));
            false
        }
    };

    characters_ok && items_ok
}
