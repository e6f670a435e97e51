use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use er_stats::aggregations::{
    StatsContext, character_rankings, equipment_rankings, mmr_change_statistics,
};
use er_stats::cli::{default_team_mode, env_value, flag_value, parse_matching_mode};
use er_stats::db::SqliteStore;

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");

    let args: Vec<String> = std::env::args().skip(1).collect();

    let db_path = flag_value(&args, "--db")
        .or_else(|| env_value("ER_DB_PATH"))
        .map(PathBuf::from)
        .context("database path required via --db or ER_DB_PATH")?;
    let stat = flag_value(&args, "--stat").unwrap_or_else(|| "character".to_string());
    let matching_mode = flag_value(&args, "--mode")
        .as_deref()
        .and_then(parse_matching_mode)
        .context("--mode required (integer code or normal/ranked/cobalt/union)")?;
    let matching_team_mode = match flag_value(&args, "--team-mode") {
        Some(raw) => raw
            .parse::<i64>()
            .context("--team-mode must be an integer")?,
        None => default_team_mode(matching_mode).with_context(|| {
            format!("no default team mode for matching mode {matching_mode}; pass --team-mode")
        })?,
    };
    let server_name = flag_value(&args, "--server");
    let min_samples = match flag_value(&args, "--min-samples") {
        Some(raw) => raw
            .parse::<i64>()
            .context("--min-samples must be an integer")?,
        None => 5,
    };

    let store = SqliteStore::open(&db_path)?;
    store.setup_schema()?;

    let season_id = match flag_value(&args, "--season") {
        Some(raw) => raw.parse::<i64>().context("--season must be an integer")?,
        None => infer_season(&store, matching_mode)?,
    };

    let ctx = StatsContext {
        season_id,
        server_name,
        matching_mode,
        matching_team_mode,
    };
    let rows = match stat.as_str() {
        "character" => character_rankings(&store, &ctx)?,
        "equipment" => equipment_rankings(&store, &ctx, min_samples)?,
        "mmr" => mmr_change_statistics(&store, &ctx)?,
        other => return Err(anyhow!("unsupported --stat '{other}' (character/equipment/mmr)")),
    };
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

/// Ranked queries default to the latest known season; other modes use 0.
fn infer_season(store: &SqliteStore, matching_mode: i64) -> Result<i64> {
    if matching_mode != 3 {
        return Ok(0);
    }
    let max_season = store
        .connection()
        .query_row("SELECT MAX(season_id) FROM matches", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .context("query latest season")?;
    max_season.context(
        "no matches in the database; cannot infer a season for ranked mode, pass --season",
    )
}
