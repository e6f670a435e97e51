use anyhow::{Context, Result};
use rusqlite::params;
use serde_json::{Value, json};

use crate::db::SqliteStore;

/// Context filter shared by every stats query. A None server includes all
/// servers.
#[derive(Debug, Clone)]
pub struct StatsContext {
    pub season_id: i64,
    pub server_name: Option<String>,
    pub matching_mode: i64,
    pub matching_team_mode: i64,
}

const CONTEXT_FILTER: &str = "
    WHERE m.season_id = ?1
      AND m.matching_mode = ?2
      AND m.matching_team_mode = ?3
      AND (?4 IS NULL OR m.server_name = ?4)
";

/// Average rank and rank-bucket distribution per character.
pub fn character_rankings(store: &SqliteStore, ctx: &StatsContext) -> Result<Vec<Value>> {
    let sql = format!(
        r#"
        WITH filtered AS (
            SELECT ums.game_id, ums.uid, ums.character_num, ums.game_rank
            FROM user_match_stats AS ums
            JOIN matches AS m ON m.game_id = ums.game_id
            {CONTEXT_FILTER}
        )
        SELECT f.character_num,
               c.name AS character_name,
               AVG(f.game_rank) AS average_rank,
               SUM(CASE WHEN f.game_rank = 1 THEN 1 ELSE 0 END) AS rank_1,
               SUM(CASE WHEN f.game_rank BETWEEN 2 AND 3 THEN 1 ELSE 0 END) AS rank_2_3,
               SUM(CASE WHEN f.game_rank BETWEEN 4 AND 6 THEN 1 ELSE 0 END) AS rank_4_6,
               COUNT(*) AS matches
        FROM filtered AS f
        LEFT JOIN characters AS c ON c.character_code = f.character_num
        GROUP BY f.character_num, c.name
        HAVING matches > 0
        ORDER BY average_rank ASC
        "#
    );
    let mut stmt = store.connection().prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![
                ctx.season_id,
                ctx.matching_mode,
                ctx.matching_team_mode,
                ctx.server_name
            ],
            |row| {
                Ok(json!({
                    "character_num": row.get::<_, Option<i64>>(0)?,
                    "character_name": row.get::<_, Option<String>>(1)?,
                    "average_rank": row.get::<_, Option<f64>>(2)?,
                    "rank_1": row.get::<_, i64>(3)?,
                    "rank_2_3": row.get::<_, i64>(4)?,
                    "rank_4_6": row.get::<_, i64>(5)?,
                    "matches": row.get::<_, i64>(6)?,
                }))
            },
        )
        .context("query character rankings")?;
    collect_rows(rows)
}

/// Average rank and usage per equipment item, floored at `min_samples`.
pub fn equipment_rankings(
    store: &SqliteStore,
    ctx: &StatsContext,
    min_samples: i64,
) -> Result<Vec<Value>> {
    let sql = format!(
        r#"
        WITH filtered AS (
            SELECT ums.game_id, ums.uid, ums.game_rank
            FROM user_match_stats AS ums
            JOIN matches AS m ON m.game_id = ums.game_id
            {CONTEXT_FILTER}
        )
        SELECT e.item_id,
               i.name AS item_name,
               i.item_type,
               i.item_grade,
               AVG(f.game_rank) AS average_rank,
               COUNT(*) AS usage_count,
               AVG(e.grade) AS average_grade
        FROM filtered AS f
        JOIN equipment AS e
          ON e.game_id = f.game_id AND e.uid = f.uid
        LEFT JOIN items AS i
          ON i.item_code = e.item_id
        GROUP BY e.item_id
        HAVING usage_count >= ?5
        ORDER BY average_rank ASC
        "#
    );
    let mut stmt = store.connection().prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![
                ctx.season_id,
                ctx.matching_mode,
                ctx.matching_team_mode,
                ctx.server_name,
                min_samples
            ],
            |row| {
                Ok(json!({
                    "item_id": row.get::<_, Option<i64>>(0)?,
                    "item_name": row.get::<_, Option<String>>(1)?,
                    "item_type": row.get::<_, Option<String>>(2)?,
                    "item_grade": row.get::<_, Option<String>>(3)?,
                    "average_rank": row.get::<_, Option<f64>>(4)?,
                    "usage_count": row.get::<_, i64>(5)?,
                    "average_grade": row.get::<_, Option<f64>>(6)?,
                }))
            },
        )
        .context("query equipment rankings")?;
    collect_rows(rows)
}

/// Mean MMR gain and entry cost per character.
pub fn mmr_change_statistics(store: &SqliteStore, ctx: &StatsContext) -> Result<Vec<Value>> {
    let sql = format!(
        r#"
        WITH filtered AS (
            SELECT ums.character_num, ums.mmr_gain, ums.mmr_loss_entry_cost
            FROM user_match_stats AS ums
            JOIN matches AS m ON m.game_id = ums.game_id
            {CONTEXT_FILTER}
        )
        SELECT f.character_num,
               c.name AS character_name,
               AVG(f.mmr_gain) AS avg_mmr_gain,
               AVG(f.mmr_loss_entry_cost) AS avg_entry_cost,
               COUNT(*) AS matches
        FROM filtered AS f
        LEFT JOIN characters AS c ON c.character_code = f.character_num
        GROUP BY f.character_num, c.name
        HAVING matches > 0
        ORDER BY avg_mmr_gain DESC
        "#
    );
    let mut stmt = store.connection().prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![
                ctx.season_id,
                ctx.matching_mode,
                ctx.matching_team_mode,
                ctx.server_name
            ],
            |row| {
                Ok(json!({
                    "character_num": row.get::<_, Option<i64>>(0)?,
                    "character_name": row.get::<_, Option<String>>(1)?,
                    "avg_mmr_gain": row.get::<_, Option<f64>>(2)?,
                    "avg_entry_cost": row.get::<_, Option<f64>>(3)?,
                    "matches": row.get::<_, i64>(4)?,
                }))
            },
        )
        .context("query mmr statistics")?;
    collect_rows(rows)
}

fn collect_rows(
    rows: impl Iterator<Item = std::result::Result<Value, rusqlite::Error>>,
) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode stats row")?);
    }
    Ok(out)
}
