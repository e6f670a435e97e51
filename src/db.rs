use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use rusqlite::{Connection, OptionalExtension, params};

use crate::api_client::{CharacterEntry, ItemEntry};

const PRUNE_BEFORE_KEY: &str = "prune_before";

/// Convert an upstream timestamp (`2025-10-27T23:24:03.003+0900`) into
/// RFC 3339 with a colonized offset. Already-ISO strings pass through;
/// unparseable values are returned as-is rather than failing ingestion.
pub fn parse_start_time(value: Option<&str>) -> Option<String> {
    let raw = value?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.to_rfc3339());
    }
    if let Ok(parsed) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(parsed.to_rfc3339());
    }
    Some(raw.to_string())
}

/// Parse a stored ISO timestamp for in-memory comparisons. None when the
/// stored string is one of the pass-through oddballs.
pub fn parse_iso(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .or_else(|| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z").ok())
}

#[derive(Debug, Clone)]
pub struct MatchRow {
    pub game_id: i64,
    pub season_id: i64,
    pub matching_mode: i64,
    pub matching_team_mode: i64,
    pub server_name: String,
    pub version_season: Option<i64>,
    pub version_major: Option<i64>,
    pub version_minor: Option<i64>,
    pub start_dtm: Option<String>,
    pub duration: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ParticipantRow {
    pub game_id: i64,
    pub uid: String,
    pub character_num: Option<i64>,
    pub skin_code: Option<i64>,
    pub game_rank: Option<i64>,
    pub player_kill: Option<i64>,
    pub player_assistant: Option<i64>,
    pub monster_kill: Option<i64>,
    pub mmr_gain: Option<i64>,
    pub mmr_loss_entry_cost: Option<i64>,
    pub victory: Option<i64>,
    pub play_time: Option<i64>,
    pub damage_to_player: Option<i64>,
    pub character_level: Option<i64>,
    pub best_weapon: Option<i64>,
    pub best_weapon_level: Option<i64>,
    pub team_number: Option<i64>,
    pub premade: Option<i64>,
    pub language: Option<String>,
    pub ml_bot: i64,
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub uid: String,
    pub nickname: Option<String>,
    pub start_time: Option<String>,
    pub last_mmr: Option<i64>,
    pub ml_bot: i64,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneSummary {
    pub deleted: usize,
    pub tombstoned: usize,
}

/// SQLite-backed repository for match data.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite db {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("set sqlite pragmas")?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("set sqlite pragmas")?;
        Ok(Self { conn })
    }

    /// Direct access for the aggregation queries and tests.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn setup_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    uid TEXT PRIMARY KEY,
                    nickname TEXT,
                    first_seen TEXT,
                    last_seen TEXT,
                    ingested_until TEXT,
                    last_checked TEXT,
                    last_mmr INTEGER,
                    ml_bot INTEGER DEFAULT 0,
                    last_language TEXT,
                    deleted INTEGER DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS matches (
                    game_id INTEGER PRIMARY KEY,
                    season_id INTEGER NOT NULL,
                    matching_mode INTEGER NOT NULL,
                    matching_team_mode INTEGER NOT NULL,
                    server_name TEXT NOT NULL,
                    incomplete INTEGER DEFAULT 0,
                    version_season INTEGER,
                    version_major INTEGER,
                    version_minor INTEGER,
                    start_dtm TEXT,
                    duration INTEGER
                );

                CREATE TABLE IF NOT EXISTS user_match_stats (
                    game_id INTEGER NOT NULL,
                    uid TEXT NOT NULL,
                    character_num INTEGER,
                    skin_code INTEGER,
                    game_rank INTEGER,
                    player_kill INTEGER,
                    player_assistant INTEGER,
                    monster_kill INTEGER,
                    mmr_gain INTEGER,
                    mmr_loss_entry_cost INTEGER,
                    victory INTEGER,
                    play_time INTEGER,
                    damage_to_player INTEGER,
                    character_level INTEGER,
                    best_weapon INTEGER,
                    best_weapon_level INTEGER,
                    team_number INTEGER,
                    premade INTEGER,
                    language TEXT,
                    ml_bot INTEGER,
                    PRIMARY KEY (game_id, uid),
                    FOREIGN KEY (game_id) REFERENCES matches(game_id) ON DELETE CASCADE,
                    FOREIGN KEY (uid) REFERENCES users(uid) ON DELETE CASCADE
                );

                CREATE TABLE IF NOT EXISTS equipment (
                    game_id INTEGER NOT NULL,
                    uid TEXT NOT NULL,
                    slot INTEGER NOT NULL,
                    item_id INTEGER,
                    grade INTEGER,
                    PRIMARY KEY (game_id, uid, slot),
                    FOREIGN KEY (game_id, uid) REFERENCES user_match_stats(game_id, uid)
                        ON DELETE CASCADE
                );

                CREATE TABLE IF NOT EXISTS characters (
                    character_code INTEGER PRIMARY KEY,
                    name TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS items (
                    item_code INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    mode_type INTEGER,
                    item_type TEXT,
                    item_grade TEXT,
                    is_completed_item INTEGER
                );

                CREATE TABLE IF NOT EXISTS deleted_matches (
                    game_id INTEGER PRIMARY KEY,
                    reason TEXT NOT NULL,
                    deleted_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS match_refetch_status (
                    game_id INTEGER PRIMARY KEY,
                    status TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_refetch_at TEXT,
                    next_refetch_at TEXT,
                    last_error TEXT
                );

                CREATE TABLE IF NOT EXISTS ingest_meta (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_matches_context
                    ON matches (season_id, server_name, matching_mode, matching_team_mode);

                CREATE INDEX IF NOT EXISTS idx_matches_start_unix
                    ON matches (unixepoch(start_dtm, 'auto'));

                CREATE INDEX IF NOT EXISTS idx_matches_incomplete
                    ON matches (incomplete);

                CREATE INDEX IF NOT EXISTS idx_user_match_character
                    ON user_match_stats (character_num, game_rank);

                CREATE INDEX IF NOT EXISTS idx_user_match_user
                    ON user_match_stats (uid);

                CREATE INDEX IF NOT EXISTS idx_user_nickname
                    ON users (nickname, unixepoch(last_seen, 'auto'), deleted);
                "#,
            )
            .context("create sqlite schema")?;

        // Databases created before the incremental watermark existed lack
        // the column; the probe keeps older rows at NULL.
        let mut stmt = self.conn.prepare("PRAGMA table_info('users')")?;
        let existing: HashSet<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<_, _>>()
            .context("read users table info")?;
        drop(stmt);
        if !existing.contains("ingested_until") {
            self.conn
                .execute("ALTER TABLE users ADD COLUMN ingested_until TEXT", [])
                .context("add ingested_until column")?;
        }
        Ok(())
    }

    /// Run `f` inside a transaction scoped to a single match's writes.
    /// Commit on Ok, roll back on Err.
    pub fn in_transaction<T>(&self, f: impl FnOnce(&SqliteStore) -> Result<T>) -> Result<T> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("begin match transaction")?;
        match f(self) {
            Ok(value) => {
                self.conn
                    .execute_batch("COMMIT")
                    .context("commit match transaction")?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(err)
            }
        }
    }

    /// Apply-if-newer upsert of the denormalized user view. `first_seen` is
    /// set at insert and never overwritten; `last_seen` takes the max;
    /// `ingested_until` only advances, and only when `mark_ingested`.
    pub fn upsert_user(&self, user: &UserRow, mark_ingested: bool) -> Result<()> {
        let ingested_until = if mark_ingested {
            user.start_time.as_deref()
        } else {
            None
        };
        self.conn
            .execute(
                r#"
                INSERT INTO users (
                    uid, nickname, first_seen, last_seen, ingested_until,
                    last_checked, last_mmr, ml_bot, last_language
                ) VALUES (?1, ?2, ?3, ?3, ?4, ?3, ?5, ?6, ?7)
                ON CONFLICT(uid) DO UPDATE SET
                    nickname=excluded.nickname,
                    last_seen=CASE
                        WHEN unixepoch(users.last_seen, 'auto') > unixepoch(excluded.last_seen, 'auto') THEN users.last_seen
                        ELSE excluded.last_seen
                    END,
                    ingested_until=CASE
                        WHEN excluded.ingested_until IS NULL THEN users.ingested_until
                        WHEN users.ingested_until IS NULL THEN excluded.ingested_until
                        WHEN unixepoch(excluded.ingested_until, 'auto') > unixepoch(users.ingested_until, 'auto') THEN excluded.ingested_until
                        ELSE users.ingested_until
                    END,
                    last_mmr=excluded.last_mmr,
                    ml_bot=excluded.ml_bot,
                    last_checked=COALESCE(users.last_checked, excluded.last_checked),
                    last_language=excluded.last_language
                WHERE
                    unixepoch(excluded.last_seen, 'auto') > unixepoch(users.last_seen, 'auto')
                    OR (
                        excluded.ingested_until IS NOT NULL
                        AND (
                            users.ingested_until IS NULL
                            OR unixepoch(excluded.ingested_until, 'auto') > unixepoch(users.ingested_until, 'auto')
                        )
                    )
                "#,
                params![
                    user.uid,
                    user.nickname,
                    user.start_time,
                    ingested_until,
                    user.last_mmr,
                    user.ml_bot,
                    user.language,
                ],
            )
            .context("upsert user")?;
        Ok(())
    }

    /// Upsert a match row. The incomplete flag is sticky: a plain upsert
    /// never clears it (only `clear_game_incomplete` does).
    pub fn upsert_match(&self, m: &MatchRow) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO matches (
                    game_id, season_id, matching_mode, matching_team_mode, server_name,
                    incomplete, version_season, version_major, version_minor, start_dtm, duration
                ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(game_id) DO UPDATE SET
                    season_id=excluded.season_id,
                    matching_mode=excluded.matching_mode,
                    matching_team_mode=excluded.matching_team_mode,
                    server_name=excluded.server_name,
                    incomplete=CASE
                        WHEN matches.incomplete = 1 THEN 1
                        ELSE excluded.incomplete
                    END,
                    version_season=excluded.version_season,
                    version_major=excluded.version_major,
                    version_minor=excluded.version_minor,
                    start_dtm=excluded.start_dtm,
                    duration=excluded.duration
                "#,
                params![
                    m.game_id,
                    m.season_id,
                    m.matching_mode,
                    m.matching_team_mode,
                    m.server_name,
                    m.version_season,
                    m.version_major,
                    m.version_minor,
                    m.start_dtm,
                    m.duration,
                ],
            )
            .context("upsert match")?;
        Ok(())
    }

    /// One canonical snapshot per (game, uid): every field is replaced.
    pub fn upsert_user_match_stats(&self, p: &ParticipantRow) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO user_match_stats (
                    game_id, uid, character_num, skin_code, game_rank,
                    player_kill, player_assistant, monster_kill, mmr_gain,
                    mmr_loss_entry_cost, victory, play_time, damage_to_player,
                    character_level, best_weapon, best_weapon_level,
                    team_number, premade, language, ml_bot
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                    ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20
                )
                ON CONFLICT(game_id, uid) DO UPDATE SET
                    character_num=excluded.character_num,
                    skin_code=excluded.skin_code,
                    game_rank=excluded.game_rank,
                    player_kill=excluded.player_kill,
                    player_assistant=excluded.player_assistant,
                    monster_kill=excluded.monster_kill,
                    mmr_gain=excluded.mmr_gain,
                    mmr_loss_entry_cost=excluded.mmr_loss_entry_cost,
                    victory=excluded.victory,
                    play_time=excluded.play_time,
                    damage_to_player=excluded.damage_to_player,
                    character_level=excluded.character_level,
                    best_weapon=excluded.best_weapon,
                    best_weapon_level=excluded.best_weapon_level,
                    team_number=excluded.team_number,
                    premade=excluded.premade,
                    language=excluded.language,
                    ml_bot=excluded.ml_bot
                "#,
                params![
                    p.game_id,
                    p.uid,
                    p.character_num,
                    p.skin_code,
                    p.game_rank,
                    p.player_kill,
                    p.player_assistant,
                    p.monster_kill,
                    p.mmr_gain,
                    p.mmr_loss_entry_cost,
                    p.victory,
                    p.play_time,
                    p.damage_to_player,
                    p.character_level,
                    p.best_weapon,
                    p.best_weapon_level,
                    p.team_number,
                    p.premade,
                    p.language,
                    p.ml_bot,
                ],
            )
            .context("upsert user match stats")?;
        Ok(())
    }

    pub fn replace_equipment(
        &self,
        game_id: i64,
        uid: &str,
        equipment: &HashMap<String, i64>,
        grades: &HashMap<String, i64>,
    ) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM equipment WHERE game_id=?1 AND uid=?2",
                params![game_id, uid],
            )
            .context("clear equipment")?;
        for (slot_str, item_id) in equipment {
            let Ok(slot) = slot_str.trim().parse::<i64>() else {
                continue;
            };
            let grade = grades.get(slot_str).copied();
            self.conn
                .execute(
                    "INSERT INTO equipment (game_id, uid, slot, item_id, grade)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![game_id, uid, slot, item_id, grade],
                )
                .context("insert equipment")?;
        }
        Ok(())
    }

    pub fn refresh_characters(&self, entries: &[CharacterEntry]) -> Result<usize> {
        self.conn
            .execute("DELETE FROM characters", [])
            .context("clear characters")?;
        let mut count = 0usize;
        for entry in entries {
            let (Some(code), Some(name)) = (entry.character_code, entry.character.as_deref())
            else {
                continue;
            };
            self.conn
                .execute(
                    "INSERT INTO characters (character_code, name) VALUES (?1, ?2)
                     ON CONFLICT DO NOTHING",
                    params![code, name],
                )
                .context("insert character")?;
            count += 1;
        }
        Ok(count)
    }

    pub fn refresh_items(&self, entries: &[ItemEntry]) -> Result<usize> {
        self.conn
            .execute("DELETE FROM items", [])
            .context("clear items")?;
        let mut count = 0usize;
        for entry in entries {
            let (Some(code), Some(name)) = (entry.code, entry.name.as_deref()) else {
                continue;
            };
            self.conn
                .execute(
                    "INSERT INTO items (
                        item_code, name, mode_type, item_type, item_grade, is_completed_item
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    ON CONFLICT DO NOTHING",
                    params![
                        code,
                        name,
                        entry.mode_type,
                        entry.item_type,
                        entry.item_grade,
                        entry.is_completed_item.unwrap_or(false) as i64,
                    ],
                )
                .context("insert item")?;
            count += 1;
        }
        Ok(count)
    }

    pub fn has_game(&self, game_id: i64) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM matches WHERE game_id=?1",
                params![game_id],
                |_| Ok(()),
            )
            .optional()
            .context("query has_game")?;
        Ok(found.is_some())
    }

    pub fn is_game_deleted(&self, game_id: i64) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM deleted_matches WHERE game_id=?1",
                params![game_id],
                |_| Ok(()),
            )
            .optional()
            .context("query deleted match")?;
        Ok(found.is_some())
    }

    pub fn list_deleted_games(&self, game_ids: &[i64]) -> Result<HashSet<i64>> {
        let mut out = HashSet::new();
        let mut stmt = self
            .conn
            .prepare("SELECT 1 FROM deleted_matches WHERE game_id=?1")?;
        for &game_id in game_ids {
            if stmt
                .query_row(params![game_id], |_| Ok(()))
                .optional()
                .context("query deleted match")?
                .is_some()
            {
                out.insert(game_id);
            }
        }
        Ok(out)
    }

    pub fn participants_for_game(&self, game_id: i64) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT uid FROM user_match_stats WHERE game_id=?1")?;
        let rows = stmt
            .query_map(params![game_id], |row| row.get::<_, String>(0))
            .context("query participants")?;
        let mut out = HashSet::new();
        for row in rows {
            out.insert(row.context("decode participant uid")?);
        }
        Ok(out)
    }

    pub fn latest_nickname_for_uid(&self, uid: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT nickname FROM users WHERE uid=?1 AND deleted = 0",
                params![uid],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map(|row| row.flatten())
            .context("query latest nickname")
    }

    /// Most recent (uid, last_seen) for a nickname. Many nicknames can map
    /// to the same uid over time and vice versa; the latest sighting wins.
    pub fn uid_info_for_nickname(&self, nickname: &str) -> Result<Option<(String, Option<String>)>> {
        self.conn
            .query_row(
                r#"
                SELECT uid, last_seen
                FROM users
                WHERE nickname=?1 AND deleted = 0
                ORDER BY unixepoch(last_seen, 'auto') DESC
                LIMIT 1
                "#,
                params![nickname],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()
            .context("query uid for nickname")
    }

    pub fn uid_for_nickname(&self, nickname: &str) -> Result<Option<String>> {
        Ok(self.uid_info_for_nickname(nickname)?.map(|(uid, _)| uid))
    }

    pub fn user_ingested_until(&self, uid: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT ingested_until FROM users WHERE uid=?1 AND deleted = 0",
                params![uid],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map(|row| row.flatten())
            .context("query ingested_until")
    }

    pub fn user_last_checked(&self, uid: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT last_checked FROM users WHERE uid=?1 AND deleted = 0",
                params![uid],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map(|row| row.flatten())
            .context("query last_checked")
    }

    pub fn update_user_last_checked(&self, uid: &str, checked_at: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE users SET last_checked=?1 WHERE uid=?2 AND deleted = 0",
                params![checked_at, uid],
            )
            .context("update last_checked")?;
        Ok(())
    }

    pub fn mark_game_incomplete(&self, game_id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE matches SET incomplete=1 WHERE game_id=?1",
                params![game_id],
            )
            .context("mark game incomplete")?;
        Ok(())
    }

    pub fn clear_game_incomplete(&self, game_id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE matches SET incomplete=0 WHERE game_id=?1",
                params![game_id],
            )
            .context("clear game incomplete")?;
        Ok(())
    }

    pub fn refetch_attempts(&self, game_id: i64) -> Result<i64> {
        let attempts = self
            .conn
            .query_row(
                "SELECT attempts FROM match_refetch_status WHERE game_id=?1",
                params![game_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("query refetch attempts")?;
        Ok(attempts.unwrap_or(0))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn upsert_refetch_status(
        &self,
        game_id: i64,
        status: &str,
        attempts: i64,
        last_refetch_at: &str,
        next_refetch_at: &str,
        last_error: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO match_refetch_status (
                    game_id, status, attempts, last_refetch_at, next_refetch_at, last_error
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(game_id) DO UPDATE SET
                    status=excluded.status,
                    attempts=excluded.attempts,
                    last_refetch_at=excluded.last_refetch_at,
                    next_refetch_at=excluded.next_refetch_at,
                    last_error=excluded.last_error
                "#,
                params![
                    game_id,
                    status,
                    attempts,
                    last_refetch_at,
                    next_refetch_at,
                    last_error
                ],
            )
            .context("upsert refetch status")?;
        Ok(())
    }

    pub fn clear_refetch_status(&self, game_id: i64) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM match_refetch_status WHERE game_id=?1",
                params![game_id],
            )
            .context("clear refetch status")?;
        Ok(())
    }

    /// Incomplete matches eligible for a re-fetch pass. Matches whose
    /// schedule says "missing" or "not yet due" are excluded unless the
    /// corresponding include flag is set.
    pub fn list_refetch_candidates(
        &self,
        season_id: Option<i64>,
        matching_mode: Option<i64>,
        include_missing: bool,
        include_not_due: bool,
        now: &str,
        limit: Option<usize>,
    ) -> Result<Vec<i64>> {
        let mut sql = String::from(
            r#"
            SELECT m.game_id
            FROM matches AS m
            LEFT JOIN match_refetch_status AS r ON r.game_id = m.game_id
            WHERE m.incomplete = 1
              AND (?1 IS NULL OR m.season_id = ?1)
              AND (?2 IS NULL OR m.matching_mode = ?2)
              AND (?3 = 1 OR r.status IS NULL OR r.status != 'missing')
              AND (
                  ?4 = 1
                  OR r.next_refetch_at IS NULL
                  OR unixepoch(r.next_refetch_at, 'auto') <= unixepoch(?5, 'auto')
              )
            ORDER BY m.game_id ASC
            "#,
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    season_id,
                    matching_mode,
                    include_missing as i64,
                    include_not_due as i64,
                    now
                ],
                |row| row.get::<_, i64>(0),
            )
            .context("query refetch candidates")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("decode refetch candidate")?);
        }
        Ok(out)
    }

    pub fn prune_before(&self) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM ingest_meta WHERE key=?1",
                params![PRUNE_BEFORE_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("query prune floor")
    }

    pub fn count_matches_before(&self, cutoff: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM matches
                 WHERE start_dtm IS NOT NULL
                   AND unixepoch(start_dtm, 'auto') < unixepoch(?1, 'auto')",
                params![cutoff],
                |row| row.get::<_, i64>(0),
            )
            .context("count prunable matches")
    }

    /// Retention pruning: delete every match starting before `cutoff`,
    /// record a tombstone per deleted id so future traversals skip it, and
    /// persist the new prune floor. One transaction for the whole sweep.
    pub fn prune_matches_before(
        &self,
        cutoff: &str,
        reason: &str,
        deleted_at: &str,
    ) -> Result<PruneSummary> {
        self.in_transaction(|store| {
            let mut stmt = store.conn.prepare(
                "SELECT game_id FROM matches
                 WHERE start_dtm IS NOT NULL
                   AND unixepoch(start_dtm, 'auto') < unixepoch(?1, 'auto')",
            )?;
            let rows = stmt
                .query_map(params![cutoff], |row| row.get::<_, i64>(0))
                .context("query prunable matches")?;
            let mut game_ids = Vec::new();
            for row in rows {
                game_ids.push(row.context("decode prunable game id")?);
            }
            drop(stmt);

            let mut summary = PruneSummary::default();
            for &game_id in &game_ids {
                store
                    .conn
                    .execute(
                        "INSERT INTO deleted_matches (game_id, reason, deleted_at)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT(game_id) DO NOTHING",
                        params![game_id, reason, deleted_at],
                    )
                    .context("insert tombstone")?;
                summary.tombstoned += 1;
                store
                    .conn
                    .execute("DELETE FROM matches WHERE game_id=?1", params![game_id])
                    .context("delete pruned match")?;
                store
                    .conn
                    .execute("DELETE FROM match_refetch_status WHERE game_id=?1", params![game_id])
                    .context("delete pruned refetch status")?;
                summary.deleted += 1;
            }

            store
                .conn
                .execute(
                    "INSERT INTO ingest_meta (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                    params![PRUNE_BEFORE_KEY, cutoff],
                )
                .context("record prune floor")?;
            Ok(summary)
        })
    }
}
