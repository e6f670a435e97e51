use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parquet::basic::Compression;
use parquet::data_type::{ByteArray, ByteArrayType, Int64Type};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::{SerializedFileWriter, SerializedRowGroupWriter};
use parquet::schema::parser::parse_message_type;

use crate::api_client::GameRecord;
use crate::db::parse_start_time;

const DEFAULT_FLUSH_ROWS: usize = 10_000;

const MATCH_SCHEMA: &str = "
message match_export {
    required int64 game_id;
    optional int64 season_id;
    optional int64 matching_mode;
    optional int64 matching_team_mode;
    optional int64 version_season;
    optional int64 version_major;
    optional int64 version_minor;
    optional binary start_dtm (UTF8);
    required binary server_name (UTF8);
}
";

const PARTICIPANT_SCHEMA: &str = "
message participant_export {
    required int64 game_id;
    required binary uid (UTF8);
    optional binary nickname (UTF8);
    optional int64 character_num;
    optional int64 skin_code;
    optional int64 game_rank;
    optional int64 player_kill;
    optional int64 player_assistant;
    optional int64 monster_kill;
    optional int64 mmr_gain;
    optional int64 mmr_loss_entry_cost;
    optional int64 victory;
    optional int64 play_time;
    optional int64 duration;
    optional int64 damage_to_player;
    optional int64 character_level;
    optional int64 best_weapon;
    optional int64 best_weapon_level;
    optional int64 team_number;
    optional int64 premade;
    optional binary language (UTF8);
    required int64 ml_bot;
    optional int64 season_id;
    optional int64 matching_mode;
    optional int64 matching_team_mode;
    optional binary server_name (UTF8);
}
";

/// Hive partition: season_id / server_name / matching_mode / date.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PartitionKey {
    season_id: Option<i64>,
    server_name: String,
    matching_mode: Option<i64>,
    date: Option<String>,
}

impl PartitionKey {
    fn from_record(record: &GameRecord) -> Self {
        let date = parse_start_time(record.start_dtm.as_deref())
            .map(|iso| iso.chars().take(10).collect::<String>());
        Self {
            season_id: record.season_id,
            server_name: record.server_name.clone().unwrap_or_default(),
            matching_mode: record.matching_mode,
            date,
        }
    }

    fn dir(&self, root: &Path) -> PathBuf {
        root.join(format!("season_id={}", opt_part(self.season_id)))
            .join(format!("server_name={}", self.server_name))
            .join(format!("matching_mode={}", opt_part(self.matching_mode)))
            .join(format!(
                "date={}",
                self.date.as_deref().unwrap_or("null")
            ))
    }
}

fn opt_part(value: Option<i64>) -> String {
    value.map_or_else(|| "null".to_string(), |v| v.to_string())
}

#[derive(Debug, Clone)]
struct MatchExportRow {
    game_id: i64,
    season_id: Option<i64>,
    matching_mode: Option<i64>,
    matching_team_mode: Option<i64>,
    version_season: Option<i64>,
    version_major: Option<i64>,
    version_minor: Option<i64>,
    start_dtm: Option<String>,
    server_name: String,
}

#[derive(Debug, Clone)]
struct ParticipantExportRow {
    game_id: i64,
    uid: String,
    nickname: Option<String>,
    character_num: Option<i64>,
    skin_code: Option<i64>,
    game_rank: Option<i64>,
    player_kill: Option<i64>,
    player_assistant: Option<i64>,
    monster_kill: Option<i64>,
    mmr_gain: Option<i64>,
    mmr_loss_entry_cost: Option<i64>,
    victory: Option<i64>,
    play_time: Option<i64>,
    duration: Option<i64>,
    damage_to_player: Option<i64>,
    character_level: Option<i64>,
    best_weapon: Option<i64>,
    best_weapon_level: Option<i64>,
    team_number: Option<i64>,
    premade: Option<i64>,
    language: Option<String>,
    ml_bot: i64,
    season_id: Option<i64>,
    matching_mode: Option<i64>,
    matching_team_mode: Option<i64>,
    server_name: Option<String>,
}

/// Buffered, partition-aware Parquet writer for the analytic export.
///
/// Two datasets under the base directory: `matches/` (one row per game)
/// and `participants/` (one row per game per uid). Rows buffer in memory
/// per partition key; I/O happens when a buffer reaches the flush
/// threshold or on `close`.
pub struct ParquetExporter {
    matches_root: PathBuf,
    participants_root: PathBuf,
    flush_rows: usize,
    seen_matches: HashSet<i64>,
    seen_participants: HashSet<(i64, String)>,
    match_buffers: HashMap<PartitionKey, Vec<MatchExportRow>>,
    participant_buffers: HashMap<PartitionKey, Vec<ParticipantExportRow>>,
    match_counters: HashMap<PartitionKey, u32>,
    participant_counters: HashMap<PartitionKey, u32>,
}

impl ParquetExporter {
    pub fn new(base_dir: &Path) -> Result<Self> {
        let matches_root = base_dir.join("matches");
        let participants_root = base_dir.join("participants");
        std::fs::create_dir_all(&matches_root)
            .with_context(|| format!("create {}", matches_root.display()))?;
        std::fs::create_dir_all(&participants_root)
            .with_context(|| format!("create {}", participants_root.display()))?;
        Ok(Self {
            matches_root,
            participants_root,
            flush_rows: DEFAULT_FLUSH_ROWS,
            seen_matches: HashSet::new(),
            seen_participants: HashSet::new(),
            match_buffers: HashMap::new(),
            participant_buffers: HashMap::new(),
            match_counters: HashMap::new(),
            participant_counters: HashMap::new(),
        })
    }

    pub fn with_flush_rows(mut self, flush_rows: usize) -> Self {
        self.flush_rows = flush_rows.max(1);
        self
    }

    /// Write the participant row (and, once per game id, the match row)
    /// for a single game record. Duplicate submissions across pages and
    /// seed/participant flows are dropped here.
    pub fn write_game(&mut self, record: &GameRecord, uid: &str) -> Result<()> {
        let Some(game_id) = record.game_id else {
            return Ok(());
        };
        let key = PartitionKey::from_record(record);

        if self.seen_participants.insert((game_id, uid.to_string())) {
            let row = participant_export_row(record, game_id, uid);
            let buffer = self.participant_buffers.entry(key.clone()).or_default();
            buffer.push(row);
            if buffer.len() >= self.flush_rows {
                self.flush_participants(&key)?;
            }
        }

        if self.seen_matches.insert(game_id) {
            let row = MatchExportRow {
                game_id,
                season_id: record.season_id,
                matching_mode: record.matching_mode,
                matching_team_mode: record.matching_team_mode,
                version_season: record.version_season,
                version_major: record.version_major,
                version_minor: record.version_minor,
                start_dtm: record.start_time(),
                server_name: record.server_name.clone().unwrap_or_default(),
            };
            let buffer = self.match_buffers.entry(key.clone()).or_default();
            buffer.push(row);
            if buffer.len() >= self.flush_rows {
                self.flush_matches(&key)?;
            }
        }
        Ok(())
    }

    /// Flush every remaining buffer. Callers invoke this at shutdown.
    pub fn close(&mut self) -> Result<()> {
        let match_keys: Vec<PartitionKey> = self.match_buffers.keys().cloned().collect();
        for key in match_keys {
            self.flush_matches(&key)?;
        }
        let participant_keys: Vec<PartitionKey> =
            self.participant_buffers.keys().cloned().collect();
        for key in participant_keys {
            self.flush_participants(&key)?;
        }
        Ok(())
    }

    fn flush_matches(&mut self, key: &PartitionKey) -> Result<()> {
        let Some(rows) = self.match_buffers.get_mut(key) else {
            return Ok(());
        };
        if rows.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(rows);
        let counter = self.match_counters.entry(key.clone()).or_default();
        *counter += 1;
        let dir = key.dir(&self.matches_root);
        std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join(format!("matches-part-{counter:05}.parquet", counter = *counter));
        write_match_file(&path, &rows)
    }

    fn flush_participants(&mut self, key: &PartitionKey) -> Result<()> {
        let Some(rows) = self.participant_buffers.get_mut(key) else {
            return Ok(());
        };
        if rows.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(rows);
        let counter = self.participant_counters.entry(key.clone()).or_default();
        *counter += 1;
        let dir = key.dir(&self.participants_root);
        std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join(format!(
            "participants-part-{counter:05}.parquet",
            counter = *counter
        ));
        write_participant_file(&path, &rows)
    }
}

fn participant_export_row(record: &GameRecord, game_id: i64, uid: &str) -> ParticipantExportRow {
    ParticipantExportRow {
        game_id,
        uid: uid.to_string(),
        nickname: record.nickname.clone(),
        character_num: record.character_num,
        skin_code: record.skin_code,
        game_rank: record.game_rank,
        player_kill: record.player_kill,
        player_assistant: record.player_assistant,
        monster_kill: record.monster_kill,
        mmr_gain: record.mmr_gain_value(),
        mmr_loss_entry_cost: record.mmr_loss_entry_cost,
        victory: record.victory,
        play_time: record.play_time,
        duration: record.duration,
        damage_to_player: record.damage_to_player,
        character_level: record.character_level,
        best_weapon: record.best_weapon,
        best_weapon_level: record.best_weapon_level,
        team_number: record.team_number,
        premade: record.pre_made,
        language: record.language.clone(),
        ml_bot: record.ml_bot_flag(),
        season_id: record.season_id,
        matching_mode: record.matching_mode,
        matching_team_mode: record.matching_team_mode,
        server_name: record.server_name.clone(),
    }
}

fn new_writer(path: &Path, schema: &str) -> Result<SerializedFileWriter<File>> {
    let schema = Arc::new(parse_message_type(schema).context("parse parquet schema")?);
    let properties = Arc::new(
        WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build(),
    );
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    SerializedFileWriter::new(file, schema, properties).context("open parquet writer")
}

fn write_match_file(path: &Path, rows: &[MatchExportRow]) -> Result<()> {
    let mut writer = new_writer(path, MATCH_SCHEMA)?;
    let mut group = writer.next_row_group().context("open row group")?;
    write_req_i64(&mut group, rows.iter().map(|r| r.game_id).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.season_id).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.matching_mode).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.matching_team_mode).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.version_season).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.version_major).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.version_minor).collect())?;
    write_opt_str(&mut group, rows.iter().map(|r| r.start_dtm.as_deref()).collect())?;
    write_req_str(&mut group, rows.iter().map(|r| r.server_name.as_str()).collect())?;
    group.close().context("close row group")?;
    writer.close().context("close parquet file")?;
    Ok(())
}

fn write_participant_file(path: &Path, rows: &[ParticipantExportRow]) -> Result<()> {
    let mut writer = new_writer(path, PARTICIPANT_SCHEMA)?;
    let mut group = writer.next_row_group().context("open row group")?;
    write_req_i64(&mut group, rows.iter().map(|r| r.game_id).collect())?;
    write_req_str(&mut group, rows.iter().map(|r| r.uid.as_str()).collect())?;
    write_opt_str(&mut group, rows.iter().map(|r| r.nickname.as_deref()).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.character_num).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.skin_code).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.game_rank).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.player_kill).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.player_assistant).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.monster_kill).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.mmr_gain).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.mmr_loss_entry_cost).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.victory).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.play_time).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.duration).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.damage_to_player).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.character_level).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.best_weapon).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.best_weapon_level).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.team_number).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.premade).collect())?;
    write_opt_str(&mut group, rows.iter().map(|r| r.language.as_deref()).collect())?;
    write_req_i64(&mut group, rows.iter().map(|r| r.ml_bot).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.season_id).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.matching_mode).collect())?;
    write_opt_i64(&mut group, rows.iter().map(|r| r.matching_team_mode).collect())?;
    write_opt_str(&mut group, rows.iter().map(|r| r.server_name.as_deref()).collect())?;
    group.close().context("close row group")?;
    writer.close().context("close parquet file")?;
    Ok(())
}

fn write_req_i64(group: &mut SerializedRowGroupWriter<'_, File>, values: Vec<i64>) -> Result<()> {
    let mut column = group
        .next_column()
        .context("advance column")?
        .context("row group is missing a column")?;
    column
        .typed::<Int64Type>()
        .write_batch(&values, None, None)
        .context("write int64 column")?;
    column.close().context("close column")?;
    Ok(())
}

fn write_opt_i64(
    group: &mut SerializedRowGroupWriter<'_, File>,
    values: Vec<Option<i64>>,
) -> Result<()> {
    let mut column = group
        .next_column()
        .context("advance column")?
        .context("row group is missing a column")?;
    let mut data = Vec::new();
    let mut defs = Vec::with_capacity(values.len());
    for value in values {
        match value {
            Some(v) => {
                data.push(v);
                defs.push(1);
            }
            None => defs.push(0),
        }
    }
    column
        .typed::<Int64Type>()
        .write_batch(&data, Some(&defs), None)
        .context("write optional int64 column")?;
    column.close().context("close column")?;
    Ok(())
}

fn write_req_str(group: &mut SerializedRowGroupWriter<'_, File>, values: Vec<&str>) -> Result<()> {
    let mut column = group
        .next_column()
        .context("advance column")?
        .context("row group is missing a column")?;
    let data: Vec<ByteArray> = values.into_iter().map(ByteArray::from).collect();
    column
        .typed::<ByteArrayType>()
        .write_batch(&data, None, None)
        .context("write string column")?;
    column.close().context("close column")?;
    Ok(())
}

fn write_opt_str(
    group: &mut SerializedRowGroupWriter<'_, File>,
    values: Vec<Option<&str>>,
) -> Result<()> {
    let mut column = group
        .next_column()
        .context("advance column")?
        .context("row group is missing a column")?;
    let mut data = Vec::new();
    let mut defs = Vec::with_capacity(values.len());
    for value in values {
        match value {
            Some(v) => {
                data.push(ByteArray::from(v));
                defs.push(1);
            }
            None => defs.push(0),
        }
    }
    column
        .typed::<ByteArrayType>()
        .write_batch(&data, Some(&defs), None)
        .context("write optional string column")?;
    column.close().context("close column")?;
    Ok(())
}
