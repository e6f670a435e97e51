#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::json;

use er_stats::api_client::{ApiError, GamePage, GameRecord, MatchApi, ResolvedUser};
use er_stats::db::SqliteStore;
use er_stats::ingest::IngestOptions;

/// Deterministic in-memory stand-in for the remote API. Pages are keyed by
/// uid and chained with numeric continuation tokens; every call is logged
/// so tests can assert on traffic.
#[derive(Debug, Default)]
pub struct FakeApi {
    pub pages: HashMap<String, Vec<GamePage>>,
    pub participants: HashMap<i64, Vec<GameRecord>>,
    pub nicknames: HashMap<String, String>,
    /// Per-nickname resolution sequences consumed before `nicknames`.
    pub nickname_sequences: HashMap<String, VecDeque<String>>,
    pub rejected_uids: HashSet<String>,
    pub no_games_uids: HashSet<String>,
    pub transient_nicknames: HashSet<String>,
    pub transport_404_games: HashSet<i64>,
    pub missing_payload_games: HashSet<i64>,
    pub user_games_calls: Vec<(String, Option<String>)>,
    pub game_result_calls: Vec<i64>,
    pub nickname_calls: Vec<String>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nickname(mut self, nickname: &str, uid: &str) -> Self {
        self.nicknames.insert(nickname.to_string(), uid.to_string());
        self
    }

    pub fn with_pages(mut self, uid: &str, pages: Vec<GamePage>) -> Self {
        self.pages.insert(uid.to_string(), pages);
        self
    }

    pub fn with_participants(mut self, game_id: i64, records: Vec<GameRecord>) -> Self {
        self.participants.insert(game_id, records);
        self
    }
}

impl MatchApi for FakeApi {
    fn fetch_user_games(
        &mut self,
        uid: &str,
        next_token: Option<&str>,
    ) -> Result<GamePage, ApiError> {
        self.user_games_calls
            .push((uid.to_string(), next_token.map(String::from)));
        if self.rejected_uids.contains(uid) {
            return Err(ApiError::UidRejected {
                uid: uid.to_string(),
            });
        }
        if self.no_games_uids.contains(uid) {
            return Err(ApiError::NoGames {
                uid: uid.to_string(),
            });
        }
        let index = next_token
            .and_then(|token| token.parse::<usize>().ok())
            .unwrap_or(0);
        Ok(self
            .pages
            .get(uid)
            .and_then(|pages| pages.get(index))
            .cloned()
            .unwrap_or_default())
    }

    fn fetch_game_result(&mut self, game_id: i64) -> Result<Vec<GameRecord>, ApiError> {
        self.game_result_calls.push(game_id);
        if self.transport_404_games.contains(&game_id) {
            return Err(ApiError::TransportNotFound {
                url: format!("https://example.invalid/v1/games/{game_id}"),
            });
        }
        if self.missing_payload_games.contains(&game_id) {
            return Err(ApiError::GameNotFound { game_id });
        }
        Ok(self
            .participants
            .get(&game_id)
            .cloned()
            .unwrap_or_default())
    }

    fn fetch_user_by_nickname(&mut self, nickname: &str) -> Result<ResolvedUser, ApiError> {
        self.nickname_calls.push(nickname.to_string());
        if self.transient_nicknames.contains(nickname) {
            return Err(ApiError::Http {
                status: 500,
                url: format!("https://example.invalid/v1/user/nickname?query={nickname}"),
            });
        }
        if let Some(sequence) = self.nickname_sequences.get_mut(nickname)
            && let Some(uid) = sequence.pop_front()
        {
            return Ok(ResolvedUser {
                uid,
                nickname: nickname.to_string(),
            });
        }
        match self.nicknames.get(nickname) {
            Some(uid) => Ok(ResolvedUser {
                uid: uid.clone(),
                nickname: nickname.to_string(),
            }),
            None => Err(ApiError::NicknameNotFound {
                nickname: nickname.to_string(),
            }),
        }
    }
}

/// Chain per-page record lists with numeric continuation tokens.
pub fn pages(per_page: Vec<Vec<GameRecord>>) -> Vec<GamePage> {
    let total = per_page.len();
    per_page
        .into_iter()
        .enumerate()
        .map(|(idx, user_games)| GamePage {
            user_games,
            next: (idx + 1 < total).then(|| (idx + 1).to_string()),
        })
        .collect()
}

pub fn make_game(game_id: i64, nickname: &str) -> GameRecord {
    make_game_at(game_id, nickname, "2025-10-27T23:24:03.003+0900")
}

pub fn make_game_at(game_id: i64, nickname: &str, start_dtm: &str) -> GameRecord {
    serde_json::from_value(json!({
        "gameId": game_id,
        "seasonId": 25,
        "matchingMode": 3,
        "matchingTeamMode": 1,
        "serverName": "NA",
        "versionMajor": 1,
        "versionMinor": 0,
        "startDtm": start_dtm,
        "duration": 900,
        "nickname": nickname,
        "mmrAfter": 1200,
        "language": "en",
        "characterNum": 1,
        "skinCode": 0,
        "gameRank": 3,
        "playerKill": 3,
        "playerAssistant": 2,
        "monsterKill": 10,
        "mmrGain": 10,
        "mmrLossEntryCost": 5,
        "victory": 0,
        "playTime": 900,
        "damageToPlayer": 1000,
        "characterLevel": 15,
        "bestWeapon": 1,
        "bestWeaponLevel": 10,
        "teamNumber": 1,
        "preMade": 0,
        "equipment": {"0": 101101, "1": 101102},
        "equipmentGrade": {"0": 2, "1": 3}
    }))
    .expect("valid game payload")
}

pub fn open_store() -> SqliteStore {
    let store = SqliteStore::open_in_memory().expect("open in-memory store");
    store.setup_schema().expect("set up schema");
    store
}

/// Persist one record the way the engine does (user + match + stats +
/// equipment), for seeding fixtures without a manager.
pub fn persist_game(store: &SqliteStore, record: &GameRecord, uid: &str) {
    store
        .upsert_user(&record.user_row(uid), true)
        .expect("upsert user");
    store
        .upsert_match(&record.match_row().expect("match context"))
        .expect("upsert match");
    store
        .upsert_user_match_stats(&record.participant_row(uid).expect("participant row"))
        .expect("upsert stats");
    store
        .replace_equipment(
            record.game_id.expect("game id"),
            uid,
            &record.equipment,
            &record.equipment_grade,
        )
        .expect("replace equipment");
}

/// Options tuned for tests: no sleeps, no surprise uid rechecks.
pub fn test_options() -> IngestOptions {
    IngestOptions {
        participant_retry_delay: std::time::Duration::ZERO,
        uid_recheck_interval: chrono::Duration::days(3650),
        ..IngestOptions::default()
    }
}

pub fn count(store: &SqliteStore, sql: &str) -> i64 {
    store
        .connection()
        .query_row(sql, [], |row| row.get::<_, i64>(0))
        .expect("count query")
}
