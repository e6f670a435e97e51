use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::db::{MatchRow, ParticipantRow, UserRow, parse_start_time};

const REQUEST_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_BASE_URL: &str = "https://open-api.bser.io";
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

static CLIENT: OnceCell<Client> = OnceCell::new();

fn http_client() -> Result<&'static Client> {
    CLIENT.get_or_try_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to build http client")
    })
}

/// Classified failure modes of the upstream API.
///
/// The ingestion engine branches on these variants; the per-endpoint
/// 401/404 mappings live in the typed fetchers so callers never have to
/// inspect URLs or status codes themselves.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("rate limited after {attempts} attempts: {url}")]
    RateLimited { url: String, attempts: u32 },
    #[error("match-list endpoint rejected uid {uid}")]
    UidRejected { uid: String },
    #[error("no games recorded for uid {uid}")]
    NoGames { uid: String },
    #[error("nickname not found: {nickname}")]
    NicknameNotFound { nickname: String },
    #[error("no payload for game {game_id}")]
    GameNotFound { game_id: i64 },
    #[error("endpoint missing (http 404): {url}")]
    TransportNotFound { url: String },
    #[error("api code {code:?} from {url}: {message}")]
    Api {
        code: Option<i64>,
        message: String,
        url: String,
    },
    #[error("http {status} from {url}")]
    Http { status: u16, url: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid json from {url}")]
    InvalidJson { url: String },
}

impl ApiError {
    /// An HTTP-level 404 means the endpoint itself is broken, not that a
    /// particular entity is missing. Callers must propagate these.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApiError::TransportNotFound { .. })
    }
}

/// One entry of a user's match list or a game's participant list.
///
/// Named fields replace the upstream payload keys one-for-one; everything
/// the store persists has a field here, and the translation to store rows
/// happens only in the `*_row` methods below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GameRecord {
    pub game_id: Option<i64>,
    pub season_id: Option<i64>,
    pub matching_mode: Option<i64>,
    pub matching_team_mode: Option<i64>,
    pub server_name: Option<String>,
    pub version_season: Option<i64>,
    pub version_major: Option<i64>,
    pub version_minor: Option<i64>,
    pub start_dtm: Option<String>,
    pub duration: Option<i64>,
    pub user_id: Option<String>,
    pub nickname: Option<String>,
    pub character_num: Option<i64>,
    pub skin_code: Option<i64>,
    pub game_rank: Option<i64>,
    pub player_kill: Option<i64>,
    pub player_assistant: Option<i64>,
    pub monster_kill: Option<i64>,
    pub mmr_after: Option<i64>,
    pub mmr_gain: Option<i64>,
    pub mmr_gain_in_game: Option<i64>,
    pub mmr_loss_entry_cost: Option<i64>,
    pub victory: Option<i64>,
    pub play_time: Option<i64>,
    pub damage_to_player: Option<i64>,
    pub character_level: Option<i64>,
    pub best_weapon: Option<i64>,
    pub best_weapon_level: Option<i64>,
    pub team_number: Option<i64>,
    #[serde(rename = "preMade")]
    pub pre_made: Option<i64>,
    pub language: Option<String>,
    #[serde(rename = "mlbot")]
    pub ml_bot: Option<bool>,
    #[serde(rename = "isMLBot")]
    pub is_ml_bot: Option<bool>,
    pub equipment: HashMap<String, i64>,
    pub equipment_grade: HashMap<String, i64>,
}

impl GameRecord {
    /// The bot flag appears under two keys upstream; either being true wins.
    pub fn ml_bot_flag(&self) -> i64 {
        if self.ml_bot == Some(true) || self.is_ml_bot == Some(true) {
            1
        } else {
            0
        }
    }

    /// Normalized start time (RFC 3339 with a colonized offset), or the raw
    /// upstream string when it does not parse.
    pub fn start_time(&self) -> Option<String> {
        parse_start_time(self.start_dtm.as_deref())
    }

    pub fn mmr_gain_value(&self) -> Option<i64> {
        self.mmr_gain.or(self.mmr_gain_in_game)
    }

    /// Match context row, or None when a required field is absent (counted
    /// as a per-record validation failure by the caller).
    pub fn match_row(&self) -> Option<MatchRow> {
        Some(MatchRow {
            game_id: self.game_id?,
            season_id: self.season_id?,
            matching_mode: self.matching_mode?,
            matching_team_mode: self.matching_team_mode?,
            server_name: self.server_name.clone()?,
            version_season: self.version_season,
            version_major: self.version_major,
            version_minor: self.version_minor,
            start_dtm: self.start_time(),
            duration: self.duration,
        })
    }

    pub fn participant_row(&self, uid: &str) -> Option<ParticipantRow> {
        Some(ParticipantRow {
            game_id: self.game_id?,
            uid: uid.to_string(),
            character_num: self.character_num,
            skin_code: self.skin_code,
            game_rank: self.game_rank,
            player_kill: self.player_kill,
            player_assistant: self.player_assistant,
            monster_kill: self.monster_kill,
            mmr_gain: self.mmr_gain_value(),
            mmr_loss_entry_cost: self.mmr_loss_entry_cost,
            victory: self.victory,
            play_time: self.play_time,
            damage_to_player: self.damage_to_player,
            character_level: self.character_level,
            best_weapon: self.best_weapon,
            best_weapon_level: self.best_weapon_level,
            team_number: self.team_number,
            premade: self.pre_made,
            language: self.language.clone(),
            ml_bot: self.ml_bot_flag(),
        })
    }

    pub fn user_row(&self, uid: &str) -> UserRow {
        UserRow {
            uid: uid.to_string(),
            nickname: self.nickname.clone(),
            start_time: self.start_time(),
            last_mmr: self.mmr_after,
            ml_bot: self.ml_bot_flag(),
            language: self.language.clone(),
        }
    }
}

/// One page of a user's match list plus the opaque continuation token.
#[derive(Debug, Clone, Default)]
pub struct GamePage {
    pub user_games: Vec<GameRecord>,
    pub next: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedUser {
    pub uid: String,
    pub nickname: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterEntry {
    pub character_code: Option<i64>,
    pub character: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemEntry {
    pub code: Option<i64>,
    pub name: Option<String>,
    pub mode_type: Option<i64>,
    pub item_type: Option<String>,
    pub item_grade: Option<String>,
    pub is_completed_item: Option<bool>,
}

/// Minimum-interval limiter. The slot is reserved at request start, so a
/// slow response does not let the next request fire early.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_request_at: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request_at: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// How long a request starting at `now` must wait, if at all. Pure so
    /// tests never sleep.
    pub fn delay_for(&self, now: Instant) -> Option<Duration> {
        if self.min_interval.is_zero() {
            return None;
        }
        let last = self.last_request_at?;
        let elapsed = now.duration_since(last);
        if elapsed < self.min_interval {
            Some(self.min_interval - elapsed)
        } else {
            None
        }
    }

    pub fn wait(&mut self) {
        let now = Instant::now();
        if let Some(delay) = self.delay_for(now) {
            thread::sleep(delay);
            self.last_request_at = Some(Instant::now());
        } else {
            self.last_request_at = Some(now);
        }
    }
}

/// The collaborator contract the reconciliation engine consumes. Tests
/// substitute deterministic fakes.
pub trait MatchApi {
    fn fetch_user_games(
        &mut self,
        uid: &str,
        next_token: Option<&str>,
    ) -> Result<GamePage, ApiError>;

    fn fetch_game_result(&mut self, game_id: i64) -> Result<Vec<GameRecord>, ApiError>;

    fn fetch_user_by_nickname(&mut self, nickname: &str) -> Result<ResolvedUser, ApiError>;
}

/// Blocking client for the Eternal Return open API.
pub struct ErApiClient {
    base_url: String,
    api_key: Option<String>,
    http: &'static Client,
    limiter: RateLimiter,
    max_retries: u32,
}

impl ErApiClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        min_interval: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http: http_client()?,
            limiter: RateLimiter::new(min_interval),
            max_retries,
        })
    }

    fn get_json(&mut self, url: &str, extra_headers: &[(&str, &str)]) -> Result<Value, ApiError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            self.limiter.wait();

            let mut req = self.http.get(url).header("accept", "application/json");
            if let Some(key) = self.api_key.as_deref() {
                req = req.header("x-api-key", key);
            }
            for (name, value) in extra_headers {
                req = req.header(*name, *value);
            }

            let resp = req.send()?;
            let status = resp.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN {
                let retry_after = resp
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<f64>().ok())
                    .map(Duration::from_secs_f64);
                if attempts > self.max_retries {
                    return Err(ApiError::RateLimited {
                        url: url.to_string(),
                        attempts,
                    });
                }
                let fallback = self.limiter.min_interval().max(Duration::from_secs(1));
                thread::sleep(retry_after.unwrap_or(fallback));
                continue;
            }
            if status == StatusCode::NOT_FOUND {
                return Err(ApiError::TransportNotFound {
                    url: url.to_string(),
                });
            }
            if !status.is_success() {
                return Err(ApiError::Http {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            let payload: Value = resp.json().map_err(|_| ApiError::InvalidJson {
                url: url.to_string(),
            })?;
            if let Some(code) = payload.get("code") {
                let code = as_i64_any(code);
                if code != Some(200) {
                    let message = payload
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unknown error")
                        .to_string();
                    return Err(ApiError::Api {
                        code,
                        message,
                        url: url.to_string(),
                    });
                }
            }
            return Ok(payload);
        }
    }

    pub fn fetch_character_attributes(&mut self) -> Result<Vec<CharacterEntry>, ApiError> {
        let url = format!("{}/v2/data/CharacterAttributes", self.base_url);
        let payload = self.get_json(&url, &[])?;
        parse_data_list(&payload, &url)
    }

    pub fn fetch_item_armor(&mut self) -> Result<Vec<ItemEntry>, ApiError> {
        let url = format!("{}/v2/data/ItemArmor", self.base_url);
        let payload = self.get_json(&url, &[])?;
        parse_data_list(&payload, &url)
    }

    pub fn fetch_item_weapon(&mut self) -> Result<Vec<ItemEntry>, ApiError> {
        let url = format!("{}/v2/data/ItemWeapon", self.base_url);
        let payload = self.get_json(&url, &[])?;
        parse_data_list(&payload, &url)
    }
}

impl MatchApi for ErApiClient {
    fn fetch_user_games(
        &mut self,
        uid: &str,
        next_token: Option<&str>,
    ) -> Result<GamePage, ApiError> {
        let url = format!("{}/v1/user/games/uid/{uid}", self.base_url);
        let mut headers = Vec::new();
        if let Some(token) = next_token {
            headers.push(("next", token));
        }
        // Endpoint-specific workaround: this route reports a rotated uid as
        // app-code 401 and an empty history as app-code 404.
        let payload = self.get_json(&url, &headers).map_err(|err| match err {
            ApiError::Api {
                code: Some(401), ..
            } => ApiError::UidRejected {
                uid: uid.to_string(),
            },
            ApiError::Api {
                code: Some(404), ..
            } => ApiError::NoGames {
                uid: uid.to_string(),
            },
            other => other,
        })?;
        Ok(parse_game_page(&payload, &url)?)
    }

    fn fetch_game_result(&mut self, game_id: i64) -> Result<Vec<GameRecord>, ApiError> {
        let url = format!("{}/v1/games/{game_id}", self.base_url);
        let payload = self.get_json(&url, &[]).map_err(|err| match err {
            ApiError::Api {
                code: Some(404), ..
            } => ApiError::GameNotFound { game_id },
            other => other,
        })?;
        parse_user_games(&payload, &url)
    }

    fn fetch_user_by_nickname(&mut self, nickname: &str) -> Result<ResolvedUser, ApiError> {
        let encoded = urlencode(nickname);
        let url = format!("{}/v1/user/nickname?query={encoded}", self.base_url);
        let payload = self.get_json(&url, &[]).map_err(|err| match err {
            ApiError::Api {
                code: Some(404), ..
            } => ApiError::NicknameNotFound {
                nickname: nickname.to_string(),
            },
            other => other,
        })?;

        let user = payload.get("user");
        let uid = user
            .and_then(|u| u.get("userId").or_else(|| u.get("uid")))
            .and_then(as_uid_any);
        let Some(uid) = uid else {
            return Err(ApiError::Api {
                code: None,
                message: format!("nickname response for '{nickname}' missing userId"),
                url,
            });
        };
        let nickname = user
            .and_then(|u| u.get("nickname"))
            .and_then(|v| v.as_str())
            .unwrap_or(nickname)
            .to_string();
        Ok(ResolvedUser { uid, nickname })
    }
}

fn parse_game_page(payload: &Value, url: &str) -> Result<GamePage, ApiError> {
    let user_games = parse_user_games(payload, url)?;
    let next = payload.get("next").and_then(|v| {
        if let Some(s) = v.as_str() {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        } else {
            // The token is sometimes a bare number.
            v.as_i64().map(|n| n.to_string())
        }
    });
    Ok(GamePage { user_games, next })
}

fn parse_user_games(payload: &Value, url: &str) -> Result<Vec<GameRecord>, ApiError> {
    let Some(entries) = payload.get("userGames") else {
        return Ok(Vec::new());
    };
    serde_json::from_value::<Vec<GameRecord>>(entries.clone()).map_err(|_| ApiError::InvalidJson {
        url: url.to_string(),
    })
}

fn parse_data_list<T: serde::de::DeserializeOwned>(
    payload: &Value,
    url: &str,
) -> Result<Vec<T>, ApiError> {
    let Some(data) = payload.get("data") else {
        return Ok(Vec::new());
    };
    serde_json::from_value::<Vec<T>>(data.clone()).map_err(|_| ApiError::InvalidJson {
        url: url.to_string(),
    })
}

fn as_i64_any(v: &Value) -> Option<i64> {
    if let Some(n) = v.as_i64() {
        return Some(n);
    }
    v.as_str()?.trim().parse::<i64>().ok()
}

fn as_uid_any(v: &Value) -> Option<String> {
    if let Some(s) = v.as_str() {
        let trimmed = s.trim();
        return (!trimmed.is_empty()).then(|| trimmed.to_string());
    }
    v.as_i64().map(|n| n.to_string())
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
