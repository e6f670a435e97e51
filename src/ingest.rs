use std::collections::{HashSet, VecDeque};
use std::thread;
use std::time::Duration as StdDuration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::api_client::{ApiError, GamePage, GameRecord, MatchApi};
use crate::db::{SqliteStore, parse_iso};
use crate::identity::{IdentityResolver, RecoveryAbort, RunContext, SeedRecovery};
use crate::parquet_export::ParquetExporter;

const REFETCH_BACKOFF_BASE_DAYS: i64 = 1;
const REFETCH_BACKOFF_CAP_DAYS: i64 = 30;

/// Exponential re-fetch backoff: one day after the first failed attempt,
/// doubling per attempt, capped at thirty days.
pub fn refetch_backoff(attempts: i64) -> ChronoDuration {
    let exponent = (attempts - 1).clamp(0, 6) as u32;
    let days = (REFETCH_BACKOFF_BASE_DAYS << exponent).min(REFETCH_BACKOFF_CAP_DAYS);
    ChronoDuration::days(days)
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub max_games_per_user: Option<usize>,
    pub fetch_game_details: bool,
    pub only_newer_games: bool,
    /// How far an event may postdate a cached nickname mapping before the
    /// resolver distrusts the cache.
    pub nickname_staleness: ChronoDuration,
    pub max_nickname_attempts: u32,
    /// A seed uid validated more recently than this skips the probe.
    pub uid_recheck_interval: ChronoDuration,
    pub max_failed_uids_per_seed: usize,
    pub max_uid_recoveries_per_seed: u32,
    pub participant_retry_attempts: u32,
    pub participant_retry_delay: StdDuration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            max_games_per_user: None,
            fetch_game_details: true,
            only_newer_games: true,
            nickname_staleness: ChronoDuration::hours(1),
            max_nickname_attempts: 3,
            uid_recheck_interval: ChronoDuration::days(3),
            max_failed_uids_per_seed: 3,
            max_uid_recoveries_per_seed: 3,
            participant_retry_attempts: 2,
            participant_retry_delay: StdDuration::from_millis(500),
        }
    }
}

/// A traversal starting point: either a known uid or a nickname still to
/// be resolved.
#[derive(Debug, Clone)]
pub enum Seed {
    Uid(String),
    Nickname(String),
}

impl Seed {
    fn key(&self) -> String {
        match self {
            Seed::Uid(v) => format!("uid:{v}"),
            Seed::Nickname(v) => format!("nick:{v}"),
        }
    }
}

#[derive(Debug, Default)]
struct ParticipantOutcome {
    discovered: HashSet<String>,
    failed: usize,
    total: usize,
}

enum FetchOutcome {
    Fetched(ParticipantOutcome),
    PayloadMissing,
    FetchFailed(String),
}

/// Counters reported by a re-fetch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefetchSummary {
    pub total: usize,
    pub cleared: usize,
    pub not_found: usize,
    pub empty: usize,
    pub still_incomplete: usize,
}

/// Coordinates recursive ingestion of match data: seed recheck, paginated
/// traversal with cutoff and prune-floor early stops, identity recovery,
/// participant reconciliation, and the incomplete-match re-fetch pass.
pub struct IngestionManager<'a, C: MatchApi> {
    client: C,
    store: &'a SqliteStore,
    options: IngestOptions,
    parquet: Option<ParquetExporter>,
    progress: Option<Box<dyn FnMut(&str) + 'a>>,
}

impl<'a, C: MatchApi> IngestionManager<'a, C> {
    pub fn new(client: C, store: &'a SqliteStore, options: IngestOptions) -> Self {
        Self {
            client,
            store,
            options,
            parquet: None,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: impl FnMut(&str) + 'a) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn with_parquet(mut self, exporter: ParquetExporter) -> Self {
        self.parquet = Some(exporter);
        self
    }

    /// Hand the client back, e.g. so a caller can inspect a test double.
    pub fn into_client(self) -> C {
        self.client
    }

    /// Flush and close the columnar sink, if one is attached.
    pub fn finish_parquet(&mut self) -> Result<()> {
        if let Some(mut exporter) = self.parquet.take() {
            exporter.close()?;
        }
        Ok(())
    }

    fn report(&mut self, message: &str) {
        if let Some(progress) = self.progress.as_mut() {
            progress(message);
        }
    }

    fn resolver(&self) -> IdentityResolver {
        IdentityResolver {
            staleness_window: self.options.nickname_staleness,
            max_attempts: self.options.max_nickname_attempts,
        }
    }

    fn resolve_handle(&mut self, run: &mut RunContext, nickname: &str) -> Result<Option<String>> {
        let resolver = self.resolver();
        resolver.resolve(self.store, &mut self.client, run, nickname, None)
    }

    /// Breadth-first ingestion starting from the provided seeds, following
    /// discovered nicknames up to `depth` hops. Per-seed failures are
    /// reported and skipped; only fatal transport errors propagate.
    pub fn ingest_from_seeds(&mut self, seeds: &[Seed], depth: u32) -> Result<()> {
        let mut run = RunContext::new(Utc::now());
        let mut queue: VecDeque<(Seed, u32)> = seeds.iter().cloned().map(|s| (s, 0)).collect();
        let mut seen: HashSet<String> = HashSet::new();
        while let Some((seed, current_depth)) = queue.pop_front() {
            self.report(&format!("Ingest queue left: {} users", queue.len() + 1));
            if !seen.insert(seed.key()) {
                continue;
            }
            let (uid, nickname) = match &seed {
                Seed::Uid(uid) => (Some(uid.clone()), self.store.latest_nickname_for_uid(uid)?),
                Seed::Nickname(nickname) => {
                    let resolved = self.resolve_handle(&mut run, nickname)?;
                    if resolved.is_none() {
                        self.report(&format!(
                            "Could not resolve seed nickname '{nickname}'; skipping"
                        ));
                    }
                    (resolved, Some(nickname.clone()))
                }
            };
            let Some(uid) = uid else { continue };
            if matches!(seed, Seed::Nickname(_)) && !seen.insert(format!("uid:{uid}")) {
                continue;
            }
            self.report(&format!("Ingesting user {uid} at depth {current_depth}"));
            let discovered = self.ingest_user_in_run(&mut run, &uid, nickname.as_deref())?;
            self.report(&format!(
                "Discovered {} new users from user {uid}",
                discovered.len()
            ));
            if current_depth + 1 > depth {
                continue;
            }
            for handle in discovered {
                if !seen.contains(&format!("nick:{handle}")) {
                    queue.push_back((Seed::Nickname(handle), current_depth + 1));
                }
            }
        }
        Ok(())
    }

    /// Ingest matches for a single user, returning the nicknames of newly
    /// discovered participants.
    pub fn ingest_user(
        &mut self,
        uid: &str,
        seed_nickname: Option<&str>,
    ) -> Result<HashSet<String>> {
        let mut run = RunContext::new(Utc::now());
        self.ingest_user_in_run(&mut run, uid, seed_nickname)
    }

    fn ingest_user_in_run(
        &mut self,
        run: &mut RunContext,
        uid: &str,
        seed_nickname: Option<&str>,
    ) -> Result<HashSet<String>> {
        self.report(&format!("Fetching games for uid {uid}"));
        let mut uid = uid.to_string();
        let mut recovery = SeedRecovery::default();
        let mut pending_page: Option<GamePage> = None;

        if self.needs_recheck(run, &uid)? {
            // Existence probe: the first page with no token. On success the
            // page doubles as page one of the traversal.
            loop {
                match self.client.fetch_user_games(&uid, None) {
                    Ok(page) => {
                        self.store
                            .update_user_last_checked(&uid, &run.started_at().to_rfc3339())?;
                        pending_page = Some(page);
                        break;
                    }
                    Err(ApiError::UidRejected { .. }) => {
                        match self.recover_uid(run, &mut recovery, seed_nickname, &uid)? {
                            Some(candidate) => uid = candidate,
                            None => return Ok(HashSet::new()),
                        }
                    }
                    Err(ApiError::NoGames { .. }) => {
                        self.report(&format!(
                            "No games recorded for uid {uid}; treating as valid but empty"
                        ));
                        self.store
                            .update_user_last_checked(&uid, &run.started_at().to_rfc3339())?;
                        return Ok(HashSet::new());
                    }
                    Err(err) if err.is_fatal() => return Err(err.into()),
                    Err(err) => {
                        self.report(&format!(
                            "Probe for uid {uid} failed: {err}; skipping this seed"
                        ));
                        return Ok(HashSet::new());
                    }
                }
            }
        }
        self.traverse_games(run, uid, seed_nickname, pending_page, &mut recovery)
    }

    fn needs_recheck(&self, run: &RunContext, uid: &str) -> Result<bool> {
        let Some(last_checked) = self.store.user_last_checked(uid)? else {
            return Ok(true);
        };
        let Some(checked_at) = parse_iso(&last_checked) else {
            return Ok(true);
        };
        Ok(run.started_at() - checked_at >= self.options.uid_recheck_interval)
    }

    /// The stale-identity recovery loop (one step). Ok(Some(uid)) means
    /// retry with the new uid; Ok(None) means abandon this seed.
    fn recover_uid(
        &mut self,
        run: &mut RunContext,
        recovery: &mut SeedRecovery,
        seed_nickname: Option<&str>,
        rejected: &str,
    ) -> Result<Option<String>> {
        let Some(nickname) = seed_nickname else {
            self.report(&format!(
                "Uid {rejected} was rejected and no seed nickname is known; aborting this seed"
            ));
            return Ok(None);
        };
        if let Err(reason) = recovery.record_rejection(
            rejected,
            self.options.max_failed_uids_per_seed,
            self.options.max_uid_recoveries_per_seed,
        ) {
            self.report(&format!(
                "Aborting traversal for '{nickname}': {} (last rejected uid {rejected}, {} resolution attempts)",
                reason.describe(),
                recovery.resolve_attempts(),
            ));
            return Ok(None);
        }
        self.report(&format!(
            "Uid {rejected} rejected; re-resolving nickname '{nickname}'"
        ));
        let resolver = self.resolver();
        let resolved = resolver.resolve_remote(&mut self.client, run, nickname)?;
        let Some(candidate) = resolved else {
            self.report(&format!(
                "Aborting traversal for '{nickname}': {}",
                RecoveryAbort::ResolutionFailed.describe()
            ));
            return Ok(None);
        };
        if let Err(reason) = recovery.accept_candidate(rejected, &candidate) {
            self.report(&format!(
                "Aborting traversal for '{nickname}': {}",
                reason.describe()
            ));
            return Ok(None);
        }
        self.report(&format!(
            "Recovered uid {candidate} for nickname '{nickname}'"
        ));
        Ok(Some(candidate))
    }

    fn traverse_games(
        &mut self,
        run: &mut RunContext,
        uid: String,
        seed_nickname: Option<&str>,
        pending_page: Option<GamePage>,
        recovery: &mut SeedRecovery,
    ) -> Result<HashSet<String>> {
        let mut uid = uid;
        let mut pending_page = pending_page;
        let mut discovered: HashSet<String> = HashSet::new();
        let mut processed = 0usize;

        'seed: loop {
            let cutoff = if self.options.only_newer_games {
                self.store
                    .user_ingested_until(&uid)?
                    .as_deref()
                    .and_then(parse_iso)
            } else {
                None
            };
            let prune_floor = match self.store.prune_before()? {
                Some(floor) => parse_iso(&floor),
                None => None,
            };
            let mut next_token: Option<String> = None;

            loop {
                let page = if let Some(page) = pending_page.take() {
                    page
                } else {
                    match self.client.fetch_user_games(&uid, next_token.as_deref()) {
                        Ok(page) => page,
                        Err(ApiError::UidRejected { .. }) => {
                            match self.recover_uid(run, recovery, seed_nickname, &uid)? {
                                Some(candidate) => {
                                    self.report(&format!(
                                        "Restarting pagination with recovered uid {candidate}"
                                    ));
                                    uid = candidate;
                                    continue 'seed;
                                }
                                None => return Ok(discovered),
                            }
                        }
                        Err(ApiError::NoGames { .. }) => {
                            self.report(&format!("No further games recorded for uid {uid}"));
                            return Ok(discovered);
                        }
                        Err(err) if err.is_fatal() => return Err(err.into()),
                        Err(err) => {
                            self.report(&format!(
                                "Fetching games for uid {uid} failed: {err}; stopping this user"
                            ));
                            return Ok(discovered);
                        }
                    }
                };

                let page_ids: Vec<i64> =
                    page.user_games.iter().filter_map(|g| g.game_id).collect();
                let tombstoned = self.store.list_deleted_games(&page_ids)?;

                // Records are processed in server-returned order; the first
                // one at or before a boundary stops the whole user.
                for record in &page.user_games {
                    let start = record.start_time().as_deref().and_then(parse_iso);
                    if let (Some(start), Some(floor)) = (start, prune_floor)
                        && start <= floor
                    {
                        self.report(&format!(
                            "Game {:?} for uid {uid} is at or before the prune floor; stopping",
                            record.game_id
                        ));
                        return Ok(discovered);
                    }
                    if let (Some(start), Some(cutoff)) = (start, cutoff)
                        && start <= cutoff
                    {
                        self.report(&format!(
                            "Encountered previously ingested game {:?} for uid {uid}; stopping early",
                            record.game_id
                        ));
                        return Ok(discovered);
                    }
                    let Some(game_id) = record.game_id else {
                        continue;
                    };
                    if tombstoned.contains(&game_id) {
                        self.report(&format!("Game {game_id} is tombstoned; skipping"));
                        continue;
                    }
                    let already_known = self.store.has_game(game_id)?;
                    let Some(owner_nickname) = non_empty(record.nickname.as_deref()) else {
                        continue;
                    };
                    let owner_uid = {
                        let resolver = self.resolver();
                        resolver.resolve(
                            self.store,
                            &mut self.client,
                            run,
                            &owner_nickname,
                            start,
                        )?
                    };
                    let Some(owner_uid) = owner_uid else {
                        self.report(&format!(
                            "Could not resolve nickname '{owner_nickname}' for game {game_id}; skipping record"
                        ));
                        continue;
                    };

                    // Match row, owner participation and the participant
                    // sweep commit as one unit: an interrupt mid-match
                    // leaves the match absent, never half-populated.
                    let store = self.store;
                    let outcome = store.in_transaction(|_| {
                        self.persist_record(record, &owner_uid, true)?;
                        if self.options.fetch_game_details {
                            self.reconcile_participants(run, game_id, already_known, false)
                        } else {
                            run.mark_game_seen(game_id);
                            Ok(FetchOutcome::Fetched(ParticipantOutcome::default()))
                        }
                    })?;
                    if let FetchOutcome::Fetched(participants) = outcome {
                        discovered.extend(participants.discovered);
                    }
                    processed += 1;
                    self.report(&format!("Processed game {processed} for uid {uid}"));
                    if let Some(cap) = self.options.max_games_per_user
                        && processed >= cap
                    {
                        self.report(&format!(
                            "Reached per-user cap of {cap} games for uid {uid}"
                        ));
                        return Ok(discovered);
                    }
                }

                next_token = page.next.clone();
                if next_token.is_none() {
                    return Ok(discovered);
                }
            }
        }
    }

    /// Ensure every participant of a game is persisted, tolerating
    /// individual participant failures. Returns the discovered nicknames
    /// and the failure/total counts the re-fetch pass needs.
    fn reconcile_participants(
        &mut self,
        run: &mut RunContext,
        game_id: i64,
        already_known: bool,
        force: bool,
    ) -> Result<FetchOutcome> {
        if !run.mark_game_seen(game_id) && !force {
            return Ok(FetchOutcome::Fetched(ParticipantOutcome::default()));
        }
        if self.store.is_game_deleted(game_id)? {
            self.report(&format!("Game {game_id} is tombstoned; skipping participants"));
            return Ok(FetchOutcome::Fetched(ParticipantOutcome::default()));
        }
        if already_known && !force {
            // Participant lists are immutable once a game has ended, so a
            // populated cache makes the remote call redundant.
            let cached = self.store.participants_for_game(game_id)?;
            if cached.len() > 1 {
                let mut discovered = HashSet::new();
                for cached_uid in &cached {
                    if let Some(nickname) = self.store.latest_nickname_for_uid(cached_uid)? {
                        discovered.insert(nickname);
                    }
                }
                self.report(&format!(
                    "Skipping API fetch for known game {game_id}; loaded {} participants from cache",
                    cached.len()
                ));
                return Ok(FetchOutcome::Fetched(ParticipantOutcome {
                    discovered,
                    failed: 0,
                    total: cached.len(),
                }));
            }
        }

        let records = match self.client.fetch_game_result(game_id) {
            Ok(records) => records,
            Err(ApiError::GameNotFound { .. }) => {
                self.store.mark_game_incomplete(game_id)?;
                self.report(&format!(
                    "Game {game_id} payload is missing upstream; marked incomplete"
                ));
                return Ok(FetchOutcome::PayloadMissing);
            }
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                self.store.mark_game_incomplete(game_id)?;
                self.report(&format!(
                    "Fetching participants for game {game_id} failed: {err}; marked incomplete"
                ));
                return Ok(FetchOutcome::FetchFailed(err.to_string()));
            }
        };

        let mut outcome = ParticipantOutcome {
            total: records.len(),
            ..Default::default()
        };
        for record in &records {
            match self.persist_participant(run, record)? {
                Some(nickname) => {
                    outcome.discovered.insert(nickname);
                }
                None => outcome.failed += 1,
            }
        }
        if outcome.failed > 0 {
            self.store.mark_game_incomplete(game_id)?;
            self.report(&format!(
                "{} of {} participants failed for game {game_id}; marked incomplete",
                outcome.failed, outcome.total
            ));
        }
        self.report(&format!(
            "Fetched {} participants for game {game_id}",
            outcome.total
        ));
        Ok(FetchOutcome::Fetched(outcome))
    }

    /// Persist one participant. Ok(Some(nickname)) on success, Ok(None)
    /// when the participant is counted as failed.
    fn persist_participant(
        &mut self,
        run: &mut RunContext,
        record: &GameRecord,
    ) -> Result<Option<String>> {
        let Some(nickname) = non_empty(record.nickname.as_deref()) else {
            return Ok(None);
        };
        let reference = record.start_time().as_deref().and_then(parse_iso);
        let resolved = {
            let resolver = self.resolver();
            resolver.resolve(self.store, &mut self.client, run, &nickname, reference)?
        };
        let Some(uid) = resolved else {
            self.report(&format!(
                "Could not resolve participant nickname '{nickname}'; counting as failed"
            ));
            return Ok(None);
        };
        let attempts = self.options.participant_retry_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.persist_record(record, &uid, false) {
                Ok(()) => return Ok(Some(nickname)),
                Err(err) if attempt < attempts => {
                    self.report(&format!(
                        "Upsert for participant '{nickname}' failed (attempt {attempt}): {err}; retrying"
                    ));
                    thread::sleep(self.options.participant_retry_delay);
                }
                Err(err) => {
                    self.report(&format!(
                        "Upsert for participant '{nickname}' failed: {err}; counting as failed"
                    ));
                    return Ok(None);
                }
            }
        }
    }

    fn persist_record(&mut self, record: &GameRecord, uid: &str, mark_ingested: bool) -> Result<()> {
        self.store.upsert_user(&record.user_row(uid), mark_ingested)?;
        let match_row = record.match_row().ok_or_else(|| {
            anyhow!(
                "game record {:?} is missing required match context",
                record.game_id
            )
        })?;
        self.store.upsert_match(&match_row)?;
        let participant = record
            .participant_row(uid)
            .ok_or_else(|| anyhow!("game record for uid {uid} is missing a game id"))?;
        let game_id = participant.game_id;
        self.store.upsert_user_match_stats(&participant)?;
        self.store
            .replace_equipment(game_id, uid, &record.equipment, &record.equipment_grade)?;
        if let Some(parquet) = self.parquet.as_mut() {
            parquet.write_game(record, uid)?;
        }
        Ok(())
    }

    /// Retry matches previously flagged incomplete. Runs on its own
    /// invocation, never inline during ingestion.
    pub fn refetch_incomplete_games(&mut self, game_ids: &[i64]) -> Result<RefetchSummary> {
        self.refetch_incomplete_games_at(game_ids, Utc::now())
    }

    pub fn refetch_incomplete_games_at(
        &mut self,
        game_ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<RefetchSummary> {
        let mut run = RunContext::new(now);
        let mut summary = RefetchSummary {
            total: game_ids.len(),
            ..Default::default()
        };
        for &game_id in game_ids {
            if self.store.is_game_deleted(game_id)? {
                self.report(&format!("Game {game_id} is tombstoned; skipping refetch"));
                continue;
            }
            let store = self.store;
            let outcome = store
                .in_transaction(|_| self.reconcile_participants(&mut run, game_id, true, true))?;
            match outcome {
                FetchOutcome::PayloadMissing => {
                    summary.not_found += 1;
                    self.schedule_refetch_retry(game_id, "missing", "http_404", now)?;
                }
                FetchOutcome::FetchFailed(reason) => {
                    summary.still_incomplete += 1;
                    self.schedule_refetch_retry(game_id, "error", &reason, now)?;
                }
                FetchOutcome::Fetched(outcome) => {
                    if outcome.total == 0 {
                        summary.empty += 1;
                        self.report(&format!(
                            "Refetch of game {game_id} returned no participants; keeping incomplete"
                        ));
                        self.schedule_refetch_retry(game_id, "error", "empty_participants", now)?;
                    } else if outcome.failed > 0 {
                        summary.still_incomplete += 1;
                        self.schedule_refetch_retry(
                            game_id,
                            "error",
                            "incomplete_participants",
                            now,
                        )?;
                    } else {
                        self.store.clear_game_incomplete(game_id)?;
                        self.store.clear_refetch_status(game_id)?;
                        summary.cleared += 1;
                        self.report(&format!(
                            "Refetch of game {game_id} cleared the incomplete flag"
                        ));
                    }
                }
            }
        }
        Ok(summary)
    }

    fn schedule_refetch_retry(
        &mut self,
        game_id: i64,
        status: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let attempts = self.store.refetch_attempts(game_id)? + 1;
        let next = now + refetch_backoff(attempts);
        self.store.upsert_refetch_status(
            game_id,
            status,
            attempts,
            &now.to_rfc3339(),
            &next.to_rfc3339(),
            Some(error),
        )?;
        self.report(&format!(
            "Game {game_id} re-fetch status '{status}' (attempt {attempts}); next attempt at {}",
            next.to_rfc3339()
        ));
        Ok(())
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
