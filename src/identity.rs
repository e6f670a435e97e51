use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Duration, FixedOffset, Utc};

use crate::api_client::{ApiError, MatchApi};
use crate::db::{SqliteStore, parse_iso};

/// State scoped to one traversal run (one `ingest_from_seeds`,
/// `ingest_user`, or refetch invocation). Kept off the engine so the
/// bookkeeping resets with each run and the policies stay testable in
/// isolation.
#[derive(Debug)]
pub struct RunContext {
    started_at: DateTime<FixedOffset>,
    seen_games: HashSet<i64>,
    missing_nicknames: HashSet<String>,
}

impl RunContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now.fixed_offset(),
            seen_games: HashSet::new(),
            missing_nicknames: HashSet::new(),
        }
    }

    pub fn started_at(&self) -> DateTime<FixedOffset> {
        self.started_at
    }

    /// Returns true the first time a game id is seen this run.
    pub fn mark_game_seen(&mut self, game_id: i64) -> bool {
        self.seen_games.insert(game_id)
    }

    pub fn note_missing_nickname(&mut self, nickname: &str) {
        self.missing_nicknames.insert(nickname.to_string());
    }

    pub fn nickname_known_missing(&self, nickname: &str) -> bool {
        self.missing_nicknames.contains(nickname)
    }
}

/// Nickname-to-uid resolution using the cheapest trustworthy source.
#[derive(Debug, Clone, Copy)]
pub struct IdentityResolver {
    pub staleness_window: Duration,
    pub max_attempts: u32,
}

impl IdentityResolver {
    /// Resolve a nickname to a uid, preferring the cached mapping when its
    /// recency makes it trustworthy relative to the event being processed.
    ///
    /// Ok(None) means unresolved (the caller skips the record); Err is
    /// reserved for fatal transport failures. The resolved uid is not
    /// written back here: persistence happens when the caller upserts the
    /// record carrying it.
    pub fn resolve<C: MatchApi>(
        &self,
        store: &SqliteStore,
        client: &mut C,
        run: &mut RunContext,
        nickname: &str,
        reference: Option<DateTime<FixedOffset>>,
    ) -> Result<Option<String>> {
        if let Some((uid, last_seen)) = store.uid_info_for_nickname(nickname)? {
            let recency = last_seen.as_deref().and_then(parse_iso);
            match (reference, recency) {
                // No event time at all: keep the cache rather than forcing
                // a re-resolution over a missing timestamp.
                (None, _) => return Ok(Some(uid)),
                (Some(reference), Some(recency)) => {
                    if reference <= recency || reference - recency <= self.staleness_window {
                        return Ok(Some(uid));
                    }
                }
                // Cached mapping with unknown recency: re-resolve.
                (Some(_), None) => {}
            }
        }
        self.resolve_remote(client, run, nickname)
    }

    /// Remote resolution, ignoring the cache. Used directly by the
    /// stale-identity recovery loop.
    pub fn resolve_remote<C: MatchApi>(
        &self,
        client: &mut C,
        run: &mut RunContext,
        nickname: &str,
    ) -> Result<Option<String>> {
        if run.nickname_known_missing(nickname) {
            return Ok(None);
        }
        let mut attempts = 0u32;
        while attempts < self.max_attempts.max(1) {
            attempts += 1;
            match client.fetch_user_by_nickname(nickname) {
                Ok(resolved) => return Ok(Some(resolved.uid)),
                Err(ApiError::NicknameNotFound { .. }) => {
                    // Known-missing for the rest of this run.
                    run.note_missing_nickname(nickname);
                    return Ok(None);
                }
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(_) => {}
            }
        }
        Ok(None)
    }
}

/// Why a seed's traversal was abandoned by the recovery loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAbort {
    TooManyFailedUids,
    TooManyResolveAttempts,
    ResolutionFailed,
    NoProgress,
    Cycle,
}

impl RecoveryAbort {
    pub fn describe(&self) -> &'static str {
        match self {
            RecoveryAbort::TooManyFailedUids => "too many rejected uid variants",
            RecoveryAbort::TooManyResolveAttempts => "nickname re-resolution attempts exhausted",
            RecoveryAbort::ResolutionFailed => "nickname re-resolution failed",
            RecoveryAbort::NoProgress => "re-resolution returned the rejected uid",
            RecoveryAbort::Cycle => "re-resolution cycled back to a rejected uid",
        }
    }
}

/// Per-seed bookkeeping for the stale-identity recovery loop. The caps
/// guarantee termination within min(max_failed_uids, max_resolve_attempts)
/// rejection cycles, and the failed set guarantees no uid variant is ever
/// retried.
#[derive(Debug, Default)]
pub struct SeedRecovery {
    failed_uids: HashSet<String>,
    resolve_attempts: u32,
}

impl SeedRecovery {
    /// Record a rejected uid and decide whether another resolution attempt
    /// is allowed.
    pub fn record_rejection(
        &mut self,
        uid: &str,
        max_failed_uids: usize,
        max_resolve_attempts: u32,
    ) -> Result<(), RecoveryAbort> {
        self.failed_uids.insert(uid.to_string());
        if self.failed_uids.len() >= max_failed_uids {
            return Err(RecoveryAbort::TooManyFailedUids);
        }
        self.resolve_attempts += 1;
        if self.resolve_attempts >= max_resolve_attempts {
            return Err(RecoveryAbort::TooManyResolveAttempts);
        }
        Ok(())
    }

    /// Uid equality is a case-sensitive exact match; a candidate equal to
    /// the rejected uid is non-progress, one already in the failed set is
    /// a cycle.
    pub fn accept_candidate(&self, rejected: &str, candidate: &str) -> Result<(), RecoveryAbort> {
        if candidate == rejected {
            return Err(RecoveryAbort::NoProgress);
        }
        if self.failed_uids.contains(candidate) {
            return Err(RecoveryAbort::Cycle);
        }
        Ok(())
    }

    pub fn resolve_attempts(&self) -> u32 {
        self.resolve_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::{RecoveryAbort, SeedRecovery};

    #[test]
    fn recovery_aborts_after_failed_uid_cap() {
        let mut recovery = SeedRecovery::default();
        assert!(recovery.record_rejection("U1", 3, 10).is_ok());
        assert!(recovery.record_rejection("U2", 3, 10).is_ok());
        assert_eq!(
            recovery.record_rejection("U3", 3, 10),
            Err(RecoveryAbort::TooManyFailedUids)
        );
    }

    #[test]
    fn recovery_aborts_after_resolve_attempt_cap() {
        let mut recovery = SeedRecovery::default();
        assert!(recovery.record_rejection("U1", 10, 2).is_ok());
        assert_eq!(
            recovery.record_rejection("U2", 10, 2),
            Err(RecoveryAbort::TooManyResolveAttempts)
        );
    }

    #[test]
    fn recovery_rejects_no_progress_and_cycles() {
        let mut recovery = SeedRecovery::default();
        recovery.record_rejection("U1", 10, 10).unwrap();
        assert_eq!(
            recovery.accept_candidate("U1", "U1"),
            Err(RecoveryAbort::NoProgress)
        );
        recovery.record_rejection("U2", 10, 10).unwrap();
        assert_eq!(
            recovery.accept_candidate("U2", "U1"),
            Err(RecoveryAbort::Cycle)
        );
        assert!(recovery.accept_candidate("U2", "U3").is_ok());
    }

    #[test]
    fn recovery_terminates_under_adversarial_rejections() {
        // Every candidate is fresh, so only the caps can stop the loop.
        let max_failed = 5usize;
        let max_attempts = 7u32;
        let mut recovery = SeedRecovery::default();
        let mut cycles = 0u32;
        loop {
            let uid = format!("U{cycles}");
            if recovery
                .record_rejection(&uid, max_failed, max_attempts)
                .is_err()
            {
                break;
            }
            cycles += 1;
        }
        assert!(u64::from(cycles) < (max_failed as u64).min(u64::from(max_attempts)));
    }

    #[test]
    fn uid_comparison_is_case_sensitive() {
        let mut recovery = SeedRecovery::default();
        recovery.record_rejection("uid-a", 10, 10).unwrap();
        assert!(recovery.accept_candidate("uid-a", "UID-A").is_ok());
    }
}
