mod support;

use chrono::{Duration, TimeZone, Utc};

use er_stats::ingest::{IngestionManager, RefetchSummary};

use support::{FakeApi, count, make_game, open_store, persist_game, test_options};

fn seed_incomplete_game(store: &er_stats::db::SqliteStore, game_id: i64) {
    let seed = make_game(game_id, "seed");
    persist_game(store, &seed, "UID-seed");
    store.mark_game_incomplete(game_id).expect("mark incomplete");
}

#[test]
fn refetch_clears_incomplete_on_success() {
    let store = open_store();
    seed_incomplete_game(&store, 1);

    let api = FakeApi::new()
        .with_nickname("p1", "UID-p1")
        .with_participants(1, vec![make_game(1, "p1")]);
    let mut manager = IngestionManager::new(api, &store, test_options());
    let summary = manager.refetch_incomplete_games(&[1]).expect("refetch");

    assert_eq!(
        summary,
        RefetchSummary {
            total: 1,
            cleared: 1,
            ..RefetchSummary::default()
        }
    );
    assert_eq!(count(&store, "SELECT incomplete FROM matches WHERE game_id=1"), 0);
    assert_eq!(
        count(&store, "SELECT COUNT(*) FROM match_refetch_status WHERE game_id=1"),
        0,
        "schedule entry cleared on success"
    );
}

#[test]
fn refetch_keeps_incomplete_on_empty_participants() {
    let store = open_store();
    seed_incomplete_game(&store, 2);

    let api = FakeApi::new().with_participants(2, vec![]);
    let mut manager = IngestionManager::new(api, &store, test_options());
    let now = Utc.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap();
    let summary = manager
        .refetch_incomplete_games_at(&[2], now)
        .expect("refetch");

    assert_eq!(summary.empty, 1);
    assert_eq!(summary.cleared, 0);
    assert_eq!(count(&store, "SELECT incomplete FROM matches WHERE game_id=2"), 1);

    let (status, next_refetch_at): (String, String) = store
        .connection()
        .query_row(
            "SELECT status, next_refetch_at FROM match_refetch_status WHERE game_id=2",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("status row");
    assert_eq!(status, "error");
    // First attempt: next eligible in exactly one day.
    assert_eq!(next_refetch_at, (now + Duration::days(1)).to_rfc3339());
}

#[test]
fn refetch_keeps_incomplete_on_payload_404() {
    let store = open_store();
    seed_incomplete_game(&store, 3);

    let mut api = FakeApi::new();
    api.missing_payload_games.insert(3);
    let mut manager = IngestionManager::new(api, &store, test_options());
    let summary = manager.refetch_incomplete_games(&[3]).expect("refetch");

    assert_eq!(summary.not_found, 1);
    assert_eq!(count(&store, "SELECT incomplete FROM matches WHERE game_id=3"), 1);
    let (status, next_refetch_at): (String, Option<String>) = store
        .connection()
        .query_row(
            "SELECT status, next_refetch_at FROM match_refetch_status WHERE game_id=3",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("status row");
    assert_eq!(status, "missing");
    assert!(next_refetch_at.is_some());
}

#[test]
fn refetch_counts_residual_participant_failures() {
    let store = open_store();
    seed_incomplete_game(&store, 4);

    // One of two participants still cannot be resolved.
    let api = FakeApi::new()
        .with_nickname("p1", "UID-p1")
        .with_participants(4, vec![make_game(4, "p1"), make_game(4, "ghost")]);
    let mut manager = IngestionManager::new(api, &store, test_options());
    let summary = manager.refetch_incomplete_games(&[4]).expect("refetch");

    assert_eq!(summary.still_incomplete, 1);
    assert_eq!(count(&store, "SELECT incomplete FROM matches WHERE game_id=4"), 1);
    let status: String = store
        .connection()
        .query_row(
            "SELECT status FROM match_refetch_status WHERE game_id=4",
            [],
            |row| row.get(0),
        )
        .expect("status row");
    assert_eq!(status, "error");
}

#[test]
fn transport_404_propagates_as_fatal() {
    let store = open_store();
    seed_incomplete_game(&store, 13);

    let mut api = FakeApi::new();
    api.transport_404_games.insert(13);
    let mut manager = IngestionManager::new(api, &store, test_options());

    assert!(manager.refetch_incomplete_games(&[13]).is_err());
    // Still incomplete and unscheduled: the endpoint is broken, not the match.
    assert_eq!(count(&store, "SELECT incomplete FROM matches WHERE game_id=13"), 1);
    assert_eq!(
        count(&store, "SELECT COUNT(*) FROM match_refetch_status WHERE game_id=13"),
        0
    );
}

#[test]
fn backoff_doubles_across_failed_attempts() {
    let store = open_store();
    seed_incomplete_game(&store, 5);

    let now = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
    for (attempt, expected_days) in [(1i64, 1i64), (2, 2), (3, 4)] {
        let api = FakeApi::new().with_participants(5, vec![]);
        let mut manager = IngestionManager::new(api, &store, test_options());
        manager
            .refetch_incomplete_games_at(&[5], now)
            .expect("refetch");
        let (attempts, next_refetch_at): (i64, String) = store
            .connection()
            .query_row(
                "SELECT attempts, next_refetch_at FROM match_refetch_status WHERE game_id=5",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("status row");
        assert_eq!(attempts, attempt);
        assert_eq!(
            next_refetch_at,
            (now + Duration::days(expected_days)).to_rfc3339()
        );
    }
}

#[test]
fn candidate_listing_filters_by_season_and_mode() {
    let store = open_store();
    let mut game_a = make_game(10, "a");
    game_a.season_id = Some(25);
    game_a.matching_mode = Some(3);
    let mut game_b = make_game(11, "b");
    game_b.season_id = Some(26);
    game_b.matching_mode = Some(2);
    persist_game(&store, &game_a, "UID-a");
    persist_game(&store, &game_b, "UID-b");
    store.mark_game_incomplete(10).expect("mark");
    store.mark_game_incomplete(11).expect("mark");

    let now = "2025-01-01T00:00:00+00:00";
    let only_season = store
        .list_refetch_candidates(Some(25), None, false, false, now, None)
        .expect("candidates");
    assert_eq!(only_season, vec![10]);

    let only_mode = store
        .list_refetch_candidates(None, Some(2), false, false, now, None)
        .expect("candidates");
    assert_eq!(only_mode, vec![11]);
}

#[test]
fn candidate_listing_excludes_missing_and_not_due() {
    let store = open_store();
    seed_incomplete_game(&store, 12);
    store
        .upsert_refetch_status(
            12,
            "missing",
            1,
            "2025-01-01T00:00:00+00:00",
            "2025-01-02T00:00:00+00:00",
            Some("http_404"),
        )
        .expect("status");

    let now = "2025-01-03T00:00:00+00:00";
    let excluded = store
        .list_refetch_candidates(None, None, false, false, now, None)
        .expect("candidates");
    assert!(excluded.is_empty());

    let included = store
        .list_refetch_candidates(None, None, true, false, now, None)
        .expect("candidates");
    assert_eq!(included, vec![12]);

    // A scheduled retry in the future is skipped until it is due.
    seed_incomplete_game(&store, 14);
    store
        .upsert_refetch_status(
            14,
            "error",
            1,
            "2025-01-01T00:00:00+00:00",
            "2025-01-05T00:00:00+00:00",
            Some("empty_participants"),
        )
        .expect("status");
    let due_only = store
        .list_refetch_candidates(None, None, false, false, now, None)
        .expect("candidates");
    assert!(due_only.is_empty());
    let with_not_due = store
        .list_refetch_candidates(None, None, false, true, now, None)
        .expect("candidates");
    assert_eq!(with_not_due, vec![14]);
}

#[test]
fn tombstoned_game_is_skipped_by_refetch() {
    let store = open_store();
    seed_incomplete_game(&store, 20);
    store
        .connection()
        .execute(
            "INSERT INTO deleted_matches (game_id, reason, deleted_at)
             VALUES (21, 'retention_prune', '2025-01-01T00:00:00+00:00')",
            [],
        )
        .expect("tombstone");

    let api = FakeApi::new()
        .with_nickname("p1", "UID-p1")
        .with_participants(20, vec![make_game(20, "p1")]);
    let mut manager = IngestionManager::new(api, &store, test_options());
    let summary = manager.refetch_incomplete_games(&[21, 20]).expect("refetch");

    assert_eq!(summary.cleared, 1);
    let api = manager.into_client();
    assert_eq!(api.game_result_calls, vec![20], "tombstoned id never fetched");
}
