use std::hint::black_box;
use std::time::{Duration, Instant};

use criterion::{Criterion, criterion_group, criterion_main};

use er_stats::api_client::{GameRecord, RateLimiter};
use er_stats::db::parse_start_time;
use er_stats::ingest::refetch_backoff;

const GAME_JSON: &str = r#"{
    "gameId": 42,
    "seasonId": 25,
    "matchingMode": 3,
    "matchingTeamMode": 1,
    "serverName": "NA",
    "versionMajor": 1,
    "versionMinor": 0,
    "startDtm": "2025-10-27T23:24:03.003+0900",
    "duration": 900,
    "nickname": "Philmist",
    "characterNum": 14,
    "gameRank": 2,
    "playerKill": 5,
    "playerAssistant": 3,
    "monsterKill": 21,
    "mmrGainInGame": 12,
    "mmrLossEntryCost": 5,
    "victory": 0,
    "playTime": 912,
    "damageToPlayer": 10422,
    "characterLevel": 17,
    "bestWeapon": 7,
    "bestWeaponLevel": 12,
    "teamNumber": 3,
    "preMade": 0,
    "language": "en",
    "equipment": {"0": 101101, "1": 101102, "2": 101103},
    "equipmentGrade": {"0": 2, "1": 3, "2": 3}
}"#;

fn bench_parse_start_time(c: &mut Criterion) {
    c.bench_function("parse_start_time_compact_offset", |b| {
        b.iter(|| parse_start_time(black_box(Some("2025-10-27T23:24:03.003+0900"))))
    });
}

fn bench_game_record_parse(c: &mut Criterion) {
    c.bench_function("game_record_parse_and_translate", |b| {
        b.iter(|| {
            let record: GameRecord = serde_json::from_str(black_box(GAME_JSON)).unwrap();
            let row = record.match_row().unwrap();
            black_box(row.game_id);
        })
    });
}

fn bench_rate_limiter_delay(c: &mut Criterion) {
    let mut limiter = RateLimiter::new(Duration::from_secs(1));
    limiter.wait();
    c.bench_function("rate_limiter_delay_decision", |b| {
        b.iter(|| limiter.delay_for(black_box(Instant::now())))
    });
}

fn bench_refetch_backoff(c: &mut Criterion) {
    c.bench_function("refetch_backoff_schedule", |b| {
        b.iter(|| {
            for attempts in 1..=12i64 {
                black_box(refetch_backoff(black_box(attempts)));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_parse_start_time,
    bench_game_record_parse,
    bench_rate_limiter_delay,
    bench_refetch_backoff
);
criterion_main!(benches);
