mod support;

use std::fs::File;
use std::path::Path;

use parquet::file::reader::{FileReader, SerializedFileReader};

use er_stats::parquet_export::ParquetExporter;

use support::make_game;

fn part_files(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .expect("partition dir")
        .map(|entry| entry.expect("dir entry").path())
        .collect();
    files.sort();
    files
}

fn num_rows(path: &Path) -> i64 {
    let reader = SerializedFileReader::new(File::open(path).expect("open part file"))
        .expect("parquet reader");
    reader.metadata().file_metadata().num_rows()
}

#[test]
fn buffers_flush_at_threshold_and_on_close() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut exporter = ParquetExporter::new(dir.path())
        .expect("exporter")
        .with_flush_rows(2);

    exporter.write_game(&make_game(1, "a"), "uid-1").expect("write");
    exporter.write_game(&make_game(2, "b"), "uid-2").expect("write");
    exporter.write_game(&make_game(3, "c"), "uid-3").expect("write");

    let partition = dir
        .path()
        .join("participants/season_id=25/server_name=NA/matching_mode=3/date=2025-10-27");
    let after_threshold = part_files(&partition);
    assert_eq!(after_threshold.len(), 1, "threshold flush writes one part file");
    assert_eq!(num_rows(&after_threshold[0]), 2);

    exporter.close().expect("close");
    let after_close = part_files(&partition);
    assert_eq!(after_close.len(), 2, "close flushes the remainder");
    assert_eq!(num_rows(&after_close[1]), 1);

    let match_partition = dir
        .path()
        .join("matches/season_id=25/server_name=NA/matching_mode=3/date=2025-10-27");
    let match_files = part_files(&match_partition);
    let total: i64 = match_files.iter().map(|path| num_rows(path)).sum();
    assert_eq!(total, 3, "one match row per game id");
}

#[test]
fn duplicate_submissions_are_dropped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut exporter = ParquetExporter::new(dir.path()).expect("exporter");

    let game = make_game(7, "a");
    exporter.write_game(&game, "uid-1").expect("write");
    exporter.write_game(&game, "uid-1").expect("duplicate write");
    exporter.write_game(&game, "uid-2").expect("second participant");
    exporter.close().expect("close");

    let participants = dir
        .path()
        .join("participants/season_id=25/server_name=NA/matching_mode=3/date=2025-10-27");
    let participant_total: i64 = part_files(&participants).iter().map(|p| num_rows(p)).sum();
    assert_eq!(participant_total, 2, "one row per (game, uid)");

    let matches = dir
        .path()
        .join("matches/season_id=25/server_name=NA/matching_mode=3/date=2025-10-27");
    let match_total: i64 = part_files(&matches).iter().map(|p| num_rows(p)).sum();
    assert_eq!(match_total, 1, "one row per game id");
}

#[test]
fn records_without_a_game_id_are_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut exporter = ParquetExporter::new(dir.path()).expect("exporter");

    let mut game = make_game(1, "a");
    game.game_id = None;
    exporter.write_game(&game, "uid-1").expect("write");
    exporter.close().expect("close");

    let participants = dir.path().join("participants");
    let empty = std::fs::read_dir(&participants)
        .expect("participants root")
        .next()
        .is_none();
    assert!(empty, "no partitions for an id-less record");
}
