use assert_cmd::Command;
use fsub_gate::storage::{Options, SqliteStore, Storage};
use predicates::prelude::*;

#[test]
fn prints_version() {
    Command::cargo_bin("fsub-gate")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn prints_help() {
    Command::cargo_bin("fsub-gate")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("fsub-gate").and(predicate::str::contains("--skip-stats")));
}

#[test]
fn skip_stats_reads_empty_memory_store() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("fsub-gate")
        .unwrap()
        .args(["--skip-stats", "5"])
        .env("FSUB_STORAGE__BACKEND", "memory")
        .env("XDG_CONFIG_HOME", dir.path())
        .env("HOME", dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("No skips recorded yet."));
}

#[test]
fn skip_stats_ranks_sqlite_counters() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state.db");
    let store = SqliteStore::open(Options {
        path: Some(db.clone()),
    })
    .unwrap();
    store.increment_skip("@slow", 1).unwrap();
    store.increment_skip("@popular", 5).unwrap();
    store.increment_skip("-100777", 2).unwrap();
    store.close().unwrap();

    let output = Command::cargo_bin("fsub-gate")
        .unwrap()
        .args(["--skip-stats", "2"])
        .env("FSUB_STORAGE__BACKEND", "sqlite")
        .env("FSUB_STORAGE__SQLITE_PATH", &db)
        .env("XDG_CONFIG_HOME", dir.path())
        .env("HOME", dir.path())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let stdout = String::from_utf8(output).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("  1. @popular"));
    assert!(lines[0].ends_with(" 5"));
    assert!(lines[1].starts_with("  2. -100777"));
    assert!(lines[1].ends_with(" 2"));
    assert!(!stdout.contains("@slow"));
}
