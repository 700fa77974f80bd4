//! Black-box checks of the command surface and exit codes.

use assert_cmd::Command;
use predicates::prelude::*;

fn pubdatahub(home: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("pubdatahub").expect("binary built");
    cmd.env("PDH_HOME", home.path());
    cmd
}

#[test]
fn help_lists_top_level_commands() {
    let home = tempfile::tempdir().expect("tempdir");
    pubdatahub(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("config")
                .and(predicate::str::contains("sources"))
                .and(predicate::str::contains("download"))
                .and(predicate::str::contains("query"))
                .and(predicate::str::contains("jobs"))
                .and(predicate::str::contains("serve")),
        );
}

#[test]
fn config_validate_succeeds_on_defaults() {
    let home = tempfile::tempdir().expect("tempdir");
    pubdatahub(&home)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("valid"));
}

#[test]
fn config_show_prints_storage_root() {
    let home = tempfile::tempdir().expect("tempdir");
    pubdatahub(&home)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("storage_root"));
}

#[test]
fn config_set_storage_persists() {
    let home = tempfile::tempdir().expect("tempdir");
    let storage = home.path().join("elsewhere");
    pubdatahub(&home)
        .args(["config", "set-storage"])
        .arg(&storage)
        .assert()
        .success();
    pubdatahub(&home)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("elsewhere"));
}

#[test]
fn sources_list_includes_hackernews() {
    let home = tempfile::tempdir().expect("tempdir");
    pubdatahub(&home)
        .args(["sources", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hackernews"));
}

#[test]
fn unknown_source_fails_with_exit_code_one() {
    let home = tempfile::tempdir().expect("tempdir");
    pubdatahub(&home)
        .args(["sources", "status", "nope"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no such source"));
}

#[test]
fn query_runs_against_initialized_storage() {
    let home = tempfile::tempdir().expect("tempdir");
    // First touch initializes the schema; then count the empty table.
    pubdatahub(&home)
        .args(["query", "hackernews", "SELECT COUNT(*) AS n FROM items"])
        .assert()
        .success()
        .stdout(predicate::str::contains("n").and(predicate::str::contains("0")));
}

#[test]
fn query_rejects_unknown_output_format() {
    let home = tempfile::tempdir().expect("tempdir");
    pubdatahub(&home)
        .args([
            "query",
            "hackernews",
            "SELECT 1",
            "--output",
            "parquet",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown output format"));
}

#[test]
fn jobs_list_without_server_reads_persisted_state() {
    let home = tempfile::tempdir().expect("tempdir");
    // Unlikely port so the fallback path is deterministic.
    let mut cmd = pubdatahub(&home);
    cmd.env("PORT", "59999");
    cmd.args(["jobs", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no jobs"));
}

#[test]
fn unknown_subcommand_fails() {
    let home = tempfile::tempdir().expect("tempdir");
    pubdatahub(&home).arg("frobnicate").assert().failure();
}
