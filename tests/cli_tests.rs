// Command-line checks against the shipped definitions and ad-hoc files.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const BROKEN: &str = r#"
entity_type = "REVIEW"

[[states]]
code = "DRAFT"
label = "Draft"
is_initial = true

[[states]]
code = "ORPHAN"
label = "Never reached"
is_terminal = true
"#;

#[test]
fn test_validate_accepts_shipped_definitions() {
    let mut cmd = Command::cargo_bin("review-workflow").unwrap();
    cmd.args(["validate", "definitions"])
        .assert()
        .success()
        .stdout(predicate::str::contains("REVIEW"))
        .stdout(predicate::str::contains("FINDING"))
        .stdout(predicate::str::contains("CAP"))
        .stdout(predicate::str::contains("All 3 definitions are valid"));
}

#[test]
fn test_validate_reports_unreachable_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, BROKEN).unwrap();

    let mut cmd = Command::cargo_bin("review-workflow").unwrap();
    cmd.arg("validate")
        .arg(&path)
        .assert()
        .failure()
        .stdout(predicate::str::contains("❌"))
        .stdout(predicate::str::contains("ORPHAN"));
}

#[test]
fn test_describe_lists_states_and_transitions() {
    let mut cmd = Command::cargo_bin("review-workflow").unwrap();
    cmd.args(["describe", "definitions/review.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("SUBMITTED"))
        .stdout(predicate::str::contains("SLA 5d"))
        .stdout(predicate::str::contains("submit"))
        .stdout(predicate::str::contains("coi_clearance"));
}

#[test]
fn test_single_sweep_with_no_clocks() {
    let dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("review-workflow").unwrap();
    cmd.arg("--config")
        .arg(dir.path().join("missing.toml"))
        .args(["sweep", "--once", "--definitions", "definitions"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Sweep evaluated 0 clocks"));
}

#[test]
fn test_help_lists_commands() {
    let mut cmd = Command::cargo_bin("review-workflow").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("describe"))
        .stdout(predicate::str::contains("sweep"));
}
