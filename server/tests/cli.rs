use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::tempdir;

const UNREACHABLE_SERVER: &str = "http://127.0.0.1:1";

#[test]
fn arm_without_scheduler_fails_with_clear_error() {
    let dir = tempdir().expect("tempdir");

    let mut cmd = cargo_bin_cmd!("alarmclock");
    cmd.arg("--config")
        .arg(dir.path().join("alarmclock.json"))
        .arg("arm")
        .arg("07:30")
        .arg("--yes")
        .arg("--server")
        .arg(UNREACHABLE_SERVER)
        .assert()
        .failure()
        .stderr(predicate::str::contains("scheduler is not reachable"));
}

#[test]
fn invalid_alarm_time_is_rejected_before_contacting_scheduler() {
    let dir = tempdir().expect("tempdir");

    let mut cmd = cargo_bin_cmd!("alarmclock");
    cmd.arg("--config")
        .arg(dir.path().join("alarmclock.json"))
        .arg("arm")
        .arg("25:00")
        .arg("--server")
        .arg(UNREACHABLE_SERVER)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid alarm time"))
        .stderr(predicate::str::contains("did not answer").not());
}

#[test]
fn malformed_config_fails_with_clear_error() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("alarmclock.json");
    fs::write(&config, "{ not-valid-json ").expect("write invalid json");

    let mut cmd = cargo_bin_cmd!("alarmclock");
    cmd.arg("--config")
        .arg(config)
        .arg("state")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid JSON"));
}

#[test]
fn unsupported_config_version_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("alarmclock.json");
    fs::write(&config, r#"{ "version": 3 }"#).expect("write config");

    let mut cmd = cargo_bin_cmd!("alarmclock");
    cmd.arg("--config")
        .arg(config)
        .arg("cancel")
        .arg("--server")
        .arg(UNREACHABLE_SERVER)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported config version 3"));
}

#[test]
fn cancel_without_scheduler_reports_missing_link() {
    let dir = tempdir().expect("tempdir");

    let mut cmd = cargo_bin_cmd!("alarmclock");
    cmd.arg("--config")
        .arg(dir.path().join("alarmclock.json"))
        .arg("cancel")
        .arg("--server")
        .arg(UNREACHABLE_SERVER)
        .assert()
        .failure()
        .stderr(predicate::str::contains("scheduler is not reachable"));
}

#[test]
fn help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("alarmclock");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("arm"))
        .stdout(predicate::str::contains("watch"));
}
