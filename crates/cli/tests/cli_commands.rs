use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

/// Every invocation gets its own HOME so the global config stays isolated.
fn binsync(home: &Path) -> Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("binsync");
    cmd.env("HOME", home).env_remove("RUST_LOG");
    cmd
}

fn init(home: &Path, repo: &Path, user: &str) {
    binsync(home)
        .arg("init")
        .arg("--repo")
        .arg(repo)
        .arg("--user")
        .arg(user)
        .arg("--hash")
        .arg("deadbeef")
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized sync repository"));
}

#[test]
fn missing_subcommand_is_an_error() {
    let home = tempdir().expect("tempdir");
    binsync(home.path()).assert().failure();
}

#[test]
fn init_publishes_the_user() {
    let home = tempdir().expect("tempdir");
    let repo = tempdir().expect("tempdir");
    init(home.path(), repo.path(), "alice");

    binsync(home.path())
        .arg("users")
        .arg("--repo")
        .arg(repo.path())
        .arg("--user")
        .arg("alice")
        .assert()
        .success()
        .stdout(predicate::str::contains("Users (1):"))
        .stdout(predicate::str::contains("- alice"));
}

#[test]
fn init_twice_fails() {
    let home = tempdir().expect("tempdir");
    let repo = tempdir().expect("tempdir");
    init(home.path(), repo.path(), "alice");

    binsync(home.path())
        .arg("init")
        .arg("--repo")
        .arg(repo.path())
        .arg("--user")
        .arg("alice")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to initialize sync repository"));
}

#[test]
fn init_with_binary_writes_project_config() {
    let home = tempdir().expect("tempdir");
    let repo = tempdir().expect("tempdir");
    let bins = tempdir().expect("tempdir");
    let binary = bins.path().join("fauxware");
    std::fs::write(&binary, b"\x7fELF fake binary").expect("write binary");

    binsync(home.path())
        .arg("init")
        .arg("--repo")
        .arg(repo.path())
        .arg("--user")
        .arg("alice")
        .arg("--binary")
        .arg(&binary)
        .assert()
        .success()
        .stdout(predicate::str::contains("Binary hash:"));

    let config = bins.path().join(".fauxware.bsconf");
    let contents = std::fs::read_to_string(&config).expect("project config");
    assert!(contents.contains("\"user\": \"alice\""), "{contents}");
}

#[test]
fn later_commands_fall_back_to_the_last_session() {
    let home = tempdir().expect("tempdir");
    let repo = tempdir().expect("tempdir");
    init(home.path(), repo.path(), "alice");

    binsync(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("User: alice"))
        .stdout(predicate::str::contains("Remote: (none)"));
}

#[test]
fn commands_without_a_session_fail() {
    let home = tempdir().expect("tempdir");
    binsync(home.path())
        .arg("users")
        .assert()
        .failure()
        .stderr(predicate::str::contains("pass --repo"));
}

#[test]
fn status_and_state_render_as_json_and_yaml() {
    let home = tempdir().expect("tempdir");
    let repo = tempdir().expect("tempdir");
    init(home.path(), repo.path(), "alice");

    binsync(home.path())
        .args(["status", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"has_remote\": false"));

    binsync(home.path())
        .args(["show-state", "--format", "yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("user: alice"));

    binsync(home.path())
        .args(["show-state", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"version\": 1"));
}

#[test]
fn show_state_of_unknown_user_fails() {
    let home = tempdir().expect("tempdir");
    let repo = tempdir().expect("tempdir");
    init(home.path(), repo.path(), "alice");

    binsync(home.path())
        .args(["show-state", "--of", "mallory"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("mallory"));
}

#[test]
fn sync_rejects_unknown_users() {
    let home = tempdir().expect("tempdir");
    let repo = tempdir().expect("tempdir");
    init(home.path(), repo.path(), "alice");

    binsync(home.path())
        .args(["sync", "--from", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown user 'ghost'"));
}
