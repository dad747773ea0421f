use std::fs;

use binsync::{canonicalize_or_current, render, resolve_session, OutputFormat};
use binsync_core::client::User;
use tempfile::tempdir;

#[test]
fn canonicalize_or_current_resolves_existing_paths() {
    let tmp = tempdir().expect("tempdir");
    let nested = tmp.path().join("nested");
    fs::create_dir_all(&nested).expect("create nested");

    let result = canonicalize_or_current(nested.to_str().expect("utf8")).expect("canonicalize");
    assert_eq!(result, nested.canonicalize().expect("canonicalize nested"));
}

#[test]
fn canonicalize_or_current_keeps_missing_paths() {
    let tmp = tempdir().expect("tempdir");
    let missing = tmp.path().join("not-yet");
    let result = canonicalize_or_current(missing.to_str().expect("utf8")).expect("resolve");
    assert!(result.ends_with("not-yet"));
}

#[test]
fn explicit_session_arguments_win() {
    let tmp = tempdir().expect("tempdir");
    let session =
        resolve_session(Some(tmp.path().to_str().expect("utf8")), Some("alice")).expect("session");
    assert_eq!(session.user, "alice");
    assert_eq!(session.repo, tmp.path().canonicalize().expect("canonicalize"));
}

#[test]
fn render_supports_json_and_yaml() {
    let users = vec![User { name: "alice".to_string(), last_commit_time: Some(1_700_000_000) }];
    let json = render(&users, OutputFormat::Json).expect("json");
    assert!(json.contains("\"name\": \"alice\""), "{json}");
    let yaml = render(&users, OutputFormat::Yaml).expect("yaml");
    assert!(yaml.contains("name: alice"), "{yaml}");
}
