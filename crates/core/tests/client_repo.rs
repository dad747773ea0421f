use std::path::Path;

use binsync_core::client::{Client, ClientOptions};
use binsync_core::error::SyncError;
use binsync_core::model::{ArtifactKind, Function, FunctionHeader, GlobalVariable};
use binsync_core::scheduler::SchedSpeed;
use binsync_core::state::Stamp;
use tempfile::tempdir;

fn init(path: &Path, user: &str) -> Client {
    let options = ClientOptions::new(user, path).binary_hash("deadbeef").init_repo(true);
    let (client, warnings) = Client::connect(options).expect("connect");
    assert!(warnings.is_empty(), "{warnings:?}");
    client
}

#[test]
fn fresh_repository_has_no_users() {
    let dir = tempdir().expect("tempdir");
    let client = init(dir.path(), "alice");

    assert!(client.users(SchedSpeed::Fast).expect("users").is_empty());
    let state = client.master_state().expect("master state");
    assert!(state.is_empty());
    assert_eq!(state.user(), "alice");
    assert!(!client.has_remote());
}

#[test]
fn committing_changes_records_a_user() {
    let dir = tempdir().expect("tempdir");
    let client = init(dir.path(), "alice");

    let mut state = client.master_state().expect("master state");
    state.set_function_header(FunctionHeader::named(0x1000, "parse"), Stamp::Now);
    assert!(client.commit_state(&mut state, "name parse").expect("commit"));
    assert_eq!(state.version(), 1);
    assert!(state.commit().is_some());
    assert!(!state.is_dirty());

    // Same content again is not a new commit.
    assert!(!client.commit_state(&mut state, "again").expect("commit"));

    let users = client.users(SchedSpeed::Fast).expect("users");
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].name, "alice");
    assert!(users[0].last_commit_time.is_some());

    let reloaded = client.get_state(Some("alice"), None, SchedSpeed::Fast, true).expect("reload");
    assert_eq!(reloaded.get_function_header(0x1000).expect("header").name.as_deref(), Some("parse"));
}

#[test]
fn pinned_versions_read_older_commits() {
    let dir = tempdir().expect("tempdir");
    let client = init(dir.path(), "alice");

    let mut state = client.master_state().expect("master state");
    state.set_global_var(GlobalVariable::new(0x4000, "g_first"), Stamp::Now);
    client.commit_state(&mut state, "first").expect("commit");
    let first = state.commit().expect("commit id").to_string();

    state.set_global_var(GlobalVariable::new(0x4000, "g_second"), Stamp::Now);
    client.commit_state(&mut state, "second").expect("commit");

    let old = client.get_state(None, Some(&first), SchedSpeed::Fast, false).expect("old state");
    assert_eq!(old.get_global_var(0x4000).expect("gvar").name.as_deref(), Some("g_first"));
    let current = client.master_state().expect("current");
    assert_eq!(current.get_global_var(0x4000).expect("gvar").name.as_deref(), Some("g_second"));
}

#[test]
fn staged_state_is_committed_by_update() {
    let dir = tempdir().expect("tempdir");
    let client = init(dir.path(), "alice");

    let mut state = client.master_state().expect("master state");
    state.set_function(Function::new(0x2000, 0x10), Stamp::Now);
    client.put_state(state).expect("stage");

    // Staged state is visible before it is committed.
    assert!(client.master_state().expect("staged").get_function(0x2000).is_ok());
    assert!(client.users(SchedSpeed::Fast).expect("users").is_empty());

    client.update("Auto update").expect("update");
    assert_eq!(client.users(SchedSpeed::Fast).expect("users").len(), 1);
}

#[test]
fn first_update_publishes_an_empty_state() {
    let dir = tempdir().expect("tempdir");
    let client = init(dir.path(), "alice");
    client.update("User created").expect("update");

    let users = client.users(SchedSpeed::Fast).expect("users");
    assert_eq!(users.len(), 1);
    assert!(client.master_state().expect("state").is_empty());
}

#[test]
fn unknown_users_and_foreign_states_are_rejected() {
    let dir = tempdir().expect("tempdir");
    let client = init(dir.path(), "alice");

    let err = client.get_state(Some("mallory"), None, SchedSpeed::Fast, false).unwrap_err();
    assert!(matches!(err, SyncError::UnknownUser(ref u) if u == "mallory"), "{err}");

    let mut foreign = binsync_core::state::State::new("bob");
    foreign.set_function(Function::new(0x1000, 4), Stamp::Now);
    let err = client.commit_state(&mut foreign, "nope").unwrap_err();
    assert!(matches!(err, SyncError::ForeignState { .. }), "{err}");
}

#[test]
fn bad_usernames_are_rejected() {
    let dir = tempdir().expect("tempdir");
    let options = ClientOptions::new("bad name", dir.path()).init_repo(true);
    let err = Client::connect(options).unwrap_err();
    assert!(matches!(err, SyncError::BadUsername(_)), "{err}");
}

#[test]
fn repository_is_locked_while_connected() {
    let dir = tempdir().expect("tempdir");
    let client = init(dir.path(), "alice");

    let err = Client::connect(ClientOptions::new("bob", dir.path())).unwrap_err();
    assert!(matches!(err, SyncError::Lock(_)), "{err}");

    client.shutdown();
    drop(client);
    let (reopened, _) = Client::connect(ClientOptions::new("bob", dir.path())).expect("reopen");
    assert_eq!(reopened.master_user(), "bob");
}

#[test]
fn init_twice_fails_and_hash_mismatch_warns() {
    let dir = tempdir().expect("tempdir");
    drop(init(dir.path(), "alice"));

    let again = ClientOptions::new("alice", dir.path()).init_repo(true);
    assert!(matches!(Client::connect(again).unwrap_err(), SyncError::RepositoryExists(_)));

    let other = ClientOptions::new("alice", dir.path()).binary_hash("cafebabe");
    let (_client, warnings) = Client::connect(other).expect("connect");
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("deadbeef"), "{warnings:?}");
}

#[test]
fn clones_see_pushed_users() {
    let remote_dir = tempdir().expect("tempdir");
    git2::Repository::init_bare(remote_dir.path()).expect("bare remote");
    let url = remote_dir.path().to_str().expect("utf8 path").to_string();

    let a_dir = tempdir().expect("tempdir");
    let alice = Client::connect(
        ClientOptions::new("alice", a_dir.path())
            .binary_hash("deadbeef")
            .remote_url(url.clone())
            .init_repo(true),
    )
    .expect("init alice")
    .0;
    assert!(alice.has_remote());
    let mut state = alice.master_state().expect("state");
    state.set_function_header(FunctionHeader::named(0x1000, "main"), Stamp::Now);
    alice.commit_state(&mut state, "name main").expect("commit");
    assert!(alice.push().expect("push"));

    let b_dir = tempdir().expect("tempdir");
    let (bob, warnings) = Client::connect(
        ClientOptions::new("bob", b_dir.path()).binary_hash("deadbeef").remote_url(url),
    )
    .expect("clone bob");
    assert!(warnings.is_empty(), "{warnings:?}");

    let names: Vec<String> =
        bob.users(SchedSpeed::Fast).expect("users").into_iter().map(|u| u.name).collect();
    assert_eq!(names, ["alice"]);
    let alice_state = bob.get_state(Some("alice"), None, SchedSpeed::Fast, false).expect("state");
    assert!(alice_state.get_function_header(0x1000).is_ok());

    let tally = bob.tally(None).expect("tally");
    assert_eq!(tally["alice"][&ArtifactKind::FunctionHeader].len(), 1);
}

#[test]
fn unreachable_remote_degrades_to_local_commits() {
    let dir = tempdir().expect("tempdir");
    let gone = tempdir().expect("tempdir");
    let url = gone.path().join("missing.git").to_str().expect("utf8 path").to_string();
    let client = Client::connect(
        ClientOptions::new("alice", dir.path())
            .binary_hash("deadbeef")
            .remote_url(url)
            .init_repo(true),
    )
    .expect("init")
    .0;
    assert!(client.status().active_remote);

    let mut state = client.master_state().expect("state");
    state.set_global_var(GlobalVariable::new(0x4000, "g_offline"), Stamp::Now);
    client.put_state(state).expect("stage");
    client.update("offline").expect("update still succeeds");

    let status = client.status();
    assert!(status.has_remote);
    assert!(!status.active_remote);
    assert!(status.last_pull_attempt.is_some());
    assert!(status.last_pull.is_none());
    assert!(status.last_push.is_none());
    assert!(status.last_commit.is_some());

    let committed = client.get_state(Some("alice"), None, SchedSpeed::Fast, true).expect("reload");
    assert!(committed.get_global_var(0x4000).is_ok());
    assert!(!client.sync_states().expect("retry"));
}
