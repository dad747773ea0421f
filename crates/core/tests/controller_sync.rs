use std::path::Path;
use std::sync::Arc;

use binsync_core::client::{Client, ClientOptions};
use binsync_core::config::{SyncLevel, SyncSettings};
use binsync_core::controller::{Controller, SyncControlStatus};
use binsync_core::decompiler::{DecompilerInterface, HeadlessDecompiler};
use binsync_core::error::SyncError;
use binsync_core::lifter::{IdentityLifter, RebaseLifter};
use binsync_core::model::{
    ArtifactId, ArtifactKind, ArtifactRecord, Comment, Enum, Function, FunctionHeader,
    GlobalVariable, StackVariable, Struct, StructMember,
};
use binsync_core::state::Stamp;
use tempfile::{tempdir, TempDir};

const HASH: &str = "deadbeef";

fn headless_settings() -> SyncSettings {
    SyncSettings { headless: true, ..SyncSettings::default() }
}

struct Session {
    controller: Controller,
    decompiler: Arc<HeadlessDecompiler>,
    client: Client,
}

fn session(options: ClientOptions) -> Session {
    let decompiler = Arc::new(HeadlessDecompiler::new(HASH));
    let controller = Controller::new(
        IdentityLifter,
        Arc::clone(&decompiler) as Arc<dyn DecompilerInterface>,
        headless_settings(),
    );
    let (client, _) = Client::connect(options.binary_hash(HASH)).expect("connect");
    controller.attach(client.clone());
    Session { controller, decompiler, client }
}

fn bare_remote() -> (TempDir, String) {
    let dir = tempdir().expect("tempdir");
    git2::Repository::init_bare(dir.path()).expect("bare remote");
    let url = dir.path().to_str().expect("utf8 path").to_string();
    (dir, url)
}

fn first_user(path: &Path, url: &str, name: &str) -> Session {
    session(ClientOptions::new(name, path).remote_url(url).init_repo(true))
}

fn next_user(path: &Path, url: &str, name: &str) -> Session {
    session(ClientOptions::new(name, path).remote_url(url))
}

#[test]
fn operations_require_a_connection() {
    let controller = Controller::new(
        IdentityLifter,
        Arc::new(HeadlessDecompiler::new(HASH)),
        headless_settings(),
    );
    assert_eq!(controller.status(), SyncControlStatus::Disconnected);
    assert_eq!(controller.status_string(), "Disconnected");
    assert!(matches!(controller.fill_all(None), Err(SyncError::NotConnected)));
    assert!(matches!(
        controller.pull_artifact(ArtifactKind::Function, &ArtifactId::Addr(0), None, None),
        Err(SyncError::NotConnected)
    ));
    assert!(matches!(controller.magic_fill(None), Err(SyncError::NotConnected)));
}

#[test]
fn push_then_pull_round_trips_through_the_lifter() {
    let dir = tempdir().expect("tempdir");
    let decompiler = Arc::new(HeadlessDecompiler::new(HASH));
    decompiler.insert_function(Function::new(0x40_1000, 0x30));
    let controller = Controller::new(
        RebaseLifter::new(0x40_0000, 0),
        Arc::clone(&decompiler) as Arc<dyn DecompilerInterface>,
        headless_settings(),
    );
    let (client, _) = Client::connect(
        ClientOptions::new("alice", dir.path()).binary_hash(HASH).init_repo(true),
    )
    .expect("connect");
    controller.attach(client.clone());
    assert_eq!(controller.status(), SyncControlStatus::ConnectedNoRemote);

    let mut master = client.master_state().expect("state");
    let header = FunctionHeader::named(0x40_1000, "parse").with_ret_type("int");
    assert!(controller
        .push_artifact(header.clone().into(), &mut master, None, Stamp::Now)
        .expect("push"));

    // Stored canonically, with the parent function sized by the decompiler.
    let stored = client.master_state().expect("state");
    let func = stored.get_function(0x1000).expect("canonical function");
    assert_eq!(func.size, 0x30);
    assert!(stored.get_function_header(0x1000).expect("header").last_change.get().is_some());
    assert_eq!(stored.metadata().last_push_kind, Some(ArtifactKind::FunctionHeader));

    let pulled = controller
        .pull_artifact(ArtifactKind::FunctionHeader, &ArtifactId::Addr(0x1000), None, None)
        .expect("pull");
    assert_eq!(pulled, Some(ArtifactRecord::FunctionHeader(header.clone())));

    // Pushing identical content is not a commit.
    assert!(!controller.push_artifact(header.into(), &mut master, None, Stamp::Now).expect("push"));

    // Missing artifacts and mismatched identifiers yield nothing.
    let missing = controller
        .pull_artifact(ArtifactKind::Struct, &ArtifactId::from("Nope"), None, None)
        .expect("pull");
    assert!(missing.is_none());
    let mismatched = controller
        .pull_artifact(ArtifactKind::Struct, &ArtifactId::Addr(0x1000), None, None)
        .expect("pull");
    assert!(mismatched.is_none());
}

#[test]
fn struct_fill_declares_before_laying_out() {
    let (_remote, url) = bare_remote();
    let a_dir = tempdir().expect("tempdir");
    let alice = first_user(a_dir.path(), &url, "alice");

    let node = Struct::new("Node", 16)
        .with_member(StructMember::new(0, "next", "Node*", 8))
        .with_member(StructMember::new(8, "value", "long", 8));
    let mut state = alice.client.master_state().expect("state");
    alice.controller.push_artifact(node.clone().into(), &mut state, None, Stamp::Now).expect("push");
    alice.client.update("Auto update").expect("update");

    let b_dir = tempdir().expect("tempdir");
    let bob = next_user(b_dir.path(), &url, "bob");
    assert!(bob.controller.fill_structs(Some("alice"), None).expect("fill"));

    assert_eq!(bob.decompiler.struct_by_name("Node"), Some(node.clone()));
    let bob_master = bob.client.master_state().expect("state");
    assert_eq!(bob_master.get_struct("Node").expect("recorded"), &node);

    // Now in sync: nothing left to do.
    assert!(!bob.controller.fill_structs(Some("alice"), None).expect("fill"));
}

#[test]
fn filling_a_function_brings_its_comments_and_is_guarded() {
    let (_remote, url) = bare_remote();
    let a_dir = tempdir().expect("tempdir");
    let alice = first_user(a_dir.path(), &url, "alice");
    alice.decompiler.insert_function(Function::new(0x1000, 0x40));

    let mut state = alice.client.master_state().expect("state");
    let ctl = &alice.controller;
    ctl.push_artifact(FunctionHeader::named(0x1000, "parse").into(), &mut state, None, Stamp::Now)
        .expect("push header");
    ctl.push_artifact(
        StackVariable::new(0x1000, -8, "i", "int", 4).into(),
        &mut state,
        None,
        Stamp::Now,
    )
    .expect("push stack var");
    ctl.push_artifact(
        Comment::new(0x1010, "bounds check").in_function(0x1000).into(),
        &mut state,
        None,
        Stamp::Now,
    )
    .expect("push comment");
    alice.client.update("Auto update").expect("update");

    let b_dir = tempdir().expect("tempdir");
    let bob = next_user(b_dir.path(), &url, "bob");
    assert!(bob.controller.fill_function(0x1000, Some("alice"), None).expect("fill"));

    let filled = bob.decompiler.function(0x1000).expect("function applied");
    assert_eq!(filled.name(), Some("parse"));
    assert_eq!(filled.stack_vars[&-8].name.as_deref(), Some("i"));
    assert_eq!(bob.decompiler.comments()[&0x1010].comment, "bounds check");

    let bob_master = bob.client.master_state().expect("state");
    assert!(bob_master.get_function(0x1000).is_ok());
    assert!(bob_master.get_comment(0x1010).is_ok());

    let before = bob_master.commit().map(str::to_string);
    assert!(!bob.controller.fill_function(0x1000, Some("alice"), None).expect("second fill"));
    let after = bob.client.master_state().expect("state");
    assert_eq!(after.commit().map(str::to_string), before, "guarded fill must not commit");
    // Unknown users and missing functions are "no changes", not errors.
    assert!(!bob.controller.fill_function(0x9999, Some("alice"), None).expect("missing"));
    assert!(!bob.controller.fill_all(Some("ghost")).expect("ghost"));
}

#[test]
fn sync_level_decides_who_wins_a_conflict() {
    let (_remote, url) = bare_remote();
    let a_dir = tempdir().expect("tempdir");
    let alice = first_user(a_dir.path(), &url, "alice");
    let mut state = alice.client.master_state().expect("state");
    let theirs = GlobalVariable::new(0x4000, "g_alice").with_type("int", 4);
    alice.controller.push_artifact(theirs.into(), &mut state, None, Stamp::Now).expect("push");
    alice.client.update("Auto update").expect("update");

    let b_dir = tempdir().expect("tempdir");
    let bob = next_user(b_dir.path(), &url, "bob");
    let mut bob_state = bob.client.master_state().expect("state");
    let mine = GlobalVariable::new(0x4000, "g_bob");
    bob.controller.push_artifact(mine.into(), &mut bob_state, None, Stamp::Now).expect("push");

    assert_eq!(bob.controller.sync_level(), SyncLevel::NonConflicting);
    bob.controller.fill_global_var(0x4000, Some("alice"), None).expect("fill");
    let applied = bob.decompiler.global_var(0x4000).expect("applied");
    assert_eq!(applied.name.as_deref(), Some("g_bob"));
    assert_eq!(applied.type_str.as_deref(), Some("int"));

    bob.controller.set_sync_level(SyncLevel::Overwrite);
    bob.controller.fill_global_var(0x4000, Some("alice"), None).expect("fill");
    let applied = bob.decompiler.global_var(0x4000).expect("applied");
    assert_eq!(applied.name.as_deref(), Some("g_alice"));
}

#[test]
fn magic_fill_merges_every_users_view() {
    let (_remote, url) = bare_remote();
    let a_dir = tempdir().expect("tempdir");
    let alice = first_user(a_dir.path(), &url, "alice");
    alice.client.update("User created").expect("create alice");

    let b_dir = tempdir().expect("tempdir");
    let bob = next_user(b_dir.path(), &url, "bob");

    let mut state = alice.client.master_state().expect("state");
    alice
        .controller
        .push_artifact(FunctionHeader::named(0x1000, "parse").into(), &mut state, None, Stamp::Now)
        .expect("push");
    alice
        .controller
        .push_artifact(Enum::new("Color", [("RED", 0)]).into(), &mut state, None, Stamp::Now)
        .expect("push");
    alice.client.update("Auto update").expect("update");

    let mut state = bob.client.master_state().expect("state");
    bob.controller
        .push_artifact(
            FunctionHeader::new(0x1000).with_ret_type("int").into(),
            &mut state,
            None,
            Stamp::Now,
        )
        .expect("push");
    bob.controller
        .push_artifact(Enum::new("Color", [("BLUE", 2)]).into(), &mut state, None, Stamp::Now)
        .expect("push");
    bob.client.update("Auto update").expect("update");

    assert!(alice.client.sync_states().expect("fetch"));
    let changed = alice.controller.changed_artifacts_of_type(ArtifactKind::Function).expect("ids");
    assert!(changed.contains(&ArtifactId::Addr(0x1000)));

    assert!(alice.controller.magic_fill(None).expect("magic fill"));

    let merged = alice.client.master_state().expect("state");
    let header = merged.get_function_header(0x1000).expect("header");
    assert_eq!(header.name.as_deref(), Some("parse"));
    assert_eq!(header.ret_type.as_deref(), Some("int"));
    assert_eq!(merged.get_enum("Color").expect("enum").members.len(), 2);

    let applied = alice.decompiler.function(0x1000).expect("applied");
    let applied = applied.header.expect("header applied");
    assert_eq!(applied.ret_type.as_deref(), Some("int"));
    assert_eq!(alice.decompiler.enum_by_name("Color").expect("enum").members.len(), 2);
}

#[test]
fn force_push_takes_the_decompilers_view() {
    let dir = tempdir().expect("tempdir");
    let s = session(ClientOptions::new("alice", dir.path()).init_repo(true));
    s.decompiler.insert_function(
        Function::new(0x1000, 0x20).with_header(FunctionHeader::named(0x1000, "main")),
    );
    s.decompiler.insert_struct(Struct::new("Point", 8));
    s.decompiler.insert_global_var(GlobalVariable::new(0x4000, "g_ready"));

    assert!(s.controller.force_push_function(0x1000).expect("force push"));
    assert!(!s.controller.force_push_function(0x2000).expect("absent"));
    assert!(s.controller.force_push_global_artifact(&ArtifactId::from("Point")).expect("struct"));
    assert!(s.controller.force_push_global_artifact(&ArtifactId::Addr(0x4000)).expect("gvar"));
    assert!(!s.controller.force_push_global_artifact(&ArtifactId::from("Nope")).expect("absent"));
    assert_eq!(s.controller.global_artifacts().len(), 2);

    let state = s.client.master_state().expect("state");
    assert_eq!(state.get_function(0x1000).expect("function").name(), Some("main"));
    assert!(state.get_struct("Point").is_ok());
    assert!(state.get_global_var(0x4000).is_ok());
}

#[test]
fn pushing_through_an_older_copy_keeps_newer_commits() {
    let dir = tempdir().expect("tempdir");
    let s = session(ClientOptions::new("alice", dir.path()).init_repo(true));
    s.decompiler.insert_function(Function::new(0x1000, 0x20));
    s.decompiler.insert_global_var(GlobalVariable::new(0x4000, "g_ready"));

    let mut seed = s.client.master_state().expect("state");
    s.controller
        .push_artifact(Comment::new(0x1004, "old note").into(), &mut seed, None, Stamp::Now)
        .expect("seed");

    // A view taken now, then something else commits behind its back.
    let mut ui_copy = s.client.master_state().expect("state");
    assert!(s.controller.force_push_global_artifact(&ArtifactId::Addr(0x4000)).expect("gvar"));

    let header = FunctionHeader::named(0x1000, "main");
    assert!(s.controller.push_artifact(header.into(), &mut ui_copy, None, Stamp::Now).expect("push"));

    let state = s.client.master_state().expect("state");
    assert!(state.get_global_var(0x4000).is_ok(), "concurrent commit was lost");
    assert_eq!(state.get_function_header(0x1000).expect("header").name.as_deref(), Some("main"));
    assert_eq!(state.get_comment(0x1004).expect("comment").comment, "old note");
    assert_eq!(ui_copy, state);
    assert_eq!(state.version(), 3);
}

#[test]
fn renames_in_an_older_copy_still_apply() {
    let dir = tempdir().expect("tempdir");
    let s = session(ClientOptions::new("alice", dir.path()).init_repo(true));
    s.decompiler.insert_global_var(GlobalVariable::new(0x4000, "g_ready"));

    let mut seed = s.client.master_state().expect("state");
    seed.set_struct(Struct::new("node_t", 16), None, Stamp::Now);
    seed.set_struct(Struct::new("Point", 8), None, Stamp::Now);
    assert!(s.client.commit_state(&mut seed, "seed").expect("seed"));

    let mut ui_copy = s.client.master_state().expect("state");
    assert!(s.controller.force_push_global_artifact(&ArtifactId::Addr(0x4000)).expect("gvar"));

    assert!(ui_copy.set_struct(Struct::new("Node", 16), Some("node_t"), Stamp::Now));
    assert!(s.client.commit_state(&mut ui_copy, "rename node_t").expect("commit"));

    let state = s.client.master_state().expect("state");
    assert!(state.get_struct("node_t").is_err());
    assert!(state.get_struct("Node").is_ok());
    assert!(state.get_struct("Point").is_ok());
    assert!(state.get_global_var(0x4000).is_ok());
}

#[test]
fn queued_commands_run_one_per_tick() {
    let dir = tempdir().expect("tempdir");
    let s = session(ClientOptions::new("alice", dir.path()).init_repo(true));
    s.decompiler.insert_global_var(GlobalVariable::new(0x4000, "g_ready"));

    s.controller.make_controller_cmd(|ctl| {
        ctl.force_push_global_artifact(&ArtifactId::Addr(0x4000)).expect("force push");
    });
    s.controller.make_controller_cmd(|ctl| {
        ctl.force_push_global_artifact(&ArtifactId::Addr(0x4000)).expect("force push");
    });
    assert_eq!(s.controller.pending_commands(), 2);

    s.controller.tick();
    assert_eq!(s.controller.pending_commands(), 1);
    s.controller.tick();
    assert_eq!(s.controller.pending_commands(), 0);
    assert!(s.client.master_state().expect("state").get_global_var(0x4000).is_ok());
}

#[test]
fn context_changes_notify_once_per_function() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let dir = tempdir().expect("tempdir");
    let decompiler = Arc::new(HeadlessDecompiler::new(HASH));
    decompiler.insert_function(Function::new(0x1000, 0x10));
    decompiler.insert_function(Function::new(0x2000, 0x10));
    let controller = Controller::new(
        IdentityLifter,
        Arc::clone(&decompiler) as Arc<dyn DecompilerInterface>,
        SyncSettings::default(),
    );
    let (client, _) = Client::connect(
        ClientOptions::new("alice", dir.path()).binary_hash(HASH).init_repo(true),
    )
    .expect("connect");
    controller.attach(client);

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    controller.set_ctx_change_callback(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    decompiler.goto_address(0x1004);
    controller.tick();
    controller.tick();
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    decompiler.goto_address(0x2008);
    controller.tick();
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    assert!(controller.toggle_headless());
    decompiler.goto_address(0x1000);
    controller.tick();
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}
