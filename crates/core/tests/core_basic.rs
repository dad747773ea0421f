use binsync_core::{version, DecompilerInterface, HeadlessDecompiler, SyncLevel, SyncSettings};

#[test]
fn version_is_non_empty() {
    assert!(!version().is_empty());
}

#[test]
fn headless_session_hashes_its_binary() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("fauxware");
    std::fs::write(&path, b"abc").expect("write binary");

    let dec = HeadlessDecompiler::for_binary(&path).expect("hash binary");
    assert_eq!(
        dec.binary_hash(),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(dec.binary_path().as_deref(), Some(path.as_path()));
}

#[test]
fn default_settings_sync_without_conflicts() {
    let settings = SyncSettings::default();
    assert_eq!(settings.sync_level, SyncLevel::NonConflicting);
    assert!(!settings.headless);
    assert!(settings.cooldown < settings.reload_interval);
}
