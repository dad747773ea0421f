//! Persistent settings for a sync session.
//!
//! - `ProjectConfig`: per-binary settings stored next to the binary as
//!   `.<binary name>.bsconf` (pretty JSON).
//! - `GlobalConfig`: per-machine settings at `$HOME/.global.bsconf`.
//! - `SyncSettings`: runtime knobs for the controller, derived from the
//!   project config.

use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::client::DEFAULT_REMOTE;

pub const CONFIG_EXTENSION: &str = "bsconf";
pub const GLOBAL_CONFIG_NAME: &str = ".global.bsconf";

/// How a pulled function is reconciled with the master copy before it is
/// applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncLevel {
    /// Take the other user's artifact as-is.
    Overwrite,
    /// Keep master's values, fill gaps from the other user.
    #[default]
    NonConflicting,
    /// Interactive merge; currently behaves like `NonConflicting`.
    Merge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// How often the updater pulls, commits and pushes.
    pub reload_interval: Duration,
    /// Sleep between updater iterations.
    pub cooldown: Duration,
    /// Upper bound on blocking waits for scheduled jobs.
    pub timeout: Duration,
    pub sync_level: SyncLevel,
    /// Skip context polling and UI refresh.
    pub headless: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            reload_interval: Duration::from_secs(10),
            cooldown: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
            sync_level: SyncLevel::default(),
            headless: false,
        }
    }
}

fn default_remote() -> String {
    DEFAULT_REMOTE.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_reload_secs() -> u64 {
    10
}

/// Settings remembered for one binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub binary_name: String,
    pub user: String,
    pub repo_path: PathBuf,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub sync_level: SyncLevel,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_reload_secs")]
    pub reload_interval_secs: u64,
}

impl ProjectConfig {
    pub fn new(
        binary_name: impl Into<String>,
        user: impl Into<String>,
        repo_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            binary_name: binary_name.into(),
            user: user.into(),
            repo_path: repo_path.into(),
            remote: default_remote(),
            remote_url: None,
            sync_level: SyncLevel::default(),
            log_level: default_log_level(),
            reload_interval_secs: default_reload_secs(),
        }
    }

    /// `.<name>.bsconf` in the binary's directory.
    pub fn path_for_binary(binary: &Path) -> PathBuf {
        let name = binary.file_name().and_then(|n| n.to_str()).unwrap_or("binary");
        binary.with_file_name(format!(".{name}.{CONFIG_EXTENSION}"))
    }

    pub fn load_from_file(path: &Path) -> Result<Option<Self>> {
        load_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(path, self)
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            reload_interval: Duration::from_secs(self.reload_interval_secs),
            sync_level: self.sync_level,
            ..SyncSettings::default()
        }
    }
}

/// Settings shared by every project on this machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_repo_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_user: Option<String>,
}

impl GlobalConfig {
    /// `$HOME/.global.bsconf`, when a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(GLOBAL_CONFIG_NAME))
    }

    pub fn load_from_file(path: &Path) -> Result<Option<Self>> {
        load_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(path, self)
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let value = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(Some(value))
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value).context("Failed to serialize config")?;
    fs::write(path, json)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    Ok(())
}

/// SHA-256 of a file, as lowercase hex.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_config_path_sits_next_to_binary() {
        let path = ProjectConfig::path_for_binary(Path::new("/tmp/bins/fauxware"));
        assert_eq!(path, PathBuf::from("/tmp/bins/.fauxware.bsconf"));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: ProjectConfig =
            serde_json::from_str(r#"{"binary_name":"a","user":"u","repo_path":"/r"}"#).unwrap();
        assert_eq!(cfg.remote, "origin");
        assert_eq!(cfg.sync_level, SyncLevel::NonConflicting);
        assert_eq!(cfg.sync_settings().reload_interval, Duration::from_secs(10));
    }

    #[test]
    fn sync_settings_follow_project_values() {
        let mut cfg = ProjectConfig::new("a", "u", "/r");
        cfg.sync_level = SyncLevel::Overwrite;
        cfg.reload_interval_secs = 3;
        let settings = cfg.sync_settings();
        assert_eq!(settings.sync_level, SyncLevel::Overwrite);
        assert_eq!(settings.reload_interval, Duration::from_secs(3));
        assert!(!settings.headless);
    }
}
