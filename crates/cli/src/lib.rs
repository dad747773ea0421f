pub mod commands;

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use binsync_core::client::{Client, ClientOptions};
use binsync_core::config::GlobalConfig;
use clap::ValueEnum;
use tracing::warn;

/// Output format for commands that print structured data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

/// Canonicalize the path if possible, falling back to the given string
/// relative to the current working directory.
pub fn canonicalize_or_current(path: &str) -> Result<PathBuf> {
    let p = Path::new(path);
    if p == Path::new(".") {
        return env::current_dir().context("Failed to get current directory");
    }
    match p.canonicalize() {
        Ok(p) => Ok(p),
        Err(_) => {
            let cwd = env::current_dir().context("Failed to get current directory")?;
            Ok(cwd.join(p))
        }
    }
}

/// Where to sync and as whom, after falling back to the global config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub repo: PathBuf,
    pub user: String,
}

/// Resolve `--repo` / `--user`, filling gaps from `$HOME/.global.bsconf`.
pub fn resolve_session(repo: Option<&str>, user: Option<&str>) -> Result<Session> {
    let global = load_global_config();
    let repo = match repo {
        Some(repo) => canonicalize_or_current(repo)?,
        None => global
            .last_repo_path
            .clone()
            .ok_or_else(|| anyhow!("No repository given; pass --repo"))?,
    };
    let user = match user {
        Some(user) => user.to_string(),
        None => global.last_user.clone().ok_or_else(|| anyhow!("No user given; pass --user"))?,
    };
    Ok(Session { repo, user })
}

fn load_global_config() -> GlobalConfig {
    let Some(path) = GlobalConfig::default_path() else {
        return GlobalConfig::default();
    };
    match GlobalConfig::load_from_file(&path) {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable global config");
            GlobalConfig::default()
        }
    }
}

/// Remember the session for later invocations. Failures only warn.
pub fn remember_session(session: &Session) {
    let Some(path) = GlobalConfig::default_path() else {
        return;
    };
    let config = GlobalConfig {
        last_repo_path: Some(session.repo.clone()),
        last_user: Some(session.user.clone()),
    };
    if let Err(e) = config.save(&path) {
        warn!(path = %path.display(), error = %e, "failed to save global config");
    }
}

/// Open (or clone, when `remote_url` is set and nothing is checked out yet)
/// the repository for `session`, printing connection warnings to stderr.
pub fn open_client(session: &Session, remote_url: Option<&str>) -> Result<Client> {
    let mut options = ClientOptions::new(session.user.clone(), session.repo.clone());
    options.remote_url = remote_url.map(str::to_string);
    let (client, warnings) = Client::connect(options)
        .with_context(|| format!("Failed to open sync repository at {}", session.repo.display()))?;
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
    Ok(client)
}

/// Serialize `value` as pretty JSON or YAML.
pub fn render<T: serde::Serialize>(value: &T, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Yaml => serde_yaml::to_string(value).context("Failed to serialize to YAML"),
        OutputFormat::Json | OutputFormat::Text => {
            serde_json::to_string_pretty(value).context("Failed to serialize to JSON")
        }
    }
}
