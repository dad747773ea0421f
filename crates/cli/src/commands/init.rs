use std::path::Path;

use anyhow::{Context, Result};
use binsync_core::client::{Client, ClientOptions};
use binsync_core::config::{sha256_file, ProjectConfig};

use crate::{remember_session, Session};

/// Create a sync repository at the session's path and publish the user.
///
/// With `binary`, the repository records that file's SHA-256 and a project
/// config is written next to it.
pub fn init_command(
    session: &Session,
    binary: Option<&Path>,
    hash: Option<String>,
    remote_url: Option<String>,
) -> Result<()> {
    let binary_hash = match (hash, binary) {
        (Some(hash), _) => hash,
        (None, Some(binary)) => sha256_file(binary)
            .with_context(|| format!("Failed to hash binary: {}", binary.display()))?,
        (None, None) => String::new(),
    };

    let mut options = ClientOptions::new(session.user.clone(), session.repo.clone())
        .binary_hash(binary_hash.clone())
        .init_repo(true);
    options.remote_url = remote_url.clone();
    let (client, _) = Client::connect(options)
        .with_context(|| format!("Failed to initialize sync repository at {}", session.repo.display()))?;
    client.update("User created").context("Failed to publish user")?;
    client.shutdown();

    println!("Initialized sync repository:");
    println!("  Repo: {}", session.repo.display());
    println!("  User: {}", session.user);
    if !binary_hash.is_empty() {
        println!("  Binary hash: {binary_hash}");
    }

    if let Some(binary) = binary {
        let name = binary.file_name().and_then(|n| n.to_str()).unwrap_or("binary");
        let mut config = ProjectConfig::new(name, session.user.clone(), session.repo.clone());
        config.remote_url = remote_url;
        let path = ProjectConfig::path_for_binary(binary);
        config.save(&path)?;
        println!("  Config: {}", path.display());
    }
    remember_session(session);
    Ok(())
}
