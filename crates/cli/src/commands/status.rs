use anyhow::{Context, Result};
use binsync_core::scheduler::SchedSpeed;
use chrono::{TimeZone, Utc};
use serde::Serialize;

use crate::{open_client, render, OutputFormat, Session};

#[derive(Serialize)]
pub struct StatusSnapshot {
    pub user: String,
    pub repo: String,
    pub users: usize,
    #[serde(flatten)]
    pub client: binsync_core::client::ClientStatus,
}

/// Show the repository, remote and last-commit information.
pub fn status_command(session: &Session, format: OutputFormat) -> Result<()> {
    let client = open_client(session, None)?;
    let users = client.users(SchedSpeed::Fast).context("Failed to list users")?;
    let snapshot = StatusSnapshot {
        user: session.user.clone(),
        repo: session.repo.display().to_string(),
        users: users.len(),
        client: client.status(),
    };
    client.shutdown();

    if format != OutputFormat::Text {
        println!("{}", render(&snapshot, format)?);
        return Ok(());
    }

    println!("BinSync Status");
    println!("==============");
    println!("User: {}", snapshot.user);
    println!("Repo: {}", snapshot.repo);
    match &snapshot.client.remote_url {
        Some(url) => println!("Remote: {} ({url})", snapshot.client.remote_name),
        None => println!("Remote: (none)"),
    }
    println!("Users: {}", snapshot.users);
    match &snapshot.client.last_commit {
        Some(commit) => println!("Last commit: {commit}"),
        None => println!("Last commit: -"),
    }
    Ok(())
}

/// List every user with a state in the repository.
pub fn users_command(session: &Session, format: OutputFormat) -> Result<()> {
    let client = open_client(session, None)?;
    let users = client.users(SchedSpeed::Fast).context("Failed to list users")?;
    client.shutdown();

    if format != OutputFormat::Text {
        println!("{}", render(&users, format)?);
        return Ok(());
    }

    println!("Users ({}):", users.len());
    if users.is_empty() {
        println!("  (none)");
        return Ok(());
    }
    for user in users {
        let when = user
            .last_commit_time
            .and_then(|t| Utc.timestamp_opt(t, 0).single())
            .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
        println!("  - {} (last commit: {when})", user.name);
    }
    Ok(())
}
