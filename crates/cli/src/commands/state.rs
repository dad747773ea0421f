use anyhow::{Context, Result};
use binsync_core::model::ArtifactKind;
use binsync_core::scheduler::SchedSpeed;

use crate::{open_client, render, OutputFormat, Session};

/// Print a user's state (the session user by default).
pub fn show_state_command(session: &Session, of: Option<&str>, format: OutputFormat) -> Result<()> {
    let client = open_client(session, None)?;
    let owner = of.unwrap_or(&session.user);
    let state = client
        .get_state(Some(owner), None, SchedSpeed::Fast, false)
        .with_context(|| format!("Failed to load state of {owner}"))?;
    client.shutdown();

    if format != OutputFormat::Text {
        println!("{}", render(&state, format)?);
        return Ok(());
    }

    println!("State of {} (version {})", state.user(), state.version());
    if let Some(commit) = state.commit() {
        println!("Commit: {commit}");
    }
    for kind in ArtifactKind::ALL {
        let ids = state.ids_of_kind(kind);
        if ids.is_empty() {
            continue;
        }
        println!("{kind} ({}):", ids.len());
        for id in ids {
            println!("  - {id}");
        }
    }
    Ok(())
}
