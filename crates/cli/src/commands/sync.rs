use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use binsync_core::config::{ProjectConfig, SyncSettings};
use binsync_core::controller::Controller;
use binsync_core::decompiler::HeadlessDecompiler;
use binsync_core::lifter::IdentityLifter;
use binsync_core::scheduler::SchedSpeed;

use crate::{open_client, Session};

fn headless_controller(
    session: &Session,
    binary: Option<&Path>,
    remote_url: Option<&str>,
) -> Result<Controller> {
    let decompiler = match binary {
        Some(path) => HeadlessDecompiler::for_binary(path)
            .with_context(|| format!("Failed to read binary: {}", path.display()))?,
        None => HeadlessDecompiler::new(String::new()),
    };
    // A project config saved by `init` next to the binary supplies defaults.
    let project = match binary {
        Some(path) => ProjectConfig::load_from_file(&ProjectConfig::path_for_binary(path))?,
        None => None,
    };
    let base = project.as_ref().map(ProjectConfig::sync_settings).unwrap_or_default();
    let remote_url = remote_url.or(project.as_ref().and_then(|p| p.remote_url.as_deref()));

    let settings = SyncSettings { headless: true, ..base };
    let controller = Controller::new(IdentityLifter, Arc::new(decompiler), settings);
    controller.attach(open_client(session, remote_url)?);
    Ok(controller)
}

fn finish(controller: &Controller, message: &str) -> Result<()> {
    let client = controller.client()?;
    client.update(message).context("Failed to update repository")?;
    controller.disconnect();
    Ok(())
}

/// Pull from the remote, fill everything `from` has into the session
/// user's state, then commit and push.
pub fn sync_command(
    session: &Session,
    from: &str,
    binary: Option<&Path>,
    remote_url: Option<&str>,
) -> Result<()> {
    let controller = headless_controller(session, binary, remote_url)?;
    let client = controller.client()?;
    let reachable = client.sync_states().context("Failed to pull")?;
    if !reachable && client.has_remote() {
        eprintln!("warning: remote unreachable, syncing locally");
    }
    let known = controller.usernames(SchedSpeed::Fast)?;
    if !known.iter().any(|u| u == from) {
        bail!("Unknown user '{from}'. Known users: {}", known.join(", "));
    }
    let changed = controller.fill_all(Some(from)).context("Failed to fill artifacts")?;
    finish(&controller, "Sync")?;

    if changed {
        println!("Synced artifacts from {from}.");
    } else {
        println!("Already up to date with {from}.");
    }
    Ok(())
}

/// Merge every user's artifacts into the session user's state.
pub fn magic_sync_command(
    session: &Session,
    prefer: Option<&str>,
    binary: Option<&Path>,
    remote_url: Option<&str>,
) -> Result<()> {
    let controller = headless_controller(session, binary, remote_url)?;
    controller.client()?.sync_states().context("Failed to pull")?;
    let changed = controller.magic_fill(prefer).context("Magic sync failed")?;
    finish(&controller, "Magic sync")?;

    if changed {
        println!("Magic sync merged new artifacts.");
    } else {
        println!("Magic sync found nothing new.");
    }
    Ok(())
}
