use std::path::PathBuf;

use anyhow::Result;
use binsync::commands::{
    init_command, magic_sync_command, show_state_command, status_command, sync_command,
    users_command,
};
use binsync::{canonicalize_or_current, resolve_session, OutputFormat, Session};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Collaborative reverse engineering over git.
///
/// This CLI is a thin headless wrapper around `binsync-core` (exposed in code
/// as `binsync_core`); every analyst's artifacts live on their own branch of
/// a shared sync repository.
#[derive(Parser, Debug)]
#[command(name = "binsync", version, about = "Sync reverse-engineering artifacts through git", long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset (e.g. `debug`, `binsync_core=trace`).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

/// Where to sync and as whom; both fall back to the last `init`.
#[derive(Args, Debug)]
struct SessionArgs {
    /// Sync repository path.
    #[arg(long)]
    repo: Option<String>,

    /// User whose state this session owns.
    #[arg(long)]
    user: Option<String>,
}

impl SessionArgs {
    fn resolve(&self) -> Result<Session> {
        resolve_session(self.repo.as_deref(), self.user.as_deref())
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new sync repository and publish the user.
    Init {
        /// Sync repository path to create.
        #[arg(long)]
        repo: String,

        #[arg(long)]
        user: String,

        /// Binary under analysis; its SHA-256 is recorded in the repository.
        #[arg(long)]
        binary: Option<PathBuf>,

        /// Precomputed binary hash (overrides `--binary` hashing).
        #[arg(long)]
        hash: Option<String>,

        /// Shared remote to push to.
        #[arg(long)]
        remote_url: Option<String>,
    },

    /// Show repository and remote status.
    Status {
        #[command(flatten)]
        session: SessionArgs,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List users with a state in the repository.
    Users {
        #[command(flatten)]
        session: SessionArgs,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Print a user's state.
    ShowState {
        #[command(flatten)]
        session: SessionArgs,

        /// Whose state to print (defaults to `--user`).
        #[arg(long)]
        of: Option<String>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Pull another user's artifacts into your state, then push.
    Sync {
        #[command(flatten)]
        session: SessionArgs,

        /// User to pull from.
        #[arg(long)]
        from: String,

        #[arg(long)]
        binary: Option<PathBuf>,

        /// Clone from here when `--repo` is not checked out yet.
        #[arg(long)]
        remote_url: Option<String>,
    },

    /// Merge every user's artifacts into your state, then push.
    MagicSync {
        #[command(flatten)]
        session: SessionArgs,

        /// User whose values win conflicts (defaults to `--user`).
        #[arg(long)]
        prefer: Option<String>,

        #[arg(long)]
        binary: Option<PathBuf>,

        #[arg(long)]
        remote_url: Option<String>,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Init { repo, user, binary, hash, remote_url } => {
            let session = Session { repo: canonicalize_or_current(&repo)?, user };
            init_command(&session, binary.as_deref(), hash, remote_url)?
        }
        Command::Status { session, format } => status_command(&session.resolve()?, format)?,
        Command::Users { session, format } => users_command(&session.resolve()?, format)?,
        Command::ShowState { session, of, format } => {
            show_state_command(&session.resolve()?, of.as_deref(), format)?
        }
        Command::Sync { session, from, binary, remote_url } => {
            sync_command(&session.resolve()?, &from, binary.as_deref(), remote_url.as_deref())?
        }
        Command::MagicSync { session, prefer, binary, remote_url } => magic_sync_command(
            &session.resolve()?,
            prefer.as_deref(),
            binary.as_deref(),
            remote_url.as_deref(),
        )?,
    }

    Ok(())
}
