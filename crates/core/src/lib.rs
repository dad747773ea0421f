//! binsync-core
//!
//! Serverless collaborative reverse engineering: every analyst's knowledge
//! about a binary (function headers, stack variables, comments, global
//! variables, structs, enums, patches) lives in a per-user state, stored as
//! one git branch per user and exchanged through an ordinary git remote.
//!
//! Layers, bottom up:
//! - [`model`]: artifact types and their non-conflicting merge.
//! - [`state`]: a user's snapshot and its on-disk TOML encoding.
//! - [`scheduler`]: the single worker thread that owns the repository.
//! - [`client`]: repository access, caching, commits, pull and push.
//! - [`controller`]: lifting, guarded fills, magic sync and the updater loop.
//!
//! Host tools plug in through [`decompiler::DecompilerInterface`] and
//! [`lifter::ArtifactLifter`].

pub mod client;
pub mod config;
pub mod controller;
pub mod decompiler;
pub mod error;
pub mod lifter;
pub mod model;
pub mod scheduler;
pub mod state;

pub use client::{Client, ClientOptions, User};
pub use config::{ProjectConfig, SyncLevel, SyncSettings};
pub use controller::{Controller, SyncControlStatus};
pub use decompiler::{DecompilerInterface, HeadlessDecompiler};
pub use error::{SyncError, SyncResult};
pub use lifter::{ArtifactLifter, IdentityLifter, RebaseLifter};
pub use state::{Stamp, State};

/// Returns the library version as encoded at compile time.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
