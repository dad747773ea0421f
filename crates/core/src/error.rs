//! Error types shared by the state, client and controller layers.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::{ArtifactId, ArtifactKind};
use crate::scheduler::FailedJob;

/// Lookup failure inside a single [`State`](crate::state::State).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("{kind} {id} not found in state")]
    NotFound { kind: ArtifactKind, id: ArtifactId },
}

pub type StateResult<T> = Result<T, StateError>;

/// Errors surfaced by the sync client and controller.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An operation needing a repository was called before `connect`.
    #[error("not connected to a sync repository")]
    NotConnected,

    #[error("{kind} {id} not found")]
    ArtifactNotFound { kind: ArtifactKind, id: ArtifactId },

    #[error("unsupported artifact kind {kind} for {id}")]
    UnsupportedArtifactKind { kind: ArtifactKind, id: ArtifactId },

    /// Underlying git failure.
    #[error("repository error: {0}")]
    Repository(#[from] git2::Error),

    #[error("remote {0:?} is unavailable")]
    RemoteUnavailable(String),

    #[error("background job failed: {0}")]
    Job(#[from] FailedJob),

    #[error("malformed artifact data in {path}: {reason}")]
    MalformedArtifact { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another client already holds the checkout.
    #[error("repository at {0} is locked by another client")]
    Lock(PathBuf),

    #[error("invalid username {0:?}")]
    BadUsername(String),

    /// Only the master user's state may be committed by this client.
    #[error("refusing to commit state owned by {owner:?} as {master:?}")]
    ForeignState { owner: String, master: String },

    #[error("a repository already exists at {0}")]
    RepositoryExists(PathBuf),

    #[error("unknown user {0:?}")]
    UnknownUser(String),
}

impl From<StateError> for SyncError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound { kind, id } => SyncError::ArtifactNotFound { kind, id },
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
