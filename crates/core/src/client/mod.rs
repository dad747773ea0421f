//! Repository-backed access to every user's [`State`].
//!
//! A [`Client`] owns the git repository through a [`Scheduler`]: the store
//! and the per-user state cache live on the scheduler's worker thread, and
//! every public method is a job submitted to it. Reads run at
//! [`SchedSpeed::Fast`] by default, repository traffic at
//! [`SchedSpeed::Slow`].

pub mod store;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use git2::Oid;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::model::{ArtifactId, ArtifactKind};
use crate::scheduler::{SchedSpeed, Scheduler};
use crate::state::{wire, State};

pub use store::GitStore;

pub const DEFAULT_REMOTE: &str = "origin";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How to open (or create) the repository behind a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub master_user: String,
    pub repo_path: PathBuf,
    pub binary_hash: String,
    pub remote: String,
    /// Clone from here when `repo_path` holds no repository yet; with
    /// `init_repo` the new repository gets this as its remote.
    pub remote_url: Option<String>,
    /// Create a brand new repository at `repo_path`.
    pub init_repo: bool,
    /// Upper bound on how long a caller blocks on a scheduled job.
    pub timeout: Duration,
}

impl ClientOptions {
    /// Options for `master_user` working in the repository at `repo_path`.
    pub fn new(master_user: impl Into<String>, repo_path: impl Into<PathBuf>) -> Self {
        Self {
            master_user: master_user.into(),
            repo_path: repo_path.into(),
            binary_hash: String::new(),
            remote: DEFAULT_REMOTE.to_string(),
            remote_url: None,
            init_repo: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn binary_hash(mut self, hash: impl Into<String>) -> Self {
        self.binary_hash = hash.into();
        self
    }

    pub fn remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    /// Create the repository instead of opening or cloning it.
    pub fn init_repo(mut self, init: bool) -> Self {
        self.init_repo = init;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A collaborator known to the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub name: String,
    /// Unix time of the user's latest state commit.
    pub last_commit_time: Option<i64>,
}

/// Snapshot of the client's repository traffic.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientStatus {
    pub remote_name: String,
    pub remote_url: Option<String>,
    pub has_remote: bool,
    /// False after a failed pull; reset by the next successful one.
    pub active_remote: bool,
    pub last_commit: Option<String>,
    pub last_commit_time: Option<DateTime<Utc>>,
    pub last_push: Option<DateTime<Utc>>,
    pub last_push_attempt: Option<DateTime<Utc>>,
    pub last_pull: Option<DateTime<Utc>>,
    pub last_pull_attempt: Option<DateTime<Utc>>,
}

/// Identifiers each user provides, per artifact kind.
pub type Tally = BTreeMap<String, BTreeMap<ArtifactKind, Vec<ArtifactId>>>;

struct CachedState {
    tip: Oid,
    state: State,
}

/// Everything owned by the worker thread.
struct ClientCore {
    store: GitStore,
    master: String,
    cache: HashMap<String, CachedState>,
    /// Master state staged by `put_state`, committed on the next update.
    staged: Option<State>,
    status: Arc<Mutex<ClientStatus>>,
}

impl ClientCore {
    fn with_status(&self, f: impl FnOnce(&mut ClientStatus)) {
        f(&mut self.status.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn load_state(&mut self, user: &str, version: Option<Oid>, no_cache: bool) -> SyncResult<State> {
        let is_master = user == self.master;
        if is_master && version.is_none() {
            if let Some(staged) = &self.staged {
                return Ok(staged.clone());
            }
        }

        let tip = match version {
            Some(oid) => Some(oid),
            None => self.store.user_tip(user, is_master)?,
        };
        let Some(tip) = tip else {
            if is_master {
                return Ok(State::new(user));
            }
            return Err(SyncError::UnknownUser(user.to_string()));
        };

        if !no_cache {
            if let Some(cached) = self.cache.get(user).filter(|c| c.tip == tip) {
                return Ok(cached.state.clone());
            }
        }

        let files = self.store.read_files(tip)?;
        let mut state = wire::decode(user, files.iter().map(|(p, b)| (p.as_str(), b.as_slice())));
        state.set_commit(Some(tip.to_string()));
        debug!(user, commit = %tip, "loaded state");
        if version.is_none() {
            self.cache.insert(user.to_string(), CachedState { tip, state: state.clone() });
        }
        Ok(state)
    }

    /// Commit `state` on the master branch; the saved state comes back, or
    /// `None` when nothing differed from the current tip.
    fn commit_state(&mut self, mut state: State, message: &str) -> SyncResult<Option<State>> {
        if state.user() != self.master {
            return Err(SyncError::ForeignState {
                owner: state.user().to_string(),
                master: self.master.clone(),
            });
        }
        let tip = self.store.user_tip(&self.master, true)?;
        if let Some(tip) = tip {
            let current = self.load_state_at(tip)?;
            let tip_id = tip.to_string();
            if state.commit() != Some(tip_id.as_str()) {
                // Loaded before the latest commit: keep what landed since.
                let base = self.base_of(&state);
                debug!(
                    user = %self.master,
                    base = ?state.commit(),
                    tip = %tip_id,
                    "rebasing state onto tip"
                );
                state = state.rebased(&base, current.clone());
            }
            if current == state {
                self.staged = None;
                return Ok(None);
            }
        }

        state.bump_version();
        let files = wire::encode(&state)?;
        let Some(oid) = self.store.write_state(&self.master, &files, message)? else {
            self.staged = None;
            return Ok(None);
        };
        state.mark_saved(oid.to_string());
        let time = self.store.commit_time(oid)?;
        self.with_status(|s| {
            s.last_commit = Some(oid.to_string());
            s.last_commit_time = Utc.timestamp_opt(time, 0).single();
        });
        info!(user = %self.master, commit = %oid, message, "committed state");
        self.cache.insert(self.master.clone(), CachedState { tip: oid, state: state.clone() });
        self.staged = None;
        Ok(Some(state))
    }

    /// The committed state `state` was loaded from; empty when it was
    /// built from scratch or its commit cannot be read.
    fn base_of(&mut self, state: &State) -> State {
        let Some(commit) = state.commit() else {
            return State::new(self.master.clone());
        };
        match Oid::from_str(commit).map_err(SyncError::from).and_then(|oid| self.load_state_at(oid)) {
            Ok(base) => base,
            Err(e) => {
                warn!(commit, error = %e, "cannot read base commit, replaying every artifact");
                State::new(self.master.clone())
            }
        }
    }

    fn load_state_at(&mut self, tip: Oid) -> SyncResult<State> {
        let master = self.master.clone();
        self.load_state(&master, Some(tip), false)
    }

    /// Fetch from the remote; failures leave the client in local-only mode.
    fn pull(&mut self) -> bool {
        if !self.store.has_remote() {
            return false;
        }
        self.with_status(|s| s.last_pull_attempt = Some(Utc::now()));
        match self.store.fetch() {
            Ok(()) => {
                self.with_status(|s| {
                    s.last_pull = Some(Utc::now());
                    s.active_remote = true;
                });
                true
            }
            Err(e) => {
                warn!(remote = self.store.remote_name(), error = %e, "pull failed, continuing locally");
                self.with_status(|s| s.active_remote = false);
                false
            }
        }
    }

    fn push(&mut self) -> bool {
        if !self.store.has_remote() {
            return false;
        }
        self.with_status(|s| s.last_push_attempt = Some(Utc::now()));
        match self.store.push(&self.master) {
            Ok(()) => {
                self.with_status(|s| s.last_push = Some(Utc::now()));
                true
            }
            Err(e) => {
                warn!(remote = self.store.remote_name(), error = %e, "push failed");
                false
            }
        }
    }

    fn update(&mut self, message: &str) -> SyncResult<()> {
        self.pull();
        let staged = match self.staged.take() {
            Some(staged) => Some(staged).filter(State::is_dirty),
            // First update of a new user: publish an empty state so others see it.
            None if self.store.user_tip(&self.master, true)?.is_none() => {
                Some(State::new(self.master.clone()))
            }
            None => None,
        };
        if let Some(staged) = staged {
            self.commit_state(staged, message)?;
        }
        self.push();
        Ok(())
    }

    fn users(&self) -> SyncResult<Vec<User>> {
        self.store
            .users()?
            .into_iter()
            .map(|name| -> SyncResult<User> {
                let last_commit_time = match self.store.user_tip(&name, name == self.master)? {
                    Some(tip) => Some(self.store.commit_time(tip)?),
                    None => None,
                };
                Ok(User { name, last_commit_time })
            })
            .collect()
    }
}

struct ClientInner {
    scheduler: Scheduler<ClientCore>,
    master: String,
    timeout: Duration,
    status: Arc<Mutex<ClientStatus>>,
}

/// Cheaply cloneable handle to a connected repository.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("master", &self.inner.master).finish_non_exhaustive()
    }
}

/// Reject names that cannot be a branch component.
pub fn validate_username(name: &str) -> SyncResult<()> {
    let bad = name.is_empty()
        || name.ends_with('/')
        || name == store::ROOT_USER
        || name.chars().any(|c| c.is_whitespace() || c == ':' || c == '~' || c == '^');
    if bad {
        return Err(SyncError::BadUsername(name.to_string()));
    }
    Ok(())
}

impl Client {
    /// Open, clone, or initialise the repository and start the worker.
    ///
    /// Returns human-readable warnings (such as a binary hash mismatch) that
    /// do not prevent syncing.
    pub fn connect(options: ClientOptions) -> SyncResult<(Client, Vec<String>)> {
        validate_username(&options.master_user)?;
        let path = options.repo_path.as_path();
        let store = if options.init_repo {
            GitStore::init(
                path,
                &options.remote,
                options.remote_url.as_deref(),
                &options.binary_hash,
            )?
        } else if git2::Repository::open(path).is_ok() {
            GitStore::open(path, &options.remote)?
        } else if let Some(url) = &options.remote_url {
            GitStore::clone_from(url, path, &options.remote)?
        } else {
            return Err(SyncError::Repository(git2::Error::from_str(&format!(
                "no sync repository at {} and no remote to clone from",
                path.display()
            ))));
        };

        let mut warnings = Vec::new();
        match store.binary_hash()? {
            Some(recorded) if !options.binary_hash.is_empty() && recorded != options.binary_hash => {
                warnings.push(format!(
                    "binary hash mismatch: repository tracks {recorded}, local binary is {}",
                    options.binary_hash
                ));
            }
            None => warnings.push("repository has no root branch recording a binary hash".to_string()),
            _ => {}
        }
        for warning in &warnings {
            warn!("{warning}");
        }

        let status = Arc::new(Mutex::new(ClientStatus {
            remote_name: options.remote.clone(),
            remote_url: store.remote_url(),
            has_remote: store.has_remote(),
            active_remote: store.has_remote(),
            ..ClientStatus::default()
        }));
        let core = ClientCore {
            store,
            master: options.master_user.clone(),
            cache: HashMap::new(),
            staged: None,
            status: Arc::clone(&status),
        };
        let scheduler = Scheduler::start("binsync-client", core)?;
        info!(user = %options.master_user, path = %path.display(), "client connected");

        let client = Client {
            inner: Arc::new(ClientInner {
                scheduler,
                master: options.master_user,
                timeout: options.timeout,
                status,
            }),
        };
        Ok((client, warnings))
    }

    fn run<R, F>(&self, speed: SchedSpeed, job: F) -> SyncResult<R>
    where
        F: FnOnce(&mut ClientCore) -> SyncResult<R> + Send + 'static,
        R: Send + 'static,
    {
        self.inner.scheduler.schedule_and_wait(job, speed, self.inner.timeout)?
    }

    /// The user this client commits as.
    pub fn master_user(&self) -> &str {
        &self.inner.master
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Load `user`'s state (master when `None`).
    ///
    /// `version` pins a specific commit and bypasses the cache. The master
    /// user always gets a state, empty if nothing was committed yet; any
    /// other unknown user is an error.
    pub fn get_state(
        &self,
        user: Option<&str>,
        version: Option<&str>,
        priority: SchedSpeed,
        no_cache: bool,
    ) -> SyncResult<State> {
        let user = user.unwrap_or(&self.inner.master).to_string();
        let version = version.map(Oid::from_str).transpose()?;
        self.run(priority, move |core| core.load_state(&user, version, no_cache))
    }

    /// The master user's current state.
    pub fn master_state(&self) -> SyncResult<State> {
        self.get_state(None, None, SchedSpeed::Fast, false)
    }

    /// Write `state` as a new commit on the master branch. Returns false
    /// when it matches what is already committed; otherwise `state` is
    /// updated with its new version and commit id.
    pub fn commit_state(&self, state: &mut State, message: &str) -> SyncResult<bool> {
        let message = message.to_string();
        let pending = state.clone();
        match self.run(SchedSpeed::Average, move |core| core.commit_state(pending, &message))? {
            Some(saved) => {
                *state = saved;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stage a modified master state for the next [`Client::update`].
    pub fn put_state(&self, state: State) -> SyncResult<()> {
        if state.user() != self.inner.master {
            return Err(SyncError::ForeignState {
                owner: state.user().to_string(),
                master: self.inner.master.clone(),
            });
        }
        self.run(SchedSpeed::Fast, move |core| {
            core.staged = Some(state);
            Ok(())
        })
    }

    /// Pull, commit staged changes, push.
    pub fn update(&self, message: &str) -> SyncResult<()> {
        let message = message.to_string();
        self.run(SchedSpeed::Slow, move |core| core.update(&message))
    }

    /// Fire-and-forget [`Client::update`], used by the background loop.
    pub fn schedule_update(&self, message: &str) -> bool {
        let message = message.to_string();
        self.inner.scheduler.schedule(
            move |core| {
                if let Err(e) = core.update(&message) {
                    warn!(error = %e, "background update failed");
                }
            },
            SchedSpeed::Slow,
        )
    }

    /// Fetch other users' states from the remote. Returns whether the
    /// remote was reachable.
    pub fn sync_states(&self) -> SyncResult<bool> {
        self.run(SchedSpeed::Slow, |core| Ok(core.pull()))
    }

    /// Push the master branch. Returns whether the push went through.
    pub fn push(&self) -> SyncResult<bool> {
        self.run(SchedSpeed::Slow, |core| Ok(core.push()))
    }

    /// Every user with a state branch, with the time of their last commit.
    pub fn users(&self, priority: SchedSpeed) -> SyncResult<Vec<User>> {
        self.run(priority, |core| core.users())
    }

    /// Which identifiers each user (all users when `None`) provides.
    pub fn tally(&self, users: Option<&[String]>) -> SyncResult<Tally> {
        let wanted: Option<Vec<String>> = users.map(<[String]>::to_vec);
        self.run(SchedSpeed::Average, move |core| {
            let mut tally = Tally::new();
            for user in core.users()? {
                if wanted.as_ref().is_some_and(|w| !w.contains(&user.name)) {
                    continue;
                }
                let state = core.load_state(&user.name, None, false)?;
                let per_kind = ArtifactKind::ALL
                    .into_iter()
                    .map(|kind| (kind, state.ids_of_kind(kind)))
                    .filter(|(_, ids)| !ids.is_empty())
                    .collect();
                tally.insert(user.name, per_kind);
            }
            Ok(tally)
        })
    }

    /// Snapshot of remote and commit bookkeeping.
    pub fn status(&self) -> ClientStatus {
        self.inner.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn has_remote(&self) -> bool {
        self.status().has_remote
    }

    /// Drain outstanding jobs and stop the worker; later calls fail with
    /// [`crate::scheduler::FailedJob::WorkerGone`].
    pub fn shutdown(&self) {
        self.inner.scheduler.shutdown();
    }
}
