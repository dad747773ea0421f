//! Orchestration between a host tool and the sync repository.
//!
//! The [`Controller`] decides what to pull and push: it lifts live artifacts
//! into canonical form before storing them, lowers stored artifacts before
//! handing them to the tool, guards fills against redundant work, and runs
//! the cross-user "magic sync" pass. A background updater thread keeps the
//! repository moving while a session is connected.

mod updater;

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::client::{Client, ClientOptions, User};
use crate::config::{SyncLevel, SyncSettings};
use crate::decompiler::DecompilerInterface;
use crate::error::{SyncError, SyncResult};
use crate::lifter::ArtifactLifter;
use crate::model::{ArtifactId, ArtifactKind, ArtifactRecord, ChangeStamp, Function};
use crate::scheduler::SchedSpeed;
use crate::state::{Stamp, State};

use updater::Updater;

/// Kinds folded by [`Controller::magic_fill`], in order.
pub const MAGIC_SYNC_KINDS: [ArtifactKind; 5] = [
    ArtifactKind::Struct,
    ArtifactKind::Comment,
    ArtifactKind::Function,
    ArtifactKind::GlobalVariable,
    ArtifactKind::Enum,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncControlStatus {
    Connected,
    /// Connected, but there is no remote or the last pull failed.
    ConnectedNoRemote,
    Disconnected,
}

type Command = Box<dyn FnOnce(&Controller) + Send + 'static>;
type UiCallback = Arc<dyn Fn() + Send + Sync + 'static>;
type ContextCallback = Arc<dyn Fn(&Function) + Send + Sync + 'static>;

/// User-initiated work, run one item per updater tick in submission order.
#[derive(Default)]
struct CommandQueue {
    next: u64,
    pending: BTreeMap<u64, Command>,
}

#[derive(Default)]
struct Timers {
    last_update: Option<Instant>,
    last_reload: Option<Instant>,
    last_ctx: Option<u64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reject identifiers whose shape does not match what `kind` is keyed by.
fn check_kind(kind: ArtifactKind, id: &ArtifactId) -> SyncResult<()> {
    let accepted = matches!(
        (kind, id),
        (
            ArtifactKind::Function
                | ArtifactKind::FunctionHeader
                | ArtifactKind::Comment
                | ArtifactKind::GlobalVariable
                | ArtifactKind::Patch,
            ArtifactId::Addr(_)
        ) | (ArtifactKind::StackVariable, ArtifactId::StackSlot { .. })
            | (ArtifactKind::Struct | ArtifactKind::Enum, ArtifactId::Name(_))
    );
    if accepted {
        Ok(())
    } else {
        Err(SyncError::UnsupportedArtifactKind { kind, id: id.clone() })
    }
}

pub struct Controller {
    client: RwLock<Option<Client>>,
    lifter: Box<dyn ArtifactLifter>,
    decompiler: Arc<dyn DecompilerInterface>,
    settings: RwLock<SyncSettings>,
    commands: Mutex<CommandQueue>,
    timers: Mutex<Timers>,
    ui_callback: RwLock<Option<UiCallback>>,
    ctx_callback: RwLock<Option<ContextCallback>>,
    updater: Mutex<Option<Updater>>,
}

impl Controller {
    /// A disconnected controller; call [`Controller::connect`] or
    /// [`Controller::attach`] before syncing.
    pub fn new(
        lifter: impl ArtifactLifter + 'static,
        decompiler: Arc<dyn DecompilerInterface>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            client: RwLock::new(None),
            lifter: Box::new(lifter),
            decompiler,
            settings: RwLock::new(settings),
            commands: Mutex::default(),
            timers: Mutex::default(),
            ui_callback: RwLock::new(None),
            ctx_callback: RwLock::new(None),
            updater: Mutex::new(None),
        }
    }

    //
    // connection
    //

    /// Connect to the repository and start the background updater.
    ///
    /// An empty `binary_hash` in `options` is filled from the decompiler.
    pub fn connect(self: &Arc<Self>, mut options: ClientOptions) -> SyncResult<Vec<String>> {
        if options.binary_hash.is_empty() {
            options.binary_hash = self.decompiler.binary_hash();
        }
        options.timeout = self.settings().timeout;
        let (client, warnings) = Client::connect(options)?;
        self.attach(client);
        self.start_updater()?;
        Ok(warnings)
    }

    /// Use an already connected client without starting the updater.
    pub fn attach(&self, client: Client) {
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = Some(client);
    }

    /// Start the background loop driving [`Controller::tick`]. A second call
    /// is a no-op.
    pub fn start_updater(self: &Arc<Self>) -> SyncResult<()> {
        let mut slot = lock(&self.updater);
        if slot.is_none() {
            *slot = Some(Updater::spawn(Arc::downgrade(self), self.settings().cooldown)?);
        }
        Ok(())
    }

    /// Stop the updater and release the repository.
    pub fn disconnect(&self) {
        let updater = lock(&self.updater).take();
        drop(updater);
        let client = self.client.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(client) = client {
            client.shutdown();
        }
    }

    /// The connected client, or [`SyncError::NotConnected`].
    pub fn client(&self) -> SyncResult<Client> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SyncError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.client().is_ok()
    }

    /// Whether a client is attached and whether it reaches its remote.
    pub fn status(&self) -> SyncControlStatus {
        match self.client() {
            Err(_) => SyncControlStatus::Disconnected,
            Ok(client) => {
                let status = client.status();
                if status.has_remote && status.active_remote {
                    SyncControlStatus::Connected
                } else {
                    SyncControlStatus::ConnectedNoRemote
                }
            }
        }
    }

    pub fn status_string(&self) -> String {
        match (self.status(), self.client()) {
            (SyncControlStatus::Connected, Ok(c)) => format!("Connected as {}", c.master_user()),
            (SyncControlStatus::ConnectedNoRemote, Ok(c)) => {
                format!("Connected as {} (no remote)", c.master_user())
            }
            _ => "Disconnected".to_string(),
        }
    }

    //
    // settings and hooks
    //

    pub fn settings(&self) -> SyncSettings {
        self.settings.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn sync_level(&self) -> SyncLevel {
        self.settings.read().unwrap_or_else(PoisonError::into_inner).sync_level
    }

    pub fn set_sync_level(&self, level: SyncLevel) {
        self.settings.write().unwrap_or_else(PoisonError::into_inner).sync_level = level;
    }

    /// Flip headless mode and return the new value.
    pub fn toggle_headless(&self) -> bool {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        settings.headless = !settings.headless;
        settings.headless
    }

    pub fn set_ui_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.ui_callback.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Called with the new active function whenever the user moves to a
    /// different one.
    pub fn set_ctx_change_callback(&self, callback: impl Fn(&Function) + Send + Sync + 'static) {
        *self.ctx_callback.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    pub fn decompiler(&self) -> &Arc<dyn DecompilerInterface> {
        &self.decompiler
    }

    //
    // command queue and updater loop
    //

    /// Queue a mutating action for the updater thread.
    pub fn make_controller_cmd(&self, command: impl FnOnce(&Controller) + Send + 'static) {
        let mut queue = lock(&self.commands);
        let key = queue.next;
        queue.next += 1;
        queue.pending.insert(key, Box::new(command));
    }

    pub fn pending_commands(&self) -> usize {
        lock(&self.commands).pending.len()
    }

    /// Run the oldest queued command, if any.
    fn eval_cmd_queue(&self) -> bool {
        let next = lock(&self.commands).pending.pop_first();
        match next {
            Some((_, command)) => {
                command(self);
                true
            }
            None => false,
        }
    }

    /// One updater iteration: schedule a repository update when due, poll
    /// for context changes and UI refreshes, then run one queued command.
    pub fn tick(&self) {
        let Ok(client) = self.client() else {
            return;
        };
        let settings = self.settings();

        let message = {
            let mut timers = lock(&self.timers);
            let message = match timers.last_update {
                None => Some("User created"),
                Some(at) if at.elapsed() >= settings.reload_interval => Some("Auto update"),
                Some(_) => None,
            };
            if message.is_some() {
                timers.last_update = Some(Instant::now());
            }
            message
        };
        if let Some(message) = message {
            client.schedule_update(message);
        }

        if !settings.headless {
            self.check_and_notify_ctx();
            let refresh = {
                let mut timers = lock(&self.timers);
                let due = timers.last_reload.is_none_or(|at| at.elapsed() >= settings.reload_interval);
                if due {
                    timers.last_reload = Some(Instant::now());
                }
                due
            };
            if refresh {
                let callback = self.ui_callback.read().unwrap_or_else(PoisonError::into_inner).clone();
                if let Some(callback) = callback {
                    callback();
                }
            }
        }

        self.eval_cmd_queue();
    }

    fn check_and_notify_ctx(&self) {
        let callback = self.ctx_callback.read().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(callback) = callback else {
            return;
        };
        let Some(active) = self.decompiler.active_context() else {
            return;
        };
        {
            let mut timers = lock(&self.timers);
            if timers.last_ctx == Some(active.addr) {
                return;
            }
            timers.last_ctx = Some(active.addr);
        }
        callback(&active);
    }

    //
    // client shortcuts
    //

    /// Users with a state in the repository.
    pub fn users(&self, priority: SchedSpeed) -> SyncResult<Vec<User>> {
        self.client()?.users(priority)
    }

    pub fn usernames(&self, priority: SchedSpeed) -> SyncResult<Vec<String>> {
        Ok(self.users(priority)?.into_iter().map(|u| u.name).collect())
    }

    /// State of `user` (master when `None`).
    pub fn get_state(&self, user: Option<&str>, priority: SchedSpeed) -> SyncResult<State> {
        self.client()?.get_state(user, None, priority, false)
    }

    fn resolve_state<'a>(
        &self,
        client: &Client,
        user: Option<&str>,
        state: Option<&'a State>,
    ) -> SyncResult<Cow<'a, State>> {
        match state {
            Some(state) => Ok(Cow::Borrowed(state)),
            None => Ok(Cow::Owned(client.get_state(user, None, SchedSpeed::Fast, false)?)),
        }
    }

    //
    // pull / push
    //

    /// Read one artifact from `state` (or `user`'s current state) in the
    /// tool's native form.
    ///
    /// Absent, mismatched or unreadable artifacts yield `None`; only a
    /// missing connection is an error.
    pub fn pull_artifact(
        &self,
        kind: ArtifactKind,
        id: &ArtifactId,
        user: Option<&str>,
        state: Option<&State>,
    ) -> SyncResult<Option<ArtifactRecord>> {
        let client = self.client()?;
        if let Err(e) = check_kind(kind, id) {
            info!(error = %e, "attempted to pull an unsupported artifact");
            return Ok(None);
        }
        let state = match self.resolve_state(&client, user, state) {
            Ok(state) => state,
            Err(e) => {
                warn!(%kind, %id, error = %e, "failed to load state for pull");
                return Ok(None);
            }
        };
        match state.get_artifact(kind, id) {
            Ok(record) => Ok(Some(self.lifter.lower(record))),
            Err(e) => {
                debug!(error = %e, "nothing to pull");
                Ok(None)
            }
        }
    }

    /// Every artifact of `kind` in a state, lowered.
    pub fn pull_artifacts(
        &self,
        kind: ArtifactKind,
        user: Option<&str>,
        state: Option<&State>,
    ) -> SyncResult<Vec<ArtifactRecord>> {
        let client = self.client()?;
        let state = self.resolve_state(&client, user, state)?;
        Ok(state
            .ids_of_kind(kind)
            .iter()
            .filter_map(|id| state.get_artifact(kind, id).ok())
            .map(|record| self.lifter.lower(record))
            .collect())
    }

    /// Lift a native artifact into `state` and commit if it changed.
    ///
    /// Function-scoped artifacts get a parent function first when `state`
    /// has none at that address. Returns whether a commit happened.
    pub fn push_artifact(
        &self,
        artifact: ArtifactRecord,
        state: &mut State,
        message: Option<&str>,
        stamp: Stamp,
    ) -> SyncResult<bool> {
        let client = self.client()?;
        let mut changed = false;
        if let Some(func_addr) = artifact.parent_function() {
            if state.get_function(self.lifter.lift_addr(func_addr)).is_err() {
                let parent = Function::new(func_addr, self.decompiler.get_func_size(func_addr));
                changed |= state.set_artifact(self.lifter.lift(parent.into()), Stamp::Keep);
            }
        }

        let lifted = self.lifter.lift(artifact);
        let message = message.map_or_else(|| lifted.commit_msg(), str::to_string);
        changed |= state.set_artifact(lifted, stamp);
        if !changed {
            return Ok(false);
        }
        client.commit_state(state, &message)
    }

    /// True when `user_state` and master record the same value (or both
    /// lack it), in which case filling it would change nothing.
    fn already_synced(
        &self,
        client: &Client,
        kind: ArtifactKind,
        id: &ArtifactId,
        user_state: &State,
    ) -> SyncResult<bool> {
        let master = client.master_state()?;
        Ok(user_state.get_artifact(kind, id).ok() == master.get_artifact(kind, id).ok())
    }

    /// Combine another user's artifact with master's per the sync level.
    fn reconcile(&self, theirs: ArtifactRecord, master: Option<ArtifactRecord>) -> ArtifactRecord {
        let level = self.sync_level();
        let Some(master) = master else {
            return theirs;
        };
        match level {
            SyncLevel::Overwrite => theirs,
            SyncLevel::NonConflicting | SyncLevel::Merge => {
                if level == SyncLevel::Merge {
                    warn!("manual merging is not supported, using non-conflicting sync");
                }
                master.merge_nonconflicting(&theirs).unwrap_or(theirs)
            }
        }
    }

    /// Apply a native artifact to the decompiler.
    fn apply_record(&self, record: &ArtifactRecord) -> bool {
        let dec = &self.decompiler;
        match record {
            ArtifactRecord::Function(f) => {
                let mut changed = false;
                if let Some(header) = &f.header {
                    changed |= dec.apply_function_header(header);
                }
                for var in f.stack_vars.values() {
                    changed |= dec.apply_stack_variable(var);
                }
                changed
            }
            ArtifactRecord::FunctionHeader(h) => dec.apply_function_header(h),
            ArtifactRecord::StackVariable(v) => dec.apply_stack_variable(v),
            ArtifactRecord::Comment(c) => dec.apply_comment(c),
            ArtifactRecord::GlobalVariable(g) => dec.apply_global_var(g),
            ArtifactRecord::Struct(s) => dec.apply_struct(s, true, true),
            ArtifactRecord::Enum(e) => dec.apply_enum(e),
            ArtifactRecord::Patch(p) => {
                info!(offset = p.offset, "patches are stored but not filled");
                false
            }
        }
    }

    /// Failures past the connection check become "no changes".
    fn fill_boundary(&self, what: &str, result: SyncResult<bool>) -> SyncResult<bool> {
        match result {
            Err(SyncError::NotConnected) => Err(SyncError::NotConnected),
            Err(e) => {
                warn!(fill = what, error = %e, "fill failed");
                Ok(false)
            }
            ok => ok,
        }
    }

    /// Guarded single-artifact fill: reconcile with master, hand the native
    /// form to `apply`, and record the result in master when `record` is set.
    fn fill_record(
        &self,
        client: &Client,
        kind: ArtifactKind,
        id: &ArtifactId,
        state: &State,
        record: bool,
        apply: impl FnOnce(&ArtifactRecord) -> bool,
    ) -> SyncResult<bool> {
        if self.already_synced(client, kind, id, state)? {
            debug!(%kind, %id, "already in sync");
            return Ok(false);
        }
        let Ok(theirs) = state.get_artifact(kind, id) else {
            return Ok(false);
        };
        let mut master = client.master_state()?;
        let reconciled = self.reconcile(theirs, master.get_artifact(kind, id).ok());
        let mut changes = apply(&self.lifter.lower(reconciled.clone()));
        if record {
            let message = format!("Synced {} from {}", reconciled, state.user());
            if master.set_artifact(reconciled, Stamp::Keep) {
                changes |= client.commit_state(&mut master, &message)?;
            }
        }
        Ok(changes)
    }

    //
    // fills
    //

    /// Fill one function (header, stack variables and the comments inside
    /// it) from `user`'s state. Identifiers are canonical addresses.
    pub fn fill_function(
        &self,
        addr: u64,
        user: Option<&str>,
        state: Option<&State>,
    ) -> SyncResult<bool> {
        let client = self.client()?;
        let result = (|| -> SyncResult<bool> {
            let state = self.resolve_state(&client, user, state)?;
            let id = ArtifactId::Addr(addr);
            if self.already_synced(&client, ArtifactKind::Function, &id, &state)? {
                debug!(addr, "function already in sync");
                return Ok(false);
            }
            let mut changes = self.fill_record(
                &client,
                ArtifactKind::Function,
                &id,
                &state,
                true,
                |r| self.apply_record(r),
            )?;
            let comment_addrs: Vec<u64> =
                state.get_func_comments(addr).iter().map(|c| c.addr).collect();
            for comment_addr in comment_addrs {
                changes |= self.fill_record(
                    &client,
                    ArtifactKind::Comment,
                    &ArtifactId::Addr(comment_addr),
                    &state,
                    true,
                    |r| self.apply_record(r),
                )?;
            }
            Ok(changes)
        })();
        self.fill_boundary("function", result)
    }

    /// Fill every function `user` recorded. Returns whether any changed.
    pub fn fill_functions(&self, user: Option<&str>, state: Option<&State>) -> SyncResult<bool> {
        let client = self.client()?;
        let state = match self.resolve_state(&client, user, state) {
            Ok(state) => state,
            Err(e) => return self.fill_boundary("functions", Err(e)),
        };
        let mut changes = false;
        for addr in state.functions().keys() {
            changes |= self.fill_function(*addr, user, Some(&*state))?;
        }
        Ok(changes)
    }

    /// Fill one struct; `header` declares it, `members` lays it out and
    /// records it in master.
    pub fn fill_struct(
        &self,
        name: &str,
        user: Option<&str>,
        state: Option<&State>,
        header: bool,
        members: bool,
    ) -> SyncResult<bool> {
        let client = self.client()?;
        let result = self.resolve_state(&client, user, state).and_then(|state| {
            self.fill_record(
                &client,
                ArtifactKind::Struct,
                &ArtifactId::from(name),
                &state,
                members,
                |r| match r {
                    ArtifactRecord::Struct(s) => self.decompiler.apply_struct(s, header, members),
                    _ => false,
                },
            )
        });
        self.fill_boundary("struct", result)
    }

    /// Declare every struct first, then fill members, so structs that
    /// reference each other resolve.
    pub fn fill_structs(&self, user: Option<&str>, state: Option<&State>) -> SyncResult<bool> {
        let client = self.client()?;
        let state = match self.resolve_state(&client, user, state) {
            Ok(state) => state,
            Err(e) => return self.fill_boundary("structs", Err(e)),
        };
        let names: Vec<String> = state.structs().keys().cloned().collect();
        let mut changes = false;
        for name in &names {
            changes |= self.fill_struct(name, user, Some(&*state), true, false)?;
        }
        for name in &names {
            changes |= self.fill_struct(name, user, Some(&*state), false, true)?;
        }
        Ok(changes)
    }

    /// Apply `user`'s global variable at `addr` and record it in master.
    pub fn fill_global_var(
        &self,
        addr: u64,
        user: Option<&str>,
        state: Option<&State>,
    ) -> SyncResult<bool> {
        let client = self.client()?;
        let result = self.resolve_state(&client, user, state).and_then(|state| {
            self.fill_record(
                &client,
                ArtifactKind::GlobalVariable,
                &ArtifactId::Addr(addr),
                &state,
                true,
                |r| self.apply_record(r),
            )
        });
        self.fill_boundary("global variable", result)
    }

    /// Fill every global variable `user` recorded.
    pub fn fill_global_vars(&self, user: Option<&str>, state: Option<&State>) -> SyncResult<bool> {
        let client = self.client()?;
        let state = match self.resolve_state(&client, user, state) {
            Ok(state) => state,
            Err(e) => return self.fill_boundary("global variables", Err(e)),
        };
        let mut changes = false;
        for addr in state.global_vars().keys() {
            changes |= self.fill_global_var(*addr, user, Some(&*state))?;
        }
        Ok(changes)
    }

    /// Apply `user`'s enum `name` and record it in master.
    pub fn fill_enum(&self, name: &str, user: Option<&str>, state: Option<&State>) -> SyncResult<bool> {
        let client = self.client()?;
        let result = self.resolve_state(&client, user, state).and_then(|state| {
            self.fill_record(
                &client,
                ArtifactKind::Enum,
                &ArtifactId::from(name),
                &state,
                true,
                |r| self.apply_record(r),
            )
        });
        self.fill_boundary("enum", result)
    }

    /// Fill every enum `user` recorded.
    pub fn fill_enums(&self, user: Option<&str>, state: Option<&State>) -> SyncResult<bool> {
        let client = self.client()?;
        let state = match self.resolve_state(&client, user, state) {
            Ok(state) => state,
            Err(e) => return self.fill_boundary("enums", Err(e)),
        };
        let mut changes = false;
        for name in state.enums().keys() {
            changes |= self.fill_enum(name, user, Some(&*state))?;
        }
        Ok(changes)
    }

    /// Fill everything `user` has: structs, enums, global variables, then
    /// functions.
    pub fn fill_all(&self, user: Option<&str>) -> SyncResult<bool> {
        let client = self.client()?;
        info!(user = user.unwrap_or(client.master_user()), "filling all artifacts");
        let state = match self.resolve_state(&client, user, None) {
            Ok(state) => state,
            Err(e) => return self.fill_boundary("all", Err(e)),
        };
        let mut changes = self.fill_structs(user, Some(&*state))?;
        changes |= self.fill_enums(user, Some(&*state))?;
        changes |= self.fill_global_vars(user, Some(&*state))?;
        changes |= self.fill_functions(user, Some(&*state))?;
        Ok(changes)
    }

    //
    // magic sync
    //

    /// Every identifier of `kind` present in any user's state.
    pub fn changed_artifacts_of_type(&self, kind: ArtifactKind) -> SyncResult<BTreeSet<ArtifactId>> {
        let client = self.client()?;
        if !MAGIC_SYNC_KINDS.contains(&kind) {
            info!(%kind, "changed artifacts requested for an unsupported kind");
            return Ok(BTreeSet::new());
        }
        let mut ids = BTreeSet::new();
        for user in client.users(SchedSpeed::Fast)? {
            match client.get_state(Some(&user.name), None, SchedSpeed::Fast, false) {
                Ok(state) => ids.extend(state.ids_of_kind(kind)),
                Err(e) => warn!(user = %user.name, error = %e, "skipping unreadable state"),
            }
        }
        Ok(ids)
    }

    /// Fold every user's artifacts into master with the non-conflicting
    /// merge, starting from `preference_user` (master by default), and
    /// apply the results to the decompiler.
    ///
    /// Users after the preference are folded in repository enumeration
    /// order, so with disagreeing values the outcome depends on who
    /// pushed.
    pub fn magic_fill(&self, preference_user: Option<&str>) -> SyncResult<bool> {
        let client = self.client()?;
        let preference = preference_user.unwrap_or(client.master_user()).to_string();
        info!(preference = %preference, "starting magic sync");

        let load = |name: &str| match client.get_state(Some(name), None, SchedSpeed::Fast, false) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(user = name, error = %e, "skipping unreadable state");
                None
            }
        };
        let preferred = load(preference.as_str()).unwrap_or_else(|| State::new(preference.clone()));
        let others: Vec<State> = client
            .users(SchedSpeed::Fast)?
            .into_iter()
            .filter(|u| u.name != preference)
            .filter_map(|u| load(u.name.as_str()))
            .collect();

        let mut master = client.master_state()?;
        let mut changes = false;
        for kind in MAGIC_SYNC_KINDS {
            info!(%kind, "magic syncing");
            let ids: BTreeSet<ArtifactId> = std::iter::once(&preferred)
                .chain(&others)
                .flat_map(|s| s.ids_of_kind(kind))
                .collect();

            let mut merged_any = false;
            for id in &ids {
                let mut folded = preferred.get_artifact(kind, id).ok();
                for state in &others {
                    let Ok(theirs) = state.get_artifact(kind, id) else {
                        continue;
                    };
                    folded = Some(match folded {
                        Some(acc) => acc.merge_nonconflicting(&theirs).unwrap_or(acc),
                        None => theirs,
                    });
                }
                let Some(mut folded) = folded else {
                    continue;
                };
                folded.set_last_change(ChangeStamp::UNSET);
                changes |= self.apply_record(&self.lifter.lower(folded.clone()));
                merged_any |= master.set_artifact(folded, Stamp::Keep);
            }
            if merged_any {
                let message = format!("Magic synced {} {kind} artifacts", ids.len());
                match client.commit_state(&mut master, &message) {
                    Ok(committed) => changes |= committed,
                    Err(e) => warn!(%kind, error = %e, "failed to commit magic sync"),
                }
            }
        }
        info!("magic sync completed");
        Ok(changes)
    }

    //
    // force push
    //

    /// Commit the function as the decompiler currently shows it.
    pub fn force_push_function(&self, addr: u64) -> SyncResult<bool> {
        let client = self.client()?;
        let Some(func) = self.decompiler.function(addr) else {
            info!(addr, "force push failed: no such function in the decompiler");
            return Ok(false);
        };
        let mut master = client.master_state()?;
        let message = format!("Force pushed function {addr:#x}");
        self.push_artifact(func.into(), &mut master, Some(&message), Stamp::Now)
    }

    /// Live global artifact: an address names a global variable, a name a
    /// struct or (failing that) an enum.
    pub fn global_artifact(&self, lookup: &ArtifactId) -> Option<ArtifactRecord> {
        match lookup {
            ArtifactId::Addr(addr) => self.decompiler.global_var(*addr).map(Into::into),
            ArtifactId::Name(name) => self
                .decompiler
                .struct_by_name(name)
                .map(Into::into)
                .or_else(|| self.decompiler.enum_by_name(name).map(Into::into)),
            ArtifactId::StackSlot { .. } => None,
        }
    }

    /// Every live struct, global variable and enum.
    pub fn global_artifacts(&self) -> Vec<ArtifactRecord> {
        let dec = &self.decompiler;
        dec.structs()
            .into_values()
            .map(ArtifactRecord::from)
            .chain(dec.global_vars().into_values().map(ArtifactRecord::from))
            .chain(dec.enums().into_values().map(ArtifactRecord::from))
            .collect()
    }

    /// Commit a live global artifact as the decompiler currently shows it.
    pub fn force_push_global_artifact(&self, lookup: &ArtifactId) -> SyncResult<bool> {
        let client = self.client()?;
        let Some(artifact) = self.global_artifact(lookup) else {
            info!(%lookup, "force push failed: no such global artifact in the decompiler");
            return Ok(false);
        };
        let mut master = client.master_state()?;
        let message = format!("Force pushed {artifact}");
        self.push_artifact(artifact, &mut master, Some(&message), Stamp::Now)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Some(mut updater) = lock(&self.updater).take() {
            updater.stop();
        }
    }
}
