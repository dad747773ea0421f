//! Per-user snapshot of recorded artifacts.
//!
//! A [`State`] is what one user's namespace in the repository holds at one
//! commit. States handed out by the client for reading are independent copies;
//! the only state that is ever committed back is the one a caller obtained for
//! its own user and mutated through the `set_*` family.

pub mod wire;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};
use crate::model::{
    Artifact, ArtifactId, ArtifactKind, ArtifactRecord, ChangeStamp, Comment, Enum, Function,
    FunctionHeader, GlobalVariable, Patch, StackVariable, Struct,
};

/// Whether a `set_*` call records an interactive edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    /// Stamp the artifact (and its parent function) with the current time.
    Now,
    /// Store the artifact with whatever stamp it already carries.
    Keep,
}

/// Bookkeeping stored alongside the artifacts in `metadata.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMetadata {
    pub user: String,
    /// Number of times this state has been committed.
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_push_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_push_artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_push_kind: Option<ArtifactKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct State {
    metadata: StateMetadata,
    #[serde(skip)]
    commit: Option<String>,
    functions: BTreeMap<u64, Function>,
    comments: BTreeMap<u64, Comment>,
    global_vars: BTreeMap<u64, GlobalVariable>,
    structs: BTreeMap<String, Struct>,
    enums: BTreeMap<String, Enum>,
    patches: BTreeMap<u64, Patch>,
    #[serde(skip)]
    dirty: bool,
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.functions == other.functions
            && self.comments == other.comments
            && self.global_vars == other.global_vars
            && self.structs == other.structs
            && self.enums == other.enums
            && self.patches == other.patches
    }
}

/// Apply to `onto` every entry of `mine` that differs from `base`, and drop
/// the keys `mine` removed.
fn replay<K: Ord + Clone, V: Clone + PartialEq>(
    mine: &BTreeMap<K, V>,
    base: &BTreeMap<K, V>,
    onto: &mut BTreeMap<K, V>,
) {
    for (key, value) in mine {
        if base.get(key) != Some(value) {
            onto.insert(key.clone(), value.clone());
        }
    }
    for key in base.keys() {
        if !mine.contains_key(key) {
            onto.remove(key);
        }
    }
}

fn not_found(kind: ArtifactKind, id: impl Into<ArtifactId>) -> StateError {
    StateError::NotFound { kind, id: id.into() }
}

impl State {
    /// Empty, never-committed state owned by `user`.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            metadata: StateMetadata { user: user.into(), ..StateMetadata::default() },
            commit: None,
            functions: BTreeMap::new(),
            comments: BTreeMap::new(),
            global_vars: BTreeMap::new(),
            structs: BTreeMap::new(),
            enums: BTreeMap::new(),
            patches: BTreeMap::new(),
            dirty: false,
        }
    }

    pub fn user(&self) -> &str {
        &self.metadata.user
    }

    pub fn version(&self) -> u64 {
        self.metadata.version
    }

    /// Bookkeeping written to `metadata.toml`.
    pub fn metadata(&self) -> &StateMetadata {
        &self.metadata
    }

    /// Commit id this state was loaded from, if any.
    pub fn commit(&self) -> Option<&str> {
        self.commit.as_deref()
    }

    /// True after any `set_*` that changed something since the last save.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
            && self.comments.is_empty()
            && self.global_vars.is_empty()
            && self.structs.is_empty()
            && self.enums.is_empty()
            && self.patches.is_empty()
    }

    pub(crate) fn set_commit(&mut self, commit: Option<String>) {
        self.commit = commit;
    }

    /// Called once the state has been written to the store.
    pub(crate) fn mark_saved(&mut self, commit: String) {
        self.commit = Some(commit);
        self.dirty = false;
    }

    pub(crate) fn bump_version(&mut self) {
        self.metadata.version += 1;
    }

    /// Replay the edits that turned `base` into `self` on top of `onto`.
    ///
    /// Used when `self` was loaded from an older commit than the branch tip:
    /// artifacts `self` added, changed or removed relative to `base` win, and
    /// everything else keeps the value in `onto`. Functions are replayed part
    /// by part so a header edit does not undo a concurrent stack-variable edit.
    pub(crate) fn rebased(&self, base: &State, mut onto: State) -> State {
        for (addr, mine) in &self.functions {
            let before = base.functions.get(addr);
            if before == Some(mine) {
                continue;
            }
            let Some(target) = onto.functions.get_mut(addr) else {
                onto.functions.insert(*addr, mine.clone());
                continue;
            };
            if before.map(|f| f.size) != Some(mine.size) {
                target.size = mine.size;
            }
            if before.and_then(|f| f.header.as_ref()) != mine.header.as_ref() {
                target.header = mine.header.clone();
            }
            let empty = BTreeMap::new();
            let base_vars = before.map_or(&empty, |f| &f.stack_vars);
            replay(&mine.stack_vars, base_vars, &mut target.stack_vars);
            target.last_change = mine.last_change;
        }
        for addr in base.functions.keys() {
            if !self.functions.contains_key(addr) {
                onto.functions.remove(addr);
            }
        }
        replay(&self.comments, &base.comments, &mut onto.comments);
        replay(&self.global_vars, &base.global_vars, &mut onto.global_vars);
        replay(&self.structs, &base.structs, &mut onto.structs);
        replay(&self.enums, &base.enums, &mut onto.enums);
        replay(&self.patches, &base.patches, &mut onto.patches);

        if self.metadata.last_push_time != base.metadata.last_push_time {
            onto.metadata.last_push_time = self.metadata.last_push_time;
            onto.metadata.last_push_artifact = self.metadata.last_push_artifact.clone();
            onto.metadata.last_push_kind = self.metadata.last_push_kind;
        }
        onto.dirty = true;
        onto
    }

    fn touch(&mut self, kind: ArtifactKind, id: &ArtifactId, stamp: Stamp) {
        self.dirty = true;
        if stamp == Stamp::Now {
            self.metadata.last_push_time = ChangeStamp::now().get();
            self.metadata.last_push_artifact = Some(id.to_string());
            self.metadata.last_push_kind = Some(kind);
        }
    }

    fn touch_function(&mut self, addr: u64, stamp: Stamp) {
        if stamp == Stamp::Now {
            if let Some(func) = self.functions.get_mut(&addr) {
                func.last_change = ChangeStamp::now();
            }
        }
    }

    fn ensure_function(&mut self, addr: u64) -> &mut Function {
        self.functions.entry(addr).or_insert_with(|| Function::new(addr, 0))
    }

    //
    // functions
    //

    /// Every function, keyed by address.
    pub fn functions(&self) -> &BTreeMap<u64, Function> {
        &self.functions
    }

    /// The function at `addr`, with its header and stack variables.
    pub fn get_function(&self, addr: u64) -> StateResult<&Function> {
        self.functions.get(&addr).ok_or_else(|| not_found(ArtifactKind::Function, addr))
    }

    /// Store a whole function, replacing header and stack frame. Returns
    /// false when the stored value is already equal.
    pub fn set_function(&mut self, mut func: Function, stamp: Stamp) -> bool {
        if self.functions.get(&func.addr) == Some(&func) {
            return false;
        }
        if stamp == Stamp::Now {
            func.last_change = ChangeStamp::now();
        }
        let id = func.id();
        self.functions.insert(func.addr, func);
        self.touch(ArtifactKind::Function, &id, stamp);
        true
    }

    /// Header of the function at `addr`.
    pub fn get_function_header(&self, addr: u64) -> StateResult<&FunctionHeader> {
        self.functions
            .get(&addr)
            .and_then(|f| f.header.as_ref())
            .ok_or_else(|| not_found(ArtifactKind::FunctionHeader, addr))
    }

    /// Store a header, creating its parent function if needed.
    pub fn set_function_header(&mut self, mut header: FunctionHeader, stamp: Stamp) -> bool {
        let addr = header.addr;
        if self.functions.get(&addr).and_then(|f| f.header.as_ref()) == Some(&header) {
            return false;
        }
        if stamp == Stamp::Now {
            header.last_change = ChangeStamp::now();
        }
        let id = header.id();
        self.ensure_function(addr).header = Some(header);
        self.touch_function(addr, stamp);
        self.touch(ArtifactKind::FunctionHeader, &id, stamp);
        true
    }

    /// Stack variable at `offset` in the frame of `func_addr`.
    pub fn get_stack_variable(&self, func_addr: u64, offset: i64) -> StateResult<&StackVariable> {
        self.functions.get(&func_addr).and_then(|f| f.stack_vars.get(&offset)).ok_or_else(|| {
            not_found(ArtifactKind::StackVariable, ArtifactId::StackSlot { func_addr, offset })
        })
    }

    /// The whole stack frame of `func_addr`.
    pub fn get_stack_variables(&self, func_addr: u64) -> StateResult<&BTreeMap<i64, StackVariable>> {
        self.functions
            .get(&func_addr)
            .map(|f| &f.stack_vars)
            .ok_or_else(|| not_found(ArtifactKind::StackVariable, func_addr))
    }

    /// Store a stack variable, creating its parent function if needed.
    pub fn set_stack_variable(&mut self, mut var: StackVariable, stamp: Stamp) -> bool {
        let (addr, offset) = (var.addr, var.stack_offset);
        if self.functions.get(&addr).and_then(|f| f.stack_vars.get(&offset)) == Some(&var) {
            return false;
        }
        if stamp == Stamp::Now {
            var.last_change = ChangeStamp::now();
        }
        let id = var.id();
        self.ensure_function(addr).stack_vars.insert(offset, var);
        self.touch_function(addr, stamp);
        self.touch(ArtifactKind::StackVariable, &id, stamp);
        true
    }

    /// The function whose `[addr, addr + size]` range contains `addr`.
    pub fn find_func_for_addr(&self, addr: u64) -> Option<&Function> {
        self.functions.range(..=addr).next_back().map(|(_, f)| f).filter(|f| f.contains(addr))
    }

    //
    // comments
    //

    pub fn comments(&self) -> &BTreeMap<u64, Comment> {
        &self.comments
    }

    /// Comment at `addr`.
    pub fn get_comment(&self, addr: u64) -> StateResult<&Comment> {
        self.comments.get(&addr).ok_or_else(|| not_found(ArtifactKind::Comment, addr))
    }

    /// Comments that fall inside the function at `func_addr`.
    pub fn get_func_comments(&self, func_addr: u64) -> Vec<&Comment> {
        let Some(func) = self.functions.get(&func_addr) else {
            return Vec::new();
        };
        let end = func.addr.saturating_add(func.size);
        self.comments.range(func.addr..=end).map(|(_, c)| c).collect()
    }

    /// Store a comment; an interactive edit also stamps the enclosing function.
    pub fn set_comment(&mut self, mut comment: Comment, stamp: Stamp) -> bool {
        if self.comments.get(&comment.addr) == Some(&comment) {
            return false;
        }
        if stamp == Stamp::Now {
            comment.last_change = ChangeStamp::now();
        }
        let owner = comment
            .func_addr
            .or_else(|| self.find_func_for_addr(comment.addr).map(|f| f.addr));
        let id = comment.id();
        self.comments.insert(comment.addr, comment);
        if let Some(func_addr) = owner {
            self.touch_function(func_addr, stamp);
        }
        self.touch(ArtifactKind::Comment, &id, stamp);
        true
    }

    //
    // global variables
    //

    pub fn global_vars(&self) -> &BTreeMap<u64, GlobalVariable> {
        &self.global_vars
    }

    /// Global variable at `addr`.
    pub fn get_global_var(&self, addr: u64) -> StateResult<&GlobalVariable> {
        self.global_vars.get(&addr).ok_or_else(|| not_found(ArtifactKind::GlobalVariable, addr))
    }

    /// Store a global variable. Returns whether anything changed.
    pub fn set_global_var(&mut self, mut gvar: GlobalVariable, stamp: Stamp) -> bool {
        if self.global_vars.get(&gvar.addr) == Some(&gvar) {
            return false;
        }
        if stamp == Stamp::Now {
            gvar.last_change = ChangeStamp::now();
        }
        let id = gvar.id();
        self.global_vars.insert(gvar.addr, gvar);
        self.touch(ArtifactKind::GlobalVariable, &id, stamp);
        true
    }

    //
    // structs
    //

    pub fn structs(&self) -> &BTreeMap<String, Struct> {
        &self.structs
    }

    /// Struct named `name`.
    pub fn get_struct(&self, name: &str) -> StateResult<&Struct> {
        self.structs.get(name).ok_or_else(|| not_found(ArtifactKind::Struct, name))
    }

    /// Store a struct; when `old_name` differs from the new name the entry
    /// under the old name is removed.
    pub fn set_struct(&mut self, mut s: Struct, old_name: Option<&str>, stamp: Stamp) -> bool {
        let renamed = old_name.is_some_and(|old| old != s.name && self.structs.contains_key(old));
        if !renamed && self.structs.get(&s.name) == Some(&s) {
            return false;
        }
        if let Some(old) = old_name.filter(|_| renamed) {
            self.structs.remove(old);
        }
        if stamp == Stamp::Now {
            s.last_change = ChangeStamp::now();
        }
        let id = s.id();
        self.structs.insert(s.name.clone(), s);
        self.touch(ArtifactKind::Struct, &id, stamp);
        true
    }

    //
    // enums
    //

    pub fn enums(&self) -> &BTreeMap<String, Enum> {
        &self.enums
    }

    /// Enum named `name`.
    pub fn get_enum(&self, name: &str) -> StateResult<&Enum> {
        self.enums.get(name).ok_or_else(|| not_found(ArtifactKind::Enum, name))
    }

    /// Store an enum. Returns whether anything changed.
    pub fn set_enum(&mut self, mut e: Enum, stamp: Stamp) -> bool {
        if self.enums.get(&e.name) == Some(&e) {
            return false;
        }
        if stamp == Stamp::Now {
            e.last_change = ChangeStamp::now();
        }
        let id = e.id();
        self.enums.insert(e.name.clone(), e);
        self.touch(ArtifactKind::Enum, &id, stamp);
        true
    }

    //
    // patches
    //

    pub fn patches(&self) -> &BTreeMap<u64, Patch> {
        &self.patches
    }

    /// Patch at file `offset`.
    pub fn get_patch(&self, offset: u64) -> StateResult<&Patch> {
        self.patches.get(&offset).ok_or_else(|| not_found(ArtifactKind::Patch, offset))
    }

    /// Store a patch. Returns whether anything changed.
    pub fn set_patch(&mut self, mut patch: Patch, stamp: Stamp) -> bool {
        if self.patches.get(&patch.offset) == Some(&patch) {
            return false;
        }
        if stamp == Stamp::Now {
            patch.last_change = ChangeStamp::now();
        }
        let id = patch.id();
        self.patches.insert(patch.offset, patch);
        self.touch(ArtifactKind::Patch, &id, stamp);
        true
    }

    //
    // kind-generic access
    //

    /// Look up any artifact by kind and identifier.
    pub fn get_artifact(&self, kind: ArtifactKind, id: &ArtifactId) -> StateResult<ArtifactRecord> {
        let missing = || not_found(kind, id.clone());
        let record = match (kind, id) {
            (ArtifactKind::Function, ArtifactId::Addr(a)) => self.get_function(*a)?.clone().into(),
            (ArtifactKind::FunctionHeader, ArtifactId::Addr(a)) => {
                self.get_function_header(*a)?.clone().into()
            }
            (ArtifactKind::StackVariable, ArtifactId::StackSlot { func_addr, offset }) => {
                self.get_stack_variable(*func_addr, *offset)?.clone().into()
            }
            (ArtifactKind::Comment, ArtifactId::Addr(a)) => self.get_comment(*a)?.clone().into(),
            (ArtifactKind::GlobalVariable, ArtifactId::Addr(a)) => {
                self.get_global_var(*a)?.clone().into()
            }
            (ArtifactKind::Struct, ArtifactId::Name(n)) => self.get_struct(n)?.clone().into(),
            (ArtifactKind::Enum, ArtifactId::Name(n)) => self.get_enum(n)?.clone().into(),
            (ArtifactKind::Patch, ArtifactId::Addr(a)) => self.get_patch(*a)?.clone().into(),
            _ => return Err(missing()),
        };
        Ok(record)
    }

    /// Store any artifact through the matching typed setter.
    pub fn set_artifact(&mut self, record: ArtifactRecord, stamp: Stamp) -> bool {
        match record {
            ArtifactRecord::Function(f) => self.set_function(f, stamp),
            ArtifactRecord::FunctionHeader(h) => self.set_function_header(h, stamp),
            ArtifactRecord::StackVariable(v) => self.set_stack_variable(v, stamp),
            ArtifactRecord::Comment(c) => self.set_comment(c, stamp),
            ArtifactRecord::GlobalVariable(g) => self.set_global_var(g, stamp),
            ArtifactRecord::Struct(s) => self.set_struct(s, None, stamp),
            ArtifactRecord::Enum(e) => self.set_enum(e, stamp),
            ArtifactRecord::Patch(p) => self.set_patch(p, stamp),
        }
    }

    /// Every identifier of `kind` present in this state.
    pub fn ids_of_kind(&self, kind: ArtifactKind) -> Vec<ArtifactId> {
        match kind {
            ArtifactKind::Function => self.functions.keys().map(|a| ArtifactId::Addr(*a)).collect(),
            ArtifactKind::FunctionHeader => self
                .functions
                .values()
                .filter(|f| f.header.is_some())
                .map(|f| ArtifactId::Addr(f.addr))
                .collect(),
            ArtifactKind::StackVariable => self
                .functions
                .values()
                .flat_map(|f| f.stack_vars.values().map(|v| v.id()))
                .collect(),
            ArtifactKind::Comment => self.comments.keys().map(|a| ArtifactId::Addr(*a)).collect(),
            ArtifactKind::GlobalVariable => {
                self.global_vars.keys().map(|a| ArtifactId::Addr(*a)).collect()
            }
            ArtifactKind::Struct => self.structs.keys().cloned().map(ArtifactId::Name).collect(),
            ArtifactKind::Enum => self.enums.keys().cloned().map(ArtifactId::Name).collect(),
            ArtifactKind::Patch => self.patches.keys().map(|a| ArtifactId::Addr(*a)).collect(),
        }
    }

    /// The most recently stamped artifact of `kind`, if any carries a stamp.
    pub fn last_push_for_kind(&self, kind: ArtifactKind) -> Option<ArtifactRecord> {
        self.ids_of_kind(kind)
            .iter()
            .filter_map(|id| self.get_artifact(kind, id).ok())
            .filter_map(|record| record.last_change().get().map(|t| (t, record)))
            .max_by_key(|(t, _)| *t)
            .map(|(_, record)| record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FunctionArgument, StructMember};

    #[test]
    fn setting_identical_content_twice_reports_no_change() {
        let mut state = State::new("alice");
        let header = FunctionHeader::named(0x1000, "parse").with_ret_type("int");
        assert!(state.set_function_header(header.clone(), Stamp::Now));
        assert!(state.is_dirty());
        assert!(!state.set_function_header(header, Stamp::Now));
    }

    #[test]
    fn header_creates_parent_function_lazily() {
        let mut state = State::new("alice");
        let header = FunctionHeader::named(0x2000, "main")
            .with_arg(FunctionArgument::new(0, "argc", "int", 4));
        state.set_function_header(header, Stamp::Keep);
        let func = state.get_function(0x2000).expect("parent function");
        assert_eq!(func.name(), Some("main"));
        assert!(func.last_change.is_unset());
    }

    #[test]
    fn interactive_sets_stamp_artifact_and_metadata() {
        let mut state = State::new("alice");
        state.set_function(Function::new(0x1000, 0x40), Stamp::Keep);
        state.set_comment(Comment::new(0x1010, "loop head"), Stamp::Now);

        assert!(state.get_comment(0x1010).unwrap().last_change.get().is_some());
        assert!(state.get_function(0x1000).unwrap().last_change.get().is_some());
        assert_eq!(state.metadata().last_push_kind, Some(ArtifactKind::Comment));
        assert_eq!(state.metadata().last_push_artifact.as_deref(), Some("0x1010"));
    }

    #[test]
    fn missing_lookups_return_not_found() {
        let state = State::new("alice");
        let err = state.get_struct("Node").unwrap_err();
        assert_eq!(
            err,
            StateError::NotFound { kind: ArtifactKind::Struct, id: ArtifactId::from("Node") }
        );
        assert!(state.get_stack_variable(0x10, -8).is_err());
    }

    #[test]
    fn struct_rename_drops_old_entry() {
        let mut state = State::new("alice");
        let node = Struct::new("Node", 8).with_member(StructMember::new(0, "next", "Node*", 8));
        state.set_struct(node.clone(), None, Stamp::Keep);

        let mut renamed = node;
        renamed.name = "ListNode".to_string();
        assert!(state.set_struct(renamed, Some("Node"), Stamp::Keep));
        assert!(state.get_struct("Node").is_err());
        assert!(state.get_struct("ListNode").is_ok());
    }

    #[test]
    fn func_comments_are_bounded_by_function_range() {
        let mut state = State::new("alice");
        state.set_function(Function::new(0x1000, 0x20), Stamp::Keep);
        state.set_comment(Comment::new(0x1004, "in"), Stamp::Keep);
        state.set_comment(Comment::new(0x1020, "edge"), Stamp::Keep);
        state.set_comment(Comment::new(0x1030, "out"), Stamp::Keep);

        let texts: Vec<&str> =
            state.get_func_comments(0x1000).iter().map(|c| c.comment.as_str()).collect();
        assert_eq!(texts, ["in", "edge"]);
        assert_eq!(state.find_func_for_addr(0x1010).map(|f| f.addr), Some(0x1000));
        assert!(state.find_func_for_addr(0x1030).is_none());
    }

    #[test]
    fn last_push_for_kind_picks_latest_stamp() {
        let mut state = State::new("alice");
        let mut old = GlobalVariable::new(0x10, "old");
        old.last_change = ChangeStamp::at(100);
        let mut new = GlobalVariable::new(0x20, "new");
        new.last_change = ChangeStamp::at(200);
        state.set_global_var(old, Stamp::Keep);
        state.set_global_var(new, Stamp::Keep);

        let latest = state.last_push_for_kind(ArtifactKind::GlobalVariable).unwrap();
        assert_eq!(latest.id(), ArtifactId::Addr(0x20));
        assert!(state.last_push_for_kind(ArtifactKind::Enum).is_none());
    }

    #[test]
    fn rebasing_replays_only_what_changed_since_the_base() {
        let mut base = State::new("alice");
        base.set_function(Function::new(0x1000, 0x20), Stamp::Keep);
        base.set_comment(Comment::new(0x1004, "old"), Stamp::Keep);

        let mut tip = base.clone();
        tip.set_stack_variable(StackVariable::new(0x1000, -8, "i", "int", 4), Stamp::Keep);
        tip.set_comment(Comment::new(0x1004, "tip wins"), Stamp::Keep);

        let mut mine = base.clone();
        mine.set_function_header(FunctionHeader::named(0x1000, "main"), Stamp::Now);
        mine.set_enum(Enum::new("Color", [("RED", 0)]), Stamp::Now);

        let rebased = mine.rebased(&base, tip);
        let func = rebased.get_function(0x1000).unwrap();
        assert_eq!(func.name(), Some("main"));
        assert!(func.stack_vars.contains_key(&-8));
        assert_eq!(rebased.get_comment(0x1004).unwrap().comment, "tip wins");
        assert!(rebased.get_enum("Color").is_ok());
        assert!(rebased.is_dirty());
        assert_eq!(rebased.metadata().last_push_kind, Some(ArtifactKind::Enum));
    }
}
