//! The seam between the sync engine and a host analysis tool.
//!
//! A tool bridge implements [`DecompilerInterface`]: live accessors report
//! what the tool currently shows (native form), and the `apply_*` methods
//! write synced artifacts back into it. Bridges that cannot apply a given
//! kind keep the default, which logs and reports no change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::info;

use crate::model::{
    Comment, Enum, Function, FunctionHeader, GlobalVariable, Patch, StackVariable, Struct,
};

pub trait DecompilerInterface: Send + Sync {
    /// Hash identifying the binary under analysis.
    fn binary_hash(&self) -> String;

    /// Function the user is currently looking at.
    fn active_context(&self) -> Option<Function>;

    fn binary_path(&self) -> Option<PathBuf>;

    fn get_func_size(&self, func_addr: u64) -> u64;

    fn goto_address(&self, addr: u64);

    //
    // live artifacts
    //

    fn functions(&self) -> BTreeMap<u64, Function> {
        BTreeMap::new()
    }

    fn function(&self, addr: u64) -> Option<Function> {
        self.functions().remove(&addr)
    }

    fn global_vars(&self) -> BTreeMap<u64, GlobalVariable> {
        BTreeMap::new()
    }

    fn global_var(&self, addr: u64) -> Option<GlobalVariable> {
        self.global_vars().remove(&addr)
    }

    fn structs(&self) -> BTreeMap<String, Struct> {
        BTreeMap::new()
    }

    fn struct_by_name(&self, name: &str) -> Option<Struct> {
        self.structs().remove(name)
    }

    fn enums(&self) -> BTreeMap<String, Enum> {
        BTreeMap::new()
    }

    fn enum_by_name(&self, name: &str) -> Option<Enum> {
        self.enums().remove(name)
    }

    fn patches(&self) -> BTreeMap<u64, Patch> {
        BTreeMap::new()
    }

    fn patch(&self, offset: u64) -> Option<Patch> {
        self.patches().remove(&offset)
    }

    //
    // fills
    //

    fn apply_function_header(&self, header: &FunctionHeader) -> bool {
        info!(addr = header.addr, "filling function headers is not implemented by this decompiler");
        false
    }

    fn apply_stack_variable(&self, var: &StackVariable) -> bool {
        info!(addr = var.addr, "filling stack variables is not implemented by this decompiler");
        false
    }

    fn apply_comment(&self, comment: &Comment) -> bool {
        info!(addr = comment.addr, "filling comments is not implemented by this decompiler");
        false
    }

    fn apply_global_var(&self, gvar: &GlobalVariable) -> bool {
        info!(addr = gvar.addr, "filling global variables is not implemented by this decompiler");
        false
    }

    /// The header pass declares the type (name and size); the members pass
    /// fills its layout.
    fn apply_struct(&self, s: &Struct, _header: bool, _members: bool) -> bool {
        info!(name = %s.name, "filling structs is not implemented by this decompiler");
        false
    }

    fn apply_enum(&self, e: &Enum) -> bool {
        info!(name = %e.name, "filling enums is not implemented by this decompiler");
        false
    }
}

#[derive(Debug, Default)]
struct Workspace {
    functions: BTreeMap<u64, Function>,
    comments: BTreeMap<u64, Comment>,
    global_vars: BTreeMap<u64, GlobalVariable>,
    structs: BTreeMap<String, Struct>,
    enums: BTreeMap<String, Enum>,
    patches: BTreeMap<u64, Patch>,
    cursor: Option<u64>,
}

fn replace<K: Ord, V: PartialEq>(map: &mut BTreeMap<K, V>, key: K, value: V) -> bool {
    if map.get(&key) == Some(&value) {
        return false;
    }
    map.insert(key, value);
    true
}

/// A tool-less decompiler holding artifacts in memory.
///
/// Used for headless syncing and for exercising the controller: live
/// accessors read what was inserted or applied, fills write into it.
#[derive(Debug, Default)]
pub struct HeadlessDecompiler {
    binary_hash: String,
    binary_path: Option<PathBuf>,
    workspace: Mutex<Workspace>,
}

impl HeadlessDecompiler {
    pub fn new(binary_hash: impl Into<String>) -> Self {
        Self { binary_hash: binary_hash.into(), ..Self::default() }
    }

    /// Headless session over a binary on disk, hashed with SHA-256.
    pub fn for_binary(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            binary_hash: crate::config::sha256_file(path)?,
            binary_path: Some(path.to_path_buf()),
            workspace: Mutex::default(),
        })
    }

    fn ws(&self) -> MutexGuard<'_, Workspace> {
        self.workspace.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_function(&self, func: Function) {
        self.ws().functions.insert(func.addr, func);
    }

    pub fn insert_global_var(&self, gvar: GlobalVariable) {
        self.ws().global_vars.insert(gvar.addr, gvar);
    }

    pub fn insert_struct(&self, s: Struct) {
        self.ws().structs.insert(s.name.clone(), s);
    }

    pub fn insert_enum(&self, e: Enum) {
        self.ws().enums.insert(e.name.clone(), e);
    }

    pub fn insert_patch(&self, patch: Patch) {
        self.ws().patches.insert(patch.offset, patch);
    }

    pub fn comments(&self) -> BTreeMap<u64, Comment> {
        self.ws().comments.clone()
    }

    /// Position the cursor, making the enclosing function the active context.
    pub fn set_cursor(&self, addr: Option<u64>) {
        self.ws().cursor = addr;
    }
}

impl DecompilerInterface for HeadlessDecompiler {
    fn binary_hash(&self) -> String {
        self.binary_hash.clone()
    }

    fn active_context(&self) -> Option<Function> {
        let ws = self.ws();
        let cursor = ws.cursor?;
        ws.functions.range(..=cursor).next_back().map(|(_, f)| f).filter(|f| f.contains(cursor)).cloned()
    }

    fn binary_path(&self) -> Option<PathBuf> {
        self.binary_path.clone()
    }

    fn get_func_size(&self, func_addr: u64) -> u64 {
        self.ws().functions.get(&func_addr).map_or(0, |f| f.size)
    }

    fn goto_address(&self, addr: u64) {
        self.set_cursor(Some(addr));
    }

    fn functions(&self) -> BTreeMap<u64, Function> {
        self.ws().functions.clone()
    }

    fn function(&self, addr: u64) -> Option<Function> {
        self.ws().functions.get(&addr).cloned()
    }

    fn global_vars(&self) -> BTreeMap<u64, GlobalVariable> {
        self.ws().global_vars.clone()
    }

    fn structs(&self) -> BTreeMap<String, Struct> {
        self.ws().structs.clone()
    }

    fn enums(&self) -> BTreeMap<String, Enum> {
        self.ws().enums.clone()
    }

    fn patches(&self) -> BTreeMap<u64, Patch> {
        self.ws().patches.clone()
    }

    fn apply_function_header(&self, header: &FunctionHeader) -> bool {
        let mut ws = self.ws();
        let func = ws.functions.entry(header.addr).or_insert_with(|| Function::new(header.addr, 0));
        if func.header.as_ref() == Some(header) {
            return false;
        }
        func.header = Some(header.clone());
        true
    }

    fn apply_stack_variable(&self, var: &StackVariable) -> bool {
        let mut ws = self.ws();
        let func = ws.functions.entry(var.addr).or_insert_with(|| Function::new(var.addr, 0));
        replace(&mut func.stack_vars, var.stack_offset, var.clone())
    }

    fn apply_comment(&self, comment: &Comment) -> bool {
        replace(&mut self.ws().comments, comment.addr, comment.clone())
    }

    fn apply_global_var(&self, gvar: &GlobalVariable) -> bool {
        replace(&mut self.ws().global_vars, gvar.addr, gvar.clone())
    }

    fn apply_struct(&self, s: &Struct, header: bool, members: bool) -> bool {
        let mut ws = self.ws();
        let existing = ws.structs.get(&s.name).cloned();
        let mut target = existing.clone().unwrap_or_else(|| s.header_only());
        if header {
            target.size = s.size;
        }
        if members {
            target.members = s.members.clone();
        }
        if existing.as_ref() == Some(&target) {
            return false;
        }
        ws.structs.insert(target.name.clone(), target);
        true
    }

    fn apply_enum(&self, e: &Enum) -> bool {
        replace(&mut self.ws().enums, e.name.clone(), e.clone())
    }
}
