//! On-disk (in-tree) format of a [`State`].
//!
//! A state is a small set of TOML files, laid out so that a `git diff`
//! between two commits of one user reads naturally:
//!
//! ```text
//! metadata.toml
//! functions/00001000.toml
//! structs/Node.toml
//! comments.toml
//! global_vars.toml
//! enums.toml
//! patches.toml
//! ```
//!
//! Files are user-editable, so decoding is tolerant: an unreadable file or
//! record is skipped with a warning and everything else still loads.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::{State, StateMetadata};
use crate::error::{SyncError, SyncResult};
use crate::model::{Comment, Enum, Function, GlobalVariable, Patch, Struct};

pub const METADATA_FILE: &str = "metadata.toml";
pub const FUNCTIONS_DIR: &str = "functions";
pub const STRUCTS_DIR: &str = "structs";
pub const COMMENTS_FILE: &str = "comments.toml";
pub const GLOBAL_VARS_FILE: &str = "global_vars.toml";
pub const ENUMS_FILE: &str = "enums.toml";
pub const PATCHES_FILE: &str = "patches.toml";

/// Serialized state: tree path (with `/` separators) to file contents.
pub type StateFiles = BTreeMap<String, Vec<u8>>;

fn to_toml<T: Serialize>(path: &str, value: &T) -> SyncResult<Vec<u8>> {
    toml::to_string(value)
        .map(String::into_bytes)
        .map_err(|e| SyncError::MalformedArtifact { path: path.to_string(), reason: e.to_string() })
}

fn addr_key(addr: u64) -> String {
    format!("{addr:#x}")
}

/// File name for a struct.
///
/// Path separators cannot appear in a tree entry: `/`, `\` and `%` are
/// percent-encoded so that distinct names never share a file.
pub fn struct_file_name(name: &str) -> String {
    let mut safe = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '%' => safe.push_str("%25"),
            '/' => safe.push_str("%2F"),
            '\\' => safe.push_str("%5C"),
            c => safe.push(c),
        }
    }
    format!("{STRUCTS_DIR}/{safe}.toml")
}

pub fn function_file_name(addr: u64) -> String {
    format!("{FUNCTIONS_DIR}/{addr:08x}.toml")
}

/// Render a state into its file set.
pub fn encode(state: &State) -> SyncResult<StateFiles> {
    let mut files = StateFiles::new();
    files.insert(METADATA_FILE.to_string(), to_toml(METADATA_FILE, &state.metadata)?);

    for func in state.functions.values() {
        let path = function_file_name(func.addr);
        let bytes = to_toml(&path, func)?;
        files.insert(path, bytes);
    }
    for s in state.structs.values() {
        let path = struct_file_name(&s.name);
        let bytes = to_toml(&path, s)?;
        files.insert(path, bytes);
    }

    if !state.comments.is_empty() {
        let table: BTreeMap<String, &Comment> =
            state.comments.iter().map(|(addr, v)| (addr_key(*addr), v)).collect();
        files.insert(COMMENTS_FILE.to_string(), to_toml(COMMENTS_FILE, &table)?);
    }
    if !state.global_vars.is_empty() {
        let table: BTreeMap<String, &GlobalVariable> =
            state.global_vars.iter().map(|(addr, v)| (addr_key(*addr), v)).collect();
        files.insert(GLOBAL_VARS_FILE.to_string(), to_toml(GLOBAL_VARS_FILE, &table)?);
    }
    if !state.enums.is_empty() {
        files.insert(ENUMS_FILE.to_string(), to_toml(ENUMS_FILE, &state.enums)?);
    }
    if !state.patches.is_empty() {
        let table: BTreeMap<String, &Patch> =
            state.patches.iter().map(|(addr, v)| (addr_key(*addr), v)).collect();
        files.insert(PATCHES_FILE.to_string(), to_toml(PATCHES_FILE, &table)?);
    }
    Ok(files)
}

fn parse_file<T: DeserializeOwned>(path: &str, bytes: &[u8]) -> Option<T> {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            warn!(path, error = %e, "skipping non-UTF-8 state file");
            return None;
        }
    };
    match toml::from_str(text) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path, error = %e, "skipping malformed state file");
            None
        }
    }
}

/// Parse a table of records, skipping the ones that do not decode.
fn parse_records<T: DeserializeOwned>(path: &str, bytes: &[u8]) -> Vec<T> {
    let Some(table) = parse_file::<toml::Table>(path, bytes) else {
        return Vec::new();
    };
    table
        .into_iter()
        .filter_map(|(key, value)| match value.try_into::<T>() {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path, record = %key, error = %e, "skipping malformed record");
                None
            }
        })
        .collect()
}

/// Rebuild a state from its file set.
///
/// `user` is used when `metadata.toml` is missing or unreadable. Unknown
/// paths are ignored.
pub fn decode<'a, I>(user: &str, files: I) -> State
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut state = State::new(user);
    for (path, bytes) in files {
        match path {
            METADATA_FILE => {
                if let Some(meta) = parse_file::<StateMetadata>(path, bytes) {
                    state.metadata = meta;
                }
            }
            COMMENTS_FILE => {
                for c in parse_records::<Comment>(path, bytes) {
                    state.comments.insert(c.addr, c);
                }
            }
            GLOBAL_VARS_FILE => {
                for g in parse_records::<GlobalVariable>(path, bytes) {
                    state.global_vars.insert(g.addr, g);
                }
            }
            ENUMS_FILE => {
                for e in parse_records::<Enum>(path, bytes) {
                    state.enums.insert(e.name.clone(), e);
                }
            }
            PATCHES_FILE => {
                for p in parse_records::<Patch>(path, bytes) {
                    state.patches.insert(p.offset, p);
                }
            }
            _ if is_entry_of(path, FUNCTIONS_DIR) => {
                if let Some(func) = parse_file::<Function>(path, bytes) {
                    state.functions.insert(func.addr, func);
                }
            }
            _ if is_entry_of(path, STRUCTS_DIR) => {
                if let Some(s) = parse_file::<Struct>(path, bytes) {
                    state.structs.insert(s.name.clone(), s);
                }
            }
            _ => {}
        }
    }
    if state.metadata.user.is_empty() {
        state.metadata.user = user.to_string();
    }
    state
}

fn is_entry_of(path: &str, dir: &str) -> bool {
    path.strip_prefix(dir)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|name| name.ends_with(".toml"))
}
