//! Core data model for recorded reverse-engineering knowledge.
//!
//! Every unit of knowledge an analyst records about a binary is an *artifact*:
//! functions (with their header and stack variables), comments, global
//! variables, structs, enums and patches. Artifacts are plain values with:
//! - a stable identity ([`ArtifactId`]) used as the key inside a user state,
//! - a [`ChangeStamp`] recording when the value was last edited interactively,
//! - structural equality that ignores the stamp,
//! - a pairwise "non-conflicting" merge used when folding many users' views.
//!
//! The merge is deliberately a heuristic: a value the caller already has wins,
//! an empty value is filled in from the other side, and keyed containers are
//! unioned key by key. Nothing is ever deleted by a merge.

mod comment;
mod enums;
mod function;
mod global_var;
mod patch;
mod structs;

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub use comment::Comment;
pub use enums::Enum;
pub use function::{Function, FunctionArgument, FunctionHeader, StackVariable};
pub use global_var::GlobalVariable;
pub use patch::Patch;
pub use structs::{Struct, StructMember};

/// Unix timestamp (seconds) of the last interactive edit of an artifact.
///
/// An unset stamp means "no attributable change", which is what machine-driven
/// fills and merged artifacts carry. All stamps compare equal to each other, so
/// deriving `PartialEq` on an artifact yields structural equality over every
/// other field.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeStamp(Option<i64>);

impl ChangeStamp {
    pub const UNSET: ChangeStamp = ChangeStamp(None);

    /// Stamp with the current wall-clock time.
    pub fn now() -> Self {
        Self(Some(Utc::now().timestamp()))
    }

    pub fn at(timestamp: i64) -> Self {
        Self(Some(timestamp))
    }

    pub fn get(self) -> Option<i64> {
        self.0
    }

    pub fn is_unset(&self) -> bool {
        self.0.is_none()
    }
}

impl PartialEq for ChangeStamp {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Eq for ChangeStamp {}

/// The closed set of artifact kinds a state can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Function,
    FunctionHeader,
    StackVariable,
    Comment,
    GlobalVariable,
    Struct,
    Enum,
    Patch,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 8] = [
        ArtifactKind::Function,
        ArtifactKind::FunctionHeader,
        ArtifactKind::StackVariable,
        ArtifactKind::Comment,
        ArtifactKind::GlobalVariable,
        ArtifactKind::Struct,
        ArtifactKind::Enum,
        ArtifactKind::Patch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Function => "function",
            ArtifactKind::FunctionHeader => "function header",
            ArtifactKind::StackVariable => "stack variable",
            ArtifactKind::Comment => "comment",
            ArtifactKind::GlobalVariable => "global variable",
            ArtifactKind::Struct => "struct",
            ArtifactKind::Enum => "enum",
            ArtifactKind::Patch => "patch",
        }
    }

    /// Parse the snake_case / spaced form produced by [`ArtifactKind::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().replace('_', " ");
        ArtifactKind::ALL.into_iter().find(|kind| kind.as_str() == normalized)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an artifact inside a state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactId {
    /// Functions, headers, comments, global variables and patches.
    Addr(u64),
    /// A stack variable: owning function plus stack offset.
    StackSlot { func_addr: u64, offset: i64 },
    /// Structs and enums.
    Name(String),
}

impl ArtifactId {
    pub fn addr(&self) -> Option<u64> {
        match self {
            ArtifactId::Addr(addr) => Some(*addr),
            ArtifactId::StackSlot { func_addr, .. } => Some(*func_addr),
            ArtifactId::Name(_) => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            ArtifactId::Name(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactId::Addr(addr) => write!(f, "{addr:#x}"),
            ArtifactId::StackSlot { func_addr, offset } => write!(f, "{func_addr:#x}[{offset}]"),
            ArtifactId::Name(name) => f.write_str(name),
        }
    }
}

impl From<u64> for ArtifactId {
    fn from(addr: u64) -> Self {
        ArtifactId::Addr(addr)
    }
}

impl From<&str> for ArtifactId {
    fn from(name: &str) -> Self {
        ArtifactId::Name(name.to_string())
    }
}

impl From<String> for ArtifactId {
    fn from(name: String) -> Self {
        ArtifactId::Name(name)
    }
}

/// Behaviour shared by every concrete artifact kind.
pub trait Artifact: Clone + PartialEq + fmt::Debug {
    const KIND: ArtifactKind;

    fn id(&self) -> ArtifactId;

    fn last_change(&self) -> ChangeStamp;

    fn set_last_change(&mut self, stamp: ChangeStamp);

    /// Human-readable commit message used when this artifact alone changes a state.
    fn commit_msg(&self) -> String {
        format!("Updated {} {}", Self::KIND, self.id())
    }

    /// Fold `remote` into `self` without overriding anything `self` has set.
    fn merge_nonconflicting(&self, remote: &Self) -> Self;

    fn into_record(self) -> ArtifactRecord;
}

/// Merge entry point tolerant of a missing remote.
///
/// Returns a copy of `local` when `remote` is absent or already equal.
pub fn merge_nonconflicting<A: Artifact>(local: &A, remote: Option<&A>) -> A {
    match remote {
        Some(remote) if remote != local => local.merge_nonconflicting(remote),
        _ => local.clone(),
    }
}

/// Any artifact, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactRecord {
    Function(Function),
    FunctionHeader(FunctionHeader),
    StackVariable(StackVariable),
    Comment(Comment),
    GlobalVariable(GlobalVariable),
    Struct(Struct),
    Enum(Enum),
    Patch(Patch),
}

macro_rules! with_record {
    ($record:expr, $inner:ident => $body:expr) => {
        match $record {
            ArtifactRecord::Function($inner) => $body,
            ArtifactRecord::FunctionHeader($inner) => $body,
            ArtifactRecord::StackVariable($inner) => $body,
            ArtifactRecord::Comment($inner) => $body,
            ArtifactRecord::GlobalVariable($inner) => $body,
            ArtifactRecord::Struct($inner) => $body,
            ArtifactRecord::Enum($inner) => $body,
            ArtifactRecord::Patch($inner) => $body,
        }
    };
}

macro_rules! record_conversions {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for ArtifactRecord {
                fn from(value: $variant) -> Self {
                    ArtifactRecord::$variant(value)
                }
            }
        )*
    };
}

record_conversions!(
    Function,
    FunctionHeader,
    StackVariable,
    Comment,
    GlobalVariable,
    Struct,
    Enum,
    Patch,
);

impl ArtifactRecord {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactRecord::Function(_) => ArtifactKind::Function,
            ArtifactRecord::FunctionHeader(_) => ArtifactKind::FunctionHeader,
            ArtifactRecord::StackVariable(_) => ArtifactKind::StackVariable,
            ArtifactRecord::Comment(_) => ArtifactKind::Comment,
            ArtifactRecord::GlobalVariable(_) => ArtifactKind::GlobalVariable,
            ArtifactRecord::Struct(_) => ArtifactKind::Struct,
            ArtifactRecord::Enum(_) => ArtifactKind::Enum,
            ArtifactRecord::Patch(_) => ArtifactKind::Patch,
        }
    }

    pub fn id(&self) -> ArtifactId {
        with_record!(self, a => a.id())
    }

    pub fn commit_msg(&self) -> String {
        with_record!(self, a => a.commit_msg())
    }

    pub fn last_change(&self) -> ChangeStamp {
        with_record!(self, a => a.last_change())
    }

    pub fn set_last_change(&mut self, stamp: ChangeStamp) {
        with_record!(self, a => a.set_last_change(stamp))
    }

    /// The function this artifact must be anchored under, if any.
    pub fn parent_function(&self) -> Option<u64> {
        match self {
            ArtifactRecord::FunctionHeader(header) => Some(header.addr),
            ArtifactRecord::StackVariable(var) => Some(var.addr),
            ArtifactRecord::Comment(comment) => comment.func_addr,
            _ => None,
        }
    }

    /// Non-conflicting merge across records; `None` when the kinds differ.
    pub fn merge_nonconflicting(&self, remote: &ArtifactRecord) -> Option<ArtifactRecord> {
        let merged = match (self, remote) {
            (ArtifactRecord::Function(l), ArtifactRecord::Function(r)) => {
                merge_nonconflicting(l, Some(r)).into_record()
            }
            (ArtifactRecord::FunctionHeader(l), ArtifactRecord::FunctionHeader(r)) => {
                merge_nonconflicting(l, Some(r)).into_record()
            }
            (ArtifactRecord::StackVariable(l), ArtifactRecord::StackVariable(r)) => {
                merge_nonconflicting(l, Some(r)).into_record()
            }
            (ArtifactRecord::Comment(l), ArtifactRecord::Comment(r)) => {
                merge_nonconflicting(l, Some(r)).into_record()
            }
            (ArtifactRecord::GlobalVariable(l), ArtifactRecord::GlobalVariable(r)) => {
                merge_nonconflicting(l, Some(r)).into_record()
            }
            (ArtifactRecord::Struct(l), ArtifactRecord::Struct(r)) => {
                merge_nonconflicting(l, Some(r)).into_record()
            }
            (ArtifactRecord::Enum(l), ArtifactRecord::Enum(r)) => {
                merge_nonconflicting(l, Some(r)).into_record()
            }
            (ArtifactRecord::Patch(l), ArtifactRecord::Patch(r)) => {
                merge_nonconflicting(l, Some(r)).into_record()
            }
            _ => return None,
        };
        Some(merged)
    }
}

impl fmt::Display for ArtifactRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}>", self.kind(), self.id())
    }
}

/// Prefer a non-empty local string, otherwise take the remote one.
pub(crate) fn prefer_text(local: &Option<String>, remote: &Option<String>) -> Option<String> {
    match local {
        Some(value) if !value.is_empty() => Some(value.clone()),
        _ => remote.clone().or_else(|| local.clone()),
    }
}

/// Prefer a non-zero local size, otherwise take the remote one.
pub(crate) fn prefer_size(local: u64, remote: u64) -> u64 {
    if local != 0 {
        local
    } else {
        remote
    }
}

/// Key-wise union; keys present on both sides are merged with `merge`.
pub(crate) fn merge_keyed<K, V>(
    local: &BTreeMap<K, V>,
    remote: &BTreeMap<K, V>,
    merge: impl Fn(&V, &V) -> V,
) -> BTreeMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    let mut out = local.clone();
    for (key, remote_value) in remote {
        let merged = match out.get(key) {
            Some(local_value) => merge(local_value, remote_value),
            None => remote_value.clone(),
        };
        out.insert(key.clone(), merged);
    }
    out
}

/// Serialize integer-keyed maps with string keys, as TOML tables require.
pub(crate) mod string_keys {
    use std::collections::BTreeMap;
    use std::fmt::Display;
    use std::str::FromStr;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Display,
        V: Serialize,
        S: Serializer,
    {
        serializer.collect_map(map.iter().map(|(key, value)| (key.to_string(), value)))
    }

    pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        K: FromStr + Ord,
        K::Err: Display,
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, V>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(key, value)| {
                key.parse::<K>()
                    .map(|parsed| (parsed, value))
                    .map_err(|e| D::Error::custom(format!("invalid map key {key:?}: {e}")))
            })
            .collect()
    }
}

/// Addresses as `0x…` strings. TOML integers are signed 64-bit, so a plain
/// `u64` above `i64::MAX` (kernel half, rebased-below-base) cannot be stored.
/// Bare integers and decimal strings are still accepted on read.
pub(crate) mod hex_addr {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Text(String),
    }

    pub fn parse(raw: &str) -> Result<u64, String> {
        let raw = raw.trim();
        let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            Some(digits) => u64::from_str_radix(digits, 16),
            None => raw.parse::<u64>(),
        };
        parsed.map_err(|e| format!("invalid address {raw:?}: {e}"))
    }

    pub fn serialize<S: Serializer>(addr: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{addr:#x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Int(addr) => Ok(addr),
            Raw::Text(text) => parse(&text).map_err(D::Error::custom),
        }
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(addr: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
            match addr {
                Some(addr) => super::serialize(addr, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapped(#[serde(with = "crate::model::hex_addr")] u64);

            Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(addr)| addr))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_stamps_never_affect_equality() {
        assert_eq!(ChangeStamp::now(), ChangeStamp::UNSET);
        assert!(ChangeStamp::UNSET.is_unset());
        assert_eq!(ChangeStamp::at(7).get(), Some(7));
    }

    #[test]
    fn kinds_parse_from_display_form() {
        for kind in ArtifactKind::ALL {
            assert_eq!(ArtifactKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ArtifactKind::parse("global_variable"), Some(ArtifactKind::GlobalVariable));
        assert_eq!(ArtifactKind::parse("segment"), None);
    }

    #[test]
    fn prefer_text_treats_empty_as_unset() {
        let empty = Some(String::new());
        let remote = Some("remote".to_string());
        assert_eq!(prefer_text(&empty, &remote), remote);
        assert_eq!(prefer_text(&Some("local".into()), &remote).as_deref(), Some("local"));
        assert_eq!(prefer_text(&empty, &None), empty);
    }

    #[test]
    fn addresses_parse_in_hex_or_decimal() {
        assert_eq!(hex_addr::parse("0xffffffffffffffff"), Ok(u64::MAX));
        assert_eq!(hex_addr::parse("0X10"), Ok(16));
        assert_eq!(hex_addr::parse("4096"), Ok(0x1000));
        assert!(hex_addr::parse("bad").is_err());
    }

    #[test]
    fn records_of_different_kinds_do_not_merge() {
        let func = ArtifactRecord::from(Function::new(0x10, 4));
        let gvar = ArtifactRecord::from(GlobalVariable::new(0x10, "g"));
        assert!(func.merge_nonconflicting(&gvar).is_none());
    }
}
