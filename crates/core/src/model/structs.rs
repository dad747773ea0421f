use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{
    merge_keyed, prefer_size, prefer_text, string_keys, Artifact, ArtifactId, ArtifactKind,
    ArtifactRecord, ChangeStamp,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructMember {
    #[serde(with = "crate::model::hex_addr")]
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_str: Option<String>,
    #[serde(default)]
    pub size: u64,
}

impl StructMember {
    pub fn new(offset: u64, name: impl Into<String>, type_str: impl Into<String>, size: u64) -> Self {
        Self { offset, name: Some(name.into()), type_str: Some(type_str.into()), size }
    }

    fn merged(&self, remote: &Self) -> Self {
        Self {
            offset: self.offset,
            name: prefer_text(&self.name, &remote.name),
            type_str: prefer_text(&self.type_str, &remote.type_str),
            size: prefer_size(self.size, remote.size),
        }
    }
}

/// A named aggregate type, members keyed by byte offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Struct {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "ChangeStamp::is_unset")]
    pub last_change: ChangeStamp,
    #[serde(default, with = "string_keys")]
    pub members: BTreeMap<u64, StructMember>,
}

impl Struct {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            last_change: ChangeStamp::UNSET,
            members: BTreeMap::new(),
        }
    }

    pub fn with_member(mut self, member: StructMember) -> Self {
        self.add_member(member);
        self
    }

    pub fn add_member(&mut self, member: StructMember) {
        self.members.insert(member.offset, member);
    }

    /// Copy of this struct without members, used to declare types before
    /// filling members that may reference each other.
    pub fn header_only(&self) -> Self {
        Self { members: BTreeMap::new(), ..self.clone() }
    }
}

impl Artifact for Struct {
    const KIND: ArtifactKind = ArtifactKind::Struct;

    fn id(&self) -> ArtifactId {
        ArtifactId::Name(self.name.clone())
    }

    fn last_change(&self) -> ChangeStamp {
        self.last_change
    }

    fn set_last_change(&mut self, stamp: ChangeStamp) {
        self.last_change = stamp;
    }

    fn commit_msg(&self) -> String {
        format!("Updated struct {} ({} members)", self.name, self.members.len())
    }

    fn merge_nonconflicting(&self, remote: &Self) -> Self {
        Self {
            name: self.name.clone(),
            size: prefer_size(self.size, remote.size),
            last_change: self.last_change,
            members: merge_keyed(&self.members, &remote.members, StructMember::merged),
        }
    }

    fn into_record(self) -> ArtifactRecord {
        ArtifactRecord::Struct(self)
    }
}
