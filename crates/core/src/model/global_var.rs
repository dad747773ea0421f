use serde::{Deserialize, Serialize};

use super::{
    prefer_size, prefer_text, Artifact, ArtifactId, ArtifactKind, ArtifactRecord, ChangeStamp,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalVariable {
    #[serde(with = "crate::model::hex_addr")]
    pub addr: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_str: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "ChangeStamp::is_unset")]
    pub last_change: ChangeStamp,
}

impl GlobalVariable {
    pub fn new(addr: u64, name: impl Into<String>) -> Self {
        Self {
            addr,
            name: Some(name.into()),
            type_str: None,
            size: 0,
            last_change: ChangeStamp::UNSET,
        }
    }

    pub fn with_type(mut self, type_str: impl Into<String>, size: u64) -> Self {
        self.type_str = Some(type_str.into());
        self.size = size;
        self
    }
}

impl Artifact for GlobalVariable {
    const KIND: ArtifactKind = ArtifactKind::GlobalVariable;

    fn id(&self) -> ArtifactId {
        ArtifactId::Addr(self.addr)
    }

    fn last_change(&self) -> ChangeStamp {
        self.last_change
    }

    fn set_last_change(&mut self, stamp: ChangeStamp) {
        self.last_change = stamp;
    }

    fn commit_msg(&self) -> String {
        format!(
            "Updated global variable {}@{:#x}",
            self.name.as_deref().unwrap_or("<unnamed>"),
            self.addr
        )
    }

    fn merge_nonconflicting(&self, remote: &Self) -> Self {
        Self {
            addr: self.addr,
            name: prefer_text(&self.name, &remote.name),
            type_str: prefer_text(&self.type_str, &remote.type_str),
            size: prefer_size(self.size, remote.size),
            last_change: self.last_change,
        }
    }

    fn into_record(self) -> ArtifactRecord {
        ArtifactRecord::GlobalVariable(self)
    }
}
