use serde::{Deserialize, Serialize};

use super::{Artifact, ArtifactId, ArtifactKind, ArtifactRecord, ChangeStamp};

/// Free-form text attached to an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    #[serde(with = "crate::model::hex_addr")]
    pub addr: u64,
    #[serde(default)]
    pub comment: String,
    /// Function the comment lives in, when known.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::model::hex_addr::option"
    )]
    pub func_addr: Option<u64>,
    /// Placed on a decompiled line rather than a disassembly line.
    #[serde(default)]
    pub decompiled: bool,
    #[serde(default, skip_serializing_if = "ChangeStamp::is_unset")]
    pub last_change: ChangeStamp,
}

impl Comment {
    pub fn new(addr: u64, comment: impl Into<String>) -> Self {
        Self {
            addr,
            comment: comment.into(),
            func_addr: None,
            decompiled: false,
            last_change: ChangeStamp::UNSET,
        }
    }

    pub fn in_function(mut self, func_addr: u64) -> Self {
        self.func_addr = Some(func_addr);
        self
    }

    pub fn decompiled(mut self, decompiled: bool) -> Self {
        self.decompiled = decompiled;
        self
    }
}

impl Artifact for Comment {
    const KIND: ArtifactKind = ArtifactKind::Comment;

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
        format!("Updated comment at {:#x}", self.addr)
    }

    fn merge_nonconflicting(&self, remote: &Self) -> Self {
        if self.comment.is_empty() {
            Self {
                addr: self.addr,
                comment: remote.comment.clone(),
                func_addr: self.func_addr.or(remote.func_addr),
                decompiled: remote.decompiled,
                last_change: self.last_change,
            }
        } else {
            Self { func_addr: self.func_addr.or(remote.func_addr), ..self.clone() }
        }
    }

    fn into_record(self) -> ArtifactRecord {
        ArtifactRecord::Comment(self)
    }
}
