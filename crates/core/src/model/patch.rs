use serde::{Deserialize, Serialize};

use super::{prefer_text, Artifact, ArtifactId, ArtifactKind, ArtifactRecord, ChangeStamp};

/// Replacement bytes written over the binary at `offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(with = "crate::model::hex_addr")]
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obj_name: Option<String>,
    #[serde(default, with = "hex_bytes")]
    pub bytes: Vec<u8>,
    #[serde(default, skip_serializing_if = "ChangeStamp::is_unset")]
    pub last_change: ChangeStamp,
}

impl Patch {
    pub fn new(offset: u64, bytes: impl Into<Vec<u8>>) -> Self {
        Self { offset, obj_name: None, bytes: bytes.into(), last_change: ChangeStamp::UNSET }
    }
}

impl Artifact for Patch {
    const KIND: ArtifactKind = ArtifactKind::Patch;

    fn id(&self) -> ArtifactId {
        ArtifactId::Addr(self.offset)
    }

    fn last_change(&self) -> ChangeStamp {
        self.last_change
    }

    fn set_last_change(&mut self, stamp: ChangeStamp) {
        self.last_change = stamp;
    }

    fn commit_msg(&self) -> String {
        format!("Updated patch at {:#x} ({} bytes)", self.offset, self.bytes.len())
    }

    fn merge_nonconflicting(&self, remote: &Self) -> Self {
        Self {
            offset: self.offset,
            obj_name: prefer_text(&self.obj_name, &remote.obj_name),
            bytes: if self.bytes.is_empty() { remote.bytes.clone() } else { self.bytes.clone() },
            last_change: self.last_change,
        }
    }

    fn into_record(self) -> ArtifactRecord {
        ArtifactRecord::Patch(self)
    }
}

mod hex_bytes {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw.trim()).map_err(D::Error::custom)
    }
}
