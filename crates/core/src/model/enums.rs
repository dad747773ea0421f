use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{merge_keyed, Artifact, ArtifactId, ArtifactKind, ArtifactRecord, ChangeStamp};

/// A named enumeration, mapping member names to values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enum {
    pub name: String,
    #[serde(default, skip_serializing_if = "ChangeStamp::is_unset")]
    pub last_change: ChangeStamp,
    #[serde(default)]
    pub members: BTreeMap<String, i64>,
}

impl Enum {
    pub fn new<I, S>(name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            last_change: ChangeStamp::UNSET,
            members: members.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Members ordered by their underlying value (ties by name).
    pub fn members_by_value(&self) -> Vec<(&str, i64)> {
        let mut out: Vec<(&str, i64)> =
            self.members.iter().map(|(name, value)| (name.as_str(), *value)).collect();
        out.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        out
    }
}

impl Artifact for Enum {
    const KIND: ArtifactKind = ArtifactKind::Enum;

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
        format!("Updated enum {} ({} values)", self.name, self.members.len())
    }

    fn merge_nonconflicting(&self, remote: &Self) -> Self {
        Self {
            name: self.name.clone(),
            last_change: self.last_change,
            members: merge_keyed(&self.members, &remote.members, |local, _| *local),
        }
    }

    fn into_record(self) -> ArtifactRecord {
        ArtifactRecord::Enum(self)
    }
}
