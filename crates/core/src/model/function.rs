use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{
    merge_keyed, prefer_size, prefer_text, string_keys, Artifact, ArtifactId, ArtifactKind,
    ArtifactRecord, ChangeStamp,
};

/// One argument of a function prototype.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionArgument {
    pub idx: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_str: Option<String>,
    #[serde(default)]
    pub size: u64,
}

impl FunctionArgument {
    pub fn new(idx: usize, name: impl Into<String>, type_str: impl Into<String>, size: u64) -> Self {
        Self { idx, name: Some(name.into()), type_str: Some(type_str.into()), size }
    }

    fn merged(&self, remote: &Self) -> Self {
        Self {
            idx: self.idx,
            name: prefer_text(&self.name, &remote.name),
            type_str: prefer_text(&self.type_str, &remote.type_str),
            size: prefer_size(self.size, remote.size),
        }
    }
}

/// Name and prototype of a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionHeader {
    #[serde(with = "crate::model::hex_addr")]
    pub addr: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret_type: Option<String>,
    #[serde(default, skip_serializing_if = "ChangeStamp::is_unset")]
    pub last_change: ChangeStamp,
    #[serde(default, with = "string_keys")]
    pub args: BTreeMap<usize, FunctionArgument>,
}

impl FunctionHeader {
    pub fn new(addr: u64) -> Self {
        Self {
            addr,
            name: None,
            ret_type: None,
            last_change: ChangeStamp::UNSET,
            args: BTreeMap::new(),
        }
    }

    pub fn named(addr: u64, name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Self::new(addr) }
    }

    pub fn with_ret_type(mut self, ret_type: impl Into<String>) -> Self {
        self.ret_type = Some(ret_type.into());
        self
    }

    pub fn with_arg(mut self, arg: FunctionArgument) -> Self {
        self.args.insert(arg.idx, arg);
        self
    }
}

impl Artifact for FunctionHeader {
    const KIND: ArtifactKind = ArtifactKind::FunctionHeader;

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
            "Updated function header {}@{:#x}",
            self.name.as_deref().unwrap_or("<unnamed>"),
            self.addr
        )
    }

    fn merge_nonconflicting(&self, remote: &Self) -> Self {
        Self {
            addr: self.addr,
            name: prefer_text(&self.name, &remote.name),
            ret_type: prefer_text(&self.ret_type, &remote.ret_type),
            last_change: self.last_change,
            args: merge_keyed(&self.args, &remote.args, FunctionArgument::merged),
        }
    }

    fn into_record(self) -> ArtifactRecord {
        ArtifactRecord::FunctionHeader(self)
    }
}

/// A named, typed slot in a function's stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackVariable {
    /// Address of the owning function.
    #[serde(with = "crate::model::hex_addr")]
    pub addr: u64,
    pub stack_offset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_str: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "ChangeStamp::is_unset")]
    pub last_change: ChangeStamp,
}

impl StackVariable {
    pub fn new(
        addr: u64,
        stack_offset: i64,
        name: impl Into<String>,
        type_str: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            addr,
            stack_offset,
            name: Some(name.into()),
            type_str: Some(type_str.into()),
            size,
            last_change: ChangeStamp::UNSET,
        }
    }
}

impl Artifact for StackVariable {
    const KIND: ArtifactKind = ArtifactKind::StackVariable;

    fn id(&self) -> ArtifactId {
        ArtifactId::StackSlot { func_addr: self.addr, offset: self.stack_offset }
    }

    fn last_change(&self) -> ChangeStamp {
        self.last_change
    }

    fn set_last_change(&mut self, stamp: ChangeStamp) {
        self.last_change = stamp;
    }

    fn commit_msg(&self) -> String {
        format!(
            "Updated stack variable {} at {:#x}[{}]",
            self.name.as_deref().unwrap_or("<unnamed>"),
            self.addr,
            self.stack_offset
        )
    }

    fn merge_nonconflicting(&self, remote: &Self) -> Self {
        Self {
            addr: self.addr,
            stack_offset: self.stack_offset,
            name: prefer_text(&self.name, &remote.name),
            type_str: prefer_text(&self.type_str, &remote.type_str),
            size: prefer_size(self.size, remote.size),
            last_change: self.last_change,
        }
    }

    fn into_record(self) -> ArtifactRecord {
        ArtifactRecord::StackVariable(self)
    }
}

/// A function: its extent, optional header, and stack frame layout.
///
/// Header and stack variables are stored inside the function so that every
/// function-scoped artifact is anchored to a parent record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    #[serde(with = "crate::model::hex_addr")]
    pub addr: u64,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "ChangeStamp::is_unset")]
    pub last_change: ChangeStamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<FunctionHeader>,
    #[serde(default, with = "string_keys")]
    pub stack_vars: BTreeMap<i64, StackVariable>,
}

impl Function {
    pub fn new(addr: u64, size: u64) -> Self {
        Self {
            addr,
            size,
            last_change: ChangeStamp::UNSET,
            header: None,
            stack_vars: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, header: FunctionHeader) -> Self {
        self.header = Some(header);
        self
    }

    pub fn with_stack_var(mut self, var: StackVariable) -> Self {
        self.stack_vars.insert(var.stack_offset, var);
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.header.as_ref().and_then(|h| h.name.as_deref())
    }

    /// True when `addr` falls inside `[self.addr, self.addr + size]`.
    pub fn contains(&self, addr: u64) -> bool {
        self.addr <= addr && addr <= self.addr.saturating_add(self.size)
    }
}

impl Artifact for Function {
    const KIND: ArtifactKind = ArtifactKind::Function;

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
        match self.name() {
            Some(name) => format!("Updated function {name}@{:#x}", self.addr),
            None => format!("Updated function {:#x}", self.addr),
        }
    }

    fn merge_nonconflicting(&self, remote: &Self) -> Self {
        let header = match (&self.header, &remote.header) {
            (Some(local), Some(remote)) => Some(local.merge_nonconflicting(remote)),
            (Some(local), None) => Some(local.clone()),
            (None, remote) => remote.clone(),
        };
        Self {
            addr: self.addr,
            size: prefer_size(self.size, remote.size),
            last_change: self.last_change,
            header,
            stack_vars: merge_keyed(&self.stack_vars, &remote.stack_vars, |l, r| {
                l.merge_nonconflicting(r)
            }),
        }
    }

    fn into_record(self) -> ArtifactRecord {
        ArtifactRecord::Function(self)
    }
}
