//! Translation between a tool's native artifacts and the canonical form
//! stored in the repository.
//!
//! Lifting maps native to canonical (before storing); lowering is the
//! inverse (after loading). Addresses are rebased exactly; type strings are
//! renamed on a best-effort basis.

use std::collections::BTreeMap;

use crate::model::{ArtifactRecord, Function, FunctionHeader, StackVariable, Struct};

pub trait ArtifactLifter: Send + Sync {
    fn lift_addr(&self, addr: u64) -> u64;
    fn lower_addr(&self, addr: u64) -> u64;
    fn lift_type(&self, type_str: &str) -> String;
    fn lower_type(&self, type_str: &str) -> String;

    fn lift_stack_offset(&self, offset: i64, _func_addr: u64) -> i64 {
        offset
    }

    fn lower_stack_offset(&self, offset: i64, _func_addr: u64) -> i64 {
        offset
    }

    fn lift(&self, record: ArtifactRecord) -> ArtifactRecord {
        let mapping = Mapping {
            addr: &|a| self.lift_addr(a),
            ty: &|t| self.lift_type(t),
            offset: &|o, f| self.lift_stack_offset(o, f),
        };
        mapping.record(record)
    }

    fn lower(&self, record: ArtifactRecord) -> ArtifactRecord {
        let mapping = Mapping {
            addr: &|a| self.lower_addr(a),
            ty: &|t| self.lower_type(t),
            offset: &|o, f| self.lower_stack_offset(o, f),
        };
        mapping.record(record)
    }
}

/// One direction of a lifter, applied field by field.
struct Mapping<'a> {
    addr: &'a dyn Fn(u64) -> u64,
    ty: &'a dyn Fn(&str) -> String,
    /// Called with the function address before it is mapped.
    offset: &'a dyn Fn(i64, u64) -> i64,
}

impl Mapping<'_> {
    fn ty(&self, t: Option<String>) -> Option<String> {
        t.map(|t| (self.ty)(&t))
    }

    fn header(&self, mut h: FunctionHeader) -> FunctionHeader {
        h.addr = (self.addr)(h.addr);
        h.ret_type = self.ty(h.ret_type);
        for arg in h.args.values_mut() {
            arg.type_str = self.ty(arg.type_str.take());
        }
        h
    }

    fn stack_var(&self, mut v: StackVariable) -> StackVariable {
        v.stack_offset = (self.offset)(v.stack_offset, v.addr);
        v.addr = (self.addr)(v.addr);
        v.type_str = self.ty(v.type_str);
        v
    }

    fn function(&self, f: Function) -> Function {
        Function {
            addr: (self.addr)(f.addr),
            size: f.size,
            last_change: f.last_change,
            header: f.header.map(|h| self.header(h)),
            stack_vars: f
                .stack_vars
                .into_values()
                .map(|v| self.stack_var(v))
                .map(|v| (v.stack_offset, v))
                .collect(),
        }
    }

    fn structure(&self, mut s: Struct) -> Struct {
        for member in s.members.values_mut() {
            member.type_str = self.ty(member.type_str.take());
        }
        s
    }

    fn record(&self, record: ArtifactRecord) -> ArtifactRecord {
        match record {
            ArtifactRecord::Function(f) => self.function(f).into(),
            ArtifactRecord::FunctionHeader(h) => self.header(h).into(),
            ArtifactRecord::StackVariable(v) => self.stack_var(v).into(),
            ArtifactRecord::Comment(mut c) => {
                c.addr = (self.addr)(c.addr);
                c.func_addr = c.func_addr.map(self.addr);
                c.into()
            }
            ArtifactRecord::GlobalVariable(mut g) => {
                g.addr = (self.addr)(g.addr);
                g.type_str = self.ty(g.type_str);
                g.into()
            }
            ArtifactRecord::Struct(s) => self.structure(s).into(),
            // Enum values and patch file offsets are address-independent.
            other @ (ArtifactRecord::Enum(_) | ArtifactRecord::Patch(_)) => other,
        }
    }
}

/// Leaves everything untouched; for tools whose native form is canonical.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityLifter;

impl ArtifactLifter for IdentityLifter {
    fn lift_addr(&self, addr: u64) -> u64 {
        addr
    }

    fn lower_addr(&self, addr: u64) -> u64 {
        addr
    }

    fn lift_type(&self, type_str: &str) -> String {
        type_str.to_string()
    }

    fn lower_type(&self, type_str: &str) -> String {
        type_str.to_string()
    }
}

/// Rebases addresses between a tool's load address and the canonical base,
/// and renames tool-specific type names.
#[derive(Debug, Clone, Default)]
pub struct RebaseLifter {
    native_base: u64,
    canonical_base: u64,
    /// native name -> canonical name
    lift_types: BTreeMap<String, String>,
    /// canonical name -> native name
    lower_types: BTreeMap<String, String>,
}

impl RebaseLifter {
    pub fn new(native_base: u64, canonical_base: u64) -> Self {
        Self { native_base, canonical_base, ..Self::default() }
    }

    /// Register a type name that differs between the tool and canonical form.
    pub fn with_type_rename(mut self, native: impl Into<String>, canonical: impl Into<String>) -> Self {
        let (native, canonical) = (native.into(), canonical.into());
        self.lower_types.insert(canonical.clone(), native.clone());
        self.lift_types.insert(native, canonical);
        self
    }
}

/// Rename the base of a type string, keeping pointer and array suffixes:
/// `_DWORD *` with `_DWORD -> uint32_t` becomes `uint32_t *`.
fn rename_type(type_str: &str, table: &BTreeMap<String, String>) -> String {
    if let Some(exact) = table.get(type_str.trim()) {
        return exact.clone();
    }
    let split = type_str.find(|c: char| c == '*' || c == '[').unwrap_or(type_str.len());
    let (base, suffix) = type_str.split_at(split);
    match table.get(base.trim()) {
        Some(renamed) if suffix.is_empty() => renamed.clone(),
        Some(renamed) => format!("{renamed} {}", suffix.trim_start()),
        None => type_str.to_string(),
    }
}

impl ArtifactLifter for RebaseLifter {
    fn lift_addr(&self, addr: u64) -> u64 {
        addr.wrapping_sub(self.native_base).wrapping_add(self.canonical_base)
    }

    fn lower_addr(&self, addr: u64) -> u64 {
        addr.wrapping_sub(self.canonical_base).wrapping_add(self.native_base)
    }

    fn lift_type(&self, type_str: &str) -> String {
        rename_type(type_str, &self.lift_types)
    }

    fn lower_type(&self, type_str: &str) -> String {
        rename_type(type_str, &self.lower_types)
    }
}
