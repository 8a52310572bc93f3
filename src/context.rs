use std::collections::{BTreeMap, BTreeSet};

use crate::gsic::GsicInfo;
use crate::vm::VmInfo;

/// One import record, normalized during link patching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    pub namespace: u64,
    pub name: u64,
    pub param_count: u8,
    pub flags: u8,
}

/// A vtable slot binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VtableSlot {
    pub name: u64,
    pub namespace: u64,
}

/// Class layout recovered from a vtable export.
#[derive(Debug, Default, Clone)]
pub struct ClassDef {
    pub name_space: u64,
    pub super_classes: BTreeSet<u64>,
    pub methods: Vec<u64>,
    pub vtable: BTreeMap<u64, VtableSlot>,
    /// `self.<field>` names collected from method bodies.
    pub self_members: BTreeSet<u64>,
}

/// Side table filled while link patching one script file and consumed by the
/// walker and the emitters. Lives exactly as long as the file.
pub struct ObjectContext {
    pub vm: &'static VmInfo,
    /// Interned string values, index -> text.
    strings: Vec<String>,
    /// Interned global variable names, index -> hash.
    gvars: Vec<u64>,
    /// Import records linked in code, index -> record (wide-hash family).
    pub linked_imports: Vec<ImportRecord>,
    /// Recovered classes, name hash -> definition.
    pub classes: BTreeMap<u64, ClassDef>,
    /// Animation tree names referenced by the file, for `#using animtree`.
    pub animtrees: BTreeSet<String>,
    pub gsic: GsicInfo,
}

impl ObjectContext {
    pub fn new(vm: &'static VmInfo) -> Self {
        Self {
            vm,
            strings: Vec::new(),
            gvars: Vec::new(),
            linked_imports: Vec::new(),
            classes: BTreeMap::new(),
            animtrees: BTreeSet::new(),
            gsic: GsicInfo::default(),
        }
    }

    pub fn add_string(&mut self, value: &str) -> u32 {
        let id = self.strings.len() as u32;
        self.strings.push(value.to_string());
        id
    }

    pub fn string(&self, id: u32) -> Option<&str> {
        self.strings.get(id as usize).map(String::as_str)
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn add_global_var_name(&mut self, hash: u64) -> u16 {
        let id = self.gvars.len() as u16;
        self.gvars.push(hash);
        id
    }

    pub fn global_var_name(&self, id: u16) -> Option<u64> {
        self.gvars.get(id as usize).copied()
    }

    pub fn add_linked_import(&mut self, record: ImportRecord) -> u16 {
        let id = self.linked_imports.len() as u16;
        self.linked_imports.push(record);
        id
    }

    pub fn linked_import(&self, id: u16) -> Option<&ImportRecord> {
        self.linked_imports.get(id as usize)
    }

    pub fn class_mut(&mut self, name: u64) -> &mut ClassDef {
        self.classes.entry(name).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{vm_info, VM_T8};

    #[test]
    fn interning_is_sequential() {
        let mut ctx = ObjectContext::new(vm_info(VM_T8).unwrap());
        assert_eq!(ctx.add_string("a"), 0);
        assert_eq!(ctx.add_string("b"), 1);
        assert_eq!(ctx.string(1), Some("b"));
        assert_eq!(ctx.string(2), None);

        assert_eq!(ctx.add_global_var_name(0x11), 0);
        assert_eq!(ctx.add_global_var_name(0x22), 1);
        assert_eq!(ctx.global_var_name(0), Some(0x11));
    }

    #[test]
    fn class_records_accumulate() {
        let mut ctx = ObjectContext::new(vm_info(VM_T8).unwrap());
        let cls = ctx.class_mut(0xC1A55);
        cls.name_space = 0x42;
        cls.methods.push(0x1);
        cls.vtable.insert(0xA5A5, VtableSlot { name: 0x1, namespace: 0xC1A55 });
        assert_eq!(ctx.classes.len(), 1);
        assert!(!ctx.classes[&0xC1A55].methods.is_empty());
    }
}
