//! Script-resident data: compiled script buffers, the objects living inside
//! them, their locals block and the VM data stack.

use std::collections::HashMap;

use bitflags::bitflags;

use crate::{Reg, SegmentId, make_reg};

/// Property slot indices every SCI object starts with.
pub const VAR_SPECIES: usize = 0;
pub const VAR_SUPERCLASS: usize = 1;
pub const VAR_INFO: usize = 2;
pub const VAR_NAME: usize = 3;

/// superclass value meaning "no superclass"
pub const NO_SUPERCLASS: u16 = 0xFFFF;

bitflags! {
    /// bits of the `-info-` property (variables[2])
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ObjectInfo: u16 {
        const CLONE = 0x0001;
        const CLASS = 0x8000;
    }
}

/// An object template inside a Script segment, or a runtime Clone of one.
///
/// The var-selector id list is flattened (classes carry their full inherited
/// selector set), so property lookup never needs to walk the hierarchy;
/// method lookup does.
#[derive(Debug, Clone)]
pub struct Object {
    /// canonical address of this object
    pub pos: Reg,
    /// property values; [0..4] are species/super/info/name
    pub variables: Vec<Reg>,
    /// selector id per property slot, same length as `variables`
    pub var_selector_ids: Vec<u16>,
    /// (selector id, code offset) pairs, unsorted
    pub methods: Vec<(u16, u16)>,
    /// human-readable name, for diagnostics and breakpoints
    pub name: String,
}

impl Object {
    pub fn species(&self) -> u16 {
        self.variables.get(VAR_SPECIES).copied().unwrap_or(Reg::default()).to_u16()
    }

    pub fn superclass(&self) -> u16 {
        self.variables
            .get(VAR_SUPERCLASS)
            .copied()
            .unwrap_or(make_reg(0, NO_SUPERCLASS))
            .to_u16()
    }

    pub fn info(&self) -> ObjectInfo {
        let raw = self
            .variables
            .get(VAR_INFO)
            .copied()
            .unwrap_or_default()
            .to_u16();
        ObjectInfo::from_bits_truncate(raw)
    }

    pub fn set_info(&mut self, info: ObjectInfo) {
        if let Some(slot) = self.variables.get_mut(VAR_INFO) {
            *slot = make_reg(0, info.bits());
        }
    }

    pub fn is_class(&self) -> bool {
        self.info().contains(ObjectInfo::CLASS)
    }

    pub fn is_clone(&self) -> bool {
        self.info().contains(ObjectInfo::CLONE)
    }

    /// Index of the property slot named by `selector`, if any. First match
    /// wins; the list is flattened so overrides shadow ancestors by
    /// construction.
    pub fn locate_var_selector(&self, selector: u16) -> Option<usize> {
        self.var_selector_ids.iter().position(|&id| id == selector)
    }

    /// Code offset of the method named by `selector` on this object itself
    /// (no hierarchy walk).
    pub fn method_offset(&self, selector: u16) -> Option<u16> {
        self.methods
            .iter()
            .find(|&&(id, _)| id == selector)
            .map(|&(_, off)| off)
    }
}

bitflags! {
    /// flags for resolving a script segment by number
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ScriptLoadFlags: u8 {
        /// load the script on demand if not resident
        const LOAD = 1 << 0;
        /// additionally bump the lock count so the GC keeps it
        const LOCK = 1 << 1;
    }
}

/// A loaded script: raw bytecode plus the metadata the VM addresses into it.
#[derive(Debug)]
pub struct Script {
    pub nr: u16,
    pub buf: Vec<u8>,
    /// export table: code offsets, indexed by export number
    pub exports: Vec<u16>,
    /// objects keyed by their offset within the script
    pub objects: HashMap<u16, Object>,
    /// owned locals block, 0 when the script has none
    pub locals_segment: SegmentId,
    /// explicit load references keeping this script (and its objects) alive
    pub lockers: u32,
    pub marked_as_deleted: bool,
}

impl Script {
    pub fn object_at(&self, offset: u16) -> Option<&Object> {
        self.objects.get(&offset)
    }

    pub fn increment_lockers(&mut self) {
        self.lockers += 1;
    }

    pub fn decrement_lockers(&mut self) {
        if self.lockers > 0 {
            self.lockers -= 1;
        }
    }
}

/// Locals block, owned by exactly one script.
#[derive(Debug)]
pub struct LocalVariables {
    pub script_id: u16,
    pub locals: Vec<Reg>,
}

/// The VM data stack; one per VM. Fixed capacity, liveness managed by the
/// frames' stack pointers.
#[derive(Debug)]
pub struct DataStack {
    pub entries: Vec<Reg>,
}

impl DataStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![Reg::default(); capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod object_tests {
    use super::*;
    use crate::NULL_REG;

    fn sample_object() -> Object {
        Object {
            pos: make_reg(2, 0x40),
            variables: vec![
                make_reg(0, 7),               // species
                make_reg(0, 3),               // superclass
                make_reg(0, 0),               // info
                NULL_REG,                     // name
                make_reg(0, 42),              // x
            ],
            var_selector_ids: vec![0xFFF0, 0xFFF1, 0xFFF2, 0xFFF3, 0x0010],
            methods: vec![(0x0020, 0x100), (0x0021, 0x140)],
            name: "sample".into(),
        }
    }

    #[test]
    fn species_and_superclass_read_the_fixed_slots() {
        let obj = sample_object();
        assert_eq!(obj.species(), 7);
        assert_eq!(obj.superclass(), 3);
    }

    #[test]
    fn var_selector_lookup_returns_slot_index_of_first_match() {
        let obj = sample_object();
        assert_eq!(obj.locate_var_selector(0x0010), Some(4));
        assert_eq!(obj.locate_var_selector(0x0011), None);
    }

    #[test]
    fn method_lookup_is_local_to_the_object() {
        let obj = sample_object();
        assert_eq!(obj.method_offset(0x0021), Some(0x140));
        assert_eq!(obj.method_offset(0x0099), None);
    }

    #[test]
    fn info_bits_distinguish_clones_from_classes() {
        let mut obj = sample_object();
        assert!(!obj.is_clone());
        assert!(!obj.is_class());

        obj.set_info(ObjectInfo::CLONE);
        assert!(obj.is_clone());
        assert!(!obj.is_class());

        obj.set_info(ObjectInfo::CLASS);
        assert!(obj.is_class());
    }
}
