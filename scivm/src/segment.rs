//! Typed heap segments. Every pointer `Reg` selects a segment by id; the
//! segment's kind decides how the offset is interpreted, how the garbage
//! collector traverses it, and whether it can be dereferenced as memory.

use log::warn;

use crate::{
    Reg, SegmentId, make_reg,
    script::{DataStack, LocalVariables, Object, Script},
};

/// Kind tag for a segment, mostly for diagnostics.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SegmentKind {
    Script,
    Locals,
    Stack,
    Clones,
    Lists,
    Nodes,
    Hunks,
    DynMem,
    Arrays,
    Strings,
}

/// Growable arena of entries with an intrusive free list. Entry indices are
/// the `offset` halves of the `Reg`s handed out for table-resident items, so
/// a freed slot must stay in place until reused.
#[derive(Debug)]
pub enum Entry<T> {
    Occupied(T),
    Free { next_free: Option<usize> },
}

#[derive(Debug)]
pub struct Table<T> {
    entries: Vec<Entry<T>>,
    first_free: Option<usize>,
    entries_used: usize,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            first_free: None,
            entries_used: 0,
        }
    }
}

impl<T> Table<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_entry(&mut self, value: T) -> usize {
        self.entries_used += 1;
        match self.first_free {
            Some(idx) => {
                let Entry::Free { next_free } = self.entries[idx] else {
                    unreachable!("free list head points at occupied entry");
                };
                self.first_free = next_free;
                self.entries[idx] = Entry::Occupied(value);
                idx
            }
            None => {
                self.entries.push(Entry::Occupied(value));
                self.entries.len() - 1
            }
        }
    }

    pub fn free_entry(&mut self, idx: usize) -> Option<T> {
        if !self.is_valid_entry(idx) {
            return None;
        }
        let old = std::mem::replace(
            &mut self.entries[idx],
            Entry::Free {
                next_free: self.first_free,
            },
        );
        self.first_free = Some(idx);
        self.entries_used -= 1;
        match old {
            Entry::Occupied(value) => Some(value),
            Entry::Free { .. } => None,
        }
    }

    pub fn is_valid_entry(&self, idx: usize) -> bool {
        matches!(self.entries.get(idx), Some(Entry::Occupied(_)))
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        match self.entries.get(idx) {
            Some(Entry::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        match self.entries.get_mut(idx) {
            Some(Entry::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    pub fn len_used(&self) -> usize {
        self.entries_used
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.entries.iter().enumerate().filter_map(|(i, e)| match e {
            Entry::Occupied(value) => Some((i, value)),
            Entry::Free { .. } => None,
        })
    }
}

/// Doubly linked list head. `first`/`last` point at Node-table entries.
#[derive(Debug, Default)]
pub struct List {
    pub first: Reg,
    pub last: Reg,
}

/// List node: neighbours plus a key/value payload.
#[derive(Debug, Default)]
pub struct Node {
    pub pred: Reg,
    pub succ: Reg,
    pub key: Reg,
    pub value: Reg,
}

/// Opaque raw allocation handed out to kernel functions. Never traversed.
#[derive(Debug)]
pub struct Hunk {
    pub mem: Vec<u8>,
    pub kind: &'static str,
}

/// Script-visible raw memory block, one segment per allocation.
#[derive(Debug)]
pub struct DynMem {
    pub buf: Vec<u8>,
    pub descr: String,
}

/// How the memory behind a dereferenced pointer is shaped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DerefKind {
    /// plain bytes
    Raw,
    /// 16-bit `Reg` cells, possibly with a one-byte skip into the first cell
    Cells,
}

/// Dereference metadata for a pointer: the memory's shape, how many bytes
/// are addressable from it, and the byte skip for odd offsets into cell
/// memory.
#[derive(Debug, Copy, Clone)]
pub struct DerefInfo {
    pub kind: DerefKind,
    /// remaining length in bytes from the pointed-at position
    pub len: usize,
    /// 1 when the pointer lands on the high byte of the first cell
    pub skip_byte: bool,
}

/// One heap segment. The discriminant is fixed at allocation time and never
/// changes for a live segment id.
#[derive(Debug)]
pub enum SegmentObj {
    Script(Script),
    Locals(LocalVariables),
    Stack(DataStack),
    Clones(Table<Object>),
    Lists(Table<List>),
    Nodes(Table<Node>),
    Hunks(Table<Hunk>),
    DynMem(DynMem),
    Arrays(Table<Vec<Reg>>),
    Strings(Table<Vec<u8>>),
}

impl SegmentObj {
    pub fn kind(&self) -> SegmentKind {
        match self {
            SegmentObj::Script(_) => SegmentKind::Script,
            SegmentObj::Locals(_) => SegmentKind::Locals,
            SegmentObj::Stack(_) => SegmentKind::Stack,
            SegmentObj::Clones(_) => SegmentKind::Clones,
            SegmentObj::Lists(_) => SegmentKind::Lists,
            SegmentObj::Nodes(_) => SegmentKind::Nodes,
            SegmentObj::Hunks(_) => SegmentKind::Hunks,
            SegmentObj::DynMem(_) => SegmentKind::DynMem,
            SegmentObj::Arrays(_) => SegmentKind::Arrays,
            SegmentObj::Strings(_) => SegmentKind::Strings,
        }
    }

    /// Report all `Reg`s reachable from the item at `addr` within this
    /// segment. Plain integers may be reported too; the collector filters.
    pub fn outgoing_refs(&self, addr: Reg, f: &mut dyn FnMut(Reg)) {
        match self {
            SegmentObj::Script(script) => {
                if let Some(obj) = script.object_at(addr.offset) {
                    for &v in &obj.variables {
                        f(v);
                    }
                }
            }
            SegmentObj::Locals(locals) => {
                for &v in &locals.locals {
                    f(v);
                }
            }
            // stack liveness is decided by the root set, never re-expanded
            SegmentObj::Stack(_) => {}
            SegmentObj::Clones(clones) => {
                if let Some(obj) = clones.get(addr.offset as usize) {
                    for &v in &obj.variables {
                        f(v);
                    }
                }
            }
            SegmentObj::Lists(lists) => {
                if let Some(list) = lists.get(addr.offset as usize) {
                    f(list.first);
                    f(list.last);
                }
            }
            SegmentObj::Nodes(nodes) => {
                if let Some(node) = nodes.get(addr.offset as usize) {
                    f(node.pred);
                    f(node.succ);
                    f(node.key);
                    f(node.value);
                }
            }
            SegmentObj::Arrays(arrays) => {
                if let Some(array) = arrays.get(addr.offset as usize) {
                    for &v in array {
                        f(v);
                    }
                }
            }
            SegmentObj::Hunks(_) | SegmentObj::DynMem(_) | SegmentObj::Strings(_) => {}
        }
    }

    /// Report the canonical address of every item in this segment the
    /// collector may deallocate individually.
    pub fn each_deallocatable(&self, segid: SegmentId, f: &mut dyn FnMut(Reg)) {
        match self {
            SegmentObj::Clones(t) => each_table_addr(t, segid, f),
            SegmentObj::Lists(t) => each_table_addr(t, segid, f),
            SegmentObj::Nodes(t) => each_table_addr(t, segid, f),
            SegmentObj::Hunks(t) => each_table_addr(t, segid, f),
            SegmentObj::Arrays(t) => each_table_addr(t, segid, f),
            SegmentObj::Strings(t) => each_table_addr(t, segid, f),
            SegmentObj::DynMem(_) => f(make_reg(segid, 0)),
            SegmentObj::Script(_) | SegmentObj::Locals(_) | SegmentObj::Stack(_) => {}
        }
    }

    /// Map an interior pointer to the address that stands for the whole
    /// allocation during sweep membership tests.
    pub fn canonical_addr(&self, addr: Reg) -> Reg {
        match self {
            // table entries are addressed by entry index already
            SegmentObj::Clones(_)
            | SegmentObj::Lists(_)
            | SegmentObj::Nodes(_)
            | SegmentObj::Hunks(_)
            | SegmentObj::Arrays(_)
            | SegmentObj::Strings(_) => addr,
            // block segments canonicalize to their base
            SegmentObj::Script(_)
            | SegmentObj::Locals(_)
            | SegmentObj::Stack(_)
            | SegmentObj::DynMem(_) => make_reg(addr.segment, 0),
        }
    }

    /// Dereference metadata for a pointer into this segment, or None when
    /// the segment kind holds no addressable memory.
    pub fn deref_info(&self, addr: Reg) -> Option<DerefInfo> {
        let off = addr.offset as usize;
        match self {
            SegmentObj::Script(script) => raw_info(script.buf.len(), off),
            SegmentObj::DynMem(dynmem) => raw_info(dynmem.buf.len(), off),
            SegmentObj::Strings(strings) => {
                // string pointers address whole table entries
                let s = strings.get(off)?;
                Some(DerefInfo {
                    kind: DerefKind::Raw,
                    len: s.len(),
                    skip_byte: false,
                })
            }
            SegmentObj::Locals(locals) => cell_info(locals.locals.len(), off),
            SegmentObj::Stack(stack) => cell_info(stack.entries.len(), off),
            SegmentObj::Clones(clones) => {
                let obj = clones.get(off)?;
                Some(DerefInfo {
                    kind: DerefKind::Cells,
                    len: obj.variables.len() * 2,
                    skip_byte: false,
                })
            }
            SegmentObj::Arrays(arrays) => {
                let array = arrays.get(off)?;
                Some(DerefInfo {
                    kind: DerefKind::Cells,
                    len: array.len() * 2,
                    skip_byte: false,
                })
            }
            SegmentObj::Lists(_) | SegmentObj::Nodes(_) | SegmentObj::Hunks(_) => {
                warn!("attempt to dereference {addr:?} ({:?} segment)", self.kind());
                None
            }
        }
    }
}

fn each_table_addr<T>(table: &Table<T>, segid: SegmentId, f: &mut dyn FnMut(Reg)) {
    for (idx, _) in table.iter() {
        f(make_reg(segid, idx as u16));
    }
}

fn raw_info(total: usize, off: usize) -> Option<DerefInfo> {
    if off > total {
        warn!("raw dereference past end of segment (offset {off:#x}, size {total:#x})");
        return None;
    }
    Some(DerefInfo {
        kind: DerefKind::Raw,
        len: total - off,
        skip_byte: false,
    })
}

fn cell_info(cells: usize, byte_off: usize) -> Option<DerefInfo> {
    let total = cells * 2;
    if byte_off > total {
        warn!("cell dereference past end of segment (offset {byte_off:#x}, size {total:#x})");
        return None;
    }
    Some(DerefInfo {
        kind: DerefKind::Cells,
        len: total - byte_off,
        skip_byte: byte_off & 1 == 1,
    })
}


#[cfg(test)]
mod deref_tests {
    use super::*;
    use crate::script::DataStack;

    #[test]
    fn stack_cells_with_odd_offset_report_a_skip_byte() {
        let seg = SegmentObj::Stack(DataStack::new(8));
        let info = seg.deref_info(make_reg(3, 5)).unwrap();
        assert_eq!(info.kind, DerefKind::Cells);
        assert!(info.skip_byte);
        assert_eq!(info.len, 16 - 5);
    }

    #[test]
    fn list_segments_cannot_be_dereferenced() {
        let mut lists: Table<List> = Table::new();
        lists.alloc_entry(List::default());
        let seg = SegmentObj::Lists(lists);
        assert!(seg.deref_info(make_reg(4, 0)).is_none());
    }
}
