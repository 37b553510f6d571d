//! The segment manager: owner of the typed heap. Hands out segment ids
//! first-fit, instantiates scripts, tracks the class table and funnels every
//! pointer dereference through one validated choke point.

use std::collections::HashMap;

use log::{debug, warn};

use crate::{
    NULL_REG, Reg, SegmentId, make_reg,
    loader::ScriptLoader,
    script::{DataStack, LocalVariables, Object, Script, ScriptLoadFlags},
    segment::{DerefInfo, DynMem, Hunk, List, Node, SegmentObj, Table},
};

/// Default data stack capacity in cells.
pub const VM_STACK_SIZE: usize = 0x1000;

/// Class table entry. `reg` stays null until the owning script is
/// instantiated.
#[derive(Debug, Clone)]
pub struct Class {
    pub script: Option<u16>,
    pub reg: Reg,
}

pub struct SegManager {
    /// heap[0] is permanently vacant so segment id 0 keeps meaning "integer"
    heap: Vec<Option<SegmentObj>>,
    script_map: HashMap<u16, SegmentId>,
    classes: Vec<Class>,
    loader: Box<dyn ScriptLoader>,
    stack_segment: SegmentId,
    clones_segment: SegmentId,
    lists_segment: SegmentId,
    nodes_segment: SegmentId,
    hunks_segment: SegmentId,
    arrays_segment: SegmentId,
    strings_segment: SegmentId,
}

impl SegManager {
    pub fn new(loader: Box<dyn ScriptLoader>) -> Self {
        let mut segman = Self {
            heap: vec![None],
            script_map: HashMap::new(),
            classes: Vec::new(),
            loader,
            stack_segment: 0,
            clones_segment: 0,
            lists_segment: 0,
            nodes_segment: 0,
            hunks_segment: 0,
            arrays_segment: 0,
            strings_segment: 0,
        };
        segman.stack_segment =
            segman.allocate_segment(SegmentObj::Stack(DataStack::new(VM_STACK_SIZE)));
        segman
    }

    // --- segment lifecycle ---------------------------------------------

    /// First-fit id allocation: the returned id is the smallest unused
    /// positive integer, so freed ids get recycled.
    pub fn allocate_segment(&mut self, obj: SegmentObj) -> SegmentId {
        for (id, slot) in self.heap.iter_mut().enumerate().skip(1) {
            if slot.is_none() {
                *slot = Some(obj);
                return id as SegmentId;
            }
        }
        self.heap.push(Some(obj));
        (self.heap.len() - 1) as SegmentId
    }

    /// Free a segment. For a script, `recursive` also frees its locals
    /// segment; the script-number mapping and class registrations go either
    /// way.
    pub fn deallocate_segment(&mut self, segid: SegmentId, recursive: bool) {
        let Some(slot) = self.heap.get_mut(segid as usize) else {
            warn!("deallocate of unknown segment {segid:#x}");
            return;
        };
        let Some(obj) = slot.take() else {
            warn!("double deallocate of segment {segid:#x}");
            return;
        };
        if let SegmentObj::Script(script) = obj {
            self.script_map.remove(&script.nr);
            let locals = script.locals_segment;
            if recursive && locals != 0 {
                self.deallocate_segment(locals, recursive);
            }
            for class in &mut self.classes {
                if class.reg.segment == segid {
                    class.reg = NULL_REG;
                }
            }
        }
    }

    pub fn get(&self, segid: SegmentId) -> Option<&SegmentObj> {
        self.heap.get(segid as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, segid: SegmentId) -> Option<&mut SegmentObj> {
        self.heap.get_mut(segid as usize).and_then(|s| s.as_mut())
    }

    /// One past the highest segment id ever allocated.
    pub fn segment_count(&self) -> SegmentId {
        self.heap.len() as SegmentId
    }

    pub fn stack_segment(&self) -> SegmentId {
        self.stack_segment
    }

    /// Where the loader says the game object lives, as (script nr, offset).
    pub fn game_object_location(&self) -> Option<(u16, u16)> {
        self.loader.game_object()
    }

    pub fn selector_names(&self) -> Vec<String> {
        self.loader.selector_names()
    }

    // --- scripts -------------------------------------------------------

    /// Instantiate `nr` if it is not already resident. Idempotent: a second
    /// call returns the same segment id without touching the loader.
    pub fn allocate_script(&mut self, nr: u16) -> Option<SegmentId> {
        if let Some(&segid) = self.script_map.get(&nr) {
            return Some(segid);
        }
        let blob = self.loader.load_script(nr)?;
        let segid = self.allocate_segment(SegmentObj::Script(Script {
            nr,
            buf: Vec::new(),
            exports: Vec::new(),
            objects: HashMap::new(),
            locals_segment: 0,
            lockers: 0,
            marked_as_deleted: false,
        }));
        self.script_map.insert(nr, segid);

        let locals_segment = if blob.locals.is_empty() {
            0
        } else {
            self.allocate_segment(SegmentObj::Locals(LocalVariables {
                script_id: nr,
                locals: blob.locals.clone(),
            }))
        };

        let mut objects = HashMap::new();
        for blob_obj in &blob.objects {
            let pos = make_reg(segid, blob_obj.offset);
            if let Some(class_id) = blob_obj.class_id {
                self.set_class(class_id, nr, pos);
            }
            objects.insert(
                blob_obj.offset,
                Object {
                    pos,
                    variables: blob_obj.properties.clone(),
                    var_selector_ids: blob_obj.var_selector_ids.clone(),
                    methods: blob_obj.methods.clone(),
                    name: blob_obj.name.clone(),
                },
            );
        }

        let Some(SegmentObj::Script(script)) = self.get_mut(segid) else {
            unreachable!("freshly allocated script segment vanished");
        };
        script.buf = blob.bytecode;
        script.exports = blob.exports;
        script.objects = objects;
        script.locals_segment = locals_segment;
        debug!("instantiated script {nr} as segment {segid:#x}");
        Some(segid)
    }

    pub fn get_script_segment(&mut self, nr: u16, flags: ScriptLoadFlags) -> Option<SegmentId> {
        let segid = if flags.contains(ScriptLoadFlags::LOAD) {
            self.allocate_script(nr)?
        } else {
            *self.script_map.get(&nr)?
        };
        if flags.contains(ScriptLoadFlags::LOCK)
            && let Some(SegmentObj::Script(script)) = self.get_mut(segid)
        {
            script.increment_lockers();
        }
        Some(segid)
    }

    pub fn unlock_script(&mut self, nr: u16) {
        let Some(&segid) = self.script_map.get(&nr) else {
            warn!("unlock of script {nr} which is not resident");
            return;
        };
        if let Some(SegmentObj::Script(script)) = self.get_mut(segid) {
            script.decrement_lockers();
        }
    }

    pub fn get_script(&self, segid: SegmentId) -> Option<&Script> {
        match self.get(segid) {
            Some(SegmentObj::Script(script)) => Some(script),
            _ => None,
        }
    }

    pub fn get_script_mut(&mut self, segid: SegmentId) -> Option<&mut Script> {
        match self.get_mut(segid) {
            Some(SegmentObj::Script(script)) => Some(script),
            _ => None,
        }
    }

    pub fn script_segment_of(&self, nr: u16) -> Option<SegmentId> {
        self.script_map.get(&nr).copied()
    }

    /// Code offset behind an export slot, if the slot exists and is nonzero.
    pub fn export_offset(&self, segid: SegmentId, export: u16) -> Option<u16> {
        let script = self.get_script(segid)?;
        match script.exports.get(export as usize) {
            Some(&offset) if offset != 0 => Some(offset),
            Some(_) => {
                warn!("export {export} of script {} is a null slot", script.nr);
                None
            }
            None => {
                warn!(
                    "export {export} out of range for script {} ({} exports)",
                    script.nr,
                    script.exports.len()
                );
                None
            }
        }
    }

    // --- class table ---------------------------------------------------

    fn ensure_class(&mut self, class_id: u16) {
        let needed = class_id as usize + 1;
        if self.classes.len() < needed {
            self.classes.resize(
                needed,
                Class {
                    script: None,
                    reg: NULL_REG,
                },
            );
        }
    }

    pub fn set_class(&mut self, class_id: u16, script: u16, reg: Reg) {
        self.ensure_class(class_id);
        self.classes[class_id as usize] = Class {
            script: Some(script),
            reg,
        };
    }

    /// Address of a class object, loading (and optionally locking) its
    /// script on demand.
    pub fn get_class_address(&mut self, class_id: u16, flags: ScriptLoadFlags) -> Option<Reg> {
        if let Some(class) = self.classes.get(class_id as usize)
            && !class.reg.is_null()
        {
            let reg = class.reg;
            if flags.contains(ScriptLoadFlags::LOCK)
                && let Some(script) = class.script
            {
                self.get_script_segment(script, ScriptLoadFlags::LOCK);
            }
            return Some(reg);
        }
        let script = self
            .classes
            .get(class_id as usize)
            .and_then(|c| c.script)
            .or_else(|| self.loader.class_script(class_id))?;
        self.get_script_segment(script, flags | ScriptLoadFlags::LOAD)?;
        match self.classes.get(class_id as usize) {
            Some(class) if !class.reg.is_null() => Some(class.reg),
            _ => {
                warn!("script {script} did not provide class {class_id}");
                None
            }
        }
    }

    // --- objects and clones --------------------------------------------

    pub fn get_object(&self, addr: Reg) -> Option<&Object> {
        match self.get(addr.segment)? {
            SegmentObj::Script(script) => script.object_at(addr.offset),
            SegmentObj::Clones(clones) => clones.get(addr.offset as usize),
            _ => None,
        }
    }

    pub fn get_object_mut(&mut self, addr: Reg) -> Option<&mut Object> {
        match self.get_mut(addr.segment)? {
            SegmentObj::Script(script) => script.objects.get_mut(&addr.offset),
            SegmentObj::Clones(clones) => clones.get_mut(addr.offset as usize),
            _ => None,
        }
    }

    pub fn is_object(&self, addr: Reg) -> bool {
        self.get_object(addr).is_some()
    }

    /// Object name for diagnostics; never fails.
    pub fn object_name(&self, addr: Reg) -> String {
        match self.get_object(addr) {
            Some(obj) => obj.name.clone(),
            None => format!("<no object at {addr:?}>"),
        }
    }

    pub fn alloc_clone(&mut self, obj: Object) -> Reg {
        if self.clones_segment == 0 {
            self.clones_segment = self.allocate_segment(SegmentObj::Clones(Table::new()));
        }
        let segid = self.clones_segment;
        let Some(SegmentObj::Clones(clones)) = self.get_mut(segid) else {
            unreachable!("clones segment has wrong kind");
        };
        let idx = clones.alloc_entry(obj);
        let reg = make_reg(segid, idx as u16);
        // the entry index is not known before insertion
        if let Some(clone) = clones.get_mut(idx) {
            clone.pos = reg;
        }
        reg
    }

    // --- lists, nodes, hunks, dynmem, arrays, strings -------------------

    pub fn alloc_list(&mut self) -> Reg {
        if self.lists_segment == 0 {
            self.lists_segment = self.allocate_segment(SegmentObj::Lists(Table::new()));
        }
        let segid = self.lists_segment;
        let Some(SegmentObj::Lists(lists)) = self.get_mut(segid) else {
            unreachable!("lists segment has wrong kind");
        };
        make_reg(segid, lists.alloc_entry(List::default()) as u16)
    }

    pub fn alloc_node(&mut self, key: Reg, value: Reg) -> Reg {
        if self.nodes_segment == 0 {
            self.nodes_segment = self.allocate_segment(SegmentObj::Nodes(Table::new()));
        }
        let segid = self.nodes_segment;
        let Some(SegmentObj::Nodes(nodes)) = self.get_mut(segid) else {
            unreachable!("nodes segment has wrong kind");
        };
        let idx = nodes.alloc_entry(Node {
            pred: NULL_REG,
            succ: NULL_REG,
            key,
            value,
        });
        make_reg(segid, idx as u16)
    }

    pub fn alloc_hunk(&mut self, size: usize, kind: &'static str) -> Reg {
        if self.hunks_segment == 0 {
            self.hunks_segment = self.allocate_segment(SegmentObj::Hunks(Table::new()));
        }
        let segid = self.hunks_segment;
        let Some(SegmentObj::Hunks(hunks)) = self.get_mut(segid) else {
            unreachable!("hunks segment has wrong kind");
        };
        let idx = hunks.alloc_entry(Hunk {
            mem: vec![0; size],
            kind,
        });
        make_reg(segid, idx as u16)
    }

    pub fn alloc_dynmem(&mut self, size: usize, descr: &str) -> Reg {
        let segid = self.allocate_segment(SegmentObj::DynMem(DynMem {
            buf: vec![0; size],
            descr: descr.to_owned(),
        }));
        make_reg(segid, 0)
    }

    pub fn free_dynmem(&mut self, addr: Reg) -> bool {
        match self.get(addr.segment) {
            Some(SegmentObj::DynMem(_)) => {
                self.deallocate_segment(addr.segment, true);
                true
            }
            _ => {
                warn!("attempt to free non-dynmem {addr:?}");
                false
            }
        }
    }

    pub fn alloc_array(&mut self, len: usize) -> Reg {
        if self.arrays_segment == 0 {
            self.arrays_segment = self.allocate_segment(SegmentObj::Arrays(Table::new()));
        }
        let segid = self.arrays_segment;
        let Some(SegmentObj::Arrays(arrays)) = self.get_mut(segid) else {
            unreachable!("arrays segment has wrong kind");
        };
        make_reg(segid, arrays.alloc_entry(vec![NULL_REG; len]) as u16)
    }

    pub fn alloc_string(&mut self, data: &[u8]) -> Reg {
        if self.strings_segment == 0 {
            self.strings_segment = self.allocate_segment(SegmentObj::Strings(Table::new()));
        }
        let segid = self.strings_segment;
        let Some(SegmentObj::Strings(strings)) = self.get_mut(segid) else {
            unreachable!("strings segment has wrong kind");
        };
        make_reg(segid, strings.alloc_entry(data.to_vec()) as u16)
    }

    pub fn get_list(&self, addr: Reg) -> Option<&List> {
        match self.get(addr.segment)? {
            SegmentObj::Lists(lists) => lists.get(addr.offset as usize),
            _ => None,
        }
    }

    pub fn get_list_mut(&mut self, addr: Reg) -> Option<&mut List> {
        match self.get_mut(addr.segment)? {
            SegmentObj::Lists(lists) => lists.get_mut(addr.offset as usize),
            _ => None,
        }
    }

    pub fn get_node(&self, addr: Reg) -> Option<&Node> {
        match self.get(addr.segment)? {
            SegmentObj::Nodes(nodes) => nodes.get(addr.offset as usize),
            _ => None,
        }
    }

    pub fn get_node_mut(&mut self, addr: Reg) -> Option<&mut Node> {
        match self.get_mut(addr.segment)? {
            SegmentObj::Nodes(nodes) => nodes.get_mut(addr.offset as usize),
            _ => None,
        }
    }

    /// Free whatever individually deallocatable item lives at `addr`;
    /// used by the sweep phase.
    pub fn free_at_address(&mut self, addr: Reg) {
        let idx = addr.offset as usize;
        match self.get_mut(addr.segment) {
            Some(SegmentObj::Clones(t)) => {
                t.free_entry(idx);
            }
            Some(SegmentObj::Lists(t)) => {
                t.free_entry(idx);
            }
            Some(SegmentObj::Nodes(t)) => {
                t.free_entry(idx);
            }
            Some(SegmentObj::Hunks(t)) => {
                t.free_entry(idx);
            }
            Some(SegmentObj::Arrays(t)) => {
                t.free_entry(idx);
            }
            Some(SegmentObj::Strings(t)) => {
                t.free_entry(idx);
            }
            Some(SegmentObj::DynMem(_)) => self.deallocate_segment(addr.segment, true),
            Some(_) => warn!("free of non-deallocatable address {addr:?}"),
            None => warn!("free of address in dead segment {addr:?}"),
        }
    }

    // --- stack ----------------------------------------------------------

    pub fn stack(&self) -> &DataStack {
        let Some(SegmentObj::Stack(stack)) = self.get(self.stack_segment) else {
            unreachable!("stack segment missing");
        };
        stack
    }

    pub fn stack_mut(&mut self) -> &mut DataStack {
        let segid = self.stack_segment;
        let Some(SegmentObj::Stack(stack)) = self.get_mut(segid) else {
            unreachable!("stack segment missing");
        };
        stack
    }

    // --- dereferencing --------------------------------------------------

    pub fn deref_info(&self, addr: Reg) -> Option<DerefInfo> {
        match self.get(addr.segment) {
            Some(seg) => seg.deref_info(addr),
            None => {
                warn!("dereference of {addr:?} in unallocated segment");
                None
            }
        }
    }

    /// Raw byte view behind `addr`, for segments backed by plain memory.
    pub fn raw_at(&self, addr: Reg) -> Option<&[u8]> {
        let off = addr.offset as usize;
        match self.get(addr.segment)? {
            SegmentObj::Script(script) => script.buf.get(off..),
            SegmentObj::DynMem(dynmem) => dynmem.buf.get(off..),
            SegmentObj::Strings(strings) => strings.get(off).map(|s| s.as_slice()),
            _ => None,
        }
    }

    pub fn raw_at_mut(&mut self, addr: Reg) -> Option<&mut [u8]> {
        let off = addr.offset as usize;
        match self.get_mut(addr.segment)? {
            SegmentObj::Script(script) => script.buf.get_mut(off..),
            SegmentObj::DynMem(dynmem) => dynmem.buf.get_mut(off..),
            SegmentObj::Strings(strings) => strings.get_mut(off).map(|s| s.as_mut_slice()),
            _ => None,
        }
    }

    /// Cell view behind `addr` for cell-backed segments, together with the
    /// one-byte skip for odd offsets. The slice starts at the cell holding
    /// the pointed-at byte.
    fn cells_at(&self, addr: Reg) -> Option<(&[Reg], usize)> {
        let off = addr.offset as usize;
        let (cells, skip) = match self.get(addr.segment)? {
            SegmentObj::Locals(locals) => (&locals.locals, off & 1),
            SegmentObj::Stack(stack) => (&stack.entries, off & 1),
            _ => return None,
        };
        cells.get(off / 2..).map(|c| (c, skip))
    }

    fn cells_at_mut(&mut self, addr: Reg) -> Option<(&mut [Reg], usize)> {
        let off = addr.offset as usize;
        let (cells, skip) = match self.get_mut(addr.segment)? {
            SegmentObj::Locals(locals) => (&mut locals.locals, off & 1),
            SegmentObj::Stack(stack) => (&mut stack.entries, off & 1),
            _ => return None,
        };
        cells.get_mut(off / 2..).map(|c| (c, skip))
    }

    /// Byte `i` behind a string-ish pointer. Works for raw memory and for
    /// character data packed two-per-cell into `Reg` memory (odd base
    /// offsets select the high byte of the first cell).
    pub fn byte_at(&self, addr: Reg, i: usize) -> Option<u8> {
        if let Some(raw) = self.raw_at(addr) {
            return raw.get(i).copied();
        }
        let (cells, skip) = self.cells_at(addr)?;
        let pos = i + skip;
        let cell = cells.get(pos / 2)?;
        if pos & 1 == 1 {
            Some((cell.offset >> 8) as u8)
        } else {
            Some(cell.offset as u8)
        }
    }

    /// Store byte `i` behind a string-ish pointer. Writing a character into
    /// cell memory clears the cell's segment: the cell stops being a
    /// pointer the moment it carries character data.
    pub fn set_byte_at(&mut self, addr: Reg, i: usize, value: u8) -> bool {
        if !self.is_cell_backed(addr.segment) {
            return match self.raw_at_mut(addr).and_then(|raw| raw.get_mut(i)) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => {
                    warn!("byte store past end of {addr:?} (index {i})");
                    false
                }
            };
        }
        let Some((cells, skip)) = self.cells_at_mut(addr) else {
            warn!("byte store into non-memory {addr:?}");
            return false;
        };
        let pos = i + skip;
        let Some(cell) = cells.get_mut(pos / 2) else {
            warn!("byte store past end of {addr:?} (index {i})");
            return false;
        };
        cell.segment = 0;
        if pos & 1 == 1 {
            cell.offset = (cell.offset & 0x00FF) | ((value as u16) << 8);
        } else {
            cell.offset = (cell.offset & 0xFF00) | value as u16;
        }
        true
    }

    /// 16-bit read behind `addr`. Cell memory yields the whole cell, so
    /// pointers stored there survive; raw memory yields a little-endian
    /// integer.
    pub fn read_word(&self, addr: Reg) -> Option<Reg> {
        if let Some((cells, skip)) = self.cells_at(addr) {
            if skip != 0 {
                warn!("unaligned word read at {addr:?}");
            }
            return cells.first().copied();
        }
        let raw = self.raw_at(addr)?;
        match raw.get(..2) {
            Some(b) => Some(make_reg(0, u16::from_le_bytes([b[0], b[1]]))),
            None => {
                warn!("word read past end of {addr:?}");
                None
            }
        }
    }

    fn is_cell_backed(&self, segid: SegmentId) -> bool {
        matches!(
            self.get(segid),
            Some(SegmentObj::Locals(_) | SegmentObj::Stack(_))
        )
    }

    /// 16-bit store behind `addr`, the counterpart of [`Self::read_word`].
    pub fn write_word(&mut self, addr: Reg, value: Reg) -> bool {
        if self.is_cell_backed(addr.segment) {
            let Some((cells, skip)) = self.cells_at_mut(addr) else {
                return false;
            };
            if skip != 0 {
                warn!("unaligned word write at {addr:?}");
            }
            return match cells.first_mut() {
                Some(cell) => {
                    *cell = value;
                    true
                }
                None => false,
            };
        }
        let int = value.require_u16();
        match self.raw_at_mut(addr).and_then(|raw| raw.get_mut(..2)) {
            Some(b) => {
                b.copy_from_slice(&int.to_le_bytes());
                true
            }
            None => {
                warn!("word write past end of {addr:?}");
                false
            }
        }
    }

    /// NUL-terminated string behind `addr`, decoded bytewise.
    pub fn read_string(&self, addr: Reg) -> Option<String> {
        self.deref_info(addr)?;
        let mut out = Vec::new();
        let mut i = 0;
        loop {
            match self.byte_at(addr, i) {
                Some(0) | None => break,
                Some(b) => out.push(b),
            }
            i += 1;
        }
        Some(String::from_utf8_lossy(&out).into_owned())
    }

    /// Copy `s` plus a terminating NUL to `addr`.
    pub fn write_string(&mut self, addr: Reg, s: &str) {
        for (i, b) in s.bytes().enumerate() {
            if !self.set_byte_at(addr, i, b) {
                return;
            }
        }
        self.set_byte_at(addr, s.len(), 0);
    }

    /// Copy `count` bytes from `src` to `dest` verbatim, NULs included.
    /// Source and destination may be backed differently (raw vs cells).
    pub fn copy_bytes(&mut self, dest: Reg, src: Reg, count: usize) {
        for i in 0..count {
            let Some(b) = self.byte_at(src, i) else {
                warn!("byte copy past end of source {src:?} (byte {i})");
                return;
            };
            if !self.set_byte_at(dest, i, b) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod segmanager_tests {
    use super::*;
    use crate::loader::{MemoryLoader, ObjectBlob, ScriptBlob, ScriptBuilder};
    use crate::segment::SegmentKind;

    fn empty_manager() -> SegManager {
        SegManager::new(Box::new(MemoryLoader::new()))
    }

    fn manager_with_script(nr: u16) -> SegManager {
        let mut loader = MemoryLoader::new();
        let mut code = ScriptBuilder::new();
        code.ldi(1).ret();
        let mut blob = ScriptBlob {
            bytecode: code.finish(),
            exports: vec![0],
            objects: Vec::new(),
            locals: vec![NULL_REG; 4],
        };
        blob.objects
            .push(ObjectBlob::new(0x20, "Obj", 1, 0xFFFF, 0x8000).as_class(1));
        loader.add_script(nr, blob);
        SegManager::new(Box::new(loader))
    }

    #[test]
    fn segment_ids_are_first_fit_and_recycled() {
        let mut segman = empty_manager();
        // id 1 is the stack, allocated by the constructor
        let a = segman.alloc_dynmem(8, "a");
        let b = segman.alloc_dynmem(8, "b");
        let c = segman.alloc_dynmem(8, "c");
        assert_eq!((a.segment, b.segment, c.segment), (2, 3, 4));

        segman.deallocate_segment(b.segment, true);
        let d = segman.alloc_dynmem(8, "d");
        assert_eq!(d.segment, b.segment, "lowest free id is reused");

        let e = segman.alloc_dynmem(8, "e");
        assert_eq!(e.segment, 5);
    }

    #[test]
    fn script_deallocation_recursion_controls_the_locals() {
        let mut segman = manager_with_script(7);
        let segid = segman.allocate_script(7).unwrap();
        let locals = segman.get_script(segid).unwrap().locals_segment;
        segman.deallocate_segment(segid, false);
        assert!(segman.get(locals).is_some(), "locals survive a flat deallocate");
        segman.deallocate_segment(locals, true);

        let segid = segman.allocate_script(7).unwrap();
        let locals = segman.get_script(segid).unwrap().locals_segment;
        segman.deallocate_segment(segid, true);
        assert!(segman.get(locals).is_none(), "recursive deallocate cascades");
    }

    #[test]
    fn allocate_script_is_idempotent() {
        let mut segman = manager_with_script(7);
        let first = segman.allocate_script(7).unwrap();
        let second = segman.allocate_script(7).unwrap();
        assert_eq!(first, second);
        assert_eq!(segman.get_script(first).map(|s| s.nr), Some(7));
    }

    #[test]
    fn script_instantiation_creates_a_locals_segment_and_registers_classes() {
        let mut segman = manager_with_script(7);
        let segid = segman.allocate_script(7).unwrap();
        let script = segman.get_script(segid).unwrap();
        let locals = script.locals_segment;
        assert_ne!(locals, 0);
        assert_eq!(
            segman.get(locals).map(|s| s.kind()),
            Some(SegmentKind::Locals)
        );
        let class_addr = segman
            .get_class_address(1, ScriptLoadFlags::empty())
            .unwrap();
        assert_eq!(class_addr, make_reg(segid, 0x20));
        assert!(segman.is_object(class_addr));
    }

    #[test]
    fn class_addresses_load_the_owning_script_on_demand() {
        let mut segman = manager_with_script(7);
        assert!(segman.script_segment_of(7).is_none());
        let addr = segman.get_class_address(1, ScriptLoadFlags::LOAD).unwrap();
        assert_eq!(Some(addr.segment), segman.script_segment_of(7));
    }

    #[test]
    fn lock_flags_bump_and_release_the_lock_count() {
        let mut segman = manager_with_script(7);
        let segid = segman
            .get_script_segment(7, ScriptLoadFlags::LOAD | ScriptLoadFlags::LOCK)
            .unwrap();
        assert_eq!(segman.get_script(segid).map(|s| s.lockers), Some(1));
        segman.unlock_script(7);
        assert_eq!(segman.get_script(segid).map(|s| s.lockers), Some(0));
        // underflow is clamped
        segman.unlock_script(7);
        assert_eq!(segman.get_script(segid).map(|s| s.lockers), Some(0));
    }

    #[test]
    fn packed_string_roundtrip_through_cell_memory() {
        let mut segman = manager_with_script(7);
        let segid = segman.allocate_script(7).unwrap();
        let locals = segman.get_script(segid).unwrap().locals_segment;
        // odd base offset: first char lands in the high byte of cell 0
        let addr = make_reg(locals, 1);
        segman.write_string(addr, "hey");
        assert_eq!(segman.read_string(addr).as_deref(), Some("hey"));
        assert_eq!(segman.byte_at(addr, 1), Some(b'e'));

        // the cells that received characters are integers now
        let Some(SegmentObj::Locals(block)) = segman.get(locals) else {
            panic!("locals segment missing");
        };
        assert_eq!(block.locals[0].segment, 0);
        assert_eq!(block.locals[1].segment, 0);
        assert_eq!((block.locals[0].offset >> 8) as u8, b'h');
        assert_eq!(block.locals[1].offset as u8, b'e');
        assert_eq!((block.locals[1].offset >> 8) as u8, b'y');
    }

    #[test]
    fn dynmem_strings_roundtrip_through_raw_memory() {
        let mut segman = empty_manager();
        let addr = segman.alloc_dynmem(16, "test buffer");
        segman.write_string(addr, "dynamic");
        assert_eq!(segman.read_string(addr).as_deref(), Some("dynamic"));
        assert!(segman.free_dynmem(addr));
        assert!(segman.get(addr.segment).is_none());
    }

    #[test]
    fn clones_live_in_one_shared_table_segment() {
        let mut segman = manager_with_script(7);
        let class_addr = segman.get_class_address(1, ScriptLoadFlags::LOAD).unwrap();
        let template = segman.get_object(class_addr).cloned().unwrap();
        let a = segman.alloc_clone(template.clone());
        let b = segman.alloc_clone(template);
        assert_eq!(a.segment, b.segment);
        assert_ne!(a.offset, b.offset);
        assert_eq!(segman.get_object(a).map(|o| o.pos), Some(a));

        segman.free_at_address(a);
        assert!(!segman.is_object(a));
        let c = segman.alloc_clone(segman.get_object(b).cloned().unwrap());
        assert_eq!(c.offset, a.offset, "clone slot is recycled");
    }
}
