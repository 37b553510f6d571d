//! Kernel functions: the native routines scripts reach through `callk`.
//! Entries are `Rc` closures over the VM state so a kernel may re-enter the
//! interpreter.

use std::rc::Rc;

use log::{debug, warn};

use crate::{
    NULL_REG, Reg, make_reg,
    script::{ObjectInfo, ScriptLoadFlags},
    vm::VmState,
};

pub type KernelFn = Rc<dyn Fn(&mut VmState, &[Reg]) -> Reg>;

pub struct KernelEntry {
    pub name: String,
    pub func: KernelFn,
}

/// Kernel dispatch table, indexed by the `callk` operand.
#[derive(Default)]
pub struct KernelTable {
    entries: Vec<KernelEntry>,
}

impl KernelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, name: &str, func: KernelFn) -> u16 {
        self.entries.push(KernelEntry {
            name: name.to_owned(),
            func,
        });
        (self.entries.len() - 1) as u16
    }

    pub fn get(&self, id: u16) -> Option<KernelFn> {
        self.entries.get(id as usize).map(|e| e.func.clone())
    }

    pub fn find(&self, name: &str) -> Option<u16> {
        self.entries
            .iter()
            .position(|e| e.name == name)
            .map(|i| i as u16)
    }

    pub fn name_of(&self, id: u16) -> String {
        self.entries
            .get(id as usize)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| format!("<kernel {id:#x}>"))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.install("Load", Rc::new(k_dummy));
        table.install("UnLoad", Rc::new(k_dummy));
        table.install("ScriptID", Rc::new(k_script_id));
        table.install("DisposeScript", Rc::new(k_dispose_script));
        table.install("Clone", Rc::new(k_clone));
        table.install("DisposeClone", Rc::new(k_dispose_clone));
        table.install("IsObject", Rc::new(k_is_object));
        table.install("NewList", Rc::new(k_new_list));
        table.install("DisposeList", Rc::new(k_dispose_list));
        table.install("NewNode", Rc::new(k_new_node));
        table.install("AddToFront", Rc::new(k_add_to_front));
        table.install("AddToEnd", Rc::new(k_add_to_end));
        table.install("FirstNode", Rc::new(k_first_node));
        table.install("LastNode", Rc::new(k_last_node));
        table.install("EmptyList", Rc::new(k_empty_list));
        table.install("NextNode", Rc::new(k_next_node));
        table.install("PrevNode", Rc::new(k_prev_node));
        table.install("NodeValue", Rc::new(k_node_value));
        table.install("Memory", Rc::new(k_memory));
        table.install("StrLen", Rc::new(k_str_len));
        table.install("StrCpy", Rc::new(k_str_cpy));
        table.install("StrAt", Rc::new(k_str_at));
        table.install("RestartGame", Rc::new(k_restart_game));
        table.install("GameIsRestarting", Rc::new(k_game_is_restarting));
        table.install("Quit", Rc::new(k_quit));
        table
    }
}

fn arg(argv: &[Reg], i: usize) -> Reg {
    argv.get(i).copied().unwrap_or(NULL_REG)
}

/// Stand-in for kernels this interpreter has no behavior for. Leaves the
/// accumulator alone.
fn k_dummy(s: &mut VmState, argv: &[Reg]) -> Reg {
    debug!("unimplemented kernel call ({} args)", argv.len());
    s.r_acc
}

fn k_script_id(s: &mut VmState, argv: &[Reg]) -> Reg {
    let script = arg(argv, 0).require_u16();
    let export = arg(argv, 1).require_u16();
    let Some(segid) = s
        .segman
        .get_script_segment(script, ScriptLoadFlags::LOAD | ScriptLoadFlags::LOCK)
    else {
        warn!("ScriptID: script {script} does not exist");
        return NULL_REG;
    };
    match s.segman.export_offset(segid, export) {
        Some(offset) => make_reg(segid, offset),
        None => NULL_REG,
    }
}

fn k_dispose_script(s: &mut VmState, argv: &[Reg]) -> Reg {
    s.segman.unlock_script(arg(argv, 0).require_u16());
    s.r_acc
}

fn k_clone(s: &mut VmState, argv: &[Reg]) -> Reg {
    let parent_addr = arg(argv, 0);
    let Some(parent) = s.segman.get_object(parent_addr).cloned() else {
        warn!("Clone of non-object {parent_addr:?}");
        return NULL_REG;
    };
    // keep the script (and with it the method code) resident while the
    // clone lives
    if let Some(nr) = s.segman.get_script(parent_addr.segment).map(|sc| sc.nr) {
        s.segman.get_script_segment(nr, ScriptLoadFlags::LOCK);
    }
    let mut obj = parent;
    let mut info = obj.info();
    info.insert(ObjectInfo::CLONE);
    info.remove(ObjectInfo::CLASS);
    obj.set_info(info);
    s.segman.alloc_clone(obj)
}

fn k_dispose_clone(s: &mut VmState, argv: &[Reg]) -> Reg {
    let addr = arg(argv, 0);
    match s.segman.get_object(addr) {
        Some(obj) if obj.is_clone() => s.segman.free_at_address(addr),
        Some(_) => warn!("DisposeClone of non-clone {addr:?}"),
        None => warn!("DisposeClone of non-object {addr:?}"),
    }
    s.r_acc
}

fn k_is_object(s: &mut VmState, argv: &[Reg]) -> Reg {
    Reg::from(s.segman.is_object(arg(argv, 0)) as u16)
}

fn k_new_list(s: &mut VmState, _argv: &[Reg]) -> Reg {
    s.segman.alloc_list()
}

fn k_dispose_list(s: &mut VmState, argv: &[Reg]) -> Reg {
    let addr = arg(argv, 0);
    if s.segman.get_list(addr).is_some() {
        // orphaned nodes are left to the collector
        s.segman.free_at_address(addr);
    } else {
        warn!("DisposeList of non-list {addr:?}");
    }
    s.r_acc
}

fn k_new_node(s: &mut VmState, argv: &[Reg]) -> Reg {
    s.segman.alloc_node(arg(argv, 1), arg(argv, 0))
}

fn k_add_to_front(s: &mut VmState, argv: &[Reg]) -> Reg {
    let (list_addr, node_addr) = (arg(argv, 0), arg(argv, 1));
    let Some(list) = s.segman.get_list(list_addr) else {
        warn!("AddToFront to non-list {list_addr:?}");
        return s.r_acc;
    };
    let old_first = list.first;
    if let Some(node) = s.segman.get_node_mut(node_addr) {
        node.pred = NULL_REG;
        node.succ = old_first;
    } else {
        warn!("AddToFront of non-node {node_addr:?}");
        return s.r_acc;
    }
    if old_first.is_null() {
        if let Some(list) = s.segman.get_list_mut(list_addr) {
            list.last = node_addr;
        }
    } else if let Some(first) = s.segman.get_node_mut(old_first) {
        first.pred = node_addr;
    }
    if let Some(list) = s.segman.get_list_mut(list_addr) {
        list.first = node_addr;
    }
    s.r_acc
}

fn k_add_to_end(s: &mut VmState, argv: &[Reg]) -> Reg {
    let (list_addr, node_addr) = (arg(argv, 0), arg(argv, 1));
    let Some(list) = s.segman.get_list(list_addr) else {
        warn!("AddToEnd to non-list {list_addr:?}");
        return s.r_acc;
    };
    let old_last = list.last;
    if let Some(node) = s.segman.get_node_mut(node_addr) {
        node.pred = old_last;
        node.succ = NULL_REG;
    } else {
        warn!("AddToEnd of non-node {node_addr:?}");
        return s.r_acc;
    }
    if old_last.is_null() {
        if let Some(list) = s.segman.get_list_mut(list_addr) {
            list.first = node_addr;
        }
    } else if let Some(last) = s.segman.get_node_mut(old_last) {
        last.succ = node_addr;
    }
    if let Some(list) = s.segman.get_list_mut(list_addr) {
        list.last = node_addr;
    }
    s.r_acc
}

fn k_first_node(s: &mut VmState, argv: &[Reg]) -> Reg {
    match s.segman.get_list(arg(argv, 0)) {
        Some(list) => list.first,
        None => NULL_REG,
    }
}

fn k_last_node(s: &mut VmState, argv: &[Reg]) -> Reg {
    match s.segman.get_list(arg(argv, 0)) {
        Some(list) => list.last,
        None => NULL_REG,
    }
}

fn k_empty_list(s: &mut VmState, argv: &[Reg]) -> Reg {
    match s.segman.get_list(arg(argv, 0)) {
        Some(list) => Reg::from(list.first.is_null() as u16),
        None => Reg::from(1u16),
    }
}

fn k_next_node(s: &mut VmState, argv: &[Reg]) -> Reg {
    match s.segman.get_node(arg(argv, 0)) {
        Some(node) => node.succ,
        None => NULL_REG,
    }
}

fn k_prev_node(s: &mut VmState, argv: &[Reg]) -> Reg {
    match s.segman.get_node(arg(argv, 0)) {
        Some(node) => node.pred,
        None => NULL_REG,
    }
}

fn k_node_value(s: &mut VmState, argv: &[Reg]) -> Reg {
    match s.segman.get_node(arg(argv, 0)) {
        Some(node) => node.value,
        None => NULL_REG,
    }
}

// Memory sub-operations
const MEMORY_ALLOCATE_CRITICAL: u16 = 1;
const MEMORY_ALLOCATE_NONCRITICAL: u16 = 2;
const MEMORY_FREE: u16 = 3;
const MEMORY_PEEK: u16 = 5;
const MEMORY_POKE: u16 = 6;

fn k_memory(s: &mut VmState, argv: &[Reg]) -> Reg {
    match arg(argv, 0).require_u16() {
        MEMORY_ALLOCATE_CRITICAL | MEMORY_ALLOCATE_NONCRITICAL => {
            let size = arg(argv, 1).require_u16() as usize;
            s.segman.alloc_dynmem(size, "kMemory")
        }
        MEMORY_FREE => {
            s.segman.free_dynmem(arg(argv, 1));
            s.r_acc
        }
        MEMORY_PEEK => s.segman.read_word(arg(argv, 1)).unwrap_or(NULL_REG),
        MEMORY_POKE => {
            s.segman.write_word(arg(argv, 1), arg(argv, 2));
            s.r_acc
        }
        op => {
            warn!("Memory: unsupported sub-operation {op}");
            NULL_REG
        }
    }
}

fn k_str_len(s: &mut VmState, argv: &[Reg]) -> Reg {
    match s.segman.read_string(arg(argv, 0)) {
        Some(str) => Reg::from(str.len() as u16),
        None => NULL_REG,
    }
}

fn k_str_cpy(s: &mut VmState, argv: &[Reg]) -> Reg {
    let dest = arg(argv, 0);
    if argv.len() > 2 {
        // counted form: a plain byte copy, no terminator handling
        let count = arg(argv, 2).require_i16().unsigned_abs() as usize;
        s.segman.copy_bytes(dest, arg(argv, 1), count);
        return dest;
    }
    let Some(src) = s.segman.read_string(arg(argv, 1)) else {
        warn!("StrCpy from non-string {:?}", arg(argv, 1));
        return dest;
    };
    s.segman.write_string(dest, &src);
    dest
}

fn k_str_at(s: &mut VmState, argv: &[Reg]) -> Reg {
    let addr = arg(argv, 0);
    let index = arg(argv, 1).require_u16() as usize;
    let old = s.segman.byte_at(addr, index).unwrap_or_else(|| {
        warn!("StrAt past end of {addr:?} (index {index})");
        0
    });
    if argv.len() > 2 {
        s.segman.set_byte_at(addr, index, arg(argv, 2).require_u16() as u8);
    }
    Reg::from(old as u16)
}

fn k_restart_game(s: &mut VmState, _argv: &[Reg]) -> Reg {
    s.request_restart();
    NULL_REG
}

fn k_game_is_restarting(s: &mut VmState, _argv: &[Reg]) -> Reg {
    Reg::from(s.game_was_restarted as u16)
}

fn k_quit(s: &mut VmState, _argv: &[Reg]) -> Reg {
    s.request_quit();
    NULL_REG
}

#[cfg(test)]
mod kernel_tests {
    use super::*;
    use crate::loader::MemoryLoader;

    fn fresh_state() -> VmState {
        VmState::new(Box::new(MemoryLoader::new()))
    }

    fn call(s: &mut VmState, name: &str, argv: &[Reg]) -> Reg {
        let id = s.kernel.find(name).unwrap();
        let f = s.kernel.get(id).unwrap();
        f(s, argv)
    }

    #[test]
    fn list_kernels_build_a_traversable_chain() {
        let mut s = fresh_state();
        let list = call(&mut s, "NewList", &[]);
        assert_eq!(call(&mut s, "EmptyList", &[list]), Reg::from(1u16));

        let n1 = call(&mut s, "NewNode", &[Reg::from(10u16), Reg::from(1u16)]);
        let n2 = call(&mut s, "NewNode", &[Reg::from(20u16), Reg::from(2u16)]);
        let n3 = call(&mut s, "NewNode", &[Reg::from(30u16), Reg::from(3u16)]);
        call(&mut s, "AddToEnd", &[list, n1]);
        call(&mut s, "AddToEnd", &[list, n2]);
        call(&mut s, "AddToFront", &[list, n3]);

        // order is n3, n1, n2
        let mut values = Vec::new();
        let mut cursor = call(&mut s, "FirstNode", &[list]);
        while !cursor.is_null() {
            values.push(call(&mut s, "NodeValue", &[cursor]).to_u16());
            cursor = call(&mut s, "NextNode", &[cursor]);
        }
        assert_eq!(values, vec![30, 10, 20]);
        assert_eq!(call(&mut s, "LastNode", &[list]), n2);
        assert_eq!(call(&mut s, "PrevNode", &[n1]), n3);
        assert_eq!(call(&mut s, "EmptyList", &[list]), Reg::from(0u16));
    }

    #[test]
    fn memory_kernel_allocates_peeks_and_pokes() {
        let mut s = fresh_state();
        let buf = call(
            &mut s,
            "Memory",
            &[Reg::from(MEMORY_ALLOCATE_CRITICAL), Reg::from(8u16)],
        );
        assert!(buf.is_pointer());
        call(
            &mut s,
            "Memory",
            &[Reg::from(MEMORY_POKE), buf, Reg::from(0xBEEFu16)],
        );
        assert_eq!(
            call(&mut s, "Memory", &[Reg::from(MEMORY_PEEK), buf]),
            Reg::from(0xBEEFu16)
        );
        call(&mut s, "Memory", &[Reg::from(MEMORY_FREE), buf]);
        assert!(s.segman.get(buf.segment).is_none());
    }

    #[test]
    fn string_kernels_work_on_dynmem() {
        let mut s = fresh_state();
        let buf = s.segman.alloc_dynmem(16, "str");
        s.segman.write_string(buf, "hello");
        assert_eq!(call(&mut s, "StrLen", &[buf]), Reg::from(5u16));
        assert_eq!(
            call(&mut s, "StrAt", &[buf, Reg::from(1u16)]),
            Reg::from(b'e' as u16)
        );
        // three-argument form stores and returns the replaced byte
        let old = call(
            &mut s,
            "StrAt",
            &[buf, Reg::from(0u16), Reg::from(b'y' as u16)],
        );
        assert_eq!(old, Reg::from(b'h' as u16));
        assert_eq!(s.segman.read_string(buf).as_deref(), Some("yello"));

        let copy = s.segman.alloc_dynmem(16, "copy");
        call(&mut s, "StrCpy", &[copy, buf]);
        assert_eq!(s.segman.read_string(copy).as_deref(), Some("yello"));

        // the counted form stops mid-string
        let partial = s.segman.alloc_dynmem(16, "partial");
        call(&mut s, "StrCpy", &[partial, buf, Reg::from(3u16)]);
        assert_eq!(s.segman.read_string(partial).as_deref(), Some("yel"));
    }

    #[test]
    fn restart_and_quit_raise_the_vm_flags() {
        let mut s = fresh_state();
        assert_eq!(call(&mut s, "GameIsRestarting", &[]), Reg::from(0u16));
        call(&mut s, "RestartGame", &[]);
        assert!(s.restarting);
        call(&mut s, "Quit", &[]);
        assert!(s.quit_flag);
    }
}
