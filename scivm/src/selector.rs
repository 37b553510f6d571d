//! Selector resolution. A selector sent to an object resolves to either a
//! property slot (flattened, no hierarchy walk) or a method, found by
//! walking the superclass chain through the class table.

use log::warn;

use crate::{
    Reg,
    script::{NO_SUPERCLASS, ScriptLoadFlags},
    seg_manager::SegManager,
};

/// Location of a property slot: the owning object plus the slot index.
/// Stable across GC since objects are addressed by `Reg`, not by pointer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ObjVarRef {
    pub obj: Reg,
    pub varindex: usize,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SelectorKind {
    /// the object does not understand the selector
    None,
    Variable(ObjVarRef),
    /// address of the method's code
    Method(Reg),
}

/// Resolve `selector` against the object at `obj_addr`. Property slots win
/// over methods; the method walk starts at the object itself and follows
/// superclass links, loading class scripts on demand.
pub fn lookup_selector(segman: &mut SegManager, obj_addr: Reg, selector: u16) -> SelectorKind {
    let Some(obj) = segman.get_object(obj_addr) else {
        warn!("selector lookup on non-object {obj_addr:?}");
        return SelectorKind::None;
    };

    if let Some(varindex) = obj.locate_var_selector(selector) {
        return SelectorKind::Variable(ObjVarRef {
            obj: obj_addr,
            varindex,
        });
    }

    let mut addr = obj_addr;
    loop {
        let Some(obj) = segman.get_object(addr) else {
            warn!("superclass chain of {obj_addr:?} runs through non-object {addr:?}");
            return SelectorKind::None;
        };
        if let Some(offset) = obj.method_offset(selector) {
            return SelectorKind::Method(Reg {
                segment: addr.segment,
                offset,
            });
        }
        let superclass = obj.superclass();
        if superclass == NO_SUPERCLASS {
            return SelectorKind::None;
        }
        match segman.get_class_address(superclass, ScriptLoadFlags::LOAD) {
            Some(class_addr) => addr = class_addr,
            None => {
                warn!("superclass {superclass} of {obj_addr:?} cannot be resolved");
                return SelectorKind::None;
            }
        }
    }
}

/// Read the property slot behind `varp`.
pub fn read_var(segman: &SegManager, varp: ObjVarRef) -> Reg {
    match segman
        .get_object(varp.obj)
        .and_then(|obj| obj.variables.get(varp.varindex))
    {
        Some(&value) => value,
        None => {
            warn!("stale property reference {varp:?}");
            Reg::default()
        }
    }
}

/// Write the property slot behind `varp`.
pub fn write_var(segman: &mut SegManager, varp: ObjVarRef, value: Reg) {
    match segman
        .get_object_mut(varp.obj)
        .and_then(|obj| obj.variables.get_mut(varp.varindex))
    {
        Some(slot) => *slot = value,
        None => warn!("stale property reference {varp:?}"),
    }
}
