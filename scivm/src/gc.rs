//! Mark and sweep over the deallocatable heap entities: clones, lists,
//! nodes, hunks, arrays, strings and dynmem blocks. Scripts, locals and the
//! stack are never swept; they anchor the root set instead.

use std::collections::HashSet;

use ahash::RandomState;
use log::debug;

use crate::{Reg, frame::FrameKind, segment::SegmentObj, selector, vm::VmState};

/// Kernel calls between collections.
pub const GC_INTERVAL: u32 = 0x8000;

/// Worklist with a seen-set; pushing a plain integer or an already seen
/// address is a no-op.
struct Worklist {
    pending: Vec<Reg>,
    seen: HashSet<Reg, RandomState>,
}

impl Worklist {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            seen: HashSet::default(),
        }
    }

    fn push(&mut self, reg: Reg) {
        if reg.segment == 0 {
            return;
        }
        if self.seen.insert(reg) {
            self.pending.push(reg);
        }
    }
}

fn collect_roots(s: &VmState, wl: &mut Worklist) {
    wl.push(s.r_acc);
    wl.push(s.r_prev);

    // live data stack cells, up to the topmost frame's extent
    let sp = s.execution_stack.last().map(|f| f.sp).unwrap_or(0);
    for &cell in s.segman.stack().entries.iter().take(sp) {
        wl.push(cell);
    }

    for frame in &s.execution_stack {
        wl.push(frame.objp);
        wl.push(frame.sendp);
        if let FrameKind::VarSelector { varp } = frame.kind {
            wl.push(selector::read_var(&s.segman, varp));
        }
    }

    // locked scripts pin their locals and every object they define
    for segid in 1..s.segman.segment_count() {
        let Some(SegmentObj::Script(script)) = s.segman.get(segid) else {
            continue;
        };
        if script.lockers == 0 {
            continue;
        }
        if script.locals_segment != 0 {
            wl.push(Reg {
                segment: script.locals_segment,
                offset: 0,
            });
        }
        for obj in script.objects.values() {
            wl.push(obj.pos);
        }
    }
}

/// Compute reachability and free everything deallocatable that was not
/// reached.
pub fn run_gc(s: &mut VmState) {
    let mut wl = Worklist::new();
    collect_roots(s, &mut wl);

    // expansion; stack-segment values are roots but never re-expanded
    let stack_segment = s.segman.stack_segment();
    let mut i = 0;
    while i < wl.pending.len() {
        let reg = wl.pending[i];
        i += 1;
        if reg.segment == stack_segment {
            continue;
        }
        if let Some(seg) = s.segman.get(reg.segment) {
            let mut found = Vec::new();
            seg.outgoing_refs(reg, &mut |r| found.push(r));
            for r in found {
                wl.push(r);
            }
        }
    }

    // canonicalize the reached set for sweep membership
    let mut used: HashSet<Reg, RandomState> = HashSet::default();
    for &reg in &wl.seen {
        if let Some(seg) = s.segman.get(reg.segment) {
            used.insert(seg.canonical_addr(reg));
        }
    }

    // sweep
    let mut freed = 0usize;
    for segid in 1..s.segman.segment_count() {
        let mut dead = Vec::new();
        if let Some(seg) = s.segman.get(segid) {
            seg.each_deallocatable(segid, &mut |addr| {
                if !used.contains(&addr) {
                    dead.push(addr);
                }
            });
        }
        freed += dead.len();
        for addr in dead {
            s.segman.free_at_address(addr);
        }
    }
    debug!("gc: {} reachable, {freed} freed", used.len());
}
