//! Execution stack frames. Every method call, local call, kernel call and
//! deferred var-selector access gets a frame; the interpreter always runs
//! the topmost `Call` frame.

use crate::{Reg, SegmentId, selector::ObjVarRef};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// regular bytecode activation
    Call,
    /// marker pushed around a kernel function invocation
    KernelCall { kernel_id: u16 },
    /// deferred property read/write queued by a send
    VarSelector { varp: ObjVarRef },
}

/// One activation. Stack positions (`fp`, `sp`, `argp`) are cell indices
/// into the data stack segment; `argp` addresses the argc cell, so
/// parameter variable 0 reads the argument count.
#[derive(Debug, Clone)]
pub struct ExecStack {
    /// object the code runs on behalf of (`self`)
    pub objp: Reg,
    /// object the send targeted; differs from `objp` for super sends
    pub sendp: Reg,
    pub kind: FrameKind,
    pub pc: Reg,
    /// frame base: temp variables start here
    pub fp: usize,
    /// one past the top of this frame's stack
    pub sp: usize,
    pub argc: usize,
    pub argp: usize,
    /// locals block of the script the code lives in
    pub local_segment: SegmentId,
    /// selector that spawned this frame, if any
    pub debug_selector: Option<u16>,
    /// export that spawned this frame, if any
    pub debug_exportid: Option<u16>,
    /// index of the frame that was on top when this one was created
    pub debug_origin: usize,
}

impl ExecStack {
    pub fn is_var_selector(&self) -> bool {
        matches!(self.kind, FrameKind::VarSelector { .. })
    }
}
