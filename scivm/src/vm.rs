//! The interpreter core: VM registers, the execution stack, send dispatch
//! and the bytecode loop.

use std::cmp::Ordering;

use log::{trace, warn};

use crate::{
    NULL_REG, Reg, SegmentId,
    debug::DebugHook,
    frame::{ExecStack, FrameKind},
    gc::{self, GC_INTERVAL},
    kernel::KernelTable,
    loader::ScriptLoader,
    make_reg,
    opcode::{self, Op, VarOp, VarTarget, VarType},
    script::ScriptLoadFlags,
    seg_manager::SegManager,
    selector::{self, ObjVarRef, SelectorKind, lookup_selector},
};

/// Version-dependent interpreter behavior.
#[derive(Debug, Copy, Clone)]
pub struct VmFeatures {
    /// old script headers consume the `&rest` adjustment after a kernel
    /// call instead of folding it into the argument count before
    pub old_script_header: bool,
    /// `lofsa`/`lofss` operands are absolute script offsets (relative to
    /// the post-instruction pc otherwise)
    pub lofs_absolute: bool,
    /// drop sends to selectors the object does not respond to instead of
    /// aborting
    pub tolerate_missing_selectors: bool,
}

impl Default for VmFeatures {
    fn default() -> Self {
        Self {
            old_script_header: false,
            lofs_absolute: true,
            tolerate_missing_selectors: false,
        }
    }
}

/// One queued sub-message of a send.
enum QueuedCall {
    Var {
        varp: ObjVarRef,
        argc: usize,
        argp: usize,
    },
    Invoke {
        func: Reg,
        selector: u16,
        argc: usize,
        argp: usize,
    },
}

pub struct VmState {
    pub segman: SegManager,
    pub execution_stack: Vec<ExecStack>,
    /// index of the oldest frame belonging to the current `run_vm`
    /// invocation; unwinding past it is a hard return
    pub execution_stack_base: usize,
    pub r_acc: Reg,
    pub r_prev: Reg,
    /// pending `&rest` argument count, consumed by the next call
    pub r_rest: u16,
    pub game_obj: Reg,
    /// locals segment of script 0, backing the global variables
    pub globals_segment: SegmentId,
    pub kernel: KernelTable,
    pub selector_names: Vec<String>,
    pub features: VmFeatures,
    pub gc_interval: u32,
    pub gc_countdown: u32,
    pub quit_flag: bool,
    pub restarting: bool,
    pub game_was_restarted: bool,
    pub debug_hook: Option<Box<dyn DebugHook>>,
}

impl VmState {
    pub fn new(loader: Box<dyn ScriptLoader>) -> Self {
        let segman = SegManager::new(loader);
        let selector_names = segman.selector_names();
        Self {
            segman,
            execution_stack: Vec::new(),
            execution_stack_base: 0,
            r_acc: NULL_REG,
            r_prev: NULL_REG,
            r_rest: 0,
            game_obj: NULL_REG,
            globals_segment: 0,
            kernel: KernelTable::with_defaults(),
            selector_names,
            features: VmFeatures::default(),
            gc_interval: GC_INTERVAL,
            gc_countdown: GC_INTERVAL,
            quit_flag: false,
            restarting: false,
            game_was_restarted: false,
            debug_hook: None,
        }
    }

    pub fn selector_id(&self, name: &str) -> Option<u16> {
        self.selector_names
            .iter()
            .position(|n| n == name)
            .map(|i| i as u16)
    }

    pub fn selector_name(&self, id: u16) -> String {
        self.selector_names
            .get(id as usize)
            .cloned()
            .unwrap_or_else(|| format!("<sel {id:#x}>"))
    }

    // --- data stack -----------------------------------------------------

    pub fn stack_read(&self, idx: usize) -> Reg {
        match self.segman.stack().entries.get(idx) {
            Some(&v) => v,
            None => panic!("stack read out of bounds (cell {idx})"),
        }
    }

    pub fn stack_write(&mut self, idx: usize, value: Reg) {
        match self.segman.stack_mut().entries.get_mut(idx) {
            Some(slot) => *slot = value,
            None => panic!("stack write out of bounds (cell {idx})"),
        }
    }

    fn top_index(&self) -> usize {
        if self.execution_stack.is_empty() {
            panic!("execution stack is empty");
        }
        self.execution_stack.len() - 1
    }

    fn push_val(&mut self, value: Reg) {
        let fi = self.top_index();
        let sp = self.execution_stack[fi].sp;
        if sp >= self.segman.stack().capacity() {
            panic!("stack overflow (sp {sp}) at {:?}", self.execution_stack[fi].pc);
        }
        self.segman.stack_mut().entries[sp] = value;
        self.execution_stack[fi].sp = sp + 1;
    }

    fn pop_val(&mut self) -> Reg {
        let fi = self.top_index();
        let sp = self.execution_stack[fi].sp;
        if sp == 0 {
            panic!("stack underflow at {:?}", self.execution_stack[fi].pc);
        }
        self.execution_stack[fi].sp = sp - 1;
        self.segman.stack().entries[sp - 1]
    }

    // --- variables ------------------------------------------------------

    fn locals_of(&self, segid: SegmentId) -> Option<&Vec<Reg>> {
        match self.segman.get(segid) {
            Some(crate::segment::SegmentObj::Locals(block)) => Some(&block.locals),
            _ => None,
        }
    }

    fn read_variable(&mut self, vartype: VarType, index: usize) -> Reg {
        let fi = self.top_index();
        let frame = &self.execution_stack[fi];
        match vartype {
            VarType::Global | VarType::Local => {
                let segid = if vartype == VarType::Global {
                    self.globals_segment
                } else {
                    frame.local_segment
                };
                match self.locals_of(segid).and_then(|l| l.get(index)) {
                    Some(&v) => v,
                    None => {
                        warn!("read of {vartype:?} variable {index} out of range");
                        NULL_REG
                    }
                }
            }
            VarType::Temp => {
                let idx = frame.fp + index;
                if idx >= frame.sp {
                    warn!("read of temp {index} beyond the current frame");
                }
                self.stack_read(idx)
            }
            VarType::Param => {
                // parameter 0 is the argument count itself
                if index > frame.argc {
                    warn!(
                        "read of parameter {index} with only {} arguments",
                        frame.argc
                    );
                    return NULL_REG;
                }
                self.stack_read(frame.argp + index)
            }
        }
    }

    fn write_variable(&mut self, vartype: VarType, index: usize, value: Reg) {
        let fi = self.top_index();
        let frame = &self.execution_stack[fi];
        match vartype {
            VarType::Global | VarType::Local => {
                let segid = if vartype == VarType::Global {
                    self.globals_segment
                } else {
                    frame.local_segment
                };
                let found = match self.segman.get_mut(segid) {
                    Some(crate::segment::SegmentObj::Locals(block)) => {
                        match block.locals.get_mut(index) {
                            Some(slot) => {
                                *slot = value;
                                true
                            }
                            None => false,
                        }
                    }
                    _ => false,
                };
                if !found {
                    warn!("write to {vartype:?} variable {index} out of range, ignored");
                }
            }
            VarType::Temp => {
                let idx = frame.fp + index;
                if idx >= frame.sp {
                    warn!("write to temp {index} beyond the current frame");
                }
                self.stack_write(idx, value);
            }
            VarType::Param => {
                if index > frame.argc {
                    warn!(
                        "write to parameter {index} with only {} arguments, ignored",
                        frame.argc
                    );
                    return;
                }
                self.stack_write(frame.argp + index, value);
            }
        }
    }

    fn read_property(&self, obj: Reg, index: usize) -> Reg {
        match self
            .segman
            .get_object(obj)
            .and_then(|o| o.variables.get(index))
        {
            Some(&v) => v,
            None => {
                warn!(
                    "property {index} read out of range on {}",
                    self.segman.object_name(obj)
                );
                NULL_REG
            }
        }
    }

    fn write_property(&mut self, obj: Reg, index: usize, value: Reg) {
        match self
            .segman
            .get_object_mut(obj)
            .and_then(|o| o.variables.get_mut(index))
        {
            Some(slot) => *slot = value,
            None => warn!("property {index} write out of range, ignored"),
        }
    }

    // --- send dispatch --------------------------------------------------

    /// Parse and realize a send. `framesize` counts stack cells starting at
    /// `argp`; `sp` is the frame top the spawned activations inherit.
    /// Returns the index of the new topmost frame when one was pushed.
    pub fn send_selector(
        &mut self,
        send_obj: Reg,
        work_obj: Reg,
        sp: usize,
        framesize: usize,
        argp: usize,
    ) -> Option<usize> {
        if !self.segman.is_object(send_obj) {
            panic!("send to invalid object {send_obj:?}");
        }
        let orig_len = self.execution_stack.len();

        let mut calls: Vec<QueuedCall> = Vec::new();
        let mut argp = argp;
        let mut remaining = framesize as isize;
        while remaining > 0 {
            let selector = self.stack_read(argp).require_u16();
            let argc = self.stack_read(argp + 1).require_u16() as usize;
            if argc > 0x800 {
                panic!(
                    "send of selector {} to {} with {argc} arguments",
                    self.selector_name(selector),
                    self.segman.object_name(send_obj)
                );
            }

            if self.debug_hook.is_some() {
                let obj_name = self.segman.object_name(send_obj);
                let sel_name = self.selector_name(selector);
                if let Some(hook) = self.debug_hook.as_mut() {
                    hook.on_send(&obj_name, &sel_name);
                }
            }

            match lookup_selector(&mut self.segman, send_obj, selector) {
                SelectorKind::None => {
                    if !self.features.tolerate_missing_selectors {
                        panic!(
                            "{} does not respond to {}",
                            self.segman.object_name(send_obj),
                            self.selector_name(selector)
                        );
                    }
                    warn!(
                        "{} does not respond to {}, sub-message dropped",
                        self.segman.object_name(send_obj),
                        self.selector_name(selector)
                    );
                }
                SelectorKind::Variable(varp) => {
                    if argc > 1 {
                        warn!(
                            "property send {} with {argc} arguments, extras ignored",
                            self.selector_name(selector)
                        );
                    }
                    calls.push(QueuedCall::Var {
                        varp,
                        argc,
                        argp: argp + 1,
                    });
                }
                SelectorKind::Method(func) => calls.push(QueuedCall::Invoke {
                    func,
                    selector,
                    argc,
                    argp: argp + 1,
                }),
            }
            remaining -= 2 + argc as isize;
            argp += 2 + argc;
        }

        // realize in reverse so the first sub-message runs first
        while let Some(call) = calls.pop() {
            match call {
                QueuedCall::Var { varp, argc, argp } => self.execution_stack.push(ExecStack {
                    objp: work_obj,
                    sendp: send_obj,
                    kind: FrameKind::VarSelector { varp },
                    pc: NULL_REG,
                    fp: sp,
                    sp,
                    argc,
                    argp,
                    local_segment: 0,
                    debug_selector: None,
                    debug_exportid: None,
                    debug_origin: orig_len.saturating_sub(1),
                }),
                QueuedCall::Invoke {
                    func,
                    selector,
                    argc,
                    argp,
                } => {
                    let local_segment = self
                        .segman
                        .get_script(func.segment)
                        .map(|s| s.locals_segment)
                        .unwrap_or(0);
                    self.execution_stack.push(ExecStack {
                        objp: work_obj,
                        sendp: send_obj,
                        kind: FrameKind::Call,
                        pc: func,
                        fp: sp,
                        sp,
                        argc,
                        argp,
                        local_segment,
                        debug_selector: Some(selector),
                        debug_exportid: None,
                        debug_origin: orig_len.saturating_sub(1),
                    });
                }
            }
        }

        self.exec_varselectors();
        (self.execution_stack.len() > orig_len).then(|| self.execution_stack.len() - 1)
    }

    /// Apply the var-selector frame on top of the execution stack without
    /// popping it.
    fn apply_var_frame_top(&mut self) {
        let fi = self.top_index();
        let frame = &self.execution_stack[fi];
        let FrameKind::VarSelector { varp } = frame.kind else {
            return;
        };
        if frame.argc == 0 {
            self.r_acc = selector::read_var(&self.segman, varp);
        } else {
            let value = self.stack_read(frame.argp + 1);
            selector::write_var(&mut self.segman, varp, value);
        }
    }

    /// Drain var-selector frames sitting on top of the execution stack.
    fn exec_varselectors(&mut self) {
        while let Some(top) = self.execution_stack.last() {
            if !top.is_var_selector() {
                break;
            }
            self.apply_var_frame_top();
            self.execution_stack.pop();
        }
    }

    /// Push an activation for a script export. A missing or null export is
    /// tolerated: the call is ignored.
    pub fn execute_method(
        &mut self,
        script: u16,
        export: u16,
        sp: usize,
        calling_obj: Reg,
        argc: usize,
        argp: usize,
    ) -> Option<usize> {
        let Some(segid) = self.segman.get_script_segment(script, ScriptLoadFlags::LOAD) else {
            panic!("script {script} could not be instantiated for an export call");
        };
        let Some(offset) = self.segman.export_offset(segid, export) else {
            warn!("call to invalid export {export} of script {script}, ignored");
            return None;
        };
        if let Some(hook) = self.debug_hook.as_mut() {
            hook.on_export_call(script, export);
        }
        let local_segment = self
            .segman
            .get_script(segid)
            .map(|s| s.locals_segment)
            .unwrap_or(0);
        self.execution_stack.push(ExecStack {
            objp: calling_obj,
            sendp: calling_obj,
            kind: FrameKind::Call,
            pc: make_reg(segid, offset),
            fp: sp,
            sp,
            argc,
            argp,
            local_segment,
            debug_selector: None,
            debug_exportid: Some(export),
            debug_origin: self.execution_stack.len().saturating_sub(1),
        });
        Some(self.execution_stack.len() - 1)
    }

    // --- garbage collection trigger -------------------------------------

    fn maybe_gc(&mut self) {
        self.gc_countdown = self.gc_countdown.saturating_sub(1);
        if self.gc_countdown == 0 {
            self.gc_countdown = self.gc_interval;
            gc::run_gc(self);
        }
    }

    // --- return handling ------------------------------------------------

    /// Unwind one activation. Returns true when the pop crossed the
    /// invocation base (hard return).
    fn op_ret(&mut self) -> bool {
        loop {
            let popping_base = self.top_index() == self.execution_stack_base;
            self.execution_stack.pop();
            if popping_base {
                return true;
            }
            let Some(top) = self.execution_stack.last() else {
                return true;
            };
            if top.is_var_selector() {
                // deferred property access exposed by the pop: apply it
                // and keep unwinding
                self.apply_var_frame_top();
                continue;
            }
            return false;
        }
    }

    // --- the interpreter loop -------------------------------------------

    /// Run bytecode until the frame that was on top at entry returns.
    /// `restoring` keeps the previously established invocation base.
    pub fn run_vm(&mut self, restoring: bool) {
        let old_base = self.execution_stack_base;
        if !restoring {
            self.execution_stack_base = self.top_index();
        }

        loop {
            if self.quit_flag || self.restarting {
                return;
            }
            self.exec_varselectors();
            if self.execution_stack.len() <= self.execution_stack_base {
                self.execution_stack_base = old_base;
                return;
            }

            let fi = self.top_index();
            let pc = self.execution_stack[fi].pc;
            let objp = self.execution_stack[fi].objp;
            let local_segment = self.execution_stack[fi].local_segment;

            let insn = {
                let Some(script) = self.segman.get_script(pc.segment) else {
                    panic!("pc {pc:?} does not point into a script segment");
                };
                match opcode::decode(&script.buf, pc.offset as usize) {
                    Ok(insn) => insn,
                    Err(err) => panic!("undecodable instruction at {pc:?}: {err:?}"),
                }
            };
            let next_pc = make_reg(pc.segment, pc.offset.wrapping_add(insn.size as u16));
            self.execution_stack[fi].pc = next_pc;
            trace!("{pc:?}: {}", insn.op.name());
            let [p0, p1, p2] = insn.params;

            match insn.op {
                // arithmetic; the left operand comes off the stack
                Op::Add => {
                    let b = self.r_acc;
                    let a = self.pop_val();
                    self.r_acc = a.add(b);
                }
                Op::Sub => {
                    let b = self.r_acc;
                    let a = self.pop_val();
                    self.r_acc = a.sub(b);
                }
                Op::Mul => {
                    let b = self.r_acc.require_i16();
                    let a = self.pop_val().require_i16();
                    self.r_acc = Reg::from(a.wrapping_mul(b));
                }
                Op::Div => {
                    let b = self.r_acc;
                    let a = self.pop_val();
                    if a.is_pointer() || b.is_pointer() {
                        panic!("division involving pointer values ({a:?} / {b:?}) at {pc:?}");
                    }
                    self.r_acc = if b.to_i16() == 0 {
                        warn!("division by zero at {pc:?}");
                        NULL_REG
                    } else {
                        Reg::from(a.to_i16().wrapping_div(b.to_i16()))
                    };
                }
                Op::Mod => {
                    let b = self.r_acc.require_i16();
                    let a = self.pop_val().require_i16();
                    self.r_acc = if b == 0 {
                        warn!("modulo by zero at {pc:?}");
                        NULL_REG
                    } else {
                        Reg::from(a.wrapping_rem(b))
                    };
                }
                Op::Shr => {
                    let b = self.r_acc.require_u16();
                    let a = self.pop_val().require_u16();
                    self.r_acc = Reg::from(if b >= 16 { 0 } else { a >> b });
                }
                Op::Shl => {
                    let b = self.r_acc.require_u16();
                    let a = self.pop_val().require_u16();
                    self.r_acc = Reg::from(if b >= 16 { 0 } else { a << b });
                }
                Op::Xor => {
                    let b = self.r_acc.require_u16();
                    let a = self.pop_val().require_u16();
                    self.r_acc = Reg::from(a ^ b);
                }
                Op::And => {
                    let b = self.r_acc.require_u16();
                    let a = self.pop_val().require_u16();
                    self.r_acc = Reg::from(a & b);
                }
                Op::Or => {
                    let b = self.r_acc.require_u16();
                    let a = self.pop_val().require_u16();
                    self.r_acc = Reg::from(a | b);
                }
                Op::Neg => self.r_acc = Reg::from(self.r_acc.require_i16().wrapping_neg()),
                Op::Not => self.r_acc = Reg::from(self.r_acc.is_null() as u16),
                Op::Bnot => self.r_acc = Reg::from(self.r_acc.require_u16() ^ 0xFFFF),

                // comparisons; these are the only writers of r_prev
                Op::Eq => {
                    let a = self.pop_val();
                    self.r_prev = self.r_acc;
                    self.r_acc = Reg::from((a == self.r_acc) as u16);
                }
                Op::Ne => {
                    let a = self.pop_val();
                    self.r_prev = self.r_acc;
                    self.r_acc = Reg::from((a != self.r_acc) as u16);
                }
                Op::Gt | Op::Ge | Op::Lt | Op::Le => {
                    let b = self.r_acc;
                    let a = self.pop_val();
                    self.r_prev = b;
                    let ord = compare_values(a, b, true);
                    self.r_acc = Reg::from(match insn.op {
                        Op::Gt => ord == Ordering::Greater,
                        Op::Ge => ord != Ordering::Less,
                        Op::Lt => ord == Ordering::Less,
                        _ => ord != Ordering::Greater,
                    } as u16);
                }
                Op::Ugt | Op::Uge | Op::Ult | Op::Ule => {
                    let b = self.r_acc;
                    let a = self.pop_val();
                    self.r_prev = b;
                    let ord = compare_values(a, b, false);
                    self.r_acc = Reg::from(match insn.op {
                        Op::Ugt => ord == Ordering::Greater,
                        Op::Uge => ord != Ordering::Less,
                        Op::Ult => ord == Ordering::Less,
                        _ => ord != Ordering::Greater,
                    } as u16);
                }

                // control flow
                Op::Bt => {
                    if !self.r_acc.is_null() {
                        self.execution_stack[fi].pc.incr_offset(p0 as i16);
                    }
                }
                Op::Bnt => {
                    if self.r_acc.is_null() {
                        self.execution_stack[fi].pc.incr_offset(p0 as i16);
                    }
                }
                Op::Jmp => self.execution_stack[fi].pc.incr_offset(p0 as i16),

                // immediates and plain stack traffic
                Op::Ldi => self.r_acc = Reg::from(p0 as i16),
                Op::Push => self.push_val(self.r_acc),
                Op::Pushi => self.push_val(Reg::from(p0 as i16)),
                Op::Push0 => self.push_val(NULL_REG),
                Op::Push1 => self.push_val(Reg::from(1u16)),
                Op::Push2 => self.push_val(Reg::from(2u16)),
                Op::PushSelf => self.push_val(objp),
                Op::Pprev => self.push_val(self.r_prev),
                Op::Dup => {
                    let sp = self.execution_stack[fi].sp;
                    if sp == 0 {
                        panic!("stack underflow in dup at {pc:?}");
                    }
                    let v = self.stack_read(sp - 1);
                    self.push_val(v);
                }
                Op::Toss => {
                    self.pop_val();
                }
                Op::Link => {
                    for _ in 0..p0 as usize {
                        self.push_val(NULL_REG);
                    }
                }

                // calls
                Op::Call => {
                    let rest = self.r_rest as usize;
                    let argc_cells = (p1 as usize >> 1) + 1 + rest;
                    let old_top = self.execution_stack[fi].sp;
                    if argc_cells > old_top {
                        panic!("stack underflow in call at {pc:?}");
                    }
                    let call_base = old_top - argc_cells;
                    let mut argc_cell = self.stack_read(call_base);
                    argc_cell.incr_offset(rest as i16);
                    self.stack_write(call_base, argc_cell);
                    self.r_rest = 0;
                    self.execution_stack[fi].sp = call_base;
                    let argc = argc_cell.require_u16() as usize;
                    let target = make_reg(pc.segment, next_pc.offset.wrapping_add(p0 as u16));
                    self.execution_stack.push(ExecStack {
                        objp,
                        sendp: objp,
                        kind: FrameKind::Call,
                        pc: target,
                        fp: old_top,
                        sp: old_top,
                        argc,
                        argp: call_base,
                        local_segment,
                        debug_selector: None,
                        debug_exportid: None,
                        debug_origin: fi,
                    });
                }
                Op::Callk => self.op_callk(fi, pc, next_pc, objp, local_segment, p0, p1),
                Op::Callb | Op::Calle => {
                    let (script, export, arg_bytes) = if insn.op == Op::Callb {
                        (0, p0 as u16, p1 as usize)
                    } else {
                        (p0 as u16, p1 as u16, p2 as usize)
                    };
                    let rest = self.r_rest as usize;
                    let argc_cells = (arg_bytes >> 1) + 1 + rest;
                    let old_top = self.execution_stack[fi].sp;
                    if argc_cells > old_top {
                        panic!("stack underflow in export call at {pc:?}");
                    }
                    let argp = old_top - argc_cells;
                    let mut argc_cell = self.stack_read(argp);
                    argc_cell.incr_offset(rest as i16);
                    self.stack_write(argp, argc_cell);
                    self.r_rest = 0;
                    self.execution_stack[fi].sp = argp;
                    let argc = argc_cell.require_u16() as usize;
                    self.execute_method(script, export, old_top, objp, argc, argp);
                }
                Op::Ret => {
                    if self.op_ret() {
                        self.execution_stack_base = old_base;
                        return;
                    }
                }

                // sends
                Op::Send | Op::SelfSend | Op::SuperSend => {
                    let (send_obj, frame_bytes) = match insn.op {
                        Op::Send => (self.r_acc, p0 as usize),
                        Op::SelfSend => (objp, p0 as usize),
                        _ => {
                            let class_id = p0 as u16;
                            let Some(class_addr) = self
                                .segman
                                .get_class_address(class_id, ScriptLoadFlags::LOAD)
                            else {
                                panic!("super send to unresolvable class {class_id} at {pc:?}");
                            };
                            (class_addr, p1 as usize)
                        }
                    };
                    let rest = self.r_rest as usize;
                    let words = (frame_bytes >> 1) + rest;
                    let old_top = self.execution_stack[fi].sp;
                    if words > old_top {
                        panic!("stack underflow in send at {pc:?}");
                    }
                    let argp = old_top - words;
                    if rest > 0 {
                        // the adjustment lands in the first sub-message
                        let mut argc_cell = self.stack_read(argp + 1);
                        argc_cell.incr_offset(rest as i16);
                        self.stack_write(argp + 1, argc_cell);
                    }
                    self.r_rest = 0;
                    self.execution_stack[fi].sp = argp;
                    let work_obj = if insn.op == Op::Send { send_obj } else { objp };
                    self.send_selector(send_obj, work_obj, old_top, words, argp);
                }

                Op::Class => {
                    let class_id = p0 as u16;
                    let Some(addr) = self
                        .segman
                        .get_class_address(class_id, ScriptLoadFlags::LOAD)
                    else {
                        panic!("reference to unresolvable class {class_id} at {pc:?}");
                    };
                    self.r_acc = addr;
                }
                Op::SelfId => self.r_acc = objp,

                Op::Rest => {
                    let frame = &self.execution_stack[fi];
                    let (argc, argp) = (frame.argc, frame.argp);
                    let first = p0 as usize;
                    self.r_rest = (argc as isize - first as isize + 1).max(0) as u16;
                    for i in first..=argc {
                        let v = self.stack_read(argp + i);
                        self.push_val(v);
                    }
                }

                Op::Lea => {
                    let vt = (p0 as u16) >> 1;
                    let mut varnum = p1 as u16;
                    if vt & 0x8 != 0 {
                        varnum = varnum.wrapping_add(self.r_acc.require_i16() as u16);
                    }
                    let frame = &self.execution_stack[fi];
                    self.r_acc = match vt & 0x3 {
                        0 => make_reg(self.globals_segment, varnum * 2),
                        1 => make_reg(local_segment, varnum * 2),
                        2 => make_reg(
                            self.segman.stack_segment(),
                            ((frame.fp + varnum as usize) * 2) as u16,
                        ),
                        _ => make_reg(
                            self.segman.stack_segment(),
                            ((frame.argp + varnum as usize) * 2) as u16,
                        ),
                    };
                }

                // property access on self
                Op::Ptoa => self.r_acc = self.read_property(objp, p0 as usize >> 1),
                Op::Atop => self.write_property(objp, p0 as usize >> 1, self.r_acc),
                Op::Ptos => {
                    let v = self.read_property(objp, p0 as usize >> 1);
                    self.push_val(v);
                }
                Op::Stop => {
                    let v = self.pop_val();
                    self.write_property(objp, p0 as usize >> 1, v);
                }
                Op::Iptoa | Op::Dptoa | Op::Iptos | Op::Dptos => {
                    let index = p0 as usize >> 1;
                    let delta = Reg::from(1u16);
                    let old = self.read_property(objp, index);
                    let new = if matches!(insn.op, Op::Iptoa | Op::Iptos) {
                        old.add(delta)
                    } else {
                        old.sub(delta)
                    };
                    self.write_property(objp, index, new);
                    if matches!(insn.op, Op::Iptoa | Op::Dptoa) {
                        self.r_acc = new;
                    } else {
                        self.push_val(new);
                    }
                }

                Op::Lofsa | Op::Lofss => {
                    let addr = if self.features.lofs_absolute {
                        make_reg(pc.segment, p0 as u16)
                    } else {
                        make_reg(pc.segment, next_pc.offset.wrapping_add(p0 as u16))
                    };
                    if insn.op == Op::Lofsa {
                        self.r_acc = addr;
                    } else {
                        self.push_val(addr);
                    }
                }

                Op::Line => {} // source line annotation

                Op::VarAccess {
                    oper,
                    target,
                    vartype,
                } => self.op_var_access(oper, target, vartype, p0),
            }
        }
    }

    fn op_var_access(&mut self, oper: VarOp, target: VarTarget, vartype: VarType, p0: i32) {
        let indexed = matches!(target, VarTarget::AccIndexed | VarTarget::StackIndexed);
        let to_stack = matches!(target, VarTarget::Stack | VarTarget::StackIndexed);
        let index = if indexed {
            let idx = p0 + self.r_acc.require_i16() as i32;
            if idx < 0 {
                warn!("negative variable index {idx} clamped to 0");
                0
            } else {
                idx as usize
            }
        } else {
            p0 as usize
        };

        match oper {
            VarOp::Load => {
                let v = self.read_variable(vartype, index);
                if to_stack {
                    self.push_val(v);
                } else {
                    self.r_acc = v;
                }
            }
            VarOp::Store => {
                // indexed stores take their value from the stack since the
                // accumulator carries the index
                let value = if to_stack || indexed {
                    self.pop_val()
                } else {
                    self.r_acc
                };
                if indexed && !to_stack {
                    self.r_acc = value;
                }
                self.write_variable(vartype, index, value);
            }
            VarOp::IncLoad | VarOp::DecLoad => {
                let delta = Reg::from(1u16);
                let old = self.read_variable(vartype, index);
                let new = if oper == VarOp::IncLoad {
                    old.add(delta)
                } else {
                    old.sub(delta)
                };
                self.write_variable(vartype, index, new);
                if to_stack {
                    self.push_val(new);
                } else {
                    self.r_acc = new;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn op_callk(
        &mut self,
        fi: usize,
        pc: Reg,
        next_pc: Reg,
        objp: Reg,
        local_segment: SegmentId,
        p0: i32,
        p1: i32,
    ) {
        self.maybe_gc();

        let kernel_id = p0 as u16;
        let rest = self.r_rest as usize;
        let mut argc_cells = (p1 as usize >> 1) + 1;
        if !self.features.old_script_header {
            argc_cells += rest;
        }
        let old_sp = self.execution_stack[fi].sp;
        if argc_cells > old_sp {
            panic!("stack underflow in kernel call at {pc:?}");
        }
        let argp = old_sp - argc_cells;
        self.execution_stack[fi].sp = argp;
        let mut argc = self.stack_read(argp).require_u16() as usize;
        if !self.features.old_script_header {
            argc += rest;
            self.r_rest = 0;
        }

        let Some(func) = self.kernel.get(kernel_id) else {
            panic!(
                "callk to undefined kernel function {kernel_id:#x} at {pc:?}"
            );
        };
        trace!("callk {} ({argc} args)", self.kernel.name_of(kernel_id));

        // marker frame so the collector sees the kernel's arguments
        self.execution_stack.push(ExecStack {
            objp,
            sendp: objp,
            kind: FrameKind::KernelCall { kernel_id },
            pc: next_pc,
            fp: argp,
            sp: argp + 1 + argc,
            argc,
            argp,
            local_segment,
            debug_selector: None,
            debug_exportid: None,
            debug_origin: fi,
        });
        let argv: Vec<Reg> = (0..argc).map(|i| self.stack_read(argp + 1 + i)).collect();
        self.r_acc = func(self, &argv);
        self.execution_stack.pop();

        if self.features.old_script_header {
            self.r_rest = 0;
        }
    }

    // --- game driver ----------------------------------------------------

    /// Instantiate script 0, bind the globals and locate the game object.
    pub fn init_game(&mut self) -> bool {
        let Some(seg0) = self
            .segman
            .get_script_segment(0, ScriptLoadFlags::LOAD | ScriptLoadFlags::LOCK)
        else {
            warn!("script 0 could not be instantiated");
            return false;
        };
        self.globals_segment = self
            .segman
            .get_script(seg0)
            .map(|s| s.locals_segment)
            .unwrap_or(0);
        let Some((script, offset)) = self.segman.game_object_location() else {
            warn!("the loader does not know a game object");
            return false;
        };
        let segid = if script == 0 {
            seg0
        } else {
            match self
                .segman
                .get_script_segment(script, ScriptLoadFlags::LOAD | ScriptLoadFlags::LOCK)
            {
                Some(segid) => segid,
                None => {
                    warn!("game object script {script} could not be instantiated");
                    return false;
                }
            }
        };
        self.game_obj = make_reg(segid, offset);
        if !self.segman.is_object(self.game_obj) {
            warn!("no object at game object location {:?}", self.game_obj);
            self.game_obj = NULL_REG;
            return false;
        }
        true
    }

    /// Send `play` to the game object and interpret until it returns,
    /// restarting on request.
    pub fn run_game(&mut self) {
        if self.game_obj.is_null() && !self.init_game() {
            panic!("game could not be initialized");
        }
        loop {
            self.send_play();
            if self.restarting {
                self.restarting = false;
                self.game_was_restarted = true;
                self.execution_stack.clear();
                self.execution_stack_base = 0;
                self.r_acc = NULL_REG;
                self.r_prev = NULL_REG;
                self.r_rest = 0;
                continue;
            }
            break;
        }
        if self.quit_flag {
            self.execution_stack.clear();
        }
    }

    fn send_play(&mut self) {
        let Some(play) = self.selector_id("play") else {
            panic!("selector table has no 'play'");
        };
        self.stack_write(0, Reg::from(play));
        self.stack_write(1, NULL_REG); // argc 0
        let orig = self.execution_stack.len();
        self.send_selector(self.game_obj, self.game_obj, 2, 2, 0);
        if self.execution_stack.len() > orig {
            self.run_vm(false);
        }
    }

    pub fn request_restart(&mut self) {
        self.restarting = true;
    }

    pub fn request_quit(&mut self) {
        self.quit_flag = true;
    }
}

/// Three-way compare with the pointer rules: same-segment pointers compare
/// by offset, pointer/integer mixes warn and compare offsets, plain
/// integers compare signed or unsigned as requested.
fn compare_values(a: Reg, b: Reg, signed: bool) -> Ordering {
    if a.segment == b.segment && a.segment != 0 {
        a.offset.cmp(&b.offset)
    } else if a.is_pointer() || b.is_pointer() {
        warn!("comparison between pointer and integer: {a:?} vs {b:?}");
        a.offset.cmp(&b.offset)
    } else if signed {
        a.to_i16().cmp(&b.to_i16())
    } else {
        a.offset.cmp(&b.offset)
    }
}

#[cfg(test)]
mod interpreter_tests {
    use super::*;
    use crate::kernel::KernelTable;
    use crate::loader::{MemoryLoader, ObjectBlob, ScriptBlob, ScriptBuilder};
    use crate::segment::SegmentObj;
    use std::rc::Rc;

    // selector ids fixed by the fixture selector table
    const SEL_PLAY: u16 = 4;
    const SEL_COUNT: u16 = 5;
    const SEL_BUMP: u16 = 6;
    const SEL_DESCRIBE: u16 = 7;
    const SEL_PARENT: u16 = 8;
    const SEL_GET_COUNT: u16 = 9;

    fn selectors() -> Vec<&'static str> {
        vec![
            "species",
            "superClass",
            "-info-",
            "name",
            "play",
            "count",
            "bump",
            "describe",
            "parent",
            "getCount",
        ]
    }

    fn state_from(loader: MemoryLoader) -> VmState {
        VmState::new(Box::new(loader))
    }

    /// Stage `args` at the bottom of the data stack and interpret an
    /// export until it hard-returns.
    fn run_export(state: &mut VmState, script: u16, export: u16, args: &[Reg]) -> Reg {
        state.stack_write(0, Reg::from(args.len() as u16));
        for (i, &a) in args.iter().enumerate() {
            state.stack_write(1 + i, a);
        }
        let sp = 1 + args.len();
        if state
            .execute_method(script, export, sp, NULL_REG, args.len(), 0)
            .is_some()
        {
            state.run_vm(false);
        }
        state.r_acc
    }

    fn bind_globals(state: &mut VmState) {
        let seg0 = state
            .segman
            .get_script_segment(0, ScriptLoadFlags::LOAD)
            .unwrap();
        state.globals_segment = state.segman.get_script(seg0).unwrap().locals_segment;
    }

    fn global(state: &VmState, index: usize) -> Reg {
        match state.segman.get(state.globals_segment) {
            Some(SegmentObj::Locals(block)) => block.locals[index],
            _ => panic!("globals segment not bound"),
        }
    }

    fn single_script(code: ScriptBuilder, exports: Vec<u16>) -> MemoryLoader {
        let mut loader = MemoryLoader::new();
        loader.set_selectors(&selectors());
        loader.add_script(
            0,
            ScriptBlob {
                bytecode: code.finish(),
                exports,
                objects: Vec::new(),
                locals: vec![NULL_REG; 4],
            },
        );
        loader
    }

    #[test]
    fn arithmetic_combines_stack_and_accumulator() {
        let mut code = ScriptBuilder::new();
        code.ret(); // export slot 0 must stay nonzero
        let entry = code.here();
        code.pushi(5).ldi(3).add().ret();
        let mut state = state_from(single_script(code, vec![0, entry]));
        assert_eq!(run_export(&mut state, 0, 1, &[]), Reg::from(8u16));
        assert!(state.execution_stack.is_empty());
    }

    #[test]
    fn comparisons_branch_and_update_prev() {
        // max(p1, p2)
        let mut code = ScriptBuilder::new();
        code.ret();
        let max_entry = code.here();
        code.lsp(1).lap(2).gt();
        let fix = code.here() + 1;
        code.bnt(0);
        code.lap(1).ret();
        let otherwise = code.here();
        code.patch_word(fix, otherwise - (fix + 2));
        code.lap(2).ret();

        let prev_entry = code.here();
        code.pushi(3).ldi(4).eq().pprev().ldi(0).add().ret();

        let mut state = state_from(single_script(code, vec![0, max_entry, prev_entry]));
        let args = [Reg::from(7u16), Reg::from(3u16)];
        assert_eq!(run_export(&mut state, 0, 1, &args), Reg::from(7u16));
        let args = [Reg::from(2u16), Reg::from(9u16)];
        assert_eq!(run_export(&mut state, 0, 1, &args), Reg::from(9u16));
        // pprev exposes the pre-comparison accumulator
        assert_eq!(run_export(&mut state, 0, 2, &[]), Reg::from(4u16));
    }

    #[test]
    fn local_calls_pass_arguments_and_soft_return() {
        let mut code = ScriptBuilder::new();
        code.ret();
        let double = code.here();
        code.lap(1).push().lap(1).add().ret();
        let entry = code.here();
        code.pushi(1).pushi(21);
        let after_call = code.here() + 4;
        code.call(double as i16 - after_call as i16, 2);
        code.ret();

        let mut state = state_from(single_script(code, vec![0, entry]));
        assert_eq!(run_export(&mut state, 0, 1, &[]), Reg::from(42u16));
    }

    #[test]
    fn callb_reaches_another_export_of_the_base_script() {
        let mut code = ScriptBuilder::new();
        code.ret();
        let square = code.here();
        code.lap(1).push().lap(1).mul().ret();
        let entry = code.here();
        code.pushi(1).pushi(5).callb(2, 2).ret();

        let mut state = state_from(single_script(code, vec![0, entry, square]));
        assert_eq!(run_export(&mut state, 0, 1, &[]), Reg::from(25u16));
    }

    #[test]
    fn temp_variables_live_between_link_and_return() {
        let mut code = ScriptBuilder::new();
        code.ret();
        let entry = code.here();
        code.link(2);
        code.ldi(9).sat(0);
        code.ldi(4).sat(1);
        code.lat(0).push().lat(1).add().ret();
        let mut state = state_from(single_script(code, vec![0, entry]));
        assert_eq!(run_export(&mut state, 0, 1, &[]), Reg::from(13u16));
    }

    #[test]
    fn inc_and_dec_write_through_to_locals() {
        let mut code = ScriptBuilder::new();
        code.ret();
        let entry = code.here();
        code.plus_al(0).ret();
        let mut loader = single_script(code, vec![0, entry]);
        // overwrite locals with a starting value
        let mut blob = loader.load_script(0).unwrap();
        blob.locals[0] = Reg::from(41u16);
        loader.add_script(0, blob);

        let mut state = state_from(loader);
        assert_eq!(run_export(&mut state, 0, 1, &[]), Reg::from(42u16));
        let seg0 = state.segman.script_segment_of(0).unwrap();
        let locals = state.segman.get_script(seg0).unwrap().locals_segment;
        match state.segman.get(locals) {
            Some(SegmentObj::Locals(block)) => assert_eq!(block.locals[0], Reg::from(42u16)),
            _ => panic!("locals segment missing"),
        }
    }

    /// Loader with one script containing a recording object: each method
    /// appends its digit to global 0 (g0 = g0 * 10 + k).
    fn ordering_fixture() -> MemoryLoader {
        let mut code = ScriptBuilder::new();
        code.ret();
        let method = |code: &mut ScriptBuilder, k: i16| {
            let at = code.here();
            code.lag(0).push().ldi(10).mul().push().ldi(k).add().sag(0).ret();
            at
        };
        let m1 = method(&mut code, 1);
        let m2 = method(&mut code, 2);
        let m3 = method(&mut code, 3);
        let entry = code.here();
        code.pushi(SEL_COUNT as i16).pushi(0);
        code.pushi(SEL_BUMP as i16).pushi(0);
        code.pushi(SEL_DESCRIBE as i16).pushi(0);
        code.lofsa(0x100);
        code.send(12);
        code.ret();

        let mut loader = MemoryLoader::new();
        loader.set_selectors(&selectors());
        loader.add_script(
            0,
            ScriptBlob {
                bytecode: code.finish(),
                exports: vec![0, entry],
                objects: vec![
                    ObjectBlob::new(0x100, "recorder", 0, 0xFFFF, 0)
                        .with_method(SEL_COUNT, m1)
                        .with_method(SEL_BUMP, m2)
                        .with_method(SEL_DESCRIBE, m3),
                ],
                locals: vec![NULL_REG; 2],
            },
        );
        loader
    }

    #[test]
    fn send_runs_sub_messages_in_encounter_order() {
        let mut state = state_from(ordering_fixture());
        bind_globals(&mut state);
        run_export(&mut state, 0, 1, &[]);
        assert_eq!(global(&state, 0), Reg::from(123u16));
    }

    fn object_fixture() -> MemoryLoader {
        let mut code = ScriptBuilder::new();
        code.ret();
        // count is property slot 4, byte offset 8
        let bump = code.here();
        code.iptoa(8).ret();
        let get_count = code.here();
        code.ptoa(8).ret();
        let read_entry = code.here();
        code.pushi(SEL_COUNT as i16).pushi(0);
        code.lofsa(0x80);
        code.send(4);
        code.ret();
        let write_read_entry = code.here();
        code.pushi(SEL_COUNT as i16).pushi(1).pushi(9);
        code.pushi(SEL_COUNT as i16).pushi(0);
        code.lofsa(0x80);
        code.send(10);
        code.ret();
        let bump_entry = code.here();
        code.pushi(SEL_BUMP as i16).pushi(0);
        code.lofsa(0x80);
        code.send(4);
        code.ret();
        let mixed_entry = code.here();
        code.pushi(SEL_GET_COUNT as i16).pushi(0);
        code.pushi(SEL_COUNT as i16).pushi(1).pushi(9);
        code.lofsa(0x80);
        code.send(10);
        code.ret();

        let mut loader = MemoryLoader::new();
        loader.set_selectors(&selectors());
        loader.add_script(
            0,
            ScriptBlob {
                bytecode: code.finish(),
                exports: vec![0, read_entry, write_read_entry, bump_entry, mixed_entry],
                objects: vec![
                    ObjectBlob::new(0x80, "counter", 0, 0xFFFF, 0)
                        .with_prop(SEL_COUNT, Reg::from(3u16))
                        .with_method(SEL_BUMP, bump)
                        .with_method(SEL_GET_COUNT, get_count),
                ],
                locals: Vec::new(),
            },
        );
        loader
    }

    fn counter_addr(state: &VmState) -> Reg {
        make_reg(state.segman.script_segment_of(0).unwrap(), 0x80)
    }

    #[test]
    fn property_sends_read_and_write_slots() {
        let mut state = state_from(object_fixture());
        assert_eq!(run_export(&mut state, 0, 1, &[]), Reg::from(3u16));
        // write then read in one send: the write lands first
        assert_eq!(run_export(&mut state, 0, 2, &[]), Reg::from(9u16));
    }

    #[test]
    fn property_opcodes_mutate_self() {
        let mut state = state_from(object_fixture());
        assert_eq!(run_export(&mut state, 0, 3, &[]), Reg::from(4u16));
        let obj = state.segman.get_object(counter_addr(&state)).unwrap();
        assert_eq!(obj.variables[4], Reg::from(4u16));
    }

    #[test]
    fn var_selector_writes_defer_until_the_method_returns() {
        let mut state = state_from(object_fixture());
        // getCount runs before the queued write is applied
        assert_eq!(run_export(&mut state, 0, 4, &[]), Reg::from(3u16));
        let obj = state.segman.get_object(counter_addr(&state)).unwrap();
        assert_eq!(obj.variables[4], Reg::from(9u16));
    }

    #[test]
    fn tolerated_missing_selectors_are_dropped() {
        let mut code = ScriptBuilder::new();
        code.ret();
        let entry = code.here();
        code.link(1);
        code.ldi(5).sat(0);
        code.pushi(SEL_PARENT as i16).pushi(0);
        code.lofsa(0x40);
        code.send(4);
        code.lat(0);
        code.ret();

        let mut loader = MemoryLoader::new();
        loader.set_selectors(&selectors());
        loader.add_script(
            0,
            ScriptBlob {
                bytecode: code.finish(),
                exports: vec![0, entry],
                objects: vec![ObjectBlob::new(0x40, "mute", 0, 0xFFFF, 0)],
                locals: Vec::new(),
            },
        );
        let mut state = state_from(loader);
        state.features.tolerate_missing_selectors = true;
        // the send realizes nothing; execution continues and the frame
        // (including its temps) is intact afterwards
        assert_eq!(run_export(&mut state, 0, 1, &[]), Reg::from(5u16));
        assert!(state.execution_stack.is_empty());
    }

    #[test]
    fn rest_forwards_the_callers_tail_arguments() {
        let mut code = ScriptBuilder::new();
        code.ret();
        let sum = code.here();
        code.lap(1).push().lap(2).add().ret();
        let entry = code.here();
        code.pushi(0);
        code.rest(1);
        let after_call = code.here() + 4;
        code.call(sum as i16 - after_call as i16, 0);
        code.ret();

        let mut state = state_from(single_script(code, vec![0, entry]));
        let args = [Reg::from(5u16), Reg::from(6u16)];
        assert_eq!(run_export(&mut state, 0, 1, &args), Reg::from(11u16));
    }

    #[test]
    fn rest_folds_into_kernel_call_arguments() {
        let kernel_id = KernelTable::with_defaults().len() as u16;
        let mut code = ScriptBuilder::new();
        code.ret();
        let entry = code.here();
        code.pushi(0);
        code.rest(1);
        code.callk(kernel_id, 0);
        code.ret();

        let mut state = state_from(single_script(code, vec![0, entry]));
        state.kernel.install(
            "TestSum",
            Rc::new(|_s: &mut VmState, argv: &[Reg]| {
                let total: u16 = argv.iter().map(|a| a.to_u16()).sum();
                Reg::from(total)
            }),
        );
        let args = [Reg::from(5u16), Reg::from(6u16)];
        assert_eq!(run_export(&mut state, 0, 1, &args), Reg::from(11u16));
        assert_eq!(state.r_rest, 0);
    }

    #[test]
    fn kernel_reentry_nests_hard_returns() {
        let kernel_id = KernelTable::with_defaults().len() as u16;
        let mut code = ScriptBuilder::new();
        code.ret();
        let inner = code.here();
        code.ldi(7).ret();
        let entry = code.here();
        code.pushi(0);
        code.callk(kernel_id, 0);
        code.ret();

        let mut state = state_from(single_script(code, vec![0, entry, inner]));
        state.kernel.install(
            "TestNest",
            Rc::new(|s: &mut VmState, _argv: &[Reg]| {
                // run export 2 to completion without unwinding the caller
                let sp = s.execution_stack.last().unwrap().sp;
                s.stack_write(sp, NULL_REG);
                if s.execute_method(0, 2, sp + 1, NULL_REG, 0, sp).is_some() {
                    s.run_vm(false);
                }
                Reg::from(s.r_acc.to_u16() + 1)
            }),
        );
        assert_eq!(run_export(&mut state, 0, 1, &[]), Reg::from(8u16));
        assert!(state.execution_stack.is_empty());
    }

    fn hierarchy_fixture() -> MemoryLoader {
        let mut loader = MemoryLoader::new();
        loader.set_selectors(&selectors());

        let mut base_code = ScriptBuilder::new();
        base_code.ret();
        let base_describe = base_code.here();
        base_code.ldi(1).ret();
        loader.add_script(
            1,
            ScriptBlob {
                bytecode: base_code.finish(),
                exports: Vec::new(),
                objects: vec![
                    ObjectBlob::new(0x10, "Base", 1, 0xFFFF, 0x8000)
                        .as_class(1)
                        .with_method(SEL_DESCRIBE, base_describe),
                ],
                locals: Vec::new(),
            },
        );

        let mut mid_code = ScriptBuilder::new();
        mid_code.ret();
        let mid_describe = mid_code.here();
        mid_code.ldi(2).ret();
        let mid_parent = mid_code.here();
        mid_code.pushi(SEL_DESCRIBE as i16).pushi(0);
        mid_code.super_(1, 4);
        mid_code.ret();
        loader.add_script(
            2,
            ScriptBlob {
                bytecode: mid_code.finish(),
                exports: Vec::new(),
                objects: vec![
                    ObjectBlob::new(0x10, "Mid", 2, 1, 0x8000)
                        .as_class(2)
                        .with_method(SEL_DESCRIBE, mid_describe)
                        .with_method(SEL_PARENT, mid_parent),
                ],
                locals: Vec::new(),
            },
        );

        let mut leaf_code = ScriptBuilder::new();
        leaf_code.ret();
        let describe_entry = leaf_code.here();
        leaf_code.pushi(SEL_DESCRIBE as i16).pushi(0);
        leaf_code.lofsa(0x10);
        leaf_code.send(4);
        leaf_code.ret();
        let parent_entry = leaf_code.here();
        leaf_code.pushi(SEL_PARENT as i16).pushi(0);
        leaf_code.lofsa(0x10);
        leaf_code.send(4);
        leaf_code.ret();
        let class_entry = leaf_code.here();
        leaf_code.class(1);
        leaf_code.ret();
        loader.add_script(
            3,
            ScriptBlob {
                bytecode: leaf_code.finish(),
                exports: vec![0, describe_entry, parent_entry, class_entry],
                objects: vec![ObjectBlob::new(0x10, "leaf", 2, 2, 0)],
                locals: Vec::new(),
            },
        );
        loader
    }

    #[test]
    fn method_dispatch_prefers_the_override() {
        let mut state = state_from(hierarchy_fixture());
        assert_eq!(run_export(&mut state, 3, 1, &[]), Reg::from(2u16));
    }

    #[test]
    fn super_sends_skip_the_override() {
        let mut state = state_from(hierarchy_fixture());
        assert_eq!(run_export(&mut state, 3, 2, &[]), Reg::from(1u16));
    }

    #[test]
    fn class_op_loads_and_yields_the_class_object() {
        let mut state = state_from(hierarchy_fixture());
        let addr = run_export(&mut state, 3, 3, &[]);
        let base_seg = state.segman.script_segment_of(1).unwrap();
        assert_eq!(addr, make_reg(base_seg, 0x10));
    }

    #[test]
    fn restart_tears_down_and_replays() {
        let restart_id = KernelTable::with_defaults().find("RestartGame").unwrap();
        let mut code = ScriptBuilder::new();
        code.ret();
        let play = code.here();
        code.lag(0);
        let fix = code.here() + 1;
        code.bnt(0);
        // second run: leave 2 behind and finish
        code.ldi(2).sag(0).ret();
        let first_run = code.here();
        code.patch_word(fix, first_run - (fix + 2));
        code.ldi(1).sag(0);
        code.pushi(0);
        code.callk(restart_id, 0);
        code.ret();

        let mut loader = MemoryLoader::new();
        loader.set_selectors(&selectors());
        loader.add_script(
            0,
            ScriptBlob {
                bytecode: code.finish(),
                exports: Vec::new(),
                objects: vec![
                    ObjectBlob::new(0x100, "game", 0, 0xFFFF, 0).with_method(SEL_PLAY, play),
                ],
                locals: vec![NULL_REG; 2],
            },
        );
        loader.set_game_object(0, 0x100);

        let mut state = state_from(loader);
        state.run_game();
        assert!(state.game_was_restarted);
        assert!(!state.restarting);
        assert_eq!(global(&state, 0), Reg::from(2u16));
        assert!(state.execution_stack.is_empty());
    }
}
