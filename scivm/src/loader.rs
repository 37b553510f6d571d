//! Script delivery. The VM core never touches resource files directly; it
//! asks a [`ScriptLoader`] for decoded [`ScriptBlob`]s by script number.
//! [`MemoryLoader`] backs the loader with blobs built in memory, and
//! [`ScriptBuilder`] assembles bytecode for them.

use std::collections::HashMap;

use crate::{NULL_REG, Reg, make_reg};

/// Decoded object template as it appears in a script resource. `properties`
/// holds every property value including the four fixed slots; the selector
/// id list is flattened over the whole hierarchy.
#[derive(Debug, Clone)]
pub struct ObjectBlob {
    /// offset of the object within the script, used as its address
    pub offset: u16,
    pub name: String,
    pub properties: Vec<Reg>,
    pub var_selector_ids: Vec<u16>,
    /// (selector id, code offset) pairs
    pub methods: Vec<(u16, u16)>,
    /// set when this object is a class; registered in the class table
    pub class_id: Option<u16>,
}

impl ObjectBlob {
    /// Start a blob with the four fixed property slots filled in. The name
    /// property stays null; `name` is carried out of band for diagnostics.
    pub fn new(offset: u16, name: &str, species: u16, superclass: u16, info: u16) -> Self {
        Self {
            offset,
            name: name.to_owned(),
            properties: vec![
                make_reg(0, species),
                make_reg(0, superclass),
                make_reg(0, info),
                NULL_REG,
            ],
            var_selector_ids: vec![0xFFF0, 0xFFF1, 0xFFF2, 0xFFF3],
            methods: Vec::new(),
            class_id: None,
        }
    }

    pub fn as_class(mut self, class_id: u16) -> Self {
        self.class_id = Some(class_id);
        self
    }

    pub fn with_prop(mut self, selector: u16, value: Reg) -> Self {
        self.var_selector_ids.push(selector);
        self.properties.push(value);
        self
    }

    pub fn with_method(mut self, selector: u16, offset: u16) -> Self {
        self.methods.push((selector, offset));
        self
    }
}

/// Everything the segment manager needs to instantiate a script.
#[derive(Debug, Clone, Default)]
pub struct ScriptBlob {
    pub bytecode: Vec<u8>,
    /// export table: code offsets indexed by export number
    pub exports: Vec<u16>,
    pub objects: Vec<ObjectBlob>,
    /// initial values of the script's locals block
    pub locals: Vec<Reg>,
}

/// Source of decoded scripts and selector metadata.
pub trait ScriptLoader {
    fn load_script(&self, nr: u16) -> Option<ScriptBlob>;
    /// script number a given class lives in, for on-demand class loading
    fn class_script(&self, class_id: u16) -> Option<u16>;
    fn selector_names(&self) -> Vec<String>;
    /// (script nr, offset) of the game object, if the loader knows one
    fn game_object(&self) -> Option<(u16, u16)> {
        None
    }
}

/// Loader over blobs registered up front. Class locations are derived from
/// the registered blobs.
#[derive(Default)]
pub struct MemoryLoader {
    scripts: HashMap<u16, ScriptBlob>,
    selectors: Vec<String>,
    game_object: Option<(u16, u16)>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_script(&mut self, nr: u16, blob: ScriptBlob) {
        self.scripts.insert(nr, blob);
    }

    /// Register the selector name table; index is the selector id.
    pub fn set_selectors(&mut self, names: &[&str]) {
        self.selectors = names.iter().map(|&n| n.to_owned()).collect();
    }

    pub fn set_game_object(&mut self, script: u16, offset: u16) {
        self.game_object = Some((script, offset));
    }

    pub fn selector_id(&self, name: &str) -> Option<u16> {
        self.selectors.iter().position(|n| n == name).map(|i| i as u16)
    }
}

impl ScriptLoader for MemoryLoader {
    fn load_script(&self, nr: u16) -> Option<ScriptBlob> {
        self.scripts.get(&nr).cloned()
    }

    fn class_script(&self, class_id: u16) -> Option<u16> {
        self.scripts.iter().find_map(|(&nr, blob)| {
            blob.objects
                .iter()
                .any(|o| o.class_id == Some(class_id))
                .then_some(nr)
        })
    }

    fn selector_names(&self) -> Vec<String> {
        self.selectors.clone()
    }

    fn game_object(&self) -> Option<(u16, u16)> {
        self.game_object
    }
}

/// Tiny assembler producing interpreter bytecode. Emits the 16-bit operand
/// form of every variable-width instruction; operands are little endian.
#[derive(Debug, Default)]
pub struct ScriptBuilder {
    code: Vec<u8>,
}

macro_rules! plain_ops {
    ($($fn_name:ident = $op:expr;)*) => {
        $(pub fn $fn_name(&mut self) -> &mut Self { self.op($op) })*
    };
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(&self) -> Vec<u8> {
        self.code.clone()
    }

    /// Current code offset, for computing jump targets and method offsets.
    pub fn here(&self) -> u16 {
        self.code.len() as u16
    }

    pub fn patch_word(&mut self, at: u16, value: u16) {
        let at = at as usize;
        self.code[at] = value as u8;
        self.code[at + 1] = (value >> 8) as u8;
    }

    fn op(&mut self, op: u8) -> &mut Self {
        self.code.push(op << 1);
        self
    }

    fn word(&mut self, value: u16) -> &mut Self {
        self.code.push(value as u8);
        self.code.push((value >> 8) as u8);
        self
    }

    fn byte(&mut self, value: u8) -> &mut Self {
        self.code.push(value);
        self
    }

    plain_ops! {
        bnot = 0x00; add = 0x01; sub = 0x02; mul = 0x03; div = 0x04;
        mod_ = 0x05; shr = 0x06; shl = 0x07; xor = 0x08; and = 0x09;
        or = 0x0a; neg = 0x0b; not = 0x0c;
        eq = 0x0d; ne = 0x0e; gt = 0x0f; ge = 0x10; lt = 0x11; le = 0x12;
        ugt = 0x13; uge = 0x14; ult = 0x15; ule = 0x16;
        push = 0x1b; toss = 0x1d; dup = 0x1e; ret = 0x24;
        self_id = 0x2e; pprev = 0x30;
        push0 = 0x3b; push1 = 0x3c; push2 = 0x3d; push_self = 0x3e;
    }

    pub fn bt(&mut self, rel: i16) -> &mut Self {
        self.op(0x17).word(rel as u16)
    }
    pub fn bnt(&mut self, rel: i16) -> &mut Self {
        self.op(0x18).word(rel as u16)
    }
    pub fn jmp(&mut self, rel: i16) -> &mut Self {
        self.op(0x19).word(rel as u16)
    }
    pub fn ldi(&mut self, imm: i16) -> &mut Self {
        self.op(0x1a).word(imm as u16)
    }
    pub fn pushi(&mut self, imm: i16) -> &mut Self {
        self.op(0x1c).word(imm as u16)
    }
    pub fn link(&mut self, n: u16) -> &mut Self {
        self.op(0x1f).word(n)
    }
    pub fn call(&mut self, rel: i16, arg_bytes: u8) -> &mut Self {
        self.op(0x20).word(rel as u16).byte(arg_bytes)
    }
    pub fn callk(&mut self, kernel: u16, arg_bytes: u8) -> &mut Self {
        self.op(0x21).word(kernel).byte(arg_bytes)
    }
    pub fn callb(&mut self, export: u16, arg_bytes: u8) -> &mut Self {
        self.op(0x22).word(export).byte(arg_bytes)
    }
    pub fn calle(&mut self, script: u16, export: u16, arg_bytes: u8) -> &mut Self {
        self.op(0x23).word(script).word(export).byte(arg_bytes)
    }
    pub fn send(&mut self, frame_bytes: u8) -> &mut Self {
        self.op(0x25).byte(frame_bytes)
    }
    pub fn class(&mut self, class_id: u16) -> &mut Self {
        self.op(0x28).word(class_id)
    }
    pub fn self_(&mut self, frame_bytes: u8) -> &mut Self {
        self.op(0x2a).byte(frame_bytes)
    }
    pub fn super_(&mut self, class_id: u16, frame_bytes: u8) -> &mut Self {
        self.op(0x2b).word(class_id).byte(frame_bytes)
    }
    pub fn rest(&mut self, first_param: u16) -> &mut Self {
        self.op(0x2c).word(first_param)
    }
    pub fn lea(&mut self, vt: u16, varnum: u16) -> &mut Self {
        self.op(0x2d).word(vt).word(varnum)
    }
    pub fn ptoa(&mut self, prop_offset: u16) -> &mut Self {
        self.op(0x31).word(prop_offset)
    }
    pub fn atop(&mut self, prop_offset: u16) -> &mut Self {
        self.op(0x32).word(prop_offset)
    }
    pub fn ptos(&mut self, prop_offset: u16) -> &mut Self {
        self.op(0x33).word(prop_offset)
    }
    pub fn stop(&mut self, prop_offset: u16) -> &mut Self {
        self.op(0x34).word(prop_offset)
    }
    pub fn iptoa(&mut self, prop_offset: u16) -> &mut Self {
        self.op(0x35).word(prop_offset)
    }
    pub fn dptoa(&mut self, prop_offset: u16) -> &mut Self {
        self.op(0x36).word(prop_offset)
    }
    pub fn lofsa(&mut self, offset: u16) -> &mut Self {
        self.op(0x39).word(offset)
    }
    pub fn lofss(&mut self, offset: u16) -> &mut Self {
        self.op(0x3a).word(offset)
    }
    pub fn line(&mut self, nr: u16) -> &mut Self {
        self.op(0x3f).word(nr)
    }

    /// Variable-access op, `raw_op` in `0x40..=0x7f`.
    pub fn var_access(&mut self, raw_op: u8, varnum: u16) -> &mut Self {
        debug_assert!((0x40..=0x7f).contains(&raw_op));
        self.op(raw_op).word(varnum)
    }

    pub fn lag(&mut self, n: u16) -> &mut Self {
        self.var_access(0x40, n)
    }
    pub fn lal(&mut self, n: u16) -> &mut Self {
        self.var_access(0x41, n)
    }
    pub fn lat(&mut self, n: u16) -> &mut Self {
        self.var_access(0x42, n)
    }
    pub fn lap(&mut self, n: u16) -> &mut Self {
        self.var_access(0x43, n)
    }
    pub fn lsg(&mut self, n: u16) -> &mut Self {
        self.var_access(0x44, n)
    }
    pub fn lsl(&mut self, n: u16) -> &mut Self {
        self.var_access(0x45, n)
    }
    pub fn lsp(&mut self, n: u16) -> &mut Self {
        self.var_access(0x47, n)
    }
    pub fn sag(&mut self, n: u16) -> &mut Self {
        self.var_access(0x50, n)
    }
    pub fn sal(&mut self, n: u16) -> &mut Self {
        self.var_access(0x51, n)
    }
    pub fn sat(&mut self, n: u16) -> &mut Self {
        self.var_access(0x52, n)
    }
    pub fn plus_al(&mut self, n: u16) -> &mut Self {
        self.var_access(0x61, n)
    }
    pub fn minus_al(&mut self, n: u16) -> &mut Self {
        self.var_access(0x71, n)
    }
}
