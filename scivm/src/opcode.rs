//! Instruction decoding. An opcode byte's low bit selects the operand
//! width of its variable-width operands (set = 8-bit); the remaining seven
//! bits are the opcode number. Operands are little endian.

/// Opcode numbers `0x40..=0x7f` form a lattice of variable accesses.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VarOp {
    Load,
    Store,
    IncLoad,
    DecLoad,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VarTarget {
    Acc,
    Stack,
    AccIndexed,
    StackIndexed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VarType {
    Global,
    Local,
    Temp,
    Param,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Op {
    Bnot,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shr,
    Shl,
    Xor,
    And,
    Or,
    Neg,
    Not,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Ugt,
    Uge,
    Ult,
    Ule,
    Bt,
    Bnt,
    Jmp,
    Ldi,
    Push,
    Pushi,
    Toss,
    Dup,
    Link,
    Call,
    Callk,
    Callb,
    Calle,
    Ret,
    Send,
    Class,
    SelfSend,
    SuperSend,
    Rest,
    Lea,
    SelfId,
    Pprev,
    Ptoa,
    Atop,
    Ptos,
    Stop,
    Iptoa,
    Dptoa,
    Iptos,
    Dptos,
    Lofsa,
    Lofss,
    Push0,
    Push1,
    Push2,
    PushSelf,
    Line,
    VarAccess {
        oper: VarOp,
        target: VarTarget,
        vartype: VarType,
    },
}

impl Op {
    /// Mnemonic, for traces and fatal diagnostics.
    pub fn name(&self) -> String {
        match self {
            Op::Bnot => "bnot".into(),
            Op::Add => "add".into(),
            Op::Sub => "sub".into(),
            Op::Mul => "mul".into(),
            Op::Div => "div".into(),
            Op::Mod => "mod".into(),
            Op::Shr => "shr".into(),
            Op::Shl => "shl".into(),
            Op::Xor => "xor".into(),
            Op::And => "and".into(),
            Op::Or => "or".into(),
            Op::Neg => "neg".into(),
            Op::Not => "not".into(),
            Op::Eq => "eq?".into(),
            Op::Ne => "ne?".into(),
            Op::Gt => "gt?".into(),
            Op::Ge => "ge?".into(),
            Op::Lt => "lt?".into(),
            Op::Le => "le?".into(),
            Op::Ugt => "ugt?".into(),
            Op::Uge => "uge?".into(),
            Op::Ult => "ult?".into(),
            Op::Ule => "ule?".into(),
            Op::Bt => "bt".into(),
            Op::Bnt => "bnt".into(),
            Op::Jmp => "jmp".into(),
            Op::Ldi => "ldi".into(),
            Op::Push => "push".into(),
            Op::Pushi => "pushi".into(),
            Op::Toss => "toss".into(),
            Op::Dup => "dup".into(),
            Op::Link => "link".into(),
            Op::Call => "call".into(),
            Op::Callk => "callk".into(),
            Op::Callb => "callb".into(),
            Op::Calle => "calle".into(),
            Op::Ret => "ret".into(),
            Op::Send => "send".into(),
            Op::Class => "class".into(),
            Op::SelfSend => "self".into(),
            Op::SuperSend => "super".into(),
            Op::Rest => "&rest".into(),
            Op::Lea => "lea".into(),
            Op::SelfId => "selfID".into(),
            Op::Pprev => "pprev".into(),
            Op::Ptoa => "pToa".into(),
            Op::Atop => "aTop".into(),
            Op::Ptos => "pTos".into(),
            Op::Stop => "sTop".into(),
            Op::Iptoa => "ipToa".into(),
            Op::Dptoa => "dpToa".into(),
            Op::Iptos => "ipTos".into(),
            Op::Dptos => "dpTos".into(),
            Op::Lofsa => "lofsa".into(),
            Op::Lofss => "lofss".into(),
            Op::Push0 => "push0".into(),
            Op::Push1 => "push1".into(),
            Op::Push2 => "push2".into(),
            Op::PushSelf => "pushSelf".into(),
            Op::Line => "line".into(),
            Op::VarAccess {
                oper,
                target,
                vartype,
            } => {
                let oper = match oper {
                    VarOp::Load => "l",
                    VarOp::Store => "s",
                    VarOp::IncLoad => "+",
                    VarOp::DecLoad => "-",
                };
                let (target, indexed) = match target {
                    VarTarget::Acc => ("a", ""),
                    VarTarget::Stack => ("s", ""),
                    VarTarget::AccIndexed => ("a", "i"),
                    VarTarget::StackIndexed => ("s", "i"),
                };
                let vartype = match vartype {
                    VarType::Global => "g",
                    VarType::Local => "l",
                    VarType::Temp => "t",
                    VarType::Param => "p",
                };
                format!("{oper}{target}{vartype}{indexed}")
            }
        }
    }
}

/// Operand slot in an instruction's format.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum OperandKind {
    /// always one unsigned byte
    Byte,
    /// always a 16-bit word
    Word,
    /// width from the opcode's low bit, unsigned
    Variable,
    /// width from the opcode's low bit, sign extended
    SVariable,
    /// width from the opcode's low bit, sign extended, pc-relative
    SRelative,
    /// width from the opcode's low bit, unsigned code offset
    Offset,
}

fn format_of(op: Op) -> &'static [OperandKind] {
    use OperandKind::*;
    match op {
        Op::Bt | Op::Bnt | Op::Jmp => &[SRelative],
        Op::Ldi | Op::Pushi => &[SVariable],
        Op::Link => &[Variable],
        Op::Call => &[SRelative, Byte],
        Op::Callk | Op::Callb => &[Variable, Byte],
        Op::Calle => &[Variable, Variable, Byte],
        Op::Send | Op::SelfSend => &[Byte],
        Op::Class => &[Variable],
        Op::SuperSend => &[Variable, Byte],
        Op::Rest => &[Variable],
        Op::Lea => &[SVariable, Variable],
        Op::Ptoa
        | Op::Atop
        | Op::Ptos
        | Op::Stop
        | Op::Iptoa
        | Op::Dptoa
        | Op::Iptos
        | Op::Dptos => &[Variable],
        Op::Lofsa | Op::Lofss => &[Offset],
        Op::Line => &[Word],
        Op::VarAccess { .. } => &[Variable],
        _ => &[],
    }
}

fn op_from_number(number: u8) -> Option<Op> {
    Some(match number {
        0x00 => Op::Bnot,
        0x01 => Op::Add,
        0x02 => Op::Sub,
        0x03 => Op::Mul,
        0x04 => Op::Div,
        0x05 => Op::Mod,
        0x06 => Op::Shr,
        0x07 => Op::Shl,
        0x08 => Op::Xor,
        0x09 => Op::And,
        0x0a => Op::Or,
        0x0b => Op::Neg,
        0x0c => Op::Not,
        0x0d => Op::Eq,
        0x0e => Op::Ne,
        0x0f => Op::Gt,
        0x10 => Op::Ge,
        0x11 => Op::Lt,
        0x12 => Op::Le,
        0x13 => Op::Ugt,
        0x14 => Op::Uge,
        0x15 => Op::Ult,
        0x16 => Op::Ule,
        0x17 => Op::Bt,
        0x18 => Op::Bnt,
        0x19 => Op::Jmp,
        0x1a => Op::Ldi,
        0x1b => Op::Push,
        0x1c => Op::Pushi,
        0x1d => Op::Toss,
        0x1e => Op::Dup,
        0x1f => Op::Link,
        0x20 => Op::Call,
        0x21 => Op::Callk,
        0x22 => Op::Callb,
        0x23 => Op::Calle,
        0x24 => Op::Ret,
        0x25 => Op::Send,
        0x28 => Op::Class,
        0x2a => Op::SelfSend,
        0x2b => Op::SuperSend,
        0x2c => Op::Rest,
        0x2d => Op::Lea,
        0x2e => Op::SelfId,
        0x30 => Op::Pprev,
        0x31 => Op::Ptoa,
        0x32 => Op::Atop,
        0x33 => Op::Ptos,
        0x34 => Op::Stop,
        0x35 => Op::Iptoa,
        0x36 => Op::Dptoa,
        0x37 => Op::Iptos,
        0x38 => Op::Dptos,
        0x39 => Op::Lofsa,
        0x3a => Op::Lofss,
        0x3b => Op::Push0,
        0x3c => Op::Push1,
        0x3d => Op::Push2,
        0x3e => Op::PushSelf,
        0x3f => Op::Line,
        0x40..=0x7f => {
            let oper = match (number >> 4) & 0x3 {
                0 => VarOp::Load,
                1 => VarOp::Store,
                2 => VarOp::IncLoad,
                _ => VarOp::DecLoad,
            };
            let target = match (number >> 2) & 0x3 {
                0 => VarTarget::Acc,
                1 => VarTarget::Stack,
                2 => VarTarget::AccIndexed,
                _ => VarTarget::StackIndexed,
            };
            let vartype = match number & 0x3 {
                0 => VarType::Global,
                1 => VarType::Local,
                2 => VarType::Temp,
                _ => VarType::Param,
            };
            Op::VarAccess {
                oper,
                target,
                vartype,
            }
        }
        _ => return None,
    })
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// pc points at or past the end of the code
    EndOfCode { pos: usize },
    /// opcode number with no instruction assigned
    InvalidOpcode { byte: u8, pos: usize },
}

/// A decoded instruction. `params` holds sign-extended operand values;
/// unused slots stay zero.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub op: Op,
    pub params: [i32; 3],
    /// total encoded size in bytes
    pub size: usize,
}

pub fn decode(buf: &[u8], pos: usize) -> Result<Instruction, DecodeError> {
    let &raw = buf.get(pos).ok_or(DecodeError::EndOfCode { pos })?;
    let narrow = raw & 1 != 0;
    let number = raw >> 1;
    let op = op_from_number(number).ok_or(DecodeError::InvalidOpcode { byte: raw, pos })?;

    let mut params = [0i32; 3];
    let mut at = pos + 1;
    for (slot, &kind) in params.iter_mut().zip(format_of(op)) {
        use OperandKind::*;
        let width = match kind {
            Byte => 1,
            Word => 2,
            Variable | SVariable | SRelative | Offset => {
                if narrow {
                    1
                } else {
                    2
                }
            }
        };
        let bytes = buf
            .get(at..at + width)
            .ok_or(DecodeError::EndOfCode { pos })?;
        let raw_value = if width == 1 {
            bytes[0] as u16
        } else {
            u16::from_le_bytes([bytes[0], bytes[1]])
        };
        let signed = matches!(kind, SVariable | SRelative);
        *slot = if signed {
            if width == 1 {
                bytes[0] as i8 as i32
            } else {
                raw_value.cast_signed() as i32
            }
        } else {
            raw_value as i32
        };
        at += width;
    }

    Ok(Instruction {
        op,
        params,
        size: at - pos,
    })
}

#[cfg(test)]
mod decode_tests {
    use super::*;

    #[test]
    fn wide_pushi_sign_extends_its_operand() {
        // pushi -2, 16-bit form
        let code = [0x1c << 1, 0xfe, 0xff];
        let insn = decode(&code, 0).unwrap();
        assert_eq!(insn.op, Op::Pushi);
        assert_eq!(insn.params[0], -2);
        assert_eq!(insn.size, 3);
    }

    #[test]
    fn narrow_variant_reads_byte_operands() {
        // pushi 5, 8-bit form (low opcode bit set)
        let code = [(0x1c << 1) | 1, 0x05];
        let insn = decode(&code, 0).unwrap();
        assert_eq!(insn.op, Op::Pushi);
        assert_eq!(insn.params[0], 5);
        assert_eq!(insn.size, 2);

        // and the byte form still sign extends
        let code = [(0x1a << 1) | 1, 0xfe];
        let insn = decode(&code, 0).unwrap();
        assert_eq!(insn.op, Op::Ldi);
        assert_eq!(insn.params[0], -2);
    }

    #[test]
    fn call_operands_mix_variable_and_fixed_widths() {
        let code = [0x20 << 1, 0xfa, 0xff, 0x04];
        let insn = decode(&code, 0).unwrap();
        assert_eq!(insn.op, Op::Call);
        assert_eq!(insn.params[0], -6);
        assert_eq!(insn.params[1], 4);
        assert_eq!(insn.size, 4);
    }

    #[test]
    fn variable_access_bits_decode_into_the_lattice() {
        // 0x41 = lal (load local into acc), wide form
        let code = [0x41 << 1, 0x03, 0x00];
        let insn = decode(&code, 0).unwrap();
        assert_eq!(
            insn.op,
            Op::VarAccess {
                oper: VarOp::Load,
                target: VarTarget::Acc,
                vartype: VarType::Local,
            }
        );
        assert_eq!(insn.op.name(), "lal");

        // 0x6e = +sti: inc-load of a temp, indexed, result pushed
        let code = [0x6e << 1, 0x01, 0x00];
        let insn = decode(&code, 0).unwrap();
        assert_eq!(
            insn.op,
            Op::VarAccess {
                oper: VarOp::IncLoad,
                target: VarTarget::StackIndexed,
                vartype: VarType::Temp,
            }
        );
    }

    #[test]
    fn gaps_in_the_opcode_map_are_invalid() {
        for number in [0x26u8, 0x27, 0x29, 0x2f] {
            let code = [number << 1];
            assert_eq!(
                decode(&code, 0),
                Err(DecodeError::InvalidOpcode {
                    byte: number << 1,
                    pos: 0
                })
            );
        }
    }

    #[test]
    fn truncated_operands_report_end_of_code() {
        let code = [0x1c << 1, 0x34];
        assert_eq!(decode(&code, 0), Err(DecodeError::EndOfCode { pos: 0 }));
        assert_eq!(decode(&code, 5), Err(DecodeError::EndOfCode { pos: 5 }));
    }
}
