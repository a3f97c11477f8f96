//! The instruction set: opcode table, encoder, decoder, disassembler.
//!
//! Code is a byte vector. Every instruction is one opcode byte followed
//! by a fixed operand layout; single letters are one unsigned byte, an
//! `x` suffix widens the operand to two bytes, an `s` prefix makes it
//! signed. Multi-byte operands are little-endian. One descriptor table
//! drives encoding, decoding and disassembly, so they cannot drift
//! apart.

use strum::{FromRepr, IntoStaticStr};

use crate::{
    heap::{EelBody, Heap},
    operate::Operator,
};

/// Operand layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum OperandLayout {
    /// No operands.
    L0,
    A,
    Ax,
    AB,
    ABC,
    ABCD,
    SAx,
    ABx,
    ASBx,
    AxBx,
    AxSBx,
    ABCx,
    ABSCx,
    ABxCx,
    ABxSCx,
    ABCDx,
    ABCSDx,
}

impl OperandLayout {
    /// Complete instruction size in bytes, opcode included.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            Self::L0 => 1,
            Self::A => 2,
            Self::Ax | Self::SAx | Self::AB => 3,
            Self::ABC | Self::ABx | Self::ASBx => 4,
            Self::ABCD | Self::AxBx | Self::AxSBx | Self::ABCx | Self::ABSCx => 5,
            Self::ABxCx | Self::ABxSCx | Self::ABCDx | Self::ABCSDx => 6,
        }
    }

    /// Number of operands in the layout.
    #[must_use]
    pub fn arity(self) -> usize {
        match self {
            Self::L0 => 0,
            Self::A | Self::Ax | Self::SAx => 1,
            Self::AB | Self::ABx | Self::ASBx | Self::AxBx | Self::AxSBx => 2,
            Self::ABC | Self::ABCx | Self::ABSCx | Self::ABxCx | Self::ABxSCx => 3,
            Self::ABCD | Self::ABCDx | Self::ABCSDx => 4,
        }
    }

    /// Per-operand (signed, wide) descriptions, in order.
    fn fields(self) -> &'static [(bool, bool)] {
        const U8: (bool, bool) = (false, false);
        const U16: (bool, bool) = (false, true);
        const S16: (bool, bool) = (true, true);
        match self {
            Self::L0 => &[],
            Self::A => &[U8],
            Self::Ax => &[U16],
            Self::SAx => &[S16],
            Self::AB => &[U8, U8],
            Self::ABC => &[U8, U8, U8],
            Self::ABCD => &[U8, U8, U8, U8],
            Self::ABx => &[U8, U16],
            Self::ASBx => &[U8, S16],
            Self::AxBx => &[U16, U16],
            Self::AxSBx => &[U16, S16],
            Self::ABCx => &[U8, U8, U16],
            Self::ABSCx => &[U8, U8, S16],
            Self::ABxCx => &[U8, U16, U16],
            Self::ABxSCx => &[U8, U16, S16],
            Self::ABCDx => &[U8, U8, U8, U16],
            Self::ABCSDx => &[U8, U8, U8, S16],
        }
    }
}

macro_rules! opcodes {
    ($($name:ident => $layout:ident),+ $(,)?) => {
        /// Symbolic opcodes.
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
        #[strum(serialize_all = "UPPERCASE")]
        pub enum Opcode {
            $($name),+
        }

        impl Opcode {
            /// Operand layout of this opcode.
            #[must_use]
            pub fn layout(self) -> OperandLayout {
                match self {
                    $(Self::$name => OperandLayout::$layout),+
                }
            }
        }
    };
}

opcodes! {
    // Special
    Illegal => L0,
    Nop => L0,

    // Local flow control
    Jump => SAx,
    JumpZ => ASBx,
    JumpNZ => ASBx,
    Switch => ABxSCx,
    Preloop => ABCSDx,
    Loop => ABCSDx,
    Return => L0,
    ReturnR => A,
    Throw => A,
    Retry => L0,
    Retx => L0,
    RetxR => A,

    // Argument stack
    Push => A,
    Push2 => AB,
    Push3 => ABC,
    Push4 => ABCD,
    PushI => SAx,
    PushC => Ax,
    PushC2 => AxBx,
    PushCI => AxSBx,
    PushIC => AxSBx,
    PhTrue => L0,
    PhFalse => L0,
    PushNil => L0,
    PhVar => Ax,
    PhUVal => AB,
    PhArgs => L0,
    PushTup => L0,

    // Function calls
    Call => A,
    CallR => AB,
    CCall => ABx,
    CCallR => ABCx,
    Clean => A,

    // Memory and locals
    Move => AB,
    Init => AB,
    Assign => AB,
    InitI => ASBx,
    AssignI => ASBx,
    InitC => ABx,
    AssignC => ABx,
    InitNil => A,
    AsnNil => A,
    LdI => ASBx,
    LdC => ABx,
    LdNil => A,
    LdTrue => A,
    LdFalse => A,
    GetVar => ABx,
    SetVar => ABx,
    GetUVal => ABC,
    SetUVal => ABC,

    // Arguments
    GetArgI => AB,
    SetArgI => AB,
    PhArgI => A,
    PhArgI2 => AB,
    GetUVArgI => ABC,
    SetUVArgI => ABC,
    GetTArgI => ABC,
    GetTArg => ABC,
    SetTArgI => ABC,
    GetUVTArgI => ABCD,
    SetUVTArgI => ABCD,
    ArgC => A,
    TupC => A,
    Spec => AB,
    TSpec => AB,

    // Indexing
    IndGet => ABC,
    IndSet => ABC,
    IndGetI => ABC,
    IndSetI => ABC,
    IndGetC => ABCx,
    IndSetC => ABCx,

    // Operators
    Bop => ABCD,
    IpBop => ABCD,
    BopI => ABCSDx,
    IpBopI => ABCSDx,
    BopS => ABCSDx,
    IpBopS => ABCSDx,
    BopC => ABCDx,
    PhBop => ABC,
    PhBopI => ABSCx,
    Add => ABC,
    Sub => ABC,
    Mul => ABC,
    Div => ABC,
    Mod => ABC,
    Power => ABC,
    PhAdd => AB,
    PhSub => AB,
    PhMul => AB,
    PhDiv => AB,
    PhMod => AB,
    PhPower => AB,
    Neg => AB,
    Not => AB,
    BNot => AB,
    CastR => AB,
    CastI => AB,
    CastB => AB,
    Cast => ABC,
    TypeOf => AB,
    SizeOf => AB,
    WeakRef => AB,

    // Objects
    New => AB,
    Clone => AB,

    // Exceptions
    Try => AxBx,
    Untry => Ax,
}

impl Opcode {
    /// Complete instruction size in bytes.
    #[must_use]
    pub fn size(self) -> usize {
        self.layout().size()
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Whether this is a branch-class instruction: its position is
    /// reported from emission so the parser can patch it, and it closes
    /// the current peephole fragment.
    #[must_use]
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Self::Jump
                | Self::JumpZ
                | Self::JumpNZ
                | Self::Switch
                | Self::Preloop
                | Self::Loop
                | Self::Return
                | Self::ReturnR
                | Self::Throw
                | Self::Retry
                | Self::Retx
                | Self::RetxR
        )
    }

    /// Byte offset of the 16-bit jump offset field for the jump-carrying
    /// instructions, or `None` for anything else.
    #[must_use]
    pub fn jump_field(self) -> Option<usize> {
        match self {
            Self::Jump | Self::JumpZ | Self::JumpNZ | Self::Switch | Self::Preloop | Self::Loop => {
                Some(self.size() - 2)
            }
            _ => None,
        }
    }
}

/// Decoded operand values, `arity` of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Operands {
    pub a: i32,
    pub b: i32,
    pub c: i32,
    pub d: i32,
}

impl Operands {
    #[must_use]
    pub fn get(&self, i: usize) -> i32 {
        match i {
            0 => self.a,
            1 => self.b,
            2 => self.c,
            _ => self.d,
        }
    }

    fn set(&mut self, i: usize, v: i32) {
        match i {
            0 => self.a = v,
            1 => self.b = v,
            2 => self.c = v,
            _ => self.d = v,
        }
    }
}

/// Operand out of range for its field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandRangeError {
    pub op: Opcode,
    pub index: usize,
    pub value: i32,
}

/// Encodes an instruction into `out`, validating operand ranges. Nothing
/// is written when an operand is out of range.
pub fn encode(out: &mut Vec<u8>, op: Opcode, operands: &Operands) -> Result<(), OperandRangeError> {
    for (i, &(signed, wide)) in op.layout().fields().iter().enumerate() {
        let v = operands.get(i);
        let ok = match (signed, wide) {
            (false, false) => (0..=255).contains(&v),
            (false, true) => (0..=65535).contains(&v),
            (true, true) => (-32768..=32767).contains(&v),
            (true, false) => unreachable!("no signed single-byte operands"),
        };
        if !ok {
            return Err(OperandRangeError { op, index: i, value: v });
        }
    }
    out.push(op as u8);
    for (i, &(_, wide)) in op.layout().fields().iter().enumerate() {
        let v = operands.get(i);
        if wide {
            #[expect(clippy::cast_possible_truncation, reason = "range-checked above")]
            #[expect(clippy::cast_sign_loss, reason = "two's complement byte image")]
            let v16 = v as u16;
            out.extend_from_slice(&v16.to_le_bytes());
        } else {
            #[expect(clippy::cast_possible_truncation, reason = "range-checked above")]
            #[expect(clippy::cast_sign_loss, reason = "range-checked above")]
            let v8 = v as u8;
            out.push(v8);
        }
    }
    Ok(())
}

/// Decodes the instruction at `pc`. Returns the opcode, its operands and
/// the instruction size, or `None` if the byte is not a legal opcode or
/// the code is truncated.
#[must_use]
pub fn decode(code: &[u8], pc: usize) -> Option<(Opcode, Operands, usize)> {
    let op = Opcode::from_repr(*code.get(pc)?)?;
    let size = op.size();
    if pc + size > code.len() {
        return None;
    }
    let mut operands = Operands::default();
    let mut at = pc + 1;
    for (i, &(signed, wide)) in op.layout().fields().iter().enumerate() {
        let v = if wide {
            let raw = u16::from_le_bytes([code[at], code[at + 1]]);
            at += 2;
            if signed {
                i32::from(raw.cast_signed())
            } else {
                i32::from(raw)
            }
        } else {
            let raw = code[at];
            at += 1;
            i32::from(raw)
        };
        operands.set(i, v);
    }
    Some((op, operands, size))
}

/// Number of instructions in a code vector; `None` when the code does not
/// decode cleanly to the end.
#[must_use]
pub fn count_instructions(code: &[u8]) -> Option<usize> {
    let mut pc = 0;
    let mut count = 0;
    while pc < code.len() {
        let (_, _, size) = decode(code, pc)?;
        pc += size;
        count += 1;
    }
    Some(count)
}

/// Renders the instruction at `pc` of a function body.
///
/// Jump-carrying instructions show the resolved target, constant operands
/// show the constant value.
#[must_use]
pub fn disassemble_at(body: &EelBody, heap: &Heap, pc: usize) -> String {
    let Some((op, o, size)) = decode(&body.code, pc) else {
        return format!("{pc:6}: <bad opcode {:#04x}>", body.code.get(pc).copied().unwrap_or(0));
    };
    let head = format!("{pc:6}: {:<12}", op.name());
    let constant = |ix: i32| -> String {
        match usize::try_from(ix).ok().and_then(|i| body.constants.get(i)) {
            Some(v) => v.display(heap),
            None => "<bad constant>".to_string(),
        }
    };
    #[expect(clippy::cast_possible_wrap, reason = "code positions fit i64 comfortably")]
    let target = |off: i32| -> i64 { pc as i64 + size as i64 + i64::from(off) };
    let opname = |code: i32| -> &'static str {
        u8::try_from(code)
            .ok()
            .and_then(Operator::from_repr)
            .map_or("<bad op>", Into::into)
    };
    let rest = match op {
        Opcode::Jump => format!("{}", target(o.a)),
        Opcode::JumpZ | Opcode::JumpNZ => format!("R{}, {}", o.a, target(o.b)),
        Opcode::Switch => format!("R{}, C{}, {}  ; {}", o.a, o.b, target(o.c), constant(o.b)),
        Opcode::Preloop | Opcode::Loop => format!("R{}, R{}, R{}, {}", o.a, o.b, o.c, target(o.d)),
        Opcode::PushC => format!("C{}  ; {}", o.a, constant(o.a)),
        Opcode::PushC2 => format!("C{}, C{}  ; {}, {}", o.a, o.b, constant(o.a), constant(o.b)),
        Opcode::PushCI => format!("C{}, {}  ; {}", o.a, o.b, constant(o.a)),
        Opcode::PushIC => format!("{}, C{}  ; {}", o.b, o.a, constant(o.a)),
        Opcode::LdC => format!("R{}, C{}  ; {}", o.a, o.b, constant(o.b)),
        Opcode::InitC | Opcode::AssignC => format!("R{}, C{}  ; {}", o.a, o.b, constant(o.b)),
        Opcode::CCall => format!("{}, C{}", o.a, o.b),
        Opcode::CCallR => format!("{}, R{}, C{}", o.a, o.b, o.c),
        Opcode::IndGetC | Opcode::IndSetC => format!("R{}, R{}, C{}  ; {}", o.a, o.b, o.c, constant(o.c)),
        Opcode::Bop | Opcode::IpBop => format!("R{}, R{} {} R{}", o.a, o.b, opname(o.c), o.d),
        Opcode::BopI | Opcode::IpBopI => format!("R{}, R{} {} {}", o.a, o.b, opname(o.c), o.d),
        Opcode::BopS | Opcode::IpBopS => format!("R{}, R{} {} SV{}", o.a, o.b, opname(o.c), o.d),
        Opcode::BopC => format!("R{}, R{} {} C{}  ; {}", o.a, o.b, opname(o.c), o.d, constant(o.d)),
        Opcode::PhBop => format!("R{} {} R{}", o.a, opname(o.b), o.c),
        Opcode::PhBopI => format!("R{} {} {}", o.a, opname(o.b), o.c),
        Opcode::Try => format!("C{}, C{}", o.a, o.b),
        Opcode::Untry => format!("C{}", o.a),
        Opcode::PhVar | Opcode::GetVar | Opcode::SetVar => {
            if op == Opcode::PhVar {
                format!("SV{}", o.a)
            } else {
                format!("R{}, SV{}", o.a, o.b)
            }
        }
        _ => {
            let arity = op.layout().arity();
            (0..arity)
                .map(|i| format!("R{}", o.get(i)))
                .collect::<Vec<_>>()
                .join(", ")
        }
    };
    format!("{head}{rest}")
}

/// Full disassembly of a function body.
#[must_use]
pub fn disassemble(body: &EelBody, heap: &Heap) -> String {
    let mut out = String::new();
    let mut pc = 0;
    let mut line_ix = 0;
    while pc < body.code.len() {
        let line = body.lines.get(line_ix).copied().unwrap_or(-1);
        out.push_str(&format!("[{line:4}] {}\n", disassemble_at(body, heap, pc)));
        match decode(&body.code, pc) {
            Some((_, _, size)) => pc += size,
            None => break,
        }
        line_ix += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_follow_layouts() {
        assert_eq!(Opcode::Return.size(), 1);
        assert_eq!(Opcode::Push.size(), 2);
        assert_eq!(Opcode::Jump.size(), 3);
        assert_eq!(Opcode::JumpZ.size(), 4);
        assert_eq!(Opcode::Bop.size(), 5);
        assert_eq!(Opcode::BopI.size(), 6);
        assert_eq!(Opcode::Switch.size(), 6);
    }

    #[test]
    fn encode_decode_round_trip_all_opcodes() {
        // Every opcode, with operands probing the extremes of each field.
        let mut op_byte = 0u8;
        while let Some(op) = Opcode::from_repr(op_byte) {
            let fields = op.layout().fields();
            for probe in 0..3 {
                let mut operands = Operands::default();
                for (i, &(signed, wide)) in fields.iter().enumerate() {
                    let v = match (probe, signed, wide) {
                        (0, _, _) => 0,
                        (1, false, false) => 255,
                        (1, false, true) => 65535,
                        (1, true, true) => 32767,
                        (_, false, false) => 17,
                        (_, false, true) => 300,
                        (_, true, true) => -32768,
                        _ => 0,
                    };
                    operands.set(i, v);
                }
                let mut buf = Vec::new();
                encode(&mut buf, op, &operands).expect("in-range encode");
                assert_eq!(buf.len(), op.size());
                let (dop, dops, dsize) = decode(&buf, 0).expect("decode");
                assert_eq!(dop, op);
                assert_eq!(dsize, op.size());
                for i in 0..fields.len() {
                    assert_eq!(dops.get(i), operands.get(i), "{op:?} operand {i}");
                }
            }
            match op_byte.checked_add(1) {
                Some(b) => op_byte = b,
                None => break,
            }
        }
    }

    #[test]
    fn out_of_range_operands_are_rejected() {
        let mut buf = Vec::new();
        let err = encode(&mut buf, Opcode::Push, &Operands { a: 256, ..Default::default() });
        assert_eq!(
            err,
            Err(OperandRangeError {
                op: Opcode::Push,
                index: 0,
                value: 256
            })
        );
        let err = encode(&mut buf, Opcode::Jump, &Operands { a: 40000, ..Default::default() });
        assert!(err.is_err());
    }

    #[test]
    fn count_instructions_walks_sizes() {
        let mut buf = Vec::new();
        encode(&mut buf, Opcode::LdI, &Operands { a: 0, b: 3, ..Default::default() }).unwrap();
        encode(&mut buf, Opcode::Init, &Operands { a: 1, b: 0, ..Default::default() }).unwrap();
        encode(&mut buf, Opcode::Return, &Operands::default()).unwrap();
        assert_eq!(count_instructions(&buf), Some(3));
        assert_eq!(count_instructions(&buf[..2]), None);
    }

    #[test]
    fn negative_offsets_survive_round_trip() {
        let mut buf = Vec::new();
        encode(&mut buf, Opcode::Jump, &Operands { a: -5, ..Default::default() }).unwrap();
        let (_, o, _) = decode(&buf, 0).unwrap();
        assert_eq!(o.a, -5);
    }
}
