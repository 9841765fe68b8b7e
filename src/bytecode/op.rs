use std::fmt;

use super::FormatError;

// ── Opcodes ──────────────────────────────────────────────────────────
//
// The numeric value of each opcode is part of the on-disk format and must
// equal its slot in the VM dispatch table (checked at VM construction).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Mnemonic {
    Nop = 0,

    PushI = 1,
    PushF = 2,
    PushS = 3,
    PushB = 4,

    Add = 5,
    Sub = 6,
    Mul = 7,
    Div = 8,

    Not = 9,
    And = 10,
    Or = 11,
    Gt = 12,
    Lt = 13,
    Gte = 14,
    Lte = 15,
    Eq = 16,

    Je = 17,
    Jne = 18,
    J = 19,
    /// Call a host-bound external function by name.
    Ext = 20,
    /// Call a function from the program's function table.
    Call = 21,

    PushFnRef = 22,

    GetL = 23,
    SetL = 24,

    Retn = 25,
    PushUnit = 26,

    InvalidOp = 127,
}

impl Mnemonic {
    pub const ALL: [Mnemonic; 28] = [
        Mnemonic::Nop,
        Mnemonic::PushI,
        Mnemonic::PushF,
        Mnemonic::PushS,
        Mnemonic::PushB,
        Mnemonic::Add,
        Mnemonic::Sub,
        Mnemonic::Mul,
        Mnemonic::Div,
        Mnemonic::Not,
        Mnemonic::And,
        Mnemonic::Or,
        Mnemonic::Gt,
        Mnemonic::Lt,
        Mnemonic::Gte,
        Mnemonic::Lte,
        Mnemonic::Eq,
        Mnemonic::Je,
        Mnemonic::Jne,
        Mnemonic::J,
        Mnemonic::Ext,
        Mnemonic::Call,
        Mnemonic::PushFnRef,
        Mnemonic::GetL,
        Mnemonic::SetL,
        Mnemonic::Retn,
        Mnemonic::PushUnit,
        Mnemonic::InvalidOp,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Mnemonic> {
        Some(match code {
            0 => Mnemonic::Nop,
            1 => Mnemonic::PushI,
            2 => Mnemonic::PushF,
            3 => Mnemonic::PushS,
            4 => Mnemonic::PushB,
            5 => Mnemonic::Add,
            6 => Mnemonic::Sub,
            7 => Mnemonic::Mul,
            8 => Mnemonic::Div,
            9 => Mnemonic::Not,
            10 => Mnemonic::And,
            11 => Mnemonic::Or,
            12 => Mnemonic::Gt,
            13 => Mnemonic::Lt,
            14 => Mnemonic::Gte,
            15 => Mnemonic::Lte,
            16 => Mnemonic::Eq,
            17 => Mnemonic::Je,
            18 => Mnemonic::Jne,
            19 => Mnemonic::J,
            20 => Mnemonic::Ext,
            21 => Mnemonic::Call,
            22 => Mnemonic::PushFnRef,
            23 => Mnemonic::GetL,
            24 => Mnemonic::SetL,
            25 => Mnemonic::Retn,
            26 => Mnemonic::PushUnit,
            127 => Mnemonic::InvalidOp,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Mnemonic::Nop => "NOP",
            Mnemonic::PushI => "PUSHI",
            Mnemonic::PushF => "PUSHF",
            Mnemonic::PushS => "PUSHS",
            Mnemonic::PushB => "PUSHB",
            Mnemonic::Add => "ADD",
            Mnemonic::Sub => "SUB",
            Mnemonic::Mul => "MUL",
            Mnemonic::Div => "DIV",
            Mnemonic::Not => "NOT",
            Mnemonic::And => "AND",
            Mnemonic::Or => "OR",
            Mnemonic::Gt => "GT",
            Mnemonic::Lt => "LT",
            Mnemonic::Gte => "GTE",
            Mnemonic::Lte => "LTE",
            Mnemonic::Eq => "EQ",
            Mnemonic::Je => "JE",
            Mnemonic::Jne => "JNE",
            Mnemonic::J => "J",
            Mnemonic::Ext => "EXT",
            Mnemonic::Call => "CALL",
            Mnemonic::PushFnRef => "PUSHFNREF",
            Mnemonic::GetL => "GETL",
            Mnemonic::SetL => "SETL",
            Mnemonic::Retn => "RETN",
            Mnemonic::PushUnit => "PUSHUNIT",
            Mnemonic::InvalidOp => "INVALID_OP",
        }
    }
}

impl fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Instruction word ─────────────────────────────────────────────────
//
// [OP:8 | DATA:56], stored as a single big-endian 64-bit word.

/// Mask applied to every payload write: the top byte belongs to the opcode.
pub const DATA_MASK: i64 = (u64::MAX >> 8) as i64;

const OPCODE_SHIFT: u32 = 56;

#[inline(always)]
fn mask_data(raw: i64) -> i64 {
    raw & DATA_MASK
}

/// A decoded instruction: opcode plus a 56-bit payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Op {
    pub mnemonic: Mnemonic,
    data: i64,
}

impl Op {
    pub fn new(mnemonic: Mnemonic, data: i64) -> Self {
        Op { mnemonic, data: mask_data(data) }
    }

    /// An instruction with no payload.
    pub fn bare(mnemonic: Mnemonic) -> Self {
        Op::new(mnemonic, 0)
    }

    /// Stores the 32-bit IEEE-754 bit pattern of `value` in the payload.
    pub fn float(mnemonic: Mnemonic, value: f32) -> Self {
        Op::new(mnemonic, value.to_bits() as i64)
    }

    pub fn data(&self) -> i64 {
        self.data
    }

    pub fn set_data(&mut self, data: i64) {
        self.data = mask_data(data);
    }

    /// Low 32 bits of the payload as a signed integer.
    pub fn data_i32(&self) -> i32 {
        self.data as i32
    }

    pub fn data_f32(&self) -> f32 {
        f32::from_bits(self.data as u32)
    }

    /// Payload as an index (slot, string id, jump target, argument count).
    pub fn data_index(&self) -> usize {
        self.data_i32() as u32 as usize
    }

    pub fn to_bits(&self) -> i64 {
        ((self.mnemonic.code() as i64) << OPCODE_SHIFT) | self.data
    }

    pub fn decode(raw: i64) -> Result<Op, FormatError> {
        let code = ((raw as u64) >> OPCODE_SHIFT) as u8;
        let mnemonic = Mnemonic::from_code(code).ok_or(FormatError::UnknownOpcode { code })?;
        Ok(Op { mnemonic, data: mask_data(raw) })
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mnemonic {
            Mnemonic::PushF => write!(f, "{} {:?}", self.mnemonic, self.data_f32()),
            Mnemonic::PushI => write!(f, "{} {}", self.mnemonic, self.data_i32()),
            _ => write!(f, "{} {}", self.mnemonic, self.data),
        }
    }
}
