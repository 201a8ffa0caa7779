use core::fmt;

use crate::op::Op;

/// A decoded instruction.
///
/// Register operands are the raw 8-bit register indices; whether they name
/// a register of the current context is checked by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Noop,
    Move { dst: u8, src: u8 },
    LoadI { dst: u8, idx: u16 },
    Push { src: u8 },
    Pop { dst: u8 },
    Swap,
    Rotate { count: u8 },
    Dup,
    Add { dst: u8, lhs: u8, rhs: u8 },
    Sub { dst: u8, lhs: u8, rhs: u8 },
    Mul { dst: u8, lhs: u8, rhs: u8 },
    Div { dst: u8, lhs: u8, rhs: u8 },
    Mod { dst: u8, lhs: u8, rhs: u8 },
    Pow { dst: u8, lhs: u8, rhs: u8 },
    Not { dst: u8, src: u8 },
    Eq { dst: u8, lhs: u8, rhs: u8 },
    Lt { dst: u8, lhs: u8, rhs: u8 },
    Lte { dst: u8, lhs: u8, rhs: u8 },
    Gt { dst: u8, lhs: u8, rhs: u8 },
    Gte { dst: u8, lhs: u8, rhs: u8 },
    Halt,
    Send { receiver: u8, message: u8, sender: u8 },
    Ret,
    Jmp { target: u32 },
    Save { dst: u8 },
    Restore { src: u8 },
    AddSym { dst: u8, src: u8 },
    FindSym { dst: u8, src: u8 },
    Array { count: u8 },
    String { count: u8 },
}

impl Instruction {
    pub const fn op(&self) -> Op {
        match self {
            Self::Noop => Op::Noop,
            Self::Move { .. } => Op::Move,
            Self::LoadI { .. } => Op::LoadI,
            Self::Push { .. } => Op::Push,
            Self::Pop { .. } => Op::Pop,
            Self::Swap => Op::Swap,
            Self::Rotate { .. } => Op::Rotate,
            Self::Dup => Op::Dup,
            Self::Add { .. } => Op::Add,
            Self::Sub { .. } => Op::Sub,
            Self::Mul { .. } => Op::Mul,
            Self::Div { .. } => Op::Div,
            Self::Mod { .. } => Op::Mod,
            Self::Pow { .. } => Op::Pow,
            Self::Not { .. } => Op::Not,
            Self::Eq { .. } => Op::Eq,
            Self::Lt { .. } => Op::Lt,
            Self::Lte { .. } => Op::Lte,
            Self::Gt { .. } => Op::Gt,
            Self::Gte { .. } => Op::Gte,
            Self::Halt => Op::Halt,
            Self::Send { .. } => Op::Send,
            Self::Ret => Op::Ret,
            Self::Jmp { .. } => Op::Jmp,
            Self::Save { .. } => Op::Save,
            Self::Restore { .. } => Op::Restore,
            Self::AddSym { .. } => Op::AddSym,
            Self::FindSym { .. } => Op::FindSym,
            Self::Array { .. } => Op::Array,
            Self::String { .. } => Op::String,
        }
    }

    /// Encoded size in bytes.
    pub const fn width(&self) -> usize {
        self.op().width()
    }

    /// Append the canonical little-endian encoding to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let op = self.op() as u8;
        let word: [u8; 4] = match *self {
            Self::Noop | Self::Swap | Self::Dup | Self::Halt | Self::Ret => {
                [op, 0, 0, 0]
            }
            Self::Move { dst, src }
            | Self::Not { dst, src }
            | Self::AddSym { dst, src }
            | Self::FindSym { dst, src } => [op, dst, src, 0],
            Self::LoadI { dst, idx } => {
                let [lo, hi] = idx.to_le_bytes();
                [op, dst, lo, hi]
            }
            Self::Push { src: a }
            | Self::Pop { dst: a }
            | Self::Rotate { count: a }
            | Self::Save { dst: a }
            | Self::Restore { src: a }
            | Self::Array { count: a }
            | Self::String { count: a } => [op, a, 0, 0],
            Self::Add { dst, lhs, rhs }
            | Self::Sub { dst, lhs, rhs }
            | Self::Mul { dst, lhs, rhs }
            | Self::Div { dst, lhs, rhs }
            | Self::Mod { dst, lhs, rhs }
            | Self::Pow { dst, lhs, rhs }
            | Self::Eq { dst, lhs, rhs }
            | Self::Lt { dst, lhs, rhs }
            | Self::Lte { dst, lhs, rhs }
            | Self::Gt { dst, lhs, rhs }
            | Self::Gte { dst, lhs, rhs } => [op, dst, lhs, rhs],
            Self::Send {
                receiver,
                message,
                sender,
            } => [op, receiver, message, sender],
            Self::Jmp { .. } => [op, 0, 0, 0],
        };
        buf.extend_from_slice(&word);
        if let Self::Jmp { target } = *self {
            buf.extend_from_slice(&target.to_le_bytes());
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.op().mnemonic();
        match *self {
            Self::Noop | Self::Swap | Self::Dup | Self::Halt | Self::Ret => {
                write!(f, "{name}")
            }
            Self::Move { dst, src }
            | Self::Not { dst, src }
            | Self::AddSym { dst, src }
            | Self::FindSym { dst, src } => write!(f, "{name} r{dst}, r{src}"),
            Self::LoadI { dst, idx } => write!(f, "{name} r{dst}, #{idx}"),
            Self::Push { src: a }
            | Self::Pop { dst: a }
            | Self::Rotate { count: a }
            | Self::Save { dst: a }
            | Self::Restore { src: a }
            | Self::Array { count: a }
            | Self::String { count: a } => write!(f, "{name} r{a}"),
            Self::Add { dst, lhs, rhs }
            | Self::Sub { dst, lhs, rhs }
            | Self::Mul { dst, lhs, rhs }
            | Self::Div { dst, lhs, rhs }
            | Self::Mod { dst, lhs, rhs }
            | Self::Pow { dst, lhs, rhs }
            | Self::Eq { dst, lhs, rhs }
            | Self::Lt { dst, lhs, rhs }
            | Self::Lte { dst, lhs, rhs }
            | Self::Gt { dst, lhs, rhs }
            | Self::Gte { dst, lhs, rhs } => {
                write!(f, "{name} r{dst}, r{lhs}, r{rhs}")
            }
            Self::Send {
                receiver,
                message,
                sender,
            } => write!(f, "{name} r{receiver}, r{message}, r{sender}"),
            Self::Jmp { target } => write!(f, "{name} {target}"),
        }
    }
}
