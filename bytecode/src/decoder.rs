use core::fmt;

use crate::WORD_SIZE;
use crate::instruction::Instruction;
use crate::op::Op;

/// Why an instruction could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The instruction (or its immediate word) runs past the end of the code.
    Truncated { offset: usize },
    /// The first byte of the word is not an opcode.
    InvalidOpcode { offset: usize, byte: u8 },
    /// Instructions start on word boundaries only.
    Misaligned { offset: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { offset } => {
                write!(f, "truncated instruction at offset {offset}")
            }
            Self::InvalidOpcode { offset, byte } => {
                write!(f, "invalid opcode 0x{byte:02x} at offset {offset}")
            }
            Self::Misaligned { offset } => {
                write!(f, "misaligned instruction offset {offset}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

fn read_word(code: &[u8], offset: usize) -> Result<[u8; 4], DecodeError> {
    code.get(offset..offset + WORD_SIZE)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(DecodeError::Truncated { offset })
}

/// Decode the instruction starting at `ip`.
///
/// Returns the instruction and the offset of the one following it. This is
/// the only place that knows how wide an encoded instruction is; everything
/// that advances an instruction pointer goes through here.
pub fn decode_at(
    code: &[u8],
    ip: usize,
) -> Result<(Instruction, usize), DecodeError> {
    if !ip.is_multiple_of(WORD_SIZE) {
        return Err(DecodeError::Misaligned { offset: ip });
    }
    // canonical order is little-endian; from_le_bytes swaps on big-endian hosts
    let word = u32::from_le_bytes(read_word(code, ip)?);
    let [byte, a, b, c] = word.to_le_bytes();
    let op = Op::try_from(byte)
        .map_err(|byte| DecodeError::InvalidOpcode { offset: ip, byte })?;

    let instruction = match op {
        Op::Noop => Instruction::Noop,
        Op::Move => Instruction::Move { dst: a, src: b },
        Op::LoadI => Instruction::LoadI {
            dst: a,
            idx: u16::from_le_bytes([b, c]),
        },
        Op::Push => Instruction::Push { src: a },
        Op::Pop => Instruction::Pop { dst: a },
        Op::Swap => Instruction::Swap,
        Op::Rotate => Instruction::Rotate { count: a },
        Op::Dup => Instruction::Dup,
        Op::Add => Instruction::Add { dst: a, lhs: b, rhs: c },
        Op::Sub => Instruction::Sub { dst: a, lhs: b, rhs: c },
        Op::Mul => Instruction::Mul { dst: a, lhs: b, rhs: c },
        Op::Div => Instruction::Div { dst: a, lhs: b, rhs: c },
        Op::Mod => Instruction::Mod { dst: a, lhs: b, rhs: c },
        Op::Pow => Instruction::Pow { dst: a, lhs: b, rhs: c },
        Op::Not => Instruction::Not { dst: a, src: b },
        Op::Eq => Instruction::Eq { dst: a, lhs: b, rhs: c },
        Op::Lt => Instruction::Lt { dst: a, lhs: b, rhs: c },
        Op::Lte => Instruction::Lte { dst: a, lhs: b, rhs: c },
        Op::Gt => Instruction::Gt { dst: a, lhs: b, rhs: c },
        Op::Gte => Instruction::Gte { dst: a, lhs: b, rhs: c },
        Op::Halt => Instruction::Halt,
        Op::Send => Instruction::Send {
            receiver: a,
            message: b,
            sender: c,
        },
        Op::Ret => Instruction::Ret,
        Op::Jmp => {
            let target = u32::from_le_bytes(read_word(code, ip + WORD_SIZE)?);
            Instruction::Jmp { target }
        }
        Op::Save => Instruction::Save { dst: a },
        Op::Restore => Instruction::Restore { src: a },
        Op::AddSym => Instruction::AddSym { dst: a, src: b },
        Op::FindSym => Instruction::FindSym { dst: a, src: b },
        Op::Array => Instruction::Array { count: a },
        Op::String => Instruction::String { count: a },
    };

    Ok((instruction, ip + op.width()))
}

/// Decodes a bytecode byte slice into [`Instruction`]s.
///
/// Unlike the interpreter, which follows jumps, the decoder walks the code
/// linearly. It stops after the first error.
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            failed: false,
        }
    }

    /// Current byte offset in the stream.
    #[inline]
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Whether the decoder has reached the end of the bytecode.
    #[inline]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Decode the next instruction together with its offset.
    pub fn decode_next(
        &mut self,
    ) -> Option<Result<(usize, Instruction), DecodeError>> {
        if self.is_at_end() || self.failed {
            return None;
        }
        let offset = self.pos;
        match decode_at(self.bytes, offset) {
            Ok((instruction, next)) => {
                self.pos = next;
                Some(Ok((offset, instruction)))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

impl Iterator for BytecodeDecoder<'_> {
    type Item = Result<(usize, Instruction), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decode_next()
    }
}
