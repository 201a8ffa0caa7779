use crate::WORD_SIZE;
use crate::instruction::Instruction;

/// A forward jump whose target has not yet been resolved.
///
/// Created by [`BytecodeBuilder::jmp_forward`]. Resolve it with
/// [`BytecodeBuilder::bind`].
#[derive(Debug)]
#[must_use = "an unbound label leaves its jump pointing at offset 0"]
pub struct Label {
    /// Position of the u32 target word in the buffer.
    target_pos: usize,
}

/// Builds a bytecode byte sequence.
///
/// All jump targets are absolute byte offsets into the finished buffer.
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Current byte offset in the bytecode stream.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn emit(&mut self, instruction: Instruction) -> &mut Self {
        instruction.encode(&mut self.buf);
        self
    }

    pub fn noop(&mut self) -> &mut Self {
        self.emit(Instruction::Noop)
    }

    pub fn mov(&mut self, dst: u8, src: u8) -> &mut Self {
        self.emit(Instruction::Move { dst, src })
    }

    /// `loadi dst, #idx`: load a constant pool entry.
    pub fn load_i(&mut self, dst: u8, idx: u16) -> &mut Self {
        self.emit(Instruction::LoadI { dst, idx })
    }

    pub fn push(&mut self, src: u8) -> &mut Self {
        self.emit(Instruction::Push { src })
    }

    pub fn pop(&mut self, dst: u8) -> &mut Self {
        self.emit(Instruction::Pop { dst })
    }

    pub fn swap(&mut self) -> &mut Self {
        self.emit(Instruction::Swap)
    }

    pub fn rotate(&mut self, count: u8) -> &mut Self {
        self.emit(Instruction::Rotate { count })
    }

    pub fn dup(&mut self) -> &mut Self {
        self.emit(Instruction::Dup)
    }

    pub fn add(&mut self, dst: u8, lhs: u8, rhs: u8) -> &mut Self {
        self.emit(Instruction::Add { dst, lhs, rhs })
    }

    pub fn sub(&mut self, dst: u8, lhs: u8, rhs: u8) -> &mut Self {
        self.emit(Instruction::Sub { dst, lhs, rhs })
    }

    pub fn mul(&mut self, dst: u8, lhs: u8, rhs: u8) -> &mut Self {
        self.emit(Instruction::Mul { dst, lhs, rhs })
    }

    pub fn div(&mut self, dst: u8, lhs: u8, rhs: u8) -> &mut Self {
        self.emit(Instruction::Div { dst, lhs, rhs })
    }

    pub fn rem(&mut self, dst: u8, lhs: u8, rhs: u8) -> &mut Self {
        self.emit(Instruction::Mod { dst, lhs, rhs })
    }

    pub fn pow(&mut self, dst: u8, lhs: u8, rhs: u8) -> &mut Self {
        self.emit(Instruction::Pow { dst, lhs, rhs })
    }

    pub fn not(&mut self, dst: u8, src: u8) -> &mut Self {
        self.emit(Instruction::Not { dst, src })
    }

    pub fn eq(&mut self, dst: u8, lhs: u8, rhs: u8) -> &mut Self {
        self.emit(Instruction::Eq { dst, lhs, rhs })
    }

    pub fn lt(&mut self, dst: u8, lhs: u8, rhs: u8) -> &mut Self {
        self.emit(Instruction::Lt { dst, lhs, rhs })
    }

    pub fn lte(&mut self, dst: u8, lhs: u8, rhs: u8) -> &mut Self {
        self.emit(Instruction::Lte { dst, lhs, rhs })
    }

    pub fn gt(&mut self, dst: u8, lhs: u8, rhs: u8) -> &mut Self {
        self.emit(Instruction::Gt { dst, lhs, rhs })
    }

    pub fn gte(&mut self, dst: u8, lhs: u8, rhs: u8) -> &mut Self {
        self.emit(Instruction::Gte { dst, lhs, rhs })
    }

    pub fn halt(&mut self) -> &mut Self {
        self.emit(Instruction::Halt)
    }

    pub fn send(&mut self, receiver: u8, message: u8, sender: u8) -> &mut Self {
        self.emit(Instruction::Send {
            receiver,
            message,
            sender,
        })
    }

    pub fn ret(&mut self) -> &mut Self {
        self.emit(Instruction::Ret)
    }

    /// `jmp target` to an already known absolute offset.
    pub fn jmp(&mut self, target: u32) -> &mut Self {
        self.emit(Instruction::Jmp { target })
    }

    /// Emit a jump whose target is bound later with [`bind`](Self::bind).
    pub fn jmp_forward(&mut self) -> Label {
        self.emit(Instruction::Jmp { target: 0 });
        Label {
            target_pos: self.buf.len() - WORD_SIZE,
        }
    }

    /// Bind a forward jump label to the current position.
    pub fn bind(&mut self, label: Label) {
        let target = self.buf.len() as u32;
        self.buf[label.target_pos..label.target_pos + WORD_SIZE]
            .copy_from_slice(&target.to_le_bytes());
    }

    pub fn save(&mut self, dst: u8) -> &mut Self {
        self.emit(Instruction::Save { dst })
    }

    pub fn restore(&mut self, src: u8) -> &mut Self {
        self.emit(Instruction::Restore { src })
    }

    pub fn add_sym(&mut self, dst: u8, src: u8) -> &mut Self {
        self.emit(Instruction::AddSym { dst, src })
    }

    pub fn find_sym(&mut self, dst: u8, src: u8) -> &mut Self {
        self.emit(Instruction::FindSym { dst, src })
    }

    pub fn array(&mut self, count: u8) -> &mut Self {
        self.emit(Instruction::Array { count })
    }

    pub fn string(&mut self, count: u8) -> &mut Self {
        self.emit(Instruction::String { count })
    }

    /// Pad with `noop` up to `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is behind the current position or not word aligned.
    pub fn pad_to(&mut self, offset: usize) -> &mut Self {
        assert!(offset >= self.buf.len(), "cannot pad backwards");
        assert!(offset.is_multiple_of(WORD_SIZE), "unaligned pad target");
        while self.buf.len() < offset {
            self.noop();
        }
        self
    }
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
