/// Bytecode opcodes.
///
/// Every instruction starts with one little-endian 32-bit word laid out as
/// `[opcode, a, b, c]`. Register operands are the 8-bit `a`/`b`/`c` bytes.
/// [`LoadI`](Op::LoadI) promotes `b` and `c` to a 16-bit constant index and
/// [`Jmp`](Op::Jmp) is followed by a second word holding its absolute target.
///
/// Opcodes are grouped by their high nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    /// No effect.
    Noop = 0x00,

    /// Copy a register.
    /// Operands: `dst`, `src`
    Move = 0x01,

    /// Load a constant pool entry into a register.
    /// Operands: `dst`, `idx:u16`
    LoadI = 0x02,

    /// Push a register onto the operand stack.
    /// Operands: `src`
    Push = 0x10,

    /// Pop the operand stack into a register.
    /// Operands: `dst`
    Pop = 0x11,

    /// Exchange the two topmost stack values.
    Swap = 0x12,

    /// Reverse the topmost `reg[count]` stack values.
    /// Operands: `count`
    Rotate = 0x13,

    /// Duplicate the topmost stack value.
    Dup = 0x14,

    /// Integer arithmetic. Operands: `dst`, `lhs`, `rhs`
    Add = 0x20,
    Sub = 0x21,
    Mul = 0x22,
    Div = 0x23,
    Mod = 0x24,
    Pow = 0x25,

    /// Bitwise complement.
    /// Operands: `dst`, `src`
    Not = 0x26,

    /// Comparisons fused with the following instruction.
    ///
    /// A true comparison continues with the next instruction (usually a
    /// [`Jmp`](Op::Jmp)); a false one skips it.
    /// Operands: `dst`, `lhs`, `rhs`
    Eq = 0x30,
    Lt = 0x31,
    Lte = 0x32,
    Gt = 0x33,
    Gte = 0x34,

    /// Stop the machine.
    Halt = 0x40,

    /// Deliver a message and dispatch it.
    /// Operands: `receiver`, `message`, `sender`
    Send = 0x41,

    /// Return the top of the stack to the caller.
    Ret = 0x42,

    /// Unconditional absolute jump.
    /// Operands: second word `target:u32`
    Jmp = 0x43,

    /// Capture a continuation.
    /// Operands: `dst`
    Save = 0x44,

    /// Resume a continuation (one-shot).
    /// Operands: `src`
    Restore = 0x45,

    /// Intern the string in `src` and store the symbol.
    /// Operands: `dst`, `src`
    AddSym = 0x50,

    /// Look up the string in `src` without interning.
    /// Operands: `dst`, `src`
    FindSym = 0x51,

    /// Pop `reg[count]` values into a new array.
    /// Operands: `count`
    Array = 0x52,

    /// Pop `reg[count]` values into a new string.
    /// Operands: `count`
    String = 0x53,
}

impl Op {
    pub const ALL: [Op; 30] = [
        Op::Noop,
        Op::Move,
        Op::LoadI,
        Op::Push,
        Op::Pop,
        Op::Swap,
        Op::Rotate,
        Op::Dup,
        Op::Add,
        Op::Sub,
        Op::Mul,
        Op::Div,
        Op::Mod,
        Op::Pow,
        Op::Not,
        Op::Eq,
        Op::Lt,
        Op::Lte,
        Op::Gt,
        Op::Gte,
        Op::Halt,
        Op::Send,
        Op::Ret,
        Op::Jmp,
        Op::Save,
        Op::Restore,
        Op::AddSym,
        Op::FindSym,
        Op::Array,
        Op::String,
    ];

    /// Encoded size of an instruction with this opcode, in bytes.
    pub const fn width(self) -> usize {
        match self {
            Op::Jmp => 2 * crate::WORD_SIZE,
            _ => crate::WORD_SIZE,
        }
    }

    /// Lower-case assembler mnemonic.
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Op::Noop => "noop",
            Op::Move => "move",
            Op::LoadI => "loadi",
            Op::Push => "push",
            Op::Pop => "pop",
            Op::Swap => "swap",
            Op::Rotate => "rotate",
            Op::Dup => "dup",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Mod => "mod",
            Op::Pow => "pow",
            Op::Not => "not",
            Op::Eq => "eq",
            Op::Lt => "lt",
            Op::Lte => "lte",
            Op::Gt => "gt",
            Op::Gte => "gte",
            Op::Halt => "halt",
            Op::Send => "send",
            Op::Ret => "ret",
            Op::Jmp => "jmp",
            Op::Save => "save",
            Op::Restore => "restore",
            Op::AddSym => "addsym",
            Op::FindSym => "findsym",
            Op::Array => "array",
            Op::String => "string",
        }
    }

    pub fn from_mnemonic(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.mnemonic() == name)
    }

    /// Whether this opcode is one of the fused compare+skip comparisons.
    pub const fn is_comparison(self) -> bool {
        matches!(self, Op::Eq | Op::Lt | Op::Lte | Op::Gt | Op::Gte)
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        let op = match byte {
            0x00 => Op::Noop,
            0x01 => Op::Move,
            0x02 => Op::LoadI,
            0x10 => Op::Push,
            0x11 => Op::Pop,
            0x12 => Op::Swap,
            0x13 => Op::Rotate,
            0x14 => Op::Dup,
            0x20 => Op::Add,
            0x21 => Op::Sub,
            0x22 => Op::Mul,
            0x23 => Op::Div,
            0x24 => Op::Mod,
            0x25 => Op::Pow,
            0x26 => Op::Not,
            0x30 => Op::Eq,
            0x31 => Op::Lt,
            0x32 => Op::Lte,
            0x33 => Op::Gt,
            0x34 => Op::Gte,
            0x40 => Op::Halt,
            0x41 => Op::Send,
            0x42 => Op::Ret,
            0x43 => Op::Jmp,
            0x44 => Op::Save,
            0x45 => Op::Restore,
            0x50 => Op::AddSym,
            0x51 => Op::FindSym,
            0x52 => Op::Array,
            0x53 => Op::String,
            _ => return Err(byte),
        };
        Ok(op)
    }
}
