mod op;
mod instruction;
mod builder;
mod decoder;
mod image;
mod asm;

pub use op::Op;
pub use instruction::Instruction;
pub use builder::{BytecodeBuilder, Label};
pub use decoder::{BytecodeDecoder, DecodeError, decode_at};
pub use image::{Constant, FORMAT_VERSION, HEADER_SIZE, IMAGE_MAGIC, Image, ImageError};
pub use asm::{AsmError, assemble, disassemble};

/// Size of one instruction word in bytes.
pub const WORD_SIZE: usize = 4;
