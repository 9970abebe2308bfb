//! Bytecode: opcodes, the chunk container, and the disassembler.

pub mod chunk;
pub mod opcode;

pub use chunk::{disassemble, disassemble_at, Chunk, Constant, FunctionChunk};
pub use opcode::{instruction_size, Opcode, MAX_OPCODE};
