//! Bytecode container and constant pool.

use super::opcode::{instruction_size, Opcode};
use std::fmt::Write as _;
use std::rc::Rc;

/// A pooled constant. Primitives deduplicate by value equality (f64 by bit
/// pattern so that `-0.0` and `NaN` payloads stay distinct); strings
/// deduplicate by content; function constants are always unique.
#[derive(Debug, Clone)]
pub enum Constant {
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F64(f64),
    Bool(bool),
    Str(String),
    Function(Rc<FunctionChunk>),
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::I32(a), Constant::I32(b)) => a == b,
            (Constant::I64(a), Constant::I64(b)) => a == b,
            (Constant::U32(a), Constant::U32(b)) => a == b,
            (Constant::U64(a), Constant::U64(b)) => a == b,
            (Constant::F64(a), Constant::F64(b)) => a.to_bits() == b.to_bits(),
            (Constant::Bool(a), Constant::Bool(b)) => a == b,
            (Constant::Str(a), Constant::Str(b)) => a == b,
            _ => false,
        }
    }
}

/// Compiled function: the callable unit referenced from the constant pool.
#[derive(Debug)]
pub struct FunctionChunk {
    pub name: String,
    pub arity: u8,
    pub upvalue_count: u8,
    /// Frame registers the body touches; the VM checks this against the
    /// frame window size when a frame is allocated.
    pub register_count: u8,
    pub chunk: Chunk,
}

/// Bytecode plus parallel per-byte source coordinates and the constant pool.
#[derive(Debug, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub lines: Vec<u32>,
    pub columns: Vec<u32>,
    /// Per-byte index into `paths`.
    pub files: Vec<u16>,
    pub paths: Vec<String>,
    pub constants: Vec<Constant>,
}

impl Chunk {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            paths: vec![path.into()],
            ..Self::default()
        }
    }

    pub fn write(&mut self, byte: u8, line: u32, column: u32) {
        self.code.push(byte);
        self.lines.push(line);
        self.columns.push(column);
        self.files.push(0);
    }

    /// Intern a constant, reusing an existing entry when the pool already
    /// holds an equal value. Indices are stable for the chunk's lifetime.
    pub fn add_constant(&mut self, constant: Constant) -> u16 {
        if !matches!(constant, Constant::Function(_)) {
            if let Some(idx) = self.constants.iter().position(|c| *c == constant) {
                return idx as u16;
            }
        }
        let idx = self.constants.len();
        debug_assert!(idx <= u16::MAX as usize, "constant pool overflow");
        self.constants.push(constant);
        idx as u16
    }

    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(0)
    }

    pub fn column_at(&self, offset: usize) -> u32 {
        self.columns.get(offset).copied().unwrap_or(0)
    }

    /// Count whole instructions in the stream.
    pub fn instruction_count(&self) -> usize {
        let mut count = 0;
        let mut offset = 0;
        while offset < self.code.len() {
            offset += instruction_size(&self.code, offset);
            count += 1;
        }
        count
    }

    /// Offsets of every instruction start, in order.
    pub fn instruction_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::new();
        let mut offset = 0;
        while offset < self.code.len() {
            offsets.push(offset);
            offset += instruction_size(&self.code, offset);
        }
        offsets
    }
}

/// Human-readable chunk dump, used by `--show-bytecode`.
pub fn disassemble(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        let _ = writeln!(out, "{}", disassemble_at(chunk, offset));
        offset += instruction_size(&chunk.code, offset);
    }
    // Nested function chunks follow their parent.
    for constant in &chunk.constants {
        if let Constant::Function(func) = constant {
            out.push_str(&disassemble(&func.chunk, &func.name));
        }
    }
    out
}

/// One instruction at `offset`.
pub fn disassemble_at(chunk: &Chunk, offset: usize) -> String {
    let code = &chunk.code;
    let Some(op) = Opcode::from_u8(code[offset]) else {
        return format!("{:04}  ?? 0x{:02x}", offset, code[offset]);
    };
    let a = code.get(offset + 1).copied().unwrap_or(0);
    let b = code.get(offset + 2).copied().unwrap_or(0);
    let c = code.get(offset + 3).copied().unwrap_or(0);
    let line = chunk.line_at(offset);
    let head = format!("{:04} {:4} {:14}", offset, line, op.mnemonic());
    let operands = match op {
        Opcode::Nop | Opcode::Halt | Opcode::TryEnd | Opcode::ReturnNil => String::new(),
        Opcode::LoadConst => {
            let idx = u16::from_be_bytes([b, c]);
            format!("r{}, const[{}] {}", a, idx, describe_constant(chunk, idx))
        }
        Opcode::LoadI32 => {
            let value = i16::from_be_bytes([b, c]);
            format!("r{}, {}", a, value)
        }
        Opcode::LoadTrue | Opcode::LoadFalse | Opcode::LoadNil => format!("r{}", a),
        Opcode::Move => format!("r{}, r{}", a, b),
        Opcode::Jump | Opcode::Loop => {
            let off = u16::from_be_bytes([a, b]);
            format!("{:+}", if op == Opcode::Loop { -(off as i32) } else { off as i32 })
        }
        Opcode::JumpShort | Opcode::LoopShort => {
            format!("{:+}", if op == Opcode::LoopShort { -(a as i32) } else { a as i32 })
        }
        Opcode::JumpIfNotR => {
            let off = u16::from_be_bytes([b, c]);
            format!("r{}, {:+}", a, off as i32)
        }
        Opcode::JumpIfNotShortR => format!("r{}, {:+}", a, b as i32),
        Opcode::TryBegin => {
            let off = u16::from_be_bytes([b, c]);
            format!("catch=r{}, {:+}", a, off as i32)
        }
        Opcode::CallR => format!("fn=r{}, args=r{}..{}", a, b, b as u16 + c as u16),
        Opcode::ReturnR | Opcode::Throw | Opcode::PrintR | Opcode::CloseUpvalue => {
            format!("r{}", a)
        }
        Opcode::MakeClosure => {
            let idx = u16::from_be_bytes([b, c]);
            let count = code.get(offset + 4).copied().unwrap_or(0);
            format!(
                "r{}, const[{}] {}, upvalues={}",
                a,
                idx,
                describe_constant(chunk, idx),
                count
            )
        }
        Opcode::GetUpvalue => format!("r{}, upvalue[{}]", a, b),
        Opcode::SetUpvalue => format!("upvalue[{}], r{}", a, b),
        Opcode::EnumNew => {
            let payload = code.get(offset + 3).copied().unwrap_or(0);
            let start = code.get(offset + 4).copied().unwrap_or(0);
            let type_idx =
                u16::from_be_bytes([code[offset + 5], code.get(offset + 6).copied().unwrap_or(0)]);
            format!(
                "r{}, variant={}, payload=r{}..{}, type={}",
                a,
                b,
                start,
                start as u16 + payload as u16,
                describe_constant(chunk, type_idx)
            )
        }
        Opcode::CastR => format!("r{}, r{}, kind={}", a, b, c),
        _ => format!("r{}, r{}, r{}", a, b, c),
    };
    format!("{} {}", head, operands)
}

fn describe_constant(chunk: &Chunk, idx: u16) -> String {
    match chunk.constants.get(idx as usize) {
        Some(Constant::I32(v)) => format!("({})", v),
        Some(Constant::I64(v)) => format!("({}i64)", v),
        Some(Constant::U32(v)) => format!("({}u32)", v),
        Some(Constant::U64(v)) => format!("({}u64)", v),
        Some(Constant::F64(v)) => format!("({})", v),
        Some(Constant::Bool(v)) => format!("({})", v),
        Some(Constant::Str(s)) => format!("({:?})", s),
        Some(Constant::Function(f)) => format!("(fn {})", f.name),
        None => "(?)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_dedup() {
        let mut chunk = Chunk::new("test.orus");
        let a = chunk.add_constant(Constant::I32(7));
        let b = chunk.add_constant(Constant::I32(7));
        let c = chunk.add_constant(Constant::I32(8));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(chunk.constants.len(), 2);
    }

    #[test]
    fn test_string_dedup_by_content() {
        let mut chunk = Chunk::new("test.orus");
        let a = chunk.add_constant(Constant::Str("hello".into()));
        let b = chunk.add_constant(Constant::Str("hello".into()));
        assert_eq!(a, b);
    }

    #[test]
    fn test_f64_dedup_by_bits() {
        let mut chunk = Chunk::new("test.orus");
        let a = chunk.add_constant(Constant::F64(0.0));
        let b = chunk.add_constant(Constant::F64(-0.0));
        assert_ne!(a, b);
    }

    #[test]
    fn test_cross_type_values_do_not_merge() {
        let mut chunk = Chunk::new("test.orus");
        let a = chunk.add_constant(Constant::I32(1));
        let b = chunk.add_constant(Constant::I64(1));
        assert_ne!(a, b);
    }

    #[test]
    fn test_instruction_count_mixed_lengths() {
        let mut chunk = Chunk::new("test.orus");
        for byte in [
            Opcode::LoadI32 as u8,
            5,
            0,
            7, // 4 bytes
            Opcode::JumpShort as u8,
            2, // 2 bytes
            Opcode::Halt as u8,
            0,
            0,
            0, // 4 bytes
        ] {
            chunk.write(byte, 1, 1);
        }
        assert_eq!(chunk.instruction_count(), 3);
        assert_eq!(chunk.instruction_offsets(), vec![0, 4, 6]);
    }

    #[test]
    fn test_disassemble_smoke() {
        let mut chunk = Chunk::new("test.orus");
        for byte in [Opcode::LoadI32 as u8, 192, 0, 7] {
            chunk.write(byte, 1, 1);
        }
        for byte in [Opcode::PrintR as u8, 192, 0, 0] {
            chunk.write(byte, 1, 1);
        }
        let text = disassemble(&chunk, "<script>");
        assert!(text.contains("load.i32"));
        assert!(text.contains("print"));
    }
}
