//! Bytecode-shape tests over compiled chunks.

use orus::bytecode::{Chunk, Constant, Opcode};
use orus::vm::Vm;
use std::rc::Rc;

fn compile(source: &str) -> Rc<orus::FunctionChunk> {
    Vm::compile(source, "codegen_test.orus").expect("compiles")
}

fn opcodes(chunk: &Chunk) -> Vec<Opcode> {
    chunk
        .instruction_offsets()
        .into_iter()
        .filter_map(|off| Opcode::from_u8(chunk.code[off]))
        .collect()
}

// ============================================================================
// Instruction selection
// ============================================================================

#[test]
fn test_constant_expression_is_one_load() {
    // After folding and peephole, `print(1 + 2 * 3)` is a load of 7 and a
    // print.
    let script = compile("print(1 + 2 * 3)");
    let ops = opcodes(&script.chunk);
    assert_eq!(ops, vec![Opcode::LoadI32, Opcode::PrintR, Opcode::Halt]);
    assert_eq!(
        i16::from_be_bytes([script.chunk.code[2], script.chunk.code[3]]),
        7
    );
}

#[test]
fn test_each_numeric_family_selected() {
    for (source, op) in [
        ("mut a = 1\nprint(a + 1)", Opcode::AddI32R),
        ("mut a = 1i64\nprint(a - 1i64)", Opcode::SubI64R),
        ("mut a = 1u32\nprint(a * 2u32)", Opcode::MulU32R),
        ("mut a = 8u64\nprint(a / 2u64)", Opcode::DivU64R),
        ("mut a = 1.5\nprint(a + 0.5)", Opcode::AddF64R),
    ] {
        let script = compile(source);
        assert!(
            opcodes(&script.chunk).contains(&op),
            "{:?} missing {:?}",
            source,
            op
        );
    }
}

#[test]
fn test_comparison_families() {
    let script = compile("mut a = 1u64\nprint(a < 2u64)\nprint(a >= 2u64)");
    let ops = opcodes(&script.chunk);
    assert!(ops.contains(&Opcode::LtU64R));
    assert!(ops.contains(&Opcode::GeU64R));
}

#[test]
fn test_no_mixed_strategy_instructions() {
    // Every typed arithmetic instruction in a compiled program must name a
    // typed destination AND typed sources: the generator guarantees it by
    // construction, and the demoted form is the standard family. Check that
    // a program mixing variables and induction registers only uses standard
    // opcodes for the mixed operation.
    let script = compile("mut total = 0\nfor i in 0..100 { total = total + i }\nprint(total)");
    let ops = opcodes(&script.chunk);
    // The accumulator add reads a standard global, so it stays standard.
    assert!(ops.contains(&Opcode::AddI32R));
}

#[test]
fn test_for_loop_increment_is_typed() {
    let script = compile("mut s = 0\nfor i in 0..10 { s = s + 1 }\nprint(s)");
    let ops = opcodes(&script.chunk);
    // The induction increment runs against the typed bank.
    assert!(ops.contains(&Opcode::AddI32Typed));
}

#[test]
fn test_runtime_step_uses_range_iterator() {
    let script = compile("mut step = 3\nfor i in 0..10:step { print(i) }");
    let ops = opcodes(&script.chunk);
    assert!(ops.contains(&Opcode::IterBegin));
    assert!(ops.contains(&Opcode::IterNext));
}

// ============================================================================
// Control flow encoding
// ============================================================================

#[test]
fn test_branch_offsets_resolve_to_instruction_starts() {
    let script = compile(
        "mut x = 0\nwhile x < 10 { if x == 5 { break }\nx = x + 1 }\nprint(x)",
    );
    let chunk = &script.chunk;
    let starts: std::collections::HashSet<usize> =
        chunk.instruction_offsets().into_iter().collect();
    for off in chunk.instruction_offsets() {
        let op = Opcode::from_u8(chunk.code[off]).unwrap();
        let next = off + orus::bytecode::instruction_size(&chunk.code, off);
        let target = match op {
            Opcode::Jump => {
                Some(next + u16::from_be_bytes([chunk.code[off + 1], chunk.code[off + 2]]) as usize)
            }
            Opcode::JumpIfNotR | Opcode::TryBegin => {
                Some(next + u16::from_be_bytes([chunk.code[off + 2], chunk.code[off + 3]]) as usize)
            }
            Opcode::Loop => {
                Some(next - u16::from_be_bytes([chunk.code[off + 1], chunk.code[off + 2]]) as usize)
            }
            Opcode::JumpShort => Some(next + chunk.code[off + 1] as usize),
            Opcode::JumpIfNotShortR => Some(next + chunk.code[off + 2] as usize),
            Opcode::LoopShort => Some(next - chunk.code[off + 1] as usize),
            _ => None,
        };
        if let Some(target) = target {
            assert!(
                starts.contains(&target) || target == chunk.code.len(),
                "branch at {} lands mid-instruction at {}",
                off,
                target
            );
        }
    }
}

#[test]
fn test_backward_branch_uses_short_form_when_close() {
    let script = compile("mut x = 0\nwhile x < 3 { x = x + 1 }");
    let ops = opcodes(&script.chunk);
    assert!(ops.contains(&Opcode::LoopShort));
}

// ============================================================================
// Constant pool
// ============================================================================

#[test]
fn test_primitive_dedup_is_exact() {
    let script = compile(
        "let a = 70000\nlet b = 70000\nlet c = 2.5\nlet d = 2.5\nlet s = \"dup\"\nlet t = \"dup\"\nprint(a)",
    );
    let pool = &script.chunk.constants;
    assert_eq!(
        pool.iter()
            .filter(|c| matches!(c, Constant::I32(70000)))
            .count(),
        1
    );
    assert_eq!(
        pool.iter()
            .filter(|c| matches!(c, Constant::F64(v) if *v == 2.5))
            .count(),
        1
    );
    assert_eq!(
        pool.iter()
            .filter(|c| matches!(c, Constant::Str(s) if s == "dup"))
            .count(),
        1
    );
}

#[test]
fn test_constant_indices_stable() {
    let script = compile("let a = 70000\nlet b = 80000\nlet c = 70000\nprint(a)");
    let pool = &script.chunk.constants;
    let first = pool
        .iter()
        .position(|c| matches!(c, Constant::I32(70000)))
        .unwrap();
    // Re-adding 70000 reused the original index; 80000 sits after it.
    let second = pool
        .iter()
        .position(|c| matches!(c, Constant::I32(80000)))
        .unwrap();
    assert!(first < second);
}

// ============================================================================
// Functions and chunks
// ============================================================================

#[test]
fn test_function_chunk_metadata() {
    let script = compile(
        "fn mix(a: i32, b: i32, c: i32) -> i32 { let t = a + b\nreturn t + c }\nprint(mix(1, 2, 3))",
    );
    let func = script
        .chunk
        .constants
        .iter()
        .find_map(|c| match c {
            Constant::Function(f) => Some(f.clone()),
            _ => None,
        })
        .expect("function constant");
    assert_eq!(func.arity, 3);
    assert_eq!(func.upvalue_count, 0);
    // Three parameters plus one local.
    assert!(func.register_count >= 4);
}

#[test]
fn test_chunk_lines_track_source() {
    let script = compile("let a = 1\n\n\nprint(a)");
    let chunk = &script.chunk;
    let print_off = chunk
        .instruction_offsets()
        .into_iter()
        .find(|&off| chunk.code[off] == Opcode::PrintR as u8)
        .expect("print emitted");
    assert_eq!(chunk.line_at(print_off), 4);
}

#[test]
fn test_disassembler_lists_nested_functions() {
    let script = compile("fn f() -> i32 { return 7 }\nprint(f())");
    let text = orus::disassemble(&script.chunk, "<script>");
    assert!(text.contains("== <script> =="));
    assert!(text.contains("== f =="));
    assert!(text.contains("call"));
}
