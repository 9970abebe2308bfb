//! Post-pass peephole rewrites over the finalised byte stream.
//!
//! Two single-pass rewrites:
//!
//! 1. `LOAD_* Rt, k ; MOVE Rd, Rt` where `Rt` is not read again becomes
//!    `LOAD_* Rd, k`, dropping the move.
//! 2. `MOVE Rx, Rx` is removed outright.
//!
//! Both shrink the buffer by shifting the tail, which moves every later
//! branch target, so the pass first builds the branch-target set from the
//! patch list and refuses any rewrite that would delete a targeted
//! instruction or read across one. After a deletion the surviving branches
//! are re-encoded against the shifted layout.

use super::{BytecodeBuffer, Patch};
use crate::bytecode::{instruction_size, Opcode};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PeepholeStats {
    pub loads_coalesced: usize,
    pub self_moves_removed: usize,
}

pub fn run(buffer: &mut BytecodeBuffer) -> PeepholeStats {
    let mut stats = PeepholeStats::default();
    stats.loads_coalesced = coalesce_load_moves(buffer);
    stats.self_moves_removed = remove_self_moves(buffer);
    stats
}

/// Branch instructions and their decoded absolute targets.
fn branch_targets(buffer: &BytecodeBuffer) -> HashSet<usize> {
    let code = &buffer.chunk.code;
    let mut targets = HashSet::new();
    for patch in &buffer.patches {
        if let Some(target) = decode_branch_target(code, patch.instr_offset) {
            targets.insert(target);
        }
    }
    targets
}

/// The absolute target of the branch instruction at `offset`, if it is one.
fn decode_branch_target(code: &[u8], offset: usize) -> Option<usize> {
    let op = Opcode::from_u8(*code.get(offset)?)?;
    let size = instruction_size(code, offset);
    let next = offset + size;
    match op {
        Opcode::Jump => {
            let rel = u16::from_be_bytes([code[offset + 1], code[offset + 2]]) as usize;
            Some(next + rel)
        }
        Opcode::JumpIfNotR | Opcode::TryBegin => {
            let rel = u16::from_be_bytes([code[offset + 2], code[offset + 3]]) as usize;
            Some(next + rel)
        }
        Opcode::Loop => {
            let rel = u16::from_be_bytes([code[offset + 1], code[offset + 2]]) as usize;
            Some(next - rel)
        }
        Opcode::JumpShort => Some(next + code[offset + 1] as usize),
        Opcode::JumpIfNotShortR => Some(next + code[offset + 2] as usize),
        Opcode::LoopShort => Some(next - code[offset + 1] as usize),
        _ => None,
    }
}

/// Registers the instruction at `offset` reads.
fn register_reads(code: &[u8], offset: usize) -> Vec<u8> {
    let Some(op) = Opcode::from_u8(code[offset]) else {
        return Vec::new();
    };
    let a = code.get(offset + 1).copied().unwrap_or(0);
    let b = code.get(offset + 2).copied().unwrap_or(0);
    let c = code.get(offset + 3).copied().unwrap_or(0);
    let range = |start: u8, count: u8| -> Vec<u8> {
        (0..count).map(|i| start.wrapping_add(i)).collect()
    };
    match op {
        Opcode::Move
        | Opcode::NegR
        | Opcode::NotR
        | Opcode::CastR
        | Opcode::ArrayLen
        | Opcode::FieldGet => vec![b],
        op if (Opcode::AddI32R as u8..=Opcode::GeF64R as u8).contains(&(op as u8)) => vec![b, c],
        Opcode::EqR
        | Opcode::NeR
        | Opcode::AndR
        | Opcode::OrR
        | Opcode::XorR
        | Opcode::ShlR
        | Opcode::ShrR
        | Opcode::ConcatR
        | Opcode::ArrayGet => vec![b, c],
        Opcode::ArraySet => vec![a, b, c],
        Opcode::ArrayPush => vec![a, b],
        Opcode::MakeArray => range(b, c),
        Opcode::IterBegin => {
            if c == 1 {
                range(b, 3)
            } else {
                vec![b]
            }
        }
        Opcode::IterNext => vec![a],
        Opcode::JumpIfNotR | Opcode::JumpIfNotShortR => vec![a],
        Opcode::CallR => {
            let mut reads = vec![a];
            reads.extend(range(b, c));
            reads
        }
        Opcode::ReturnR | Opcode::Throw | Opcode::PrintR => vec![a],
        Opcode::SetUpvalue => vec![b],
        Opcode::MakeClosure => {
            // Captured locals are read when the closure is built.
            let count = code.get(offset + 4).copied().unwrap_or(0) as usize;
            let mut reads = Vec::new();
            for k in 0..count {
                if code.get(offset + 5 + 2 * k).copied() == Some(1) {
                    if let Some(idx) = code.get(offset + 6 + 2 * k) {
                        reads.push(*idx);
                    }
                }
            }
            reads
        }
        Opcode::EnumNew => {
            let count = code.get(offset + 3).copied().unwrap_or(0);
            let start = code.get(offset + 4).copied().unwrap_or(0);
            range(start, count)
        }
        Opcode::FieldSet => vec![a, c],
        // The catch register is written on unwind; be conservative and
        // treat it as live.
        Opcode::TryBegin => vec![a],
        _ => Vec::new(),
    }
}

/// Registers the instruction at `offset` writes.
fn register_writes(code: &[u8], offset: usize) -> Vec<u8> {
    let Some(op) = Opcode::from_u8(code[offset]) else {
        return Vec::new();
    };
    let a = code.get(offset + 1).copied().unwrap_or(0);
    let b = code.get(offset + 2).copied().unwrap_or(0);
    let c = code.get(offset + 3).copied().unwrap_or(0);
    match op {
        Opcode::LoadConst
        | Opcode::LoadI32
        | Opcode::LoadTrue
        | Opcode::LoadFalse
        | Opcode::LoadNil
        | Opcode::Move
        | Opcode::NegR
        | Opcode::NotR
        | Opcode::CastR
        | Opcode::ConcatR
        | Opcode::MakeArray
        | Opcode::ArrayGet
        | Opcode::ArrayLen
        | Opcode::IterBegin
        | Opcode::MakeClosure
        | Opcode::GetUpvalue
        | Opcode::EnumNew
        | Opcode::FieldGet
        | Opcode::EqR
        | Opcode::NeR
        | Opcode::AndR
        | Opcode::OrR
        | Opcode::XorR
        | Opcode::ShlR
        | Opcode::ShrR => vec![a],
        op if (Opcode::AddI32R as u8..=Opcode::GeF64R as u8).contains(&(op as u8)) => vec![a],
        Opcode::IterNext => vec![b, c],
        Opcode::CallR => vec![a],
        _ => Vec::new(),
    }
}

/// True when `reg` is read again at or after `from` before being
/// overwritten, scanning only the straight-line region up to the first
/// branch or branch target.
fn read_before_clobber(
    code: &[u8],
    offsets: &[usize],
    from_index: usize,
    reg: u8,
    targets: &HashSet<usize>,
) -> bool {
    for &off in &offsets[from_index..] {
        if targets.contains(&off) {
            // Control can merge here from elsewhere.
            return true;
        }
        let op = Opcode::from_u8(code[off]);
        if register_reads(code, off).contains(&reg) {
            return true;
        }
        if matches!(op, Some(op) if op.is_branch()) {
            return true;
        }
        if register_writes(code, off).contains(&reg) {
            return false;
        }
        if matches!(
            op,
            Some(Opcode::Halt) | Some(Opcode::ReturnR) | Some(Opcode::ReturnNil)
        ) {
            return false;
        }
    }
    false
}

/// Pass 1: fold `LOAD_* Rt, k ; MOVE Rd, Rt` into `LOAD_* Rd, k`.
fn coalesce_load_moves(buffer: &mut BytecodeBuffer) -> usize {
    let targets = branch_targets(buffer);
    let offsets = buffer.chunk.instruction_offsets();
    let mut deletions: HashSet<usize> = HashSet::new();
    let mut rd_rewrites: Vec<(usize, u8)> = Vec::new();

    for (i, &off) in offsets.iter().enumerate() {
        if i + 1 >= offsets.len() {
            break;
        }
        let code = &buffer.chunk.code;
        let op = Opcode::from_u8(code[off]);
        let is_load = matches!(
            op,
            Some(Opcode::LoadConst)
                | Some(Opcode::LoadI32)
                | Some(Opcode::LoadTrue)
                | Some(Opcode::LoadFalse)
                | Some(Opcode::LoadNil)
        );
        if !is_load {
            continue;
        }
        let move_off = offsets[i + 1];
        if Opcode::from_u8(code[move_off]) != Some(Opcode::Move) {
            continue;
        }
        // The move must not be a branch target, or deleting it would strand
        // the branch mid-stream.
        if targets.contains(&move_off) {
            continue;
        }
        let rt = code[off + 1];
        let rd = code[move_off + 1];
        let rs = code[move_off + 2];
        if rs != rt || rd == rt {
            continue;
        }
        if deletions.contains(&move_off) {
            continue;
        }
        // Rt must be dead after the move.
        if read_before_clobber(code, &offsets, i + 2, rt, &targets) {
            continue;
        }
        rd_rewrites.push((off + 1, rd));
        deletions.insert(move_off);
    }

    for (offset, rd) in rd_rewrites {
        buffer.chunk.code[offset] = rd;
    }
    let count = deletions.len();
    if count > 0 {
        rebuild(buffer, &deletions);
    }
    count
}

/// Pass 2: delete `MOVE Rx, Rx`.
fn remove_self_moves(buffer: &mut BytecodeBuffer) -> usize {
    let targets = branch_targets(buffer);
    let offsets = buffer.chunk.instruction_offsets();
    let mut deletions: HashSet<usize> = HashSet::new();
    let code = &buffer.chunk.code;
    for &off in &offsets {
        if Opcode::from_u8(code[off]) == Some(Opcode::Move)
            && code[off + 1] == code[off + 2]
            && !targets.contains(&off)
        {
            deletions.insert(off);
        }
    }
    let count = deletions.len();
    if count > 0 {
        rebuild(buffer, &deletions);
    }
    count
}

/// Rebuild the stream without the deleted instructions, remapping every
/// surviving branch offset onto the shifted layout.
fn rebuild(buffer: &mut BytecodeBuffer, deletions: &HashSet<usize>) {
    let chunk = &buffer.chunk;
    let offsets = chunk.instruction_offsets();

    // Old instruction offset (and end-of-code) to new offset.
    let mut map: HashMap<usize, usize> = HashMap::new();
    let mut new_len = 0usize;
    for &off in &offsets {
        map.insert(off, new_len);
        if !deletions.contains(&off) {
            new_len += instruction_size(&chunk.code, off);
        }
    }
    map.insert(chunk.code.len(), new_len);

    let mut code = Vec::with_capacity(new_len);
    let mut lines = Vec::with_capacity(new_len);
    let mut columns = Vec::with_capacity(new_len);
    let mut files = Vec::with_capacity(new_len);
    let mut new_patches: Vec<Patch> = Vec::new();

    for &off in &offsets {
        if deletions.contains(&off) {
            continue;
        }
        let size = instruction_size(&chunk.code, off);
        let new_off = code.len();
        for i in off..off + size {
            code.push(chunk.code[i]);
            lines.push(chunk.lines[i]);
            columns.push(chunk.columns[i]);
            files.push(chunk.files[i]);
        }
        // Re-encode branch operands against the new layout.
        if let Some(old_target) = decode_branch_target(&chunk.code, off) {
            let new_target = *map
                .get(&old_target)
                .expect("branch target is an instruction boundary");
            let op = Opcode::from_u8(chunk.code[off]).expect("decoded above");
            let next = new_off + size;
            let (operand_pos, backward, short) = match op {
                Opcode::Jump | Opcode::Loop => (new_off + 1, op == Opcode::Loop, false),
                Opcode::JumpIfNotR | Opcode::TryBegin => (new_off + 2, false, false),
                Opcode::JumpShort => (new_off + 1, false, true),
                Opcode::LoopShort => (new_off + 1, true, true),
                Opcode::JumpIfNotShortR => (new_off + 2, false, true),
                _ => unreachable!("not a branch"),
            };
            let rel = if backward {
                next - new_target
            } else {
                new_target - next
            };
            if short {
                code[operand_pos] = rel as u8;
            } else {
                code[operand_pos] = (rel >> 8) as u8;
                code[operand_pos + 1] = rel as u8;
            }
            new_patches.push(Patch {
                instr_offset: new_off,
                operand_offset: operand_pos,
                backward,
            });
        }
    }

    buffer.chunk.code = code;
    buffer.chunk.lines = lines;
    buffer.chunk.columns = columns;
    buffer.chunk.files = files;
    buffer.patches = new_patches;
}
