//! Multi-pass code generator.
//!
//! Expression compilation is recursive; each call hands back the register
//! holding its result, and owned temporaries are freed in LIFO order as
//! their last use completes. Control flow runs on the patch list: branches
//! emit a placeholder 16-bit offset and push a patch descriptor, resolved
//! when the target is known. `break`/`continue` queue their patches on the
//! enclosing loop context.
//!
//! Arithmetic instruction selection is driven by the dual register
//! allocator: when the destination and both operands all live in the typed
//! bank of one numeric kind, the typed opcode family is emitted; in every
//! other case the operands demote to the standard family. Mixed strategies
//! are never emitted.
//!
//! After a function body is closed, the peephole and move-coalescing passes
//! rewrite its finished byte stream (see [`peephole`]).

pub mod allocator;
pub mod peephole;

use crate::bytecode::{Chunk, Constant, FunctionChunk, Opcode};
use crate::error::{Diagnostic, ErrorCode, SourceLocation};
use crate::parser::{Ast, BinaryOp, Literal, NodeId, NodeKind, UnaryOp};
use crate::types::{NumericKind, Type, TypeContext};
use allocator::{AllocError, RegisterAllocator, RegisterId};
use std::rc::Rc;
use tracing::debug;

pub use allocator::{AllocStrategy, RegisterAllocation};

/// Where a branch placeholder sits in the stream, for later resolution and
/// for the peephole passes' branch-target set.
#[derive(Debug, Clone, Copy)]
pub struct Patch {
    /// Offset of the instruction's opcode byte.
    pub instr_offset: usize,
    /// Offset of the relative-offset operand.
    pub operand_offset: usize,
    /// Backward branches encode a subtracted offset.
    pub backward: bool,
}

/// Growable instruction buffer with per-byte source coordinates and the
/// branch patch list.
pub struct BytecodeBuffer {
    pub chunk: Chunk,
    pub patches: Vec<Patch>,
}

impl BytecodeBuffer {
    fn new(path: &str) -> Self {
        Self {
            chunk: Chunk::new(path),
            patches: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.chunk.code.len()
    }

    fn emit(&mut self, op: Opcode, operands: &[u8], loc: SourceLocation) {
        self.chunk.write(op as u8, loc.line, loc.column);
        for &byte in operands {
            self.chunk.write(byte, loc.line, loc.column);
        }
        if let Some(size) = op.fixed_size() {
            for _ in operands.len() + 1..size {
                self.chunk.write(0, loc.line, loc.column);
            }
        }
    }

    /// Emit a forward branch with a placeholder offset; returns the operand
    /// position for `patch_to_here`.
    fn emit_jump(&mut self, op: Opcode, reg: Option<u8>, loc: SourceLocation) -> usize {
        let instr_offset = self.len();
        self.chunk.write(op as u8, loc.line, loc.column);
        if let Some(reg) = reg {
            self.chunk.write(reg, loc.line, loc.column);
        }
        let operand_offset = self.len();
        self.chunk.write(0xFF, loc.line, loc.column);
        self.chunk.write(0xFF, loc.line, loc.column);
        self.patches.push(Patch {
            instr_offset,
            operand_offset,
            backward: false,
        });
        operand_offset
    }

    /// Resolve a placeholder so the branch lands on the current end of the
    /// stream.
    fn patch_to_here(&mut self, operand_offset: usize) {
        let target = self.len();
        let next_ip = operand_offset + 2;
        let rel = (target - next_ip) as u16;
        self.chunk.code[operand_offset] = (rel >> 8) as u8;
        self.chunk.code[operand_offset + 1] = rel as u8;
    }

    /// Emit a backward branch to a known target, using the short form when
    /// the distance fits in one byte.
    fn emit_loop_to(&mut self, target: usize, loc: SourceLocation) {
        let instr_offset = self.len();
        let short_rel = instr_offset + 2 - target;
        if short_rel <= u8::MAX as usize {
            self.chunk
                .write(Opcode::LoopShort as u8, loc.line, loc.column);
            self.chunk.write(short_rel as u8, loc.line, loc.column);
            self.patches.push(Patch {
                instr_offset,
                operand_offset: instr_offset + 1,
                backward: true,
            });
        } else {
            let rel = (instr_offset + 3 - target) as u16;
            self.chunk.write(Opcode::Loop as u8, loc.line, loc.column);
            self.chunk.write((rel >> 8) as u8, loc.line, loc.column);
            self.chunk.write(rel as u8, loc.line, loc.column);
            self.patches.push(Patch {
                instr_offset,
                operand_offset: instr_offset + 1,
                backward: true,
            });
        }
    }
}

/// An expression result: the register holding the value, and whether the
/// register is a temporary this expression owns (and the consumer frees).
#[derive(Debug, Clone, Copy)]
struct ExprValue {
    reg: RegisterId,
    owned: bool,
}

impl ExprValue {
    fn owned(reg: RegisterId) -> Self {
        Self { reg, owned: true }
    }

    fn borrowed(reg: RegisterId) -> Self {
        Self { reg, owned: false }
    }

    fn phys(&self) -> u8 {
        self.reg.physical()
    }
}

/// What a name resolves to in the generator's symbol table.
#[derive(Debug, Clone)]
enum SymbolSlot {
    /// New-style record from the dual allocator.
    Allocation(RegisterAllocation),
    /// Legacy single-register fallback.
    Legacy(u8),
    /// Compile-time constant, inlined at each use.
    Constant(Literal),
}

#[derive(Debug, Clone)]
struct Symbol {
    name: String,
    slot: SymbolSlot,
    mutable: bool,
}

impl Symbol {
    fn register(&self) -> Option<RegisterId> {
        match &self.slot {
            SymbolSlot::Allocation(alloc) => Some(alloc.register_id()),
            SymbolSlot::Legacy(reg) => Some(RegisterId::Standard(*reg)),
            SymbolSlot::Constant(_) => None,
        }
    }
}

/// Pending `break`/`continue` work for one enclosing loop.
struct LoopContext {
    break_patches: Vec<usize>,
    continue_patches: Vec<usize>,
    /// Backward continue target (condition re-check) when already known.
    continue_target: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    is_local: bool,
    index: u8,
}

/// Per-function compilation state.
struct FunctionState {
    buffer: BytecodeBuffer,
    allocator: RegisterAllocator,
    scopes: Vec<Vec<Symbol>>,
    loops: Vec<LoopContext>,
    upvalues: Vec<UpvalueDesc>,
    name: String,
    arity: u8,
}

impl FunctionState {
    fn new(name: &str, path: &str) -> Self {
        let mut allocator = RegisterAllocator::new();
        // Callee frames start from an empty frame/temp bank.
        allocator.reset_frame_registers();
        Self {
            buffer: BytecodeBuffer::new(path),
            allocator,
            scopes: vec![Vec::new()],
            loops: Vec::new(),
            upvalues: Vec::new(),
            name: name.to_string(),
            arity: 0,
        }
    }
}

#[derive(Debug)]
struct CgError {
    location: SourceLocation,
    message: String,
}

impl CgError {
    fn new(location: SourceLocation, message: impl Into<String>) -> Self {
        Self {
            location,
            message: message.into(),
        }
    }

    fn from_alloc(location: SourceLocation, err: AllocError) -> Self {
        Self::new(location, err.to_string())
    }
}

type CgResult<T> = Result<T, CgError>;

/// Compile a resolved, optimized tree into the script function.
pub fn generate(
    ast: &Ast,
    context: &TypeContext,
    path: &str,
) -> Result<Rc<FunctionChunk>, Vec<Diagnostic>> {
    let mut generator = Generator {
        ast,
        context,
        path: path.to_string(),
        states: vec![FunctionState::new("<script>", path)],
        globals: Vec::new(),
    };
    match generator.run() {
        Ok(script) => Ok(script),
        Err(err) => Err(vec![Diagnostic::error(
            ErrorCode::UnsupportedOperation,
            err.location,
            err.message,
        )]),
    }
}

enum Resolved {
    Symbol(Symbol),
    Upvalue(u8),
}

struct Generator<'a> {
    ast: &'a Ast,
    context: &'a TypeContext,
    path: String,
    /// Innermost function last. The script body is the bottom entry.
    states: Vec<FunctionState>,
    /// Script-level symbols (global and module registers, constants); they
    /// are addressable from every frame without capture.
    globals: Vec<Symbol>,
}

impl<'a> Generator<'a> {
    fn run(&mut self) -> CgResult<Rc<FunctionChunk>> {
        let roots = self.ast.roots.clone();
        for root in roots {
            self.statement(root)?;
        }
        let loc = SourceLocation::default();
        self.state().buffer.emit(Opcode::Halt, &[], loc);

        let mut state = self.states.pop().expect("script state");
        let stats = peephole::run(&mut state.buffer);
        debug!(?stats, "peephole finished for <script>");
        Ok(Rc::new(FunctionChunk {
            name: state.name,
            arity: 0,
            upvalue_count: 0,
            register_count: state.allocator.frame_high_water(),
            chunk: state.buffer.chunk,
        }))
    }

    fn state(&mut self) -> &mut FunctionState {
        self.states.last_mut().expect("at least the script state")
    }

    fn loc(&self, id: NodeId) -> SourceLocation {
        self.ast.node(id).location
    }

    fn node_kind(&self, id: NodeId) -> NumericKind {
        self.ast
            .ty(id)
            .and_then(|t| t.numeric_kind())
            .unwrap_or(NumericKind::I32)
    }

    fn at_script_top(&self) -> bool {
        self.states.len() == 1 && self.states[0].scopes.len() == 1
    }

    // ------------------------------------------------------------------
    // Symbols
    // ------------------------------------------------------------------

    fn bind(&mut self, symbol: Symbol) {
        if self.at_script_top() {
            self.globals.push(symbol);
        } else {
            self.state()
                .scopes
                .last_mut()
                .expect("open scope")
                .push(symbol);
        }
    }

    fn lookup_local(&self, name: &str) -> Option<Symbol> {
        let state = self.states.last().expect("state");
        for scope in state.scopes.iter().rev() {
            if let Some(sym) = scope.iter().rev().find(|s| s.name == name) {
                return Some(sym.clone());
            }
        }
        None
    }

    fn lookup_global(&self, name: &str) -> Option<Symbol> {
        self.globals.iter().rev().find(|s| s.name == name).cloned()
    }

    /// Resolve an identifier: local scope chain, then captured upvalue,
    /// then script global.
    fn resolve(&mut self, name: &str) -> Option<Resolved> {
        if let Some(sym) = self.lookup_local(name) {
            return Some(Resolved::Symbol(sym));
        }
        if self.states.len() > 1 {
            if let Some(index) = self.resolve_upvalue(self.states.len() - 1, name) {
                return Some(Resolved::Upvalue(index));
            }
        }
        self.lookup_global(name).map(Resolved::Symbol)
    }

    /// Transitive upvalue resolution over the function-state stack.
    fn resolve_upvalue(&mut self, state_idx: usize, name: &str) -> Option<u8> {
        if state_idx == 0 {
            return None;
        }
        let enclosing = state_idx - 1;
        let local = self.states[enclosing]
            .scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|s| s.name == name)
            .and_then(|s| s.register())
            .map(|r| r.physical());
        if let Some(reg) = local {
            let desc = UpvalueDesc {
                is_local: true,
                index: reg,
            };
            return Some(self.add_upvalue(state_idx, desc));
        }
        if enclosing > 0 {
            if let Some(up) = self.resolve_upvalue(enclosing, name) {
                let desc = UpvalueDesc {
                    is_local: false,
                    index: up,
                };
                return Some(self.add_upvalue(state_idx, desc));
            }
        }
        None
    }

    fn add_upvalue(&mut self, state_idx: usize, desc: UpvalueDesc) -> u8 {
        let upvalues = &mut self.states[state_idx].upvalues;
        if let Some(existing) = upvalues.iter().position(|u| *u == desc) {
            return existing as u8;
        }
        upvalues.push(desc);
        (upvalues.len() - 1) as u8
    }

    fn push_scope(&mut self) {
        self.state().scopes.push(Vec::new());
        self.state().allocator.enter_scope();
    }

    fn pop_scope(&mut self) {
        let symbols = self.state().scopes.pop().expect("open scope");
        for symbol in symbols.iter().rev() {
            if let Some(reg) = symbol.register() {
                self.state().allocator.free(reg);
            }
        }
        self.state().allocator.exit_scope();
    }

    fn compile_block(&mut self, body: &[NodeId]) -> CgResult<()> {
        self.push_scope();
        for &stmt in body {
            self.statement(stmt)?;
        }
        self.pop_scope();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn statement(&mut self, id: NodeId) -> CgResult<()> {
        let loc = self.loc(id);
        match self.ast.kind(id).clone() {
            NodeKind::Let {
                name,
                mutable,
                init,
                ..
            } => {
                let target = if self.at_script_top() {
                    self.state()
                        .allocator
                        .allocate_global()
                        .map_err(|e| CgError::from_alloc(loc, e))?
                } else {
                    self.state()
                        .allocator
                        .allocate_frame()
                        .map_err(|e| CgError::from_alloc(loc, e))?
                };
                if let Some(init) = init {
                    let value = self.expression(init)?;
                    self.emit_move(target.physical(), value.phys(), loc);
                    self.release(value);
                } else {
                    self.state()
                        .buffer
                        .emit(Opcode::LoadNil, &[target.physical()], loc);
                }
                self.bind(Symbol {
                    name,
                    slot: SymbolSlot::Legacy(target.physical()),
                    mutable,
                });
                Ok(())
            }
            NodeKind::Static { name, mutable, init } => {
                let target = self
                    .state()
                    .allocator
                    .allocate_module()
                    .map_err(|e| CgError::from_alloc(loc, e))?;
                let value = self.expression(init)?;
                self.emit_move(target.physical(), value.phys(), loc);
                self.release(value);
                self.bind(Symbol {
                    name,
                    slot: SymbolSlot::Legacy(target.physical()),
                    mutable,
                });
                Ok(())
            }
            NodeKind::Const { name, init } => {
                // The folder already reduced the initializer; anything left
                // unreduced falls back to an immutable global register.
                if let NodeKind::Literal(lit) = self.ast.kind(init) {
                    self.bind(Symbol {
                        name,
                        slot: SymbolSlot::Constant(lit.clone()),
                        mutable: false,
                    });
                    return Ok(());
                }
                let target = self
                    .state()
                    .allocator
                    .allocate_global()
                    .map_err(|e| CgError::from_alloc(loc, e))?;
                let value = self.expression(init)?;
                self.emit_move(target.physical(), value.phys(), loc);
                self.release(value);
                self.bind(Symbol {
                    name,
                    slot: SymbolSlot::Legacy(target.physical()),
                    mutable: false,
                });
                Ok(())
            }
            NodeKind::Function { .. } => self.function_decl(id, None),
            NodeKind::ImplBlock { target, methods } => {
                for method in methods {
                    self.function_decl(method, Some(&target))?;
                }
                Ok(())
            }
            NodeKind::StructDecl { .. } | NodeKind::Import(_) | NodeKind::Use(_) => Ok(()),
            NodeKind::If {
                condition,
                then_block,
                else_block,
            } => {
                let cond = self.expression(condition)?;
                let else_patch =
                    self.state()
                        .buffer
                        .emit_jump(Opcode::JumpIfNotR, Some(cond.phys()), loc);
                self.release(cond);
                self.compile_block(&then_block)?;
                if let Some(else_block) = else_block {
                    let end_patch = self.state().buffer.emit_jump(Opcode::Jump, None, loc);
                    self.state().buffer.patch_to_here(else_patch);
                    self.compile_block(&else_block)?;
                    self.state().buffer.patch_to_here(end_patch);
                } else {
                    self.state().buffer.patch_to_here(else_patch);
                }
                Ok(())
            }
            NodeKind::While { condition, body } => {
                let loop_start = self.state().buffer.len();
                let cond = self.expression(condition)?;
                let exit_patch =
                    self.state()
                        .buffer
                        .emit_jump(Opcode::JumpIfNotR, Some(cond.phys()), loc);
                self.release(cond);
                self.state().loops.push(LoopContext {
                    break_patches: Vec::new(),
                    continue_patches: Vec::new(),
                    continue_target: Some(loop_start),
                });
                self.compile_block(&body)?;
                self.state().buffer.emit_loop_to(loop_start, loc);
                let ctx = self.state().loops.pop().expect("loop context");
                self.state().buffer.patch_to_here(exit_patch);
                for patch in ctx.break_patches {
                    self.state().buffer.patch_to_here(patch);
                }
                // Backward continues were emitted in place; nothing queued.
                debug_assert!(ctx.continue_patches.is_empty());
                Ok(())
            }
            NodeKind::For {
                var,
                start,
                end,
                step,
                body,
            } => self.for_range(loc, &var, start, end, step, &body),
            NodeKind::ForEach {
                var,
                iterable,
                body,
            } => {
                let source = self.expression(iterable)?;
                self.for_iterator(loc, &var, source, false, &body)
            }
            NodeKind::Return(value) => {
                match value {
                    Some(value) => {
                        let result = self.expression(value)?;
                        self.state()
                            .buffer
                            .emit(Opcode::ReturnR, &[result.phys()], loc);
                        self.release(result);
                    }
                    None => self.state().buffer.emit(Opcode::ReturnNil, &[], loc),
                }
                Ok(())
            }
            NodeKind::Break => {
                let patch = self.state().buffer.emit_jump(Opcode::Jump, None, loc);
                match self.state().loops.last_mut() {
                    Some(ctx) => {
                        ctx.break_patches.push(patch);
                        Ok(())
                    }
                    None => Err(CgError::new(loc, "`break` outside of a loop")),
                }
            }
            NodeKind::Continue => {
                let target = match self.state().loops.last() {
                    Some(ctx) => ctx.continue_target,
                    None => return Err(CgError::new(loc, "`continue` outside of a loop")),
                };
                match target {
                    Some(target) => self.state().buffer.emit_loop_to(target, loc),
                    None => {
                        let patch = self.state().buffer.emit_jump(Opcode::Jump, None, loc);
                        self.state()
                            .loops
                            .last_mut()
                            .expect("loop context")
                            .continue_patches
                            .push(patch);
                    }
                }
                Ok(())
            }
            NodeKind::Try {
                body,
                catch_name,
                catch_body,
            } => {
                let catch_reg = self
                    .state()
                    .allocator
                    .allocate_frame()
                    .map_err(|e| CgError::from_alloc(loc, e))?;
                let try_patch = self.state().buffer.emit_jump(
                    Opcode::TryBegin,
                    Some(catch_reg.physical()),
                    loc,
                );
                self.compile_block(&body)?;
                self.state().buffer.emit(Opcode::TryEnd, &[], loc);
                let end_patch = self.state().buffer.emit_jump(Opcode::Jump, None, loc);
                self.state().buffer.patch_to_here(try_patch);
                self.push_scope();
                self.bind(Symbol {
                    name: catch_name,
                    slot: SymbolSlot::Legacy(catch_reg.physical()),
                    mutable: false,
                });
                for stmt in &catch_body {
                    self.statement(*stmt)?;
                }
                self.pop_scope();
                self.state().buffer.patch_to_here(end_patch);
                self.state().allocator.free(catch_reg);
                Ok(())
            }
            NodeKind::Print(args) => {
                for arg in args {
                    let value = self.expression(arg)?;
                    self.state()
                        .buffer
                        .emit(Opcode::PrintR, &[value.phys()], loc);
                    self.release(value);
                }
                Ok(())
            }
            NodeKind::Block(body) => self.compile_block(&body),
            NodeKind::ExprStmt(expr) => {
                let value = self.expression(expr)?;
                self.release(value);
                Ok(())
            }
            other => Err(CgError::new(
                loc,
                format!(
                    "unexpected statement node: {:?}",
                    std::mem::discriminant(&other)
                ),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------

    /// `for var in start..end[:step]` with a compile-time constant step (or
    /// none) lowers to a typed compare/add loop; the induction variable
    /// gets a typed register with a residency hint so frees inside the body
    /// cannot evict it. A runtime step falls back to a range iterator.
    fn for_range(
        &mut self,
        loc: SourceLocation,
        var: &str,
        start: NodeId,
        end: NodeId,
        step: Option<NodeId>,
        body: &[NodeId],
    ) -> CgResult<()> {
        let kind = self.node_kind(start);

        let step_literal = step.and_then(|s| match self.ast.kind(s) {
            NodeKind::Literal(lit) => literal_as_i64(lit),
            _ => None,
        });
        if step.is_some() && step_literal.is_none() {
            // Runtime step: build a range iterator from three consecutive
            // registers.
            let slots = self
                .state()
                .allocator
                .allocate_consecutive_temps(3)
                .map_err(|e| CgError::from_alloc(loc, e))?;
            let start_v = self.expression(start)?;
            self.emit_move(slots[0].physical(), start_v.phys(), loc);
            self.release(start_v);
            let end_v = self.expression(end)?;
            self.emit_move(slots[1].physical(), end_v.phys(), loc);
            self.release(end_v);
            let step_v = self.expression(step.expect("checked above"))?;
            self.emit_move(slots[2].physical(), step_v.phys(), loc);
            self.release(step_v);

            let iter = self
                .state()
                .allocator
                .allocate_temp()
                .map_err(|e| CgError::from_alloc(loc, e))?;
            self.state().buffer.emit(
                Opcode::IterBegin,
                &[iter.physical(), slots[0].physical(), 1],
                loc,
            );
            for slot in slots {
                self.state().allocator.free(slot);
            }
            return self.for_iterator(loc, var, ExprValue::owned(iter), true, body);
        }

        let step_value = step_literal.unwrap_or(1);
        if step_value == 0 {
            // An empty range; evaluate the endpoints for effect only.
            let s = self.expression(start)?;
            self.release(s);
            let e = self.expression(end)?;
            self.release(e);
            return Ok(());
        }

        self.push_scope();

        // Induction variable: typed slot pinned for the loop's lifetime.
        let induction = match self.state().allocator.allocate_typed(kind) {
            Ok(reg) => reg,
            Err(_) => self
                .state()
                .allocator
                .allocate_frame()
                .map_err(|e| CgError::from_alloc(loc, e))?,
        };
        self.state().allocator.set_residency_hint(induction);
        let record = self.state().allocator.record(induction);

        let start_v = self.expression(start)?;
        self.emit_move(induction.physical(), start_v.phys(), loc);
        self.release(start_v);

        // Loop bound and step stay in registers across iterations.
        let end_v = self.expression(end)?;
        let bound = self.claim(end_v, loc)?;
        let step_reg = self.load_step(kind, step_value, loc)?;

        self.bind(Symbol {
            name: var.to_string(),
            slot: SymbolSlot::Allocation(record),
            mutable: false,
        });

        let cond_start = self.state().buffer.len();
        let cmp = self
            .state()
            .allocator
            .allocate_temp()
            .map_err(|e| CgError::from_alloc(loc, e))?;
        let cmp_op = if step_value > 0 {
            compare_opcode(kind, BinaryOp::Less)
        } else {
            compare_opcode(kind, BinaryOp::Greater)
        };
        self.state().buffer.emit(
            cmp_op,
            &[cmp.physical(), induction.physical(), bound.physical()],
            loc,
        );
        let exit_patch =
            self.state()
                .buffer
                .emit_jump(Opcode::JumpIfNotR, Some(cmp.physical()), loc);
        self.state().allocator.free(cmp);

        self.state().loops.push(LoopContext {
            break_patches: Vec::new(),
            continue_patches: Vec::new(),
            continue_target: None,
        });
        self.compile_block(body)?;

        // Continue lands on the increment.
        let pending: Vec<usize> = {
            let ctx = self.state().loops.last_mut().expect("loop context");
            std::mem::take(&mut ctx.continue_patches)
        };
        for patch in pending {
            self.state().buffer.patch_to_here(patch);
        }

        // Typed increment only when the whole triple shares one bank.
        let all_typed = matches!(
            (induction, step_reg),
            (RegisterId::Typed(a, _), RegisterId::Typed(b, _)) if a == b && a == kind
        );
        self.state().allocator.note_arith_op();
        let add_op = arith_opcode(kind, BinaryOp::Add, all_typed);
        self.state().buffer.emit(
            add_op,
            &[
                induction.physical(),
                induction.physical(),
                step_reg.physical(),
            ],
            loc,
        );
        self.state().buffer.emit_loop_to(cond_start, loc);

        let ctx = self.state().loops.pop().expect("loop context");
        self.state().buffer.patch_to_here(exit_patch);
        for patch in ctx.break_patches {
            self.state().buffer.patch_to_here(patch);
        }

        self.state().allocator.free(step_reg);
        self.state().allocator.free(bound);
        // The hint kept the induction register alive through scope frees;
        // now it can finally go.
        self.pop_scope();
        self.state().allocator.clear_residency_hint(induction);
        self.state().allocator.free(induction);
        Ok(())
    }

    /// Load the constant step into a register preferring the induction
    /// variable's typed bank.
    fn load_step(
        &mut self,
        kind: NumericKind,
        step: i64,
        loc: SourceLocation,
    ) -> CgResult<RegisterId> {
        let reg = match self.state().allocator.allocate_typed(kind) {
            Ok(reg) => reg,
            Err(_) => self
                .state()
                .allocator
                .allocate_temp()
                .map_err(|e| CgError::from_alloc(loc, e))?,
        };
        self.load_integer(kind, step, reg.physical(), loc);
        Ok(reg)
    }

    fn load_integer(&mut self, kind: NumericKind, value: i64, target: u8, loc: SourceLocation) {
        let constant = match kind {
            NumericKind::I32 => Constant::I32(value as i32),
            NumericKind::I64 => Constant::I64(value),
            NumericKind::U32 => Constant::U32(value as u32),
            NumericKind::U64 => Constant::U64(value as u64),
            NumericKind::F64 => Constant::F64(value as f64),
            NumericKind::Bool => Constant::Bool(value != 0),
        };
        if let Constant::I32(v) = constant {
            if let Ok(imm) = i16::try_from(v) {
                let bytes = imm.to_be_bytes();
                self.state()
                    .buffer
                    .emit(Opcode::LoadI32, &[target, bytes[0], bytes[1]], loc);
                return;
            }
        }
        self.emit_load_const(constant, target, loc);
    }

    /// Iterator-driven loop shared by `for x in array` and runtime-step
    /// ranges. With `have_iterator` the source register already holds an
    /// iterator this generator owns.
    fn for_iterator(
        &mut self,
        loc: SourceLocation,
        var: &str,
        source: ExprValue,
        have_iterator: bool,
        body: &[NodeId],
    ) -> CgResult<()> {
        let iter = if have_iterator {
            source
        } else {
            let iter = self
                .state()
                .allocator
                .allocate_temp()
                .map_err(|e| CgError::from_alloc(loc, e))?;
            self.state()
                .buffer
                .emit(Opcode::IterBegin, &[iter.physical(), source.phys(), 0], loc);
            self.release(source);
            ExprValue::owned(iter)
        };

        self.push_scope();
        let var_reg = self
            .state()
            .allocator
            .allocate_frame()
            .map_err(|e| CgError::from_alloc(loc, e))?;
        let has_reg = self
            .state()
            .allocator
            .allocate_temp()
            .map_err(|e| CgError::from_alloc(loc, e))?;
        self.bind(Symbol {
            name: var.to_string(),
            slot: SymbolSlot::Legacy(var_reg.physical()),
            mutable: false,
        });

        let loop_start = self.state().buffer.len();
        self.state().buffer.emit(
            Opcode::IterNext,
            &[iter.phys(), var_reg.physical(), has_reg.physical()],
            loc,
        );
        let exit_patch =
            self.state()
                .buffer
                .emit_jump(Opcode::JumpIfNotR, Some(has_reg.physical()), loc);

        self.state().loops.push(LoopContext {
            break_patches: Vec::new(),
            continue_patches: Vec::new(),
            continue_target: Some(loop_start),
        });
        for &stmt in body {
            self.statement(stmt)?;
        }
        self.state().buffer.emit_loop_to(loop_start, loc);
        let ctx = self.state().loops.pop().expect("loop context");
        self.state().buffer.patch_to_here(exit_patch);
        for patch in ctx.break_patches {
            self.state().buffer.patch_to_here(patch);
        }

        self.state().allocator.free(has_reg);
        self.pop_scope();
        self.release(iter);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    fn function_decl(&mut self, id: NodeId, owner: Option<&str>) -> CgResult<()> {
        let loc = self.loc(id);
        let NodeKind::Function {
            name, params, body, ..
        } = self.ast.kind(id).clone()
        else {
            return Err(CgError::new(loc, "not a function node"));
        };
        let qualified = match owner {
            Some(owner) => format!("{}.{}", owner, name),
            None => name,
        };

        // Bind the name before compiling the body so recursive references
        // resolve to the register the function value will land in.
        let target = if self.at_script_top() {
            self.state()
                .allocator
                .allocate_global()
                .map_err(|e| CgError::from_alloc(loc, e))?
        } else {
            self.state()
                .allocator
                .allocate_frame()
                .map_err(|e| CgError::from_alloc(loc, e))?
        };
        self.bind(Symbol {
            name: qualified.clone(),
            slot: SymbolSlot::Legacy(target.physical()),
            mutable: false,
        });

        let mut state = FunctionState::new(&qualified, &self.path);
        state.arity = params.len() as u8;
        self.states.push(state);
        for param in &params {
            // Sequential frame slots; the call convention copies arguments
            // into them in order.
            let reg = self
                .state()
                .allocator
                .allocate_frame()
                .map_err(|e| CgError::from_alloc(param.location, e))?;
            let symbol = Symbol {
                name: param.name.clone(),
                slot: SymbolSlot::Legacy(reg.physical()),
                mutable: false,
            };
            self.state()
                .scopes
                .last_mut()
                .expect("function scope")
                .push(symbol);
        }
        for &stmt in &body {
            self.statement(stmt)?;
        }
        self.state().buffer.emit(Opcode::ReturnNil, &[], loc);

        let mut state = self.states.pop().expect("function state");
        let stats = peephole::run(&mut state.buffer);
        debug!(?stats, function = %state.name, "peephole finished");
        let upvalues = state.upvalues.clone();
        let function = Rc::new(FunctionChunk {
            name: state.name.clone(),
            arity: state.arity,
            upvalue_count: upvalues.len() as u8,
            register_count: state.allocator.frame_high_water(),
            chunk: state.buffer.chunk,
        });

        // Materialize the function value into the pre-bound register.
        let idx = self
            .state()
            .buffer
            .chunk
            .add_constant(Constant::Function(function));
        let idx_bytes = idx.to_be_bytes();
        if upvalues.is_empty() {
            self.state().buffer.emit(
                Opcode::LoadConst,
                &[target.physical(), idx_bytes[0], idx_bytes[1]],
                loc,
            );
        } else {
            let mut operands = vec![
                target.physical(),
                idx_bytes[0],
                idx_bytes[1],
                upvalues.len() as u8,
            ];
            for up in &upvalues {
                operands.push(if up.is_local { 1 } else { 0 });
                operands.push(up.index);
            }
            self.state().buffer.emit(Opcode::MakeClosure, &operands, loc);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expression(&mut self, id: NodeId) -> CgResult<ExprValue> {
        let loc = self.loc(id);
        match self.ast.kind(id).clone() {
            NodeKind::Literal(lit) => self.literal(&lit, loc),
            NodeKind::Identifier(name) => self.identifier(&name, loc),
            NodeKind::Binary { op, lhs, rhs } => self.binary(id, op, lhs, rhs, loc),
            NodeKind::Unary { op, operand } => {
                let value = self.expression(operand)?;
                let target = self.temp(loc)?;
                let opcode = match op {
                    UnaryOp::Negate => Opcode::NegR,
                    UnaryOp::Not => Opcode::NotR,
                };
                self.state()
                    .buffer
                    .emit(opcode, &[target.physical(), value.phys()], loc);
                self.release(value);
                Ok(ExprValue::owned(target))
            }
            NodeKind::Ternary {
                condition,
                then_value,
                else_value,
            } => {
                let target = self.temp(loc)?;
                let cond = self.expression(condition)?;
                let else_patch =
                    self.state()
                        .buffer
                        .emit_jump(Opcode::JumpIfNotR, Some(cond.phys()), loc);
                self.release(cond);
                let then_v = self.expression(then_value)?;
                self.emit_move(target.physical(), then_v.phys(), loc);
                self.release(then_v);
                let end_patch = self.state().buffer.emit_jump(Opcode::Jump, None, loc);
                self.state().buffer.patch_to_here(else_patch);
                let else_v = self.expression(else_value)?;
                self.emit_move(target.physical(), else_v.phys(), loc);
                self.release(else_v);
                self.state().buffer.patch_to_here(end_patch);
                Ok(ExprValue::owned(target))
            }
            NodeKind::Cast { value, .. } => {
                let target_kind = self.node_kind(id);
                let source = self.expression(value)?;
                let target = self.temp(loc)?;
                self.state().buffer.emit(
                    Opcode::CastR,
                    &[target.physical(), source.phys(), target_kind.index() as u8],
                    loc,
                );
                self.release(source);
                Ok(ExprValue::owned(target))
            }
            NodeKind::Call { callee, args } => self.call(callee, &args, loc),
            NodeKind::Index { target, index } => {
                let array = self.expression(target)?;
                let idx = self.expression(index)?;
                let out = self.temp(loc)?;
                self.state().buffer.emit(
                    Opcode::ArrayGet,
                    &[out.physical(), array.phys(), idx.phys()],
                    loc,
                );
                self.release(idx);
                self.release(array);
                Ok(ExprValue::owned(out))
            }
            NodeKind::FieldAccess { target, field } => {
                let object = self.expression(target)?;
                let field_index = self.field_index(target, &field, loc)?;
                let out = self.temp(loc)?;
                self.state().buffer.emit(
                    Opcode::FieldGet,
                    &[out.physical(), object.phys(), field_index],
                    loc,
                );
                self.release(object);
                Ok(ExprValue::owned(out))
            }
            NodeKind::ArrayLiteral(elements) => {
                let slots = self
                    .state()
                    .allocator
                    .allocate_consecutive_temps(elements.len())
                    .map_err(|e| CgError::from_alloc(loc, e))?;
                for (&element, slot) in elements.iter().zip(slots.iter()) {
                    let value = self.expression(element)?;
                    self.emit_move(slot.physical(), value.phys(), loc);
                    self.release(value);
                }
                let out = self.temp(loc)?;
                let start = slots.first().map(|s| s.physical()).unwrap_or(0);
                self.state().buffer.emit(
                    Opcode::MakeArray,
                    &[out.physical(), start, elements.len() as u8],
                    loc,
                );
                for slot in slots {
                    self.state().allocator.free(slot);
                }
                Ok(ExprValue::owned(out))
            }
            NodeKind::Assign { target, value } => self.assign(target, value, loc),
            other => Err(CgError::new(
                loc,
                format!(
                    "unexpected expression node: {:?}",
                    std::mem::discriminant(&other)
                ),
            )),
        }
    }

    fn literal(&mut self, lit: &Literal, loc: SourceLocation) -> CgResult<ExprValue> {
        let target = self.temp(loc)?;
        let phys = target.physical();
        match lit {
            Literal::I32(v) => {
                if let Ok(imm) = i16::try_from(*v) {
                    let bytes = imm.to_be_bytes();
                    self.state()
                        .buffer
                        .emit(Opcode::LoadI32, &[phys, bytes[0], bytes[1]], loc);
                } else {
                    self.emit_load_const(Constant::I32(*v), phys, loc);
                }
            }
            Literal::I64(v) => self.emit_load_const(Constant::I64(*v), phys, loc),
            Literal::U32(v) => self.emit_load_const(Constant::U32(*v), phys, loc),
            Literal::U64(v) => self.emit_load_const(Constant::U64(*v), phys, loc),
            Literal::F64(v) => self.emit_load_const(Constant::F64(*v), phys, loc),
            Literal::Bool(true) => self.state().buffer.emit(Opcode::LoadTrue, &[phys], loc),
            Literal::Bool(false) => self.state().buffer.emit(Opcode::LoadFalse, &[phys], loc),
            Literal::Str(s) => self.emit_load_const(Constant::Str(s.clone()), phys, loc),
            Literal::Nil => self.state().buffer.emit(Opcode::LoadNil, &[phys], loc),
        }
        Ok(ExprValue::owned(target))
    }

    fn emit_load_const(&mut self, constant: Constant, target: u8, loc: SourceLocation) {
        let idx = self.state().buffer.chunk.add_constant(constant);
        let bytes = idx.to_be_bytes();
        self.state()
            .buffer
            .emit(Opcode::LoadConst, &[target, bytes[0], bytes[1]], loc);
    }

    fn identifier(&mut self, name: &str, loc: SourceLocation) -> CgResult<ExprValue> {
        match self.resolve(name) {
            Some(Resolved::Symbol(symbol)) => match &symbol.slot {
                SymbolSlot::Constant(lit) => {
                    let lit = lit.clone();
                    self.literal(&lit, loc)
                }
                _ => {
                    let reg = symbol
                        .register()
                        .expect("non-constant symbol has a register");
                    Ok(ExprValue::borrowed(reg))
                }
            },
            Some(Resolved::Upvalue(index)) => {
                let target = self.temp(loc)?;
                self.state()
                    .buffer
                    .emit(Opcode::GetUpvalue, &[target.physical(), index], loc);
                Ok(ExprValue::owned(target))
            }
            None => Err(CgError::new(
                loc,
                format!("unresolved name `{}` reached the code generator", name),
            )),
        }
    }

    fn binary(
        &mut self,
        id: NodeId,
        op: BinaryOp,
        lhs: NodeId,
        rhs: NodeId,
        loc: SourceLocation,
    ) -> CgResult<ExprValue> {
        // Short-circuit forms: the right operand must not evaluate eagerly.
        if op == BinaryOp::And || op == BinaryOp::Or {
            let target = self.temp(loc)?;
            let lhs_v = self.expression(lhs)?;
            self.emit_move(target.physical(), lhs_v.phys(), loc);
            self.release(lhs_v);
            let skip_patch = if op == BinaryOp::And {
                self.state()
                    .buffer
                    .emit_jump(Opcode::JumpIfNotR, Some(target.physical()), loc)
            } else {
                // `or`: skip the right side when the left is already true.
                let inverted = self.temp(loc)?;
                self.state().buffer.emit(
                    Opcode::NotR,
                    &[inverted.physical(), target.physical()],
                    loc,
                );
                let patch = self.state().buffer.emit_jump(
                    Opcode::JumpIfNotR,
                    Some(inverted.physical()),
                    loc,
                );
                self.state().allocator.free(inverted);
                patch
            };
            let rhs_v = self.expression(rhs)?;
            self.emit_move(target.physical(), rhs_v.phys(), loc);
            self.release(rhs_v);
            self.state().buffer.patch_to_here(skip_patch);
            return Ok(ExprValue::owned(target));
        }

        let lhs_v = self.expression(lhs)?;
        let rhs_v = self.expression(rhs)?;
        let lhs_ty = self.ast.ty(lhs).unwrap_or(Type::Unknown);

        if op == BinaryOp::Add && lhs_ty == Type::Str {
            let target = self.temp(loc)?;
            self.state().buffer.emit(
                Opcode::ConcatR,
                &[target.physical(), lhs_v.phys(), rhs_v.phys()],
                loc,
            );
            self.release(rhs_v);
            self.release(lhs_v);
            return Ok(ExprValue::owned(target));
        }
        if op == BinaryOp::Equal || op == BinaryOp::NotEqual {
            let opcode = if op == BinaryOp::Equal {
                Opcode::EqR
            } else {
                Opcode::NeR
            };
            let target = self.temp(loc)?;
            self.state().buffer.emit(
                opcode,
                &[target.physical(), lhs_v.phys(), rhs_v.phys()],
                loc,
            );
            self.release(rhs_v);
            self.release(lhs_v);
            return Ok(ExprValue::owned(target));
        }
        if op.is_comparison() {
            let kind = self
                .ast
                .ty(lhs)
                .and_then(|t| t.numeric_kind())
                .unwrap_or(NumericKind::I32);
            let target = self.temp(loc)?;
            self.state().buffer.emit(
                compare_opcode(kind, op),
                &[target.physical(), lhs_v.phys(), rhs_v.phys()],
                loc,
            );
            self.release(rhs_v);
            self.release(lhs_v);
            return Ok(ExprValue::owned(target));
        }
        if op.is_bitwise() {
            let opcode = match op {
                BinaryOp::BitAnd => Opcode::AndR,
                BinaryOp::BitOr => Opcode::OrR,
                BinaryOp::BitXor => Opcode::XorR,
                BinaryOp::Shl => Opcode::ShlR,
                BinaryOp::Shr => Opcode::ShrR,
                _ => unreachable!("bitwise op"),
            };
            let target = self.temp(loc)?;
            self.state().buffer.emit(
                opcode,
                &[target.physical(), lhs_v.phys(), rhs_v.phys()],
                loc,
            );
            self.release(rhs_v);
            self.release(lhs_v);
            return Ok(ExprValue::owned(target));
        }

        // Arithmetic: dual-family selection. The typed form only when the
        // destination and both operands agree on one typed bank.
        let kind = self.node_kind(id);
        self.state().allocator.note_arith_op();
        let hot = !self.state().loops.is_empty();
        let target = self
            .state()
            .allocator
            .allocate_smart(kind, hot)
            .map_err(|e| CgError::from_alloc(loc, e))?;
        let all_typed = matches!(
            (target, lhs_v.reg, rhs_v.reg),
            (
                RegisterId::Typed(a, _),
                RegisterId::Typed(b, _),
                RegisterId::Typed(c, _)
            ) if a == b && b == c && a == kind
        );
        let opcode = arith_opcode(kind, op, all_typed);
        self.state().buffer.emit(
            opcode,
            &[target.physical(), lhs_v.phys(), rhs_v.phys()],
            loc,
        );
        self.release(rhs_v);
        self.release(lhs_v);
        Ok(ExprValue::owned(target))
    }

    fn assign(
        &mut self,
        target: NodeId,
        value: NodeId,
        loc: SourceLocation,
    ) -> CgResult<ExprValue> {
        match self.ast.kind(target).clone() {
            NodeKind::Identifier(name) => {
                let value_v = self.expression(value)?;
                match self.resolve(&name) {
                    Some(Resolved::Symbol(symbol)) => {
                        let reg = symbol.register().ok_or_else(|| {
                            CgError::new(loc, format!("cannot assign to constant `{}`", name))
                        })?;
                        self.emit_move(reg.physical(), value_v.phys(), loc);
                        self.release(value_v);
                        Ok(ExprValue::borrowed(reg))
                    }
                    Some(Resolved::Upvalue(index)) => {
                        self.state()
                            .buffer
                            .emit(Opcode::SetUpvalue, &[index, value_v.phys()], loc);
                        Ok(value_v)
                    }
                    None => Err(CgError::new(
                        loc,
                        format!("unresolved name `{}` reached the code generator", name),
                    )),
                }
            }
            NodeKind::Index {
                target: array,
                index,
            } => {
                let array_v = self.expression(array)?;
                let index_v = self.expression(index)?;
                let value_v = self.expression(value)?;
                self.state().buffer.emit(
                    Opcode::ArraySet,
                    &[array_v.phys(), index_v.phys(), value_v.phys()],
                    loc,
                );
                self.release(index_v);
                self.release(array_v);
                Ok(value_v)
            }
            NodeKind::FieldAccess {
                target: object,
                field,
            } => {
                let object_v = self.expression(object)?;
                let field_index = self.field_index(object, &field, loc)?;
                let value_v = self.expression(value)?;
                self.state().buffer.emit(
                    Opcode::FieldSet,
                    &[object_v.phys(), field_index, value_v.phys()],
                    loc,
                );
                self.release(object_v);
                Ok(value_v)
            }
            _ => Err(CgError::new(loc, "invalid assignment target")),
        }
    }

    fn field_index(&self, object: NodeId, field: &str, loc: SourceLocation) -> CgResult<u8> {
        let Some(Type::Struct(sid)) = self.ast.ty(object) else {
            return Err(CgError::new(loc, "field access on a non-struct value"));
        };
        let info = self.context.struct_info(sid);
        info.field_index(field)
            .map(|i| i as u8)
            .ok_or_else(|| CgError::new(loc, format!("unknown field `{}`", field)))
    }

    fn call(&mut self, callee: NodeId, args: &[NodeId], loc: SourceLocation) -> CgResult<ExprValue> {
        // Struct construction: the resolver typed the callee as the struct.
        if let Some(Type::Struct(sid)) = self.ast.ty(callee) {
            return self.construct_struct(sid, args, loc);
        }

        // Array builtins keep their dedicated opcodes; a user function of
        // the same name shadows them (mirroring the resolver).
        if let NodeKind::Identifier(name) = self.ast.kind(callee) {
            let name = name.clone();
            if !self.context.function_ids.contains_key(&name) {
                match (name.as_str(), args.len()) {
                    ("len", 1) => {
                        let array = self.expression(args[0])?;
                        let out = self.temp(loc)?;
                        self.state().buffer.emit(
                            Opcode::ArrayLen,
                            &[out.physical(), array.phys()],
                            loc,
                        );
                        self.release(array);
                        return Ok(ExprValue::owned(out));
                    }
                    ("push", 2) => {
                        let array = self.expression(args[0])?;
                        let value = self.expression(args[1])?;
                        self.state().buffer.emit(
                            Opcode::ArrayPush,
                            &[array.phys(), value.phys()],
                            loc,
                        );
                        self.release(value);
                        self.release(array);
                        let out = self.temp(loc)?;
                        self.state()
                            .buffer
                            .emit(Opcode::LoadNil, &[out.physical()], loc);
                        return Ok(ExprValue::owned(out));
                    }
                    _ => {}
                }
            }
        }

        // Method call sugar inserts the receiver as the first argument.
        let (callee_value, receiver) = match self.ast.kind(callee).clone() {
            NodeKind::FieldAccess { target, .. } => {
                let Some(Type::Function(fid)) = self.ast.ty(callee) else {
                    return Err(CgError::new(loc, "call through a non-function field"));
                };
                let name = self.context.function_info(fid).name.clone();
                let receiver = self.expression(target)?;
                let function = self.identifier(&name, loc)?;
                (function, Some(receiver))
            }
            NodeKind::Identifier(name) => (self.identifier(&name, loc)?, None),
            _ => {
                return Err(CgError::new(
                    loc,
                    "only named functions and struct constructors can be called",
                ))
            }
        };

        // The callee register is clobbered with the result, so it must be a
        // temp this call owns.
        let fr = self.claim(callee_value, loc)?;
        let argc = args.len() + usize::from(receiver.is_some());
        let slots = self
            .state()
            .allocator
            .allocate_consecutive_temps(argc)
            .map_err(|e| CgError::from_alloc(loc, e))?;
        let mut slot_iter = slots.iter();
        if let Some(receiver) = receiver {
            let slot = slot_iter.next().expect("slot for receiver");
            self.emit_move(slot.physical(), receiver.phys(), loc);
            self.release(receiver);
        }
        for (&arg, slot) in args.iter().zip(slot_iter) {
            let value = self.expression(arg)?;
            self.emit_move(slot.physical(), value.phys(), loc);
            self.release(value);
        }
        let first = slots.first().map(|s| s.physical()).unwrap_or(0);
        self.state()
            .buffer
            .emit(Opcode::CallR, &[fr.physical(), first, argc as u8], loc);
        for slot in slots {
            self.state().allocator.free(slot);
        }
        Ok(ExprValue::owned(fr))
    }

    fn construct_struct(
        &mut self,
        sid: u16,
        args: &[NodeId],
        loc: SourceLocation,
    ) -> CgResult<ExprValue> {
        let name = self.context.struct_info(sid).name.clone();
        let slots = self
            .state()
            .allocator
            .allocate_consecutive_temps(args.len())
            .map_err(|e| CgError::from_alloc(loc, e))?;
        for (&arg, slot) in args.iter().zip(slots.iter()) {
            let value = self.expression(arg)?;
            self.emit_move(slot.physical(), value.phys(), loc);
            self.release(value);
        }
        let out = self.temp(loc)?;
        let type_idx = self.state().buffer.chunk.add_constant(Constant::Str(name));
        // Struct instances use the single-variant enum layout; the variant
        // name mirrors the type name.
        let variant_idx = type_idx;
        let start = slots.first().map(|s| s.physical()).unwrap_or(0);
        let operands = [
            out.physical(),
            0,
            args.len() as u8,
            start,
            (type_idx >> 8) as u8,
            type_idx as u8,
            (variant_idx >> 8) as u8,
            variant_idx as u8,
        ];
        self.state().buffer.emit(Opcode::EnumNew, &operands, loc);
        for slot in slots {
            self.state().allocator.free(slot);
        }
        Ok(ExprValue::owned(out))
    }

    // ------------------------------------------------------------------
    // Small emit helpers
    // ------------------------------------------------------------------

    fn temp(&mut self, loc: SourceLocation) -> CgResult<RegisterId> {
        self.state()
            .allocator
            .allocate_temp()
            .map_err(|e| CgError::from_alloc(loc, e))
    }

    fn emit_move(&mut self, target: u8, source: u8, loc: SourceLocation) {
        if target != source {
            self.state().buffer.emit(Opcode::Move, &[target, source], loc);
        }
    }

    /// Ensure the value sits in a register this expression owns.
    fn claim(&mut self, value: ExprValue, loc: SourceLocation) -> CgResult<RegisterId> {
        if value.owned {
            return Ok(value.reg);
        }
        let target = self.temp(loc)?;
        self.emit_move(target.physical(), value.phys(), loc);
        Ok(target)
    }

    fn release(&mut self, value: ExprValue) {
        if value.owned {
            self.state().allocator.free(value.reg);
        }
    }
}

fn literal_as_i64(lit: &Literal) -> Option<i64> {
    match lit {
        Literal::I32(v) => Some(*v as i64),
        Literal::I64(v) => Some(*v),
        Literal::U32(v) => Some(*v as i64),
        Literal::U64(v) => i64::try_from(*v).ok(),
        _ => None,
    }
}

/// Arithmetic opcode for one numeric kind, typed or standard family.
fn arith_opcode(kind: NumericKind, op: BinaryOp, typed: bool) -> Opcode {
    let base = match (kind, typed) {
        (NumericKind::I32, false) => Opcode::AddI32R,
        (NumericKind::I64, false) => Opcode::AddI64R,
        (NumericKind::U32, false) => Opcode::AddU32R,
        (NumericKind::U64, false) => Opcode::AddU64R,
        (NumericKind::F64, false) | (NumericKind::Bool, false) => Opcode::AddF64R,
        (NumericKind::I32, true) => Opcode::AddI32Typed,
        (NumericKind::I64, true) => Opcode::AddI64Typed,
        (NumericKind::U32, true) => Opcode::AddU32Typed,
        (NumericKind::U64, true) => Opcode::AddU64Typed,
        (NumericKind::F64, true) | (NumericKind::Bool, true) => Opcode::AddF64Typed,
    };
    let offset = match op {
        BinaryOp::Add => 0,
        BinaryOp::Sub => 1,
        BinaryOp::Mul => 2,
        BinaryOp::Div => 3,
        BinaryOp::Mod => 4,
        _ => 0,
    };
    Opcode::from_u8(base as u8 + offset).expect("arith families are contiguous")
}

/// Ordered-comparison opcode for one numeric kind.
fn compare_opcode(kind: NumericKind, op: BinaryOp) -> Opcode {
    let base = match kind {
        NumericKind::I32 => Opcode::LtI32R,
        NumericKind::I64 => Opcode::LtI64R,
        NumericKind::U32 => Opcode::LtU32R,
        NumericKind::U64 => Opcode::LtU64R,
        NumericKind::F64 | NumericKind::Bool => Opcode::LtF64R,
    };
    let offset = match op {
        BinaryOp::Less => 0,
        BinaryOp::LessEqual => 1,
        BinaryOp::Greater => 2,
        BinaryOp::GreaterEqual => 3,
        _ => 0,
    };
    Opcode::from_u8(base as u8 + offset).expect("comparison families are contiguous")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer;
    use crate::parser::parse;
    use crate::types::resolve;

    fn compile(source: &str) -> Rc<FunctionChunk> {
        let mut outcome = parse(source);
        assert!(outcome.diagnostics.is_empty(), "{:?}", outcome.diagnostics);
        let context = resolve(&mut outcome.ast).expect("type resolution");
        optimizer::optimize(&mut outcome.ast);
        generate(&outcome.ast, &context, "test.orus").expect("codegen")
    }

    fn opcodes(chunk: &Chunk) -> Vec<Opcode> {
        chunk
            .instruction_offsets()
            .into_iter()
            .filter_map(|off| Opcode::from_u8(chunk.code[off]))
            .collect()
    }

    #[test]
    fn test_folded_constant_compiles_to_single_load() {
        let script = compile("print(1 + 2 * 3)");
        let ops = opcodes(&script.chunk);
        assert_eq!(ops, vec![Opcode::LoadI32, Opcode::PrintR, Opcode::Halt]);
        // The load carries the folded value 7 as its immediate.
        let code = &script.chunk.code;
        assert_eq!(i16::from_be_bytes([code[2], code[3]]), 7);
    }

    #[test]
    fn test_runtime_arithmetic_uses_standard_family() {
        let script = compile("mut x = 10\nx = x + 5\nprint(x)");
        let ops = opcodes(&script.chunk);
        assert!(ops.contains(&Opcode::AddI32R));
    }

    #[test]
    fn test_for_loop_shape() {
        let script = compile("mut sum = 0\nfor i in 0..5 { sum = sum + i }\nprint(sum)");
        let ops = opcodes(&script.chunk);
        assert!(ops.contains(&Opcode::LtI32R));
        assert!(ops.contains(&Opcode::JumpIfNotR));
        assert!(ops.iter().any(|op| matches!(op, Opcode::Loop | Opcode::LoopShort)));
    }

    #[test]
    fn test_overflow_not_folded_into_literal() {
        let script = compile("print(2147483647 + 1)");
        let ops = opcodes(&script.chunk);
        // The refused fold leaves a runtime add behind.
        assert!(ops.contains(&Opcode::AddI32R));
        assert!(ops.contains(&Opcode::LoadConst));
    }

    #[test]
    fn test_try_catch_emits_try_frame_ops() {
        let script = compile("try { let x = 1 } catch e { print(e) }");
        let ops = opcodes(&script.chunk);
        assert!(ops.contains(&Opcode::TryBegin));
        assert!(ops.contains(&Opcode::TryEnd));
    }

    #[test]
    fn test_function_call_convention() {
        let script = compile("fn add(a: i32, b: i32) -> i32 { return a + b }\nprint(add(1, 2))");
        let ops = opcodes(&script.chunk);
        assert!(ops.contains(&Opcode::CallR));
        // The function value is loaded from the pool.
        assert!(ops.contains(&Opcode::LoadConst));
        let func = script
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) => Some(f.clone()),
                _ => None,
            })
            .expect("function constant");
        assert_eq!(func.arity, 2);
        assert!(opcodes(&func.chunk).contains(&Opcode::ReturnR));
    }

    #[test]
    fn test_nested_function_captures_upvalue() {
        let script = compile(
            "fn outer() -> i32 {\n    let hidden = 41\n    fn inner() -> i32 { return hidden + 1 }\n    return inner()\n}\nprint(outer())",
        );
        let outer = script
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) if f.name == "outer" => Some(f.clone()),
                _ => None,
            })
            .expect("outer function");
        let inner = outer
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) if f.name == "inner" => Some(f.clone()),
                _ => None,
            })
            .expect("inner function");
        assert_eq!(inner.upvalue_count, 1);
        assert!(opcodes(&outer.chunk).contains(&Opcode::MakeClosure));
        assert!(opcodes(&inner.chunk).contains(&Opcode::GetUpvalue));
    }

    #[test]
    fn test_struct_lowering_uses_enum_layout() {
        let script =
            compile("struct Point { x: i32, y: i32 }\nlet p = Point(1, 2)\nprint(p.x)");
        let ops = opcodes(&script.chunk);
        assert!(ops.contains(&Opcode::EnumNew));
        assert!(ops.contains(&Opcode::FieldGet));
    }

    #[test]
    fn test_array_builtins() {
        let script = compile("let a = [1, 2, 3]\nprint(len(a))");
        let ops = opcodes(&script.chunk);
        assert!(ops.contains(&Opcode::MakeArray));
        assert!(ops.contains(&Opcode::ArrayLen));
    }

    #[test]
    fn test_string_concat_opcode() {
        let script = compile("print(\"a\" + \"b\")");
        // Folded by the optimizer into one constant; force runtime concat
        // through variables instead.
        let script2 = compile("let a = \"x\"\nlet b = \"y\"\nprint(a + b)");
        assert!(opcodes(&script2.chunk).contains(&Opcode::ConcatR));
        // Folded version loads a single constant.
        assert!(opcodes(&script.chunk).contains(&Opcode::LoadConst));
    }

    #[test]
    fn test_static_uses_module_register() {
        let script = compile("static mut counter = 0\nprint(counter)");
        let code = &script.chunk.code;
        // The print argument register sits in the module region (240..).
        let print_off = script
            .chunk
            .instruction_offsets()
            .into_iter()
            .find(|&off| code[off] == Opcode::PrintR as u8)
            .expect("print emitted");
        assert!(code[print_off + 1] >= 240);
    }

    #[test]
    fn test_constant_pool_dedup_across_statements() {
        let script = compile("let a = 100000\nlet b = 100000\nprint(a + b)");
        let big_count = script
            .chunk
            .constants
            .iter()
            .filter(|c| matches!(c, Constant::I32(100000)))
            .count();
        assert_eq!(big_count, 1);
    }
}
