//! The virtual machine: host API, call/try frames, upvalues, and the GC
//! driver. The dispatch loop itself lives in [`dispatch`].

pub mod dispatch;
pub mod heap;
pub mod register_file;
pub mod value;

use crate::bytecode::FunctionChunk;
use crate::codegen;
use crate::error::{Diagnostic, RuntimeError, SourceLocation};
use crate::optimizer;
use crate::parser;
use crate::types;
use heap::Heap;
use register_file::RegisterFile;
use std::collections::HashSet;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, info_span};
use value::{Object, ObjRef, UpvalueObj, Value};

/// Result of `interpret`.
#[derive(Debug)]
pub enum InterpretOutcome {
    Ok,
    CompileError(Vec<Diagnostic>),
    RuntimeError(RuntimeError),
}

impl InterpretOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, InterpretOutcome::Ok)
    }
}

/// One function activation.
pub(crate) struct CallFrameInfo {
    pub function: Rc<FunctionChunk>,
    pub ip: usize,
    /// Caller register that receives the return value.
    pub return_register: u8,
    /// Set when the activation runs a closure; upvalue opcodes resolve
    /// through it.
    pub closure: Option<ObjRef>,
}

/// One active `try` region.
pub(crate) struct TryFrame {
    pub catch_ip: usize,
    pub catch_reg: u8,
    /// Call depth at TRY_BEGIN; unwinding pops back to it.
    pub frame_depth: usize,
}

pub struct Vm {
    pub(crate) registers: RegisterFile,
    pub(crate) heap: Heap,
    pub(crate) frames: Vec<CallFrameInfo>,
    pub(crate) try_frames: Vec<TryFrame>,
    /// Open upvalues, sorted by descending (frame, register) address.
    pub(crate) open_upvalues: Vec<ObjRef>,
    pub(crate) last_error: Option<ObjRef>,
    /// Canonical paths of modules already interpreted.
    modules: HashSet<PathBuf>,
    pub(crate) trace: bool,
    dev_mode: bool,
    /// When set, `print` appends here instead of stdout.
    capture: Option<String>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Construct the register file, heap, and bookkeeping tables.
    pub fn new() -> Self {
        Self {
            registers: RegisterFile::new(),
            heap: Heap::new(),
            frames: Vec::new(),
            try_frames: Vec::new(),
            open_upvalues: Vec::new(),
            last_error: None,
            modules: HashSet::new(),
            trace: false,
            dev_mode: false,
            capture: None,
        }
    }

    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    pub fn set_dev_mode(&mut self, dev_mode: bool) {
        self.dev_mode = dev_mode;
    }

    pub fn dev_mode(&self) -> bool {
        self.dev_mode
    }

    /// Message of the last runtime error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.map(|r| match self.heap.get(r) {
            Object::Error(e) => e.message.clone(),
            other => other.kind_name().to_string(),
        })
    }

    pub fn clear_last_error(&mut self) {
        self.last_error = None;
    }

    /// Route `print` into an internal buffer (used by tests and the REPL).
    pub fn capture_output(&mut self) {
        self.capture = Some(String::new());
    }

    /// Take everything printed since the last call.
    pub fn take_output(&mut self) -> String {
        match self.capture.as_mut() {
            Some(buffer) => std::mem::take(buffer),
            None => String::new(),
        }
    }

    pub(crate) fn emit_output(&mut self, text: &str) {
        match self.capture.as_mut() {
            Some(buffer) => {
                buffer.push_str(text);
                buffer.push('\n');
            }
            None => println!("{}", text),
        }
    }

    // ------------------------------------------------------------------
    // Compile + execute
    // ------------------------------------------------------------------

    /// Compile a source string to a script function without running it.
    pub fn compile(source: &str, path: &str) -> Result<Rc<FunctionChunk>, Vec<Diagnostic>> {
        let span = info_span!("compile", path);
        let _guard = span.enter();

        let outcome = parser::parse(source);
        if !outcome.diagnostics.is_empty() {
            return Err(outcome.diagnostics);
        }
        let mut ast = outcome.ast;
        let context = types::resolve(&mut ast)?;
        let stats = optimizer::optimize(&mut ast);
        debug!(?stats, "optimizer finished");
        codegen::generate(&ast, &context, path)
    }

    /// Compile and execute `source`.
    pub fn interpret(&mut self, source: &str, path: &str) -> InterpretOutcome {
        let script = match Self::compile(source, path) {
            Ok(script) => script,
            Err(diagnostics) => return InterpretOutcome::CompileError(diagnostics),
        };
        self.execute(script)
    }

    /// Interpret a module file, recording it in the loaded-modules registry.
    /// A second call with the same path is a no-op returning Ok.
    pub fn interpret_module(&mut self, path: &str) -> InterpretOutcome {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| PathBuf::from(path));
        if self.modules.contains(&canonical) {
            return InterpretOutcome::Ok;
        }
        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(err) => {
                return InterpretOutcome::RuntimeError(RuntimeError::with_message(
                    crate::error::RuntimeErrorKind::Io,
                    SourceLocation::default(),
                    format!("cannot read module `{}`: {}", path, err),
                ))
            }
        };
        let outcome = self.interpret(&source, path);
        if outcome.is_ok() {
            self.modules.insert(canonical);
        }
        outcome
    }

    pub fn is_module_loaded(&self, path: &str) -> bool {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| PathBuf::from(path));
        self.modules.contains(&canonical)
    }

    /// Run a compiled script chunk on this VM.
    pub fn execute(&mut self, script: Rc<FunctionChunk>) -> InterpretOutcome {
        self.frames.clear();
        self.try_frames.clear();
        self.open_upvalues.clear();
        // A runtime error that escaped mid-call leaves frames behind; the
        // next run starts from the base window again.
        while self.registers.frame_depth() > 1 {
            self.registers.deallocate_frame();
        }
        self.frames.push(CallFrameInfo {
            function: script,
            ip: 0,
            return_register: 0,
            closure: None,
        });
        match self.run() {
            Ok(()) => InterpretOutcome::Ok,
            Err(err) => InterpretOutcome::RuntimeError(err),
        }
    }

    /// Release everything the VM owns: sweep all objects, drop the register
    /// file contents.
    pub fn free(&mut self) {
        self.frames.clear();
        self.try_frames.clear();
        self.open_upvalues.clear();
        self.last_error = None;
        self.heap.clear();
    }

    // ------------------------------------------------------------------
    // Heap plumbing
    // ------------------------------------------------------------------

    /// Allocate an object, first collecting if the heap crossed its
    /// threshold. Values reachable only from Rust locals must already be
    /// rooted (registers, open upvalues) before calling this.
    pub(crate) fn alloc(&mut self, object: Object) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(object)
    }

    pub fn pause_gc(&mut self) {
        self.heap.pause_gc();
    }

    pub fn resume_gc(&mut self) {
        self.heap.resume_gc();
    }

    /// Mark from every root, then sweep.
    pub fn collect_garbage(&mut self) {
        let span = info_span!("gc");
        let _guard = span.enter();

        self.registers.reconcile_all();
        let Self {
            registers,
            heap,
            open_upvalues,
            last_error,
            ..
        } = self;
        for value in registers.iter_roots() {
            heap.mark_value(value);
        }
        for upvalue in open_upvalues.iter() {
            heap.mark_object(*upvalue);
        }
        if let Some(err) = last_error {
            heap.mark_object(*err);
        }
        self.heap.sweep();
    }

    // ------------------------------------------------------------------
    // Upvalues
    // ------------------------------------------------------------------

    /// Find or create an open upvalue for a frame register. The open list
    /// stays sorted by descending (frame, register).
    pub(crate) fn capture_upvalue(&mut self, frame: usize, register: u8) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &r) in self.open_upvalues.iter().enumerate() {
            if let Object::Upvalue(UpvalueObj::Open {
                frame: f,
                register: reg,
            }) = self.heap.get(r)
            {
                if (*f, *reg) == (frame, register) {
                    return r;
                }
                if (*f, *reg) < (frame, register) {
                    insert_at = i;
                    break;
                }
            }
        }
        let upvalue = self
            .heap
            .alloc(Object::Upvalue(UpvalueObj::Open { frame, register }));
        self.open_upvalues.insert(insert_at, upvalue);
        upvalue
    }

    /// Close every open upvalue of `frame` at or above `min_register`:
    /// the live value moves from the frame slot into the upvalue's owned
    /// storage in one step.
    pub(crate) fn close_upvalues(&mut self, frame: usize, min_register: u8) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let r = self.open_upvalues[i];
            let close = match self.heap.get(r) {
                Object::Upvalue(UpvalueObj::Open {
                    frame: f,
                    register: reg,
                }) => *f == frame && *reg >= min_register,
                _ => false,
            };
            if close {
                let Object::Upvalue(UpvalueObj::Open { register, .. }) = self.heap.get(r) else {
                    unreachable!("checked above");
                };
                let value = self.registers.read_frame_register(frame, *register);
                *self.heap.get_mut(r) = Object::Upvalue(UpvalueObj::Closed(value));
                self.open_upvalues.remove(i);
            } else {
                i += 1;
            }
        }
    }

    // ------------------------------------------------------------------
    // Value formatting (print, error payloads)
    // ------------------------------------------------------------------

    pub fn format_value(&self, value: Value) -> String {
        match value {
            Value::Bool(b) => b.to_string(),
            Value::I32(v) => v.to_string(),
            Value::I64(v) => v.to_string(),
            Value::U32(v) => v.to_string(),
            Value::U64(v) => v.to_string(),
            Value::F64(v) => v.to_string(),
            Value::Nil => "nil".to_string(),
            Value::Str(r) => match self.heap.get(r) {
                Object::Str(s) => s.text.clone(),
                _ => "<string>".to_string(),
            },
            Value::Array(r) => match self.heap.get(r) {
                Object::Array(a) => {
                    let parts: Vec<String> =
                        a.elements.iter().map(|v| self.format_value(*v)).collect();
                    format!("[{}]", parts.join(", "))
                }
                _ => "<array>".to_string(),
            },
            Value::Bytes(r) => match self.heap.get(r) {
                Object::Bytes(b) => format!("<bytes {}>", b.len()),
                _ => "<bytes>".to_string(),
            },
            Value::Enum(r) => match self.heap.get(r) {
                Object::Enum(e) => {
                    let payload: Vec<String> =
                        e.payload.iter().map(|v| self.format_value(*v)).collect();
                    if e.variant_name == e.type_name {
                        // Struct instance.
                        format!("{}({})", e.type_name, payload.join(", "))
                    } else if payload.is_empty() {
                        format!("{}.{}", e.type_name, e.variant_name)
                    } else {
                        format!("{}.{}({})", e.type_name, e.variant_name, payload.join(", "))
                    }
                }
                _ => "<enum>".to_string(),
            },
            Value::Error(r) => match self.heap.get(r) {
                Object::Error(e) => format!("Error: {}", e.message),
                _ => "Error".to_string(),
            },
            Value::RangeIter(_) => "<range_iter>".to_string(),
            Value::ArrayIter(_) => "<array_iter>".to_string(),
            Value::File(r) => match self.heap.get(r) {
                Object::File(f) => format!("<file {}>", f.path),
                _ => "<file>".to_string(),
            },
            Value::Function(r) | Value::Closure(r) => match self.heap.get(r) {
                Object::Function(f) => format!("<fn {}>", f.function.name),
                Object::Closure(c) => format!("<fn {}>", c.function.name),
                _ => "<fn>".to_string(),
            },
        }
    }

    /// Structural equality as used by the `eq`/`ne` opcodes.
    pub(crate) fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::I32(x), Value::I32(y)) => x == y,
            (Value::I64(x), Value::I64(y)) => x == y,
            (Value::U32(x), Value::U32(y)) => x == y,
            (Value::U64(x), Value::U64(y)) => x == y,
            (Value::F64(x), Value::F64(y)) => x == y,
            (Value::Nil, Value::Nil) => true,
            (Value::Str(x), Value::Str(y)) => {
                if x == y {
                    return true;
                }
                match (self.heap.get(x), self.heap.get(y)) {
                    (Object::Str(a), Object::Str(b)) => a.hash == b.hash && a.text == b.text,
                    _ => false,
                }
            }
            (Value::Array(x), Value::Array(y)) => {
                if x == y {
                    return true;
                }
                match (self.heap.get(x), self.heap.get(y)) {
                    (Object::Array(a), Object::Array(b)) => {
                        a.elements.len() == b.elements.len()
                            && a.elements
                                .iter()
                                .zip(b.elements.iter())
                                .all(|(u, v)| self.values_equal(*u, *v))
                    }
                    _ => false,
                }
            }
            (Value::Enum(x), Value::Enum(y)) => {
                if x == y {
                    return true;
                }
                match (self.heap.get(x), self.heap.get(y)) {
                    (Object::Enum(a), Object::Enum(b)) => {
                        a.type_name == b.type_name
                            && a.variant_index == b.variant_index
                            && a.payload.len() == b.payload.len()
                            && a.payload
                                .iter()
                                .zip(b.payload.iter())
                                .all(|(u, v)| self.values_equal(*u, *v))
                    }
                    _ => false,
                }
            }
            (a, b) => a.obj_ref().is_some() && a.obj_ref() == b.obj_ref(),
        }
    }

    /// Intern a runtime string.
    pub(crate) fn alloc_string(&mut self, text: String) -> Value {
        let r = self.alloc(Object::Str(value::StrObj::new(text)));
        Value::Str(r)
    }

    #[doc(hidden)]
    pub fn heap_stats(&self) -> (usize, usize) {
        (self.heap.live_objects(), self.heap.bytes_allocated())
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpret_smoke() {
        let mut vm = Vm::new();
        vm.capture_output();
        let outcome = vm.interpret("print(1 + 2 * 3)", "test.orus");
        assert!(outcome.is_ok(), "outcome: {:?}", outcome);
        assert_eq!(vm.take_output(), "7\n");
    }

    #[test]
    fn test_compile_error_blocks_execution() {
        let mut vm = Vm::new();
        let outcome = vm.interpret("let = 5", "test.orus");
        assert!(matches!(outcome, InterpretOutcome::CompileError(_)));
    }

    #[test]
    fn test_last_error_roundtrip() {
        let mut vm = Vm::new();
        vm.capture_output();
        let outcome = vm.interpret("let a = 10\nlet b = 0\nprint(a / b)", "test.orus");
        assert!(matches!(outcome, InterpretOutcome::RuntimeError(_)));
        assert!(vm.last_error().unwrap().contains("division by zero"));
        vm.clear_last_error();
        assert!(vm.last_error().is_none());
    }

    #[test]
    fn test_vm_reusable_across_interprets() {
        let mut vm = Vm::new();
        vm.capture_output();
        assert!(vm.interpret("mut counter = 1", "repl").is_ok());
        // The same register file and heap serve the next unit; REPL mode
        // leans on this.
        assert!(vm.interpret("print(40 + 2)", "repl").is_ok());
        assert_eq!(vm.take_output(), "42\n");
    }

    #[test]
    fn test_gc_collects_unreachable_strings() {
        let mut vm = Vm::new();
        vm.capture_output();
        let outcome = vm.interpret(
            "mut s = \"a\"\nfor i in 0..50 { s = s + \"b\" }\nprint(s == s)",
            "test.orus",
        );
        assert!(outcome.is_ok(), "outcome: {:?}", outcome);
        let live_before = vm.heap_stats().0;
        vm.collect_garbage();
        let live_after = vm.heap_stats().0;
        // Intermediate concatenations are unreachable.
        assert!(live_after <= live_before);
    }

    #[test]
    fn test_pause_gc_brackets() {
        let mut vm = Vm::new();
        vm.pause_gc();
        vm.resume_gc();
    }
}
