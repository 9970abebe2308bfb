//! The dispatch loop.
//!
//! A tight match over the current opcode. Each handler reads its operands,
//! performs the operation, and either lets the loop advance the instruction
//! pointer or installs a new one (branches, calls, unwinding). Typed
//! arithmetic runs against the unboxed register window and marks the dirty
//! bitmap through the register-file accessors; standard arithmetic takes the
//! boxed path and retags the destination.
//!
//! Runtime failures go through `raise`: the error object lands in
//! `vm.last_error`, and control transfers to the nearest try frame's catch
//! register, or out of `run` as a `RuntimeError` when no handler is active.

use super::register_file::FRAME_REG_START;
use super::value::{
    ArrayIterObj, ArrayObj, ClosureObj, EnumObj, ErrorObj, FunctionObj, Object, RangeIterObj,
    UpvalueObj, Value,
};
use super::{CallFrameInfo, TryFrame, Vm};
use crate::bytecode::{disassemble_at, instruction_size, Constant, Opcode};
use crate::error::{RuntimeError, RuntimeErrorKind, SourceLocation};
use crate::optimizer::{checked_i32, checked_i64, checked_u32, checked_u64, ArithStatus};
use crate::parser::BinaryOp;
use crate::types::NumericKind;
use tracing::trace;

/// Standard-family integer arithmetic: boxed reads, tag check, checked op,
/// retagging write. Evaluates to `Some(error_kind)` on failure.
macro_rules! std_int_arith {
    ($vm:expr, $rd:expr, $ra:expr, $rb:expr, $variant:path, $checked:path, $op:expr) => {{
        let va = $vm.registers.read($ra as u16);
        let vb = $vm.registers.read($rb as u16);
        match (va, vb) {
            ($variant(x), $variant(y)) => match $checked(x, $op, y) {
                (Some(v), ArithStatus::Success) => {
                    $vm.registers.write($rd as u16, $variant(v));
                    None
                }
                (_, ArithStatus::DivByZero) => Some(RuntimeErrorKind::DivisionByZero),
                _ => Some(RuntimeErrorKind::IntegerOverflow),
            },
            _ => Some(RuntimeErrorKind::TypeGuard),
        }
    }};
}

/// Typed-family integer arithmetic: unboxed reads and writes against the
/// typed window; only the arithmetic itself is still checked.
macro_rules! typed_int_arith {
    ($vm:expr, $rd:expr, $ra:expr, $rb:expr, $read:ident, $write:ident, $checked:path, $op:expr) => {{
        match ($vm.registers.$read($ra), $vm.registers.$read($rb)) {
            (Ok(x), Ok(y)) => match $checked(x, $op, y) {
                (Some(v), ArithStatus::Success) => {
                    $vm.registers.$write($rd, v);
                    None
                }
                (_, ArithStatus::DivByZero) => Some(RuntimeErrorKind::DivisionByZero),
                _ => Some(RuntimeErrorKind::IntegerOverflow),
            },
            _ => Some(RuntimeErrorKind::TypeGuard),
        }
    }};
}

/// Ordered comparison over one numeric kind; writes bool into `rd`.
macro_rules! std_compare {
    ($vm:expr, $rd:expr, $ra:expr, $rb:expr, $variant:path, $cmp:expr) => {{
        let va = $vm.registers.read($ra as u16);
        let vb = $vm.registers.read($rb as u16);
        match (va, vb) {
            ($variant(x), $variant(y)) => {
                let cmp: fn(&_, &_) -> bool = $cmp;
                $vm.registers.write($rd as u16, Value::Bool(cmp(&x, &y)));
                None
            }
            _ => Some(RuntimeErrorKind::TypeGuard),
        }
    }};
}

/// Bitwise op over matching integer operands, preserving the operand type.
macro_rules! std_bitwise {
    ($vm:expr, $rd:expr, $ra:expr, $rb:expr, $op:tt) => {{
        let va = $vm.registers.read($ra as u16);
        let vb = $vm.registers.read($rb as u16);
        match (va, vb) {
            (Value::I32(x), Value::I32(y)) => {
                $vm.registers.write($rd as u16, Value::I32(x $op y));
                None
            }
            (Value::I64(x), Value::I64(y)) => {
                $vm.registers.write($rd as u16, Value::I64(x $op y));
                None
            }
            (Value::U32(x), Value::U32(y)) => {
                $vm.registers.write($rd as u16, Value::U32(x $op y));
                None
            }
            (Value::U64(x), Value::U64(y)) => {
                $vm.registers.write($rd as u16, Value::U64(x $op y));
                None
            }
            _ => Some(RuntimeErrorKind::TypeGuard),
        }
    }};
}

impl Vm {
    /// Execute until the script completes or an unhandled error escapes.
    pub(crate) fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let frame = self.frames.last().expect("run with no frame");
            let function = frame.function.clone();
            let chunk = &function.chunk;
            let ip = frame.ip;

            if ip >= chunk.code.len() {
                // Fell off the end: implicit return.
                if self.frames.len() == 1 {
                    return Ok(());
                }
                self.do_return(Value::Nil);
                continue;
            }

            let loc = SourceLocation::new(chunk.line_at(ip), chunk.column_at(ip));
            let Some(op) = Opcode::from_u8(chunk.code[ip]) else {
                return Err(RuntimeError::with_message(
                    RuntimeErrorKind::TypeGuard,
                    loc,
                    format!("invalid opcode 0x{:02x}", chunk.code[ip]),
                ));
            };
            if self.trace {
                trace!(target: "orus::vm", "{}", disassemble_at(chunk, ip));
            }

            let size = instruction_size(&chunk.code, ip);
            let next_ip = ip + size;
            self.frames.last_mut().expect("frame").ip = next_ip;

            let a = chunk.code.get(ip + 1).copied().unwrap_or(0);
            let b = chunk.code.get(ip + 2).copied().unwrap_or(0);
            let c = chunk.code.get(ip + 3).copied().unwrap_or(0);

            let failure: Option<RuntimeErrorKind> = match op {
                Opcode::Nop => None,
                Opcode::Halt => return Ok(()),

                // ----------------------------------------------------------
                // Loads and moves
                // ----------------------------------------------------------
                Opcode::LoadConst => {
                    let idx = u16::from_be_bytes([b, c]);
                    match chunk.constants.get(idx as usize) {
                        Some(Constant::I32(v)) => {
                            self.registers.write(a as u16, Value::I32(*v));
                            None
                        }
                        Some(Constant::I64(v)) => {
                            self.registers.write(a as u16, Value::I64(*v));
                            None
                        }
                        Some(Constant::U32(v)) => {
                            self.registers.write(a as u16, Value::U32(*v));
                            None
                        }
                        Some(Constant::U64(v)) => {
                            self.registers.write(a as u16, Value::U64(*v));
                            None
                        }
                        Some(Constant::F64(v)) => {
                            self.registers.write(a as u16, Value::F64(*v));
                            None
                        }
                        Some(Constant::Bool(v)) => {
                            self.registers.write(a as u16, Value::Bool(*v));
                            None
                        }
                        Some(Constant::Str(s)) => {
                            let value = self.alloc_string(s.clone());
                            self.registers.write(a as u16, value);
                            None
                        }
                        Some(Constant::Function(f)) => {
                            let function = f.clone();
                            let r = self.alloc(Object::Function(FunctionObj { function }));
                            self.registers.write(a as u16, Value::Function(r));
                            None
                        }
                        None => Some(RuntimeErrorKind::TypeGuard),
                    }
                }
                Opcode::LoadI32 => {
                    let value = i16::from_be_bytes([b, c]) as i32;
                    self.registers.write(a as u16, Value::I32(value));
                    None
                }
                Opcode::LoadTrue => {
                    self.registers.write(a as u16, Value::Bool(true));
                    None
                }
                Opcode::LoadFalse => {
                    self.registers.write(a as u16, Value::Bool(false));
                    None
                }
                Opcode::LoadNil => {
                    self.registers.write(a as u16, Value::Nil);
                    None
                }
                Opcode::Move => {
                    let value = self.registers.read(b as u16);
                    self.registers.write(a as u16, value);
                    None
                }

                // ----------------------------------------------------------
                // Standard arithmetic
                // ----------------------------------------------------------
                Opcode::AddI32R => {
                    std_int_arith!(self, a, b, c, Value::I32, checked_i32, BinaryOp::Add)
                }
                Opcode::SubI32R => {
                    std_int_arith!(self, a, b, c, Value::I32, checked_i32, BinaryOp::Sub)
                }
                Opcode::MulI32R => {
                    std_int_arith!(self, a, b, c, Value::I32, checked_i32, BinaryOp::Mul)
                }
                Opcode::DivI32R => {
                    std_int_arith!(self, a, b, c, Value::I32, checked_i32, BinaryOp::Div)
                }
                Opcode::ModI32R => {
                    std_int_arith!(self, a, b, c, Value::I32, checked_i32, BinaryOp::Mod)
                }
                Opcode::AddI64R => {
                    std_int_arith!(self, a, b, c, Value::I64, checked_i64, BinaryOp::Add)
                }
                Opcode::SubI64R => {
                    std_int_arith!(self, a, b, c, Value::I64, checked_i64, BinaryOp::Sub)
                }
                Opcode::MulI64R => {
                    std_int_arith!(self, a, b, c, Value::I64, checked_i64, BinaryOp::Mul)
                }
                Opcode::DivI64R => {
                    std_int_arith!(self, a, b, c, Value::I64, checked_i64, BinaryOp::Div)
                }
                Opcode::ModI64R => {
                    std_int_arith!(self, a, b, c, Value::I64, checked_i64, BinaryOp::Mod)
                }
                Opcode::AddU32R => {
                    std_int_arith!(self, a, b, c, Value::U32, checked_u32, BinaryOp::Add)
                }
                Opcode::SubU32R => {
                    std_int_arith!(self, a, b, c, Value::U32, checked_u32, BinaryOp::Sub)
                }
                Opcode::MulU32R => {
                    std_int_arith!(self, a, b, c, Value::U32, checked_u32, BinaryOp::Mul)
                }
                Opcode::DivU32R => {
                    std_int_arith!(self, a, b, c, Value::U32, checked_u32, BinaryOp::Div)
                }
                Opcode::ModU32R => {
                    std_int_arith!(self, a, b, c, Value::U32, checked_u32, BinaryOp::Mod)
                }
                Opcode::AddU64R => {
                    std_int_arith!(self, a, b, c, Value::U64, checked_u64, BinaryOp::Add)
                }
                Opcode::SubU64R => {
                    std_int_arith!(self, a, b, c, Value::U64, checked_u64, BinaryOp::Sub)
                }
                Opcode::MulU64R => {
                    std_int_arith!(self, a, b, c, Value::U64, checked_u64, BinaryOp::Mul)
                }
                Opcode::DivU64R => {
                    std_int_arith!(self, a, b, c, Value::U64, checked_u64, BinaryOp::Div)
                }
                Opcode::ModU64R => {
                    std_int_arith!(self, a, b, c, Value::U64, checked_u64, BinaryOp::Mod)
                }
                Opcode::AddF64R => self.std_f64_arith(a, b, c, BinaryOp::Add),
                Opcode::SubF64R => self.std_f64_arith(a, b, c, BinaryOp::Sub),
                Opcode::MulF64R => self.std_f64_arith(a, b, c, BinaryOp::Mul),
                Opcode::DivF64R => self.std_f64_arith(a, b, c, BinaryOp::Div),
                Opcode::ModF64R => self.std_f64_arith(a, b, c, BinaryOp::Mod),

                // ----------------------------------------------------------
                // Typed arithmetic
                // ----------------------------------------------------------
                Opcode::AddI32Typed => {
                    typed_int_arith!(self, a, b, c, read_i32, write_i32, checked_i32, BinaryOp::Add)
                }
                Opcode::SubI32Typed => {
                    typed_int_arith!(self, a, b, c, read_i32, write_i32, checked_i32, BinaryOp::Sub)
                }
                Opcode::MulI32Typed => {
                    typed_int_arith!(self, a, b, c, read_i32, write_i32, checked_i32, BinaryOp::Mul)
                }
                Opcode::DivI32Typed => {
                    typed_int_arith!(self, a, b, c, read_i32, write_i32, checked_i32, BinaryOp::Div)
                }
                Opcode::ModI32Typed => {
                    typed_int_arith!(self, a, b, c, read_i32, write_i32, checked_i32, BinaryOp::Mod)
                }
                Opcode::AddI64Typed => {
                    typed_int_arith!(self, a, b, c, read_i64, write_i64, checked_i64, BinaryOp::Add)
                }
                Opcode::SubI64Typed => {
                    typed_int_arith!(self, a, b, c, read_i64, write_i64, checked_i64, BinaryOp::Sub)
                }
                Opcode::MulI64Typed => {
                    typed_int_arith!(self, a, b, c, read_i64, write_i64, checked_i64, BinaryOp::Mul)
                }
                Opcode::DivI64Typed => {
                    typed_int_arith!(self, a, b, c, read_i64, write_i64, checked_i64, BinaryOp::Div)
                }
                Opcode::ModI64Typed => {
                    typed_int_arith!(self, a, b, c, read_i64, write_i64, checked_i64, BinaryOp::Mod)
                }
                Opcode::AddU32Typed => {
                    typed_int_arith!(self, a, b, c, read_u32, write_u32, checked_u32, BinaryOp::Add)
                }
                Opcode::SubU32Typed => {
                    typed_int_arith!(self, a, b, c, read_u32, write_u32, checked_u32, BinaryOp::Sub)
                }
                Opcode::MulU32Typed => {
                    typed_int_arith!(self, a, b, c, read_u32, write_u32, checked_u32, BinaryOp::Mul)
                }
                Opcode::DivU32Typed => {
                    typed_int_arith!(self, a, b, c, read_u32, write_u32, checked_u32, BinaryOp::Div)
                }
                Opcode::ModU32Typed => {
                    typed_int_arith!(self, a, b, c, read_u32, write_u32, checked_u32, BinaryOp::Mod)
                }
                Opcode::AddU64Typed => {
                    typed_int_arith!(self, a, b, c, read_u64, write_u64, checked_u64, BinaryOp::Add)
                }
                Opcode::SubU64Typed => {
                    typed_int_arith!(self, a, b, c, read_u64, write_u64, checked_u64, BinaryOp::Sub)
                }
                Opcode::MulU64Typed => {
                    typed_int_arith!(self, a, b, c, read_u64, write_u64, checked_u64, BinaryOp::Mul)
                }
                Opcode::DivU64Typed => {
                    typed_int_arith!(self, a, b, c, read_u64, write_u64, checked_u64, BinaryOp::Div)
                }
                Opcode::ModU64Typed => {
                    typed_int_arith!(self, a, b, c, read_u64, write_u64, checked_u64, BinaryOp::Mod)
                }
                Opcode::AddF64Typed => self.typed_f64_arith(a, b, c, BinaryOp::Add),
                Opcode::SubF64Typed => self.typed_f64_arith(a, b, c, BinaryOp::Sub),
                Opcode::MulF64Typed => self.typed_f64_arith(a, b, c, BinaryOp::Mul),
                Opcode::DivF64Typed => self.typed_f64_arith(a, b, c, BinaryOp::Div),
                Opcode::ModF64Typed => self.typed_f64_arith(a, b, c, BinaryOp::Mod),

                // ----------------------------------------------------------
                // Comparisons
                // ----------------------------------------------------------
                Opcode::LtI32R => std_compare!(self, a, b, c, Value::I32, |x, y| x < y),
                Opcode::LeI32R => std_compare!(self, a, b, c, Value::I32, |x, y| x <= y),
                Opcode::GtI32R => std_compare!(self, a, b, c, Value::I32, |x, y| x > y),
                Opcode::GeI32R => std_compare!(self, a, b, c, Value::I32, |x, y| x >= y),
                Opcode::LtI64R => std_compare!(self, a, b, c, Value::I64, |x, y| x < y),
                Opcode::LeI64R => std_compare!(self, a, b, c, Value::I64, |x, y| x <= y),
                Opcode::GtI64R => std_compare!(self, a, b, c, Value::I64, |x, y| x > y),
                Opcode::GeI64R => std_compare!(self, a, b, c, Value::I64, |x, y| x >= y),
                Opcode::LtU32R => std_compare!(self, a, b, c, Value::U32, |x, y| x < y),
                Opcode::LeU32R => std_compare!(self, a, b, c, Value::U32, |x, y| x <= y),
                Opcode::GtU32R => std_compare!(self, a, b, c, Value::U32, |x, y| x > y),
                Opcode::GeU32R => std_compare!(self, a, b, c, Value::U32, |x, y| x >= y),
                Opcode::LtU64R => std_compare!(self, a, b, c, Value::U64, |x, y| x < y),
                Opcode::LeU64R => std_compare!(self, a, b, c, Value::U64, |x, y| x <= y),
                Opcode::GtU64R => std_compare!(self, a, b, c, Value::U64, |x, y| x > y),
                Opcode::GeU64R => std_compare!(self, a, b, c, Value::U64, |x, y| x >= y),
                Opcode::LtF64R => std_compare!(self, a, b, c, Value::F64, |x, y| x < y),
                Opcode::LeF64R => std_compare!(self, a, b, c, Value::F64, |x, y| x <= y),
                Opcode::GtF64R => std_compare!(self, a, b, c, Value::F64, |x, y| x > y),
                Opcode::GeF64R => std_compare!(self, a, b, c, Value::F64, |x, y| x >= y),
                Opcode::EqR => {
                    let va = self.registers.read(b as u16);
                    let vb = self.registers.read(c as u16);
                    let eq = self.values_equal(va, vb);
                    self.registers.write(a as u16, Value::Bool(eq));
                    None
                }
                Opcode::NeR => {
                    let va = self.registers.read(b as u16);
                    let vb = self.registers.read(c as u16);
                    let eq = self.values_equal(va, vb);
                    self.registers.write(a as u16, Value::Bool(!eq));
                    None
                }

                // ----------------------------------------------------------
                // Bitwise and unary
                // ----------------------------------------------------------
                Opcode::AndR => std_bitwise!(self, a, b, c, &),
                Opcode::OrR => std_bitwise!(self, a, b, c, |),
                Opcode::XorR => std_bitwise!(self, a, b, c, ^),
                Opcode::ShlR => self.shift_op(a, b, c, true),
                Opcode::ShrR => self.shift_op(a, b, c, false),
                Opcode::NegR => {
                    let value = self.registers.read(b as u16);
                    match value {
                        Value::I32(v) => match v.checked_neg() {
                            Some(n) => {
                                self.registers.write(a as u16, Value::I32(n));
                                None
                            }
                            None => Some(RuntimeErrorKind::IntegerOverflow),
                        },
                        Value::I64(v) => match v.checked_neg() {
                            Some(n) => {
                                self.registers.write(a as u16, Value::I64(n));
                                None
                            }
                            None => Some(RuntimeErrorKind::IntegerOverflow),
                        },
                        Value::F64(v) => {
                            self.registers.write(a as u16, Value::F64(-v));
                            None
                        }
                        _ => Some(RuntimeErrorKind::TypeGuard),
                    }
                }
                Opcode::NotR => {
                    let value = self.registers.read(b as u16);
                    match value {
                        Value::Bool(v) => {
                            self.registers.write(a as u16, Value::Bool(!v));
                            None
                        }
                        _ => Some(RuntimeErrorKind::TypeGuard),
                    }
                }
                Opcode::CastR => self.cast_op(a, b, c),
                Opcode::ConcatR => {
                    let va = self.registers.read(b as u16);
                    let vb = self.registers.read(c as u16);
                    match (va, vb) {
                        (Value::Str(x), Value::Str(y)) => {
                            let joined = {
                                let (Object::Str(sx), Object::Str(sy)) =
                                    (self.heap.get(x), self.heap.get(y))
                                else {
                                    unreachable!("string values point at string objects")
                                };
                                format!("{}{}", sx.text, sy.text)
                            };
                            let value = self.alloc_string(joined);
                            self.registers.write(a as u16, value);
                            None
                        }
                        _ => Some(RuntimeErrorKind::TypeGuard),
                    }
                }

                // ----------------------------------------------------------
                // Arrays and iterators
                // ----------------------------------------------------------
                Opcode::MakeArray => {
                    let elements: Vec<Value> = (0..c)
                        .map(|i| self.registers.read((b as u16) + i as u16))
                        .collect();
                    let r = self.alloc(Object::Array(ArrayObj { elements }));
                    self.registers.write(a as u16, Value::Array(r));
                    None
                }
                Opcode::ArrayGet => self.array_get(a, b, c),
                Opcode::ArraySet => self.array_set(a, b, c),
                Opcode::ArrayLen => {
                    let value = self.registers.read(b as u16);
                    match value {
                        Value::Array(r) => match self.heap.get(r) {
                            Object::Array(arr) => {
                                let len = arr.elements.len() as i32;
                                self.registers.write(a as u16, Value::I32(len));
                                None
                            }
                            _ => Some(RuntimeErrorKind::TypeGuard),
                        },
                        _ => Some(RuntimeErrorKind::TypeGuard),
                    }
                }
                Opcode::ArrayPush => {
                    let target = self.registers.read(a as u16);
                    let value = self.registers.read(b as u16);
                    match target {
                        Value::Array(r) => match self.heap.get_mut(r) {
                            Object::Array(arr) => {
                                arr.elements.push(value);
                                None
                            }
                            _ => Some(RuntimeErrorKind::TypeGuard),
                        },
                        _ => Some(RuntimeErrorKind::TypeGuard),
                    }
                }
                Opcode::IterBegin => self.iter_begin(a, b, c),
                Opcode::IterNext => self.iter_next(a, b, c),

                // ----------------------------------------------------------
                // Control flow
                // ----------------------------------------------------------
                Opcode::Jump => {
                    let off = u16::from_be_bytes([a, b]) as usize;
                    self.frames.last_mut().expect("frame").ip = next_ip + off;
                    None
                }
                Opcode::Loop => {
                    let off = u16::from_be_bytes([a, b]) as usize;
                    self.frames.last_mut().expect("frame").ip = next_ip - off;
                    None
                }
                Opcode::JumpShort => {
                    self.frames.last_mut().expect("frame").ip = next_ip + a as usize;
                    None
                }
                Opcode::LoopShort => {
                    self.frames.last_mut().expect("frame").ip = next_ip - a as usize;
                    None
                }
                Opcode::JumpIfNotR => {
                    let off = u16::from_be_bytes([b, c]) as usize;
                    match self.registers.read(a as u16) {
                        Value::Bool(false) => {
                            self.frames.last_mut().expect("frame").ip = next_ip + off;
                            None
                        }
                        Value::Bool(true) => None,
                        _ => Some(RuntimeErrorKind::TypeGuard),
                    }
                }
                Opcode::JumpIfNotShortR => match self.registers.read(a as u16) {
                    Value::Bool(false) => {
                        self.frames.last_mut().expect("frame").ip = next_ip + b as usize;
                        None
                    }
                    Value::Bool(true) => None,
                    _ => Some(RuntimeErrorKind::TypeGuard),
                },

                // ----------------------------------------------------------
                // Calls and returns
                // ----------------------------------------------------------
                Opcode::CallR => self.call_op(a, b, c),
                Opcode::ReturnR => {
                    let value = self.registers.read(a as u16);
                    if self.frames.len() == 1 {
                        return Ok(());
                    }
                    self.do_return(value);
                    None
                }
                Opcode::ReturnNil => {
                    if self.frames.len() == 1 {
                        return Ok(());
                    }
                    self.do_return(Value::Nil);
                    None
                }

                // ----------------------------------------------------------
                // Closures and upvalues
                // ----------------------------------------------------------
                Opcode::MakeClosure => self.make_closure(chunk, ip, a, b, c),
                Opcode::GetUpvalue => {
                    match self.upvalue_slot(b) {
                        Some(upvalue) => {
                            let value = match self.heap.get(upvalue) {
                                Object::Upvalue(UpvalueObj::Closed(v)) => *v,
                                Object::Upvalue(UpvalueObj::Open { frame, register }) => {
                                    let (frame, register) = (*frame, *register);
                                    self.registers.read_frame_register(frame, register)
                                }
                                _ => Value::Nil,
                            };
                            self.registers.write(a as u16, value);
                            None
                        }
                        None => Some(RuntimeErrorKind::TypeGuard),
                    }
                }
                Opcode::SetUpvalue => {
                    let value = self.registers.read(b as u16);
                    match self.upvalue_slot(a) {
                        Some(upvalue) => {
                            match self.heap.get(upvalue) {
                                Object::Upvalue(UpvalueObj::Open { frame, register }) => {
                                    let (frame, register) = (*frame, *register);
                                    self.registers.write_frame_register(frame, register, value);
                                }
                                Object::Upvalue(UpvalueObj::Closed(_)) => {
                                    *self.heap.get_mut(upvalue) =
                                        Object::Upvalue(UpvalueObj::Closed(value));
                                }
                                _ => {}
                            }
                            None
                        }
                        None => Some(RuntimeErrorKind::TypeGuard),
                    }
                }
                Opcode::CloseUpvalue => {
                    let frame_idx = self.frames.len() - 1;
                    self.close_upvalues(frame_idx, a);
                    None
                }

                // ----------------------------------------------------------
                // Enum instances
                // ----------------------------------------------------------
                Opcode::EnumNew => self.enum_new(chunk, ip),
                Opcode::FieldGet => {
                    let target = self.registers.read(b as u16);
                    match target {
                        Value::Enum(r) => match self.heap.get(r) {
                            Object::Enum(e) => match e.payload.get(c as usize) {
                                Some(v) => {
                                    let v = *v;
                                    self.registers.write(a as u16, v);
                                    None
                                }
                                None => Some(RuntimeErrorKind::IndexOutOfBounds),
                            },
                            _ => Some(RuntimeErrorKind::TypeGuard),
                        },
                        _ => Some(RuntimeErrorKind::TypeGuard),
                    }
                }
                Opcode::FieldSet => {
                    let value = self.registers.read(c as u16);
                    let target = self.registers.read(a as u16);
                    match target {
                        Value::Enum(r) => match self.heap.get_mut(r) {
                            Object::Enum(e) => match e.payload.get_mut(b as usize) {
                                Some(slot) => {
                                    *slot = value;
                                    None
                                }
                                None => Some(RuntimeErrorKind::IndexOutOfBounds),
                            },
                            _ => Some(RuntimeErrorKind::TypeGuard),
                        },
                        _ => Some(RuntimeErrorKind::TypeGuard),
                    }
                }

                // ----------------------------------------------------------
                // Error handling
                // ----------------------------------------------------------
                Opcode::TryBegin => {
                    let off = u16::from_be_bytes([b, c]) as usize;
                    self.try_frames.push(TryFrame {
                        catch_ip: next_ip + off,
                        catch_reg: a,
                        frame_depth: self.frames.len(),
                    });
                    None
                }
                Opcode::TryEnd => {
                    self.try_frames.pop();
                    None
                }
                Opcode::Throw => {
                    let value = self.registers.read(a as u16);
                    let (kind, message) = match value.obj_ref().map(|r| self.heap.get(r)) {
                        Some(Object::Error(e)) => (e.kind, e.message.clone()),
                        _ => (
                            RuntimeErrorKind::UnhandledThrow,
                            self.format_value(value),
                        ),
                    };
                    self.raise_with(kind, loc, message)?;
                    None
                }

                Opcode::PrintR => {
                    let value = self.registers.read(a as u16);
                    let text = self.format_value(value);
                    self.emit_output(&text);
                    None
                }
            };

            if let Some(kind) = failure {
                self.raise(kind, loc)?;
            }
        }
    }

    // ------------------------------------------------------------------
    // Handler helpers
    // ------------------------------------------------------------------

    fn std_f64_arith(&mut self, rd: u8, ra: u8, rb: u8, op: BinaryOp) -> Option<RuntimeErrorKind> {
        let va = self.registers.read(ra as u16);
        let vb = self.registers.read(rb as u16);
        match (va, vb) {
            (Value::F64(x), Value::F64(y)) => {
                self.registers.write(rd as u16, Value::F64(f64_op(x, op, y)));
                None
            }
            _ => Some(RuntimeErrorKind::TypeGuard),
        }
    }

    fn typed_f64_arith(
        &mut self,
        rd: u8,
        ra: u8,
        rb: u8,
        op: BinaryOp,
    ) -> Option<RuntimeErrorKind> {
        match (self.registers.read_f64(ra), self.registers.read_f64(rb)) {
            (Ok(x), Ok(y)) => {
                self.registers.write_f64(rd, f64_op(x, op, y));
                None
            }
            _ => Some(RuntimeErrorKind::TypeGuard),
        }
    }

    fn shift_op(&mut self, rd: u8, ra: u8, rb: u8, left: bool) -> Option<RuntimeErrorKind> {
        let va = self.registers.read(ra as u16);
        let vb = self.registers.read(rb as u16);
        macro_rules! shift {
            ($x:expr, $y:expr, $variant:path) => {{
                let amount: u32 = match u32::try_from($y) {
                    Ok(v) => v,
                    Err(_) => return Some(RuntimeErrorKind::IntegerOverflow),
                };
                let result = if left {
                    $x.checked_shl(amount)
                } else {
                    $x.checked_shr(amount)
                };
                match result {
                    Some(v) => {
                        self.registers.write(rd as u16, $variant(v));
                        None
                    }
                    None => Some(RuntimeErrorKind::IntegerOverflow),
                }
            }};
        }
        match (va, vb) {
            (Value::I32(x), Value::I32(y)) => shift!(x, y, Value::I32),
            (Value::I64(x), Value::I64(y)) => shift!(x, y, Value::I64),
            (Value::U32(x), Value::U32(y)) => shift!(x, y, Value::U32),
            (Value::U64(x), Value::U64(y)) => shift!(x, y, Value::U64),
            _ => Some(RuntimeErrorKind::TypeGuard),
        }
    }

    fn cast_op(&mut self, rd: u8, rs: u8, target: u8) -> Option<RuntimeErrorKind> {
        let value = self.registers.read(rs as u16);
        let as_f64 = match value {
            Value::I32(v) => v as f64,
            Value::I64(v) => v as f64,
            Value::U32(v) => v as f64,
            Value::U64(v) => v as f64,
            Value::F64(v) => v,
            _ => return Some(RuntimeErrorKind::TypeGuard),
        };
        // Integer-to-integer casts go through the native conversion so
        // wrap-around narrowing matches the source value, not the float
        // detour.
        macro_rules! int_cast {
            ($to:ty, $variant:path) => {{
                let out = match value {
                    Value::I32(v) => v as $to,
                    Value::I64(v) => v as $to,
                    Value::U32(v) => v as $to,
                    Value::U64(v) => v as $to,
                    Value::F64(v) => v as $to,
                    _ => return Some(RuntimeErrorKind::TypeGuard),
                };
                self.registers.write(rd as u16, $variant(out));
                None
            }};
        }
        match target {
            t if t == NumericKind::I32.index() as u8 => int_cast!(i32, Value::I32),
            t if t == NumericKind::I64.index() as u8 => int_cast!(i64, Value::I64),
            t if t == NumericKind::U32.index() as u8 => int_cast!(u32, Value::U32),
            t if t == NumericKind::U64.index() as u8 => int_cast!(u64, Value::U64),
            t if t == NumericKind::F64.index() as u8 => {
                self.registers.write(rd as u16, Value::F64(as_f64));
                None
            }
            _ => Some(RuntimeErrorKind::TypeGuard),
        }
    }

    fn array_get(&mut self, rd: u8, arr: u8, idx: u8) -> Option<RuntimeErrorKind> {
        let target = self.registers.read(arr as u16);
        let index = match self.index_value(idx) {
            Some(i) => i,
            None => return Some(RuntimeErrorKind::TypeGuard),
        };
        match target {
            Value::Array(r) => match self.heap.get(r) {
                Object::Array(a) => match usize::try_from(index)
                    .ok()
                    .and_then(|i| a.elements.get(i))
                {
                    Some(v) => {
                        let v = *v;
                        self.registers.write(rd as u16, v);
                        None
                    }
                    None => Some(RuntimeErrorKind::IndexOutOfBounds),
                },
                _ => Some(RuntimeErrorKind::TypeGuard),
            },
            _ => Some(RuntimeErrorKind::TypeGuard),
        }
    }

    fn array_set(&mut self, arr: u8, idx: u8, rs: u8) -> Option<RuntimeErrorKind> {
        let value = self.registers.read(rs as u16);
        let target = self.registers.read(arr as u16);
        let index = match self.index_value(idx) {
            Some(i) => i,
            None => return Some(RuntimeErrorKind::TypeGuard),
        };
        match target {
            Value::Array(r) => match self.heap.get_mut(r) {
                Object::Array(a) => {
                    match usize::try_from(index)
                        .ok()
                        .and_then(|i| a.elements.get_mut(i))
                    {
                        Some(slot) => {
                            *slot = value;
                            None
                        }
                        None => Some(RuntimeErrorKind::IndexOutOfBounds),
                    }
                }
                _ => Some(RuntimeErrorKind::TypeGuard),
            },
            _ => Some(RuntimeErrorKind::TypeGuard),
        }
    }

    fn index_value(&mut self, reg: u8) -> Option<i64> {
        match self.registers.read(reg as u16) {
            Value::I32(v) => Some(v as i64),
            Value::I64(v) => Some(v),
            Value::U32(v) => Some(v as i64),
            Value::U64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    fn iter_begin(&mut self, rd: u8, src: u8, range_form: u8) -> Option<RuntimeErrorKind> {
        if range_form == 1 {
            // start/end/step live in three consecutive registers.
            let (start, kind) = match self.registers.read(src as u16) {
                Value::I32(v) => (v as i64, NumericKind::I32),
                Value::I64(v) => (v, NumericKind::I64),
                Value::U32(v) => (v as i64, NumericKind::U32),
                Value::U64(v) => match i64::try_from(v) {
                    Ok(v) => (v, NumericKind::U64),
                    Err(_) => return Some(RuntimeErrorKind::IntegerOverflow),
                },
                _ => return Some(RuntimeErrorKind::TypeGuard),
            };
            let Some(end) = self.index_value(src + 1) else {
                return Some(RuntimeErrorKind::TypeGuard);
            };
            let Some(step) = self.index_value(src + 2) else {
                return Some(RuntimeErrorKind::TypeGuard);
            };
            let r = self.alloc(Object::RangeIter(RangeIterObj {
                current: start,
                end,
                step,
                kind,
            }));
            self.registers.write(rd as u16, Value::RangeIter(r));
            return None;
        }
        match self.registers.read(src as u16) {
            Value::Array(array) => {
                let r = self.alloc(Object::ArrayIter(ArrayIterObj { array, index: 0 }));
                self.registers.write(rd as u16, Value::ArrayIter(r));
                None
            }
            Value::RangeIter(r) => {
                self.registers.write(rd as u16, Value::RangeIter(r));
                None
            }
            Value::ArrayIter(r) => {
                self.registers.write(rd as u16, Value::ArrayIter(r));
                None
            }
            _ => Some(RuntimeErrorKind::TypeGuard),
        }
    }

    fn iter_next(&mut self, iter: u8, rd_value: u8, rd_has: u8) -> Option<RuntimeErrorKind> {
        match self.registers.read(iter as u16) {
            Value::RangeIter(r) => {
                let next = match self.heap.get_mut(r) {
                    Object::RangeIter(it) => it.next().map(|v| (v, it.kind)),
                    _ => return Some(RuntimeErrorKind::TypeGuard),
                };
                match next {
                    Some((v, kind)) => {
                        let boxed = match kind {
                            NumericKind::I32 => Value::I32(v as i32),
                            NumericKind::I64 => Value::I64(v),
                            NumericKind::U32 => Value::U32(v as u32),
                            NumericKind::U64 => Value::U64(v as u64),
                            NumericKind::F64 => Value::F64(v as f64),
                            NumericKind::Bool => Value::Bool(v != 0),
                        };
                        self.registers.write(rd_value as u16, boxed);
                        self.registers.write(rd_has as u16, Value::Bool(true));
                    }
                    None => {
                        self.registers.write(rd_has as u16, Value::Bool(false));
                    }
                }
                None
            }
            Value::ArrayIter(r) => {
                let element = match self.heap.get(r) {
                    Object::ArrayIter(it) => {
                        let (array, index) = (it.array, it.index);
                        match self.heap.get(array) {
                            Object::Array(arr) => arr.elements.get(index).copied(),
                            _ => return Some(RuntimeErrorKind::TypeGuard),
                        }
                    }
                    _ => return Some(RuntimeErrorKind::TypeGuard),
                };
                match element {
                    Some(v) => {
                        if let Object::ArrayIter(it) = self.heap.get_mut(r) {
                            it.index += 1;
                        }
                        self.registers.write(rd_value as u16, v);
                        self.registers.write(rd_has as u16, Value::Bool(true));
                    }
                    None => {
                        self.registers.write(rd_has as u16, Value::Bool(false));
                    }
                }
                None
            }
            _ => Some(RuntimeErrorKind::TypeGuard),
        }
    }

    fn call_op(&mut self, fr: u8, first_arg: u8, argc: u8) -> Option<RuntimeErrorKind> {
        let callee = self.registers.read(fr as u16);
        let (function, closure) = match callee {
            Value::Function(r) => match self.heap.get(r) {
                Object::Function(f) => (f.function.clone(), None),
                _ => return Some(RuntimeErrorKind::TypeGuard),
            },
            Value::Closure(r) => match self.heap.get(r) {
                Object::Closure(c) => (c.function.clone(), Some(r)),
                _ => return Some(RuntimeErrorKind::TypeGuard),
            },
            _ => return Some(RuntimeErrorKind::TypeGuard),
        };
        if function.arity != argc {
            return Some(RuntimeErrorKind::TypeGuard);
        }
        let args: Vec<Value> = (0..argc)
            .map(|i| self.registers.read((first_arg as u16) + i as u16))
            .collect();
        if self.registers.allocate_frame().is_err() {
            return Some(RuntimeErrorKind::StackOverflow);
        }
        for (i, arg) in args.into_iter().enumerate() {
            self.registers
                .write((FRAME_REG_START + i) as u16, arg);
        }
        self.frames.push(CallFrameInfo {
            function,
            ip: 0,
            return_register: fr,
            closure,
        });
        None
    }

    /// Pop the current activation, deliver `value` to the caller.
    fn do_return(&mut self, value: Value) {
        let frame_idx = self.frames.len() - 1;
        self.close_upvalues(frame_idx, FRAME_REG_START as u8);
        // Try frames opened inside the returning function die with it.
        while let Some(tf) = self.try_frames.last() {
            if tf.frame_depth >= self.frames.len() {
                self.try_frames.pop();
            } else {
                break;
            }
        }
        let info = self.frames.pop().expect("returning frame exists");
        self.registers.deallocate_frame();
        self.registers.write(info.return_register as u16, value);
    }

    fn make_closure(
        &mut self,
        chunk: &crate::bytecode::Chunk,
        ip: usize,
        rd: u8,
        hi: u8,
        lo: u8,
    ) -> Option<RuntimeErrorKind> {
        let idx = u16::from_be_bytes([hi, lo]);
        let Some(Constant::Function(function)) = chunk.constants.get(idx as usize) else {
            return Some(RuntimeErrorKind::TypeGuard);
        };
        let function = function.clone();
        let count = chunk.code.get(ip + 4).copied().unwrap_or(0) as usize;
        let frame_idx = self.frames.len() - 1;
        let mut upvalues = Vec::with_capacity(count);
        for k in 0..count {
            let is_local = chunk.code.get(ip + 5 + 2 * k).copied().unwrap_or(0) == 1;
            let index = chunk.code.get(ip + 6 + 2 * k).copied().unwrap_or(0);
            if is_local {
                upvalues.push(self.capture_upvalue(frame_idx, index));
            } else {
                match self.upvalue_slot(index) {
                    Some(upvalue) => upvalues.push(upvalue),
                    None => return Some(RuntimeErrorKind::TypeGuard),
                }
            }
        }
        let r = self.alloc(Object::Closure(ClosureObj { function, upvalues }));
        self.registers.write(rd as u16, Value::Closure(r));
        None
    }

    /// The current activation's upvalue at `index`.
    fn upvalue_slot(&self, index: u8) -> Option<super::value::ObjRef> {
        let closure = self.frames.last()?.closure?;
        match self.heap.get(closure) {
            Object::Closure(c) => c.upvalues.get(index as usize).copied(),
            _ => None,
        }
    }

    fn enum_new(&mut self, chunk: &crate::bytecode::Chunk, ip: usize) -> Option<RuntimeErrorKind> {
        let code = &chunk.code;
        let rd = code.get(ip + 1).copied().unwrap_or(0);
        let variant_index = code.get(ip + 2).copied().unwrap_or(0);
        let payload_count = code.get(ip + 3).copied().unwrap_or(0);
        let start = code.get(ip + 4).copied().unwrap_or(0);
        let type_idx = u16::from_be_bytes([
            code.get(ip + 5).copied().unwrap_or(0),
            code.get(ip + 6).copied().unwrap_or(0),
        ]);
        let variant_idx = u16::from_be_bytes([
            code.get(ip + 7).copied().unwrap_or(0),
            code.get(ip + 8).copied().unwrap_or(0),
        ]);
        let type_name = match chunk.constants.get(type_idx as usize) {
            Some(Constant::Str(s)) => s.clone(),
            _ => return Some(RuntimeErrorKind::TypeGuard),
        };
        let variant_name = match chunk.constants.get(variant_idx as usize) {
            Some(Constant::Str(s)) => s.clone(),
            _ => return Some(RuntimeErrorKind::TypeGuard),
        };
        let payload: Vec<Value> = (0..payload_count)
            .map(|i| self.registers.read((start as u16) + i as u16))
            .collect();
        let r = self.alloc(Object::Enum(EnumObj {
            type_name,
            variant_name,
            variant_index,
            payload,
        }));
        self.registers.write(rd as u16, Value::Enum(r));
        None
    }

    // ------------------------------------------------------------------
    // Error transfer
    // ------------------------------------------------------------------

    pub(crate) fn raise(
        &mut self,
        kind: RuntimeErrorKind,
        location: SourceLocation,
    ) -> Result<(), RuntimeError> {
        self.raise_with(kind, location, kind.message().to_string())
    }

    /// Record the error and transfer control: to the nearest try frame's
    /// catch register when one is active, out of the dispatch loop
    /// otherwise. Typed windows are reconciled before any frame is dropped.
    pub(crate) fn raise_with(
        &mut self,
        kind: RuntimeErrorKind,
        location: SourceLocation,
        message: String,
    ) -> Result<(), RuntimeError> {
        self.registers.reconcile_all();
        let err = self.heap.alloc(Object::Error(ErrorObj {
            kind,
            message: message.clone(),
            location,
        }));
        self.last_error = Some(err);

        match self.try_frames.pop() {
            Some(tf) => {
                while self.frames.len() > tf.frame_depth {
                    let frame_idx = self.frames.len() - 1;
                    self.close_upvalues(frame_idx, FRAME_REG_START as u8);
                    self.frames.pop();
                    self.registers.deallocate_frame();
                }
                self.registers.write(tf.catch_reg as u16, Value::Error(err));
                self.frames.last_mut().expect("catch frame").ip = tf.catch_ip;
                Ok(())
            }
            None => Err(RuntimeError::with_message(kind, location, message)),
        }
    }
}

fn f64_op(x: f64, op: BinaryOp, y: f64) -> f64 {
    match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => x / y,
        BinaryOp::Mod => x % y,
        _ => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Chunk, FunctionChunk};
    use std::rc::Rc;

    /// Hand-assemble a chunk from (opcode, operands) tuples.
    fn assemble(instrs: &[(Opcode, &[u8])]) -> Rc<FunctionChunk> {
        let mut chunk = Chunk::new("test.orus");
        for (op, operands) in instrs {
            chunk.write(*op as u8, 1, 1);
            for byte in *operands {
                chunk.write(*byte, 1, 1);
            }
            // Pad fixed 4-byte instructions.
            if let Some(size) = op.fixed_size() {
                for _ in (operands.len() + 1)..size {
                    chunk.write(0, 1, 1);
                }
            }
        }
        Rc::new(FunctionChunk {
            name: "<test>".to_string(),
            arity: 0,
            upvalue_count: 0,
            register_count: 0,
            chunk,
        })
    }

    fn run_chunk(instrs: &[(Opcode, &[u8])]) -> Vm {
        let mut vm = Vm::new();
        vm.capture_output();
        let outcome = vm.execute(assemble(instrs));
        assert!(outcome.is_ok(), "execution failed: {:?}", outcome);
        vm
    }

    #[test]
    fn test_load_and_move() {
        let mut vm = run_chunk(&[
            (Opcode::LoadI32, &[200, 0, 7]),
            (Opcode::Move, &[201, 200]),
            (Opcode::Halt, &[]),
        ]);
        assert_eq!(vm.registers.read(201), Value::I32(7));
    }

    #[test]
    fn test_standard_add() {
        let mut vm = run_chunk(&[
            (Opcode::LoadI32, &[200, 0, 40]),
            (Opcode::LoadI32, &[201, 0, 2]),
            (Opcode::AddI32R, &[202, 200, 201]),
            (Opcode::Halt, &[]),
        ]);
        assert_eq!(vm.registers.read(202), Value::I32(42));
    }

    #[test]
    fn test_typed_add_matches_standard() {
        let mut vm = run_chunk(&[
            (Opcode::LoadI32, &[100, 0, 40]),
            (Opcode::LoadI32, &[101, 0, 2]),
            (Opcode::AddI32Typed, &[102, 100, 101]),
            (Opcode::Halt, &[]),
        ]);
        // The boxed read reconciles the dirty typed slot.
        assert_eq!(vm.registers.read(102), Value::I32(42));
    }

    #[test]
    fn test_overflow_raises() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new("test.orus");
        let max = chunk.add_constant(Constant::I32(i32::MAX));
        for (op, operands) in [
            (Opcode::LoadConst, vec![200u8, (max >> 8) as u8, max as u8]),
            (Opcode::LoadI32, vec![201, 0, 1]),
            (Opcode::AddI32R, vec![202, 200, 201]),
            (Opcode::Halt, vec![]),
        ] {
            chunk.write(op as u8, 1, 1);
            for byte in &operands {
                chunk.write(*byte, 1, 1);
            }
            for _ in (operands.len() + 1)..4 {
                chunk.write(0, 1, 1);
            }
        }
        let script = Rc::new(FunctionChunk {
            name: "<test>".to_string(),
            arity: 0,
            upvalue_count: 0,
            register_count: 0,
            chunk,
        });
        match vm.execute(script) {
            crate::vm::InterpretOutcome::RuntimeError(err) => {
                assert_eq!(err.kind, RuntimeErrorKind::IntegerOverflow);
            }
            other => panic!("expected overflow, got {:?}", other),
        }
    }

    #[test]
    fn test_div_by_zero_raises() {
        let mut vm = Vm::new();
        let script = assemble(&[
            (Opcode::LoadI32, &[200, 0, 10]),
            (Opcode::LoadI32, &[201, 0, 0]),
            (Opcode::DivI32R, &[202, 200, 201]),
            (Opcode::Halt, &[]),
        ]);
        match vm.execute(script) {
            crate::vm::InterpretOutcome::RuntimeError(err) => {
                assert_eq!(err.kind, RuntimeErrorKind::DivisionByZero);
            }
            other => panic!("expected division error, got {:?}", other),
        }
        assert!(vm.last_error().unwrap().contains("division by zero"));
    }

    #[test]
    fn test_try_catches_throw() {
        // The division raises; control lands on the PrintR at the catch
        // offset with the error value in r205.
        let mut vm = run_chunk(&[
            (Opcode::TryBegin, &[205, 0, 12]),
            (Opcode::LoadI32, &[200, 0, 1]),
            (Opcode::LoadI32, &[201, 0, 0]),
            (Opcode::DivI32R, &[202, 200, 201]),
            (Opcode::PrintR, &[205, 0, 0]),
            (Opcode::Halt, &[]),
        ]);
        let output = vm.take_output();
        assert!(output.contains("Error:"), "output: {:?}", output);
        assert!(output.contains("division by zero"));
    }

    #[test]
    fn test_jump_if_not() {
        let mut vm = run_chunk(&[
            (Opcode::LoadFalse, &[200]),
            (Opcode::JumpIfNotR, &[200, 0, 4]), // skip the next load
            (Opcode::LoadI32, &[201, 0, 1]),
            (Opcode::LoadI32, &[202, 0, 2]),
            (Opcode::Halt, &[]),
        ]);
        assert_eq!(vm.registers.read(201), Value::Nil);
        assert_eq!(vm.registers.read(202), Value::I32(2));
    }

    #[test]
    fn test_loop_counts_down() {
        // r200 = 3; do { r200 -= 1 } while r200 > 0
        let mut vm = run_chunk(&[
            (Opcode::LoadI32, &[200, 0, 3]),       // 0
            (Opcode::LoadI32, &[201, 0, 1]),       // 4
            (Opcode::SubI32R, &[200, 200, 201]),   // 8: loop head
            (Opcode::LoadI32, &[202, 0, 0]),       // 12
            (Opcode::GtI32R, &[203, 200, 202]),    // 16
            (Opcode::JumpIfNotShortR, &[203, 2]),  // 20: exit over the loop.s
            (Opcode::LoopShort, &[17]),            // 23: back to offset 8
            (Opcode::Halt, &[]),                   // 25
        ]);
        assert_eq!(vm.registers.read(200), Value::I32(0));
    }

    #[test]
    fn test_concat_and_eq() {
        let mut vm = Vm::new();
        vm.capture_output();
        let mut chunk = Chunk::new("test.orus");
        let hello = chunk.add_constant(Constant::Str("hel".into()));
        let world = chunk.add_constant(Constant::Str("lo".into()));
        let full = chunk.add_constant(Constant::Str("hello".into()));
        let code: Vec<(Opcode, Vec<u8>)> = vec![
            (Opcode::LoadConst, vec![200, 0, hello as u8]),
            (Opcode::LoadConst, vec![201, 0, world as u8]),
            (Opcode::ConcatR, vec![202, 200, 201]),
            (Opcode::LoadConst, vec![203, 0, full as u8]),
            (Opcode::EqR, vec![204, 202, 203]),
            (Opcode::PrintR, vec![204, 0, 0]),
            (Opcode::Halt, vec![]),
        ];
        for (op, operands) in &code {
            chunk.write(*op as u8, 1, 1);
            for byte in operands {
                chunk.write(*byte, 1, 1);
            }
            if let Some(size) = op.fixed_size() {
                for _ in (operands.len() + 1)..size {
                    chunk.write(0, 1, 1);
                }
            }
        }
        let outcome = vm.execute(Rc::new(FunctionChunk {
            name: "<test>".to_string(),
            arity: 0,
            upvalue_count: 0,
            register_count: 0,
            chunk,
        }));
        assert!(outcome.is_ok());
        assert_eq!(vm.take_output(), "true\n");
    }

    #[test]
    fn test_array_ops() {
        let mut vm = run_chunk(&[
            (Opcode::LoadI32, &[200, 0, 1]),
            (Opcode::LoadI32, &[201, 0, 2]),
            (Opcode::MakeArray, &[202, 200, 2]),
            (Opcode::ArrayLen, &[203, 202]),
            (Opcode::LoadI32, &[204, 0, 0]),
            (Opcode::ArrayGet, &[205, 202, 204]),
            (Opcode::Halt, &[]),
        ]);
        assert_eq!(vm.registers.read(203), Value::I32(2));
        assert_eq!(vm.registers.read(205), Value::I32(1));
    }

    #[test]
    fn test_array_index_out_of_bounds() {
        let mut vm = Vm::new();
        let script = assemble(&[
            (Opcode::LoadI32, &[200, 0, 1]),
            (Opcode::MakeArray, &[201, 200, 1]),
            (Opcode::LoadI32, &[202, 0, 9]),
            (Opcode::ArrayGet, &[203, 201, 202]),
            (Opcode::Halt, &[]),
        ]);
        match vm.execute(script) {
            crate::vm::InterpretOutcome::RuntimeError(err) => {
                assert_eq!(err.kind, RuntimeErrorKind::IndexOutOfBounds);
            }
            other => panic!("expected bounds error, got {:?}", other),
        }
    }

    #[test]
    fn test_range_iterator() {
        // Build a 0..3 range iterator and drain it.
        let mut vm = run_chunk(&[
            (Opcode::LoadI32, &[200, 0, 0]), // start
            (Opcode::LoadI32, &[201, 0, 3]), // end
            (Opcode::LoadI32, &[202, 0, 1]), // step
            (Opcode::IterBegin, &[203, 200, 1]),
            (Opcode::IterNext, &[203, 204, 205]),
            (Opcode::IterNext, &[203, 204, 205]),
            (Opcode::IterNext, &[203, 204, 205]),
            (Opcode::IterNext, &[203, 206, 207]),
            (Opcode::Halt, &[]),
        ]);
        assert_eq!(vm.registers.read(204), Value::I32(2));
        assert_eq!(vm.registers.read(205), Value::Bool(true));
        assert_eq!(vm.registers.read(207), Value::Bool(false));
    }

    #[test]
    fn test_cast() {
        let mut vm = run_chunk(&[
            (Opcode::LoadI32, &[200, 1, 44]),
            (Opcode::CastR, &[201, 200, 1]), // -> i64
            (Opcode::CastR, &[202, 200, 4]), // -> f64
            (Opcode::Halt, &[]),
        ]);
        assert_eq!(vm.registers.read(201), Value::I64(300));
        assert_eq!(vm.registers.read(202), Value::F64(300.0));
    }

    #[test]
    fn test_throw_without_handler_escapes() {
        let mut vm = Vm::new();
        let script = assemble(&[
            (Opcode::LoadI32, &[200, 0, 5]),
            (Opcode::Throw, &[200, 0, 0]),
            (Opcode::Halt, &[]),
        ]);
        match vm.execute(script) {
            crate::vm::InterpretOutcome::RuntimeError(err) => {
                assert_eq!(err.kind, RuntimeErrorKind::UnhandledThrow);
            }
            other => panic!("expected unhandled throw, got {:?}", other),
        }
    }

    #[test]
    fn test_enum_new_and_field_get() {
        let mut vm = Vm::new();
        let mut chunk = Chunk::new("test.orus");
        let type_idx = chunk.add_constant(Constant::Str("Point".into()));
        let variant_idx = chunk.add_constant(Constant::Str("Point".into()));
        // load 2 payload values, enum.new, field.get
        for (op, operands) in [
            (Opcode::LoadI32, vec![200u8, 0, 3]),
            (Opcode::LoadI32, vec![201, 0, 4]),
        ] {
            chunk.write(op as u8, 1, 1);
            for byte in &operands {
                chunk.write(*byte, 1, 1);
            }
        }
        // EnumNew: rd=202 variant=0 payload=2 start=200 type/variant consts
        for byte in [
            Opcode::EnumNew as u8,
            202,
            0,
            2,
            200,
            (type_idx >> 8) as u8,
            type_idx as u8,
            (variant_idx >> 8) as u8,
            variant_idx as u8,
        ] {
            chunk.write(byte, 1, 1);
        }
        for byte in [Opcode::FieldGet as u8, 203, 202, 1] {
            chunk.write(byte, 1, 1);
        }
        for byte in [Opcode::Halt as u8, 0, 0, 0] {
            chunk.write(byte, 1, 1);
        }
        let outcome = vm.execute(Rc::new(FunctionChunk {
            name: "<test>".to_string(),
            arity: 0,
            upvalue_count: 0,
            register_count: 0,
            chunk,
        }));
        assert!(outcome.is_ok(), "outcome: {:?}", outcome);
        assert_eq!(vm.registers.read(203), Value::I32(4));
        let instance = vm.registers.read(202);
        assert_eq!(vm.format_value(instance), "Point(3, 4)");
    }
}
