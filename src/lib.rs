//! Orus - a statically-typed scripting language on a register VM
//!
//! Source is compiled ahead of execution into dense register bytecode and
//! run by a 256-register virtual machine with typed shadow registers and a
//! mark-sweep heap.
//!
//! # Pipeline
//!
//! ```text
//! ┌────────┐   ┌────────┐   ┌──────────┐   ┌───────────┐   ┌─────────┐
//! │ Lexer  │──▶│ Parser │──▶│ Resolver │──▶│ Optimizer │──▶│ Codegen │
//! └────────┘   └────────┘   └──────────┘   └───────────┘   └────┬────┘
//!   tokens       arena AST    typed AST      folded AST         │
//!                                                               ▼
//!                                                        ┌────────────┐
//!                                                        │     VM     │
//!                                                        └────────────┘
//! ```
//!
//! - **Lexer**: indentation-aware scanner; newlines terminate statements.
//! - **Parser**: Pratt parser over a vector-arena AST.
//! - **Resolver**: decorates every node with a type; numeric types never
//!   promote implicitly.
//! - **Optimizer**: checked constant folding; a fold that would overflow or
//!   divide by zero is refused and surfaces at runtime instead.
//! - **Codegen**: dual register allocator (standard regions + typed banks),
//!   patch-list control flow, peephole and move-coalescing post-passes.
//! - **VM**: hierarchical register windows with per-frame typed shadows,
//!   call frames from a bounded free list, try/catch unwinding, and a
//!   mark-sweep collector over a slab heap.
//!
//! # Example
//!
//! ```rust
//! use orus::vm::Vm;
//!
//! let mut vm = Vm::new();
//! vm.capture_output();
//! let outcome = vm.interpret("print(1 + 2 * 3)", "example.orus");
//! assert!(outcome.is_ok());
//! assert_eq!(vm.take_output(), "7\n");
//! ```

#![warn(clippy::all)]

pub mod bytecode;
pub mod codegen;
pub mod config;
pub mod error;
pub mod lexer;
pub mod optimizer;
pub mod parser;
pub mod types;
pub mod vm;

// Re-export commonly used types
pub use bytecode::{disassemble, Chunk, Constant, FunctionChunk, Opcode};
pub use config::{ConfigError, LogConfig, OrusConfig, ProfilingConfig};
pub use error::{
    CompileError, Diagnostic, DiagnosticList, ErrorCode, RuntimeError, RuntimeErrorKind, Severity,
    SourceLocation,
};
pub use lexer::{Lexer, Token, TokenKind};
pub use optimizer::{optimize, ArithStatus, FoldStats};
pub use parser::{parse, Ast, BinaryOp, Literal, NodeId, NodeKind, ParseOutcome, UnaryOp};
pub use types::{resolve, ElementType, NumericKind, Type, TypeContext};
pub use vm::{InterpretOutcome, Vm};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_smoke() {
        let mut vm = Vm::new();
        vm.capture_output();
        let outcome = vm.interpret("mut x = 10\nx = x + 5\nprint(x)", "smoke.orus");
        assert!(outcome.is_ok(), "outcome: {:?}", outcome);
        assert_eq!(vm.take_output(), "15\n");
    }

    #[test]
    fn test_version_set() {
        assert!(!VERSION.is_empty());
    }
}
