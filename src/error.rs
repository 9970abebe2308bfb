//! Error taxonomy for the compiler and VM.
//!
//! Compile-stage problems are collected as [`Diagnostic`] values and returned
//! as a list; nothing downstream of the stage that recorded them runs.
//! Runtime problems become an error object in the VM heap and surface through
//! `Vm::last_error`.

use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// A position in a source file. Lines and columns are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Stable error codes.
///
/// E1xxx are variable/scoping errors, E2xxx are type errors. Lexical and
/// syntactic errors carry E0xxx codes; runtime errors use E9xxx.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // Lexical
    InvalidCharacter = 1,
    UnterminatedString = 2,
    InvalidEscape = 3,
    MalformedNumber = 4,
    InconsistentIndentation = 5,

    // Syntactic
    UnexpectedToken = 101,
    ExpectedToken = 102,

    // Semantic: variables
    UndefinedVariable = 1010,
    VariableRedefinition = 1011,
    ScopeViolation = 1012,
    InvalidVariableName = 1014,
    MutableRequired = 1015,
    UninitializedVariable = 1018,

    // Semantic: types
    TypeMismatch = 2001,
    IncompatibleTypes = 2002,
    UndefinedType = 2003,
    MixedArithmetic = 2004,
    InvalidCast = 2005,
    TypeAnnotationRequired = 2006,
    UnsupportedOperation = 2007,
    ImmutableAssignment = 2008,

    // Runtime
    DivisionByZero = 9001,
    IntegerOverflow = 9002,
    IndexOutOfBounds = 9003,
    TypeGuardFailure = 9004,
    StackOverflow = 9005,
    UnhandledThrow = 9006,
}

impl ErrorCode {
    /// Short title used when rendering the diagnostic header.
    pub fn title(&self) -> &'static str {
        match self {
            ErrorCode::InvalidCharacter => "invalid character",
            ErrorCode::UnterminatedString => "unterminated string",
            ErrorCode::InvalidEscape => "invalid escape sequence",
            ErrorCode::MalformedNumber => "malformed number",
            ErrorCode::InconsistentIndentation => "inconsistent indentation",
            ErrorCode::UnexpectedToken => "unexpected token",
            ErrorCode::ExpectedToken => "expected a different token",
            ErrorCode::UndefinedVariable => "undefined variable",
            ErrorCode::VariableRedefinition => "variable redefined",
            ErrorCode::ScopeViolation => "variable not visible in this scope",
            ErrorCode::InvalidVariableName => "invalid variable name",
            ErrorCode::MutableRequired => "mutable binding required",
            ErrorCode::UninitializedVariable => "use of uninitialized variable",
            ErrorCode::TypeMismatch => "type mismatch",
            ErrorCode::IncompatibleTypes => "incompatible types",
            ErrorCode::UndefinedType => "undefined type",
            ErrorCode::MixedArithmetic => "mixed-type arithmetic",
            ErrorCode::InvalidCast => "invalid cast",
            ErrorCode::TypeAnnotationRequired => "type annotation required",
            ErrorCode::UnsupportedOperation => "unsupported operation",
            ErrorCode::ImmutableAssignment => "assignment to immutable binding",
            ErrorCode::DivisionByZero => "division by zero",
            ErrorCode::IntegerOverflow => "integer overflow",
            ErrorCode::IndexOutOfBounds => "index out of bounds",
            ErrorCode::TypeGuardFailure => "type guard failure",
            ErrorCode::StackOverflow => "stack overflow",
            ErrorCode::UnhandledThrow => "unhandled error",
        }
    }

    /// Code string as printed in diagnostics, e.g. `E2004`.
    pub fn as_str(&self) -> String {
        format!("E{:04}", *self as u16)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Error,
    Warning,
}

/// A single compile-stage diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Diagnostic {
    pub code: ErrorCode,
    pub severity: Severity,
    pub location: SourceLocation,
    pub message: String,
    pub help: Option<String>,
    pub note: Option<String>,
}

impl Diagnostic {
    pub fn error(code: ErrorCode, location: SourceLocation, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: Severity::Error,
            location,
            message: message.into(),
            help: None,
            note: None,
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] at {}: {}",
            self.code.title(),
            self.code,
            self.location,
            self.message
        )?;
        if let Some(help) = &self.help {
            write!(f, " (help: {})", help)?;
        }
        if let Some(note) = &self.note {
            write!(f, " (note: {})", note)?;
        }
        Ok(())
    }
}

/// Accumulates diagnostics across lexing, parsing, and type resolution.
///
/// Duplicate reports are dropped: the same code at the same location with
/// identical text is recorded once no matter how many passes notice it.
#[derive(Debug, Default)]
pub struct DiagnosticList {
    entries: Vec<Diagnostic>,
    seen: HashSet<Diagnostic>,
}

impl DiagnosticList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diag: Diagnostic) {
        if self.seen.insert(diag.clone()) {
            self.entries.push(diag);
        }
    }

    pub fn has_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.entries
    }
}

/// Compile failure: the collected diagnostics.
#[derive(Debug, Error)]
#[error("compilation failed with {} error(s)", .diagnostics.len())]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileError {
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        Self { diagnostics }
    }
}

/// Runtime error kinds surfaced by the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeErrorKind {
    DivisionByZero,
    IntegerOverflow,
    IndexOutOfBounds,
    TypeGuard,
    StackOverflow,
    UnhandledThrow,
    Io,
}

impl RuntimeErrorKind {
    pub fn code(&self) -> ErrorCode {
        match self {
            RuntimeErrorKind::DivisionByZero => ErrorCode::DivisionByZero,
            RuntimeErrorKind::IntegerOverflow => ErrorCode::IntegerOverflow,
            RuntimeErrorKind::IndexOutOfBounds => ErrorCode::IndexOutOfBounds,
            RuntimeErrorKind::TypeGuard => ErrorCode::TypeGuardFailure,
            RuntimeErrorKind::StackOverflow => ErrorCode::StackOverflow,
            RuntimeErrorKind::UnhandledThrow | RuntimeErrorKind::Io => ErrorCode::UnhandledThrow,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            RuntimeErrorKind::DivisionByZero => "division by zero",
            RuntimeErrorKind::IntegerOverflow => "integer overflow",
            RuntimeErrorKind::IndexOutOfBounds => "array index out of bounds",
            RuntimeErrorKind::TypeGuard => "value does not have the expected type",
            RuntimeErrorKind::StackOverflow => "call frames exhausted",
            RuntimeErrorKind::UnhandledThrow => "unhandled error",
            RuntimeErrorKind::Io => "i/o error",
        }
    }
}

/// A runtime failure with its source position.
#[derive(Debug, Clone, Error)]
#[error("{} at {location}: {message}", .kind.message())]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub location: SourceLocation,
    pub message: String,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, location: SourceLocation) -> Self {
        Self {
            kind,
            location,
            message: kind.message().to_string(),
        }
    }

    pub fn with_message(
        kind: RuntimeErrorKind,
        location: SourceLocation,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            location,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_strings() {
        assert_eq!(ErrorCode::MixedArithmetic.as_str(), "E2004");
        assert_eq!(ErrorCode::ImmutableAssignment.as_str(), "E2008");
        assert_eq!(ErrorCode::UndefinedVariable.as_str(), "E1010");
    }

    #[test]
    fn test_diagnostic_dedup() {
        let mut list = DiagnosticList::new();
        let loc = SourceLocation::new(3, 7);
        list.push(Diagnostic::error(ErrorCode::TypeMismatch, loc, "i32 vs i64"));
        list.push(Diagnostic::error(ErrorCode::TypeMismatch, loc, "i32 vs i64"));
        assert_eq!(list.len(), 1);

        // Different message at the same spot is a separate diagnostic
        list.push(Diagnostic::error(ErrorCode::TypeMismatch, loc, "i32 vs u32"));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_has_errors() {
        let mut list = DiagnosticList::new();
        assert!(!list.has_errors());
        list.push(Diagnostic::error(
            ErrorCode::UndefinedVariable,
            SourceLocation::default(),
            "x",
        ));
        assert!(list.has_errors());
    }
}
