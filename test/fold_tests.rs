//! Folding properties: a fold must agree with runtime evaluation, and a
//! refused fold must surface as the matching runtime error.

use orus::optimizer::{checked_i32, checked_i64, checked_u32, checked_u64, ArithStatus};
use orus::parser::BinaryOp;
use orus::vm::{InterpretOutcome, Vm};
use orus::RuntimeErrorKind;

fn run(source: &str) -> (InterpretOutcome, String) {
    let mut vm = Vm::new();
    vm.capture_output();
    let outcome = vm.interpret(source, "fold_test.orus");
    let output = vm.take_output();
    (outcome, output)
}

fn run_ok(source: &str) -> String {
    let (outcome, output) = run(source);
    assert!(outcome.is_ok(), "failed: {:?}", outcome);
    output
}

// ============================================================================
// Fold/runtime agreement
// ============================================================================

#[test]
fn test_folded_and_runtime_results_agree() {
    // The left side folds at compile time; the right side forces runtime
    // evaluation through a mutable variable. Outputs must match.
    for (constant, runtime) in [
        ("print(7 + 35)", "mut a = 7\nprint(a + 35)"),
        ("print(9 * -3)", "mut a = 9\nprint(a * -3)"),
        ("print(100 / 7)", "mut a = 100\nprint(a / 7)"),
        ("print(100 % 7)", "mut a = 100\nprint(a % 7)"),
        ("print(2 < 3)", "mut a = 2\nprint(a < 3)"),
        ("print(10u64 / 3u64)", "mut a = 10u64\nprint(a / 3u64)"),
        ("print(1.5 * 4.0)", "mut a = 1.5\nprint(a * 4.0)"),
    ] {
        assert_eq!(run_ok(constant), run_ok(runtime), "case {}", constant);
    }
}

#[test]
fn test_refused_fold_becomes_runtime_error() {
    // Overflow refused at compile time must raise at runtime, never wrap.
    let (outcome, _) = run("print(2147483647 + 1)");
    match outcome {
        InterpretOutcome::RuntimeError(err) => {
            assert_eq!(err.kind, RuntimeErrorKind::IntegerOverflow)
        }
        other => panic!("expected overflow, got {:?}", other),
    }

    let (outcome, _) = run("print(1 / 0)");
    match outcome {
        InterpretOutcome::RuntimeError(err) => {
            assert_eq!(err.kind, RuntimeErrorKind::DivisionByZero)
        }
        other => panic!("expected division error, got {:?}", other),
    }
}

#[test]
fn test_unsigned_underflow_raises() {
    let (outcome, _) = run("print(0u64 - 1u64)");
    match outcome {
        InterpretOutcome::RuntimeError(err) => {
            assert_eq!(err.kind, RuntimeErrorKind::IntegerOverflow)
        }
        other => panic!("expected underflow error, got {:?}", other),
    }
}

#[test]
fn test_int_min_cases() {
    // INT_MIN / -1 is an overflow at runtime too.
    let (outcome, _) = run("mut a = -2147483647\na = a - 1\nprint(a / -1)");
    match outcome {
        InterpretOutcome::RuntimeError(err) => {
            assert_eq!(err.kind, RuntimeErrorKind::IntegerOverflow)
        }
        other => panic!("expected overflow, got {:?}", other),
    }
    // INT_MIN % -1 is defined as 0.
    assert_eq!(run_ok("mut a = -2147483647\na = a - 1\nprint(a % -1)"), "0\n");
}

#[test]
fn test_float_special_values_run_fine() {
    // The fold refuses non-finite results; at runtime IEEE semantics apply.
    assert_eq!(run_ok("print(1.0 / 0.0)"), "inf\n");
    assert_eq!(run_ok("mut a = 0.0\nprint(a / a)"), "NaN\n");
}

// ============================================================================
// Checked-arithmetic table
// ============================================================================

#[test]
fn test_status_matrix() {
    assert_eq!(checked_i32(1, BinaryOp::Add, 2), (Some(3), ArithStatus::Success));
    assert_eq!(
        checked_i32(i32::MAX, BinaryOp::Add, 1).1,
        ArithStatus::Overflow
    );
    assert_eq!(
        checked_i32(i32::MIN, BinaryOp::Sub, 1).1,
        ArithStatus::Underflow
    );
    assert_eq!(
        checked_i32(5, BinaryOp::Div, 0).1,
        ArithStatus::DivByZero
    );
    assert_eq!(
        checked_i64(i64::MIN, BinaryOp::Div, -1).1,
        ArithStatus::Overflow
    );
    assert_eq!(
        checked_u32(0, BinaryOp::Sub, 1).1,
        ArithStatus::Underflow
    );
    assert_eq!(
        checked_u64(u64::MAX, BinaryOp::Mul, 2).1,
        ArithStatus::Overflow
    );
    // Non-arithmetic operators are a domain error for the checked table.
    assert_eq!(
        checked_i32(1, BinaryOp::BitAnd, 2).1,
        ArithStatus::DomainError
    );
}

// ============================================================================
// Statistics
// ============================================================================

#[test]
fn test_fold_statistics_accumulate() {
    let mut outcome = orus::parse("print((1 + 2) * (3 + 4))");
    assert!(outcome.diagnostics.is_empty());
    let stats = orus::optimize(&mut outcome.ast);
    assert_eq!(stats.constants_folded, 3);
    assert_eq!(stats.expressions_folded, 3);
    assert_eq!(stats.nodes_eliminated, 6);
}
