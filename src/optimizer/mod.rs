//! Typed-AST optimizer: bottom-up constant folding.
//!
//! Walks the tree post-order and rewrites `binary(lit, op, lit)` nodes into
//! literals in place. Integer arithmetic is checked: a fold only happens on
//! [`ArithStatus::Success`], otherwise the node is left for the VM to
//! evaluate (and to raise the matching runtime error). Floating-point folds
//! are refused when the result is NaN or infinite. `&&`/`||` fold with
//! short-circuit semantics, so a literal controlling operand decides the
//! expression even when the other side is not constant.

use crate::parser::{Ast, BinaryOp, Literal, NodeId, NodeKind, UnaryOp};
use tracing::debug;

/// Outcome of a checked arithmetic step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithStatus {
    Success,
    Overflow,
    Underflow,
    DivByZero,
    DomainError,
}

/// Counters accumulated over one folding pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldStats {
    /// Literal results materialized.
    pub constants_folded: usize,
    /// Expression nodes rewritten (binary, unary, ternary).
    pub expressions_folded: usize,
    /// Child nodes left unreferenced by rewrites.
    pub nodes_eliminated: usize,
}

/// Run the folding pass over the whole tree.
pub fn optimize(ast: &mut Ast) -> FoldStats {
    let mut stats = FoldStats::default();
    let roots = ast.roots.clone();
    for root in roots {
        fold_node(ast, root, &mut stats);
    }
    debug!(
        constants = stats.constants_folded,
        expressions = stats.expressions_folded,
        eliminated = stats.nodes_eliminated,
        "constant folding pass complete"
    );
    stats
}

fn fold_node(ast: &mut Ast, id: NodeId, stats: &mut FoldStats) {
    match ast.kind(id).clone() {
        NodeKind::Binary { op, lhs, rhs } => {
            fold_node(ast, lhs, stats);
            fold_node(ast, rhs, stats);
            try_fold_binary(ast, id, op, lhs, rhs, stats);
        }
        NodeKind::Unary { op, operand } => {
            fold_node(ast, operand, stats);
            try_fold_unary(ast, id, op, operand, stats);
        }
        NodeKind::Ternary {
            condition,
            then_value,
            else_value,
        } => {
            fold_node(ast, condition, stats);
            fold_node(ast, then_value, stats);
            fold_node(ast, else_value, stats);
            if let NodeKind::Literal(Literal::Bool(cond)) = ast.kind(condition) {
                let taken = if *cond { then_value } else { else_value };
                let replacement = ast.kind(taken).clone();
                ast.replace_kind(id, replacement);
                stats.expressions_folded += 1;
                stats.nodes_eliminated += 2;
            }
        }
        NodeKind::Cast { value, .. } => fold_node(ast, value, stats),
        NodeKind::Call { callee, args } => {
            fold_node(ast, callee, stats);
            for arg in args {
                fold_node(ast, arg, stats);
            }
        }
        NodeKind::Index { target, index } => {
            fold_node(ast, target, stats);
            fold_node(ast, index, stats);
        }
        NodeKind::FieldAccess { target, .. } => fold_node(ast, target, stats),
        NodeKind::ArrayLiteral(elements) => {
            for e in elements {
                fold_node(ast, e, stats);
            }
        }
        NodeKind::Assign { target, value } => {
            fold_node(ast, target, stats);
            fold_node(ast, value, stats);
        }
        NodeKind::Let { init, .. } => {
            if let Some(init) = init {
                fold_node(ast, init, stats);
            }
        }
        NodeKind::Const { init, .. } | NodeKind::Static { init, .. } => {
            fold_node(ast, init, stats);
        }
        NodeKind::Function { body, .. } => {
            for stmt in body {
                fold_node(ast, stmt, stats);
            }
        }
        NodeKind::ImplBlock { methods, .. } => {
            for m in methods {
                fold_node(ast, m, stats);
            }
        }
        NodeKind::If {
            condition,
            then_block,
            else_block,
        } => {
            fold_node(ast, condition, stats);
            for stmt in then_block {
                fold_node(ast, stmt, stats);
            }
            if let Some(else_block) = else_block {
                for stmt in else_block {
                    fold_node(ast, stmt, stats);
                }
            }
        }
        NodeKind::While { condition, body } => {
            fold_node(ast, condition, stats);
            for stmt in body {
                fold_node(ast, stmt, stats);
            }
        }
        NodeKind::For {
            start,
            end,
            step,
            body,
            ..
        } => {
            fold_node(ast, start, stats);
            fold_node(ast, end, stats);
            if let Some(step) = step {
                fold_node(ast, step, stats);
            }
            for stmt in body {
                fold_node(ast, stmt, stats);
            }
        }
        NodeKind::ForEach { iterable, body, .. } => {
            fold_node(ast, iterable, stats);
            for stmt in body {
                fold_node(ast, stmt, stats);
            }
        }
        NodeKind::Return(Some(value)) => fold_node(ast, value, stats),
        NodeKind::Try {
            body, catch_body, ..
        } => {
            for stmt in body {
                fold_node(ast, stmt, stats);
            }
            for stmt in catch_body {
                fold_node(ast, stmt, stats);
            }
        }
        NodeKind::Print(args) => {
            for arg in args {
                fold_node(ast, arg, stats);
            }
        }
        NodeKind::Block(body) => {
            for stmt in body {
                fold_node(ast, stmt, stats);
            }
        }
        NodeKind::ExprStmt(expr) => fold_node(ast, expr, stats),
        NodeKind::Literal(_)
        | NodeKind::Identifier(_)
        | NodeKind::StructDecl { .. }
        | NodeKind::Return(None)
        | NodeKind::Break
        | NodeKind::Continue
        | NodeKind::Import(_)
        | NodeKind::Use(_) => {}
    }
}

fn try_fold_binary(
    ast: &mut Ast,
    id: NodeId,
    op: BinaryOp,
    lhs: NodeId,
    rhs: NodeId,
    stats: &mut FoldStats,
) {
    // Short-circuit folds only need a literal controlling operand.
    if op.is_logical() {
        if let NodeKind::Literal(Literal::Bool(l)) = ast.kind(lhs) {
            let l = *l;
            let replacement = match (op, l) {
                // The other side would never run.
                (BinaryOp::And, false) => NodeKind::Literal(Literal::Bool(false)),
                (BinaryOp::Or, true) => NodeKind::Literal(Literal::Bool(true)),
                // The expression is exactly the other side.
                _ => ast.kind(rhs).clone(),
            };
            let folded_to_literal = matches!(replacement, NodeKind::Literal(_));
            ast.replace_kind(id, replacement);
            stats.expressions_folded += 1;
            stats.nodes_eliminated += if folded_to_literal { 2 } else { 1 };
            if folded_to_literal {
                stats.constants_folded += 1;
            }
            return;
        }
        return;
    }

    let (NodeKind::Literal(l), NodeKind::Literal(r)) = (ast.kind(lhs), ast.kind(rhs)) else {
        return;
    };
    let Some(folded) = fold_literals(op, l, r) else {
        return;
    };
    ast.replace_kind(id, NodeKind::Literal(folded));
    stats.constants_folded += 1;
    stats.expressions_folded += 1;
    stats.nodes_eliminated += 2;
}

fn try_fold_unary(ast: &mut Ast, id: NodeId, op: UnaryOp, operand: NodeId, stats: &mut FoldStats) {
    let NodeKind::Literal(lit) = ast.kind(operand) else {
        return;
    };
    let folded = match (op, lit) {
        (UnaryOp::Negate, Literal::I32(v)) => v.checked_neg().map(Literal::I32),
        (UnaryOp::Negate, Literal::I64(v)) => v.checked_neg().map(Literal::I64),
        (UnaryOp::Negate, Literal::F64(v)) => Some(Literal::F64(-v)),
        (UnaryOp::Not, Literal::Bool(v)) => Some(Literal::Bool(!v)),
        _ => None,
    };
    if let Some(folded) = folded {
        ast.replace_kind(id, NodeKind::Literal(folded));
        stats.constants_folded += 1;
        stats.expressions_folded += 1;
        stats.nodes_eliminated += 1;
    }
}

/// Fold two literals of the same type, or refuse.
fn fold_literals(op: BinaryOp, l: &Literal, r: &Literal) -> Option<Literal> {
    use Literal::*;
    match (l, r) {
        (I32(a), I32(b)) => fold_i32(op, *a, *b),
        (I64(a), I64(b)) => fold_i64(op, *a, *b),
        (U32(a), U32(b)) => fold_u32(op, *a, *b),
        (U64(a), U64(b)) => fold_u64(op, *a, *b),
        (F64(a), F64(b)) => fold_f64(op, *a, *b),
        (Bool(a), Bool(b)) => match op {
            BinaryOp::Equal => Some(Bool(a == b)),
            BinaryOp::NotEqual => Some(Bool(a != b)),
            _ => None,
        },
        (Str(a), Str(b)) => match op {
            BinaryOp::Add => Some(Str(format!("{}{}", a, b))),
            BinaryOp::Equal => Some(Bool(a == b)),
            BinaryOp::NotEqual => Some(Bool(a != b)),
            _ => None,
        },
        // Mixed operand types never fold; the resolver reports them.
        _ => None,
    }
}

macro_rules! signed_arith {
    ($name:ident, $ty:ty, $lit:ident) => {
        pub fn $name(a: $ty, op: BinaryOp, b: $ty) -> (Option<$ty>, ArithStatus) {
            match op {
                BinaryOp::Add => match a.checked_add(b) {
                    Some(v) => (Some(v), ArithStatus::Success),
                    None if b >= 0 => (None, ArithStatus::Overflow),
                    None => (None, ArithStatus::Underflow),
                },
                BinaryOp::Sub => match a.checked_sub(b) {
                    Some(v) => (Some(v), ArithStatus::Success),
                    None if b <= 0 => (None, ArithStatus::Overflow),
                    None => (None, ArithStatus::Underflow),
                },
                BinaryOp::Mul => match a.checked_mul(b) {
                    Some(v) => (Some(v), ArithStatus::Success),
                    None => (None, ArithStatus::Overflow),
                },
                BinaryOp::Div => {
                    if b == 0 {
                        (None, ArithStatus::DivByZero)
                    } else if a == <$ty>::MIN && b == -1 {
                        // The one quotient that does not fit.
                        (None, ArithStatus::Overflow)
                    } else {
                        (Some(a / b), ArithStatus::Success)
                    }
                }
                BinaryOp::Mod => {
                    if b == 0 {
                        (None, ArithStatus::DivByZero)
                    } else if a == <$ty>::MIN && b == -1 {
                        // Hardware would fault; the remainder is defined as 0.
                        (Some(0), ArithStatus::Success)
                    } else {
                        (Some(a % b), ArithStatus::Success)
                    }
                }
                _ => (None, ArithStatus::DomainError),
            }
        }
    };
}

macro_rules! unsigned_arith {
    ($name:ident, $ty:ty) => {
        pub fn $name(a: $ty, op: BinaryOp, b: $ty) -> (Option<$ty>, ArithStatus) {
            match op {
                BinaryOp::Add => match a.checked_add(b) {
                    Some(v) => (Some(v), ArithStatus::Success),
                    None => (None, ArithStatus::Overflow),
                },
                BinaryOp::Sub => match a.checked_sub(b) {
                    Some(v) => (Some(v), ArithStatus::Success),
                    None => (None, ArithStatus::Underflow),
                },
                BinaryOp::Mul => match a.checked_mul(b) {
                    Some(v) => (Some(v), ArithStatus::Success),
                    None => (None, ArithStatus::Overflow),
                },
                BinaryOp::Div => {
                    if b == 0 {
                        (None, ArithStatus::DivByZero)
                    } else {
                        (Some(a / b), ArithStatus::Success)
                    }
                }
                BinaryOp::Mod => {
                    if b == 0 {
                        (None, ArithStatus::DivByZero)
                    } else {
                        (Some(a % b), ArithStatus::Success)
                    }
                }
                _ => (None, ArithStatus::DomainError),
            }
        }
    };
}

signed_arith!(checked_i32, i32, I32);
signed_arith!(checked_i64, i64, I64);
unsigned_arith!(checked_u32, u32);
unsigned_arith!(checked_u64, u64);

macro_rules! int_fold {
    ($name:ident, $ty:ty, $lit:ident, $checked:ident) => {
        fn $name(op: BinaryOp, a: $ty, b: $ty) -> Option<Literal> {
            if op.is_arithmetic() {
                let (value, status) = $checked(a, op, b);
                return match status {
                    ArithStatus::Success => value.map(Literal::$lit),
                    // Refused: the VM evaluates it and raises the error.
                    _ => None,
                };
            }
            if op.is_comparison() {
                return Some(Literal::Bool(match op {
                    BinaryOp::Equal => a == b,
                    BinaryOp::NotEqual => a != b,
                    BinaryOp::Less => a < b,
                    BinaryOp::LessEqual => a <= b,
                    BinaryOp::Greater => a > b,
                    BinaryOp::GreaterEqual => a >= b,
                    _ => unreachable!(),
                }));
            }
            if op.is_bitwise() {
                return match op {
                    BinaryOp::BitAnd => Some(Literal::$lit(a & b)),
                    BinaryOp::BitOr => Some(Literal::$lit(a | b)),
                    BinaryOp::BitXor => Some(Literal::$lit(a ^ b)),
                    BinaryOp::Shl => {
                        let shift: u32 = b.try_into().ok()?;
                        a.checked_shl(shift).map(Literal::$lit)
                    }
                    BinaryOp::Shr => {
                        let shift: u32 = b.try_into().ok()?;
                        a.checked_shr(shift).map(Literal::$lit)
                    }
                    _ => None,
                };
            }
            None
        }
    };
}

int_fold!(fold_i32, i32, I32, checked_i32);
int_fold!(fold_i64, i64, I64, checked_i64);
int_fold!(fold_u32, u32, U32, checked_u32);
int_fold!(fold_u64, u64, U64, checked_u64);

fn fold_f64(op: BinaryOp, a: f64, b: f64) -> Option<Literal> {
    if op.is_arithmetic() {
        let result = match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Mod => a % b,
            _ => unreachable!(),
        };
        // NaN or infinity aborts the fold.
        if !result.is_finite() {
            return None;
        }
        return Some(Literal::F64(result));
    }
    if op.is_comparison() {
        return Some(Literal::Bool(match op {
            BinaryOp::Equal => a == b,
            BinaryOp::NotEqual => a != b,
            BinaryOp::Less => a < b,
            BinaryOp::LessEqual => a <= b,
            BinaryOp::Greater => a > b,
            BinaryOp::GreaterEqual => a >= b,
            _ => unreachable!(),
        }));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn fold_source(source: &str) -> (Ast, FoldStats) {
        let mut outcome = parse(source);
        assert!(outcome.diagnostics.is_empty());
        let stats = optimize(&mut outcome.ast);
        (outcome.ast, stats)
    }

    fn root_print_arg(ast: &Ast) -> &NodeKind {
        let NodeKind::Print(args) = ast.kind(ast.roots[0]) else {
            panic!("expected print at root");
        };
        ast.kind(args[0])
    }

    #[test]
    fn test_fold_arithmetic() {
        let (ast, stats) = fold_source("print(1 + 2 * 3)");
        assert_eq!(*root_print_arg(&ast), NodeKind::Literal(Literal::I32(7)));
        assert_eq!(stats.constants_folded, 2);
    }

    #[test]
    fn test_overflow_refuses_fold() {
        let (ast, stats) = fold_source("print(2147483647 + 1)");
        assert!(matches!(root_print_arg(&ast), NodeKind::Binary { .. }));
        assert_eq!(stats.constants_folded, 0);
    }

    #[test]
    fn test_div_by_zero_refuses_fold() {
        let (ast, _) = fold_source("print(1 / 0)");
        assert!(matches!(root_print_arg(&ast), NodeKind::Binary { .. }));
    }

    #[test]
    fn test_int_min_div_minus_one() {
        let (value, status) = checked_i32(i32::MIN, BinaryOp::Div, -1);
        assert_eq!(status, ArithStatus::Overflow);
        assert_eq!(value, None);
    }

    #[test]
    fn test_int_min_mod_minus_one_is_zero() {
        let (value, status) = checked_i32(i32::MIN, BinaryOp::Mod, -1);
        assert_eq!(status, ArithStatus::Success);
        assert_eq!(value, Some(0));
        let (value, status) = checked_i64(i64::MIN, BinaryOp::Mod, -1);
        assert_eq!(status, ArithStatus::Success);
        assert_eq!(value, Some(0));
    }

    #[test]
    fn test_unsigned_underflow() {
        let (_, status) = checked_u32(1, BinaryOp::Sub, 2);
        assert_eq!(status, ArithStatus::Underflow);
    }

    #[test]
    fn test_float_fold() {
        let (ast, _) = fold_source("print(1.5 + 2.5)");
        assert_eq!(*root_print_arg(&ast), NodeKind::Literal(Literal::F64(4.0)));
    }

    #[test]
    fn test_float_infinity_refuses_fold() {
        let (ast, _) = fold_source("print(1.0 / 0.0)");
        assert!(matches!(root_print_arg(&ast), NodeKind::Binary { .. }));
    }

    #[test]
    fn test_short_circuit_and() {
        // `false && x` folds even though `x` is not constant.
        let (ast, _) = fold_source("mut x = true\nprint(false && x)");
        let NodeKind::Print(args) = ast.kind(ast.roots[1]) else {
            panic!();
        };
        assert_eq!(
            *ast.kind(args[0]),
            NodeKind::Literal(Literal::Bool(false))
        );
    }

    #[test]
    fn test_short_circuit_or() {
        let (ast, _) = fold_source("mut x = false\nprint(true || x)");
        let NodeKind::Print(args) = ast.kind(ast.roots[1]) else {
            panic!();
        };
        assert_eq!(*ast.kind(args[0]), NodeKind::Literal(Literal::Bool(true)));
    }

    #[test]
    fn test_comparison_fold() {
        let (ast, _) = fold_source("print(2 < 3)");
        assert_eq!(*root_print_arg(&ast), NodeKind::Literal(Literal::Bool(true)));
    }

    #[test]
    fn test_suffixed_fold_keeps_type() {
        let (ast, _) = fold_source("print(2u64 + 3u64)");
        assert_eq!(*root_print_arg(&ast), NodeKind::Literal(Literal::U64(5)));
    }

    #[test]
    fn test_nested_statement_folding() {
        let (ast, stats) = fold_source("while 1 + 1 == 2 { print(2 + 2) }");
        assert!(stats.constants_folded >= 2);
        let NodeKind::While { condition, .. } = ast.kind(ast.roots[0]) else {
            panic!();
        };
        assert_eq!(
            *ast.kind(*condition),
            NodeKind::Literal(Literal::Bool(true))
        );
    }

    #[test]
    fn test_unary_fold() {
        let (ast, _) = fold_source("print(-(3))");
        assert_eq!(*root_print_arg(&ast), NodeKind::Literal(Literal::I32(-3)));
    }

    #[test]
    fn test_ternary_fold() {
        let (ast, _) = fold_source("print(true ? 1 : 2)");
        assert_eq!(*root_print_arg(&ast), NodeKind::Literal(Literal::I32(1)));
    }
}
