//! Precedence-climbing (Pratt) parser.
//!
//! The Pratt table maps each token kind to `{prefix_fn, infix_fn,
//! precedence}`. The parser keeps a two-token lookahead window over the
//! scanned stream and recovers from errors in panic mode, resynchronising on
//! statement-leading keywords, newlines, and end of file.
//!
//! `parse` always returns the (possibly partial) tree together with the
//! diagnostics it collected; callers must not generate code from a tree that
//! had errors.

pub mod ast;

pub use ast::{Ast, BinaryOp, FieldDecl, Literal, Node, NodeId, NodeKind, Param, UnaryOp};

use crate::error::{Diagnostic, DiagnosticList, ErrorCode, SourceLocation};
use crate::lexer::{Lexer, Token, TokenKind};

/// Result of a parse: the arena-backed tree plus everything that went wrong.
#[derive(Debug)]
pub struct ParseOutcome {
    pub ast: Ast,
    pub diagnostics: Vec<Diagnostic>,
}

impl ParseOutcome {
    pub fn has_errors(&self) -> bool {
        !self.diagnostics.is_empty()
    }
}

/// Parse a complete source file.
pub fn parse(source: &str) -> ParseOutcome {
    let tokens = Lexer::new(source).scan_all();
    let mut parser = Parser::new(tokens);
    parser.program();
    ParseOutcome {
        ast: parser.ast,
        diagnostics: parser.diagnostics.into_vec(),
    }
}

/// Binding power ladder, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment,
    Ternary,
    Or,
    And,
    Equality,
    Comparison,
    BitOr,
    BitXor,
    BitAnd,
    Shift,
    Term,
    Factor,
    Unary,
    Call,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Ternary,
            Precedence::Ternary => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::BitOr,
            Precedence::BitOr => Precedence::BitXor,
            Precedence::BitXor => Precedence::BitAnd,
            Precedence::BitAnd => Precedence::Shift,
            Precedence::Shift => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Call,
        }
    }
}

type PrefixFn<'src> = fn(&mut Parser<'src>, bool) -> Option<NodeId>;
type InfixFn<'src> = fn(&mut Parser<'src>, NodeId, bool) -> Option<NodeId>;

struct ParseRule<'src> {
    prefix: Option<PrefixFn<'src>>,
    infix: Option<InfixFn<'src>>,
    precedence: Precedence,
}

fn rule<'src>(kind: TokenKind) -> ParseRule<'src> {
    use TokenKind::*;
    let (prefix, infix, precedence): (Option<PrefixFn<'src>>, Option<InfixFn<'src>>, Precedence) =
        match kind {
            LeftParen => (Some(Parser::grouping), Some(Parser::call), Precedence::Call),
            LeftBracket => (Some(Parser::array_literal), Some(Parser::index), Precedence::Call),
            Dot => (None, Some(Parser::field), Precedence::Call),
            As => (None, Some(Parser::cast), Precedence::Call),
            Minus => (Some(Parser::unary), Some(Parser::binary), Precedence::Term),
            Plus => (None, Some(Parser::binary), Precedence::Term),
            Star | Slash | Percent => (None, Some(Parser::binary), Precedence::Factor),
            ShiftLeft | ShiftRight => (None, Some(Parser::binary), Precedence::Shift),
            Amp => (None, Some(Parser::binary), Precedence::BitAnd),
            Caret => (None, Some(Parser::binary), Precedence::BitXor),
            Pipe => (None, Some(Parser::binary), Precedence::BitOr),
            EqualEqual | BangEqual => (None, Some(Parser::binary), Precedence::Equality),
            Less | LessEqual | Greater | GreaterEqual => {
                (None, Some(Parser::binary), Precedence::Comparison)
            }
            AmpAmp => (None, Some(Parser::binary), Precedence::And),
            PipePipe => (None, Some(Parser::binary), Precedence::Or),
            Question => (None, Some(Parser::ternary), Precedence::Ternary),
            Bang => (Some(Parser::unary), None, Precedence::None),
            Int => (Some(Parser::int_literal), None, Precedence::None),
            Float => (Some(Parser::float_literal), None, Precedence::None),
            Str => (Some(Parser::string_literal), None, Precedence::None),
            True | False => (Some(Parser::bool_literal), None, Precedence::None),
            Nil => (Some(Parser::nil_literal), None, Precedence::None),
            Identifier => (Some(Parser::identifier), None, Precedence::None),
            _ => (None, None, Precedence::None),
        };
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

struct Parser<'src> {
    tokens: Vec<Token<'src>>,
    pos: usize,
    ast: Ast,
    diagnostics: DiagnosticList,
    panic_mode: bool,
}

impl<'src> Parser<'src> {
    fn new(tokens: Vec<Token<'src>>) -> Self {
        Self {
            tokens,
            pos: 0,
            ast: Ast::new(),
            diagnostics: DiagnosticList::new(),
            panic_mode: false,
        }
    }

    // ------------------------------------------------------------------
    // Token cursor (two-token lookahead)
    // ------------------------------------------------------------------

    fn peek(&self) -> Token<'src> {
        self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_next(&self) -> Token<'src> {
        self.tokens[(self.pos + 1).min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token<'src> {
        let token = self.peek();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        // Indentation layout is validated by the lexer; the grammar itself is
        // brace-delimited, so indent/dedent pairs pass through as trivia.
        while matches!(self.peek().kind, TokenKind::Indent | TokenKind::Dedent) {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> Option<Token<'src>> {
        if self.check(kind) {
            Some(self.advance())
        } else {
            self.error_at_current(ErrorCode::ExpectedToken, message);
            None
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(
            self.peek().kind,
            TokenKind::Newline | TokenKind::Indent | TokenKind::Dedent
        ) {
            self.advance();
        }
    }

    fn at_eof(&self) -> bool {
        self.check(TokenKind::Eof)
    }

    // ------------------------------------------------------------------
    // Diagnostics and recovery
    // ------------------------------------------------------------------

    fn error_at(&mut self, token: Token<'src>, code: ErrorCode, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.diagnostics
            .push(Diagnostic::error(code, token.location(), message));
    }

    fn error_at_current(&mut self, code: ErrorCode, message: &str) {
        let token = self.peek();
        self.error_at(token, code, message);
    }

    /// Panic-mode resynchronisation: discard tokens until a statement
    /// boundary.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.at_eof() {
            match self.peek().kind {
                TokenKind::Newline => {
                    self.advance();
                    return;
                }
                TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Fn
                | TokenKind::Return
                | TokenKind::Struct => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    /// Report a lexical error token in place and step past it.
    fn report_lexical(&mut self) {
        let token = self.peek();
        let code = match token.lexeme {
            "unterminated string" => ErrorCode::UnterminatedString,
            "invalid escape sequence" => ErrorCode::InvalidEscape,
            "malformed number" => ErrorCode::MalformedNumber,
            "inconsistent indentation" => ErrorCode::InconsistentIndentation,
            _ => ErrorCode::InvalidCharacter,
        };
        self.error_at(token, code, token.lexeme);
        self.advance();
    }

    // ------------------------------------------------------------------
    // Program and statements
    // ------------------------------------------------------------------

    fn program(&mut self) {
        self.skip_newlines();
        while !self.at_eof() {
            if self.check(TokenKind::Error) {
                self.report_lexical();
                self.synchronize();
                self.skip_newlines();
                continue;
            }
            if let Some(stmt) = self.declaration() {
                self.ast.roots.push(stmt);
            }
            if self.panic_mode {
                self.synchronize();
            }
            self.skip_newlines();
        }
    }

    fn declaration(&mut self) -> Option<NodeId> {
        match self.peek().kind {
            TokenKind::Let => self.let_statement(false),
            TokenKind::Mut => self.let_statement(true),
            TokenKind::Const => self.const_statement(),
            TokenKind::Static => self.static_statement(),
            TokenKind::Pub => {
                self.advance();
                if self.check(TokenKind::Fn) {
                    self.function_statement(true)
                } else {
                    self.error_at_current(ErrorCode::UnexpectedToken, "expected `fn` after `pub`");
                    None
                }
            }
            TokenKind::Fn => self.function_statement(false),
            TokenKind::Struct => self.struct_statement(),
            TokenKind::Impl => self.impl_statement(),
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::Break => {
                let token = self.advance();
                Some(self.ast.alloc(NodeKind::Break, token.location()))
            }
            TokenKind::Continue => {
                let token = self.advance();
                Some(self.ast.alloc(NodeKind::Continue, token.location()))
            }
            TokenKind::Import => self.import_statement(),
            TokenKind::Use => self.use_statement(),
            TokenKind::Try => self.try_statement(),
            TokenKind::Print => self.print_statement(),
            TokenKind::LeftBrace => {
                let loc = self.peek().location();
                let body = self.block()?;
                Some(self.ast.alloc(NodeKind::Block(body), loc))
            }
            _ => self.expression_statement(),
        }
    }

    /// `let [mut] name [: type] = expr`, or the `mut name = expr` shorthand.
    fn let_statement(&mut self, bare_mut: bool) -> Option<NodeId> {
        let keyword = self.advance();
        let mutable = bare_mut || self.matches(TokenKind::Mut);
        let name = self.consume(TokenKind::Identifier, "expected variable name")?;
        let type_annotation = if self.matches(TokenKind::Colon) {
            Some(
                self.consume(TokenKind::Identifier, "expected type name")?
                    .lexeme
                    .to_string(),
            )
        } else {
            None
        };
        let init = if self.matches(TokenKind::Equal) {
            Some(self.expression()?)
        } else {
            None
        };
        Some(self.ast.alloc(
            NodeKind::Let {
                name: name.lexeme.to_string(),
                mutable,
                type_annotation,
                init,
            },
            keyword.location(),
        ))
    }

    fn const_statement(&mut self) -> Option<NodeId> {
        let keyword = self.advance();
        let name = self.consume(TokenKind::Identifier, "expected constant name")?;
        self.consume(TokenKind::Equal, "expected `=` after constant name")?;
        let init = self.expression()?;
        Some(self.ast.alloc(
            NodeKind::Const {
                name: name.lexeme.to_string(),
                init,
            },
            keyword.location(),
        ))
    }

    fn static_statement(&mut self) -> Option<NodeId> {
        let keyword = self.advance();
        let mutable = self.matches(TokenKind::Mut);
        let name = self.consume(TokenKind::Identifier, "expected static name")?;
        self.consume(TokenKind::Equal, "expected `=` after static name")?;
        let init = self.expression()?;
        Some(self.ast.alloc(
            NodeKind::Static {
                name: name.lexeme.to_string(),
                mutable,
                init,
            },
            keyword.location(),
        ))
    }

    fn function_statement(&mut self, public: bool) -> Option<NodeId> {
        let keyword = self.advance();
        let name = self.consume(TokenKind::Identifier, "expected function name")?;
        self.consume(TokenKind::LeftParen, "expected `(` after function name")?;
        let mut params = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                let pname = self.consume(TokenKind::Identifier, "expected parameter name")?;
                self.consume(TokenKind::Colon, "expected `:` after parameter name")?;
                let ptype = self.consume(TokenKind::Identifier, "expected parameter type")?;
                params.push(Param {
                    name: pname.lexeme.to_string(),
                    type_name: ptype.lexeme.to_string(),
                    location: pname.location(),
                });
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected `)` after parameters")?;
        let return_type = if self.matches(TokenKind::Arrow) {
            Some(
                self.consume(TokenKind::Identifier, "expected return type")?
                    .lexeme
                    .to_string(),
            )
        } else {
            None
        };
        let body = self.block()?;
        Some(self.ast.alloc(
            NodeKind::Function {
                name: name.lexeme.to_string(),
                public,
                params,
                return_type,
                body,
            },
            keyword.location(),
        ))
    }

    fn struct_statement(&mut self) -> Option<NodeId> {
        let keyword = self.advance();
        let name = self.consume(TokenKind::Identifier, "expected struct name")?;
        self.consume(TokenKind::LeftBrace, "expected `{` after struct name")?;
        self.skip_newlines();
        let mut fields = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.at_eof() {
            let fname = self.consume(TokenKind::Identifier, "expected field name")?;
            self.consume(TokenKind::Colon, "expected `:` after field name")?;
            let ftype = self.consume(TokenKind::Identifier, "expected field type")?;
            fields.push(FieldDecl {
                name: fname.lexeme.to_string(),
                type_name: ftype.lexeme.to_string(),
            });
            if !self.matches(TokenKind::Comma) {
                self.skip_newlines();
                if self.check(TokenKind::RightBrace) {
                    break;
                }
            } else {
                self.skip_newlines();
            }
        }
        self.consume(TokenKind::RightBrace, "expected `}` after struct fields")?;
        Some(self.ast.alloc(
            NodeKind::StructDecl {
                name: name.lexeme.to_string(),
                fields,
            },
            keyword.location(),
        ))
    }

    fn impl_statement(&mut self) -> Option<NodeId> {
        let keyword = self.advance();
        let target = self.consume(TokenKind::Identifier, "expected type name after `impl`")?;
        self.consume(TokenKind::LeftBrace, "expected `{` after impl target")?;
        self.skip_newlines();
        let mut methods = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.at_eof() {
            let public = self.matches(TokenKind::Pub);
            if self.check(TokenKind::Fn) {
                if let Some(method) = self.function_statement(public) {
                    methods.push(method);
                }
            } else {
                self.error_at_current(ErrorCode::UnexpectedToken, "expected method in impl block");
                self.synchronize();
            }
            self.skip_newlines();
        }
        self.consume(TokenKind::RightBrace, "expected `}` after impl block")?;
        Some(self.ast.alloc(
            NodeKind::ImplBlock {
                target: target.lexeme.to_string(),
                methods,
            },
            keyword.location(),
        ))
    }

    fn if_statement(&mut self) -> Option<NodeId> {
        let keyword = self.advance();
        let condition = self.expression()?;
        let then_block = self.block()?;
        // An `elif`/`else` may start on the next line; the two-token window
        // lets us look past the terminator.
        if self.check(TokenKind::Newline)
            && matches!(self.peek_next().kind, TokenKind::Elif | TokenKind::Else)
        {
            self.advance();
        }
        let else_block = if self.check(TokenKind::Elif) {
            // `elif` nests as an `if` inside the else branch; rewrite the
            // keyword so the recursive call sees a normal header.
            self.tokens[self.pos].kind = TokenKind::If;
            let nested = self.if_statement()?;
            Some(vec![nested])
        } else if self.matches(TokenKind::Else) {
            Some(self.block()?)
        } else {
            None
        };
        Some(self.ast.alloc(
            NodeKind::If {
                condition,
                then_block,
                else_block,
            },
            keyword.location(),
        ))
    }

    fn while_statement(&mut self) -> Option<NodeId> {
        let keyword = self.advance();
        let condition = self.expression()?;
        let body = self.block()?;
        Some(self.ast.alloc(
            NodeKind::While { condition, body },
            keyword.location(),
        ))
    }

    /// `for x in start..end[:step] { ... }` or `for x in iterable { ... }`
    fn for_statement(&mut self) -> Option<NodeId> {
        let keyword = self.advance();
        let var = self.consume(TokenKind::Identifier, "expected loop variable")?;
        self.consume(TokenKind::In, "expected `in` after loop variable")?;
        let start = self.parse_precedence(Precedence::Or)?;
        if !self.check(TokenKind::DotDot) {
            let body = self.block()?;
            return Some(self.ast.alloc(
                NodeKind::ForEach {
                    var: var.lexeme.to_string(),
                    iterable: start,
                    body,
                },
                keyword.location(),
            ));
        }
        self.advance();
        let end = self.parse_precedence(Precedence::Or)?;
        let step = if self.matches(TokenKind::Colon) {
            Some(self.parse_precedence(Precedence::Or)?)
        } else {
            None
        };
        let body = self.block()?;
        Some(self.ast.alloc(
            NodeKind::For {
                var: var.lexeme.to_string(),
                start,
                end,
                step,
                body,
            },
            keyword.location(),
        ))
    }

    fn return_statement(&mut self) -> Option<NodeId> {
        let keyword = self.advance();
        let value = if matches!(
            self.peek().kind,
            TokenKind::Newline | TokenKind::RightBrace | TokenKind::Eof
        ) {
            None
        } else {
            Some(self.expression()?)
        };
        Some(self.ast.alloc(NodeKind::Return(value), keyword.location()))
    }

    fn import_statement(&mut self) -> Option<NodeId> {
        let keyword = self.advance();
        let path = self.consume(TokenKind::Str, "expected module path string")?;
        let raw = path.lexeme;
        let trimmed = raw
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(raw);
        Some(
            self.ast
                .alloc(NodeKind::Import(trimmed.to_string()), keyword.location()),
        )
    }

    fn use_statement(&mut self) -> Option<NodeId> {
        let keyword = self.advance();
        let first = self.consume(TokenKind::Identifier, "expected path after `use`")?;
        let mut path = first.lexeme.to_string();
        while self.matches(TokenKind::Dot) {
            let part = self.consume(TokenKind::Identifier, "expected path segment")?;
            path.push('.');
            path.push_str(part.lexeme);
        }
        Some(self.ast.alloc(NodeKind::Use(path), keyword.location()))
    }

    fn try_statement(&mut self) -> Option<NodeId> {
        let keyword = self.advance();
        let body = self.block()?;
        self.skip_newlines();
        self.consume(TokenKind::Catch, "expected `catch` after try block")?;
        let catch_name = self.consume(TokenKind::Identifier, "expected catch binding name")?;
        let catch_body = self.block()?;
        Some(self.ast.alloc(
            NodeKind::Try {
                body,
                catch_name: catch_name.lexeme.to_string(),
                catch_body,
            },
            keyword.location(),
        ))
    }

    fn print_statement(&mut self) -> Option<NodeId> {
        let keyword = self.advance();
        self.consume(TokenKind::LeftParen, "expected `(` after print")?;
        let mut args = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                args.push(self.expression()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected `)` after print arguments")?;
        Some(self.ast.alloc(NodeKind::Print(args), keyword.location()))
    }

    fn expression_statement(&mut self) -> Option<NodeId> {
        let loc = self.peek().location();
        let expr = self.expression()?;
        Some(self.ast.alloc(NodeKind::ExprStmt(expr), loc))
    }

    /// Brace-delimited statement list.
    fn block(&mut self) -> Option<Vec<NodeId>> {
        self.skip_newlines();
        self.consume(TokenKind::LeftBrace, "expected `{`")?;
        self.skip_newlines();
        let mut statements = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.at_eof() {
            if self.check(TokenKind::Error) {
                self.report_lexical();
                self.synchronize();
                self.skip_newlines();
                continue;
            }
            if let Some(stmt) = self.declaration() {
                statements.push(stmt);
            }
            if self.panic_mode {
                self.synchronize();
            }
            self.skip_newlines();
        }
        self.consume(TokenKind::RightBrace, "expected `}` to close block")?;
        Some(statements)
    }

    // ------------------------------------------------------------------
    // Expressions (Pratt core)
    // ------------------------------------------------------------------

    fn expression(&mut self) -> Option<NodeId> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> Option<NodeId> {
        if self.check(TokenKind::Error) {
            self.report_lexical();
            return None;
        }
        let token = self.peek();
        let prefix = match rule(token.kind).prefix {
            Some(f) => f,
            None => {
                self.error_at_current(
                    ErrorCode::UnexpectedToken,
                    &format!("unexpected `{}` in expression", token.kind),
                );
                return None;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        let mut node = prefix(self, can_assign)?;

        while precedence <= rule(self.peek().kind).precedence {
            let infix = match rule(self.peek().kind).infix {
                Some(f) => f,
                None => break,
            };
            node = infix(self, node, can_assign)?;
        }

        if can_assign && self.check(TokenKind::Equal) {
            let token = self.peek();
            self.error_at(token, ErrorCode::UnexpectedToken, "invalid assignment target");
            return None;
        }
        Some(node)
    }

    fn grouping(&mut self, _can_assign: bool) -> Option<NodeId> {
        self.advance();
        self.skip_newlines();
        let expr = self.expression()?;
        self.skip_newlines();
        self.consume(TokenKind::RightParen, "expected `)` after expression")?;
        Some(expr)
    }

    fn unary(&mut self, _can_assign: bool) -> Option<NodeId> {
        let token = self.advance();
        let op = match token.kind {
            TokenKind::Minus => UnaryOp::Negate,
            TokenKind::Bang => UnaryOp::Not,
            _ => unreachable!("unary rule on non-unary token"),
        };
        let operand = self.parse_precedence(Precedence::Unary)?;
        Some(
            self.ast
                .alloc(NodeKind::Unary { op, operand }, token.location()),
        )
    }

    fn binary(&mut self, lhs: NodeId, _can_assign: bool) -> Option<NodeId> {
        let token = self.advance();
        let op = match token.kind {
            TokenKind::Plus => BinaryOp::Add,
            TokenKind::Minus => BinaryOp::Sub,
            TokenKind::Star => BinaryOp::Mul,
            TokenKind::Slash => BinaryOp::Div,
            TokenKind::Percent => BinaryOp::Mod,
            TokenKind::EqualEqual => BinaryOp::Equal,
            TokenKind::BangEqual => BinaryOp::NotEqual,
            TokenKind::Less => BinaryOp::Less,
            TokenKind::LessEqual => BinaryOp::LessEqual,
            TokenKind::Greater => BinaryOp::Greater,
            TokenKind::GreaterEqual => BinaryOp::GreaterEqual,
            TokenKind::AmpAmp => BinaryOp::And,
            TokenKind::PipePipe => BinaryOp::Or,
            TokenKind::Amp => BinaryOp::BitAnd,
            TokenKind::Pipe => BinaryOp::BitOr,
            TokenKind::Caret => BinaryOp::BitXor,
            TokenKind::ShiftLeft => BinaryOp::Shl,
            TokenKind::ShiftRight => BinaryOp::Shr,
            _ => unreachable!("binary rule on non-binary token"),
        };
        let rhs = self.parse_precedence(rule(token.kind).precedence.next())?;
        Some(
            self.ast
                .alloc(NodeKind::Binary { op, lhs, rhs }, token.location()),
        )
    }

    fn ternary(&mut self, condition: NodeId, _can_assign: bool) -> Option<NodeId> {
        let token = self.advance();
        let then_value = self.expression()?;
        self.consume(TokenKind::Colon, "expected `:` in ternary expression")?;
        let else_value = self.parse_precedence(Precedence::Ternary)?;
        Some(self.ast.alloc(
            NodeKind::Ternary {
                condition,
                then_value,
                else_value,
            },
            token.location(),
        ))
    }

    fn cast(&mut self, value: NodeId, _can_assign: bool) -> Option<NodeId> {
        let token = self.advance();
        let target = self.consume(TokenKind::Identifier, "expected type name after `as`")?;
        Some(self.ast.alloc(
            NodeKind::Cast {
                value,
                target: target.lexeme.to_string(),
            },
            token.location(),
        ))
    }

    fn call(&mut self, callee: NodeId, _can_assign: bool) -> Option<NodeId> {
        let token = self.advance();
        let mut args = Vec::new();
        self.skip_newlines();
        if !self.check(TokenKind::RightParen) {
            loop {
                args.push(self.expression()?);
                self.skip_newlines();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.consume(TokenKind::RightParen, "expected `)` after arguments")?;
        Some(
            self.ast
                .alloc(NodeKind::Call { callee, args }, token.location()),
        )
    }

    fn index(&mut self, target: NodeId, can_assign: bool) -> Option<NodeId> {
        let token = self.advance();
        let index = self.expression()?;
        self.consume(TokenKind::RightBracket, "expected `]` after index")?;
        let node = self
            .ast
            .alloc(NodeKind::Index { target, index }, token.location());
        if can_assign && self.matches(TokenKind::Equal) {
            let value = self.expression()?;
            return Some(self.ast.alloc(
                NodeKind::Assign {
                    target: node,
                    value,
                },
                token.location(),
            ));
        }
        Some(node)
    }

    fn field(&mut self, target: NodeId, can_assign: bool) -> Option<NodeId> {
        let token = self.advance();
        let field = self.consume(TokenKind::Identifier, "expected field name after `.`")?;
        let node = self.ast.alloc(
            NodeKind::FieldAccess {
                target,
                field: field.lexeme.to_string(),
            },
            token.location(),
        );
        if can_assign && self.matches(TokenKind::Equal) {
            let value = self.expression()?;
            return Some(self.ast.alloc(
                NodeKind::Assign {
                    target: node,
                    value,
                },
                token.location(),
            ));
        }
        Some(node)
    }

    fn array_literal(&mut self, _can_assign: bool) -> Option<NodeId> {
        let token = self.advance();
        let mut elements = Vec::new();
        self.skip_newlines();
        if !self.check(TokenKind::RightBracket) {
            loop {
                elements.push(self.expression()?);
                self.skip_newlines();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.consume(TokenKind::RightBracket, "expected `]` after array elements")?;
        Some(
            self.ast
                .alloc(NodeKind::ArrayLiteral(elements), token.location()),
        )
    }

    fn identifier(&mut self, can_assign: bool) -> Option<NodeId> {
        let token = self.advance();
        let node = self.ast.alloc(
            NodeKind::Identifier(token.lexeme.to_string()),
            token.location(),
        );
        if can_assign && self.matches(TokenKind::Equal) {
            let value = self.expression()?;
            return Some(self.ast.alloc(
                NodeKind::Assign {
                    target: node,
                    value,
                },
                token.location(),
            ));
        }
        Some(node)
    }

    fn bool_literal(&mut self, _can_assign: bool) -> Option<NodeId> {
        let token = self.advance();
        let value = token.kind == TokenKind::True;
        Some(self.ast.alloc(
            NodeKind::Literal(Literal::Bool(value)),
            token.location(),
        ))
    }

    fn nil_literal(&mut self, _can_assign: bool) -> Option<NodeId> {
        let token = self.advance();
        Some(
            self.ast
                .alloc(NodeKind::Literal(Literal::Nil), token.location()),
        )
    }

    fn string_literal(&mut self, _can_assign: bool) -> Option<NodeId> {
        let token = self.advance();
        let raw = token.lexeme;
        let inner = &raw[1..raw.len().saturating_sub(1)];
        let mut text = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('\\') => text.push('\\'),
                    Some('"') => text.push('"'),
                    Some('0') => text.push('\0'),
                    _ => {
                        self.error_at(token, ErrorCode::InvalidEscape, "invalid escape sequence");
                        return None;
                    }
                }
            } else {
                text.push(c);
            }
        }
        Some(
            self.ast
                .alloc(NodeKind::Literal(Literal::Str(text)), token.location()),
        )
    }

    fn int_literal(&mut self, _can_assign: bool) -> Option<NodeId> {
        let token = self.advance();
        match parse_int_lexeme(token.lexeme) {
            Some(lit) => Some(self.ast.alloc(NodeKind::Literal(lit), token.location())),
            None => {
                self.error_at(token, ErrorCode::MalformedNumber, "malformed number");
                None
            }
        }
    }

    fn float_literal(&mut self, _can_assign: bool) -> Option<NodeId> {
        let token = self.advance();
        let digits: String = token
            .lexeme
            .trim_end_matches("f64")
            .chars()
            .filter(|c| *c != '_')
            .collect();
        match digits.parse::<f64>() {
            Ok(value) => Some(
                self.ast
                    .alloc(NodeKind::Literal(Literal::F64(value)), token.location()),
            ),
            Err(_) => {
                self.error_at(token, ErrorCode::MalformedNumber, "malformed number");
                None
            }
        }
    }
}

/// Interpret an integer lexeme, applying its type suffix. A suffix always
/// wins; an unsuffixed literal is `i32`, widening to `i64` only when the
/// value does not fit.
fn parse_int_lexeme(lexeme: &str) -> Option<Literal> {
    let (body, suffix) = split_int_suffix(lexeme);
    let clean: String = body.chars().filter(|c| *c != '_').collect();
    let (digits, radix) = if let Some(hex) = clean.strip_prefix("0x").or(clean.strip_prefix("0X")) {
        (hex.to_string(), 16)
    } else {
        (clean, 10)
    };

    match suffix {
        Some("i32") => i32::from_str_radix(&digits, radix).ok().map(Literal::I32),
        Some("i64") => i64::from_str_radix(&digits, radix).ok().map(Literal::I64),
        Some("u32") | Some("u") => u32::from_str_radix(&digits, radix).ok().map(Literal::U32),
        Some("u64") => u64::from_str_radix(&digits, radix).ok().map(Literal::U64),
        _ => {
            if let Ok(v) = i32::from_str_radix(&digits, radix) {
                Some(Literal::I32(v))
            } else {
                i64::from_str_radix(&digits, radix).ok().map(Literal::I64)
            }
        }
    }
}

fn split_int_suffix(lexeme: &str) -> (&str, Option<&str>) {
    for suffix in ["i32", "i64", "u32", "u64"] {
        if let Some(body) = lexeme.strip_suffix(suffix) {
            if !body.is_empty() {
                return (body, Some(suffix));
            }
        }
    }
    if let Some(body) = lexeme.strip_suffix('u') {
        if !body.is_empty() {
            return (body, Some("u"));
        }
    }
    (lexeme, None)
}
