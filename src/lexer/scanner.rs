//! Hand-written scanner with indentation tracking.
//!
//! Produces a flat token stream over the source text. Indentation is kept on
//! a stack: a deeper leading-whitespace level opens with `Indent`, returning
//! to a shallower level emits one `Dedent` per closed level, and a level that
//! matches no open level is an inconsistent-indentation error. Newlines are
//! real tokens because they terminate statements.

use super::token::{Token, TokenKind};
use std::collections::VecDeque;

pub struct Lexer<'src> {
    source: &'src str,
    bytes: &'src [u8],
    /// Byte offset of the current token's first character.
    start: usize,
    /// Byte offset of the next unconsumed character.
    current: usize,
    line: u32,
    column: u32,
    start_column: u32,
    /// Open indentation levels; always begins with 0.
    indent_stack: Vec<u32>,
    /// Dedents (and the occasional error) waiting to be handed out.
    pending: VecDeque<Token<'src>>,
    /// True until the first token of a line has been produced.
    at_line_start: bool,
    finished: bool,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            start: 0,
            current: 0,
            line: 1,
            column: 1,
            start_column: 1,
            indent_stack: vec![0],
            pending: VecDeque::new(),
            at_line_start: true,
            finished: false,
        }
    }

    /// Scan the entire source into a token vector, ending with `Eof`.
    pub fn scan_all(mut self) -> Vec<Token<'src>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }

    /// Produce the next token.
    pub fn next_token(&mut self) -> Token<'src> {
        if let Some(tok) = self.pending.pop_front() {
            return tok;
        }
        if self.finished {
            return Token::synthetic(TokenKind::Eof, self.line, self.column);
        }

        if self.at_line_start {
            if let Some(tok) = self.handle_indentation() {
                return tok;
            }
        }

        self.skip_inline_trivia();
        self.start = self.current;
        self.start_column = self.column;

        if self.is_at_end() {
            return self.finish();
        }

        let c = self.advance();
        match c {
            b'\n' => {
                let tok = self.make(TokenKind::Newline);
                self.line += 1;
                self.column = 1;
                self.at_line_start = true;
                tok
            }
            b'(' => self.make(TokenKind::LeftParen),
            b')' => self.make(TokenKind::RightParen),
            b'{' => self.make(TokenKind::LeftBrace),
            b'}' => self.make(TokenKind::RightBrace),
            b'[' => self.make(TokenKind::LeftBracket),
            b']' => self.make(TokenKind::RightBracket),
            b',' => self.make(TokenKind::Comma),
            b'+' => self.make(TokenKind::Plus),
            b'%' => self.make(TokenKind::Percent),
            b'^' => self.make(TokenKind::Caret),
            b'?' => self.make(TokenKind::Question),
            b':' => self.make(TokenKind::Colon),
            b'.' => {
                if self.match_byte(b'.') {
                    self.make(TokenKind::DotDot)
                } else {
                    self.make(TokenKind::Dot)
                }
            }
            b'-' => {
                if self.match_byte(b'>') {
                    self.make(TokenKind::Arrow)
                } else {
                    self.make(TokenKind::Minus)
                }
            }
            b'*' => self.make(TokenKind::Star),
            b'/' => self.make(TokenKind::Slash),
            b'=' => {
                if self.match_byte(b'=') {
                    self.make(TokenKind::EqualEqual)
                } else {
                    self.make(TokenKind::Equal)
                }
            }
            b'!' => {
                if self.match_byte(b'=') {
                    self.make(TokenKind::BangEqual)
                } else {
                    self.make(TokenKind::Bang)
                }
            }
            b'<' => {
                if self.match_byte(b'=') {
                    self.make(TokenKind::LessEqual)
                } else if self.match_byte(b'<') {
                    self.make(TokenKind::ShiftLeft)
                } else {
                    self.make(TokenKind::Less)
                }
            }
            b'>' => {
                if self.match_byte(b'=') {
                    self.make(TokenKind::GreaterEqual)
                } else if self.match_byte(b'>') {
                    self.make(TokenKind::ShiftRight)
                } else {
                    self.make(TokenKind::Greater)
                }
            }
            b'&' => {
                if self.match_byte(b'&') {
                    self.make(TokenKind::AmpAmp)
                } else {
                    self.make(TokenKind::Amp)
                }
            }
            b'|' => {
                if self.match_byte(b'|') {
                    self.make(TokenKind::PipePipe)
                } else {
                    self.make(TokenKind::Pipe)
                }
            }
            b'"' => self.string(),
            b'0'..=b'9' => self.number(c),
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.identifier(),
            _ => self.error_token("invalid character"),
        }
    }

    // ------------------------------------------------------------------
    // Line structure
    // ------------------------------------------------------------------

    /// Measure the leading whitespace of the line now starting and emit any
    /// INDENT/DEDENT tokens it implies. Blank and comment-only lines do not
    /// affect the indentation stack.
    fn handle_indentation(&mut self) -> Option<Token<'src>> {
        self.at_line_start = false;

        let mut width: u32 = 0;
        loop {
            match self.peek() {
                Some(b' ') => {
                    width += 1;
                    self.advance();
                }
                Some(b'\t') => {
                    // Tabs count as a fixed 4-column step.
                    width += 4;
                    self.advance();
                }
                _ => break,
            }
        }

        // A line holding nothing (or only a comment) leaves the stack alone.
        match self.peek() {
            None | Some(b'\n') => return None,
            Some(b'/') if self.peek_at(1) == Some(b'/') => return None,
            _ => {}
        }

        let top = *self.indent_stack.last().unwrap_or(&0);
        if width > top {
            self.indent_stack.push(width);
            return Some(Token::synthetic(TokenKind::Indent, self.line, 1));
        }
        if width < top {
            while let Some(&level) = self.indent_stack.last() {
                if level <= width {
                    break;
                }
                self.indent_stack.pop();
                self.pending
                    .push_back(Token::synthetic(TokenKind::Dedent, self.line, 1));
            }
            if self.indent_stack.last() != Some(&width) {
                // Landed between two open levels.
                self.pending.push_back(Token {
                    kind: TokenKind::Error,
                    lexeme: "inconsistent indentation",
                    line: self.line,
                    column: 1,
                });
            }
            return self.pending.pop_front();
        }
        None
    }

    /// Consume spaces, tabs, and comments between tokens on a line.
    fn skip_inline_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') => {
                    self.advance();
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    self.advance();
                    self.advance();
                    let mut depth = 1u32;
                    while depth > 0 {
                        match self.peek() {
                            None => return,
                            Some(b'*') if self.peek_at(1) == Some(b'/') => {
                                self.advance();
                                self.advance();
                                depth -= 1;
                            }
                            Some(b'/') if self.peek_at(1) == Some(b'*') => {
                                self.advance();
                                self.advance();
                                depth += 1;
                            }
                            Some(b'\n') => {
                                self.advance();
                                self.line += 1;
                                self.column = 1;
                            }
                            Some(_) => {
                                self.advance();
                            }
                        }
                    }
                }
                _ => break,
            }
        }
    }

    /// Close the stream: drain open indentation levels, then Eof.
    fn finish(&mut self) -> Token<'src> {
        self.finished = true;
        while self.indent_stack.len() > 1 {
            self.indent_stack.pop();
            self.pending
                .push_back(Token::synthetic(TokenKind::Dedent, self.line, self.column));
        }
        self.pending
            .push_back(Token::synthetic(TokenKind::Eof, self.line, self.column));
        self.pending.pop_front().expect("eof was just queued")
    }

    // ------------------------------------------------------------------
    // Literals and names
    // ------------------------------------------------------------------

    fn string(&mut self) -> Token<'src> {
        loop {
            match self.peek() {
                None | Some(b'\n') => return self.error_token("unterminated string"),
                Some(b'"') => {
                    self.advance();
                    return self.make(TokenKind::Str);
                }
                Some(b'\\') => {
                    self.advance();
                    match self.peek() {
                        Some(b'n') | Some(b't') | Some(b'\\') | Some(b'"') | Some(b'0') => {
                            self.advance();
                        }
                        _ => return self.error_token("invalid escape sequence"),
                    }
                }
                Some(_) => {
                    self.advance();
                }
            }
        }
    }

    fn number(&mut self, first: u8) -> Token<'src> {
        // Hex form: 0x... with optional `_` separators.
        if first == b'0' && matches!(self.peek(), Some(b'x') | Some(b'X')) {
            self.advance();
            let mut digits = 0;
            while let Some(c) = self.peek() {
                match c {
                    b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                        digits += 1;
                        self.advance();
                    }
                    b'_' => {
                        self.advance();
                    }
                    _ => break,
                }
            }
            if digits == 0 {
                return self.error_token("malformed number");
            }
            self.consume_int_suffix();
            return self.make(TokenKind::Int);
        }

        while matches!(self.peek(), Some(b'0'..=b'9') | Some(b'_')) {
            self.advance();
        }

        let mut is_float = false;
        // A fractional part only if the dot is followed by a digit; `0..5`
        // must stay two integer endpoints around a range token.
        if self.peek() == Some(b'.') && matches!(self.peek_at(1), Some(b'0'..=b'9')) {
            is_float = true;
            self.advance();
            while matches!(self.peek(), Some(b'0'..=b'9') | Some(b'_')) {
                self.advance();
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            let mut look = 1;
            if matches!(self.peek_at(1), Some(b'+') | Some(b'-')) {
                look = 2;
            }
            if matches!(self.peek_at(look), Some(b'0'..=b'9')) {
                is_float = true;
                self.advance();
                if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                    self.advance();
                }
                while matches!(self.peek(), Some(b'0'..=b'9') | Some(b'_')) {
                    self.advance();
                }
            }
        }

        if is_float {
            // Only the f64 suffix is valid on a float literal.
            if self.lookahead_is("f64") {
                for _ in 0..3 {
                    self.advance();
                }
            }
            return self.make(TokenKind::Float);
        }

        // f64 suffix on an integer shape promotes the token to float.
        if self.lookahead_is("f64") {
            for _ in 0..3 {
                self.advance();
            }
            return self.make(TokenKind::Float);
        }
        self.consume_int_suffix();
        self.make(TokenKind::Int)
    }

    /// Consume a trailing `i32|i64|u32|u64|u` type suffix if present.
    fn consume_int_suffix(&mut self) {
        for suffix in ["i32", "i64", "u32", "u64"] {
            if self.lookahead_is(suffix) {
                for _ in 0..suffix.len() {
                    self.advance();
                }
                return;
            }
        }
        // Bare `u` is shorthand for u32, as long as it is not the start of a
        // longer identifier glued to the number.
        if self.peek() == Some(b'u') && !Self::is_ident_byte(self.peek_at(1)) {
            self.advance();
        }
    }

    fn lookahead_is(&self, text: &str) -> bool {
        let rest = &self.bytes[self.current..];
        rest.starts_with(text.as_bytes())
            && !Self::is_ident_byte(rest.get(text.len()).copied())
    }

    fn is_ident_byte(b: Option<u8>) -> bool {
        matches!(b, Some(b'a'..=b'z') | Some(b'A'..=b'Z') | Some(b'0'..=b'9') | Some(b'_'))
    }

    fn identifier(&mut self) -> Token<'src> {
        while Self::is_ident_byte(self.peek()) {
            self.advance();
        }
        self.make(self.identifier_kind())
    }

    /// Keyword recognition: switch on the first character, then compare the
    /// remaining bytes once.
    fn identifier_kind(&self) -> TokenKind {
        let text = &self.source[self.start..self.current];
        let rest = |offset: usize, tail: &str, kind: TokenKind| -> TokenKind {
            if text.len() == offset + tail.len() && &text[offset..] == tail {
                kind
            } else {
                TokenKind::Identifier
            }
        };

        match text.as_bytes()[0] {
            b'a' => rest(1, "s", TokenKind::As),
            b'b' => rest(1, "reak", TokenKind::Break),
            b'c' => {
                if text.len() > 1 {
                    match text.as_bytes()[1] {
                        b'o' => {
                            if text == "const" {
                                TokenKind::Const
                            } else {
                                rest(2, "ntinue", TokenKind::Continue)
                            }
                        }
                        b'a' => rest(2, "tch", TokenKind::Catch),
                        _ => TokenKind::Identifier,
                    }
                } else {
                    TokenKind::Identifier
                }
            }
            b'e' => {
                if text.len() > 2 && &text[..2] == "el" {
                    match text.as_bytes()[2] {
                        b'i' => rest(3, "f", TokenKind::Elif),
                        b's' => rest(3, "e", TokenKind::Else),
                        _ => TokenKind::Identifier,
                    }
                } else {
                    TokenKind::Identifier
                }
            }
            b'f' => {
                if text.len() > 1 {
                    match text.as_bytes()[1] {
                        b'n' => rest(2, "", TokenKind::Fn),
                        b'o' => rest(2, "r", TokenKind::For),
                        b'a' => rest(2, "lse", TokenKind::False),
                        _ => TokenKind::Identifier,
                    }
                } else {
                    TokenKind::Identifier
                }
            }
            b'i' => {
                if text.len() > 1 {
                    match text.as_bytes()[1] {
                        b'f' => rest(2, "", TokenKind::If),
                        b'n' => rest(2, "", TokenKind::In),
                        b'm' => {
                            if text == "impl" {
                                TokenKind::Impl
                            } else {
                                rest(2, "port", TokenKind::Import)
                            }
                        }
                        _ => TokenKind::Identifier,
                    }
                } else {
                    TokenKind::Identifier
                }
            }
            b'l' => rest(1, "et", TokenKind::Let),
            b'm' => rest(1, "ut", TokenKind::Mut),
            b'n' => rest(1, "il", TokenKind::Nil),
            b'p' => {
                if text.len() > 1 {
                    match text.as_bytes()[1] {
                        b'u' => rest(2, "b", TokenKind::Pub),
                        b'r' => rest(2, "int", TokenKind::Print),
                        _ => TokenKind::Identifier,
                    }
                } else {
                    TokenKind::Identifier
                }
            }
            b'r' => rest(1, "eturn", TokenKind::Return),
            b's' => {
                if text.len() > 2 && &text[..2] == "st" {
                    match text.as_bytes()[2] {
                        b'r' => rest(3, "uct", TokenKind::Struct),
                        b'a' => rest(3, "tic", TokenKind::Static),
                        _ => TokenKind::Identifier,
                    }
                } else {
                    TokenKind::Identifier
                }
            }
            b't' => {
                if text.len() > 1 {
                    match text.as_bytes()[1] {
                        b'r' => {
                            if text == "try" {
                                TokenKind::Try
                            } else {
                                rest(2, "ue", TokenKind::True)
                            }
                        }
                        _ => TokenKind::Identifier,
                    }
                } else {
                    TokenKind::Identifier
                }
            }
            b'u' => rest(1, "se", TokenKind::Use),
            b'w' => rest(1, "hile", TokenKind::While),
            _ => TokenKind::Identifier,
        }
    }

    // ------------------------------------------------------------------
    // Cursor primitives
    // ------------------------------------------------------------------

    fn is_at_end(&self) -> bool {
        self.current >= self.bytes.len()
    }

    fn advance(&mut self) -> u8 {
        let c = self.bytes[self.current];
        self.current += 1;
        self.column += 1;
        c
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.current).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.current + offset).copied()
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn make(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
            column: self.start_column,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Error,
            lexeme: message,
            line: self.line,
            column: self.start_column,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source).scan_all().iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_simple_expression() {
        assert_eq!(
            kinds("1 + 2 * 3"),
            vec![
                TokenKind::Int,
                TokenKind::Plus,
                TokenKind::Int,
                TokenKind::Star,
                TokenKind::Int,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_newline_is_a_token() {
        assert_eq!(
            kinds("let x = 1\nprint(x)"),
            vec![
                TokenKind::Let,
                TokenKind::Identifier,
                TokenKind::Equal,
                TokenKind::Int,
                TokenKind::Newline,
                TokenKind::Print,
                TokenKind::LeftParen,
                TokenKind::Identifier,
                TokenKind::RightParen,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_indent_dedent() {
        let ks = kinds("if x\n    y\nz");
        assert_eq!(
            ks,
            vec![
                TokenKind::If,
                TokenKind::Identifier,
                TokenKind::Newline,
                TokenKind::Indent,
                TokenKind::Identifier,
                TokenKind::Newline,
                TokenKind::Dedent,
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_multiple_dedents() {
        let ks = kinds("a\n  b\n    c\nd");
        let dedents = ks.iter().filter(|k| **k == TokenKind::Dedent).count();
        assert_eq!(dedents, 2);
    }

    #[test]
    fn test_inconsistent_indent_is_error() {
        let ks = kinds("a\n    b\n  c");
        assert!(ks.contains(&TokenKind::Error));
    }

    #[test]
    fn test_dedents_flushed_at_eof() {
        let ks = kinds("a\n  b");
        assert_eq!(ks.last(), Some(&TokenKind::Eof));
        assert!(ks.contains(&TokenKind::Dedent));
    }

    #[test]
    fn test_number_forms() {
        assert_eq!(kinds("1_000"), vec![TokenKind::Int, TokenKind::Eof]);
        assert_eq!(kinds("0xFF_EC"), vec![TokenKind::Int, TokenKind::Eof]);
        assert_eq!(kinds("3.25"), vec![TokenKind::Float, TokenKind::Eof]);
        assert_eq!(kinds("1e9"), vec![TokenKind::Float, TokenKind::Eof]);
        assert_eq!(kinds("2.5e-3"), vec![TokenKind::Float, TokenKind::Eof]);
    }

    #[test]
    fn test_suffixes_stay_in_lexeme() {
        let tokens = Lexer::new("42u64 7i64 1f64 9u").scan_all();
        assert_eq!(tokens[0].kind, TokenKind::Int);
        assert_eq!(tokens[0].lexeme, "42u64");
        assert_eq!(tokens[1].lexeme, "7i64");
        assert_eq!(tokens[2].kind, TokenKind::Float);
        assert_eq!(tokens[2].lexeme, "1f64");
        assert_eq!(tokens[3].lexeme, "9u");
    }

    #[test]
    fn test_range_is_not_a_float() {
        assert_eq!(
            kinds("0..5"),
            vec![TokenKind::Int, TokenKind::DotDot, TokenKind::Int, TokenKind::Eof]
        );
    }

    #[test]
    fn test_string_escapes() {
        let tokens = Lexer::new(r#""a\n\t\\\"b""#).scan_all();
        assert_eq!(tokens[0].kind, TokenKind::Str);
    }

    #[test]
    fn test_unterminated_string() {
        let tokens = Lexer::new("\"abc").scan_all();
        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(tokens[0].lexeme, "unterminated string");
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            kinds("1 // trailing\n/* block\nspanning */ 2"),
            vec![TokenKind::Int, TokenKind::Newline, TokenKind::Int, TokenKind::Eof]
        );
    }

    #[test]
    fn test_keywords() {
        assert_eq!(kinds("let")[0], TokenKind::Let);
        assert_eq!(kinds("letx")[0], TokenKind::Identifier);
        assert_eq!(kinds("elif")[0], TokenKind::Elif);
        assert_eq!(kinds("struct")[0], TokenKind::Struct);
        assert_eq!(kinds("static")[0], TokenKind::Static);
        assert_eq!(kinds("try")[0], TokenKind::Try);
        assert_eq!(kinds("true")[0], TokenKind::True);
    }

    #[test]
    fn test_two_char_operators() {
        assert_eq!(
            kinds("a << b >> c && d || e"),
            vec![
                TokenKind::Identifier,
                TokenKind::ShiftLeft,
                TokenKind::Identifier,
                TokenKind::ShiftRight,
                TokenKind::Identifier,
                TokenKind::AmpAmp,
                TokenKind::Identifier,
                TokenKind::PipePipe,
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
    }
}
