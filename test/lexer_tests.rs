//! Scanner coverage: token classes, layout synthesis, and in-band errors.

use orus::lexer::{Lexer, TokenKind};

fn kinds(source: &str) -> Vec<TokenKind> {
    Lexer::new(source)
        .scan_all()
        .iter()
        .map(|t| t.kind)
        .collect()
}

// ============================================================================
// Token classes
// ============================================================================

#[test]
fn test_full_operator_set() {
    let ks = kinds("+ - * / % = == != < <= > >= ! & && | || ^ << >> ? : , . .. -> ( ) { } [ ]");
    assert!(!ks.contains(&TokenKind::Error));
    assert!(ks.contains(&TokenKind::Arrow));
    assert!(ks.contains(&TokenKind::DotDot));
    assert!(ks.contains(&TokenKind::ShiftLeft));
    assert!(ks.contains(&TokenKind::AmpAmp));
}

#[test]
fn test_every_keyword() {
    for (text, kind) in [
        ("let", TokenKind::Let),
        ("mut", TokenKind::Mut),
        ("const", TokenKind::Const),
        ("static", TokenKind::Static),
        ("pub", TokenKind::Pub),
        ("fn", TokenKind::Fn),
        ("struct", TokenKind::Struct),
        ("impl", TokenKind::Impl),
        ("if", TokenKind::If),
        ("elif", TokenKind::Elif),
        ("else", TokenKind::Else),
        ("while", TokenKind::While),
        ("for", TokenKind::For),
        ("in", TokenKind::In),
        ("return", TokenKind::Return),
        ("break", TokenKind::Break),
        ("continue", TokenKind::Continue),
        ("import", TokenKind::Import),
        ("use", TokenKind::Use),
        ("try", TokenKind::Try),
        ("catch", TokenKind::Catch),
        ("print", TokenKind::Print),
        ("true", TokenKind::True),
        ("false", TokenKind::False),
        ("nil", TokenKind::Nil),
        ("as", TokenKind::As),
    ] {
        assert_eq!(kinds(text)[0], kind, "keyword {}", text);
    }
}

#[test]
fn test_keyword_prefixes_are_identifiers() {
    for text in ["lets", "mutable", "structs", "iff", "forx", "print_all"] {
        assert_eq!(kinds(text)[0], TokenKind::Identifier, "{}", text);
    }
}

// ============================================================================
// Numbers
// ============================================================================

#[test]
fn test_numeric_shapes() {
    assert_eq!(kinds("0")[0], TokenKind::Int);
    assert_eq!(kinds("1_000_000")[0], TokenKind::Int);
    assert_eq!(kinds("0xdead_beef")[0], TokenKind::Int);
    assert_eq!(kinds("0XFF")[0], TokenKind::Int);
    assert_eq!(kinds("3.5")[0], TokenKind::Float);
    assert_eq!(kinds("1e10")[0], TokenKind::Float);
    assert_eq!(kinds("1E+3")[0], TokenKind::Float);
    assert_eq!(kinds("2.5e-3")[0], TokenKind::Float);
}

#[test]
fn test_all_suffix_forms() {
    let tokens = Lexer::new("1i32 2i64 3u32 4u64 5u 6f64 7.5f64").scan_all();
    assert_eq!(tokens[0].lexeme, "1i32");
    assert_eq!(tokens[1].lexeme, "2i64");
    assert_eq!(tokens[2].lexeme, "3u32");
    assert_eq!(tokens[3].lexeme, "4u64");
    assert_eq!(tokens[4].lexeme, "5u");
    assert_eq!(tokens[5].kind, TokenKind::Float);
    assert_eq!(tokens[5].lexeme, "6f64");
    assert_eq!(tokens[6].kind, TokenKind::Float);
    for t in &tokens[..7] {
        assert_ne!(t.kind, TokenKind::Error);
    }
}

#[test]
fn test_bare_hex_prefix_is_error() {
    assert_eq!(kinds("0x")[0], TokenKind::Error);
}

#[test]
fn test_range_endpoints_stay_integers() {
    assert_eq!(
        kinds("1..10"),
        vec![
            TokenKind::Int,
            TokenKind::DotDot,
            TokenKind::Int,
            TokenKind::Eof
        ]
    );
}

// ============================================================================
// Layout
// ============================================================================

#[test]
fn test_newlines_preserved_as_terminators() {
    let ks = kinds("a\nb\nc");
    let newlines = ks.iter().filter(|k| **k == TokenKind::Newline).count();
    assert_eq!(newlines, 2);
}

#[test]
fn test_nested_indentation() {
    let ks = kinds("a\n  b\n    c\n  d\ne");
    let indents = ks.iter().filter(|k| **k == TokenKind::Indent).count();
    let dedents = ks.iter().filter(|k| **k == TokenKind::Dedent).count();
    assert_eq!(indents, 2);
    assert_eq!(dedents, 2);
}

#[test]
fn test_blank_lines_do_not_change_indent() {
    let ks = kinds("a\n\n\n  b\n\nc");
    let indents = ks.iter().filter(|k| **k == TokenKind::Indent).count();
    assert_eq!(indents, 1);
}

#[test]
fn test_comment_only_line_ignored_for_layout() {
    let ks = kinds("a\n      // deep comment\nb");
    assert!(!ks.contains(&TokenKind::Indent));
    assert!(!ks.contains(&TokenKind::Error));
}

#[test]
fn test_inconsistent_dedent_is_error_token() {
    let ks = kinds("a\n        b\n    c");
    assert!(ks.contains(&TokenKind::Error));
}

#[test]
fn test_positions() {
    let tokens = Lexer::new("let x = 1\n  y").scan_all();
    assert_eq!((tokens[0].line, tokens[0].column), (1, 1));
    assert_eq!(tokens[1].lexeme, "x");
    assert_eq!((tokens[1].line, tokens[1].column), (1, 5));
    let y = tokens.iter().find(|t| t.lexeme == "y").unwrap();
    assert_eq!(y.line, 2);
}

// ============================================================================
// Strings and errors
// ============================================================================

#[test]
fn test_string_with_all_escapes() {
    let tokens = Lexer::new(r#""line\nTab\tQuote\"Back\\end""#).scan_all();
    assert_eq!(tokens[0].kind, TokenKind::Str);
}

#[test]
fn test_bad_escape_is_error() {
    let tokens = Lexer::new(r#""oops\q""#).scan_all();
    assert_eq!(tokens[0].kind, TokenKind::Error);
    assert_eq!(tokens[0].lexeme, "invalid escape sequence");
}

#[test]
fn test_invalid_character() {
    let tokens = Lexer::new("let $ = 1").scan_all();
    assert!(tokens
        .iter()
        .any(|t| t.kind == TokenKind::Error && t.lexeme == "invalid character"));
}

#[test]
fn test_block_comment_nesting() {
    assert_eq!(
        kinds("1 /* outer /* inner */ still outer */ 2"),
        vec![TokenKind::Int, TokenKind::Int, TokenKind::Eof]
    );
}

#[test]
fn test_empty_source_is_just_eof() {
    assert_eq!(kinds(""), vec![TokenKind::Eof]);
}
