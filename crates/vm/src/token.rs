//! Token module for the Erkao VM.
//!
//! This module defines the token stream contract between the lexer and the
//! single-pass compiler. Every compiled byte carries one of these tokens in
//! the chunk's side table, which is what diagnostics point at.

use hashbrown::HashMap;
use once_cell::sync::Lazy;

/// The kind of a source token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Single-character punctuation
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Semicolon,
    Colon,
    Question,

    // One- or two-character operators
    QuestionDot,
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Plus,
    Minus,
    Star,
    Slash,

    // Literals
    Identifier,
    Number,
    /// A complete string literal (or the final segment of an interpolated one)
    Str,
    /// A string segment terminated by `${`; the expression tokens follow,
    /// then either another `Interpolation` or the closing `Str` segment
    Interpolation,

    // Keywords
    And,
    As,
    Break,
    Case,
    Class,
    Const,
    Continue,
    Default,
    Else,
    Enum,
    Export,
    False,
    For,
    Foreach,
    From,
    Fun,
    If,
    Import,
    In,
    Let,
    Match,
    Null,
    Or,
    Private,
    Return,
    Switch,
    This,
    Throw,
    True,
    Try,
    While,
    Yield,

    /// End of input
    Eof,
}

impl TokenKind {
    /// Returns true for keywords that begin a statement; panic-mode error
    /// recovery resynchronises at these.
    pub fn starts_statement(self) -> bool {
        matches!(
            self,
            TokenKind::Break
                | TokenKind::Class
                | TokenKind::Const
                | TokenKind::Continue
                | TokenKind::Enum
                | TokenKind::Export
                | TokenKind::For
                | TokenKind::Foreach
                | TokenKind::Fun
                | TokenKind::If
                | TokenKind::Import
                | TokenKind::Let
                | TokenKind::Match
                | TokenKind::Private
                | TokenKind::Return
                | TokenKind::Switch
                | TokenKind::Throw
                | TokenKind::Try
                | TokenKind::While
        )
    }
}

/// A lexed token: kind plus source coordinates.
///
/// Tokens borrow nothing; the lexeme is recovered from the source buffer
/// through the byte span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    /// What the token is
    pub kind: TokenKind,
    /// Byte offset of the lexeme in the source buffer
    pub span_start: u32,
    /// Byte length of the lexeme
    pub span_len: u32,
    /// 1-based source line
    pub line: u32,
    /// 1-based source column
    pub column: u32,
}

impl Token {
    /// Returns the lexeme slice out of the source this token was lexed from.
    pub fn lexeme<'a>(&self, source: &'a str) -> &'a str {
        let start = self.span_start as usize;
        let end = (self.span_start + self.span_len) as usize;
        &source[start..end.min(source.len())]
    }

    /// A synthetic token for generated code with no source position.
    pub fn synthetic() -> Self {
        Self {
            kind: TokenKind::Eof,
            span_start: 0,
            span_len: 0,
            line: 0,
            column: 0,
        }
    }
}

/// Keyword recognition table, pure data shared by the lexer and the
/// did-you-mean suggestion machinery.
pub static KEYWORDS: Lazy<HashMap<&'static str, TokenKind>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert("and", TokenKind::And);
    map.insert("as", TokenKind::As);
    map.insert("break", TokenKind::Break);
    map.insert("case", TokenKind::Case);
    map.insert("class", TokenKind::Class);
    map.insert("const", TokenKind::Const);
    map.insert("continue", TokenKind::Continue);
    map.insert("default", TokenKind::Default);
    map.insert("else", TokenKind::Else);
    map.insert("enum", TokenKind::Enum);
    map.insert("export", TokenKind::Export);
    map.insert("false", TokenKind::False);
    map.insert("for", TokenKind::For);
    map.insert("foreach", TokenKind::Foreach);
    map.insert("from", TokenKind::From);
    map.insert("fun", TokenKind::Fun);
    map.insert("if", TokenKind::If);
    map.insert("import", TokenKind::Import);
    map.insert("in", TokenKind::In);
    map.insert("let", TokenKind::Let);
    map.insert("match", TokenKind::Match);
    map.insert("null", TokenKind::Null);
    map.insert("or", TokenKind::Or);
    map.insert("private", TokenKind::Private);
    map.insert("return", TokenKind::Return);
    map.insert("switch", TokenKind::Switch);
    map.insert("this", TokenKind::This);
    map.insert("throw", TokenKind::Throw);
    map.insert("true", TokenKind::True);
    map.insert("try", TokenKind::Try);
    map.insert("while", TokenKind::While);
    map.insert("yield", TokenKind::Yield);
    map
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_table_is_complete() {
        assert_eq!(KEYWORDS.len(), 32);
        assert_eq!(KEYWORDS.get("foreach"), Some(&TokenKind::Foreach));
        assert_eq!(KEYWORDS.get("yield"), Some(&TokenKind::Yield));
        assert_eq!(KEYWORDS.get("function"), None);
    }

    #[test]
    fn test_lexeme_slicing() {
        let source = "let answer = 42;";
        let token = Token {
            kind: TokenKind::Identifier,
            span_start: 4,
            span_len: 6,
            line: 1,
            column: 5,
        };
        assert_eq!(token.lexeme(source), "answer");
    }

    #[test]
    fn test_statement_starters() {
        assert!(TokenKind::Let.starts_statement());
        assert!(TokenKind::Import.starts_statement());
        assert!(!TokenKind::Else.starts_statement());
        assert!(!TokenKind::Identifier.starts_statement());
    }
}
