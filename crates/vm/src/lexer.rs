//! Lexer module for the Erkao VM.
//!
//! This module turns a source buffer into the token stream the single-pass
//! compiler consumes. String interpolation is lexed Wren-style: each segment
//! ending in `${` becomes an [`TokenKind::Interpolation`] token, the
//! expression tokens follow, and the closing segment arrives as a plain
//! [`TokenKind::Str`].

use crate::error::CompileDiagnostic;
use crate::token::{Token, TokenKind, KEYWORDS};

/// Lexes a complete source buffer.
///
/// On success the returned stream always ends with a single `Eof` token.
/// Any malformed token is fatal to compilation; scanning continues past the
/// first failure so that all lex errors are reported in one batch.
pub fn lex(source: &str) -> Result<Vec<Token>, Vec<CompileDiagnostic>> {
    let mut lexer = Lexer::new(source);
    lexer.run();
    if lexer.errors.is_empty() {
        Ok(lexer.tokens)
    } else {
        Err(lexer.errors)
    }
}

/// Decodes the escape sequences of a string segment lexeme.
pub(crate) fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            // The lexer already rejected unknown escapes; pass through
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// An in-flight interpolated string: brace nesting depth of the current
/// expression hole plus whether the enclosing literal is triple-quoted.
struct InterpState {
    braces: u32,
    triple: bool,
}

struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
    tokens: Vec<Token>,
    errors: Vec<CompileDiagnostic>,
    interp: Vec<InterpState>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
            tokens: Vec::new(),
            errors: Vec::new(),
            interp: Vec::new(),
        }
    }

    fn run(&mut self) {
        while !self.at_end() {
            self.skip_trivia();
            if self.at_end() {
                break;
            }
            self.scan_token();
        }
        let (line, column) = (self.line, self.column);
        self.push_at(TokenKind::Eof, self.pos, 0, line, column);
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> u8 {
        if self.at_end() {
            0
        } else {
            self.bytes[self.pos]
        }
    }

    fn peek_next(&self) -> u8 {
        if self.pos + 1 >= self.bytes.len() {
            0
        } else {
            self.bytes[self.pos + 1]
        }
    }

    fn advance(&mut self) -> u8 {
        let b = self.bytes[self.pos];
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        b
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.peek() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.advance();
                }
                b'/' if self.peek_next() == b'/' => {
                    while !self.at_end() && self.peek() != b'\n' {
                        self.advance();
                    }
                }
                b'/' if self.peek_next() == b'*' => {
                    let (start, line, column) = (self.pos, self.line, self.column);
                    self.advance();
                    self.advance();
                    loop {
                        if self.at_end() {
                            self.error_at("unterminated block comment", start, 2, line, column);
                            return;
                        }
                        if self.peek() == b'*' && self.peek_next() == b'/' {
                            self.advance();
                            self.advance();
                            break;
                        }
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn push_at(&mut self, kind: TokenKind, start: usize, len: usize, line: u32, column: u32) {
        self.tokens.push(Token {
            kind,
            span_start: start as u32,
            span_len: len as u32,
            line,
            column,
        });
    }

    fn error_at(&mut self, message: &str, start: usize, len: usize, line: u32, column: u32) {
        self.errors
            .push(CompileDiagnostic::new(message, line, column, start, len));
    }

    fn scan_token(&mut self) {
        let start = self.pos;
        let line = self.line;
        let column = self.column;
        let b = self.advance();

        let kind = match b {
            b'(' => TokenKind::LeftParen,
            b')' => TokenKind::RightParen,
            b'{' => {
                if let Some(state) = self.interp.last_mut() {
                    state.braces += 1;
                }
                TokenKind::LeftBrace
            }
            b'}' => {
                if let Some(state) = self.interp.last_mut() {
                    if state.braces == 0 {
                        // Closes the `${` hole; resume the string literal
                        let triple = state.triple;
                        self.interp.pop();
                        self.scan_string_body(triple);
                        return;
                    }
                    state.braces -= 1;
                }
                TokenKind::RightBrace
            }
            b'[' => TokenKind::LeftBracket,
            b']' => TokenKind::RightBracket,
            b',' => TokenKind::Comma,
            b'.' => TokenKind::Dot,
            b';' => TokenKind::Semicolon,
            b':' => TokenKind::Colon,
            b'!' => {
                if self.matches(b'=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                }
            }
            b'=' => {
                if self.matches(b'=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                }
            }
            b'>' => {
                if self.matches(b'=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                }
            }
            b'<' => {
                if self.matches(b'=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                }
            }
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'?' => {
                if self.matches(b'.') {
                    TokenKind::QuestionDot
                } else {
                    TokenKind::Question
                }
            }
            b'"' => {
                let triple = self.peek() == b'"' && self.peek_next() == b'"';
                if triple {
                    self.advance();
                    self.advance();
                }
                self.scan_string_body(triple);
                return;
            }
            b'0'..=b'9' => {
                self.scan_number(start, line, column);
                return;
            }
            c if c == b'_' || c.is_ascii_alphabetic() => {
                self.scan_identifier(start, line, column);
                return;
            }
            other => {
                let repr = if other.is_ascii_graphic() {
                    format!("unexpected character '{}'", other as char)
                } else {
                    format!("unexpected byte 0x{other:02x}")
                };
                self.error_at(&repr, start, 1, line, column);
                return;
            }
        };

        self.push_at(kind, start, self.pos - start, line, column);
    }

    fn scan_number(&mut self, start: usize, line: u32, column: u32) {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        self.push_at(TokenKind::Number, start, self.pos - start, line, column);
    }

    fn scan_identifier(&mut self, start: usize, line: u32, column: u32) {
        while self.peek() == b'_' || self.peek().is_ascii_alphanumeric() {
            self.advance();
        }
        let text = &self.source[start..self.pos];
        let kind = KEYWORDS
            .get(text)
            .copied()
            .unwrap_or(TokenKind::Identifier);
        self.push_at(kind, start, self.pos - start, line, column);
    }

    /// Scans a string literal body from just after an opening quote (or just
    /// after the `}` that closed an interpolation hole). Emits either a final
    /// `Str` token or an `Interpolation` segment followed by expression
    /// tokens.
    fn scan_string_body(&mut self, triple: bool) {
        let start = self.pos;
        let line = self.line;
        let column = self.column;
        loop {
            if self.at_end() {
                self.error_at("unterminated string", start, self.pos - start, line, column);
                return;
            }
            match self.peek() {
                b'"' => {
                    let content_end = self.pos;
                    if !triple {
                        self.advance();
                        self.push_at(TokenKind::Str, start, content_end - start, line, column);
                        return;
                    }
                    if self.pos + 3 <= self.bytes.len()
                        && self.bytes[self.pos + 1] == b'"'
                        && self.bytes[self.pos + 2] == b'"'
                    {
                        self.advance();
                        self.advance();
                        self.advance();
                        self.push_at(TokenKind::Str, start, content_end - start, line, column);
                        return;
                    }
                    // A lone quote inside a triple-quoted string
                    self.advance();
                }
                b'$' if self.peek_next() == b'{' => {
                    let content_end = self.pos;
                    self.advance();
                    self.advance();
                    self.push_at(
                        TokenKind::Interpolation,
                        start,
                        content_end - start,
                        line,
                        column,
                    );
                    self.interp.push(InterpState { braces: 0, triple });
                    return;
                }
                b'\\' => {
                    let esc_pos = self.pos;
                    let (esc_line, esc_col) = (self.line, self.column);
                    self.advance();
                    match self.peek() {
                        b'n' | b't' | b'r' | b'"' | b'\\' => {
                            self.advance();
                        }
                        _ => {
                            self.error_at("invalid escape sequence", esc_pos, 2, esc_line, esc_col);
                            if !self.at_end() {
                                self.advance();
                            }
                        }
                    }
                }
                b'\n' if !triple => {
                    self.error_at("unterminated string", start, self.pos - start, line, column);
                    return;
                }
                _ => {
                    self.advance();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_punctuation_and_operators() {
        assert_eq!(
            kinds("( ) { } [ ] , . ?. ; : ! != = == > >= < <= + - * / ?"),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::LeftBracket,
                TokenKind::RightBracket,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::QuestionDot,
                TokenKind::Semicolon,
                TokenKind::Colon,
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Question,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_and_identifiers() {
        assert_eq!(
            kinds("let foreach x1 _tmp"),
            vec![
                TokenKind::Let,
                TokenKind::Foreach,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let tokens = lex("12 3.5 0.25").unwrap();
        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens[1].lexeme("12 3.5 0.25"), "3.5");
    }

    #[test]
    fn test_string_literal() {
        let source = r#""hello\nworld""#;
        let tokens = lex(source).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(unescape(tokens[0].lexeme(source)), "hello\nworld");
    }

    #[test]
    fn test_interpolation_segments() {
        let source = r#""a${x}b""#;
        assert_eq!(
            kinds(source),
            vec![
                TokenKind::Interpolation,
                TokenKind::Identifier,
                TokenKind::Str,
                TokenKind::Eof,
            ]
        );
        let tokens = lex(source).unwrap();
        assert_eq!(tokens[0].lexeme(source), "a");
        assert_eq!(tokens[2].lexeme(source), "b");
    }

    #[test]
    fn test_nested_interpolation_braces() {
        // Map literal inside an interpolation hole must not close the string
        let source = r#""v=${ {a: 1}["a"] }!""#;
        let tokens = lex(source).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Interpolation);
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
        assert_eq!(tokens[tokens.len() - 2].kind, TokenKind::Str);
    }

    #[test]
    fn test_triple_quoted_multiline() {
        let source = "\"\"\"line1\nline2\"\"\"";
        let tokens = lex(source).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].lexeme(source), "line1\nline2");
    }

    #[test]
    fn test_unterminated_string_is_fatal() {
        let errors = lex("\"oops").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("unterminated"));
    }

    #[test]
    fn test_comments_are_trivia() {
        assert_eq!(
            kinds("1 // line\n/* block\nstill */ 2"),
            vec![TokenKind::Number, TokenKind::Number, TokenKind::Eof]
        );
    }

    #[test]
    fn test_unexpected_character() {
        let errors = lex("let @ = 1;").unwrap_err();
        assert!(errors[0].message.contains("unexpected character '@'"));
        assert_eq!(errors[0].line, 1);
        assert_eq!(errors[0].column, 5);
    }
}
