//! Diagnostics module for the Erkao VM.
//!
//! This module renders compile and runtime errors in the engine's wire
//! format: `path:line:column: Kind: message` followed by a two-line source
//! snippet underlining the offending token.

use crate::error::CompileDiagnostic;
use crate::token::Token;

/// Renders one diagnostic with its source context.
pub fn render(path: &str, source: &str, kind: &str, message: &str, line: u32, column: u32, span_len: usize) -> String {
    let mut out = format!("{path}:{line}:{column}: {kind}: {message}\n");
    if let Some(text) = source_line(source, line) {
        out.push_str("    ");
        out.push_str(text);
        out.push('\n');
        out.push_str("    ");
        for _ in 1..column {
            out.push(' ');
        }
        for _ in 0..span_len.max(1) {
            out.push('^');
        }
        out.push('\n');
    }
    out
}

/// Renders a runtime error anchored at `token`.
pub fn render_runtime(path: &str, source: &str, token: &Token, message: &str) -> String {
    render(
        path,
        source,
        "RuntimeError",
        message,
        token.line,
        token.column,
        token.span_len as usize,
    )
}

/// Renders a compile diagnostic, appending its suggestion when present.
pub fn render_compile(path: &str, source: &str, diagnostic: &CompileDiagnostic) -> String {
    let mut out = render(
        path,
        source,
        "Error",
        &diagnostic.message,
        diagnostic.line,
        diagnostic.column,
        diagnostic.span_len,
    );
    if let Some(hint) = &diagnostic.hint {
        out.push_str(&format!("    did you mean '{hint}'?\n"));
    }
    out
}

fn source_line(source: &str, line: u32) -> Option<&str> {
    if line == 0 {
        return None;
    }
    source.lines().nth(line as usize - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_format() {
        let source = "let x = 1;\nlet y = oops;\n";
        let token = Token {
            kind: crate::token::TokenKind::Identifier,
            span_start: 19,
            span_len: 4,
            line: 2,
            column: 9,
        };
        let text = render_runtime("demo.ek", source, &token, "undefined variable 'oops'");
        assert_eq!(
            text,
            "demo.ek:2:9: RuntimeError: undefined variable 'oops'\n    let y = oops;\n            ^^^^\n"
        );
    }

    #[test]
    fn test_compile_format_with_hint() {
        let source = "whle (true) {}\n";
        let mut diag = CompileDiagnostic::new("unexpected identifier", 1, 1, 0, 4);
        diag.hint = Some("while".to_string());
        let text = render_compile("demo.ek", source, &diag);
        assert!(text.starts_with("demo.ek:1:1: Error: unexpected identifier\n"));
        assert!(text.contains("    whle (true) {}\n"));
        assert!(text.contains("    ^^^^\n"));
        assert!(text.ends_with("    did you mean 'while'?\n"));
    }

    #[test]
    fn test_missing_line_renders_header_only() {
        let text = render("demo.ek", "", "Error", "boom", 9, 1, 1);
        assert_eq!(text, "demo.ek:9:1: Error: boom\n");
    }
}
