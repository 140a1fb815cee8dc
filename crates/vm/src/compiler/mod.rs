//! Compiler module for the Erkao VM.
//!
//! A single-pass Pratt parser that emits bytecode directly as it parses;
//! there is no intermediate tree. Each token kind carries a prefix handler,
//! an infix handler and a precedence; `parse_precedence` drives them.
//!
//! The compiler tracks lexical scope with a depth counter only — variable
//! resolution happens by name at runtime through the environment chain —
//! and patches forward jumps once their targets are known. Default
//! parameter expressions are recorded as token ranges at declaration and
//! compiled into the function prologue, which keeps the calling convention
//! trivial: missing arguments arrive as `null`.

mod expr;
mod folding;
mod stmt;

use std::rc::Rc;

use crate::chunk::Chunk;
use crate::error::CompileDiagnostic;
use crate::heap::{Handle, Heap};
use crate::object::{ObjFunction, Object};
use crate::op_code::OpCode;
use crate::program::Program;
use crate::token::{Token, TokenKind, KEYWORDS};
use crate::value::Value;

/// How the top-level chunk terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    /// Ordinary script: every statement's value is discarded
    Script,
    /// REPL-style evaluation: the final top-level expression statement
    /// becomes the script's return value
    Eval,
}

/// Expression binding strength, weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

pub(crate) type PrefixFn = for<'a, 'h> fn(&'a mut Compiler<'h>, bool);
pub(crate) type InfixFn = for<'a, 'h> fn(&'a mut Compiler<'h>, bool);

/// What kind of function body is being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// A `break`/`continue` collection context, pushed by every loop, `switch`
/// and `match`.
pub(crate) struct BreakContext {
    /// Operand offsets of `break` jumps awaiting the end patch
    pub breaks: Vec<usize>,
    /// Operand offsets of forward `continue` jumps (for-loop increment,
    /// foreach step)
    pub continues: Vec<usize>,
    /// Backward continue target when it is already known (while loops)
    pub continue_to: Option<usize>,
    /// Whether `continue` may bind here; `switch`/`match` collect only
    /// `break`
    pub is_loop: bool,
    /// Scope depth at the jump landing points
    pub depth: u32,
}

/// One function being compiled; the innermost sits at the top of the
/// context stack.
pub(crate) struct FunctionCtx {
    pub chunk: Chunk,
    pub kind: FunctionKind,
    pub scope_depth: u32,
    pub break_stack: Vec<BreakContext>,
    /// Offset of the `POP` ending the most recent top-level expression
    /// statement, for eval-mode result capture
    pub last_expr_pop: Option<usize>,
}

impl FunctionCtx {
    fn new(kind: FunctionKind) -> Self {
        Self {
            chunk: Chunk::new(),
            kind,
            scope_depth: 0,
            break_stack: Vec::new(),
            last_expr_pop: None,
        }
    }
}

/// The single-pass compiler.
pub struct Compiler<'h> {
    pub(crate) heap: &'h mut Heap,
    pub(crate) program: Rc<Program>,
    pub(crate) tokens: Vec<Token>,
    pub(crate) pos: usize,
    pub(crate) mode: CompileMode,
    pub(crate) ctx: Vec<FunctionCtx>,
    pub(crate) errors: Vec<CompileDiagnostic>,
    pub(crate) panic_mode: bool,
    /// Set by `?.` when the next infix token is `(`; turns the call into
    /// `CALL_OPTIONAL`
    pub(crate) pending_optional_call: bool,
}

impl<'h> Compiler<'h> {
    /// Compiles a token stream into a root function template.
    ///
    /// The template carries the whole chunk tree through its constants; its
    /// `env` is `None` until the VM closes it over an environment.
    pub fn compile(
        heap: &'h mut Heap,
        program: Rc<Program>,
        tokens: Vec<Token>,
        mode: CompileMode,
    ) -> Result<Handle, Vec<CompileDiagnostic>> {
        let mut compiler = Compiler {
            heap,
            program,
            tokens,
            pos: 0,
            mode,
            ctx: vec![FunctionCtx::new(FunctionKind::Script)],
            errors: Vec::new(),
            panic_mode: false,
            pending_optional_call: false,
        };

        while !compiler.check(TokenKind::Eof) {
            compiler.declaration();
        }

        let function = compiler.end_script();
        if compiler.errors.is_empty() {
            Ok(function)
        } else {
            Err(compiler.errors)
        }
    }

    fn end_script(&mut self) -> Handle {
        // Eval mode: if the chunk ends with the POP of a top-level
        // expression statement, rewrite it into the script result
        if self.mode == CompileMode::Eval {
            if let Some(pop_offset) = self.ctx().last_expr_pop {
                if self.chunk().len() == pop_offset + 1 {
                    self.ctx_mut().chunk.code[pop_offset] = OpCode::RETURN as u8;
                }
            }
        }
        let token = self.current();
        self.emit_op(OpCode::NULL, token);
        self.emit_op(OpCode::RETURN, token);

        let mut ctx = self.ctx.pop().expect("script context");
        folding::fold_constants(&mut ctx.chunk, self.heap);
        let chunk = Rc::new(ctx.chunk);
        self.heap.alloc(Object::Function(ObjFunction {
            name: None,
            params: Vec::new(),
            arity: 0,
            min_arity: 0,
            is_initializer: false,
            chunk,
            env: None,
            program: Rc::clone(&self.program),
        }))
    }

    // === Cursor ===

    pub(crate) fn current(&self) -> Token {
        self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    pub(crate) fn previous(&self) -> Token {
        self.tokens[self.pos.saturating_sub(1).min(self.tokens.len() - 1)]
    }

    pub(crate) fn advance(&mut self) -> Token {
        let token = self.current();
        // The cursor may sit one past the final Eof; current() clamps
        self.pos = (self.pos + 1).min(self.tokens.len());
        token
    }

    pub(crate) fn check(&self, kind: TokenKind) -> bool {
        self.current().kind == kind
    }

    pub(crate) fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    // === Contexts ===

    pub(crate) fn ctx(&self) -> &FunctionCtx {
        self.ctx.last().expect("function context")
    }

    pub(crate) fn ctx_mut(&mut self) -> &mut FunctionCtx {
        self.ctx.last_mut().expect("function context")
    }

    pub(crate) fn chunk(&self) -> &Chunk {
        &self.ctx().chunk
    }

    /// True when compiling the top level of the root script/module chunk.
    pub(crate) fn at_top_level(&self) -> bool {
        self.ctx.len() == 1 && self.ctx().scope_depth == 0
    }

    // === Emission ===

    pub(crate) fn emit_op(&mut self, op: OpCode, token: Token) {
        self.ctx_mut().chunk.write_op(op, token);
    }

    pub(crate) fn emit_u16(&mut self, value: u16, token: Token) {
        self.ctx_mut().chunk.write_u16(value, token);
    }

    pub(crate) fn emit_byte(&mut self, byte: u8, token: Token) {
        self.ctx_mut().chunk.write_byte(byte, token);
    }

    /// Adds a constant, reporting pool exhaustion at `token`.
    pub(crate) fn make_constant(&mut self, value: Value, token: Token) -> u16 {
        match self.ctx_mut().chunk.add_constant(value) {
            Some(idx) => idx,
            None => {
                self.error_at(token, "too many constants in one chunk");
                0
            }
        }
    }

    pub(crate) fn emit_constant(&mut self, value: Value, token: Token) {
        let idx = self.make_constant(value, token);
        self.emit_op(OpCode::CONSTANT, token);
        self.emit_u16(idx, token);
    }

    /// Interns an identifier lexeme and returns its constant index.
    pub(crate) fn identifier_constant(&mut self, token: Token) -> u16 {
        let text = token.lexeme(&self.program.source).to_string();
        let handle = self.heap.intern(&text);
        self.make_constant(Value::Obj(handle), token)
    }

    /// Emits a forward jump with a placeholder operand; returns the operand
    /// offset for patching.
    pub(crate) fn emit_jump(&mut self, op: OpCode, token: Token) -> usize {
        self.emit_op(op, token);
        let operand = self.chunk().len();
        self.emit_u16(0xFFFF, token);
        operand
    }

    /// Patches a forward jump to land at the current end of code.
    pub(crate) fn patch_jump(&mut self, operand: usize) {
        let distance = self.chunk().len() - (operand + 2);
        if distance > u16::MAX as usize {
            let token = self.previous();
            self.error_at(token, "too much code to jump over");
            return;
        }
        self.ctx_mut().chunk.patch_u16(operand, distance as u16);
    }

    /// Emits a backward `LOOP` to `target`.
    pub(crate) fn emit_loop(&mut self, target: usize, token: Token) {
        self.emit_op(OpCode::LOOP, token);
        let distance = self.chunk().len() + 2 - target;
        if distance > u16::MAX as usize {
            self.error_at(token, "loop body too large");
            self.emit_u16(0, token);
            return;
        }
        self.emit_u16(distance as u16, token);
    }

    pub(crate) fn begin_scope(&mut self, token: Token) {
        self.ctx_mut().scope_depth += 1;
        self.emit_op(OpCode::BEGIN_SCOPE, token);
    }

    pub(crate) fn end_scope(&mut self, token: Token) {
        self.emit_op(OpCode::END_SCOPE, token);
        self.ctx_mut().scope_depth -= 1;
    }

    // === Pratt driver ===

    pub(crate) fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    pub(crate) fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = expr::prefix_rule(self.previous().kind) else {
            let token = self.previous();
            self.error_at(token, "expected an expression");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while let Some((infix, infix_prec)) = expr::infix_rule(self.current().kind) {
            if infix_prec < precedence {
                break;
            }
            // An optional call only fuses with the `(` immediately after `?.`
            if self.current().kind != TokenKind::LeftParen {
                self.pending_optional_call = false;
            }
            self.advance();
            infix(self, can_assign);
        }
        self.pending_optional_call = false;

        if can_assign && self.matches(TokenKind::Equal) {
            let token = self.previous();
            self.error_at(token, "invalid assignment target");
        }
    }

    // === Errors and recovery ===

    pub(crate) fn error_at_current(&mut self, message: &str) {
        let token = self.current();
        self.error_at(token, message);
    }

    pub(crate) fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let mut diagnostic = CompileDiagnostic::new(
            message,
            token.line,
            token.column,
            token.span_start as usize,
            token.span_len as usize,
        );
        if token.kind == TokenKind::Identifier {
            diagnostic.hint = suggest_keyword(token.lexeme(&self.program.source));
        }
        self.errors.push(diagnostic);
    }

    /// Panic-mode resynchronisation: for statement-level errors, skip to
    /// the next statement-starting keyword (or past the offending
    /// semicolon); for expression-level errors, skip to the balancing
    /// delimiter first.
    pub(crate) fn synchronize(&mut self) {
        self.panic_mode = false;
        let mut parens: i32 = 0;
        let mut brackets: i32 = 0;
        while !self.check(TokenKind::Eof) {
            if self.previous().kind == TokenKind::Semicolon && parens == 0 && brackets == 0 {
                return;
            }
            match self.current().kind {
                TokenKind::LeftParen => parens += 1,
                TokenKind::RightParen if parens > 0 => parens -= 1,
                TokenKind::LeftBracket => brackets += 1,
                TokenKind::RightBracket if brackets > 0 => brackets -= 1,
                TokenKind::RightBrace if parens == 0 && brackets == 0 => return,
                kind if kind.starts_statement() && parens == 0 && brackets == 0 => return,
                _ => {}
            }
            self.advance();
        }
    }
}

/// Bounded-edit-distance suggestion against the keyword set. Very short
/// identifiers are skipped; at two characters every keyword is "close".
pub(crate) fn suggest_keyword(text: &str) -> Option<String> {
    const MAX_DISTANCE: usize = 2;
    if text.len() < 3 {
        return None;
    }
    let mut best: Option<(usize, &str)> = None;
    for keyword in KEYWORDS.keys() {
        let distance = edit_distance(text, keyword, MAX_DISTANCE);
        if distance <= MAX_DISTANCE {
            match best {
                Some((d, _)) if d <= distance => {}
                _ => best = Some((distance, keyword)),
            }
        }
    }
    best.map(|(_, keyword)| keyword.to_string())
}

/// Levenshtein distance with an early-out bound.
fn edit_distance(a: &str, b: &str, bound: usize) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > bound {
        return bound + 1;
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        row[0] = i + 1;
        let mut row_min = row[0];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            row[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(row[j] + 1);
            row_min = row_min.min(row[j + 1]);
        }
        if row_min > bound {
            return bound + 1;
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use crate::limits::GcTuning;

    fn compile_ok(source: &str) -> (Heap, Handle) {
        let mut heap = Heap::new(GcTuning::default());
        let program = Program::new("<test>", source);
        let tokens = lex(source).unwrap();
        let function = Compiler::compile(&mut heap, program, tokens, CompileMode::Script)
            .expect("compile should succeed");
        (heap, function)
    }

    fn compile_err(source: &str) -> Vec<CompileDiagnostic> {
        let mut heap = Heap::new(GcTuning::default());
        let program = Program::new("<test>", source);
        let tokens = lex(source).unwrap();
        Compiler::compile(&mut heap, program, tokens, CompileMode::Script)
            .expect_err("compile should fail")
    }

    fn root_chunk(heap: &Heap, function: Handle) -> Rc<Chunk> {
        match heap.get(function) {
            Some(Object::Function(f)) => Rc::clone(&f.chunk),
            _ => panic!("root is not a function"),
        }
    }

    #[test]
    fn test_precedence_folds_to_single_constant() {
        // 1 + 2 * 3 folds completely; the chunk pushes 7 once
        let (heap, function) = compile_ok("let x = 1 + 2 * 3;");
        let chunk = root_chunk(&heap, function);
        assert_eq!(chunk.code[0], OpCode::CONSTANT as u8);
        let idx = chunk.read_u16(1) as usize;
        assert_eq!(chunk.constants[idx], Value::Number(7.0));
        assert_eq!(chunk.code[3], OpCode::DEFINE_VAR as u8);
    }

    #[test]
    fn test_invalid_assignment_target() {
        let errors = compile_err("1 + 2 = 3;");
        assert!(errors[0].message.contains("invalid assignment target"));
    }

    #[test]
    fn test_const_requires_initializer() {
        let errors = compile_err("const k;");
        assert!(errors[0].message.contains("const"));
    }

    #[test]
    fn test_did_you_mean_suggestion() {
        assert_eq!(suggest_keyword("whle"), Some("while".to_string()));
        assert_eq!(suggest_keyword("funn"), Some("fun".to_string()));
        assert_eq!(suggest_keyword("zzzzzz"), None);
    }

    #[test]
    fn test_error_recovery_reports_multiple_statements() {
        let errors = compile_err("let = 1;\nlet ok = 2;\nconst k;\n");
        assert!(errors.len() >= 2, "expected both errors, got {errors:?}");
    }

    #[test]
    fn test_jump_patching_in_if() {
        let (heap, function) = compile_ok("if (true) { 1; } else { 2; }");
        let chunk = root_chunk(&heap, function);
        // Find the JUMP_IF_FALSE and check its target lands inside the chunk
        let mut offset = 0;
        let mut found = false;
        while offset < chunk.len() {
            if chunk.code[offset] == OpCode::JUMP_IF_FALSE as u8 {
                let distance = chunk.read_u16(offset + 1) as usize;
                assert!(offset + 3 + distance <= chunk.len());
                assert_ne!(distance, 0xFFFF);
                found = true;
            }
            offset += chunk.instruction_len(offset);
        }
        assert!(found);
    }

    #[test]
    fn test_default_parameter_prologue() {
        let (heap, function) = compile_ok("fun f(a, b = a + 1) { return b; }");
        let chunk = root_chunk(&heap, function);
        // Root chunk holds the template as a constant
        let template = chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(h) => match heap.get(*h) {
                    Some(Object::Function(f)) => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("function template constant");
        assert_eq!(template.arity, 2);
        assert_eq!(template.min_arity, 1);
        // Prologue starts with the supplied-argument test
        assert_eq!(template.chunk.code[0], OpCode::ARG_COUNT as u8);
    }

    #[test]
    fn test_eval_mode_returns_last_expression() {
        let mut heap = Heap::new(GcTuning::default());
        let source = "let x = 2; x + 3;";
        let program = Program::new("<test>", source);
        let tokens = lex(source).unwrap();
        let function =
            Compiler::compile(&mut heap, program, tokens, CompileMode::Eval).unwrap();
        let chunk = root_chunk(&heap, function);
        // The final expression statement's POP became RETURN
        let returns = chunk
            .code
            .iter()
            .filter(|b| **b == OpCode::RETURN as u8)
            .count();
        assert!(returns >= 2);
    }
}
