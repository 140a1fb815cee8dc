//! Statement parsing for the Erkao compiler.
//!
//! Declarations, control flow, loops with break/continue collection,
//! try/catch, class/enum declarations, module import/export lowering and
//! the deferred compilation of default parameter expressions and `for`
//! increment clauses (both are recorded as token ranges and compiled once
//! the emission point is reached).

use std::rc::Rc;

use super::{folding, BreakContext, Compiler, FunctionCtx, FunctionKind};
use crate::lexer::unescape;
use crate::object::{ObjEnumCtor, ObjFunction, Object};
use crate::op_code::OpCode;
use crate::token::{Token, TokenKind};
use crate::value::Value;

impl<'h> Compiler<'h> {
    pub(crate) fn declaration(&mut self) {
        let before = self.chunk().len();
        match self.current().kind {
            TokenKind::Let => {
                self.advance();
                self.let_declaration();
            }
            TokenKind::Const => {
                self.advance();
                self.const_declaration();
            }
            TokenKind::Fun if self.peek_next_is(TokenKind::Identifier) => {
                self.advance();
                self.fun_declaration();
            }
            TokenKind::Class => {
                self.advance();
                self.class_declaration();
            }
            TokenKind::Enum => {
                self.advance();
                self.enum_declaration();
            }
            TokenKind::Import => {
                self.advance();
                self.import_statement();
            }
            TokenKind::Export => {
                self.advance();
                self.export_statement();
            }
            TokenKind::Private => {
                self.advance();
                self.private_declaration();
            }
            _ => self.statement(),
        }

        if self.panic_mode {
            self.synchronize();
            return;
        }

        // Safepoint after every completed statement, except the eval-mode
        // result expression whose POP must stay the final byte
        let captured_result = self.mode == super::CompileMode::Eval
            && self.at_top_level()
            && self.ctx().last_expr_pop == Some(self.chunk().len().wrapping_sub(1));
        if self.chunk().len() > before && !captured_result {
            let token = self.previous();
            self.emit_op(OpCode::GC, token);
        }
    }

    fn peek_next_is(&self, kind: TokenKind) -> bool {
        self.tokens
            .get(self.pos + 1)
            .is_some_and(|t| t.kind == kind)
    }

    pub(crate) fn statement(&mut self) {
        match self.current().kind {
            TokenKind::If => {
                self.advance();
                self.if_statement();
            }
            TokenKind::While => {
                self.advance();
                self.while_statement();
            }
            TokenKind::For => {
                self.advance();
                self.for_statement();
            }
            TokenKind::Foreach => {
                self.advance();
                self.foreach_statement();
            }
            TokenKind::Switch => {
                self.advance();
                self.switch_statement();
            }
            TokenKind::Match => {
                self.advance();
                self.match_statement();
            }
            TokenKind::Return => {
                self.advance();
                self.return_statement();
            }
            TokenKind::Break => {
                self.advance();
                self.break_statement();
            }
            TokenKind::Continue => {
                self.advance();
                self.continue_statement();
            }
            TokenKind::Throw => {
                self.advance();
                self.throw_statement();
            }
            TokenKind::Try => {
                self.advance();
                self.try_statement();
            }
            TokenKind::LeftBrace => {
                let brace = self.advance();
                self.begin_scope(brace);
                self.block();
                let close = self.previous();
                self.end_scope(close);
            }
            TokenKind::Yield => {
                self.error_at_current("'yield' is reserved and not supported");
                self.advance();
            }
            _ => self.expression_statement(),
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after block");
    }

    fn expression_statement(&mut self) {
        let first = self.current();
        self.expression();
        let token = self.previous();
        if self.check(TokenKind::Semicolon) {
            self.advance();
        } else if first.kind == TokenKind::Identifier && !self.panic_mode {
            // A statement starting with a near-keyword identifier is the
            // classic typo; point at it rather than the stray token
            self.error_at(first, "unexpected identifier; expected a statement");
        } else {
            self.error_at_current("expected ';' after expression");
        }
        self.emit_op(OpCode::POP, token);
        if self.at_top_level() {
            let offset = self.chunk().len() - 1;
            self.ctx_mut().last_expr_pop = Some(offset);
        }
    }

    // === Variable declarations ===

    /// `let name (= expr)? ;` — returns the name token for export marking.
    fn let_declaration(&mut self) -> Option<Token> {
        self.consume(TokenKind::Identifier, "expected a variable name");
        let name_token = self.previous();
        let name = self.identifier_constant(name_token);
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::NULL, name_token);
        }
        self.consume(TokenKind::Semicolon, "expected ';' after declaration");
        self.emit_op(OpCode::DEFINE_VAR, name_token);
        self.emit_u16(name, name_token);
        Some(name_token)
    }

    fn const_declaration(&mut self) -> Option<Token> {
        self.consume(TokenKind::Identifier, "expected a constant name");
        let name_token = self.previous();
        let name = self.identifier_constant(name_token);
        if !self.matches(TokenKind::Equal) {
            self.error_at_current("a 'const' declaration requires an initializer");
            return None;
        }
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after declaration");
        self.emit_op(OpCode::DEFINE_CONST, name_token);
        self.emit_u16(name, name_token);
        Some(name_token)
    }

    fn fun_declaration(&mut self) -> Option<Token> {
        self.consume(TokenKind::Identifier, "expected a function name");
        let name_token = self.previous();
        let name = self.identifier_constant(name_token);
        self.function(FunctionKind::Function, Some(name_token));
        self.emit_op(OpCode::DEFINE_VAR, name_token);
        self.emit_u16(name, name_token);
        Some(name_token)
    }

    // === Functions ===

    /// Compiles a function body into a fresh chunk and emits `CLOSURE` for
    /// its template in the enclosing chunk.
    pub(crate) fn function(&mut self, kind: FunctionKind, name_token: Option<Token>) {
        self.ctx.push(FunctionCtx::new(kind));
        let open = self.current();
        self.consume(TokenKind::LeftParen, "expected '(' after function name");

        // Parameter list; defaults are recorded as token ranges and
        // compiled into the prologue below
        let mut params: Vec<(Token, Option<(usize, usize)>)> = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                self.consume(TokenKind::Identifier, "expected a parameter name");
                let param = self.previous();
                if params.len() >= u8::MAX as usize {
                    self.error_at(param, "cannot declare more than 255 parameters");
                }
                let default = if self.matches(TokenKind::Equal) {
                    let start = self.pos;
                    self.skip_expression(&[TokenKind::Comma, TokenKind::RightParen]);
                    Some((start, self.pos))
                } else {
                    None
                };
                params.push((param, default));
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after parameters");

        let min_arity = params
            .iter()
            .position(|(_, default)| default.is_some())
            .unwrap_or(params.len());
        for (token, default) in params.iter().skip(min_arity) {
            if default.is_none() {
                self.error_at(*token, "parameter without a default follows one with a default");
            }
        }

        self.consume(TokenKind::LeftBrace, "expected '{' before function body");

        // Prologue: each defaulted parameter tests the supplied argument
        // count and evaluates its default on demand
        for (index, (param, default)) in params.iter().enumerate() {
            let Some((start, end)) = *default else {
                continue;
            };
            let param = *param;
            let name = self.identifier_constant(param);

            self.emit_op(OpCode::ARG_COUNT, param);
            self.emit_constant(Value::Number((index + 1) as f64), param);
            self.emit_op(OpCode::LESS, param);
            let skip = self.emit_jump(OpCode::JUMP_IF_FALSE, param);
            self.emit_op(OpCode::POP, param);

            let resume = self.pos;
            self.pos = start;
            self.expression();
            if self.pos != end && !self.panic_mode {
                self.error_at(param, "malformed default argument expression");
            }
            self.pos = resume;

            self.emit_op(OpCode::SET_VAR, param);
            self.emit_u16(name, param);
            self.emit_op(OpCode::POP, param);
            let done = self.emit_jump(OpCode::JUMP, param);
            self.patch_jump(skip);
            self.emit_op(OpCode::POP, param);
            self.patch_jump(done);
        }

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after function body");
        let close = self.previous();
        self.emit_op(OpCode::NULL, close);
        self.emit_op(OpCode::RETURN, close);

        // Seal the chunk and register the template
        let mut ctx = self.ctx.pop().expect("function context");
        folding::fold_constants(&mut ctx.chunk, self.heap);
        let chunk = Rc::new(ctx.chunk);

        let name = name_token.map(|t| {
            let text = t.lexeme(&self.program.source).to_string();
            self.heap.intern(&text)
        });
        let param_names: Vec<_> = params
            .iter()
            .map(|(t, _)| {
                let text = t.lexeme(&self.program.source).to_string();
                self.heap.intern(&text)
            })
            .collect();
        let arity = params.len();
        let template = self.heap.alloc(Object::Function(ObjFunction {
            name,
            params: param_names,
            arity,
            min_arity,
            is_initializer: kind == FunctionKind::Initializer,
            chunk,
            env: None,
            program: Rc::clone(&self.program),
        }));

        let token = name_token.unwrap_or(open);
        let idx = self.make_constant(Value::Obj(template), token);
        self.emit_op(OpCode::CLOSURE, token);
        self.emit_u16(idx, token);
    }

    /// Skips over one expression's tokens without emitting, balancing
    /// delimiters; stops at a depth-zero terminator.
    pub(crate) fn skip_expression(&mut self, terminators: &[TokenKind]) {
        let mut parens: i32 = 0;
        let mut brackets: i32 = 0;
        let mut braces: i32 = 0;
        loop {
            let kind = self.current().kind;
            if kind == TokenKind::Eof {
                self.error_at_current("unexpected end of input in expression");
                return;
            }
            if parens == 0 && brackets == 0 && braces == 0 && terminators.contains(&kind) {
                return;
            }
            match kind {
                TokenKind::LeftParen => parens += 1,
                TokenKind::RightParen => {
                    if parens == 0 {
                        return;
                    }
                    parens -= 1;
                }
                TokenKind::LeftBracket => brackets += 1,
                TokenKind::RightBracket => {
                    if brackets == 0 {
                        return;
                    }
                    brackets -= 1;
                }
                TokenKind::LeftBrace => braces += 1,
                TokenKind::RightBrace => {
                    if braces == 0 {
                        return;
                    }
                    braces -= 1;
                }
                _ => {}
            }
            self.advance();
        }
    }

    // === Classes and enums ===

    fn class_declaration(&mut self) -> Option<Token> {
        self.consume(TokenKind::Identifier, "expected a class name");
        let name_token = self.previous();
        let name = self.identifier_constant(name_token);
        self.consume(TokenKind::LeftBrace, "expected '{' before class body");

        let mut method_count: usize = 0;
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.consume(TokenKind::Fun, "expected a method declaration");
            self.consume(TokenKind::Identifier, "expected a method name");
            let method_token = self.previous();
            let kind = if method_token.lexeme(&self.program.source) == "init" {
                FunctionKind::Initializer
            } else {
                FunctionKind::Method
            };
            self.function(kind, Some(method_token));
            method_count += 1;
        }
        self.consume(TokenKind::RightBrace, "expected '}' after class body");

        self.emit_op(OpCode::CLASS, name_token);
        self.emit_u16(name, name_token);
        self.emit_u16(method_count.min(u16::MAX as usize) as u16, name_token);
        self.emit_op(OpCode::DEFINE_VAR, name_token);
        self.emit_u16(name, name_token);
        Some(name_token)
    }

    /// An enum lowers to a `const` map from variant name to constructor
    /// (payload variants) or pre-built variant value (nullary variants).
    fn enum_declaration(&mut self) -> Option<Token> {
        self.consume(TokenKind::Identifier, "expected an enum name");
        let name_token = self.previous();
        let name = self.identifier_constant(name_token);
        let enum_name_text = name_token.lexeme(&self.program.source).to_string();
        let enum_name = self.heap.intern(&enum_name_text);
        self.consume(TokenKind::LeftBrace, "expected '{' before enum body");

        let mut variants: Vec<(Token, usize)> = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.consume(TokenKind::Identifier, "expected a variant name");
            let variant = self.previous();
            let mut arity = 0usize;
            if self.matches(TokenKind::LeftParen) {
                if !self.check(TokenKind::RightParen) {
                    loop {
                        self.consume(TokenKind::Identifier, "expected a payload name");
                        arity += 1;
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(TokenKind::RightParen, "expected ')' after payload names");
            }
            variants.push((variant, arity));
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightBrace, "expected '}' after enum body");

        self.emit_op(OpCode::MAP, name_token);
        self.emit_u16(variants.len().min(u16::MAX as usize) as u16, name_token);
        for (variant_token, arity) in variants {
            let text = variant_token.lexeme(&self.program.source).to_string();
            let variant = self.heap.intern(&text);
            self.emit_constant(Value::Obj(variant), variant_token);

            let ctor = self.heap.alloc(Object::EnumCtor(ObjEnumCtor {
                enum_name,
                variant,
                arity,
            }));
            self.emit_constant(Value::Obj(ctor), variant_token);
            if arity == 0 {
                self.emit_op(OpCode::CALL, variant_token);
                self.emit_byte(0, variant_token);
            }
            self.emit_op(OpCode::MAP_SET, variant_token);
        }
        self.emit_op(OpCode::DEFINE_CONST, name_token);
        self.emit_u16(name, name_token);
        Some(name_token)
    }

    // === Control flow ===

    fn if_statement(&mut self) {
        let keyword = self.previous();
        self.consume(TokenKind::LeftParen, "expected '(' after 'if'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let else_branch = self.emit_jump(OpCode::JUMP_IF_FALSE, keyword);
        self.emit_op(OpCode::POP, keyword);
        self.statement();
        let end = self.emit_jump(OpCode::JUMP, keyword);
        self.patch_jump(else_branch);
        self.emit_op(OpCode::POP, keyword);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(end);
    }

    fn while_statement(&mut self) {
        let keyword = self.previous();
        let loop_start = self.chunk().len();
        self.consume(TokenKind::LeftParen, "expected '(' after 'while'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let exit = self.emit_jump(OpCode::JUMP_IF_FALSE, keyword);
        self.emit_op(OpCode::POP, keyword);

        let depth = self.ctx().scope_depth;
        self.ctx_mut().break_stack.push(BreakContext {
            breaks: Vec::new(),
            continues: Vec::new(),
            continue_to: Some(loop_start),
            is_loop: true,
            depth,
        });
        self.statement();
        self.emit_loop(loop_start, keyword);
        self.patch_jump(exit);
        self.emit_op(OpCode::POP, keyword);
        self.finish_break_context();
    }

    fn for_statement(&mut self) {
        let keyword = self.previous();
        self.begin_scope(keyword);
        self.consume(TokenKind::LeftParen, "expected '(' after 'for'");

        // Initializer clause
        if self.matches(TokenKind::Semicolon) {
            // Empty
        } else if self.matches(TokenKind::Let) {
            self.let_declaration();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after loop initializer");
            self.emit_op(OpCode::POP, keyword);
        }

        let loop_start = self.chunk().len();
        if self.check(TokenKind::Semicolon) {
            self.emit_op(OpCode::TRUE, keyword);
        } else {
            self.expression();
        }
        self.consume(TokenKind::Semicolon, "expected ';' after loop condition");
        let exit = self.emit_jump(OpCode::JUMP_IF_FALSE, keyword);
        self.emit_op(OpCode::POP, keyword);

        // The increment clause runs after the body; record its tokens now
        // and compile them at the continue target
        let incr_start = self.pos;
        self.skip_expression(&[TokenKind::RightParen]);
        let incr_end = self.pos;
        self.consume(TokenKind::RightParen, "expected ')' after for clauses");

        let depth = self.ctx().scope_depth;
        self.ctx_mut().break_stack.push(BreakContext {
            breaks: Vec::new(),
            continues: Vec::new(),
            continue_to: None,
            is_loop: true,
            depth,
        });
        self.statement();

        // Continue target: the increment clause
        self.patch_continues();
        if incr_end > incr_start {
            let resume = self.pos;
            self.pos = incr_start;
            self.expression();
            self.pos = resume;
            self.emit_op(OpCode::POP, keyword);
        }
        self.emit_loop(loop_start, keyword);
        self.patch_jump(exit);
        self.emit_op(OpCode::POP, keyword);
        self.finish_break_context();
        self.end_scope(keyword);
    }

    /// `foreach (v in it)` iterates arrays by element and maps by key,
    /// driven by the iteration-polymorphic `LEN` and numeric `GET_INDEX`.
    fn foreach_statement(&mut self) {
        let keyword = self.previous();
        self.begin_scope(keyword);
        self.consume(TokenKind::LeftParen, "expected '(' after 'foreach'");
        self.consume(TokenKind::Identifier, "expected a loop variable");
        let variable = self.previous();
        let variable_name = self.identifier_constant(variable);
        self.consume(TokenKind::In, "expected 'in' after loop variable");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after iterable");

        // Hidden bindings; '@' cannot appear in user identifiers
        let iter_name = self.hidden_name("@iter", keyword);
        let idx_name = self.hidden_name("@idx", keyword);

        self.emit_op(OpCode::DEFINE_VAR, keyword);
        self.emit_u16(iter_name, keyword);

        // Reject non-iterables up front with a catchable throw
        self.emit_op(OpCode::GET_VAR, keyword);
        self.emit_u16(iter_name, keyword);
        self.emit_op(OpCode::IS_ARRAY, keyword);
        let not_array = self.emit_jump(OpCode::JUMP_IF_FALSE, keyword);
        self.emit_op(OpCode::POP, keyword);
        let array_ok = self.emit_jump(OpCode::JUMP, keyword);
        self.patch_jump(not_array);
        self.emit_op(OpCode::POP, keyword);
        self.emit_op(OpCode::GET_VAR, keyword);
        self.emit_u16(iter_name, keyword);
        self.emit_op(OpCode::IS_MAP, keyword);
        let not_map = self.emit_jump(OpCode::JUMP_IF_FALSE, keyword);
        self.emit_op(OpCode::POP, keyword);
        let map_ok = self.emit_jump(OpCode::JUMP, keyword);
        self.patch_jump(not_map);
        self.emit_op(OpCode::POP, keyword);
        let message = self.heap.intern("foreach target must be an array or a map");
        self.emit_constant(Value::Obj(message), keyword);
        self.emit_op(OpCode::THROW, keyword);
        self.patch_jump(array_ok);
        self.patch_jump(map_ok);

        self.emit_constant(Value::Number(0.0), keyword);
        self.emit_op(OpCode::DEFINE_VAR, keyword);
        self.emit_u16(idx_name, keyword);

        let loop_start = self.chunk().len();
        self.emit_op(OpCode::GET_VAR, keyword);
        self.emit_u16(idx_name, keyword);
        self.emit_op(OpCode::GET_VAR, keyword);
        self.emit_u16(iter_name, keyword);
        self.emit_op(OpCode::LEN, keyword);
        self.emit_op(OpCode::LESS, keyword);
        let exit = self.emit_jump(OpCode::JUMP_IF_FALSE, keyword);
        self.emit_op(OpCode::POP, keyword);

        let depth = self.ctx().scope_depth;
        self.ctx_mut().break_stack.push(BreakContext {
            breaks: Vec::new(),
            continues: Vec::new(),
            continue_to: None,
            is_loop: true,
            depth,
        });

        // Per-iteration scope holding the loop variable
        self.begin_scope(keyword);
        self.emit_op(OpCode::GET_VAR, keyword);
        self.emit_u16(iter_name, keyword);
        self.emit_op(OpCode::GET_VAR, keyword);
        self.emit_u16(idx_name, keyword);
        self.emit_op(OpCode::GET_INDEX, keyword);
        self.emit_op(OpCode::DEFINE_VAR, variable);
        self.emit_u16(variable_name, variable);
        self.statement();
        self.end_scope(keyword);

        // Continue target: the index increment
        self.patch_continues();
        self.emit_op(OpCode::GET_VAR, keyword);
        self.emit_u16(idx_name, keyword);
        self.emit_constant(Value::Number(1.0), keyword);
        self.emit_op(OpCode::ADD, keyword);
        self.emit_op(OpCode::SET_VAR, keyword);
        self.emit_u16(idx_name, keyword);
        self.emit_op(OpCode::POP, keyword);
        self.emit_loop(loop_start, keyword);
        self.patch_jump(exit);
        self.emit_op(OpCode::POP, keyword);
        self.finish_break_context();
        self.end_scope(keyword);
    }

    fn switch_statement(&mut self) {
        let keyword = self.previous();
        self.begin_scope(keyword);
        self.consume(TokenKind::LeftParen, "expected '(' after 'switch'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after discriminant");
        let discriminant = self.hidden_name("@switch", keyword);
        self.emit_op(OpCode::DEFINE_VAR, keyword);
        self.emit_u16(discriminant, keyword);
        self.consume(TokenKind::LeftBrace, "expected '{' before switch body");

        let depth = self.ctx().scope_depth;
        self.ctx_mut().break_stack.push(BreakContext {
            breaks: Vec::new(),
            continues: Vec::new(),
            continue_to: None,
            is_loop: false,
            depth,
        });

        while self.matches(TokenKind::Case) {
            let case_token = self.previous();
            self.emit_op(OpCode::GET_VAR, case_token);
            self.emit_u16(discriminant, case_token);
            self.expression();
            self.consume(TokenKind::Colon, "expected ':' after case value");
            self.emit_op(OpCode::EQUAL, case_token);
            let next_case = self.emit_jump(OpCode::JUMP_IF_FALSE, case_token);
            self.emit_op(OpCode::POP, case_token);

            self.case_body();
            // No fallthrough: each case ends by jumping to the switch end
            let done = self.emit_jump(OpCode::JUMP, case_token);
            if let Some(ctx) = self.ctx_mut().break_stack.last_mut() {
                ctx.breaks.push(done);
            }
            self.patch_jump(next_case);
            self.emit_op(OpCode::POP, case_token);
        }
        if self.matches(TokenKind::Default) {
            self.consume(TokenKind::Colon, "expected ':' after 'default'");
            self.case_body();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after switch body");
        self.finish_break_context();
        self.end_scope(keyword);
    }

    /// `match` arms test enum variants with `MATCH_ENUM` and bind payload
    /// values out of the variant's `_values` array.
    fn match_statement(&mut self) {
        let keyword = self.previous();
        self.begin_scope(keyword);
        self.consume(TokenKind::LeftParen, "expected '(' after 'match'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after discriminant");
        let discriminant = self.hidden_name("@match", keyword);
        self.emit_op(OpCode::DEFINE_VAR, keyword);
        self.emit_u16(discriminant, keyword);
        self.consume(TokenKind::LeftBrace, "expected '{' before match body");

        let depth = self.ctx().scope_depth;
        self.ctx_mut().break_stack.push(BreakContext {
            breaks: Vec::new(),
            continues: Vec::new(),
            continue_to: None,
            is_loop: false,
            depth,
        });

        let values_name = {
            let handle = self.heap.intern("_values");
            self.make_constant(Value::Obj(handle), keyword)
        };

        while self.matches(TokenKind::Case) {
            let case_token = self.previous();
            self.consume(TokenKind::Identifier, "expected an enum name in match case");
            let enum_token = self.previous();
            let enum_name = self.identifier_constant(enum_token);
            self.consume(TokenKind::Dot, "expected '.' after enum name");
            self.consume(TokenKind::Identifier, "expected a variant name");
            let variant_token = self.previous();
            let variant_name = self.identifier_constant(variant_token);

            self.emit_op(OpCode::GET_VAR, case_token);
            self.emit_u16(discriminant, case_token);
            self.emit_op(OpCode::MATCH_ENUM, case_token);
            self.emit_u16(enum_name, case_token);
            self.emit_u16(variant_name, case_token);
            let next_case = self.emit_jump(OpCode::JUMP_IF_FALSE, case_token);
            self.emit_op(OpCode::POP, case_token);

            self.begin_scope(case_token);
            if self.matches(TokenKind::LeftParen) {
                let mut payload_index = 0usize;
                if !self.check(TokenKind::RightParen) {
                    loop {
                        self.consume(TokenKind::Identifier, "expected a binding name");
                        let binding = self.previous();
                        let binding_name = self.identifier_constant(binding);
                        self.emit_op(OpCode::GET_VAR, binding);
                        self.emit_u16(discriminant, binding);
                        self.emit_op(OpCode::GET_PROPERTY, binding);
                        self.emit_u16(values_name, binding);
                        self.emit_constant(Value::Number(payload_index as f64), binding);
                        self.emit_op(OpCode::GET_INDEX, binding);
                        self.emit_op(OpCode::DEFINE_VAR, binding);
                        self.emit_u16(binding_name, binding);
                        payload_index += 1;
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(TokenKind::RightParen, "expected ')' after bindings");
            }
            self.consume(TokenKind::Colon, "expected ':' after match case");
            self.case_body();
            self.end_scope(case_token);
            let done = self.emit_jump(OpCode::JUMP, case_token);
            if let Some(ctx) = self.ctx_mut().break_stack.last_mut() {
                ctx.breaks.push(done);
            }
            self.patch_jump(next_case);
            self.emit_op(OpCode::POP, case_token);
        }
        if self.matches(TokenKind::Default) {
            self.consume(TokenKind::Colon, "expected ':' after 'default'");
            self.case_body();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after match body");
        self.finish_break_context();
        self.end_scope(keyword);
    }

    fn case_body(&mut self) {
        while !self.check(TokenKind::Case)
            && !self.check(TokenKind::Default)
            && !self.check(TokenKind::RightBrace)
            && !self.check(TokenKind::Eof)
        {
            self.declaration();
        }
    }

    fn return_statement(&mut self) {
        let keyword = self.previous();
        if self.matches(TokenKind::Semicolon) {
            self.emit_op(OpCode::NULL, keyword);
            self.emit_op(OpCode::RETURN, keyword);
            return;
        }
        if self.ctx().kind == FunctionKind::Initializer {
            self.error_at(keyword, "cannot return a value from an initializer");
        }
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after return value");
        self.emit_op(OpCode::RETURN, keyword);
    }

    fn break_statement(&mut self) {
        let keyword = self.previous();
        self.consume(TokenKind::Semicolon, "expected ';' after 'break'");
        let Some(depth) = self.ctx().break_stack.last().map(|b| b.depth) else {
            self.error_at(keyword, "'break' outside of a loop or switch");
            return;
        };
        self.emit_scope_unwind(depth, keyword);
        let jump = self.emit_jump(OpCode::JUMP, keyword);
        if let Some(ctx) = self.ctx_mut().break_stack.last_mut() {
            ctx.breaks.push(jump);
        }
    }

    fn continue_statement(&mut self) {
        let keyword = self.previous();
        self.consume(TokenKind::Semicolon, "expected ';' after 'continue'");
        let Some(index) = self.ctx().break_stack.iter().rposition(|b| b.is_loop) else {
            self.error_at(keyword, "'continue' outside of a loop");
            return;
        };
        let depth = self.ctx().break_stack[index].depth;
        let target = self.ctx().break_stack[index].continue_to;
        self.emit_scope_unwind(depth, keyword);
        match target {
            Some(loop_start) => self.emit_loop(loop_start, keyword),
            None => {
                let jump = self.emit_jump(OpCode::JUMP, keyword);
                self.ctx_mut().break_stack[index].continues.push(jump);
            }
        }
    }

    /// Emits the `END_SCOPE`s needed to jump out to `target_depth` without
    /// disturbing the compiler's own depth counter.
    fn emit_scope_unwind(&mut self, target_depth: u32, token: Token) {
        let mut depth = self.ctx().scope_depth;
        while depth > target_depth {
            self.emit_op(OpCode::END_SCOPE, token);
            depth -= 1;
        }
    }

    fn patch_continues(&mut self) {
        let continues = match self.ctx_mut().break_stack.last_mut() {
            Some(ctx) => std::mem::take(&mut ctx.continues),
            None => return,
        };
        for operand in continues {
            self.patch_jump(operand);
        }
    }

    fn finish_break_context(&mut self) {
        let Some(ctx) = self.ctx_mut().break_stack.pop() else {
            return;
        };
        for operand in ctx.breaks {
            self.patch_jump(operand);
        }
        debug_assert!(ctx.continues.is_empty(), "continues must be patched in-loop");
    }

    fn throw_statement(&mut self) {
        let keyword = self.previous();
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after throw value");
        self.emit_op(OpCode::THROW, keyword);
    }

    /// `try { ... } catch (e) { ... }` — `catch` is contextual, not a
    /// reserved word.
    fn try_statement(&mut self) {
        let keyword = self.previous();
        let try_operand = self.emit_jump(OpCode::TRY, keyword);

        self.consume(TokenKind::LeftBrace, "expected '{' after 'try'");
        self.begin_scope(keyword);
        self.block();
        self.end_scope(keyword);
        self.emit_op(OpCode::END_TRY, keyword);
        let done = self.emit_jump(OpCode::JUMP, keyword);

        // Handler entry: the unwinder pushes the error value
        self.patch_jump(try_operand);
        self.consume(TokenKind::Identifier, "expected 'catch' after try block");
        let catch_token = self.previous();
        if catch_token.lexeme(&self.program.source) != "catch" {
            self.error_at(catch_token, "expected 'catch' after try block");
        }
        self.consume(TokenKind::LeftParen, "expected '(' after 'catch'");
        self.consume(TokenKind::Identifier, "expected an error binding name");
        let binding = self.previous();
        let binding_name = self.identifier_constant(binding);
        self.consume(TokenKind::RightParen, "expected ')' after error binding");

        self.begin_scope(catch_token);
        self.emit_op(OpCode::DEFINE_VAR, binding);
        self.emit_u16(binding_name, binding);
        self.consume(TokenKind::LeftBrace, "expected '{' after catch clause");
        self.block();
        self.end_scope(catch_token);
        self.patch_jump(done);
    }

    // === Modules ===

    fn require_top_level(&mut self, keyword: Token, what: &str) -> bool {
        if self.at_top_level() {
            true
        } else {
            self.error_at(keyword, &format!("{what} is only allowed at the top level"));
            false
        }
    }

    /// Imports may sit inside blocks (so a failing load is catchable) but
    /// never inside a function body.
    fn require_root_context(&mut self, keyword: Token, what: &str) -> bool {
        if self.ctx.len() == 1 {
            true
        } else {
            self.error_at(keyword, &format!("{what} is not allowed inside a function"));
            false
        }
    }

    fn path_constant(&mut self) -> Option<Token> {
        self.consume(TokenKind::Str, "expected a module path string");
        let token = self.previous();
        let text = unescape(token.lexeme(&self.program.source));
        let handle = self.heap.intern(&text);
        self.emit_constant(Value::Obj(handle), token);
        Some(token)
    }

    fn import_statement(&mut self) {
        let keyword = self.previous();
        if !self.require_root_context(keyword, "'import'") {
            return;
        }
        match self.current().kind {
            // import "path" [as X];  /  import "path";
            TokenKind::Str => {
                self.path_constant();
                if self.matches(TokenKind::As) {
                    self.consume(TokenKind::Identifier, "expected an alias name");
                    let alias_token = self.previous();
                    let alias = self.identifier_constant(alias_token);
                    self.emit_op(OpCode::IMPORT, keyword);
                    self.emit_byte(1, keyword);
                    self.emit_u16(alias, keyword);
                } else {
                    self.emit_op(OpCode::IMPORT, keyword);
                    self.emit_byte(0, keyword);
                    self.emit_u16(0, keyword);
                }
            }
            // import * as X from "path";
            TokenKind::Star => {
                self.advance();
                self.consume(TokenKind::As, "expected 'as' after '*'");
                self.consume(TokenKind::Identifier, "expected an alias name");
                let alias_token = self.previous();
                let alias = self.identifier_constant(alias_token);
                self.consume(TokenKind::From, "expected 'from' after import alias");
                self.path_constant();
                self.emit_op(OpCode::IMPORT, keyword);
                self.emit_byte(1, keyword);
                self.emit_u16(alias, keyword);
            }
            // import X from "path";  — binds the default export
            TokenKind::Identifier => {
                self.advance();
                let binding = self.previous();
                let binding_name = self.identifier_constant(binding);
                self.consume(TokenKind::From, "expected 'from' after import name");
                self.path_constant();
                self.emit_op(OpCode::IMPORT_MODULE, keyword);
                let default_handle = self.heap.intern("default");
                let default_name = self.make_constant(Value::Obj(default_handle), keyword);
                self.emit_op(OpCode::GET_PROPERTY, keyword);
                self.emit_u16(default_name, keyword);
                self.emit_op(OpCode::DEFINE_VAR, binding);
                self.emit_u16(binding_name, binding);
            }
            _ => self.error_at_current("expected a module path or import name"),
        }
        self.consume(TokenKind::Semicolon, "expected ';' after import");
    }

    fn export_statement(&mut self) {
        let keyword = self.previous();
        if !self.require_top_level(keyword, "'export'") {
            return;
        }
        match self.current().kind {
            // export default expr;
            TokenKind::Default => {
                self.advance();
                self.expression();
                self.consume(TokenKind::Semicolon, "expected ';' after export value");
                let default_handle = self.heap.intern("default");
                let name = self.make_constant(Value::Obj(default_handle), keyword);
                self.emit_op(OpCode::EXPORT_VALUE, keyword);
                self.emit_u16(name, keyword);
            }
            // export { a as b, c } from "path";
            TokenKind::LeftBrace => {
                self.advance();
                let mut pairs: Vec<(u16, u16)> = Vec::new();
                if !self.check(TokenKind::RightBrace) {
                    loop {
                        self.consume(TokenKind::Identifier, "expected an export name");
                        let src_token = self.previous();
                        let src = self.identifier_constant(src_token);
                        let dst = if self.matches(TokenKind::As) {
                            self.consume(TokenKind::Identifier, "expected a name after 'as'");
                            let dst_token = self.previous();
                            self.identifier_constant(dst_token)
                        } else {
                            src
                        };
                        pairs.push((src, dst));
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(TokenKind::RightBrace, "expected '}' after export list");
                self.consume(TokenKind::From, "expected 'from' after export list");
                self.path_constant();
                self.consume(TokenKind::Semicolon, "expected ';' after export");
                self.emit_op(OpCode::IMPORT_MODULE, keyword);
                self.emit_op(OpCode::EXPORT_FROM, keyword);
                self.emit_u16(pairs.len().min(u16::MAX as usize) as u16, keyword);
                for (src, dst) in pairs {
                    self.emit_u16(src, keyword);
                    self.emit_u16(dst, keyword);
                }
            }
            // export * from "path";
            TokenKind::Star => {
                self.advance();
                self.consume(TokenKind::From, "expected 'from' after '*'");
                self.path_constant();
                self.consume(TokenKind::Semicolon, "expected ';' after export");
                self.emit_op(OpCode::IMPORT_MODULE, keyword);
                self.emit_op(OpCode::EXPORT_FROM, keyword);
                self.emit_u16(0, keyword);
            }
            // export <declaration>;  /  export NAME;
            TokenKind::Let => {
                self.advance();
                self.export_declared(Self::let_declaration, keyword);
            }
            TokenKind::Const => {
                self.advance();
                self.export_declared(Self::const_declaration, keyword);
            }
            TokenKind::Fun => {
                self.advance();
                self.export_declared(Self::fun_declaration, keyword);
            }
            TokenKind::Class => {
                self.advance();
                self.export_declared(Self::class_declaration, keyword);
            }
            TokenKind::Enum => {
                self.advance();
                self.export_declared(Self::enum_declaration, keyword);
            }
            TokenKind::Identifier => {
                self.advance();
                let name_token = self.previous();
                let name = self.identifier_constant(name_token);
                self.consume(TokenKind::Semicolon, "expected ';' after export name");
                self.emit_op(OpCode::EXPORT, name_token);
                self.emit_u16(name, name_token);
            }
            _ => self.error_at_current("expected a declaration or name after 'export'"),
        }
    }

    fn export_declared(
        &mut self,
        declare: fn(&mut Self) -> Option<Token>,
        keyword: Token,
    ) {
        if let Some(name_token) = declare(self) {
            let name = self.identifier_constant(name_token);
            self.emit_op(OpCode::EXPORT, keyword);
            self.emit_u16(name, keyword);
        }
    }

    fn private_declaration(&mut self) {
        let keyword = self.previous();
        if !self.require_top_level(keyword, "'private'") {
            return;
        }
        let declared = match self.current().kind {
            TokenKind::Let => {
                self.advance();
                self.let_declaration()
            }
            TokenKind::Const => {
                self.advance();
                self.const_declaration()
            }
            TokenKind::Fun => {
                self.advance();
                self.fun_declaration()
            }
            TokenKind::Class => {
                self.advance();
                self.class_declaration()
            }
            TokenKind::Enum => {
                self.advance();
                self.enum_declaration()
            }
            _ => {
                self.error_at_current("expected a declaration after 'private'");
                None
            }
        };
        if let Some(name_token) = declared {
            let name = self.identifier_constant(name_token);
            self.emit_op(OpCode::PRIVATE, keyword);
            self.emit_u16(name, keyword);
        }
    }

    fn hidden_name(&mut self, name: &str, token: Token) -> u16 {
        let handle = self.heap.intern(name);
        self.make_constant(Value::Obj(handle), token)
    }
}
