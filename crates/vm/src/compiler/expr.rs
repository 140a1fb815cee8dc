//! Expression parsing for the Erkao compiler.
//!
//! One handler per token role; the tables at the bottom wire token kinds to
//! (prefix, infix, precedence) the way the Pratt driver expects.

use super::{Compiler, FunctionKind, InfixFn, Precedence, PrefixFn};
use crate::lexer::unescape;
use crate::op_code::OpCode;
use crate::token::TokenKind;
use crate::value::Value;

fn grouping(c: &mut Compiler, _can_assign: bool) {
    c.expression();
    c.consume(TokenKind::RightParen, "expected ')' after expression");
}

fn unary(c: &mut Compiler, _can_assign: bool) {
    let operator = c.previous();
    c.parse_precedence(Precedence::Unary);
    match operator.kind {
        TokenKind::Minus => c.emit_op(OpCode::NEGATE, operator),
        TokenKind::Bang => c.emit_op(OpCode::NOT, operator),
        _ => unreachable!("unary dispatched on wrong token"),
    }
}

fn binary(c: &mut Compiler, _can_assign: bool) {
    let operator = c.previous();
    let (_, precedence) = infix_rule(operator.kind).expect("binary rule");
    c.parse_precedence(precedence.next());

    match operator.kind {
        TokenKind::Plus => c.emit_op(OpCode::ADD, operator),
        TokenKind::Minus => c.emit_op(OpCode::SUBTRACT, operator),
        TokenKind::Star => c.emit_op(OpCode::MULTIPLY, operator),
        TokenKind::Slash => c.emit_op(OpCode::DIVIDE, operator),
        TokenKind::EqualEqual => c.emit_op(OpCode::EQUAL, operator),
        TokenKind::BangEqual => {
            c.emit_op(OpCode::EQUAL, operator);
            c.emit_op(OpCode::NOT, operator);
        }
        TokenKind::Greater => c.emit_op(OpCode::GREATER, operator),
        TokenKind::GreaterEqual => c.emit_op(OpCode::GREATER_EQUAL, operator),
        TokenKind::Less => c.emit_op(OpCode::LESS, operator),
        TokenKind::LessEqual => c.emit_op(OpCode::LESS_EQUAL, operator),
        TokenKind::In => c.emit_op(OpCode::MAP_HAS, operator),
        _ => unreachable!("binary dispatched on wrong token"),
    }
}

/// `and` short-circuits leaving the deciding operand's value on the stack:
/// the jump peeks, and only the taken-through path pops.
fn and_(c: &mut Compiler, _can_assign: bool) {
    let operator = c.previous();
    let end = c.emit_jump(OpCode::JUMP_IF_FALSE, operator);
    c.emit_op(OpCode::POP, operator);
    c.parse_precedence(Precedence::And.next());
    c.patch_jump(end);
}

fn or_(c: &mut Compiler, _can_assign: bool) {
    let operator = c.previous();
    let else_branch = c.emit_jump(OpCode::JUMP_IF_FALSE, operator);
    let end = c.emit_jump(OpCode::JUMP, operator);
    c.patch_jump(else_branch);
    c.emit_op(OpCode::POP, operator);
    c.parse_precedence(Precedence::Or.next());
    c.patch_jump(end);
}

fn number(c: &mut Compiler, _can_assign: bool) {
    let token = c.previous();
    let parsed: Result<f64, _> = token.lexeme(&c.program.source).parse();
    let value = match parsed {
        Ok(value) => value,
        Err(_) => {
            c.error_at(token, "malformed number literal");
            0.0
        }
    };
    c.emit_constant(Value::Number(value), token);
}

fn string(c: &mut Compiler, _can_assign: bool) {
    let token = c.previous();
    let text = unescape(token.lexeme(&c.program.source));
    let handle = c.heap.intern(&text);
    c.emit_constant(Value::Obj(handle), token);
}

/// An interpolated string: alternate segment pushes with stringified hole
/// expressions, concatenating left to right.
fn interpolation(c: &mut Compiler, _can_assign: bool) {
    let mut segment = c.previous();
    string(c, false);
    loop {
        c.expression();
        c.emit_op(OpCode::STRINGIFY, segment);
        c.emit_op(OpCode::ADD, segment);

        if c.matches(TokenKind::Interpolation) {
            segment = c.previous();
            string(c, false);
            c.emit_op(OpCode::ADD, segment);
            continue;
        }
        c.consume(TokenKind::Str, "unterminated string interpolation");
        segment = c.previous();
        string(c, false);
        c.emit_op(OpCode::ADD, segment);
        break;
    }
}

fn literal(c: &mut Compiler, _can_assign: bool) {
    let token = c.previous();
    match token.kind {
        TokenKind::True => c.emit_op(OpCode::TRUE, token),
        TokenKind::False => c.emit_op(OpCode::FALSE, token),
        TokenKind::Null => c.emit_op(OpCode::NULL, token),
        _ => unreachable!("literal dispatched on wrong token"),
    }
}

fn variable(c: &mut Compiler, can_assign: bool) {
    let token = c.previous();
    let name = c.identifier_constant(token);
    if can_assign && c.matches(TokenKind::Equal) {
        c.expression();
        c.emit_op(OpCode::SET_VAR, token);
        c.emit_u16(name, token);
    } else {
        c.emit_op(OpCode::GET_VAR, token);
        c.emit_u16(name, token);
    }
}

fn this_(c: &mut Compiler, _can_assign: bool) {
    let token = c.previous();
    let handle = c.heap.intern("this");
    let name = c.make_constant(Value::Obj(handle), token);
    c.emit_op(OpCode::GET_THIS, token);
    c.emit_u16(name, token);
}

/// `[a, b, ...]` — the capacity operand is patched once the element count
/// is known; elements append one at a time so literal stack depth stays
/// constant.
fn array_literal(c: &mut Compiler, _can_assign: bool) {
    let bracket = c.previous();
    c.emit_op(OpCode::ARRAY, bracket);
    let capacity_operand = c.chunk().len();
    c.emit_u16(0, bracket);

    let mut count: usize = 0;
    if !c.check(TokenKind::RightBracket) {
        loop {
            c.expression();
            c.emit_op(OpCode::ARRAY_APPEND, bracket);
            count += 1;
            if !c.matches(TokenKind::Comma) {
                break;
            }
            // Trailing comma
            if c.check(TokenKind::RightBracket) {
                break;
            }
        }
    }
    c.consume(TokenKind::RightBracket, "expected ']' after array elements");
    c.ctx_mut()
        .chunk
        .patch_u16(capacity_operand, count.min(u16::MAX as usize) as u16);
}

/// `{key: value, ...}` — keys are identifiers or string literals.
fn map_literal(c: &mut Compiler, _can_assign: bool) {
    let brace = c.previous();
    c.emit_op(OpCode::MAP, brace);
    let capacity_operand = c.chunk().len();
    c.emit_u16(0, brace);

    let mut count: usize = 0;
    if !c.check(TokenKind::RightBrace) {
        loop {
            if c.matches(TokenKind::Identifier) {
                let key = c.previous();
                let text = key.lexeme(&c.program.source).to_string();
                let handle = c.heap.intern(&text);
                c.emit_constant(Value::Obj(handle), key);
            } else if c.matches(TokenKind::Str) {
                string(c, false);
            } else {
                c.error_at_current("expected a map key");
                break;
            }
            c.consume(TokenKind::Colon, "expected ':' after map key");
            c.expression();
            c.emit_op(OpCode::MAP_SET, brace);
            count += 1;
            if !c.matches(TokenKind::Comma) {
                break;
            }
            if c.check(TokenKind::RightBrace) {
                break;
            }
        }
    }
    c.consume(TokenKind::RightBrace, "expected '}' after map entries");
    c.ctx_mut()
        .chunk
        .patch_u16(capacity_operand, count.min(u16::MAX as usize) as u16);
}

fn fun_expression(c: &mut Compiler, _can_assign: bool) {
    c.function(FunctionKind::Function, None);
}

fn argument_list(c: &mut Compiler) -> u8 {
    let mut count: u32 = 0;
    if !c.check(TokenKind::RightParen) {
        loop {
            c.expression();
            count += 1;
            if count > u8::MAX as u32 {
                c.error_at_current("cannot pass more than 255 arguments");
            }
            if !c.matches(TokenKind::Comma) {
                break;
            }
        }
    }
    c.consume(TokenKind::RightParen, "expected ')' after arguments");
    count.min(u8::MAX as u32) as u8
}

fn call(c: &mut Compiler, _can_assign: bool) {
    let paren = c.previous();
    let optional = std::mem::take(&mut c.pending_optional_call);
    let argc = argument_list(c);
    let op = if optional {
        OpCode::CALL_OPTIONAL
    } else {
        OpCode::CALL
    };
    c.emit_op(op, paren);
    c.emit_byte(argc, paren);
}

fn dot(c: &mut Compiler, can_assign: bool) {
    c.consume(TokenKind::Identifier, "expected a property name after '.'");
    let name_token = c.previous();
    let name = c.identifier_constant(name_token);

    if can_assign && c.matches(TokenKind::Equal) {
        c.expression();
        c.emit_op(OpCode::SET_PROPERTY, name_token);
        c.emit_u16(name, name_token);
    } else if c.matches(TokenKind::LeftParen) {
        let argc = argument_list(c);
        c.emit_op(OpCode::INVOKE, name_token);
        c.emit_u16(name, name_token);
        c.emit_byte(argc, name_token);
    } else {
        c.emit_op(OpCode::GET_PROPERTY, name_token);
        c.emit_u16(name, name_token);
    }
}

/// `?.` — optional property, optional index (`?.[`) or optional call
/// (`?.(`); the call form is deferred to the `(` infix through
/// `pending_optional_call`.
fn question_dot(c: &mut Compiler, _can_assign: bool) {
    let operator = c.previous();
    if c.matches(TokenKind::LeftBracket) {
        c.expression();
        c.consume(TokenKind::RightBracket, "expected ']' after index");
        c.emit_op(OpCode::GET_INDEX_OPTIONAL, operator);
        return;
    }
    if c.check(TokenKind::LeftParen) {
        c.pending_optional_call = true;
        return;
    }
    c.consume(TokenKind::Identifier, "expected a property name after '?.'");
    let name_token = c.previous();
    let name = c.identifier_constant(name_token);
    c.emit_op(OpCode::GET_PROPERTY_OPTIONAL, name_token);
    c.emit_u16(name, name_token);
    if c.check(TokenKind::LeftParen) {
        c.pending_optional_call = true;
    }
}

fn index(c: &mut Compiler, can_assign: bool) {
    let bracket = c.previous();
    c.expression();
    c.consume(TokenKind::RightBracket, "expected ']' after index");
    if can_assign && c.matches(TokenKind::Equal) {
        c.expression();
        c.emit_op(OpCode::SET_INDEX, bracket);
    } else {
        c.emit_op(OpCode::GET_INDEX, bracket);
    }
}

/// Postfix `?`: unwrap `Ok`/`Some`, early-return `Err`/`None`.
fn try_unwrap(c: &mut Compiler, _can_assign: bool) {
    let operator = c.previous();
    c.emit_op(OpCode::TRY_UNWRAP, operator);
}

pub(crate) fn prefix_rule(kind: TokenKind) -> Option<PrefixFn> {
    let rule: PrefixFn = match kind {
        TokenKind::LeftParen => grouping,
        TokenKind::Minus | TokenKind::Bang => unary,
        TokenKind::Number => number,
        TokenKind::Str => string,
        TokenKind::Interpolation => interpolation,
        TokenKind::True | TokenKind::False | TokenKind::Null => literal,
        TokenKind::Identifier => variable,
        TokenKind::This => this_,
        TokenKind::LeftBracket => array_literal,
        TokenKind::LeftBrace => map_literal,
        TokenKind::Fun => fun_expression,
        _ => return None,
    };
    Some(rule)
}

pub(crate) fn infix_rule(kind: TokenKind) -> Option<(InfixFn, Precedence)> {
    let rule: (InfixFn, Precedence) = match kind {
        TokenKind::Or => (or_, Precedence::Or),
        TokenKind::And => (and_, Precedence::And),
        TokenKind::EqualEqual | TokenKind::BangEqual => (binary, Precedence::Equality),
        TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual
        | TokenKind::In => (binary, Precedence::Comparison),
        TokenKind::Plus | TokenKind::Minus => (binary, Precedence::Term),
        TokenKind::Star | TokenKind::Slash => (binary, Precedence::Factor),
        TokenKind::LeftParen => (call, Precedence::Call),
        TokenKind::Dot => (dot, Precedence::Call),
        TokenKind::QuestionDot => (question_dot, Precedence::Call),
        TokenKind::LeftBracket => (index, Precedence::Call),
        TokenKind::Question => (try_unwrap, Precedence::Call),
        _ => return None,
    };
    Some(rule)
}
