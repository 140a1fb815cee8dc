//! Peephole constant folding for the Erkao compiler.
//!
//! Runs once over a completed chunk: spans that push only constants and
//! feed a unary or binary operator are rewritten into a single constant
//! push. `ADD` over two constant strings concatenates. Because folding
//! shrinks the stream, every jump operand is relocated through an
//! old-offset to new-offset map, and no fold may consume an instruction
//! that a jump lands on (other than the first push of the span, whose new
//! position is exactly the folded push).

use hashbrown::{HashMap, HashSet};

use crate::chunk::Chunk;
use crate::heap::Heap;
use crate::op_code::OpCode;
use crate::token::Token;
use crate::value::{format_number, Value};

/// A constant push already emitted into the rebuilt stream.
struct PendingConst {
    /// Offset of the push in the new code
    offset: usize,
    value: Value,
}

struct Rebuilder {
    code: Vec<u8>,
    tokens: Vec<Token>,
}

impl Rebuilder {
    fn write_byte(&mut self, byte: u8, token: Token) {
        self.code.push(byte);
        self.tokens.push(token);
    }

    fn write_u16(&mut self, value: u16, token: Token) {
        let [lo, hi] = value.to_le_bytes();
        self.write_byte(lo, token);
        self.write_byte(hi, token);
    }

    fn truncate(&mut self, len: usize) {
        self.code.truncate(len);
        self.tokens.truncate(len);
    }
}

/// Rewrites `chunk` in place with constant-feeding spans folded.
pub(crate) fn fold_constants(chunk: &mut Chunk, heap: &mut Heap) {
    let targets = collect_jump_targets(chunk);

    let mut out = Rebuilder {
        code: Vec::with_capacity(chunk.code.len()),
        tokens: Vec::with_capacity(chunk.tokens.len()),
    };
    let mut offset_map: HashMap<usize, usize> = HashMap::new();
    let mut window: Vec<PendingConst> = Vec::new();
    // (new operand offset, old target, backward?)
    let mut jump_patches: Vec<(usize, usize, bool)> = Vec::new();

    let mut offset = 0;
    while offset < chunk.code.len() {
        let len = chunk.instruction_len(offset);
        if targets.contains(&offset) {
            // A jump lands here; nothing before it may be folded into it
            window.clear();
        }
        offset_map.insert(offset, out.code.len());
        let token = chunk.token_at(offset);
        let op = OpCode::from_byte(chunk.code[offset]);

        match op {
            Some(OpCode::CONSTANT) => {
                let idx = chunk.read_u16(offset + 1);
                let value = chunk.constants[idx as usize];
                let new_offset = out.code.len();
                out.write_byte(OpCode::CONSTANT as u8, token);
                out.write_u16(idx, token);
                window.push(PendingConst {
                    offset: new_offset,
                    value,
                });
            }
            Some(OpCode::NULL) | Some(OpCode::TRUE) | Some(OpCode::FALSE) => {
                let value = match op {
                    Some(OpCode::TRUE) => Value::Bool(true),
                    Some(OpCode::FALSE) => Value::Bool(false),
                    _ => Value::Null,
                };
                let new_offset = out.code.len();
                out.write_byte(chunk.code[offset], token);
                window.push(PendingConst {
                    offset: new_offset,
                    value,
                });
            }
            Some(op @ (OpCode::NEGATE | OpCode::NOT | OpCode::STRINGIFY)) => {
                let folded = window
                    .last()
                    .and_then(|operand| fold_unary(op, operand.value, heap));
                match folded {
                    Some(value) => {
                        let Some(operand) = window.pop() else {
                            unreachable!()
                        };
                        out.truncate(operand.offset);
                        emit_folded(chunk, &mut out, &mut window, value, token);
                    }
                    None => {
                        out.write_byte(op as u8, token);
                        window.clear();
                    }
                }
            }
            Some(
                op @ (OpCode::ADD
                | OpCode::SUBTRACT
                | OpCode::MULTIPLY
                | OpCode::DIVIDE
                | OpCode::EQUAL
                | OpCode::GREATER
                | OpCode::GREATER_EQUAL
                | OpCode::LESS
                | OpCode::LESS_EQUAL),
            ) => {
                let folded = if window.len() >= 2 {
                    let rhs = window[window.len() - 1].value;
                    let lhs = window[window.len() - 2].value;
                    fold_binary(op, lhs, rhs, heap)
                } else {
                    None
                };
                match folded {
                    Some(value) => {
                        window.pop();
                        let Some(lhs) = window.pop() else { unreachable!() };
                        out.truncate(lhs.offset);
                        emit_folded(chunk, &mut out, &mut window, value, token);
                    }
                    None => {
                        out.write_byte(op as u8, token);
                        window.clear();
                    }
                }
            }
            Some(
                jump @ (OpCode::JUMP | OpCode::JUMP_IF_FALSE | OpCode::TRY | OpCode::LOOP),
            ) => {
                let operand = chunk.read_u16(offset + 1) as usize;
                let old_target = if jump == OpCode::LOOP {
                    offset + 3 - operand
                } else {
                    offset + 3 + operand
                };
                out.write_byte(jump as u8, token);
                jump_patches.push((out.code.len(), old_target, jump == OpCode::LOOP));
                out.write_u16(0xFFFF, token);
                window.clear();
            }
            _ => {
                // Verbatim copy, operands included
                for i in offset..offset + len {
                    out.write_byte(chunk.code[i], chunk.token_at(i));
                }
                window.clear();
            }
        }

        offset += len;
    }
    offset_map.insert(chunk.code.len(), out.code.len());

    // Relocate jumps through the offset map
    for (operand_offset, old_target, backward) in jump_patches {
        let Some(&new_target) = offset_map.get(&old_target) else {
            // A target inside a folded span cannot occur by construction;
            // leave the placeholder to fail loudly if it ever does
            continue;
        };
        let distance = if backward {
            (operand_offset + 2) - new_target
        } else {
            new_target - (operand_offset + 2)
        };
        let [lo, hi] = (distance as u16).to_le_bytes();
        out.code[operand_offset] = lo;
        out.code[operand_offset + 1] = hi;
    }

    chunk.code = out.code;
    chunk.tokens = out.tokens;
    chunk.reset_caches();
}

fn collect_jump_targets(chunk: &Chunk) -> HashSet<usize> {
    let mut targets = HashSet::new();
    let mut offset = 0;
    while offset < chunk.code.len() {
        match OpCode::from_byte(chunk.code[offset]) {
            Some(OpCode::JUMP) | Some(OpCode::JUMP_IF_FALSE) | Some(OpCode::TRY) => {
                let operand = chunk.read_u16(offset + 1) as usize;
                targets.insert(offset + 3 + operand);
            }
            Some(OpCode::LOOP) => {
                let operand = chunk.read_u16(offset + 1) as usize;
                targets.insert(offset + 3 - operand);
            }
            _ => {}
        }
        offset += chunk.instruction_len(offset);
    }
    targets
}

/// Emits a folded constant, preferring the dedicated literal opcodes.
/// Skipped (by the callers) when the constant pool is full.
fn emit_folded(
    chunk: &mut Chunk,
    out: &mut Rebuilder,
    window: &mut Vec<PendingConst>,
    value: Value,
    token: Token,
) {
    let new_offset = out.code.len();
    match value {
        Value::Null => out.write_byte(OpCode::NULL as u8, token),
        Value::Bool(true) => out.write_byte(OpCode::TRUE as u8, token),
        Value::Bool(false) => out.write_byte(OpCode::FALSE as u8, token),
        other => {
            let Some(idx) = chunk.add_constant(other) else {
                // Pool exhausted; the compiler already reported the chunk
                // as oversized, keep the stream well-formed
                out.write_byte(OpCode::NULL as u8, token);
                window.push(PendingConst {
                    offset: new_offset,
                    value: Value::Null,
                });
                return;
            };
            out.write_byte(OpCode::CONSTANT as u8, token);
            out.write_u16(idx, token);
        }
    }
    window.push(PendingConst {
        offset: new_offset,
        value,
    });
}

fn fold_unary(op: OpCode, value: Value, heap: &mut Heap) -> Option<Value> {
    match op {
        OpCode::NEGATE => value.as_number().map(|n| Value::Number(-n)),
        OpCode::NOT => Some(Value::Bool(value.is_falsey())),
        OpCode::STRINGIFY => {
            let text = match value {
                Value::Null => "null".to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => format_number(n),
                Value::Obj(handle) => heap.str_value(handle)?.to_string(),
            };
            Some(Value::Obj(heap.intern(&text)))
        }
        _ => None,
    }
}

fn fold_binary(op: OpCode, lhs: Value, rhs: Value, heap: &mut Heap) -> Option<Value> {
    if op == OpCode::EQUAL {
        return Some(Value::Bool(lhs == rhs));
    }
    if op == OpCode::ADD {
        if let (Value::Obj(a), Value::Obj(b)) = (lhs, rhs) {
            let joined = match (heap.str_value(a), heap.str_value(b)) {
                (Some(a), Some(b)) => format!("{a}{b}"),
                _ => return None,
            };
            return Some(Value::Obj(heap.intern(&joined)));
        }
    }
    let (a, b) = (lhs.as_number()?, rhs.as_number()?);
    let folded = match op {
        OpCode::ADD => Value::Number(a + b),
        OpCode::SUBTRACT => Value::Number(a - b),
        OpCode::MULTIPLY => Value::Number(a * b),
        OpCode::DIVIDE => Value::Number(a / b),
        OpCode::GREATER => Value::Bool(a > b),
        OpCode::GREATER_EQUAL => Value::Bool(a >= b),
        OpCode::LESS => Value::Bool(a < b),
        OpCode::LESS_EQUAL => Value::Bool(a <= b),
        _ => return None,
    };
    Some(folded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::GcTuning;

    fn tok() -> Token {
        Token::synthetic()
    }

    fn push_const(chunk: &mut Chunk, value: Value) {
        let idx = chunk.add_constant(value).unwrap();
        chunk.write_op(OpCode::CONSTANT, tok());
        chunk.write_u16(idx, tok());
    }

    #[test]
    fn test_folds_arithmetic_chain() {
        let mut heap = Heap::new(GcTuning::default());
        let mut chunk = Chunk::new();
        // 1 + 2 * 3  =>  CONSTANT 1; CONSTANT 2; CONSTANT 3; MULTIPLY; ADD
        push_const(&mut chunk, Value::Number(1.0));
        push_const(&mut chunk, Value::Number(2.0));
        push_const(&mut chunk, Value::Number(3.0));
        chunk.write_op(OpCode::MULTIPLY, tok());
        chunk.write_op(OpCode::ADD, tok());
        chunk.write_op(OpCode::RETURN, tok());

        fold_constants(&mut chunk, &mut heap);

        assert_eq!(chunk.code[0], OpCode::CONSTANT as u8);
        let idx = chunk.read_u16(1) as usize;
        assert_eq!(chunk.constants[idx], Value::Number(7.0));
        assert_eq!(chunk.code[3], OpCode::RETURN as u8);
        assert_eq!(chunk.len(), 4);
        assert_eq!(chunk.tokens.len(), chunk.code.len());
    }

    #[test]
    fn test_folds_string_concatenation() {
        let mut heap = Heap::new(GcTuning::default());
        let mut chunk = Chunk::new();
        let a = heap.intern("foo");
        let b = heap.intern("bar");
        push_const(&mut chunk, Value::Obj(a));
        push_const(&mut chunk, Value::Obj(b));
        chunk.write_op(OpCode::ADD, tok());
        chunk.write_op(OpCode::RETURN, tok());

        fold_constants(&mut chunk, &mut heap);

        let idx = chunk.read_u16(1) as usize;
        let Value::Obj(joined) = chunk.constants[idx] else {
            panic!("expected a string constant");
        };
        assert_eq!(heap.str_value(joined), Some("foobar"));
    }

    #[test]
    fn test_folds_comparison_to_literal_op() {
        let mut heap = Heap::new(GcTuning::default());
        let mut chunk = Chunk::new();
        push_const(&mut chunk, Value::Number(1.0));
        push_const(&mut chunk, Value::Number(2.0));
        chunk.write_op(OpCode::LESS, tok());
        chunk.write_op(OpCode::RETURN, tok());

        fold_constants(&mut chunk, &mut heap);

        assert_eq!(chunk.code[0], OpCode::TRUE as u8);
        assert_eq!(chunk.code[1], OpCode::RETURN as u8);
    }

    #[test]
    fn test_mixed_operands_do_not_fold() {
        let mut heap = Heap::new(GcTuning::default());
        let mut chunk = Chunk::new();
        let s = heap.intern("x");
        push_const(&mut chunk, Value::Obj(s));
        push_const(&mut chunk, Value::Number(1.0));
        chunk.write_op(OpCode::ADD, tok());
        chunk.write_op(OpCode::RETURN, tok());

        let before = chunk.len();
        fold_constants(&mut chunk, &mut heap);
        assert_eq!(chunk.len(), before);
    }

    #[test]
    fn test_jump_relocation_across_folded_span() {
        let mut heap = Heap::new(GcTuning::default());
        let mut chunk = Chunk::new();
        // JUMP over a foldable span to a POP at the end
        chunk.write_op(OpCode::JUMP, tok());
        chunk.write_u16(0, tok());
        let jump_operand = 1;
        push_const(&mut chunk, Value::Number(1.0));
        push_const(&mut chunk, Value::Number(2.0));
        chunk.write_op(OpCode::ADD, tok());
        let target = chunk.len();
        chunk.write_op(OpCode::POP, tok());
        chunk.write_op(OpCode::RETURN, tok());
        chunk.patch_u16(jump_operand, (target - 3) as u16);

        fold_constants(&mut chunk, &mut heap);

        // The folded chunk: JUMP <d>; CONSTANT 3.0; POP; RETURN
        let distance = chunk.read_u16(1) as usize;
        let landed = 3 + distance;
        assert_eq!(chunk.code[landed], OpCode::POP as u8);
    }

    #[test]
    fn test_no_fold_across_jump_target() {
        let mut heap = Heap::new(GcTuning::default());
        let mut chunk = Chunk::new();
        // The second push is a LOOP target; the ADD must not fold
        push_const(&mut chunk, Value::Number(1.0));
        let target = chunk.len();
        push_const(&mut chunk, Value::Number(2.0));
        chunk.write_op(OpCode::ADD, tok());
        chunk.write_op(OpCode::LOOP, tok());
        let operand = chunk.len();
        chunk.write_u16(0, tok());
        let distance = (operand + 2) - target;
        chunk.patch_u16(operand, distance as u16);
        chunk.write_op(OpCode::RETURN, tok());

        fold_constants(&mut chunk, &mut heap);

        let adds = chunk
            .code
            .iter()
            .filter(|b| **b == OpCode::ADD as u8)
            .count();
        assert_eq!(adds, 1, "span crossed by a jump target must stay");
    }
}
