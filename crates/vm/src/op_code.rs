//! OpCode module for the Erkao VM.
//!
//! This module defines the instruction set executed by the dispatch loop.
//! Multi-byte operands are little-endian. Jump distances are unsigned
//! 16-bit offsets: `JUMP`, `JUMP_IF_FALSE` and `TRY` move the instruction
//! pointer forward from the end of their operand bytes, `LOOP` moves it
//! backward.

macro_rules! byte_enum {
    ($(#[$meta:meta])* $vis:vis enum $name:ident {
        $($(#[$vmeta:meta])* $vname:ident,)*
    }) => {
        $(#[$meta])*
        $vis enum $name {
            $($(#[$vmeta])* $vname,)*
        }

        impl $name {
            /// Decodes a raw byte, if it names an instruction.
            pub fn from_byte(byte: u8) -> Option<Self> {
                match byte {
                    $(x if x == $name::$vname as u8 => Some($name::$vname),)*
                    _ => None,
                }
            }

            /// The mnemonic, for tracing.
            pub fn name(self) -> &'static str {
                match self {
                    $($name::$vname => stringify!($vname),)*
                }
            }
        }
    }
}

byte_enum! {
    /// One instruction of the Erkao VM.
    #[allow(non_camel_case_types)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(u8)]
    pub enum OpCode {
        // === Stack ===
        /// `CONSTANT <idx: u16>` — pushes `constants[idx]`
        CONSTANT,
        NULL,
        TRUE,
        FALSE,
        POP,

        // === Variables ===
        /// `GET_VAR <name: u16>` — pushes the binding visible in the
        /// current environment chain
        GET_VAR,
        /// `SET_VAR <name: u16>` — assigns the nearest binding; fails on
        /// `const` or undefined names. Leaves the value on the stack.
        SET_VAR,
        /// `DEFINE_VAR <name: u16>` — pops a value into a new mutable
        /// binding in the current environment
        DEFINE_VAR,
        /// `DEFINE_CONST <name: u16>` — pops a value into a new immutable
        /// binding
        DEFINE_CONST,
        /// `GET_THIS <name: u16>` — pushes the method receiver
        GET_THIS,

        // === Properties ===
        /// `GET_PROPERTY <name: u16>` — pops the receiver, pushes the
        /// property value
        GET_PROPERTY,
        /// Like `GET_PROPERTY` but yields `null` for a `null` receiver
        GET_PROPERTY_OPTIONAL,
        /// `SET_PROPERTY <name: u16>` — stack is `receiver, value`; leaves
        /// the value
        SET_PROPERTY,

        // === Indexing ===
        GET_INDEX,
        GET_INDEX_OPTIONAL,
        SET_INDEX,

        // === Type tests and shapes ===
        /// `MATCH_ENUM <enum: u16> <variant: u16>` — pops the tested value,
        /// pushes whether it is that variant
        MATCH_ENUM,
        IS_ARRAY,
        IS_MAP,
        LEN,
        /// Pops key and container, pushes membership
        MAP_HAS,

        // === Arithmetic and logic ===
        EQUAL,
        GREATER,
        GREATER_EQUAL,
        LESS,
        LESS_EQUAL,
        ADD,
        SUBTRACT,
        MULTIPLY,
        DIVIDE,
        NOT,
        NEGATE,
        STRINGIFY,

        // === Control flow ===
        /// `JUMP <offset: u16>` — forward
        JUMP,
        /// `JUMP_IF_FALSE <offset: u16>` — forward; peeks, does not pop
        JUMP_IF_FALSE,
        /// `LOOP <offset: u16>` — backward
        LOOP,
        /// `TRY <offset: u16>` — pushes a try-frame whose handler is at
        /// `ip + offset`
        TRY,
        END_TRY,
        THROW,
        /// The postfix `?` operator over `Result`/`Option` values
        TRY_UNWRAP,

        // === Calls ===
        /// `CALL <argc: u8>`
        CALL,
        /// `CALL_OPTIONAL <argc: u8>` — yields `null` without calling when
        /// the callee is `null`
        CALL_OPTIONAL,
        /// `INVOKE <name: u16> <argc: u8>` — fused property load + call
        INVOKE,
        /// Pushes the current frame's supplied argument count
        ARG_COUNT,
        /// `CLOSURE <idx: u16>` — instantiates the function template at
        /// `constants[idx]` over the current environment
        CLOSURE,
        RETURN,

        // === Scopes ===
        BEGIN_SCOPE,
        END_SCOPE,

        // === Classes ===
        /// `CLASS <name: u16> <methods: u16>` — pops the methods (in
        /// reverse declaration order), pushes the class
        CLASS,

        // === Modules ===
        /// `IMPORT <has_alias: u8> <alias: u16>` — pops the path, loads
        /// the module, binds the alias
        IMPORT,
        /// Pops the path, loads the module, pushes its instance
        IMPORT_MODULE,
        /// `EXPORT <name: u16>` — copies a binding into the module record
        EXPORT,
        /// `PRIVATE <name: u16>` — excludes a binding from the public
        /// export set
        PRIVATE,
        /// `EXPORT_VALUE <name: u16>` — pops a value into the module
        /// record (`export default`)
        EXPORT_VALUE,
        /// `EXPORT_FROM <count: u16> (<src: u16> <dst: u16>)*` — re-export
        /// from the instance on the stack; a count of 0 re-exports all
        EXPORT_FROM,

        // === Composites ===
        /// `ARRAY <capacity: u16>` — pushes a fresh array
        ARRAY,
        /// Stack `array, value` -> `array`
        ARRAY_APPEND,
        /// `MAP <capacity: u16>` — pushes a fresh map
        MAP,
        /// Stack `map, key, value` -> `map`
        MAP_SET,

        // === Runtime ===
        /// Cooperative safepoint; collection and budget work may run here
        GC,
    }
}

impl OpCode {
    /// Fixed operand length in bytes. `EXPORT_FROM` reports only its count
    /// word; the pair list length depends on the count and is decoded by
    /// [`crate::chunk::Chunk::instruction_len`].
    pub fn operand_len(self) -> usize {
        match self {
            OpCode::CONSTANT
            | OpCode::GET_VAR
            | OpCode::SET_VAR
            | OpCode::DEFINE_VAR
            | OpCode::DEFINE_CONST
            | OpCode::GET_THIS
            | OpCode::GET_PROPERTY
            | OpCode::GET_PROPERTY_OPTIONAL
            | OpCode::SET_PROPERTY
            | OpCode::JUMP
            | OpCode::JUMP_IF_FALSE
            | OpCode::LOOP
            | OpCode::TRY
            | OpCode::CLOSURE
            | OpCode::EXPORT
            | OpCode::PRIVATE
            | OpCode::EXPORT_VALUE
            | OpCode::EXPORT_FROM
            | OpCode::ARRAY
            | OpCode::MAP => 2,
            OpCode::MATCH_ENUM | OpCode::CLASS => 4,
            OpCode::CALL | OpCode::CALL_OPTIONAL => 1,
            OpCode::INVOKE | OpCode::IMPORT => 3,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for byte in 0..=u8::MAX {
            if let Some(op) = OpCode::from_byte(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(OpCode::from_byte(OpCode::GC as u8), Some(OpCode::GC));
        assert_eq!(OpCode::from_byte(0xFF), None);
    }

    #[test]
    fn test_operand_lengths() {
        assert_eq!(OpCode::CONSTANT.operand_len(), 2);
        assert_eq!(OpCode::MATCH_ENUM.operand_len(), 4);
        assert_eq!(OpCode::INVOKE.operand_len(), 3);
        assert_eq!(OpCode::IMPORT.operand_len(), 3);
        assert_eq!(OpCode::CALL.operand_len(), 1);
        assert_eq!(OpCode::RETURN.operand_len(), 0);
    }

    #[test]
    fn test_names() {
        assert_eq!(OpCode::JUMP_IF_FALSE.name(), "JUMP_IF_FALSE");
    }
}
