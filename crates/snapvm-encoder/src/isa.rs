//! Wire encoding of the snapvm instruction set.
//!
//! Opcode bytes, the packed literal format, displacement ranges, and the
//! header words. Displacements are measured from the byte immediately after
//! the jump or branch instruction; a zero displacement on an unconditional
//! jump is a pure fallthrough and is elided entirely.

use crate::il::Literal;

// Stack and arithmetic (single byte)
/// Pop the top of stack.
pub const OP_POP: u8 = 0x01;
/// Duplicate the top of stack.
pub const OP_DUP: u8 = 0x02;
/// Return to the caller.
pub const OP_RETURN: u8 = 0x03;
/// Throw the top of stack.
pub const OP_THROW: u8 = 0x04;
/// One byte of padding.
pub const OP_NOP: u8 = 0x05;
/// Add.
pub const OP_ADD: u8 = 0x10;
/// Subtract.
pub const OP_SUB: u8 = 0x11;
/// Multiply.
pub const OP_MUL: u8 = 0x12;
/// Divide.
pub const OP_DIV: u8 = 0x13;
/// Remainder.
pub const OP_REM: u8 = 0x14;
/// Negate.
pub const OP_NEG: u8 = 0x15;
/// Logical not.
pub const OP_NOT: u8 = 0x16;
/// Less than.
pub const OP_LT: u8 = 0x18;
/// Less than or equal.
pub const OP_LE: u8 = 0x19;
/// Greater than.
pub const OP_GT: u8 = 0x1A;
/// Greater than or equal.
pub const OP_GE: u8 = 0x1B;
/// Equal.
pub const OP_EQ: u8 = 0x1C;
/// Not equal.
pub const OP_NE: u8 = 0x1D;

// Variables and literals
/// Push argument; u8 index follows.
pub const OP_LOAD_ARG: u8 = 0x20;
/// Push local slot; u8 index follows.
pub const OP_LOAD_VAR: u8 = 0x21;
/// Pop into local slot; u8 index follows.
pub const OP_STORE_VAR: u8 = 0x22;
/// Push a packed literal; u16le packed value follows.
pub const OP_LOAD_LITERAL: u8 = 0x23;
/// Push a constant-table entry; u16le table offset follows.
pub const OP_LOAD_CONST: u8 = 0x24;
/// Push a global; u16le slot follows.
pub const OP_LOAD_GLOBAL: u8 = 0x25;
/// Pop into a global; u16le slot follows.
pub const OP_STORE_GLOBAL: u8 = 0x26;

// Calls
/// Direct call; u16le target offset and u8 arg count follow.
pub const OP_CALL: u8 = 0x30;
/// Host call; u8 import index and u8 arg count follow.
pub const OP_CALL_HOST: u8 = 0x31;
/// Short call through the short-call table; the slot lives in the low
/// nibble of the opcode byte.
pub const OP_CALL_SHORT_BASE: u8 = 0x40;

// Control flow
/// Unconditional jump, signed 8-bit displacement.
pub const OP_JUMP_SHORT: u8 = 0x50;
/// Unconditional jump, signed 16-bit little-endian displacement.
pub const OP_JUMP_LONG: u8 = 0x51;
/// Branch if truthy, signed 8-bit displacement.
pub const OP_BRANCH_SHORT: u8 = 0x52;
/// Branch if truthy, signed 16-bit little-endian displacement.
pub const OP_BRANCH_LONG: u8 = 0x53;
/// Push exception handler; u16le tagged catch address follows.
pub const OP_START_TRY: u8 = 0x54;
/// Pop exception handler.
pub const OP_END_TRY: u8 = 0x55;
/// Async continuation entry; preceded by the continuation header word.
pub const OP_ASYNC_RESUME: u8 = 0x56;

/// Allocation type tag stored in the high nibble of the function header.
pub const TC_FUNCTION: u16 = 0x8;
/// The function header's size field is 12 bits.
pub const MAX_FUNCTION_SIZE: usize = 0xFFF;
/// Fixed capacity of the snapshot's short-call table.
pub const SHORT_CALL_CAPACITY: usize = 16;
/// Number of bytes before the first instruction: 2-byte header word plus the
/// max-stack-depth byte.
pub const CODE_START: i64 = 3;

/// True when `v` encodes as a signed 8-bit displacement.
pub fn fits_i8(v: i64) -> bool {
    (-0x80..=0x7F).contains(&v)
}

/// True when `v` encodes as a signed 16-bit displacement.
pub fn fits_i16(v: i64) -> bool {
    (-0x8000..=0x7FFF).contains(&v)
}

/// Function header word: 12-bit allocation size, 4-bit type tag.
///
/// The caller checks the size against [`MAX_FUNCTION_SIZE`] first; this is
/// pure bit packing.
pub fn function_header_word(size: i64) -> i64 {
    debug_assert!(size as usize <= MAX_FUNCTION_SIZE);
    (TC_FUNCTION as i64) << 12 | size
}

/// Synthetic header word preceding an async-resume continuation.
///
/// The low two bits tag the word; the rest is the backward distance from the
/// end of the word to the function header, in quad words. The distance
/// arithmetic is exact only because the word ends on a 4-byte boundary,
/// which is what [`Alignment::FourMinusTwoByte`](crate::il::Alignment)
/// guarantees.
pub fn continuation_header_word(back_quads: i64) -> i64 {
    debug_assert!((0..=0x3FFF).contains(&back_quads));
    back_quads << 2 | 0b01
}

/// Tags a catch-handler address with the handler marker in its low bit.
///
/// Valid only on even addresses, which is what
/// [`Alignment::TwoByte`](crate::il::Alignment) guarantees for catch blocks.
pub fn tag_catch_address(addr: i64) -> i64 {
    debug_assert_eq!(addr & 1, 0, "catch target must be 2-byte aligned");
    addr | 1
}

/// Packs a literal into its inline 16-bit runtime form, when it has one.
///
/// Well-known singletons get fixed codes; integers that fit 14 bits are
/// tagged small ints. Everything else goes through the snapshot constant
/// table instead.
pub fn pack_literal(lit: &Literal) -> Option<u16> {
    match lit {
        Literal::Undefined => Some(0x0001),
        Literal::Null => Some(0x0005),
        Literal::Bool(false) => Some(0x0009),
        Literal::Bool(true) => Some(0x000D),
        Literal::Int(n) if (-0x2000..0x2000).contains(n) => {
            Some(((*n as u16) << 2) | 0b11)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_displacement_ranges() {
        assert!(fits_i8(127) && fits_i8(-128));
        assert!(!fits_i8(128) && !fits_i8(-129));
        assert!(fits_i16(0x7FFF) && !fits_i16(0x8000));
    }

    #[test]
    fn test_pack_small_ints() {
        assert_eq!(pack_literal(&Literal::Int(0)), Some(0b11));
        assert_eq!(pack_literal(&Literal::Int(1)), Some(0b111));
        // sign bit survives the tag shift
        let packed = pack_literal(&Literal::Int(-1)).unwrap();
        assert_eq!(packed, 0xFFFF);
        assert_eq!(pack_literal(&Literal::Int(0x2000)), None);
        assert_eq!(pack_literal(&Literal::Int(-0x2001)), None);
    }

    #[test]
    fn test_pack_singletons() {
        assert_eq!(pack_literal(&Literal::Undefined), Some(0x0001));
        assert_eq!(pack_literal(&Literal::Str("x".into())), None);
    }

    #[test]
    fn test_header_words() {
        assert_eq!(function_header_word(0x123), 0x8123);
        assert_eq!(continuation_header_word(3), 0b1101);
        assert_eq!(tag_catch_address(8), 9);
    }
}
