//! End-to-end encoding scenarios.
//!
//! Each test builds a small control-flow graph, runs it through the full
//! layout pipeline, and checks the final byte image against the instruction
//! set rules: shortest-form jumps, alignment padding, deferred cross-function
//! addresses, and the function header word.

use snapvm_encoder::ctx::{ModuleCx, SnapshotTables};
use snapvm_encoder::il::{Alignment, SourceLoc};
use snapvm_encoder::isa;
use snapvm_encoder::{
    Block, BlockId, EncodedFunction, FunctionIl, Literal, OpKind, Operation, encode_function,
};

fn block(ops: Vec<OpKind>) -> Block {
    Block {
        operations: ops.into_iter().map(Operation::new).collect(),
        expected_stack_depth: 0,
        alignment: None,
    }
}

fn aligned_block(ops: Vec<OpKind>, alignment: Alignment) -> Block {
    Block {
        alignment: Some(alignment),
        ..block(ops)
    }
}

fn function(name: &str, entry: u32, blocks: Vec<(u32, Block)>) -> FunctionIl {
    FunctionIl {
        name: name.into(),
        entry: BlockId(entry),
        blocks: blocks
            .into_iter()
            .map(|(id, b)| (BlockId(id), b))
            .collect(),
        max_stack_depth: 8,
    }
}

fn encode(func: &FunctionIl) -> EncodedFunction {
    let tables = SnapshotTables::new();
    encode_function(func, &tables).expect("encoding should succeed")
}

fn header_size(bytes: &[u8]) -> usize {
    let word = u16::from_le_bytes([bytes[0], bytes[1]]);
    assert_eq!(word >> 12, isa::TC_FUNCTION, "wrong type tag in header");
    (word & 0xFFF) as usize
}

#[test]
fn test_jump_to_next_block_costs_nothing() {
    let func = function(
        "fallthrough",
        0,
        vec![
            (0, block(vec![OpKind::Jump(BlockId(1))])),
            (1, block(vec![OpKind::Return])),
        ],
    );
    let encoded = encode(&func);
    let bytes = encoded.region.to_bytes().unwrap();
    // header(2) + depth(1) + return(1); the jump vanished entirely
    assert_eq!(bytes.len(), 4);
    assert_eq!(header_size(&bytes), 4);
    assert_eq!(bytes[3], isa::OP_RETURN);
}

#[test]
fn test_far_backward_jump_takes_long_form() {
    // 130 bytes of padding push the backward displacement past i8 range.
    let func = function(
        "spin",
        0,
        vec![(
            0,
            block(vec![OpKind::Nop { len: 130 }, OpKind::Jump(BlockId(0))]),
        )],
    );
    let encoded = encode(&func);
    let bytes = encoded.region.to_bytes().unwrap();
    assert_eq!(bytes.len(), 136);
    assert_eq!(bytes[133], isa::OP_JUMP_LONG);
    // The stored displacement, added to the address just past the jump, must
    // land exactly on the entry block.
    let disp = i16::from_le_bytes([bytes[134], bytes[135]]) as i64;
    assert_eq!(136 + disp, 3);
}

#[test]
fn test_close_backward_jump_takes_short_form() {
    let func = function(
        "tight",
        0,
        vec![
            (
                0,
                block(vec![
                    OpKind::LoadLiteral(Literal::Int(0)),
                    OpKind::StoreVar(0),
                    OpKind::Jump(BlockId(1)),
                ]),
            ),
            (
                1,
                block(vec![
                    OpKind::LoadVar(0),
                    OpKind::LoadLiteral(Literal::Int(10)),
                    OpKind::Lt,
                    OpKind::Branch {
                        consequent: BlockId(2),
                        alternate: BlockId(3),
                    },
                ]),
            ),
            (
                2,
                block(vec![
                    OpKind::LoadVar(0),
                    OpKind::LoadLiteral(Literal::Int(1)),
                    OpKind::Add,
                    OpKind::StoreVar(0),
                    OpKind::Jump(BlockId(1)),
                ]),
            ),
            (3, block(vec![OpKind::Return])),
        ],
    );
    let encoded = encode(&func);
    let bytes = encoded.region.to_bytes().unwrap();
    assert_eq!(bytes.len(), 27);

    // The loop-exit block was scheduled right behind the condition, so the
    // branch composite is just its 2-byte conditional half.
    let branch = encoded.listing.iter().find(|l| l.op == "Branch").unwrap();
    assert_eq!(branch.size, 2);
    assert_eq!(bytes[branch.address], isa::OP_BRANCH_SHORT);

    // The loop-back jump at the end of the body is short and backward.
    let back = encoded
        .listing
        .iter()
        .rev()
        .find(|l| l.op == "Jump" && l.size > 0)
        .unwrap();
    assert_eq!(back.size, 2);
    assert_eq!(bytes[back.address], isa::OP_JUMP_SHORT);
    let disp = bytes[back.address + 1] as i8 as i64;
    assert!(disp < 0);
    let condition = encoded.listing.iter().find(|l| l.op == "LoadVar").unwrap();
    assert_eq!((back.address + back.size) as i64 + disp, condition.address as i64);
}

#[test]
fn test_catch_block_padded_to_even_address() {
    let func = function(
        "guarded",
        0,
        vec![
            (
                0,
                block(vec![
                    OpKind::StartTry { catch: BlockId(2) },
                    OpKind::Jump(BlockId(1)),
                ]),
            ),
            (
                1,
                // 3 bytes, leaving the next block at an odd address
                block(vec![OpKind::EndTry, OpKind::Pop, OpKind::Return]),
            ),
            (2, aligned_block(vec![OpKind::Throw], Alignment::TwoByte)),
        ],
    );
    let encoded = encode(&func);
    let bytes = encoded.region.to_bytes().unwrap();

    let throw = encoded.listing.iter().find(|l| l.op == "Throw").unwrap();
    assert_eq!(throw.address % 2, 0, "catch handler must land even");
    // One padding byte, and it reads as a nop.
    assert_eq!(bytes[throw.address - 1], isa::OP_NOP);

    // The handler operand carries the handler address with its low bit set.
    let start_try = encoded.listing.iter().find(|l| l.op == "StartTry").unwrap();
    let operand =
        u16::from_le_bytes([bytes[start_try.address + 1], bytes[start_try.address + 2]]) as usize;
    assert_eq!(operand, throw.address | 1);
}

#[test]
fn test_async_resume_continuation_header() {
    let func = function(
        "awaits",
        0,
        vec![
            (0, block(vec![OpKind::Jump(BlockId(1))])),
            (
                1,
                aligned_block(
                    vec![OpKind::AsyncResume, OpKind::Return],
                    Alignment::FourMinusTwoByte,
                ),
            ),
        ],
    );
    let encoded = encode(&func);
    let bytes = encoded.region.to_bytes().unwrap();

    let resume = encoded
        .listing
        .iter()
        .find(|l| l.op == "AsyncResume")
        .unwrap();
    let at = resume.address as i64;
    assert_eq!((at + 2) % 4, 0, "continuation word must be quad-addressable");

    // Low bits 0b01 mark a continuation header; the rest is the quad-word
    // distance back to the allocation start.
    let word = u16::from_le_bytes([bytes[resume.address], bytes[resume.address + 1]]) as i64;
    assert_eq!(word & 0b11, 0b01);
    assert_eq!((word >> 2) * 4, at + 2);
    assert_eq!(bytes[resume.address + 2], isa::OP_ASYNC_RESUME);
}

#[test]
fn test_encoding_is_deterministic() {
    let func = function(
        "same",
        0,
        vec![
            (
                0,
                block(vec![
                    OpKind::LoadArg(0),
                    OpKind::Branch {
                        consequent: BlockId(1),
                        alternate: BlockId(2),
                    },
                ]),
            ),
            (1, block(vec![OpKind::LoadLiteral(Literal::Bool(true)), OpKind::Return])),
            (2, block(vec![OpKind::LoadLiteral(Literal::Bool(false)), OpKind::Return])),
        ],
    );
    let a = encode(&func).region.to_bytes().unwrap();
    let b = encode(&func).region.to_bytes().unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_listing_is_dense_and_ordered() {
    let func = function(
        "listed",
        0,
        vec![
            (0, block(vec![OpKind::LoadArg(0), OpKind::Jump(BlockId(1))])),
            (1, block(vec![OpKind::Pop, OpKind::Return])),
        ],
    );
    let encoded = encode(&func);
    let mut cursor = 3;
    for entry in &encoded.listing {
        assert_eq!(entry.address, cursor);
        cursor += entry.size;
    }
    assert_eq!(cursor, encoded.size);
}

#[test]
fn test_short_call_encodes_in_one_byte() {
    let tables = SnapshotTables::new();
    let func = function(
        "caller",
        0,
        vec![(
            0,
            block(vec![
                OpKind::Call {
                    callee: "helper".into(),
                    arg_count: 2,
                },
                OpKind::Return,
            ]),
        )],
    );
    let encoded = encode_function(&func, &tables).unwrap();
    let bytes = encoded.region.to_bytes().unwrap();
    assert_eq!(bytes.len(), 5);
    assert_eq!(bytes[3], isa::OP_CALL_SHORT_BASE);
    assert_eq!(tables.short_calls(), vec![("helper".to_string(), 2)]);
}

#[test]
fn test_cross_function_address_resolves_late() {
    let tables = SnapshotTables::new();
    // Exhaust the short-call table so the call needs the callee's address.
    for i in 0..isa::SHORT_CALL_CAPACITY {
        tables.short_call_slot(&format!("warm{}", i), 0);
    }
    let func = function(
        "caller",
        0,
        vec![(
            0,
            block(vec![
                OpKind::Call {
                    callee: "callee".into(),
                    arg_count: 1,
                },
                OpKind::Return,
            ]),
        )],
    );
    let encoded = encode_function(&func, &tables).unwrap();

    // The byte image is complete except for the address slot.
    let dump = encoded.region.dump();
    assert!(dump.contains("??"), "dump should show the pending slot: {}", dump);
    assert!(encoded.region.to_bytes().is_err());

    tables.set_function_address("callee", 0x0150);
    let bytes = encoded.region.to_bytes().unwrap();
    assert_eq!(bytes[3], isa::OP_CALL);
    assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 0x0150);
    assert_eq!(bytes[6], 1);
}

#[test]
fn test_interned_constant_resolves_through_tables() {
    let tables = SnapshotTables::new();
    let func = function(
        "greets",
        0,
        vec![(
            0,
            block(vec![
                OpKind::LoadLiteral(Literal::Str("hello".into())),
                OpKind::Return,
            ]),
        )],
    );
    let encoded = encode_function(&func, &tables).unwrap();
    assert!(encoded.region.to_bytes().is_err());

    let constants = tables.constants();
    assert_eq!(constants.len(), 1);
    assert_eq!(constants[0].0, Literal::Str("hello".into()));
    constants[0].1.resolve(12);

    let bytes = encoded.region.to_bytes().unwrap();
    assert_eq!(bytes[3], isa::OP_LOAD_CONST);
    assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 12);
}

#[test]
fn test_packed_literals_skip_the_constant_table() {
    let tables = SnapshotTables::new();
    let func = function(
        "immediates",
        0,
        vec![(
            0,
            block(vec![
                OpKind::LoadLiteral(Literal::Undefined),
                OpKind::LoadLiteral(Literal::Null),
                OpKind::LoadLiteral(Literal::Bool(true)),
                OpKind::LoadLiteral(Literal::Int(-1)),
                OpKind::Return,
            ]),
        )],
    );
    let encoded = encode_function(&func, &tables).unwrap();
    assert!(tables.constants().is_empty());
    let bytes = encoded.region.to_bytes().unwrap();
    assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 0x0001);
    assert_eq!(u16::from_le_bytes([bytes[7], bytes[8]]), 0x0005);
    assert_eq!(u16::from_le_bytes([bytes[10], bytes[11]]), 0x000D);
    // 14-bit two's complement -1, shifted over the tag bits
    assert_eq!(
        u16::from_le_bytes([bytes[13], bytes[14]]),
        (0x3FFF << 2) | 0b11
    );
}

#[test]
fn test_header_word_matches_final_size() {
    let func = function(
        "sized",
        0,
        vec![(
            0,
            block(vec![OpKind::Nop { len: 40 }, OpKind::Return]),
        )],
    );
    let encoded = encode(&func);
    let bytes = encoded.region.to_bytes().unwrap();
    assert_eq!(header_size(&bytes), bytes.len());
    assert_eq!(encoded.size, bytes.len());
}

#[test]
fn test_source_locations_carry_into_listing() {
    let mut op = Operation::new(OpKind::Return);
    op.loc = Some(SourceLoc {
        line: 12,
        column: 4,
    });
    let func = function(
        "traced",
        0,
        vec![(
            0,
            Block {
                operations: vec![op],
                expected_stack_depth: 0,
                alignment: None,
            },
        )],
    );
    let encoded = encode(&func);
    assert_eq!(
        encoded.listing[0].loc,
        Some(SourceLoc {
            line: 12,
            column: 4
        })
    );
}
