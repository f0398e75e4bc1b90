// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2026 Pegasus Heavy Industries, LLC

//! Per-function instruction layout.
//!
//! Instruction widths and block addresses are mutually dependent, so
//! [`encode_function`] relaxes them toward a fixed point in a fixed pass
//! order:
//!
//! 1. **Pass 1, ordering and worst case.** A reorderable work queue starting
//!    at the entry block builds each operation's plan, fixes the block output
//!    order (honoring "schedule my target next" preferences from jumps), and
//!    records worst-case address/size estimates, including worst-case
//!    alignment padding reservations.
//! 2. **Pass 2, non-final round.** Walks the fixed order; each variable
//!    instruction commits a shape from tentative distances computed against a
//!    consistent generation of estimates. Sizes may shrink, never grow.
//! 3. **Snapshot and final round.** Current addresses/sizes become the new
//!    estimates and pass 2 reruns as the final round, so forward jumps see the
//!    tighter estimates produced behind them; alignment padding becomes
//!    exact and must not exceed its reservation.
//! 4. **Output pass.** Walks the order once more, emitting padding and bytes
//!    into a [`Region`]; each operation's measured byte delta must equal its
//!    committed size.
//!
//! Two refinement rounds are a documented relaxation, not a proven general
//! fixed point: they are sufficient for this instruction set's encoding
//! classes (far, close, fallthrough jumps and the two alignment tags), and
//! the monotonic-shrink assertion is the runtime check standing in for a
//! proof. Extending the instruction set means re-justifying the round count.
//!
//! All address arithmetic is an upper-bound argument: a displacement's
//! magnitude equals the total size of the instructions and padding between
//! the jump's end and its target, and under monotonic shrinking that total
//! only decreases, so a form chosen against estimates never becomes too
//! small for the final distances.

use std::collections::VecDeque;
use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::EncodeError;
use crate::ctx::ModuleCx;
use crate::future::Future;
use crate::il::{Alignment, BlockId, FunctionIl, OpKind, SourceLoc};
use crate::isa::{self, CODE_START, MAX_FUNCTION_SIZE, OP_NOP};
use crate::region::{NumFormat, Region};
use crate::strategy::{self, EmitQuery, InstrPlan, LayoutQuery, Refined, Shape};

/// Final placement of one instruction, for disassembly and source maps.
#[derive(Debug, Clone)]
pub struct OpListing {
    /// Opcode name.
    pub op: &'static str,
    /// Block the operation belongs to.
    pub block: BlockId,
    /// Final address within the function allocation.
    pub address: usize,
    /// Final encoded size in bytes.
    pub size: usize,
    /// Source position, when the IL carried one.
    pub loc: Option<SourceLoc>,
}

/// The result of laying out one function.
///
/// `Region` carries registered post-processing callbacks, so the debug
/// representation shows the layout results and elides the region itself.
pub struct EncodedFunction {
    /// The function's bytes as a region; placeholders for cross-function
    /// addresses stay pending until the outer assembler resolves them.
    pub region: Region,
    /// Total allocation size in bytes, header included.
    pub size: usize,
    /// Per-operation placement, in output order.
    pub listing: Vec<OpListing>,
}

impl fmt::Debug for EncodedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedFunction")
            .field("size", &self.size)
            .field("listing", &self.listing)
            .finish_non_exhaustive()
    }
}

/// Ephemeral per-operation state; discarded when layout completes.
struct OpState {
    plan: InstrPlan,
    name: &'static str,
    loc: Option<SourceLoc>,
    address_estimate: i64,
    size_estimate: usize,
    address: i64,
    size: usize,
    shape: Shape,
}

/// Ephemeral per-block state.
struct BlockState {
    alignment: Option<Alignment>,
    pad_reservation: usize,
    pad: usize,
    address_estimate: i64,
    address: i64,
    ops: Vec<OpState>,
}

struct RefineWindow<'a> {
    block_estimates: &'a FxHashMap<BlockId, i64>,
    op_end_estimate: i64,
}

impl LayoutQuery for RefineWindow<'_> {
    fn offset_to(&self, target: BlockId) -> i64 {
        self.block_estimates[&target] - self.op_end_estimate
    }
}

struct FinalAddresses<'a> {
    block_addresses: &'a FxHashMap<BlockId, i64>,
    op_address: i64,
}

impl EmitQuery for FinalAddresses<'_> {
    fn address_of(&self, target: BlockId) -> i64 {
        self.block_addresses[&target]
    }

    fn op_address(&self) -> i64 {
        self.op_address
    }
}

/// Lays out one function and emits its final bytes into a region.
///
/// Cross-function address operands stay deferred inside the region; the
/// caller materializes once they are resolved. All layout metadata is local
/// to this call.
pub fn encode_function(
    func: &FunctionIl,
    ctx: &dyn ModuleCx,
) -> Result<EncodedFunction, EncodeError> {
    let (order, mut states) = plan_and_order(func, ctx)?;

    run_refinement_round(&order, &mut states, false);
    snapshot_estimates(&order, &mut states);
    let total = run_refinement_round(&order, &mut states, true);

    if total as usize > MAX_FUNCTION_SIZE {
        return Err(EncodeError::FunctionTooLarge {
            function: func.name.clone(),
            size: total as usize,
            max: MAX_FUNCTION_SIZE,
        });
    }

    emit_output(func, &order, &states, total)
}

/// Pass 1: fix the block order and record worst-case estimates.
fn plan_and_order(
    func: &FunctionIl,
    ctx: &dyn ModuleCx,
) -> Result<(Vec<BlockId>, FxHashMap<BlockId, BlockState>), EncodeError> {
    let mut order = Vec::new();
    let mut states: FxHashMap<BlockId, BlockState> = FxHashMap::default();
    let mut queue: VecDeque<BlockId> = VecDeque::new();
    let mut scheduled: FxHashSet<BlockId> = FxHashSet::default();

    queue.push_back(func.entry);
    scheduled.insert(func.entry);

    let mut addr = CODE_START;
    while let Some(id) = queue.pop_front() {
        let block = func.blocks.get(&id).ok_or_else(|| EncodeError::UnknownBlock {
            function: func.name.clone(),
            block: id,
        })?;

        let pad_reservation = block.alignment.map_or(0, Alignment::worst_pad);
        addr += pad_reservation as i64;
        let mut state = BlockState {
            alignment: block.alignment,
            pad_reservation,
            pad: pad_reservation,
            address_estimate: addr,
            address: addr,
            ops: Vec::new(),
        };

        let mut preference: Option<BlockId> = None;
        let mut referenced: Vec<BlockId> = Vec::new();
        for (index, operation) in block.operations.iter().enumerate() {
            validate_op_shape(func, id, index, &operation.kind)?;
            for label in operation.kind.labels() {
                if !func.blocks.contains_key(&label) {
                    return Err(EncodeError::UnknownBlock {
                        function: func.name.clone(),
                        block: label,
                    });
                }
                referenced.push(label);
            }
            let plan = strategy::plan_op(&func.name, &operation.kind, ctx, &mut |target| {
                // First request for a target wins; already-scheduled blocks
                // cannot be pulled forward again.
                if preference.is_none() && !scheduled.contains(&target) {
                    preference = Some(target);
                }
            })?;
            let max = plan.max_size();
            state.ops.push(OpState {
                plan,
                name: operation.kind.name(),
                loc: operation.loc,
                address_estimate: addr,
                size_estimate: max,
                address: addr,
                size: max,
                shape: Shape::Fixed,
            });
            addr += max as i64;
        }

        if let Some(preferred) = preference {
            scheduled.insert(preferred);
            queue.push_front(preferred);
        }
        for label in referenced {
            if scheduled.insert(label) {
                queue.push_back(label);
            }
        }

        order.push(id);
        states.insert(id, state);
    }

    Ok((order, states))
}

/// Structural checks that do not depend on layout.
fn validate_op_shape(
    func: &FunctionIl,
    block: BlockId,
    index: usize,
    kind: &OpKind,
) -> Result<(), EncodeError> {
    match kind {
        OpKind::AsyncResume => {
            let owner = &func.blocks[&block];
            if index != 0 || owner.alignment != Some(Alignment::FourMinusTwoByte) {
                return Err(EncodeError::InvalidIl {
                    function: func.name.clone(),
                    detail: format!(
                        "AsyncResume must open a FourMinusTwoByte-aligned block (found in {} at index {})",
                        block, index
                    ),
                });
            }
        }
        OpKind::StartTry { catch } => {
            if let Some(target) = func.blocks.get(catch) {
                if target.alignment != Some(Alignment::TwoByte) {
                    return Err(EncodeError::InvalidIl {
                        function: func.name.clone(),
                        detail: format!("catch target {} must be TwoByte-aligned", catch),
                    });
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// One pass-2 round. Returns the total size after the round.
fn run_refinement_round(
    order: &[BlockId],
    states: &mut FxHashMap<BlockId, BlockState>,
    is_final: bool,
) -> i64 {
    // A consistent generation of estimates for distance queries.
    let block_estimates: FxHashMap<BlockId, i64> = states
        .iter()
        .map(|(id, s)| (*id, s.address_estimate))
        .collect();

    let mut addr = CODE_START;
    for id in order {
        let state = states.get_mut(id).expect("ordered block has state");
        if let Some(alignment) = state.alignment {
            let pad = if is_final {
                alignment.pad_at(addr)
            } else {
                alignment.worst_pad()
            };
            assert!(
                pad <= state.pad_reservation,
                "alignment padding for {} grew past its reservation ({} > {})",
                id,
                pad,
                state.pad_reservation
            );
            state.pad = pad;
            addr += pad as i64;
        }
        state.address = addr;
        for op in &mut state.ops {
            op.address = addr;
            let window = RefineWindow {
                block_estimates: &block_estimates,
                op_end_estimate: op.address_estimate + op.size_estimate as i64,
            };
            let Refined { size, shape } = op.plan.refine(&window);
            assert!(
                size <= op.size_estimate,
                "instruction {} at {} grew from {} to {} bytes",
                op.name,
                op.address,
                op.size_estimate,
                size
            );
            op.size = size;
            op.shape = shape;
            addr += size as i64;
        }
    }
    addr
}

/// Copies the round's addresses and sizes into the estimate fields, making
/// them the next round's consistent generation.
fn snapshot_estimates(order: &[BlockId], states: &mut FxHashMap<BlockId, BlockState>) {
    for id in order {
        let state = states.get_mut(id).expect("ordered block has state");
        state.address_estimate = state.address;
        for op in &mut state.ops {
            op.address_estimate = op.address;
            op.size_estimate = op.size;
        }
    }
}

/// Output pass: append padding and final bytes, checking every committed
/// size against what was actually written.
fn emit_output(
    func: &FunctionIl,
    order: &[BlockId],
    states: &FxHashMap<BlockId, BlockState>,
    total: i64,
) -> Result<EncodedFunction, EncodeError> {
    let block_addresses: FxHashMap<BlockId, i64> =
        states.iter().map(|(id, s)| (*id, s.address)).collect();

    let mut region = Region::new();
    let mut listing = Vec::new();

    // The header word carries the allocation size; it is chained from the
    // region's own end marker rather than written directly, so the header
    // stays correct under any later region composition.
    let header = Future::new();
    region.append(header.clone(), NumFormat::U16)?;
    region.append(func.max_stack_depth as i64, NumFormat::U8)?;

    for id in order {
        let state = &states[id];
        if state.pad > 0 {
            region.push_bytes(&vec![OP_NOP; state.pad]);
        }
        assert_eq!(
            region.byte_len() as i64,
            state.address,
            "block {} landed away from its final address",
            id
        );
        for op in &state.ops {
            let before = region.byte_len();
            let q = FinalAddresses {
                block_addresses: &block_addresses,
                op_address: op.address,
            };
            op.plan.emit(
                &Refined {
                    size: op.size,
                    shape: op.shape,
                },
                &q,
                &mut region,
            )?;
            let emitted = region.byte_len() - before;
            assert_eq!(
                emitted, op.size,
                "instruction {} emitted {} bytes but committed {}",
                op.name, emitted, op.size
            );
            listing.push(OpListing {
                op: op.name,
                block: *id,
                address: op.address as usize,
                size: op.size,
                loc: op.loc,
            });
        }
    }

    assert_eq!(region.byte_len() as i64, total, "output diverged from layout");
    let end = region.current_offset();
    header.assign(end.map(|size: &i64| isa::function_header_word(*size)));

    Ok(EncodedFunction {
        region,
        size: total as usize,
        listing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::SnapshotTables;
    use crate::il::{Block, Literal, Operation};

    fn block(ops: Vec<OpKind>) -> Block {
        Block {
            operations: ops.into_iter().map(Operation::new).collect(),
            expected_stack_depth: 0,
            alignment: None,
        }
    }

    fn function(entry: u32, blocks: Vec<(u32, Block)>) -> FunctionIl {
        FunctionIl {
            name: "test_fn".into(),
            entry: BlockId(entry),
            blocks: blocks
                .into_iter()
                .map(|(id, b)| (BlockId(id), b))
                .collect(),
            max_stack_depth: 4,
        }
    }

    fn encode(func: &FunctionIl) -> EncodedFunction {
        let tables = SnapshotTables::new();
        encode_function(func, &tables).expect("encoding should succeed")
    }

    #[test]
    fn test_straight_line_bytes() {
        let func = function(
            0,
            vec![(
                0,
                block(vec![
                    OpKind::LoadLiteral(Literal::Int(1)),
                    OpKind::LoadLiteral(Literal::Int(2)),
                    OpKind::Add,
                    OpKind::Return,
                ]),
            )],
        );
        let encoded = encode(&func);
        let bytes = encoded.region.to_bytes().unwrap();
        // header(2) + depth(1) + two 3-byte literals + add + return
        assert_eq!(bytes.len(), 11);
        assert_eq!(encoded.size, 11);
        // 12-bit size plus function type tag, little-endian
        assert_eq!(bytes[0], 11);
        assert_eq!(bytes[1], 0x80);
        assert_eq!(bytes[2], 4);
        assert_eq!(bytes[10], isa::OP_RETURN);
    }

    #[test]
    fn test_determinism() {
        let func = function(
            0,
            vec![
                (
                    0,
                    block(vec![
                        OpKind::LoadVar(0),
                        OpKind::Branch {
                            consequent: BlockId(1),
                            alternate: BlockId(2),
                        },
                    ]),
                ),
                (1, block(vec![OpKind::Return])),
                (2, block(vec![OpKind::Throw])),
            ],
        );
        let a = encode(&func).region.to_bytes().unwrap();
        let b = encode(&func).region.to_bytes().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_preferred_block_collapses_jump() {
        // entry jumps to 1; the preference schedules 1 immediately next, so
        // the jump costs zero bytes.
        let func = function(
            0,
            vec![
                (0, block(vec![OpKind::Jump(BlockId(1))])),
                (1, block(vec![OpKind::Return])),
            ],
        );
        let encoded = encode(&func);
        let bytes = encoded.region.to_bytes().unwrap();
        assert_eq!(bytes.len(), 4);
        assert_eq!(bytes[3], isa::OP_RETURN);
        let jump = encoded.listing.iter().find(|l| l.op == "Jump").unwrap();
        assert_eq!(jump.size, 0);
    }

    #[test]
    fn test_monotonic_shrink_in_listing() {
        let func = function(
            0,
            vec![
                (0, block(vec![OpKind::Jump(BlockId(1))])),
                (1, block(vec![OpKind::Return])),
            ],
        );
        let encoded = encode(&func);
        for entry in &encoded.listing {
            assert!(entry.size <= 6);
        }
    }

    #[test]
    fn test_encoded_function_debug_formatting() {
        // Result<EncodedFunction, _> must be unwrappable in tests, which
        // requires a working Debug representation.
        let func = function(0, vec![(0, block(vec![OpKind::Return]))]);
        let text = format!("{:?}", encode(&func));
        assert!(text.contains("size: 4"), "debug output was: {text}");
        assert!(text.contains("Return"));
    }

    #[test]
    fn test_unknown_block_reported() {
        let func = function(0, vec![(0, block(vec![OpKind::Jump(BlockId(9))]))]);
        let tables = SnapshotTables::new();
        let err = encode_function(&func, &tables).unwrap_err();
        assert_eq!(
            err,
            EncodeError::UnknownBlock {
                function: "test_fn".into(),
                block: BlockId(9)
            }
        );
    }

    #[test]
    fn test_unsupported_op_fails_in_pass_1() {
        let func = function(0, vec![(0, block(vec![OpKind::Breakpoint]))]);
        let tables = SnapshotTables::new();
        let err = encode_function(&func, &tables).unwrap_err();
        assert!(matches!(err, EncodeError::UnsupportedOp { .. }));
    }

    #[test]
    fn test_function_too_large() {
        // 33 nops of 127 bytes exceed the 12-bit size field
        let ops: Vec<OpKind> = (0..33).map(|_| OpKind::Nop { len: 127 }).collect();
        let func = function(0, vec![(0, block(ops))]);
        let tables = SnapshotTables::new();
        let err = encode_function(&func, &tables).unwrap_err();
        assert!(matches!(err, EncodeError::FunctionTooLarge { .. }));
    }

    #[test]
    fn test_async_resume_must_open_aligned_block() {
        let func = function(
            0,
            vec![(0, block(vec![OpKind::AsyncResume, OpKind::Return]))],
        );
        let tables = SnapshotTables::new();
        let err = encode_function(&func, &tables).unwrap_err();
        assert!(matches!(err, EncodeError::InvalidIl { .. }));
    }

    #[test]
    fn test_call_stays_pending_until_callee_resolves() {
        let func = function(
            0,
            vec![(
                0,
                block(vec![
                    OpKind::Call {
                        callee: "other".into(),
                        arg_count: 0,
                    },
                    OpKind::Return,
                ]),
            )],
        );
        let tables = SnapshotTables::new();
        // Fill the short-call table so the call uses the long, address-taking
        // form.
        for i in 0..isa::SHORT_CALL_CAPACITY {
            tables.short_call_slot(&format!("fill{}", i), 0);
        }
        let encoded = encode_function(&func, &tables).unwrap();
        assert!(matches!(
            encoded.region.to_bytes().unwrap_err(),
            EncodeError::UnresolvedPlaceholder { .. }
        ));
        tables.set_function_address("other", 0x0240);
        let bytes = encoded.region.to_bytes().unwrap();
        assert_eq!(bytes[3], isa::OP_CALL);
        assert_eq!(&bytes[4..6], &[0x40, 0x02]);
    }
}
