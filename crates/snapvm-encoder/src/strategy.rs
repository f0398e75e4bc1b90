//! Per-opcode instruction strategies.
//!
//! [`plan_op`] maps one IL operation to an [`InstrPlan`]: either a fixed
//! parts list whose size is exact immediately, or a variable form that
//! reports a worst-case size and commits its real shape during refinement,
//! once tentative neighbor addresses exist. The plan/refine/emit staging is
//! deliberately data-shaped rather than a chain of captured closures: the
//! layout algorithm drives each stage explicitly.

use crate::EncodeError;
use crate::ctx::ModuleCx;
use crate::future::Lazy;
use crate::il::{BlockId, OpKind};
use crate::isa::{
    self, OP_ASYNC_RESUME, OP_BRANCH_LONG, OP_BRANCH_SHORT, OP_CALL, OP_CALL_HOST,
    OP_CALL_SHORT_BASE, OP_END_TRY, OP_JUMP_LONG, OP_JUMP_SHORT, OP_LOAD_ARG, OP_LOAD_CONST,
    OP_LOAD_GLOBAL, OP_LOAD_LITERAL, OP_LOAD_VAR, OP_NOP, OP_START_TRY, OP_STORE_GLOBAL,
    OP_STORE_VAR, fits_i8, fits_i16,
};
use crate::region::{NumFormat, Region};

/// One piece of a fixed-size instruction.
#[derive(Debug)]
pub enum Part {
    /// A literal byte.
    Byte(u8),
    /// A numeric slot, possibly deferred.
    Num(Lazy<i64>, NumFormat),
}

impl Part {
    fn width(&self) -> usize {
        match self {
            Part::Byte(_) => 1,
            Part::Num(_, format) => format.width(),
        }
    }
}

/// An instruction plan: worst-case size up front, exact shape on refinement.
#[derive(Debug)]
pub enum InstrPlan {
    /// Exact size known at plan time; the overwhelming majority of opcodes.
    Fixed(Vec<Part>),
    /// Unconditional jump: 0, 2 or 3 bytes.
    Jump {
        /// Jump target.
        target: BlockId,
    },
    /// The conditional two-instruction composite.
    Branch {
        /// Target when truthy (conditional half).
        consequent: BlockId,
        /// Target when falsy (unconditional half).
        alternate: BlockId,
    },
    /// Exception handler push; needs the catch block's final address.
    StartTry {
        /// Catch handler block.
        catch: BlockId,
    },
    /// Padding bytes.
    Nop {
        /// Number of padding bytes.
        len: u8,
    },
    /// Continuation header word plus resume opcode; needs its own final
    /// address for the backward-distance arithmetic.
    AsyncResume,
}

/// Shape committed by refinement, consumed unchanged by emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Parts emitted as planned.
    Fixed,
    /// Jump form selected by displacement: elided, short, or long.
    Jump,
    /// Byte split of the branch composite.
    Branch {
        /// Size of the conditional half (2 or 3).
        primary: usize,
        /// Size of the unconditional half (0, 2 or 3).
        secondary: usize,
    },
}

/// Result of refining a plan against tentative addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refined {
    /// Committed size in bytes.
    pub size: usize,
    /// Committed shape.
    pub shape: Shape,
}

/// Tentative address information available during refinement.
pub trait LayoutQuery {
    /// Signed distance from the end of the current instruction to the start
    /// of `target`, computed from a consistent generation of estimates.
    /// Because sizes only ever shrink, its magnitude is an upper bound on
    /// the final displacement.
    fn offset_to(&self, target: BlockId) -> i64;
}

/// Final concrete addresses available during emission.
pub trait EmitQuery {
    /// Final address of a block.
    fn address_of(&self, target: BlockId) -> i64;

    /// Final address of the instruction being emitted.
    fn op_address(&self) -> i64;
}

impl InstrPlan {
    /// Largest size this instruction can possibly occupy.
    pub fn max_size(&self) -> usize {
        match self {
            InstrPlan::Fixed(parts) => parts.iter().map(Part::width).sum(),
            InstrPlan::Jump { .. } => 3,
            // 3-byte conditional half plus 3-byte unconditional half
            InstrPlan::Branch { .. } => 6,
            InstrPlan::StartTry { .. } => 3,
            InstrPlan::Nop { len } => *len as usize,
            InstrPlan::AsyncResume => 3,
        }
    }

    /// Commits a size and shape from tentative distances. Sizes may shrink
    /// across successive refinements but never grow.
    pub fn refine(&self, q: &dyn LayoutQuery) -> Refined {
        match self {
            InstrPlan::Fixed(parts) => Refined {
                size: parts.iter().map(Part::width).sum(),
                shape: Shape::Fixed,
            },
            InstrPlan::Jump { target } => Refined {
                size: jump_size(q.offset_to(*target)),
                shape: Shape::Jump,
            },
            InstrPlan::Branch {
                consequent,
                alternate,
            } => {
                // The tentative offset is measured from the end of the whole
                // composite, while the VM measures the conditional half's
                // displacement from the end of that half. The unconditional
                // half behind it may still occupy up to 3 bytes, so the
                // short form is safe only if both offset and offset+3 fit.
                let off_c = q.offset_to(*consequent);
                let primary = if fits_i8(off_c) && fits_i8(off_c + 3) {
                    2
                } else {
                    3
                };
                let secondary = jump_size(q.offset_to(*alternate));
                Refined {
                    size: primary + secondary,
                    shape: Shape::Branch { primary, secondary },
                }
            }
            InstrPlan::StartTry { .. } => Refined {
                size: 3,
                shape: Shape::Fixed,
            },
            InstrPlan::Nop { len } => Refined {
                size: *len as usize,
                shape: Shape::Fixed,
            },
            InstrPlan::AsyncResume => Refined {
                size: 3,
                shape: Shape::Fixed,
            },
        }
    }

    /// Renders the committed shape at its final address.
    ///
    /// # Panics
    ///
    /// Panics when a final displacement no longer fits the committed form.
    /// That is impossible while the monotonic-shrink invariant holds, and a
    /// fatal encoder bug otherwise.
    pub fn emit(
        &self,
        refined: &Refined,
        q: &dyn EmitQuery,
        out: &mut Region,
    ) -> Result<(), EncodeError> {
        match self {
            InstrPlan::Fixed(parts) => {
                for part in parts {
                    match part {
                        Part::Byte(b) => out.push_byte(*b),
                        Part::Num(value, format) => out.append(value.clone(), *format)?,
                    }
                }
                Ok(())
            }
            InstrPlan::Jump { target } => {
                let end = q.op_address() + refined.size as i64;
                let disp = q.address_of(*target) - end;
                emit_jump_form(out, refined.size, disp, OP_JUMP_SHORT, OP_JUMP_LONG)
            }
            InstrPlan::Branch {
                consequent,
                alternate,
            } => {
                let Shape::Branch { primary, secondary } = refined.shape else {
                    panic!("branch emitted with a non-branch shape");
                };
                let primary_end = q.op_address() + primary as i64;
                let disp_c = q.address_of(*consequent) - primary_end;
                match primary {
                    2 => {
                        assert!(fits_i8(disp_c), "committed short branch grew: {}", disp_c);
                        out.push_byte(OP_BRANCH_SHORT);
                        out.append(disp_c, NumFormat::I8)?;
                    }
                    3 => {
                        assert!(fits_i16(disp_c), "branch displacement overflow: {}", disp_c);
                        out.push_byte(OP_BRANCH_LONG);
                        out.append(disp_c, NumFormat::I16)?;
                    }
                    n => panic!("branch conditional half committed at {} bytes", n),
                }
                let secondary_end = primary_end + secondary as i64;
                let disp_a = q.address_of(*alternate) - secondary_end;
                emit_jump_form(out, secondary, disp_a, OP_JUMP_SHORT, OP_JUMP_LONG)
            }
            InstrPlan::StartTry { catch } => {
                let addr = q.address_of(*catch);
                assert_eq!(addr & 1, 0, "catch target at odd address {}", addr);
                out.push_byte(OP_START_TRY);
                out.append(isa::tag_catch_address(addr), NumFormat::U16)
            }
            InstrPlan::Nop { len } => {
                out.push_bytes(&vec![OP_NOP; *len as usize]);
                Ok(())
            }
            InstrPlan::AsyncResume => {
                let at = q.op_address();
                assert_eq!(
                    (at + 2) % 4,
                    0,
                    "async-resume continuation at {} is not addressable in quad words",
                    at
                );
                let back_quads = (at + 2) / 4;
                if back_quads > 0x3FFF {
                    return Err(EncodeError::CapacityExceeded {
                        what: "continuation header distance",
                        value: back_quads,
                        max: 0x3FFF,
                    });
                }
                out.append(isa::continuation_header_word(back_quads), NumFormat::U16)?;
                out.push_byte(OP_ASYNC_RESUME);
                Ok(())
            }
        }
    }
}

/// The 0/2/3-byte rule shared by plain jumps and the branch composite's
/// unconditional half.
fn jump_size(offset: i64) -> usize {
    if offset == 0 {
        0
    } else if fits_i8(offset) {
        2
    } else {
        3
    }
}

fn emit_jump_form(
    out: &mut Region,
    size: usize,
    disp: i64,
    short_op: u8,
    long_op: u8,
) -> Result<(), EncodeError> {
    match size {
        0 => {
            assert_eq!(disp, 0, "elided jump is no longer a fallthrough: {}", disp);
            Ok(())
        }
        2 => {
            assert!(fits_i8(disp), "committed short jump grew: {}", disp);
            out.push_byte(short_op);
            out.append(disp, NumFormat::I8)
        }
        3 => {
            assert!(fits_i16(disp), "jump displacement overflow: {}", disp);
            out.push_byte(long_op);
            out.append(disp, NumFormat::I16)
        }
        n => panic!("jump committed at {} bytes", n),
    }
}

/// Builds the plan for one operation.
///
/// `prefer_next` is the pass-1 block-ordering hook: a jump (or a branch's
/// unconditional arm) asks for its target to be scheduled immediately after
/// the current block, which collapses the jump to zero bytes whenever the
/// preference can be honored.
pub fn plan_op(
    function: &str,
    op: &OpKind,
    ctx: &dyn ModuleCx,
    prefer_next: &mut dyn FnMut(BlockId),
) -> Result<InstrPlan, EncodeError> {
    use Part::{Byte, Num};

    let fixed = |parts: Vec<Part>| Ok(InstrPlan::Fixed(parts));
    match op {
        OpKind::Pop => fixed(vec![Byte(isa::OP_POP)]),
        OpKind::Dup => fixed(vec![Byte(isa::OP_DUP)]),
        OpKind::Return => fixed(vec![Byte(isa::OP_RETURN)]),
        OpKind::Throw => fixed(vec![Byte(isa::OP_THROW)]),
        OpKind::Add => fixed(vec![Byte(isa::OP_ADD)]),
        OpKind::Sub => fixed(vec![Byte(isa::OP_SUB)]),
        OpKind::Mul => fixed(vec![Byte(isa::OP_MUL)]),
        OpKind::Div => fixed(vec![Byte(isa::OP_DIV)]),
        OpKind::Rem => fixed(vec![Byte(isa::OP_REM)]),
        OpKind::Neg => fixed(vec![Byte(isa::OP_NEG)]),
        OpKind::Not => fixed(vec![Byte(isa::OP_NOT)]),
        OpKind::Lt => fixed(vec![Byte(isa::OP_LT)]),
        OpKind::Le => fixed(vec![Byte(isa::OP_LE)]),
        OpKind::Gt => fixed(vec![Byte(isa::OP_GT)]),
        OpKind::Ge => fixed(vec![Byte(isa::OP_GE)]),
        OpKind::Eq => fixed(vec![Byte(isa::OP_EQ)]),
        OpKind::Ne => fixed(vec![Byte(isa::OP_NE)]),
        OpKind::LoadArg(index) => fixed(vec![Byte(OP_LOAD_ARG), Byte(*index)]),
        OpKind::LoadVar(index) => fixed(vec![Byte(OP_LOAD_VAR), Byte(*index)]),
        OpKind::StoreVar(index) => fixed(vec![Byte(OP_STORE_VAR), Byte(*index)]),
        OpKind::LoadLiteral(lit) => match isa::pack_literal(lit) {
            Some(packed) => fixed(vec![
                Byte(OP_LOAD_LITERAL),
                Num(Lazy::Now(packed as i64), NumFormat::U16),
            ]),
            None => fixed(vec![
                Byte(OP_LOAD_CONST),
                Num(Lazy::Later(ctx.intern_constant(lit)), NumFormat::U16),
            ]),
        },
        OpKind::LoadGlobal(name) => {
            let slot = ctx.global_slot(name)?;
            fixed(vec![
                Byte(OP_LOAD_GLOBAL),
                Num(Lazy::Now(slot as i64), NumFormat::U16),
            ])
        }
        OpKind::StoreGlobal(name) => {
            let slot = ctx.global_slot(name)?;
            fixed(vec![
                Byte(OP_STORE_GLOBAL),
                Num(Lazy::Now(slot as i64), NumFormat::U16),
            ])
        }
        OpKind::Call { callee, arg_count } => {
            match ctx.short_call_slot(callee, *arg_count) {
                Some(slot) => fixed(vec![Byte(OP_CALL_SHORT_BASE | slot)]),
                // Table full; fall back to the long form with the callee's
                // deferred image address.
                None => fixed(vec![
                    Byte(OP_CALL),
                    Num(Lazy::Later(ctx.function_address(callee)), NumFormat::U16),
                    Byte(*arg_count),
                ]),
            }
        }
        OpKind::CallHost { import, arg_count } => {
            let index = ctx.import_index(import)?;
            fixed(vec![Byte(OP_CALL_HOST), Byte(index), Byte(*arg_count)])
        }
        OpKind::Jump(target) => {
            prefer_next(*target);
            Ok(InstrPlan::Jump { target: *target })
        }
        OpKind::Branch {
            consequent,
            alternate,
        } => {
            // The unconditional arm is the one worth collapsing.
            prefer_next(*alternate);
            Ok(InstrPlan::Branch {
                consequent: *consequent,
                alternate: *alternate,
            })
        }
        OpKind::StartTry { catch } => Ok(InstrPlan::StartTry { catch: *catch }),
        OpKind::EndTry => fixed(vec![Byte(OP_END_TRY)]),
        OpKind::AsyncResume => Ok(InstrPlan::AsyncResume),
        OpKind::Nop { len } => Ok(InstrPlan::Nop { len: *len }),
        OpKind::Breakpoint => Err(EncodeError::UnsupportedOp {
            function: function.to_string(),
            op: op.name(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::SnapshotTables;
    use crate::il::Literal;

    struct FixedOffsets {
        offset: i64,
    }

    impl LayoutQuery for FixedOffsets {
        fn offset_to(&self, _target: BlockId) -> i64 {
            self.offset
        }
    }

    fn plan(op: OpKind) -> InstrPlan {
        let tables = SnapshotTables::new();
        plan_op("test", &op, &tables, &mut |_| {}).unwrap()
    }

    #[test]
    fn test_fixed_sizes() {
        assert_eq!(plan(OpKind::Pop).max_size(), 1);
        assert_eq!(plan(OpKind::LoadArg(3)).max_size(), 2);
        assert_eq!(
            plan(OpKind::LoadLiteral(Literal::Int(12))).max_size(),
            3
        );
    }

    #[test]
    fn test_interned_literal_uses_const_table() {
        let tables = SnapshotTables::new();
        let op = OpKind::LoadLiteral(Literal::Str("long string".into()));
        let plan = plan_op("test", &op, &tables, &mut |_| {}).unwrap();
        assert_eq!(plan.max_size(), 3);
        assert_eq!(tables.constants().len(), 1);
    }

    #[test]
    fn test_jump_refinement_forms() {
        let jump = InstrPlan::Jump { target: BlockId(0) };
        assert_eq!(jump.refine(&FixedOffsets { offset: 0 }).size, 0);
        assert_eq!(jump.refine(&FixedOffsets { offset: 100 }).size, 2);
        assert_eq!(jump.refine(&FixedOffsets { offset: -128 }).size, 2);
        assert_eq!(jump.refine(&FixedOffsets { offset: 200 }).size, 3);
        assert_eq!(jump.refine(&FixedOffsets { offset: -300 }).size, 3);
    }

    #[test]
    fn test_branch_primary_correction() {
        let branch = InstrPlan::Branch {
            consequent: BlockId(0),
            alternate: BlockId(0),
        };
        // 125 itself fits i8 but 125+3 does not, so the conditional half
        // must stay long while the secondary half is still uncommitted.
        let refined = branch.refine(&FixedOffsets { offset: 125 });
        assert_eq!(refined.shape, Shape::Branch { primary: 3, secondary: 2 });
        let refined = branch.refine(&FixedOffsets { offset: 60 });
        assert_eq!(refined.shape, Shape::Branch { primary: 2, secondary: 2 });
    }

    #[test]
    fn test_short_call_falls_back_when_full() {
        let tables = SnapshotTables::new();
        for i in 0..crate::isa::SHORT_CALL_CAPACITY {
            tables.short_call_slot(&format!("f{}", i), 0);
        }
        let op = OpKind::Call {
            callee: "late".into(),
            arg_count: 1,
        };
        let plan = plan_op("test", &op, &tables, &mut |_| {}).unwrap();
        assert_eq!(plan.max_size(), 4);
    }

    #[test]
    fn test_plan_debug_formatting() {
        // Result<InstrPlan, _> must be unwrappable in tests, which requires
        // a working Debug representation.
        let text = format!("{:?}", plan(OpKind::LoadArg(3)));
        assert!(text.contains("Fixed"), "debug output was: {text}");
        let text = format!("{:?}", plan(OpKind::Jump(BlockId(1))));
        assert!(text.contains("Jump"));
    }

    #[test]
    fn test_breakpoint_unsupported() {
        let tables = SnapshotTables::new();
        let err = plan_op("test", &OpKind::Breakpoint, &tables, &mut |_| {}).unwrap_err();
        assert!(matches!(err, EncodeError::UnsupportedOp { .. }));
    }
}
