//! Input IL: one function in control-flow-graph form.
//!
//! The encoder does not care how this IL was produced (the upstream lowering
//! and closure analysis are a different crate); it only requires that operand
//! shapes are well-formed: label operands reference blocks that exist in the
//! same function and index operands are within their wire range.

use rustc_hash::FxHashMap;

/// Identifies a basic block within one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Address constraint on a block, honored by layout with padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    /// Final address must be even, so the address can carry a pointer tag in
    /// its low bit (catch targets).
    TwoByte,
    /// Final address `a` must satisfy `(a + 2) % 4 == 0`, so the 2-byte word
    /// preceding an async-resume continuation ends exactly on a 4-byte
    /// boundary.
    FourMinusTwoByte,
}

impl Alignment {
    /// Worst-case padding reserved until the final layout round.
    pub fn worst_pad(self) -> usize {
        match self {
            Alignment::TwoByte => 1,
            Alignment::FourMinusTwoByte => 3,
        }
    }

    /// Exact padding needed in front of address `addr`.
    pub fn pad_at(self, addr: i64) -> usize {
        match self {
            Alignment::TwoByte => (addr & 1) as usize,
            Alignment::FourMinusTwoByte => ((4 - ((addr + 2) % 4)) % 4) as usize,
        }
    }
}

/// A source position carried through for disassembly and source maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLoc {
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

/// A literal value as it appears in the IL.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// The undefined value.
    Undefined,
    /// The null value.
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i32),
    /// A string, interned into the snapshot constant table when it cannot be
    /// packed inline.
    Str(String),
}

/// An IL operation: an opcode tag with its opcode-fixed operand shape.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Pop the top of stack.
    Pop,
    /// Duplicate the top of stack.
    Dup,
    /// Return to the caller.
    Return,
    /// Throw the top of stack.
    Throw,
    /// Add.
    Add,
    /// Subtract.
    Sub,
    /// Multiply.
    Mul,
    /// Divide.
    Div,
    /// Remainder.
    Rem,
    /// Negate.
    Neg,
    /// Logical not.
    Not,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Push argument `n`.
    LoadArg(u8),
    /// Push local slot `n`.
    LoadVar(u8),
    /// Pop into local slot `n`.
    StoreVar(u8),
    /// Push a literal.
    LoadLiteral(Literal),
    /// Push a global by name.
    LoadGlobal(String),
    /// Pop into a global by name.
    StoreGlobal(String),
    /// Call another function in the snapshot.
    Call {
        /// Callee function name.
        callee: String,
        /// Number of arguments on the stack.
        arg_count: u8,
    },
    /// Call an imported host function.
    CallHost {
        /// Import name.
        import: String,
        /// Number of arguments on the stack.
        arg_count: u8,
    },
    /// Unconditional jump.
    Jump(BlockId),
    /// Two-instruction conditional composite: branch to `consequent` when
    /// the popped value is truthy, otherwise jump to `alternate`.
    Branch {
        /// Target when truthy.
        consequent: BlockId,
        /// Target when falsy.
        alternate: BlockId,
    },
    /// Push an exception handler whose target is `catch`.
    StartTry {
        /// Handler block; must carry [`Alignment::TwoByte`].
        catch: BlockId,
    },
    /// Pop the innermost exception handler.
    EndTry,
    /// Async continuation entry point; must open a
    /// [`Alignment::FourMinusTwoByte`] block.
    AsyncResume,
    /// `len` bytes of padding.
    Nop {
        /// Number of padding bytes.
        len: u8,
    },
    /// Debugger breakpoint. The wire format has no encoding for it yet.
    Breakpoint,
}

impl OpKind {
    /// Short name for diagnostics and listings.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Pop => "Pop",
            OpKind::Dup => "Dup",
            OpKind::Return => "Return",
            OpKind::Throw => "Throw",
            OpKind::Add => "Add",
            OpKind::Sub => "Sub",
            OpKind::Mul => "Mul",
            OpKind::Div => "Div",
            OpKind::Rem => "Rem",
            OpKind::Neg => "Neg",
            OpKind::Not => "Not",
            OpKind::Lt => "Lt",
            OpKind::Le => "Le",
            OpKind::Gt => "Gt",
            OpKind::Ge => "Ge",
            OpKind::Eq => "Eq",
            OpKind::Ne => "Ne",
            OpKind::LoadArg(_) => "LoadArg",
            OpKind::LoadVar(_) => "LoadVar",
            OpKind::StoreVar(_) => "StoreVar",
            OpKind::LoadLiteral(_) => "LoadLiteral",
            OpKind::LoadGlobal(_) => "LoadGlobal",
            OpKind::StoreGlobal(_) => "StoreGlobal",
            OpKind::Call { .. } => "Call",
            OpKind::CallHost { .. } => "CallHost",
            OpKind::Jump(_) => "Jump",
            OpKind::Branch { .. } => "Branch",
            OpKind::StartTry { .. } => "StartTry",
            OpKind::EndTry => "EndTry",
            OpKind::AsyncResume => "AsyncResume",
            OpKind::Nop { .. } => "Nop",
            OpKind::Breakpoint => "Breakpoint",
        }
    }

    /// Block ids referenced by label operands, in operand order.
    pub fn labels(&self) -> Vec<BlockId> {
        match self {
            OpKind::Jump(t) => vec![*t],
            OpKind::Branch {
                consequent,
                alternate,
            } => vec![*consequent, *alternate],
            OpKind::StartTry { catch } => vec![*catch],
            _ => Vec::new(),
        }
    }
}

/// An operation together with its originating source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// The opcode and operands.
    pub kind: OpKind,
    /// Source position, when the front end recorded one.
    pub loc: Option<SourceLoc>,
}

impl Operation {
    /// Creates an operation with no source position.
    pub fn new(kind: OpKind) -> Self {
        Self { kind, loc: None }
    }
}

/// A basic block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    /// Operations in execution order.
    pub operations: Vec<Operation>,
    /// Stack depth the VM expects on entry. Carried through for the
    /// verifier; layout itself does not consume it.
    pub expected_stack_depth: u16,
    /// Optional address constraint.
    pub alignment: Option<Alignment>,
}

/// One function in control-flow-graph form.
#[derive(Debug, Clone)]
pub struct FunctionIl {
    /// Function name, used for diagnostics and cross-function references.
    pub name: String,
    /// Entry block; always laid out first.
    pub entry: BlockId,
    /// All blocks by id.
    pub blocks: FxHashMap<BlockId, Block>,
    /// Maximum operand stack depth, stored in the function header.
    pub max_stack_depth: u8,
}
