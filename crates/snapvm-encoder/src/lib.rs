// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2026 Pegasus Heavy Industries, LLC

//! # snapvm-encoder
//!
//! Bytecode layout and emission backend for the snapvm embeddable virtual
//! machine.
//!
//! ## Overview
//!
//! The encoder takes one function in control-flow-graph form ([`il::FunctionIl`])
//! and produces the exact final byte sequence for that function's allocation,
//! choosing the smallest legal encoding for every jump and branch and honoring
//! the per-block alignment constraints of the instruction set.
//!
//! Instruction sizes and block addresses are mutually dependent: a jump's
//! width depends on its displacement, which depends on the widths of
//! everything between it and its target. The crate resolves this with two
//! pieces:
//!
//! - [`future::Future`], a deferred value cell for "addresses not yet known",
//!   and [`region::Region`], an append-only binary builder that can write a
//!   deferred value as a placeholder and overwrite it in place once resolved;
//! - [`layout::encode_function`], a multi-pass relaxation that orders blocks,
//!   shrinks instruction sizes monotonically toward a fixed point, and then
//!   emits final bytes.
//!
//! Snapshot-wide concerns (string table, import table, short-call table,
//! cross-function addresses) are reached through the [`ctx::ModuleCx`]
//! capability trait supplied by the outer snapshot assembler.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use snapvm_encoder::{ctx::SnapshotTables, layout::encode_function};
//!
//! let tables = SnapshotTables::new();
//! let encoded = encode_function(&func, &tables)?;
//! let bytes = encoded.region.to_bytes()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ctx;
pub mod future;
pub mod il;
pub mod isa;
pub mod layout;
pub mod region;
pub mod strategy;

// Re-exports for convenience
pub use future::{Future, Lazy};
pub use il::{Alignment, Block, BlockId, FunctionIl, Literal, OpKind, Operation};
pub use layout::{EncodedFunction, encode_function};
pub use region::{NumFormat, Region};

use il::BlockId as ErrBlockId;

/// Errors reported by the encoder.
///
/// These are the user-facing failure modes: a program construct that does not
/// fit a fixed-width field of the snapshot format, or malformed input IL.
/// Violations of the encoder's own invariants (monotonic size shrink, a
/// placeholder overwritten at a different width, a deferred value read before
/// resolution) are compiler bugs and abort with a panic instead; continuing
/// past one would silently corrupt the output.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeError {
    /// A function's encoded body exceeds the 12-bit allocation size field.
    FunctionTooLarge {
        /// Name of the offending function.
        function: String,
        /// Size the body came out to, in bytes.
        size: usize,
        /// Maximum representable size.
        max: usize,
    },
    /// A snapshot-wide table ran out of representable indexes.
    CapacityExceeded {
        /// Which table or field overflowed.
        what: &'static str,
        /// The value that did not fit.
        value: i64,
        /// The largest representable value.
        max: i64,
    },
    /// A computed value does not fit the width committed for its slot.
    ValueOutOfRange {
        /// The value that did not fit.
        value: i64,
        /// Name of the wire format it was written with.
        format: &'static str,
        /// Byte offset of the slot within its region.
        offset: usize,
    },
    /// Strict materialization found a placeholder whose cell never resolved.
    UnresolvedPlaceholder {
        /// Byte offset of the placeholder within its region.
        offset: usize,
    },
    /// A label operand references a block id that is not in the function.
    UnknownBlock {
        /// Name of the offending function.
        function: String,
        /// The missing block id.
        block: ErrBlockId,
    },
    /// An IL opcode with no registered encoding strategy.
    UnsupportedOp {
        /// Name of the offending function.
        function: String,
        /// Name of the opcode.
        op: &'static str,
    },
    /// The IL is shaped in a way the instruction set cannot express.
    InvalidIl {
        /// Name of the offending function.
        function: String,
        /// What was wrong.
        detail: String,
    },
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::FunctionTooLarge {
                function,
                size,
                max,
            } => write!(
                f,
                "function '{}' is too large: {} bytes (max {})",
                function, size, max
            ),
            EncodeError::CapacityExceeded { what, value, max } => {
                write!(f, "{} overflow: {} exceeds maximum {}", what, value, max)
            }
            EncodeError::ValueOutOfRange {
                value,
                format,
                offset,
            } => write!(
                f,
                "value {} does not fit {} slot at offset {:#06x}",
                value, format, offset
            ),
            EncodeError::UnresolvedPlaceholder { offset } => {
                write!(f, "unresolved placeholder at offset {:#06x}", offset)
            }
            EncodeError::UnknownBlock { function, block } => {
                write!(f, "function '{}' references unknown block {}", function, block)
            }
            EncodeError::UnsupportedOp { function, op } => {
                write!(f, "function '{}' uses unsupported opcode {}", function, op)
            }
            EncodeError::InvalidIl { function, detail } => {
                write!(f, "invalid IL in function '{}': {}", function, detail)
            }
        }
    }
}

impl std::error::Error for EncodeError {}
