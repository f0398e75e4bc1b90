// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2026 Pegasus Heavy Industries, LLC

//! Binary region builder.
//!
//! A [`Region`] is an append-only sequence of write actions. A write may
//! depend on a [`Future`]: the region then writes a placeholder of the
//! committed width and overwrites it in place once the cell resolves.
//! Regions nest, mirroring the hierarchical layout of the final binary
//! (functions inside a snapshot, blocks inside a function).
//!
//! Materialization walks the segments in order against a shared buffer.
//! While the walk is running, every unresolved placeholder holds a live
//! subscription, so a cell resolved later in the same walk (an offset
//! marker, a post-processed checksum) back-patches earlier bytes. After the
//! walk all subscriptions are detached. In strict mode a placeholder whose
//! cell never resolved is an error; the non-strict mode used for debug
//! listings renders it as pending instead.

use std::cell::RefCell;
use std::rc::Rc;

use crate::EncodeError;
use crate::future::{Future, Lazy, Subscription};

/// Wire formats for numeric slots. Multi-byte formats are little-endian.
///
/// The format is fixed at append time; re-encoding a resolved value at a
/// different width is impossible by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumFormat {
    /// Unsigned 8-bit.
    U8,
    /// Signed 8-bit.
    I8,
    /// Unsigned 16-bit little-endian.
    U16,
    /// Signed 16-bit little-endian.
    I16,
}

impl NumFormat {
    /// Width of the encoded value in bytes.
    pub fn width(self) -> usize {
        match self {
            NumFormat::U8 | NumFormat::I8 => 1,
            NumFormat::U16 | NumFormat::I16 => 2,
        }
    }

    /// Name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            NumFormat::U8 => "u8",
            NumFormat::I8 => "i8",
            NumFormat::U16 => "u16le",
            NumFormat::I16 => "i16le",
        }
    }

    fn in_range(self, value: i64) -> bool {
        match self {
            NumFormat::U8 => (0..=0xFF).contains(&value),
            NumFormat::I8 => (-0x80..=0x7F).contains(&value),
            NumFormat::U16 => (0..=0xFFFF).contains(&value),
            NumFormat::I16 => (-0x8000..=0x7FFF).contains(&value),
        }
    }

    /// Encodes `value` into `out`, which must be exactly [`width`](Self::width)
    /// bytes. Reports a capacity error when the value does not fit.
    pub fn encode(self, value: i64, offset: usize, out: &mut [u8]) -> Result<(), EncodeError> {
        debug_assert_eq!(out.len(), self.width());
        if !self.in_range(value) {
            return Err(EncodeError::ValueOutOfRange {
                value,
                format: self.name(),
                offset,
            });
        }
        let le = (value as u64).to_le_bytes();
        out.copy_from_slice(&le[..self.width()]);
        Ok(())
    }
}

enum Segment {
    /// Immediate bytes, coalesced with neighbors.
    Bytes(Vec<u8>),
    /// Fixed-width placeholder overwritten in place when the cell resolves.
    Deferred { future: Future<i64>, format: NumFormat },
    /// Zero-width marker resolving to the materialization offset.
    Marker(Future<i64>),
    /// A spliced child region.
    Nested(Region),
}

struct PostProcess {
    start: Future<i64>,
    end: Future<i64>,
    out: Future<i64>,
    func: Box<dyn Fn(&[u8]) -> i64>,
}

/// An append-only binary builder with deferred placeholders.
#[derive(Default)]
pub struct Region {
    segments: Vec<Segment>,
    post: Vec<PostProcess>,
}

/// One placeholder's bookkeeping during a materialization walk.
struct Patch {
    sub: Subscription<i64>,
    future: Future<i64>,
    offset: usize,
    width: usize,
}

/// Result of a materialization walk.
struct Rendered {
    bytes: Vec<u8>,
    /// `(offset, width)` of every placeholder still pending.
    pending: Vec<(usize, usize)>,
    /// First capacity error hit by a back-patch, kept for the listing.
    note: Option<EncodeError>,
}

impl Region {
    /// Creates an empty region.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Some(Segment::Bytes(tail)) = self.segments.last_mut() {
            tail.extend_from_slice(bytes);
        } else {
            self.segments.push(Segment::Bytes(bytes.to_vec()));
        }
    }

    /// Appends a single byte.
    pub fn push_byte(&mut self, byte: u8) {
        self.push_bytes(&[byte]);
    }

    /// Appends a numeric slot.
    ///
    /// A plain value is encoded immediately; a deferred cell is written as a
    /// same-width placeholder and overwritten in place once it resolves. The
    /// width is fixed by `format` here and never changes.
    pub fn append(
        &mut self,
        value: impl Into<Lazy<i64>>,
        format: NumFormat,
    ) -> Result<(), EncodeError> {
        match value.into() {
            Lazy::Now(v) => {
                let offset = self.byte_len();
                let mut buf = [0u8; 2];
                let out = &mut buf[..format.width()];
                format.encode(v, offset, out)?;
                self.push_bytes(out);
                Ok(())
            }
            Lazy::Later(future) => {
                self.segments.push(Segment::Deferred { future, format });
                Ok(())
            }
        }
    }

    /// Splices another region's segments into this one.
    pub fn append_region(&mut self, child: Region) {
        self.segments.push(Segment::Nested(child));
    }

    /// Returns a cell that resolves to this position in the region once
    /// materialization reaches it.
    pub fn current_offset(&mut self) -> Future<i64> {
        let f = Future::new();
        self.segments.push(Segment::Marker(f.clone()));
        f
    }

    /// Registers `f(finalized_bytes[start..end])` as a derived value.
    ///
    /// The result resolves during a strict (finalizing) materialization,
    /// after every cell inside the range has resolved; a non-strict render
    /// unresolves it again.
    pub fn post_process(
        &mut self,
        start: Future<i64>,
        end: Future<i64>,
        f: impl Fn(&[u8]) -> i64 + 'static,
    ) -> Future<i64> {
        let out = Future::new();
        self.post.push(PostProcess {
            start,
            end,
            out: out.clone(),
            func: Box::new(f),
        });
        out
    }

    /// Total width of the region in bytes, counting placeholders at their
    /// committed widths. Does not require materialization.
    pub fn byte_len(&self) -> usize {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Bytes(b) => b.len(),
                Segment::Deferred { format, .. } => format.width(),
                Segment::Marker(_) => 0,
                Segment::Nested(r) => r.byte_len(),
            })
            .sum()
    }

    /// Finalizes the region to bytes.
    ///
    /// Every placeholder's cell must be resolved, either beforehand or by the
    /// walk itself (offset markers, post-processing). Materialization is
    /// repeatable: rendering twice with all cells resolved yields identical
    /// bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        self.render(true).map(|r| r.bytes)
    }

    /// Renders the current state as a human-readable hex listing without
    /// requiring finalization. Pending placeholder bytes show as `??`.
    pub fn dump(&self) -> String {
        match self.render(false) {
            Ok(rendered) => {
                let mut cells: Vec<Option<u8>> =
                    rendered.bytes.iter().map(|b| Some(*b)).collect();
                for (offset, width) in &rendered.pending {
                    for cell in cells.iter_mut().skip(*offset).take(*width) {
                        *cell = None;
                    }
                }
                let mut out = String::new();
                for (i, line) in cells.chunks(16).enumerate() {
                    out.push_str(&format!("{:04x}:", i * 16));
                    for cell in line {
                        match cell {
                            Some(b) => out.push_str(&format!(" {:02x}", b)),
                            None => out.push_str(" ??"),
                        }
                    }
                    out.push('\n');
                }
                if let Some(err) = rendered.note {
                    out.push_str(&format!("; {}\n", err));
                }
                out
            }
            Err(err) => format!("; render failed: {}\n", err),
        }
    }

    fn render(&self, strict: bool) -> Result<Rendered, EncodeError> {
        let buf: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let late_err: Rc<RefCell<Option<EncodeError>>> = Rc::new(RefCell::new(None));
        let mut patches: Vec<Patch> = Vec::new();
        let mut posts: Vec<&PostProcess> = Vec::new();

        let walked = self.walk(&buf, &late_err, &mut patches, &mut posts);

        if walked.is_ok() {
            if strict {
                // Post-processing runs only over finalized bytes: every cell
                // in the range has resolved by the end of a strict walk, so
                // the derived value resolves strictly after all of them. The
                // resolution itself may back-patch a still-subscribed
                // placeholder elsewhere in the region.
                for p in &posts {
                    let start = p.start.get() as usize;
                    let end = p.end.get() as usize;
                    let value = (p.func)(&buf.borrow()[start..end]);
                    p.out.resolve(value);
                }
            } else {
                for p in &posts {
                    p.out.unresolve();
                }
            }
        }

        let mut pending = Vec::new();
        for patch in patches {
            if !patch.future.is_resolved() {
                pending.push((patch.offset, patch.width));
            }
            patch.sub.cancel();
        }
        walked?;

        let note = late_err.borrow_mut().take();
        if strict {
            if let Some(err) = note {
                return Err(err);
            }
            if let Some((offset, _)) = pending.first() {
                return Err(EncodeError::UnresolvedPlaceholder { offset: *offset });
            }
        }

        let bytes = Rc::try_unwrap(buf)
            .map(RefCell::into_inner)
            .unwrap_or_else(|shared| shared.borrow().clone());
        Ok(Rendered {
            bytes,
            pending,
            note,
        })
    }

    fn walk<'a>(
        &'a self,
        buf: &Rc<RefCell<Vec<u8>>>,
        late_err: &Rc<RefCell<Option<EncodeError>>>,
        patches: &mut Vec<Patch>,
        posts: &mut Vec<&'a PostProcess>,
    ) -> Result<(), EncodeError> {
        for segment in &self.segments {
            match segment {
                Segment::Bytes(bytes) => buf.borrow_mut().extend_from_slice(bytes),
                Segment::Deferred { future, format } => {
                    let offset = buf.borrow().len();
                    let width = format.width();
                    buf.borrow_mut().resize(offset + width, 0);
                    if let Some(v) = future.try_get() {
                        let mut b = buf.borrow_mut();
                        format.encode(v, offset, &mut b[offset..offset + width])?;
                    } else {
                        let sub = {
                            let format = *format;
                            let patch_buf = Rc::clone(buf);
                            let err_slot = Rc::clone(late_err);
                            let clear_buf = Rc::clone(buf);
                            future.subscribe(
                                move |v: &i64| {
                                    let mut b = patch_buf.borrow_mut();
                                    if let Err(e) =
                                        format.encode(*v, offset, &mut b[offset..offset + width])
                                    {
                                        err_slot.borrow_mut().get_or_insert(e);
                                    }
                                },
                                move || {
                                    let mut b = clear_buf.borrow_mut();
                                    b[offset..offset + width].fill(0);
                                },
                            )
                        };
                        patches.push(Patch {
                            sub,
                            future: future.clone(),
                            offset,
                            width,
                        });
                    }
                }
                Segment::Marker(future) => {
                    let offset = buf.borrow().len() as i64;
                    future.resolve(offset);
                }
                Segment::Nested(child) => {
                    child.walk(buf, late_err, patches, posts)?;
                }
            }
        }
        posts.extend(self.post.iter());
        Ok(())
    }
}
