//! Binary deltas against a known base blob.
//!
//! A [`Delta`] rebuilds a target blob from a base blob the receiver already
//! holds, using `Copy` ranges out of the base and `Insert` runs of new bytes.
//! Deltas are computed from a line-oriented diff (long lines and binary data
//! are cut into bounded tokens), so they work for text and binary content
//! alike. Applying a delta verifies the base hash first.

use crate::hash::ContentHash;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use similar::{Algorithm, DiffTag};
use std::time::Instant;
use thiserror::Error;

/// Longest token fed to the diff algorithm.
const MAX_TOKEN_LEN: usize = 256;

/// Fixed per-operation overhead used when estimating the encoded size.
const OP_OVERHEAD: usize = 12;

/// Upper bound on the output buffer reserved up front.
const MAX_PREALLOC: usize = 16 * 1024 * 1024;

/// Errors raised when applying a delta.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeltaError {
    /// The base content does not match the hash the delta was computed against.
    #[error("base content mismatch: expected {expected}, found {actual}")]
    BaseMismatch {
        /// Hash the delta expects.
        expected: ContentHash,
        /// Hash of the content actually present.
        actual: ContentHash,
    },

    /// A copy range lies outside the base content.
    #[error("copy range {offset}+{len} exceeds base length {base_len}")]
    OutOfBounds {
        /// Copy offset.
        offset: u64,
        /// Copy length.
        len: u64,
        /// Base content length.
        base_len: usize,
    },

    /// The rebuilt content would not fit in memory.
    #[error("delta target length overflows")]
    TooLarge,
}

/// Validates a copy range against the base.
fn copy_range(base: &[u8], offset: u64, len: u64) -> Result<std::ops::Range<usize>, DeltaError> {
    usize::try_from(offset)
        .ok()
        .zip(usize::try_from(len).ok())
        .and_then(|(start, len)| Some(start..start.checked_add(len)?))
        .filter(|range| range.end <= base.len())
        .ok_or(DeltaError::OutOfBounds {
            offset,
            len,
            base_len: base.len(),
        })
}

/// One step of a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Copy `len` bytes starting at `offset` of the base.
    Copy {
        /// Offset into the base.
        offset: u64,
        /// Number of bytes.
        len: u64,
    },
    /// Append literal bytes.
    Insert(Bytes),
}

/// Instructions rebuilding a target blob from a base blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Hash of the base the delta applies to.
    pub base: ContentHash,
    /// Operations in output order.
    pub ops: Vec<DeltaOp>,
}

impl Delta {
    /// Computes a delta turning `base` into `target`.
    ///
    /// When `deadline` passes, the diff falls back to a coarser result; the
    /// delta stays correct but may be larger.
    pub fn compute(base: &[u8], target: &[u8], deadline: Option<Instant>) -> Self {
        let old_tokens = tokenize(base);
        let new_tokens = tokenize(target);
        let old_offsets = offsets(&old_tokens);
        let new_offsets = offsets(&new_tokens);

        let diff =
            similar::capture_diff_slices_deadline(Algorithm::Myers, &old_tokens, &new_tokens, deadline);

        let mut builder = Builder::default();
        for op in diff {
            let (tag, old_range, new_range) = op.as_tag_tuple();
            match tag {
                DiffTag::Equal => {
                    let start = old_offsets[old_range.start];
                    let end = old_offsets[old_range.end];
                    builder.copy(start, end - start);
                }
                DiffTag::Delete => {}
                DiffTag::Insert | DiffTag::Replace => {
                    let start = new_offsets[new_range.start];
                    let end = new_offsets[new_range.end];
                    builder.insert(&target[start..end]);
                }
            }
        }

        Self {
            base: ContentHash::of(base),
            ops: builder.finish(),
        }
    }

    /// Rebuilds the target from `base`.
    ///
    /// Every copy range is checked against `base` before anything is
    /// allocated, so a malformed delta fails with an error instead of
    /// overflowing or exhausting memory.
    pub fn apply(&self, base: &[u8]) -> Result<Vec<u8>, DeltaError> {
        let actual = ContentHash::of(base);
        if actual != self.base {
            return Err(DeltaError::BaseMismatch {
                expected: self.base,
                actual,
            });
        }

        let mut total = 0usize;
        for op in &self.ops {
            let len = match op {
                DeltaOp::Copy { offset, len } => copy_range(base, *offset, *len)?.len(),
                DeltaOp::Insert(bytes) => bytes.len(),
            };
            total = total.checked_add(len).ok_or(DeltaError::TooLarge)?;
        }

        let mut out = Vec::with_capacity(total.min(MAX_PREALLOC));
        for op in &self.ops {
            match op {
                DeltaOp::Copy { offset, len } => out.extend_from_slice(&base[copy_range(base, *offset, *len)?]),
                DeltaOp::Insert(bytes) => out.extend_from_slice(bytes),
            }
        }
        Ok(out)
    }

    /// Length of the rebuilt target, `None` if it does not fit in memory.
    pub fn target_len(&self) -> Option<usize> {
        self.ops.iter().try_fold(0usize, |total, op| {
            let len = match op {
                DeltaOp::Copy { len, .. } => usize::try_from(*len).ok()?,
                DeltaOp::Insert(bytes) => bytes.len(),
            };
            total.checked_add(len)
        })
    }

    /// Approximate number of bytes the delta occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                DeltaOp::Copy { .. } => OP_OVERHEAD,
                DeltaOp::Insert(bytes) => OP_OVERHEAD + bytes.len(),
            })
            .sum::<usize>()
            + 32
    }
}

#[derive(Default)]
struct Builder {
    ops: Vec<DeltaOp>,
    pending: Vec<u8>,
}

impl Builder {
    fn copy(&mut self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        self.flush_insert();
        if let Some(DeltaOp::Copy {
            offset: prev_offset,
            len: prev_len,
        }) = self.ops.last_mut()
        {
            if *prev_offset + *prev_len == offset as u64 {
                *prev_len += len as u64;
                return;
            }
        }
        self.ops.push(DeltaOp::Copy {
            offset: offset as u64,
            len: len as u64,
        });
    }

    fn insert(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn flush_insert(&mut self) {
        if !self.pending.is_empty() {
            let bytes = std::mem::take(&mut self.pending);
            self.ops.push(DeltaOp::Insert(Bytes::from(bytes)));
        }
    }

    fn finish(mut self) -> Vec<DeltaOp> {
        self.flush_insert();
        self.ops
    }
}

/// Splits content after each newline, cutting runs longer than `MAX_TOKEN_LEN`.
fn tokenize(content: &[u8]) -> Vec<&[u8]> {
    content
        .split_inclusive(|b| *b == b'\n')
        .flat_map(|line| line.chunks(MAX_TOKEN_LEN))
        .collect()
}

/// Start offset of every token plus the total length.
fn offsets(tokens: &[&[u8]]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(tokens.len() + 1);
    let mut pos = 0;
    offsets.push(0);
    for token in tokens {
        pos += token.len();
        offsets.push(pos);
    }
    offsets
}
