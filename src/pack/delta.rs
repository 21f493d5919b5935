//! Binary delta codec.
//!
//! Produces and applies deltas in the standard pack delta format: two
//! varints (base size, result size) followed by copy and insert
//! instructions. Copy instructions reference a range of the base; insert
//! instructions carry up to 127 literal bytes. A copy size of zero encodes
//! the maximum span of 64 KiB.
//!
//! Delta creation builds a [`DeltaIndex`] over the base once and reuses it
//! against many targets. The index stores 64-bit fingerprints of fixed-size
//! blocks rather than borrowed byte ranges, so it does not tie its lifetime
//! to the base buffer; candidate matches are verified against the base
//! before use, which also makes fingerprint collisions harmless.

use ahash::AHashMap;
use std::fmt;

/// Fingerprinted block size. Matches below this granularity are not found.
const BLOCK_SIZE: usize = 16;

/// Maximum bytes a single copy instruction can cover.
const MAX_COPY_SIZE: usize = 0x10000;

/// Maximum literal bytes a single insert instruction can carry.
const MAX_INSERT_SIZE: usize = 127;

/// Errors from applying a delta.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeltaError {
    /// The delta ended mid-instruction.
    Truncated,
    /// A size varint exceeded 64 bits.
    VarintOverflow,
    /// The delta's recorded base size does not match the supplied base.
    BaseSizeMismatch,
    /// The produced output does not match the recorded result size.
    ResultSizeMismatch,
    /// Instruction byte zero is reserved.
    BadCommandZero,
    /// A copy instruction referenced bytes outside the base.
    CopyOutOfRange,
    /// The recorded result size exceeds the caller's output cap.
    OutputOverrun,
}

impl fmt::Display for DeltaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "delta truncated"),
            Self::VarintOverflow => write!(f, "delta varint overflow"),
            Self::BaseSizeMismatch => write!(f, "delta base size mismatch"),
            Self::ResultSizeMismatch => write!(f, "delta result size mismatch"),
            Self::BadCommandZero => write!(f, "delta command zero"),
            Self::CopyOutOfRange => write!(f, "delta copy out of range"),
            Self::OutputOverrun => write!(f, "delta output overrun"),
        }
    }
}

impl std::error::Error for DeltaError {}

/// Match-finding index over a delta base.
///
/// Maps block fingerprints to the first base offset they occur at. The
/// base itself is not retained; callers pass it back to [`create_delta`].
#[derive(Debug)]
pub struct DeltaIndex {
    blocks: AHashMap<u64, u32>,
    src_len: usize,
}

impl DeltaIndex {
    /// Builds an index over `src`.
    ///
    /// Returns `None` when `src` is too small to contain a single block or
    /// too large for block offsets; the caller should skip delta attempts
    /// against such a base (the resulting pack is legal, just less
    /// compact).
    #[must_use]
    pub fn new(src: &[u8]) -> Option<Self> {
        if src.len() < BLOCK_SIZE || src.len() > u32::MAX as usize {
            return None;
        }
        let mut blocks = AHashMap::with_capacity(src.len() / BLOCK_SIZE);
        for offset in (0..=src.len() - BLOCK_SIZE).step_by(BLOCK_SIZE) {
            let fp = block_fingerprint(&src[offset..offset + BLOCK_SIZE]);
            // First occurrence wins; any duplicate is equally usable.
            blocks.entry(fp).or_insert(offset as u32);
        }
        Some(Self {
            blocks,
            src_len: src.len(),
        })
    }

    /// Approximate memory held by the index, for budget accounting.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.blocks.capacity() * (8 + 4)
    }

    /// Length of the base the index was built over.
    #[must_use]
    pub const fn src_len(&self) -> usize {
        self.src_len
    }
}

/// Computes a delta that transforms `src` into `trg`.
///
/// `index` must have been built over `src`. When `max_size` is non-zero and
/// no delta within that many bytes exists, returns `None`; the caller falls
/// back to storing the target whole.
#[must_use]
pub fn create_delta(
    index: &DeltaIndex,
    src: &[u8],
    trg: &[u8],
    max_size: usize,
) -> Option<Vec<u8>> {
    debug_assert_eq!(index.src_len, src.len(), "index built over different base");

    let mut delta = Vec::with_capacity(128);
    write_varint(&mut delta, src.len() as u64);
    write_varint(&mut delta, trg.len() as u64);

    let mut pending: Vec<u8> = Vec::with_capacity(MAX_INSERT_SIZE);
    let mut tpos = 0usize;
    while tpos < trg.len() {
        if trg.len() - tpos >= BLOCK_SIZE {
            let fp = block_fingerprint(&trg[tpos..tpos + BLOCK_SIZE]);
            if let Some(&off) = index.blocks.get(&fp) {
                let off = off as usize;
                // Fingerprints can collide; trust only verified bytes.
                if src[off..off + BLOCK_SIZE] == trg[tpos..tpos + BLOCK_SIZE] {
                    let len = extend_match(src, off, trg, tpos);
                    flush_insert(&mut delta, &mut pending);
                    emit_copy(&mut delta, off as u64, len);
                    tpos += len;
                    if max_size != 0 && delta.len() > max_size {
                        return None;
                    }
                    continue;
                }
            }
        }

        pending.push(trg[tpos]);
        tpos += 1;
        if pending.len() == MAX_INSERT_SIZE {
            flush_insert(&mut delta, &mut pending);
            if max_size != 0 && delta.len() > max_size {
                return None;
            }
        }
    }
    flush_insert(&mut delta, &mut pending);

    if max_size != 0 && delta.len() > max_size {
        return None;
    }
    Some(delta)
}

/// Applies a delta to `base`, writing the result into `out`.
///
/// The output buffer is cleared before writing; pass a reusable `Vec` to
/// avoid repeated allocations. `max_out` caps the recorded result size to
/// guard against corrupt deltas; zero means no cap.
pub fn apply_delta(
    base: &[u8],
    delta: &[u8],
    out: &mut Vec<u8>,
    max_out: usize,
) -> Result<(), DeltaError> {
    let mut pos = 0usize;
    let base_size = read_varint(delta, &mut pos)?;
    let result_size = read_varint(delta, &mut pos)?;

    if base_size != base.len() as u64 {
        return Err(DeltaError::BaseSizeMismatch);
    }
    if max_out != 0 && result_size > max_out as u64 {
        return Err(DeltaError::OutputOverrun);
    }

    out.clear();
    out.reserve(result_size as usize);

    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;

        if cmd & 0x80 != 0 {
            let mut offset = 0u64;
            for i in 0..4 {
                if cmd & (1 << i) != 0 {
                    let b = *delta.get(pos).ok_or(DeltaError::Truncated)?;
                    pos += 1;
                    offset |= u64::from(b) << (8 * i);
                }
            }
            let mut size = 0usize;
            for i in 0..3 {
                if cmd & (0x10 << i) != 0 {
                    let b = *delta.get(pos).ok_or(DeltaError::Truncated)?;
                    pos += 1;
                    size |= usize::from(b) << (8 * i);
                }
            }
            if size == 0 {
                size = MAX_COPY_SIZE;
            }
            let start = offset as usize;
            let end = start.checked_add(size).ok_or(DeltaError::CopyOutOfRange)?;
            if end > base.len() {
                return Err(DeltaError::CopyOutOfRange);
            }
            if out.len() + size > result_size as usize {
                return Err(DeltaError::ResultSizeMismatch);
            }
            out.extend_from_slice(&base[start..end]);
        } else if cmd != 0 {
            let len = cmd as usize;
            let end = pos.checked_add(len).ok_or(DeltaError::Truncated)?;
            if end > delta.len() {
                return Err(DeltaError::Truncated);
            }
            if out.len() + len > result_size as usize {
                return Err(DeltaError::ResultSizeMismatch);
            }
            out.extend_from_slice(&delta[pos..end]);
            pos = end;
        } else {
            return Err(DeltaError::BadCommandZero);
        }
    }

    if out.len() as u64 != result_size {
        return Err(DeltaError::ResultSizeMismatch);
    }
    Ok(())
}

/// Writes a base-128 varint with a continuation high bit.
pub(crate) fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return;
        }
    }
}

/// Reads a base-128 varint, failing on truncation or 64-bit overflow.
fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64, DeltaError> {
    let mut shift = 0u32;
    let mut result = 0u64;
    for _ in 0..10 {
        let b = *data.get(*pos).ok_or(DeltaError::Truncated)?;
        *pos += 1;
        result |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift > 63 {
            return Err(DeltaError::VarintOverflow);
        }
    }
    Err(DeltaError::VarintOverflow)
}

/// Fingerprints one block with a 64-bit mix of its two halves.
#[inline]
fn block_fingerprint(block: &[u8]) -> u64 {
    let lo = u64::from_le_bytes(block[0..8].try_into().unwrap());
    let hi = u64::from_le_bytes(block[8..16].try_into().unwrap());
    mix64(lo ^ hi.rotate_left(32))
}

#[inline]
fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

/// Extends a verified block match as far as the buffers allow.
fn extend_match(src: &[u8], src_off: usize, trg: &[u8], tpos: usize) -> usize {
    let max_len = (src.len() - src_off).min(trg.len() - tpos);
    let mut len = BLOCK_SIZE;
    while len < max_len && src[src_off + len] == trg[tpos + len] {
        len += 1;
    }
    len
}

/// Flushes pending literal bytes as insert instructions.
fn flush_insert(delta: &mut Vec<u8>, pending: &mut Vec<u8>) {
    for chunk in pending.chunks(MAX_INSERT_SIZE) {
        delta.push(chunk.len() as u8);
        delta.extend_from_slice(chunk);
    }
    pending.clear();
}

/// Emits copy instructions covering `size` bytes at `offset`.
fn emit_copy(delta: &mut Vec<u8>, mut offset: u64, mut size: usize) {
    while size > 0 {
        let chunk = size.min(MAX_COPY_SIZE);
        let mut cmd = 0x80u8;
        let mut args = [0u8; 7];
        let mut n = 0usize;
        for i in 0..4 {
            let b = ((offset >> (8 * i)) & 0xff) as u8;
            if b != 0 {
                cmd |= 1 << i;
                args[n] = b;
                n += 1;
            }
        }
        // A full-span copy encodes its size as zero.
        let encoded = if chunk == MAX_COPY_SIZE { 0 } else { chunk };
        for i in 0..3 {
            let b = ((encoded >> (8 * i)) & 0xff) as u8;
            if b != 0 {
                cmd |= 0x10 << i;
                args[n] = b;
                n += 1;
            }
        }
        delta.push(cmd);
        delta.extend_from_slice(&args[..n]);
        offset += chunk as u64;
        size -= chunk;
    }
}
