//! Rsync-style delta engine
//!
//! Computes weak+strong block signatures over a base, deltifies a target
//! against them, and patches a base back into the target. Operates on
//! in-memory buffers: snapshot encodings are deltified directly, and file
//! staging works block-wise over file contents.

use std::collections::HashMap;
use std::io;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::Algorithm;

/// Smallest block size selected automatically.
pub const MINIMUM_BLOCK_SIZE: usize = 1 << 10;
/// Largest block size selected automatically.
pub const MAXIMUM_BLOCK_SIZE: usize = 1 << 16;
/// Width to which strong block checksums are truncated.
pub const STRONG_CHECKSUM_LENGTH: usize = 16;
/// Largest single DATA operation emitted by deltification.
pub const MAXIMUM_DATA_OPERATION_SIZE: usize = 1 << 20;
/// Default ceiling on reconstructed target size.
pub const DEFAULT_MAXIMUM_TARGET_SIZE: u64 = 1 << 30;

/// Signature of a base: per-block weak and strong checksums.
///
/// `Signature::default()` is the empty-base signature; deltifying against
/// it produces a pure DATA stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Length of the base in bytes
    pub base_length: u64,
    /// Block size the signature was computed with
    pub block_size: u32,
    /// Per-block checksums, in base order
    pub blocks: Vec<BlockSignature>,
}

/// Checksums for a single base block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSignature {
    /// Rolling weak checksum
    pub weak: u32,
    /// Truncated strong checksum
    pub strong: Vec<u8>,
}

/// One step in a delta stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Copy `length` bytes from the base starting at `offset`
    Copy { offset: u64, length: u64 },
    /// Append literal bytes
    Data { data: Bytes },
}

#[derive(Debug, Error)]
pub enum DeltaError {
    #[error(
        "invalid delta: copy of {length} bytes at offset {offset} exceeds \
         base of {base_length} bytes"
    )]
    InvalidCopy {
        offset: u64,
        length: u64,
        base_length: u64,
    },
    #[error("reconstructed target of {size} bytes exceeds the {limit} byte ceiling")]
    TargetTooLarge { size: u64, limit: u64 },
    #[error("delta encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("delta decoding failed: {0}")]
    Decode(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Rolling weak checksum: two 16-bit accumulators over the window, with
/// O(1) single-byte sliding.
#[derive(Debug, Clone, Copy)]
pub struct RollingSum {
    a: u32,
    b: u32,
    length: u32,
}

impl RollingSum {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(block: &[u8]) -> Self {
        let mut a = 0u32;
        let mut b = 0u32;
        let length = block.len() as u32;
        for (i, &byte) in block.iter().enumerate() {
            a = a.wrapping_add(u32::from(byte));
            b = b.wrapping_add((length - i as u32).wrapping_mul(u32::from(byte)));
        }
        Self { a, b, length }
    }

    /// Slide the window one byte: drop `removed` from the front, append
    /// `added` at the back.
    #[inline]
    pub fn roll(&mut self, removed: u8, added: u8) {
        let removed = u32::from(removed);
        let added = u32::from(added);
        self.a = self.a.wrapping_sub(removed).wrapping_add(added);
        self.b = self
            .b
            .wrapping_sub(self.length.wrapping_mul(removed))
            .wrapping_add(self.a);
    }

    /// Combined 32-bit digest: high half `b`, low half `a`.
    #[inline]
    #[must_use]
    pub fn digest(&self) -> u32 {
        ((self.b & 0xffff) << 16) | (self.a & 0xffff)
    }
}

/// Block size derived from base length when the caller passes 0.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn optimal_block_size(base_length: usize) -> usize {
    let root = (base_length as f64).sqrt() as usize;
    root.clamp(MINIMUM_BLOCK_SIZE, MAXIMUM_BLOCK_SIZE)
}

/// The delta engine for one session.
#[derive(Clone)]
pub struct Engine {
    algorithm: Algorithm,
    maximum_target_size: u64,
}

impl Engine {
    #[must_use]
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            maximum_target_size: DEFAULT_MAXIMUM_TARGET_SIZE,
        }
    }

    /// Override the reconstruction ceiling enforced by [`Engine::patch`].
    #[must_use]
    pub fn with_maximum_target_size(mut self, limit: u64) -> Self {
        self.maximum_target_size = limit;
        self
    }

    fn strong_checksum(&self, block: &[u8]) -> Vec<u8> {
        let digest = self.algorithm.digest(block);
        let width = STRONG_CHECKSUM_LENGTH.min(digest.len());
        digest.as_bytes()[..width].to_vec()
    }

    /// Compute the signature of a base. `block_size == 0` selects a size
    /// derived from the base length.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn signature(&self, base: &[u8], block_size: usize) -> Signature {
        if base.is_empty() {
            return Signature::default();
        }
        let block_size = if block_size == 0 {
            optimal_block_size(base.len())
        } else {
            block_size
        };

        let mut blocks = Vec::with_capacity(base.len().div_ceil(block_size));
        for chunk in base.chunks(block_size) {
            blocks.push(BlockSignature {
                weak: RollingSum::new(chunk).digest(),
                strong: self.strong_checksum(chunk),
            });
        }

        Signature {
            base_length: base.len() as u64,
            block_size: block_size as u32,
            blocks,
        }
    }

    /// Produce operations that reconstruct `target` from the base the
    /// signature was computed over.
    #[must_use]
    pub fn deltify(&self, target: &[u8], base: &Signature) -> Vec<Operation> {
        let block = base.block_size as usize;
        let mut ops = Vec::new();

        if base.blocks.is_empty() || block == 0 || target.len() < block {
            push_data(&mut ops, target);
            return ops;
        }

        // Only full-size base blocks participate in matching; a short
        // final block can't back a block-sized COPY.
        let mut lookup: HashMap<u32, Vec<usize>> = HashMap::new();
        for (index, sig) in base.blocks.iter().enumerate() {
            if ((index + 1) * block) as u64 <= base.base_length {
                lookup.entry(sig.weak).or_default().push(index);
            }
        }

        let mut pos = 0usize;
        let mut literal_start = 0usize;
        let mut sum = RollingSum::new(&target[..block]);

        loop {
            let mut matched = None;
            if let Some(candidates) = lookup.get(&sum.digest()) {
                let strong = self.strong_checksum(&target[pos..pos + block]);
                matched = candidates
                    .iter()
                    .copied()
                    .find(|&index| base.blocks[index].strong == strong);
            }

            if let Some(index) = matched {
                if literal_start < pos {
                    push_data(&mut ops, &target[literal_start..pos]);
                }
                push_copy(&mut ops, (index * block) as u64, block as u64);
                pos += block;
                literal_start = pos;
                if pos + block <= target.len() {
                    sum = RollingSum::new(&target[pos..pos + block]);
                    continue;
                }
                break;
            }

            if pos + block < target.len() {
                sum.roll(target[pos], target[pos + block]);
                pos += 1;
            } else {
                break;
            }
        }

        if literal_start < target.len() {
            push_data(&mut ops, &target[literal_start..]);
        }
        ops
    }

    /// Apply a delta to a base, reconstructing the target.
    ///
    /// # Errors
    /// Rejects COPY references outside the base with
    /// [`DeltaError::InvalidCopy`] and reconstructions above the session
    /// ceiling with [`DeltaError::TargetTooLarge`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn patch(&self, base: &[u8], delta: &[Operation]) -> Result<Vec<u8>, DeltaError> {
        let mut target = Vec::new();
        for op in delta {
            match op {
                Operation::Copy { offset, length } => {
                    let end = offset.checked_add(*length).ok_or(DeltaError::InvalidCopy {
                        offset: *offset,
                        length: *length,
                        base_length: base.len() as u64,
                    })?;
                    if end > base.len() as u64 {
                        return Err(DeltaError::InvalidCopy {
                            offset: *offset,
                            length: *length,
                            base_length: base.len() as u64,
                        });
                    }
                    target.extend_from_slice(&base[*offset as usize..end as usize]);
                }
                Operation::Data { data } => {
                    target.extend_from_slice(data);
                }
            }
            if target.len() as u64 > self.maximum_target_size {
                return Err(DeltaError::TargetTooLarge {
                    size: target.len() as u64,
                    limit: self.maximum_target_size,
                });
            }
        }
        Ok(target)
    }
}

fn push_data(ops: &mut Vec<Operation>, data: &[u8]) {
    for chunk in data.chunks(MAXIMUM_DATA_OPERATION_SIZE) {
        ops.push(Operation::Data {
            data: Bytes::copy_from_slice(chunk),
        });
    }
}

fn push_copy(ops: &mut Vec<Operation>, offset: u64, length: u64) {
    if let Some(Operation::Copy {
        offset: last_offset,
        length: last_length,
    }) = ops.last_mut()
    {
        if *last_offset + *last_length == offset {
            *last_length += length;
            return;
        }
    }
    ops.push(Operation::Copy { offset, length });
}

/// Compress an operation stream with zstd for transmission.
///
/// # Errors
/// Returns an error if encoding or compression fails.
pub fn compress_operations(ops: &[Operation]) -> Result<Vec<u8>, DeltaError> {
    let encoded = serde_json::to_vec(ops).map_err(DeltaError::Encode)?;
    Ok(zstd::encode_all(encoded.as_slice(), 3)?)
}

/// Decompress an operation stream produced by [`compress_operations`].
///
/// # Errors
/// Returns an error if decompression or decoding fails.
pub fn decompress_operations(data: &[u8]) -> Result<Vec<Operation>, DeltaError> {
    let decompressed = zstd::decode_all(data)?;
    serde_json::from_slice(&decompressed).map_err(|e| DeltaError::Decode(e.to_string()))
}
