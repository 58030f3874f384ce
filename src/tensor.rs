//! Tensor handle (C1): an opaque, reference-counted view of a tensor value.
//!
//! The engine never mutates a tensor in place and never interprets tensor
//! bytes beyond dtype/shape bookkeeping — the actual codec is an external
//! collaborator (spec.md §1 "Out of scope: the tensor value type and its
//! codec"). `TensorHandle` only carries what the scheduler and reply
//! assembler need: dtype, shape, and a byte payload, cheaply shareable
//! across device workers.

use std::sync::Arc;

/// Numeric/boolean/string element kind, independent of bit-width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DTypeKind {
    Float,
    Int,
    Uint,
    Bool,
    String,
}

/// Bit-width for numeric dtypes. Bool and String ignore this (always
/// treated as width-agnostic), but the field is still carried per
/// spec.md §3's `dtype code ∈ {...} × bit-width ∈ {8,16,32,64}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    pub fn bytes(self) -> usize {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
            Width::W64 => 8,
        }
    }
}

/// Element dtype: `kind × width`, lanes always 1 (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DType {
    pub kind: DTypeKind,
    pub width: Width,
}

impl DType {
    pub const fn new(kind: DTypeKind, width: Width) -> Self {
        DType { kind, width }
    }

    pub const FLOAT32: DType = DType::new(DTypeKind::Float, Width::W32);
    pub const FLOAT64: DType = DType::new(DTypeKind::Float, Width::W64);
    pub const INT64: DType = DType::new(DTypeKind::Int, Width::W64);
    pub const UINT8: DType = DType::new(DTypeKind::Uint, Width::W8);
    pub const BOOL: DType = DType::new(DTypeKind::Bool, Width::W8);

    /// Byte size of a single element. `String` dtype has no fixed element
    /// size; callers must not rely on it for byte-length arithmetic.
    pub fn element_size(self) -> usize {
        match self.kind {
            DTypeKind::String => 0,
            _ => self.width.bytes(),
        }
    }

    pub fn parse(name: &str) -> Option<DType> {
        match name.to_ascii_uppercase().as_str() {
            "FLOAT" | "FLOAT32" => Some(DType::FLOAT32),
            "DOUBLE" | "FLOAT64" => Some(DType::FLOAT64),
            "INT8" => Some(DType::new(DTypeKind::Int, Width::W8)),
            "INT16" => Some(DType::new(DTypeKind::Int, Width::W16)),
            "INT32" => Some(DType::new(DTypeKind::Int, Width::W32)),
            "INT64" => Some(DType::INT64),
            "UINT8" => Some(DType::UINT8),
            "UINT16" => Some(DType::new(DTypeKind::Uint, Width::W16)),
            "UINT32" => Some(DType::new(DTypeKind::Uint, Width::W32)),
            "UINT64" => Some(DType::new(DTypeKind::Uint, Width::W64)),
            "BOOL" => Some(DType::BOOL),
            "STRING" => Some(DType::new(DTypeKind::String, Width::W8)),
            _ => None,
        }
    }
}

struct TensorInner {
    dtype: DType,
    shape: Vec<u64>,
    data: Vec<u8>,
}

/// Opaque, O(1)-copyable reference to a tensor value.
///
/// Cloning a `TensorHandle` only bumps an `Arc` refcount; no bytes move.
/// The last clone to drop frees the backing buffer.
#[derive(Clone)]
pub struct TensorHandle(Arc<TensorInner>);

impl TensorHandle {
    pub fn new(dtype: DType, shape: Vec<u64>, data: Vec<u8>) -> Self {
        TensorHandle(Arc::new(TensorInner { dtype, shape, data }))
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    pub fn shape(&self) -> &[u64] {
        &self.0.shape
    }

    pub fn data(&self) -> &[u8] {
        &self.0.data
    }

    pub fn rank(&self) -> usize {
        self.0.shape.len()
    }

    /// Number of elements along the batch (zeroth) dimension, or 1 for a
    /// scalar/rank-0 tensor.
    pub fn batch_dim(&self) -> u64 {
        self.0.shape.first().copied().unwrap_or(1)
    }

    /// Shape dimensions after the zeroth — used by the batching comparator,
    /// which requires these to match exactly between batch candidates while
    /// leaving the zeroth dimension free (spec.md §4.3 "Batchable(A, B)").
    pub fn trailing_shape(&self) -> &[u64] {
        if self.0.shape.is_empty() {
            &[]
        } else {
            &self.0.shape[1..]
        }
    }

    pub fn byte_size(&self) -> usize {
        self.0.data.len()
    }

    /// Concatenate `members` along the zeroth dimension into one tensor,
    /// the batched backend call's actual input (spec.md §4.3 "Batch
    /// execution"). All members must share dtype and trailing shape; this
    /// is the caller's responsibility (checked by `batchable` upstream).
    pub fn concat_batch(members: &[TensorHandle]) -> TensorHandle {
        assert!(!members.is_empty());
        let dtype = members[0].dtype();
        let trailing = members[0].trailing_shape().to_vec();
        let batch_total: u64 = members.iter().map(|m| m.batch_dim()).sum();
        let mut shape = vec![batch_total];
        shape.extend_from_slice(&trailing);
        let mut data = Vec::with_capacity(members.iter().map(|m| m.byte_size()).sum());
        for m in members {
            data.extend_from_slice(m.data());
        }
        TensorHandle::new(dtype, shape, data)
    }

    /// Slice a batched output tensor back into per-member tensors, given
    /// each member's batch-dimension size, in the same order they were
    /// concatenated.
    pub fn split_batch(&self, member_batch_sizes: &[u64]) -> Vec<TensorHandle> {
        let trailing = self.trailing_shape().to_vec();
        let elem_size = self.dtype().element_size().max(1);
        let trailing_elems: u64 = trailing.iter().product::<u64>().max(1);
        let mut out = Vec::with_capacity(member_batch_sizes.len());
        let mut offset = 0usize;
        for &bsz in member_batch_sizes {
            let mut shape = vec![bsz];
            shape.extend_from_slice(&trailing);
            let nbytes = (bsz * trailing_elems) as usize * elem_size;
            let slice = self.data()[offset..offset + nbytes].to_vec();
            offset += nbytes;
            out.push(TensorHandle::new(self.dtype(), shape, slice));
        }
        out
    }
}
