//! Dense, dtype-tagged tensors and the batch-row buffer.
//!
//! This module is the small tensor runtime the pipeline operators build on:
//!
//! - [`Tensor`]: a dense value with a shape and typed storage ([`DType`]).
//!   Tensors serialize with serde so checkpoint codecs can persist them.
//! - [`AllocatorAttrs`]: allocation hints threaded through batch
//!   allocations (device placement is a deployment concern; the host
//!   allocator records the hint and allocates host memory).
//! - [`RowBatch`]: a batch-shaped buffer whose rows are written once each,
//!   concurrently, from however many threads complete calls. Rows are
//!   write-once slots; the full batch tensor is reconstituted when the
//!   batch is emitted or checkpointed.
//!
//! Storage is row-major. The leading dimension of a batch tensor is the
//! batch size; one "row" is everything under one leading index.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Element type of a [`Tensor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    U8,
    Bool,
    Str,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
            DType::Bool => "bool",
            DType::Str => "str",
        };
        f.write_str(name)
    }
}

/// Typed storage behind a [`Tensor`], one variant per [`DType`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    Bool(Vec<bool>),
    Str(Vec<String>),
}

impl TensorData {
    fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
            TensorData::I32(_) => DType::I32,
            TensorData::I64(_) => DType::I64,
            TensorData::U8(_) => DType::U8,
            TensorData::Bool(_) => DType::Bool,
            TensorData::Str(_) => DType::Str,
        }
    }

    fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::U8(v) => v.len(),
            TensorData::Bool(v) => v.len(),
            TensorData::Str(v) => v.len(),
        }
    }

    fn zeros(dtype: DType, len: usize) -> TensorData {
        match dtype {
            DType::F32 => TensorData::F32(vec![0.0; len]),
            DType::F64 => TensorData::F64(vec![0.0; len]),
            DType::I32 => TensorData::I32(vec![0; len]),
            DType::I64 => TensorData::I64(vec![0; len]),
            DType::U8 => TensorData::U8(vec![0; len]),
            DType::Bool => TensorData::Bool(vec![false; len]),
            DType::Str => TensorData::Str(vec![String::new(); len]),
        }
    }

    fn with_capacity(dtype: DType, cap: usize) -> TensorData {
        match dtype {
            DType::F32 => TensorData::F32(Vec::with_capacity(cap)),
            DType::F64 => TensorData::F64(Vec::with_capacity(cap)),
            DType::I32 => TensorData::I32(Vec::with_capacity(cap)),
            DType::I64 => TensorData::I64(Vec::with_capacity(cap)),
            DType::U8 => TensorData::U8(Vec::with_capacity(cap)),
            DType::Bool => TensorData::Bool(Vec::with_capacity(cap)),
            DType::Str => TensorData::Str(Vec::with_capacity(cap)),
        }
    }

    /// Append a contiguous range of `other` to `self`. Both sides must
    /// share a dtype; callers validate that before appending.
    fn extend_range(&mut self, other: &TensorData, start: usize, end: usize) {
        match (self, other) {
            (TensorData::F32(dst), TensorData::F32(src)) => dst.extend_from_slice(&src[start..end]),
            (TensorData::F64(dst), TensorData::F64(src)) => dst.extend_from_slice(&src[start..end]),
            (TensorData::I32(dst), TensorData::I32(src)) => dst.extend_from_slice(&src[start..end]),
            (TensorData::I64(dst), TensorData::I64(src)) => dst.extend_from_slice(&src[start..end]),
            (TensorData::U8(dst), TensorData::U8(src)) => dst.extend_from_slice(&src[start..end]),
            (TensorData::Bool(dst), TensorData::Bool(src)) => dst.extend_from_slice(&src[start..end]),
            (TensorData::Str(dst), TensorData::Str(src)) => dst.extend_from_slice(&src[start..end]),
            _ => unreachable!("dtype checked by caller"),
        }
    }

    fn extend_zeros(&mut self, len: usize) {
        let dtype = self.dtype();
        let zeros = TensorData::zeros(dtype, len);
        self.extend_range(&zeros, 0, len);
    }

    fn truncate(&mut self, len: usize) {
        match self {
            TensorData::F32(v) => v.truncate(len),
            TensorData::F64(v) => v.truncate(len),
            TensorData::I32(v) => v.truncate(len),
            TensorData::I64(v) => v.truncate(len),
            TensorData::U8(v) => v.truncate(len),
            TensorData::Bool(v) => v.truncate(len),
            TensorData::Str(v) => v.truncate(len),
        }
    }
}

/// Allocation hints for batch output buffers.
///
/// The map-and-batch operator requests device-transfer-friendly memory
/// for the tensors it hands downstream. The host allocator records the
/// hint; a device-backed runtime would honor it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorAttrs {
    pub gpu_compatible: bool,
}

impl AllocatorAttrs {
    /// Attrs requesting GPU-compatible placement.
    pub fn gpu_compatible() -> Self {
        Self {
            gpu_compatible: true,
        }
    }
}

/// A dense value: a shape plus typed, row-major storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    /// Build a tensor from storage and a shape.
    ///
    /// # Errors
    /// InvalidArgument if the storage length does not match the shape's
    /// element count.
    pub fn new(data: TensorData, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(Error::invalid_argument(format!(
                "storage holds {} elements but shape {:?} implies {}",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Self { shape, data })
    }

    /// A rank-0 i64 tensor.
    pub fn scalar_i64(value: i64) -> Self {
        Self {
            shape: Vec::new(),
            data: TensorData::I64(vec![value]),
        }
    }

    /// A rank-1 f32 tensor.
    pub fn vector_f32(values: Vec<f32>) -> Self {
        Self {
            shape: vec![values.len()],
            data: TensorData::F32(values),
        }
    }

    /// A zero-filled tensor of the given dtype and shape.
    ///
    /// `_attrs` is the allocation hint; host storage is used either way.
    pub fn zeros(dtype: DType, shape: Vec<usize>, _attrs: &AllocatorAttrs) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: TensorData::zeros(dtype, len),
        }
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total element count. A rank-0 tensor has one element.
    pub fn num_elements(&self) -> usize {
        self.data.len()
    }

    /// Size of the leading dimension.
    ///
    /// # Errors
    /// InvalidArgument for rank-0 tensors.
    pub fn dim0(&self) -> Result<usize> {
        self.shape.first().copied().ok_or_else(|| {
            Error::invalid_argument("rank-0 tensor has no leading dimension")
        })
    }

    /// Element count of a single row (everything under one leading index).
    ///
    /// # Errors
    /// InvalidArgument for rank-0 tensors, which have no rows.
    pub fn row_len(&self) -> Result<usize> {
        self.dim0()?;
        Ok(self.shape[1..].iter().product())
    }

    /// A copy of the first `rows` rows.
    ///
    /// Used by checkpoint codecs to avoid persisting rows that were never
    /// written.
    ///
    /// # Errors
    /// InvalidArgument if the tensor is rank-0 or `rows` exceeds the
    /// leading dimension.
    pub fn slice_rows(&self, rows: usize) -> Result<Tensor> {
        let dim0 = self.dim0()?;
        if rows > dim0 {
            return Err(Error::invalid_argument(format!(
                "cannot slice {rows} rows from a tensor with leading dimension {dim0}"
            )));
        }
        let row_len: usize = self.shape[1..].iter().product();
        let mut shape = self.shape.clone();
        shape[0] = rows;
        let mut data = self.data.clone();
        data.truncate(rows * row_len);
        Ok(Tensor { shape, data })
    }

    /// A copy of row `index` with the leading dimension removed.
    pub fn row(&self, index: usize) -> Result<Tensor> {
        let dim0 = self.dim0()?;
        if index >= dim0 {
            return Err(Error::invalid_argument(format!(
                "row {index} out of bounds for leading dimension {dim0}"
            )));
        }
        let row_len: usize = self.shape[1..].iter().product();
        let mut data = TensorData::with_capacity(self.dtype(), row_len);
        data.extend_range(&self.data, index * row_len, (index + 1) * row_len);
        Ok(Tensor {
            shape: self.shape[1..].to_vec(),
            data,
        })
    }

    /// The typed storage behind this tensor, row-major.
    pub fn data(&self) -> &TensorData {
        &self.data
    }
}

/// A partially-known shape: `None` marks an unknown dimension.
///
/// Carried as output metadata on datasets. The map-and-batch operator
/// never constrains results against it; it is informational, the way the
/// upstream graph metadata is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialShape(pub Vec<Option<usize>>);

impl PartialShape {
    /// A shape with every dimension unknown.
    pub fn unknown(rank: usize) -> Self {
        Self(vec![None; rank])
    }

    /// A fully-known shape.
    pub fn known(dims: &[usize]) -> Self {
        Self(dims.iter().copied().map(Some).collect())
    }
}

impl fmt::Display for PartialShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match d {
                Some(n) => write!(f, "{n}")?,
                None => write!(f, "?")?,
            }
        }
        write!(f, "]")
    }
}

/// A batch-shaped buffer with write-once rows.
///
/// `RowBatch` is the concurrent-assembly primitive behind batch outputs:
/// completion callbacks write their result into the row matching their
/// assigned offset, from whatever thread they run on, while other rows
/// are still being produced. Each row is a [`OnceLock`] slot, so writes
/// to distinct rows never contend and a double write is reported rather
/// than racing.
///
/// The buffer does not become a [`Tensor`] until [`RowBatch::assemble`]
/// runs; rows never written assemble as zero rows. Callers that emit
/// partial batches pass the number of valid rows and slice there.
#[derive(Debug)]
pub struct RowBatch {
    dtype: DType,
    row_shape: Vec<usize>,
    row_len: usize,
    rows: Vec<OnceLock<Tensor>>,
}

impl RowBatch {
    /// Allocate a buffer for `batch_size` rows of shape `row_shape`.
    ///
    /// `_attrs` is the allocation hint for the assembled output.
    pub fn allocate(
        batch_size: usize,
        dtype: DType,
        row_shape: &[usize],
        _attrs: &AllocatorAttrs,
    ) -> Self {
        let mut rows = Vec::with_capacity(batch_size);
        rows.resize_with(batch_size, OnceLock::new);
        Self {
            dtype,
            row_shape: row_shape.to_vec(),
            row_len: row_shape.iter().product(),
            rows,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.rows.len()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Element count of one row.
    pub fn row_len(&self) -> usize {
        self.row_len
    }

    /// Shape of one row (the batch shape without its leading dimension).
    pub fn row_shape(&self) -> &[usize] {
        &self.row_shape
    }

    /// Shape of the assembled full batch: `[batch_size] ++ row_shape`.
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = Vec::with_capacity(self.row_shape.len() + 1);
        shape.push(self.rows.len());
        shape.extend_from_slice(&self.row_shape);
        shape
    }

    /// Store `value` as row `row`.
    ///
    /// # Errors
    /// - InvalidArgument if `row` is out of bounds or the dtype differs
    ///   from the buffer's dtype.
    /// - Internal if the row was already written; rows are single-writer
    ///   by construction and a second write means offset bookkeeping
    ///   broke upstream of this buffer.
    pub fn write_row(&self, row: usize, value: Tensor) -> Result<()> {
        let slot = self.rows.get(row).ok_or_else(|| {
            Error::invalid_argument(format!(
                "row {row} out of bounds for batch of {}",
                self.rows.len()
            ))
        })?;
        if value.dtype() != self.dtype {
            return Err(Error::invalid_argument(format!(
                "cannot write a {} row into a {} batch",
                value.dtype(),
                self.dtype
            )));
        }
        slot.set(value)
            .map_err(|_| Error::internal(format!("row {row} written twice")))
    }

    /// Reconstitute the first `rows` rows as one tensor.
    ///
    /// Rows that were never written contribute zero rows; with the
    /// operator's offset assignment those only occur past the last valid
    /// element of a trailing batch, and callers slice them away via the
    /// `rows` argument.
    pub fn assemble(&self, rows: usize) -> Result<Tensor> {
        if rows > self.rows.len() {
            return Err(Error::invalid_argument(format!(
                "cannot assemble {rows} rows from a batch of {}",
                self.rows.len()
            )));
        }
        let mut data = TensorData::with_capacity(self.dtype, rows * self.row_len);
        for slot in &self.rows[..rows] {
            match slot.get() {
                Some(t) => data.extend_range(t.data(), 0, self.row_len),
                None => data.extend_zeros(self.row_len),
            }
        }
        let mut shape = Vec::with_capacity(self.row_shape.len() + 1);
        shape.push(rows);
        shape.extend_from_slice(&self.row_shape);
        Ok(Tensor { shape, data })
    }

    /// Rebuild a buffer from a (possibly row-sliced) checkpointed batch
    /// tensor, re-inflating to `batch_size` rows.
    ///
    /// # Errors
    /// InvalidArgument if the stored tensor is rank-0 or holds more rows
    /// than `batch_size`.
    pub fn from_checkpointed(
        batch_size: usize,
        stored: &Tensor,
        attrs: &AllocatorAttrs,
    ) -> Result<Self> {
        let stored_rows = stored.dim0()?;
        if stored_rows > batch_size {
            return Err(Error::invalid_argument(format!(
                "checkpointed batch holds {stored_rows} rows but batch size is {batch_size}"
            )));
        }
        let buffer = Self::allocate(batch_size, stored.dtype(), &stored.shape()[1..], attrs);
        for i in 0..stored_rows {
            buffer.write_row(i, stored.row(i)?)?;
        }
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_and_row_views() -> Result<()> {
        let t = Tensor::new(TensorData::I64((0..12).collect()), vec![4, 3])?;
        let sliced = t.slice_rows(2)?;
        assert_eq!(sliced.shape(), &[2, 3]);
        assert_eq!(sliced.data(), &TensorData::I64(vec![0, 1, 2, 3, 4, 5]));

        let row = t.row(3)?;
        assert_eq!(row.shape(), &[3]);
        assert_eq!(row.data(), &TensorData::I64(vec![9, 10, 11]));
        Ok(())
    }

    #[test]
    fn row_batch_assembles_written_rows() -> Result<()> {
        let batch = RowBatch::allocate(3, DType::F32, &[2], &AllocatorAttrs::gpu_compatible());
        batch.write_row(1, Tensor::vector_f32(vec![3.0, 4.0]))?;
        batch.write_row(0, Tensor::vector_f32(vec![1.0, 2.0]))?;

        let partial = batch.assemble(2)?;
        assert_eq!(partial.shape(), &[2, 2]);
        assert_eq!(partial.data(), &TensorData::F32(vec![1.0, 2.0, 3.0, 4.0]));

        // The unwritten trailing row assembles as zeros.
        let full = batch.assemble(3)?;
        assert_eq!(full.shape(), &[3, 2]);
        assert_eq!(
            full.data(),
            &TensorData::F32(vec![1.0, 2.0, 3.0, 4.0, 0.0, 0.0])
        );
        Ok(())
    }

    #[test]
    fn row_batch_rejects_double_write() -> Result<()> {
        let batch = RowBatch::allocate(2, DType::I64, &[], &AllocatorAttrs::default());
        batch.write_row(0, Tensor::scalar_i64(7))?;
        assert!(batch.write_row(0, Tensor::scalar_i64(8)).is_err());
        Ok(())
    }

    #[test]
    fn checkpoint_round_trip_reinflates_partial() -> Result<()> {
        let batch = RowBatch::allocate(4, DType::I64, &[], &AllocatorAttrs::default());
        batch.write_row(0, Tensor::scalar_i64(10))?;
        batch.write_row(1, Tensor::scalar_i64(11))?;

        let stored = batch.assemble(2)?;
        let rebuilt =
            RowBatch::from_checkpointed(4, &stored, &AllocatorAttrs::gpu_compatible())?;
        assert_eq!(rebuilt.batch_size(), 4);
        assert_eq!(rebuilt.assemble(2)?, stored);
        Ok(())
    }
}
