//! Leaf datasets.
//!
//! These are the in-memory producers pipelines start from: a half-open
//! integer range and a set of tensors consumed row by row. Both keep
//! their cursor behind a mutex because downstream parallel operators
//! pull from pool threads, and both checkpoint the cursor so a pipeline
//! can resume mid-stream.

use crate::checkpoint::{full_name, StateReader, StateWriter};
use crate::dataset::{Dataset, DatasetIterator, Element};
use crate::error::{Error, Result};
use crate::tensor::{DType, PartialShape, Tensor};
use std::sync::Mutex;

/// Scalar i64 values from `start` (inclusive) to `stop` (exclusive).
#[derive(Clone, Debug)]
pub struct RangeDataset {
    start: i64,
    stop: i64,
    step: i64,
    dtypes: [DType; 1],
    shapes: [PartialShape; 1],
}

impl RangeDataset {
    /// Range with step 1.
    pub fn new(start: i64, stop: i64) -> Self {
        Self::with_step(start, stop, 1).expect("step 1 is valid")
    }

    /// Range with an explicit step.
    ///
    /// # Errors
    /// InvalidArgument if `step` is zero.
    pub fn with_step(start: i64, stop: i64, step: i64) -> Result<Self> {
        if step == 0 {
            return Err(Error::invalid_argument("step must be nonzero"));
        }
        Ok(Self {
            start,
            stop,
            step,
            dtypes: [DType::I64],
            shapes: [PartialShape::known(&[])],
        })
    }
}

impl Dataset for RangeDataset {
    fn make_iterator(&self, prefix: &str) -> Box<dyn DatasetIterator> {
        Box::new(RangeIterator {
            prefix: format!("{prefix}::Range"),
            stop: self.stop,
            step: self.step,
            next: Mutex::new(self.start),
        })
    }

    fn output_dtypes(&self) -> &[DType] {
        &self.dtypes
    }

    fn output_shapes(&self) -> &[PartialShape] {
        &self.shapes
    }
}

struct RangeIterator {
    prefix: String,
    stop: i64,
    step: i64,
    next: Mutex<i64>,
}

impl DatasetIterator for RangeIterator {
    fn get_next(&self) -> Result<Option<Element>> {
        let mut next = self.next.lock().unwrap();
        let exhausted = if self.step > 0 {
            *next >= self.stop
        } else {
            *next <= self.stop
        };
        if exhausted {
            return Ok(None);
        }
        let value = *next;
        *next += self.step;
        Ok(Some(vec![Tensor::scalar_i64(value)]))
    }

    fn save(&self, writer: &mut StateWriter<'_>) -> Result<()> {
        let next = self.next.lock().unwrap();
        writer.write_scalar(full_name(&self.prefix, "next"), *next);
        Ok(())
    }

    fn restore(&self, reader: &StateReader<'_>) -> Result<()> {
        let restored = reader.read_scalar(&full_name(&self.prefix, "next"))?;
        *self.next.lock().unwrap() = restored;
        Ok(())
    }
}

/// Rows of a fixed set of component tensors.
///
/// Element `i` is row `i` of every component; all components must agree
/// on their leading dimension.
#[derive(Clone, Debug)]
pub struct TensorSliceDataset {
    components: Vec<Tensor>,
    len: usize,
    dtypes: Vec<DType>,
    shapes: Vec<PartialShape>,
}

impl TensorSliceDataset {
    /// # Errors
    /// InvalidArgument if `components` is empty, any component is
    /// rank-0, or leading dimensions disagree.
    pub fn new(components: Vec<Tensor>) -> Result<Self> {
        let first = components
            .first()
            .ok_or_else(|| Error::invalid_argument("at least one component is required"))?;
        let len = first.dim0()?;
        for c in &components[1..] {
            if c.dim0()? != len {
                return Err(Error::invalid_argument(format!(
                    "components disagree on leading dimension: {} vs {}",
                    len,
                    c.dim0()?
                )));
            }
        }
        let dtypes = components.iter().map(Tensor::dtype).collect();
        let shapes = components
            .iter()
            .map(|c| PartialShape::known(&c.shape()[1..]))
            .collect();
        Ok(Self {
            components,
            len,
            dtypes,
            shapes,
        })
    }

    /// Number of elements in the stream.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Dataset for TensorSliceDataset {
    fn make_iterator(&self, prefix: &str) -> Box<dyn DatasetIterator> {
        Box::new(TensorSliceIterator {
            prefix: format!("{prefix}::TensorSlice"),
            components: self.components.clone(),
            len: self.len,
            index: Mutex::new(0),
        })
    }

    fn output_dtypes(&self) -> &[DType] {
        &self.dtypes
    }

    fn output_shapes(&self) -> &[PartialShape] {
        &self.shapes
    }
}

struct TensorSliceIterator {
    prefix: String,
    components: Vec<Tensor>,
    len: usize,
    index: Mutex<usize>,
}

impl DatasetIterator for TensorSliceIterator {
    fn get_next(&self) -> Result<Option<Element>> {
        let mut index = self.index.lock().unwrap();
        if *index >= self.len {
            return Ok(None);
        }
        let element = self
            .components
            .iter()
            .map(|c| c.row(*index))
            .collect::<Result<Element>>()?;
        *index += 1;
        Ok(Some(element))
    }

    fn save(&self, writer: &mut StateWriter<'_>) -> Result<()> {
        let index = self.index.lock().unwrap();
        writer.write_scalar(full_name(&self.prefix, "index"), *index as i64);
        Ok(())
    }

    fn restore(&self, reader: &StateReader<'_>) -> Result<()> {
        let restored = reader.read_scalar(&full_name(&self.prefix, "index"))?;
        if restored < 0 || restored as usize > self.len {
            return Err(Error::invalid_argument(format!(
                "restored index {restored} out of range for {} elements",
                self.len
            )));
        }
        *self.index.lock().unwrap() = restored as usize;
        Ok(())
    }
}
