//! batchflow: dataset pipelines with a fused parallel map-and-batch core.
//!
//! A [`Dataset`] describes a stream of tensor tuples; iterators pull
//! elements one at a time and can checkpoint their position. The
//! centerpiece is [`MapAndBatchDataset`], which applies a user function
//! to upstream elements with bounded parallelism and emits the results
//! as fixed-size batches, overlapping function calls across batch
//! boundaries.
//!
//! ```no_run
//! use batchflow::{
//!     CapturedFunction, Dataset, DatasetIterator, DType, MapAndBatchDataset, PartialShape,
//!     RangeDataset, Tensor,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> batchflow::Result<()> {
//! let source = Arc::new(RangeDataset::new(0, 100));
//! let dataset = MapAndBatchDataset::new(
//!     source,
//!     CapturedFunction::new(|_, element| Ok(element)),
//!     /* batch_size */ 8,
//!     /* num_parallel_calls */ 16,
//!     /* drop_remainder */ false,
//!     vec![DType::I64],
//!     vec![PartialShape::known(&[])],
//! )?;
//!
//! let iterator = dataset.make_iterator("root");
//! while let Some(batch) = iterator.get_next()? {
//!     let component: &Tensor = &batch[0];
//!     println!("batch of {}", component.dim0()?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod captured;
pub mod checkpoint;
pub mod dataset;
pub mod error;
pub mod map_and_batch;
pub mod source;
pub mod tensor;

pub use captured::CapturedFunction;
pub use checkpoint::{StateBundle, StateReader, StateWriter};
pub use dataset::{Dataset, DatasetIterator, Element};
pub use error::{Code, Error, Result};
pub use map_and_batch::{MapAndBatchDataset, MapAndBatchIterator};
pub use source::{RangeDataset, TensorSliceDataset};
pub use tensor::{AllocatorAttrs, DType, PartialShape, RowBatch, Tensor, TensorData};
