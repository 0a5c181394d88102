//! Dataset and iterator contracts.
//!
//! A [`Dataset`] describes a stream of [`Element`]s and manufactures
//! iterators over it; a [`DatasetIterator`] is one pull-based traversal
//! with checkpointable position. Operators such as map-and-batch wrap an
//! upstream dataset and expose the same two traits, so pipelines compose
//! by nesting.
//!
//! Iterators are shared across threads: parallel operators pull from
//! call sites running on pool threads, so `get_next` takes `&self` and
//! implementations serialize their cursor internally.

use crate::checkpoint::{StateReader, StateWriter};
use crate::error::Result;
use crate::tensor::{DType, PartialShape, Tensor};
use std::fmt;

/// One upstream element: an ordered tuple of typed tensors.
///
/// Arity and dtypes are fixed for a given stream.
pub type Element = Vec<Tensor>;

/// A recipe for a stream of elements.
pub trait Dataset: Send + Sync + fmt::Debug {
    /// Create a fresh iterator positioned at the start of the stream.
    ///
    /// `prefix` namespaces the iterator's checkpoint keys; nested
    /// operators extend it for their inputs.
    fn make_iterator(&self, prefix: &str) -> Box<dyn DatasetIterator>;

    /// Dtypes of the element components this dataset produces.
    fn output_dtypes(&self) -> &[DType];

    /// Shapes (possibly partial) of the element components.
    fn output_shapes(&self) -> &[PartialShape];
}

/// A pull-based traversal of a dataset.
pub trait DatasetIterator: Send + Sync {
    /// Produce the next element, or `None` at end of input.
    ///
    /// Once `None` has been returned, further calls keep returning
    /// `None` cheaply; parallel consumers may race past the end and
    /// issue redundant pulls.
    fn get_next(&self) -> Result<Option<Element>>;

    /// Serialize this iterator's position into `writer`.
    fn save(&self, writer: &mut StateWriter<'_>) -> Result<()>;

    /// Reset this iterator to the position stored in `reader`.
    fn restore(&self, reader: &StateReader<'_>) -> Result<()>;
}
