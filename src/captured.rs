//! User-supplied per-element functions.
//!
//! A [`CapturedFunction`] bundles the user's mapping closure with the
//! tensors it captured at construction time. Operators invoke it through
//! [`CapturedFunction::run_async`], which executes the closure on the
//! shared rayon pool and hands the result to a completion callback; the
//! pool is the same executor the rest of the process computes on, so an
//! operator bounds its own in-flight calls rather than growing threads.

use crate::dataset::Element;
use crate::error::Result;
use crate::tensor::Tensor;
use std::fmt;
use std::sync::Arc;

type MapFn = dyn Fn(&[Tensor], Element) -> Result<Element> + Send + Sync;

/// A mapping function plus its captured inputs.
pub struct CapturedFunction {
    func: Arc<MapFn>,
    captured_inputs: Vec<Tensor>,
}

impl fmt::Debug for CapturedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedFunction")
            .field("captured_inputs", &self.captured_inputs.len())
            .finish()
    }
}

impl CapturedFunction {
    /// Wrap a closure with no captured inputs.
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&[Tensor], Element) -> Result<Element> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            captured_inputs: Vec::new(),
        }
    }

    /// Wrap a closure together with tensors bound at construction time.
    /// The closure receives them as its first argument on every call.
    pub fn with_captured_inputs<F>(func: F, captured_inputs: Vec<Tensor>) -> Self
    where
        F: Fn(&[Tensor], Element) -> Result<Element> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            captured_inputs,
        }
    }

    /// The tensors bound at construction time.
    pub fn captured_inputs(&self) -> &[Tensor] {
        &self.captured_inputs
    }

    /// Invoke the function synchronously on the calling thread.
    pub fn run(&self, input: Element) -> Result<Element> {
        (self.func)(&self.captured_inputs, input)
    }

    /// Invoke the function on the shared executor.
    ///
    /// `completion` runs on the pool thread that executed the call, after
    /// the function's outputs (or error) are ready.
    pub fn run_async<C>(self: &Arc<Self>, input: Element, completion: C)
    where
        C: FnOnce(Result<Element>) + Send + 'static,
    {
        let func = Arc::clone(self);
        rayon::spawn(move || {
            let result = func.run(input);
            completion(result);
        });
    }
}
