//! The fused map-and-batch transform.
//!
//! [`MapAndBatchDataset`] reads elements from an upstream dataset,
//! applies a [`CapturedFunction`] to each with bounded parallelism, and
//! assembles the results into fixed-size batches. Fusing the two stages
//! lets a single scheduler overlap function calls across batch
//! boundaries: up to `num_parallel_calls` calls run at once, spread over
//! a ring of `ceil(num_parallel_calls / batch_size)` in-progress batches.
//!
//! The iterator is built from four cooperating pieces:
//!
//! - a **runner** thread that admits new calls while there is both
//!   parallelism headroom and ring space, assigning each call a row
//!   offset from a monotonic call counter;
//! - **call sites** that pull one upstream element, dispatch the user
//!   function on the shared executor, and route the result into the
//!   right batch slot row;
//! - a ring of **batch slots** holding per-batch output buffers, element
//!   counts, and accumulated status;
//! - the **facade** ([`MapAndBatchIterator`]) that waits for the oldest
//!   slot to quiesce, emits its batch, and recycles the slot.
//!
//! Lock ordering is strict: the external mutex (serializing
//! `get_next`/`save`/`restore` callers) is taken before the global
//! mutex, which is taken before any slot mutex. Per-slot call counts
//! live in the global-lock state, and slot condvars are waited on with
//! the global lock, never a slot lock.

use crate::captured::CapturedFunction;
use crate::checkpoint::{full_name, StateReader, StateWriter};
use crate::dataset::{Dataset, DatasetIterator, Element};
use crate::error::{update_status, Code, Error, Result};
use crate::tensor::{AllocatorAttrs, DType, PartialShape, RowBatch, Tensor};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

/// Dataset transform fusing a parallel map with fixed-size batching.
///
/// Construction validates configuration; iteration state lives entirely
/// in the iterators the dataset manufactures.
#[derive(Debug)]
pub struct MapAndBatchDataset {
    input: Arc<dyn Dataset>,
    func: Arc<CapturedFunction>,
    batch_size: usize,
    num_parallel_calls: usize,
    drop_remainder: bool,
    output_dtypes: Vec<DType>,
    output_shapes: Vec<PartialShape>,
}

impl MapAndBatchDataset {
    /// Build the transform with an explicit call-level parallelism bound.
    ///
    /// `output_dtypes` and `output_shapes` describe the user function's
    /// per-element outputs; batches prepend a leading batch dimension.
    ///
    /// # Errors
    /// InvalidArgument if `batch_size` or `num_parallel_calls` is zero.
    pub fn new(
        input: Arc<dyn Dataset>,
        func: CapturedFunction,
        batch_size: usize,
        num_parallel_calls: usize,
        drop_remainder: bool,
        output_dtypes: Vec<DType>,
        output_shapes: Vec<PartialShape>,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::invalid_argument(
                "batch_size must be greater than zero",
            ));
        }
        if num_parallel_calls == 0 {
            return Err(Error::invalid_argument(
                "num_parallel_calls must be greater than zero",
            ));
        }
        Ok(Self {
            input,
            func: Arc::new(func),
            batch_size,
            num_parallel_calls,
            drop_remainder,
            output_dtypes,
            output_shapes,
        })
    }

    /// Build the transform from a batch-level parallelism bound, the
    /// original surface of the operator: the call-level bound becomes
    /// `num_parallel_batches * batch_size`.
    ///
    /// # Errors
    /// InvalidArgument if `batch_size` or `num_parallel_batches` is zero.
    pub fn with_parallel_batches(
        input: Arc<dyn Dataset>,
        func: CapturedFunction,
        batch_size: usize,
        num_parallel_batches: usize,
        drop_remainder: bool,
        output_dtypes: Vec<DType>,
        output_shapes: Vec<PartialShape>,
    ) -> Result<Self> {
        if num_parallel_batches == 0 {
            return Err(Error::invalid_argument(
                "num_parallel_batches must be greater than zero",
            ));
        }
        Self::new(
            input,
            func,
            batch_size,
            num_parallel_batches.saturating_mul(batch_size),
            drop_remainder,
            output_dtypes,
            output_shapes,
        )
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_parallel_calls(&self) -> usize {
        self.num_parallel_calls
    }

    pub fn drop_remainder(&self) -> bool {
        self.drop_remainder
    }

    /// Number of batch slots in an iterator's ring:
    /// `ceil(num_parallel_calls / batch_size)`.
    pub fn ring_size(&self) -> usize {
        self.num_parallel_calls.div_ceil(self.batch_size)
    }
}

impl Dataset for MapAndBatchDataset {
    fn make_iterator(&self, prefix: &str) -> Box<dyn DatasetIterator> {
        Box::new(MapAndBatchIterator::new(self, prefix))
    }

    fn output_dtypes(&self) -> &[DType] {
        &self.output_dtypes
    }

    fn output_shapes(&self) -> &[PartialShape] {
        &self.output_shapes
    }
}

/// State of one in-progress batch, guarded by its slot's mutex.
///
/// The slot's outstanding-call count is *not* here: like the global
/// counters it is guarded by the global mutex (see [`Global`]), because
/// completion bookkeeping and the facade's wait both run under that
/// lock.
struct SlotState {
    /// Some call for this batch observed end of input.
    end_of_input: bool,
    /// Calls that have completed for this batch, successfully or not.
    num_elements: usize,
    /// One buffer per output component; allocated by the first
    /// successful call.
    output: Vec<Arc<RowBatch>>,
    output_allocated: bool,
    /// First non-OK status among this batch's calls.
    status: Result<()>,
}

impl SlotState {
    fn new() -> Self {
        Self {
            end_of_input: false,
            num_elements: 0,
            output: Vec::new(),
            output_allocated: false,
            status: Ok(()),
        }
    }
}

struct BatchSlot {
    mu: Mutex<SlotState>,
    /// Signaled when the slot's outstanding-call count reaches zero.
    /// Waited on with the global lock.
    cond: Condvar,
}

impl BatchSlot {
    fn new() -> Self {
        Self {
            mu: Mutex::new(SlotState::new()),
            cond: Condvar::new(),
        }
    }
}

/// Counters guarded by the global mutex.
struct Global {
    /// Total outstanding calls across all slots; at most
    /// `num_parallel_calls`.
    num_calls: usize,
    /// Monotonic count of calls scheduled; `call_counter % batch_size`
    /// is the row offset of the next call.
    call_counter: u64,
    /// Next batch to hand downstream.
    input_batch: u64,
    /// Next batch whose calls are still being scheduled.
    output_batch: u64,
    cancelled: bool,
    /// Outstanding calls per ring slot, indexed like the ring.
    slot_calls: Vec<usize>,
    runner: Option<JoinHandle<()>>,
}

struct Inner {
    prefix: String,
    batch_size: usize,
    num_parallel_calls: usize,
    drop_remainder: bool,
    alloc_attrs: AllocatorAttrs,
    input: Arc<dyn DatasetIterator>,
    func: Arc<CapturedFunction>,
    mu: Mutex<Global>,
    cond_var: Condvar,
    slots: Vec<BatchSlot>,
}

/// Iterator over a [`MapAndBatchDataset`].
///
/// `get_next` produces one batch per call, in batch order. The runner
/// thread starts lazily on the first pull and is cancelled and joined on
/// drop; in-flight function calls are never interrupted, so drop blocks
/// until they complete.
pub struct MapAndBatchIterator {
    /// Serializes `get_next`/`save`/`restore` callers relative to each
    /// other. Always acquired before the global mutex.
    external_mu: Mutex<()>,
    inner: Arc<Inner>,
}

impl MapAndBatchIterator {
    fn new(dataset: &MapAndBatchDataset, prefix: &str) -> Self {
        let prefix = format!("{prefix}::MapAndBatch");
        let ring_size = dataset.ring_size();
        let input: Arc<dyn DatasetIterator> = Arc::from(dataset.input.make_iterator(&prefix));
        let slots = (0..ring_size).map(|_| BatchSlot::new()).collect();
        Self {
            external_mu: Mutex::new(()),
            inner: Arc::new(Inner {
                prefix,
                batch_size: dataset.batch_size,
                num_parallel_calls: dataset.num_parallel_calls,
                drop_remainder: dataset.drop_remainder,
                alloc_attrs: AllocatorAttrs::gpu_compatible(),
                input,
                func: Arc::clone(&dataset.func),
                mu: Mutex::new(Global {
                    num_calls: 0,
                    call_counter: 0,
                    input_batch: 0,
                    output_batch: 0,
                    cancelled: false,
                    slot_calls: vec![dataset.batch_size; ring_size],
                    runner: None,
                }),
                cond_var: Condvar::new(),
                slots,
            }),
        }
    }
}

impl DatasetIterator for MapAndBatchIterator {
    fn get_next(&self) -> Result<Option<Element>> {
        let _external = self.external_mu.lock().unwrap();
        let mut g = self.inner.mu.lock().unwrap();
        self.inner.ensure_runner_started(&mut g)?;
        let index = self.inner.slot_index(g.input_batch);
        while g.slot_calls[index] > 0 {
            g = self.inner.slots[index].cond.wait(g).unwrap();
        }
        self.inner.process_batch(g)
    }

    fn save(&self, writer: &mut StateWriter<'_>) -> Result<()> {
        let _external = self.external_mu.lock().unwrap();
        let mut g = self.inner.mu.lock().unwrap();
        // Quiescent point: every admitted call has completed.
        while g.num_calls > 0 {
            g = self.inner.cond_var.wait(g).unwrap();
        }
        trace!(prefix = %self.inner.prefix, "saving at quiescence");
        self.inner.input.save(writer)?;
        let p = &self.inner.prefix;
        writer.write_scalar(full_name(p, "call_counter"), g.call_counter as i64);
        writer.write_scalar(full_name(p, "input_batch"), g.input_batch as i64);
        writer.write_scalar(full_name(p, "output_batch"), g.output_batch as i64);
        writer.write_scalar(full_name(p, "batch_slots_size"), self.inner.slots.len() as i64);
        for index in 0..self.inner.slots.len() {
            self.inner.write_batch_slot(writer, &g, index)?;
        }
        Ok(())
    }

    fn restore(&self, reader: &StateReader<'_>) -> Result<()> {
        let _external = self.external_mu.lock().unwrap();
        let mut g = self.inner.mu.lock().unwrap();
        self.inner.input.restore(reader)?;
        let p = &self.inner.prefix;
        g.call_counter = read_count(reader, &full_name(p, "call_counter"))? as u64;
        g.input_batch = read_count(reader, &full_name(p, "input_batch"))? as u64;
        g.output_batch = read_count(reader, &full_name(p, "output_batch"))? as u64;
        let saved_slots = read_count(reader, &full_name(p, "batch_slots_size"))?;
        if saved_slots != self.inner.slots.len() {
            return Err(Error::invalid_argument(format!(
                "checkpoint was taken with {saved_slots} batch slots but this iterator has {}",
                self.inner.slots.len()
            )));
        }
        for index in 0..self.inner.slots.len() {
            self.inner.read_batch_slot(reader, &mut g, index)?;
        }
        debug!(
            prefix = %self.inner.prefix,
            input_batch = g.input_batch,
            output_batch = g.output_batch,
            "restored iterator state"
        );
        Ok(())
    }
}

impl Drop for MapAndBatchIterator {
    fn drop(&mut self) {
        let mut g = self.inner.mu.lock().unwrap();
        g.cancelled = true;
        self.inner.cond_var.notify_all();
        // In-flight calls are not interrupted; wait them out.
        while g.num_calls > 0 {
            g = self.inner.cond_var.wait(g).unwrap();
        }
        let runner = g.runner.take();
        drop(g);
        if let Some(handle) = runner {
            let _ = handle.join();
        }
        debug!(prefix = %self.inner.prefix, "iterator torn down");
    }
}

impl Inner {
    fn slot_index(&self, batch: u64) -> usize {
        (batch % self.slots.len() as u64) as usize
    }

    fn ensure_runner_started(self: &Arc<Self>, g: &mut Global) -> Result<()> {
        if g.runner.is_some() {
            return Ok(());
        }
        debug!(prefix = %self.prefix, parallelism = self.num_parallel_calls, ring = self.slots.len(), "starting runner");
        let inner = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("map-and-batch-runner".into())
            .spawn(move || inner.runner_loop())
            .map_err(|e| Error::internal(format!("failed to start runner thread: {e}")))?;
        g.runner = Some(handle);
        Ok(())
    }

    /// Scheduling loop. Admits a call whenever the in-flight count is
    /// below the parallelism bound and the ring has an unconsumed slot
    /// to direct it into; parks on the global condvar otherwise.
    fn runner_loop(self: &Arc<Self>) {
        let mut g = self.mu.lock().unwrap();
        loop {
            while !g.cancelled
                && (g.num_calls == self.num_parallel_calls
                    || g.output_batch - g.input_batch == self.slots.len() as u64)
            {
                g = self.cond_var.wait(g).unwrap();
            }
            if g.cancelled {
                debug!(prefix = %self.prefix, "runner cancelled");
                return;
            }
            while g.num_calls < self.num_parallel_calls
                && g.output_batch - g.input_batch < self.slots.len() as u64
            {
                let index = self.slot_index(g.output_batch);
                let offset = (g.call_counter % self.batch_size as u64) as usize;
                g.call_counter += 1;
                g.num_calls += 1;
                trace!(batch = g.output_batch, offset, "scheduling call");
                // Dispatch may block on the upstream pull or the shared
                // executor; release the lock across it.
                drop(g);
                self.call_function(index, offset);
                g = self.mu.lock().unwrap();
                if offset + 1 == self.batch_size {
                    // All of this batch's calls are scheduled.
                    g.output_batch += 1;
                }
            }
        }
    }

    /// One call: pull an element, then hand it to the user function.
    ///
    /// Runs on the runner thread with the global lock released. EOI and
    /// upstream errors complete the call immediately without a dispatch.
    fn call_function(self: &Arc<Self>, index: usize, offset: usize) {
        let pulled = self.input.get_next();
        let element = {
            let mut g = self.mu.lock().unwrap();
            let mut s = self.slots[index].mu.lock().unwrap();
            let element = match pulled {
                Ok(Some(element)) => Some(element),
                Ok(None) => {
                    s.end_of_input = true;
                    None
                }
                Err(e) => {
                    update_status(&mut s.status, Err(e));
                    None
                }
            };
            // A slot that already hit end of input or failed takes no
            // further elements; this call is complete as-is.
            if s.end_of_input || s.status.is_err() {
                drop(s);
                self.call_completed(&mut g, index);
                return;
            }
            element
        };
        let Some(element) = element else {
            // Both pull outcomes without an element set a terminal slot
            // condition and returned above.
            unreachable!("no element pulled but the slot is still accepting");
        };

        let inner = Arc::clone(self);
        self.func.run_async(element, move |result| {
            inner.callback(index, offset, result);
        });
    }

    /// Completion of one user-function call: route the returned tensors
    /// into row `offset` of slot `index`, then retire the call.
    ///
    /// `num_elements` counts completions whether or not the call
    /// succeeded; a failed call leaves the slot status non-OK, and batch
    /// emission discards the output in that case before the count could
    /// expose partially-written rows.
    fn callback(&self, index: usize, offset: usize, result: Result<Element>) {
        let slot = &self.slots[index];
        match result {
            Err(e) => {
                let mut s = slot.mu.lock().unwrap();
                update_status(&mut s.status, Err(e));
                s.num_elements += 1;
            }
            Ok(return_values) => {
                let buffers = {
                    let mut s = slot.mu.lock().unwrap();
                    self.ensure_output_allocated(&mut s, &return_values);
                    s.output.clone()
                };
                // Rows are written outside the slot lock; distinct
                // offsets target disjoint write-once rows.
                let write_status = self.write_components(&buffers, offset, return_values);
                let mut s = slot.mu.lock().unwrap();
                update_status(&mut s.status, write_status);
                s.num_elements += 1;
            }
        }
        let mut g = self.mu.lock().unwrap();
        self.call_completed(&mut g, index);
    }

    fn write_components(
        &self,
        buffers: &[Arc<RowBatch>],
        offset: usize,
        return_values: Element,
    ) -> Result<()> {
        if return_values.len() != buffers.len() {
            return Err(Error::invalid_argument(format!(
                "function returned {} components but the batch holds {}",
                return_values.len(),
                buffers.len()
            )));
        }
        for (value, buffer) in return_values.into_iter().zip(buffers) {
            if value.num_elements() != buffer.row_len() {
                return Err(Error::invalid_argument(format!(
                    "cannot add tensor to the batch: number of elements does not match; \
                     shapes are: [tensor]: {:?}, [batch]: {:?}",
                    value.shape(),
                    buffer.row_shape()
                )));
            }
            buffer.write_row(offset, value)?;
        }
        Ok(())
    }

    /// Allocate output buffers on the first successful call of a batch.
    fn ensure_output_allocated(&self, s: &mut SlotState, return_values: &[Tensor]) {
        if s.output_allocated {
            return;
        }
        for value in return_values {
            s.output.push(Arc::new(RowBatch::allocate(
                self.batch_size,
                value.dtype(),
                value.shape(),
                &self.alloc_attrs,
            )));
        }
        s.output_allocated = true;
    }

    /// Retire one call. Wakes the runner and any saver (global condvar)
    /// and, via the slot condvar, a consumer waiting on this batch.
    fn call_completed(&self, g: &mut Global, index: usize) {
        g.num_calls -= 1;
        self.cond_var.notify_all();
        g.slot_calls[index] -= 1;
        self.slots[index].cond.notify_all();
    }

    /// Emit the batch at `input_batch` and recycle its slot.
    ///
    /// Precondition: the slot's outstanding-call count is zero. The slot
    /// is reinitialized and `input_batch` advanced on every path,
    /// including errors.
    fn process_batch(
        &self,
        mut g: MutexGuard<'_, Global>,
    ) -> Result<Option<Element>> {
        let index = self.slot_index(g.input_batch);
        let slot = &self.slots[index];
        let mut s = slot.mu.lock().unwrap();
        let outcome = self.emit_batch(&mut s);
        *s = SlotState::new();
        drop(s);
        g.slot_calls[index] = self.batch_size;
        g.input_batch += 1;
        self.cond_var.notify_all();
        outcome
    }

    fn emit_batch(&self, s: &mut SlotState) -> Result<Option<Element>> {
        // No call delivered an element: clean end of sequence.
        if s.num_elements == 0 {
            return Ok(None);
        }
        if let Err(e) = s.status.clone() {
            s.output.clear();
            return Err(e);
        }
        if s.num_elements < self.batch_size {
            if self.drop_remainder {
                s.output.clear();
                return Ok(None);
            }
            // Trailing partial batch: reassemble each component with the
            // leading dimension shrunk to the element count.
            let batch = s
                .output
                .iter()
                .map(|buffer| buffer.assemble(s.num_elements))
                .collect::<Result<Element>>()?;
            s.output.clear();
            return Ok(Some(batch));
        }
        let batch = s
            .output
            .iter()
            .map(|buffer| buffer.assemble(self.batch_size))
            .collect::<Result<Element>>()?;
        s.output.clear();
        Ok(Some(batch))
    }

    fn write_batch_slot(
        &self,
        writer: &mut StateWriter<'_>,
        g: &Global,
        index: usize,
    ) -> Result<()> {
        let s = self.slots[index].mu.lock().unwrap();
        let key = |k: &str| full_name(&self.prefix, &format!("batch_slots_{index}_{k}"));
        if s.end_of_input {
            writer.write_presence(key("end_of_input"));
        }
        writer.write_scalar(key("num_calls"), g.slot_calls[index] as i64);
        writer.write_scalar(key("num_elements"), s.num_elements as i64);
        if s.output_allocated {
            writer.write_presence(key("output_allocated"));
        }
        writer.write_scalar(key("output_size"), s.output.len() as i64);
        for (i, buffer) in s.output.iter().enumerate() {
            // A partial batch's trailing rows were never written; persist
            // only the valid prefix and re-inflate on restore.
            let rows = s.num_elements.min(self.batch_size);
            writer.write_tensor(key(&format!("output_{i}")), buffer.assemble(rows)?);
        }
        match &s.status {
            Ok(()) => writer.write_scalar(key("status_code"), 0),
            Err(e) => {
                writer.write_scalar(key("status_code"), e.code() as i64);
                writer.write_str(key("status_msg"), e.message());
            }
        }
        Ok(())
    }

    fn read_batch_slot(
        &self,
        reader: &StateReader<'_>,
        g: &mut Global,
        index: usize,
    ) -> Result<()> {
        let mut s = self.slots[index].mu.lock().unwrap();
        let key = |k: &str| full_name(&self.prefix, &format!("batch_slots_{index}_{k}"));
        s.end_of_input = reader.contains(&key("end_of_input"));
        g.slot_calls[index] = read_count(reader, &key("num_calls"))?;
        s.num_elements = read_count(reader, &key("num_elements"))?;
        s.output_allocated = reader.contains(&key("output_allocated"));
        let output_size = read_count(reader, &key("output_size"))?;
        s.output.clear();
        for i in 0..output_size {
            let stored = reader.read_tensor(&key(&format!("output_{i}")))?;
            s.output.push(Arc::new(RowBatch::from_checkpointed(
                self.batch_size,
                stored,
                &self.alloc_attrs,
            )?));
        }
        let code = reader.read_scalar(&key("status_code"))?;
        s.status = if code == 0 {
            Ok(())
        } else {
            let code = Code::from_i64(code).ok_or_else(|| {
                Error::invalid_argument(format!("unknown status code {code} in checkpoint"))
            })?;
            Err(Error::new(code, reader.read_str(&key("status_msg"))?))
        };
        Ok(())
    }
}

/// Read a scalar that must be a non-negative count.
fn read_count(reader: &StateReader<'_>, key: &str) -> Result<usize> {
    let value = reader.read_scalar(key)?;
    usize::try_from(value)
        .map_err(|_| Error::invalid_argument(format!("checkpoint entry {key} is negative")))
}
