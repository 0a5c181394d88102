//! End-to-end tests for the fused map-and-batch transform.

use anyhow::Result;
use batchflow::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn identity() -> CapturedFunction {
    CapturedFunction::new(|_, element| Ok(element))
}

fn scalar_range(
    stop: i64,
    batch_size: usize,
    num_parallel_calls: usize,
    drop_remainder: bool,
) -> Result<MapAndBatchDataset> {
    Ok(MapAndBatchDataset::new(
        Arc::new(RangeDataset::new(0, stop)),
        identity(),
        batch_size,
        num_parallel_calls,
        drop_remainder,
        vec![DType::I64],
        vec![PartialShape::known(&[])],
    )?)
}

fn i64_batch(values: &[i64]) -> Tensor {
    Tensor::new(TensorData::I64(values.to_vec()), vec![values.len()]).unwrap()
}

fn collect(iterator: &dyn DatasetIterator) -> batchflow::Result<Vec<Element>> {
    let mut out = Vec::new();
    while let Some(batch) = iterator.get_next()? {
        out.push(batch);
    }
    Ok(out)
}

#[test]
fn full_batches_then_trailing_partial() -> Result<()> {
    let dataset = scalar_range(11, 4, 8, false)?;
    let iterator = dataset.make_iterator("root");

    let batches = collect(&*iterator)?;
    assert_eq!(
        batches,
        vec![
            vec![i64_batch(&[0, 1, 2, 3])],
            vec![i64_batch(&[4, 5, 6, 7])],
            vec![i64_batch(&[8, 9, 10])],
        ]
    );

    // The iterator stays exhausted.
    assert_eq!(iterator.get_next()?, None);
    assert_eq!(iterator.get_next()?, None);
    Ok(())
}

#[test]
fn drop_remainder_discards_trailing_partial() -> Result<()> {
    let dataset = scalar_range(11, 4, 8, true)?;
    let iterator = dataset.make_iterator("root");

    let batches = collect(&*iterator)?;
    assert_eq!(
        batches,
        vec![
            vec![i64_batch(&[0, 1, 2, 3])],
            vec![i64_batch(&[4, 5, 6, 7])],
        ]
    );
    for batch in &batches {
        assert_eq!(batch[0].dim0()?, 4);
    }
    Ok(())
}

#[test]
fn singleton_batch() -> Result<()> {
    let dataset = MapAndBatchDataset::new(
        Arc::new(RangeDataset::new(42, 43)),
        identity(),
        1,
        1,
        false,
        vec![DType::I64],
        vec![PartialShape::known(&[])],
    )?;
    let iterator = dataset.make_iterator("root");
    assert_eq!(iterator.get_next()?, Some(vec![i64_batch(&[42])]));
    assert_eq!(iterator.get_next()?, None);
    Ok(())
}

#[test]
fn function_error_poisons_only_its_batch() -> Result<()> {
    let func = CapturedFunction::new(|_, element| {
        if element[0] == Tensor::scalar_i64(3) {
            return Err(Error::unknown("map function failed on 3"));
        }
        Ok(element)
    });
    let dataset = MapAndBatchDataset::new(
        Arc::new(RangeDataset::new(0, 6)),
        func,
        2,
        2,
        false,
        vec![DType::I64],
        vec![PartialShape::known(&[])],
    )?;
    let iterator = dataset.make_iterator("root");

    assert_eq!(iterator.get_next()?, Some(vec![i64_batch(&[0, 1])]));

    let err = iterator.get_next().unwrap_err();
    assert_eq!(err.code(), Code::Unknown);
    assert!(err.message().contains("failed on 3"));

    // The failed batch's slot is recycled; the stream continues.
    assert_eq!(iterator.get_next()?, Some(vec![i64_batch(&[4, 5])]));
    assert_eq!(iterator.get_next()?, None);
    Ok(())
}

#[test]
fn mismatched_row_shapes_surface_invalid_argument() -> Result<()> {
    // Row shape is fixed by the first successful call; the other call in
    // the batch returns a different element count and must be rejected.
    let func = CapturedFunction::new(|_, element| {
        let width = if element[0] == Tensor::scalar_i64(0) { 2 } else { 3 };
        Ok(vec![Tensor::vector_f32(vec![1.0; width])])
    });
    let dataset = MapAndBatchDataset::new(
        Arc::new(RangeDataset::new(0, 2)),
        func,
        2,
        2,
        false,
        vec![DType::F32],
        vec![PartialShape::unknown(1)],
    )?;
    let iterator = dataset.make_iterator("root");

    let err = iterator.get_next().unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(iterator.get_next()?, None);
    Ok(())
}

#[test]
fn multi_component_elements_batch_together() -> Result<()> {
    let source = TensorSliceDataset::new(vec![
        Tensor::new(TensorData::I64(vec![10, 20, 30]), vec![3])?,
        Tensor::new(TensorData::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), vec![3, 2])?,
    ])?;
    let func = CapturedFunction::new(|_, element| {
        let id = element[0].clone();
        let doubled = match element[1].data() {
            TensorData::F32(v) => Tensor::new(
                TensorData::F32(v.iter().map(|x| x * 2.0).collect()),
                element[1].shape().to_vec(),
            )?,
            other => panic!("unexpected feature storage {other:?}"),
        };
        Ok(vec![id, doubled])
    });
    let dataset = MapAndBatchDataset::new(
        Arc::new(source),
        func,
        2,
        4,
        false,
        vec![DType::I64, DType::F32],
        vec![PartialShape::known(&[]), PartialShape::known(&[2])],
    )?;
    let iterator = dataset.make_iterator("root");

    assert_eq!(
        iterator.get_next()?,
        Some(vec![
            i64_batch(&[10, 20]),
            Tensor::new(TensorData::F32(vec![2.0, 4.0, 6.0, 8.0]), vec![2, 2])?,
        ])
    );
    // Trailing partial keeps both components, leading dimension 1.
    assert_eq!(
        iterator.get_next()?,
        Some(vec![
            i64_batch(&[30]),
            Tensor::new(TensorData::F32(vec![10.0, 12.0]), vec![1, 2])?,
        ])
    );
    assert_eq!(iterator.get_next()?, None);
    Ok(())
}

#[test]
fn captured_inputs_reach_every_call() -> Result<()> {
    let func = CapturedFunction::with_captured_inputs(
        |captured, element| {
            let base = match captured[0].data() {
                TensorData::I64(v) => v[0],
                other => panic!("unexpected captured storage {other:?}"),
            };
            let value = match element[0].data() {
                TensorData::I64(v) => v[0],
                other => panic!("unexpected element storage {other:?}"),
            };
            Ok(vec![Tensor::scalar_i64(base + value)])
        },
        vec![Tensor::scalar_i64(100)],
    );
    assert_eq!(func.captured_inputs().len(), 1);

    let dataset = MapAndBatchDataset::new(
        Arc::new(RangeDataset::new(0, 4)),
        func,
        2,
        2,
        false,
        vec![DType::I64],
        vec![PartialShape::known(&[])],
    )?;
    let iterator = dataset.make_iterator("root");
    assert_eq!(
        collect(&*iterator)?,
        vec![vec![i64_batch(&[100, 101])], vec![i64_batch(&[102, 103])]]
    );
    Ok(())
}

#[test]
fn construction_rejects_bad_configuration() {
    let input: Arc<dyn Dataset> = Arc::new(RangeDataset::new(0, 10));

    let err = MapAndBatchDataset::new(
        Arc::clone(&input),
        identity(),
        0,
        4,
        false,
        vec![DType::I64],
        vec![PartialShape::known(&[])],
    )
    .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().contains("batch_size"));

    let err = MapAndBatchDataset::new(
        Arc::clone(&input),
        identity(),
        4,
        0,
        false,
        vec![DType::I64],
        vec![PartialShape::known(&[])],
    )
    .unwrap_err();
    assert!(err.message().contains("num_parallel_calls"));

    let err = MapAndBatchDataset::with_parallel_batches(
        input,
        identity(),
        4,
        0,
        false,
        vec![DType::I64],
        vec![PartialShape::known(&[])],
    )
    .unwrap_err();
    assert!(err.message().contains("num_parallel_batches"));
}

#[test]
fn parallel_batches_surface_scales_parallelism() -> Result<()> {
    let dataset = MapAndBatchDataset::with_parallel_batches(
        Arc::new(RangeDataset::new(0, 12)),
        identity(),
        4,
        2,
        false,
        vec![DType::I64],
        vec![PartialShape::known(&[])],
    )?;
    assert_eq!(dataset.num_parallel_calls(), 8);
    assert_eq!(dataset.ring_size(), 2);

    let iterator = dataset.make_iterator("root");
    assert_eq!(
        collect(&*iterator)?,
        vec![
            vec![i64_batch(&[0, 1, 2, 3])],
            vec![i64_batch(&[4, 5, 6, 7])],
            vec![i64_batch(&[8, 9, 10, 11])],
        ]
    );
    Ok(())
}

#[test]
fn ring_size_is_parallelism_over_batch_size() -> Result<()> {
    assert_eq!(scalar_range(1, 4, 8, false)?.ring_size(), 2);
    assert_eq!(scalar_range(1, 4, 1, false)?.ring_size(), 1);
    assert_eq!(scalar_range(1, 4, 9, false)?.ring_size(), 3);
    Ok(())
}

#[test]
fn checkpoint_round_trip_matches_uninterrupted_run() -> Result<()> {
    let make = || -> batchflow::Result<MapAndBatchDataset> {
        MapAndBatchDataset::new(
            Arc::new(RangeDataset::new(0, 10)),
            identity(),
            3,
            6,
            false,
            vec![DType::I64],
            vec![PartialShape::known(&[])],
        )
    };

    let baseline = collect(&*make()?.make_iterator("root"))?;

    let dataset = make()?;
    let iterator = dataset.make_iterator("root");
    let mut produced = Vec::new();
    for _ in 0..2 {
        produced.push(iterator.get_next()?.expect("two full batches"));
    }

    let mut bundle = StateBundle::new();
    iterator.save(&mut bundle.writer())?;
    drop(iterator);

    let resumed = dataset.make_iterator("root");
    resumed.restore(&bundle.reader())?;
    produced.extend(collect(&*resumed)?);

    assert_eq!(produced, baseline);
    Ok(())
}

#[test]
fn checkpoint_of_fresh_iterator_restores_to_start() -> Result<()> {
    let dataset = scalar_range(7, 2, 4, false)?;
    let baseline = collect(&*dataset.make_iterator("root"))?;

    let fresh = dataset.make_iterator("root");
    let mut bundle = StateBundle::new();
    fresh.save(&mut bundle.writer())?;
    drop(fresh);

    let restored = dataset.make_iterator("root");
    restored.restore(&bundle.reader())?;
    assert_eq!(collect(&*restored)?, baseline);
    Ok(())
}

#[test]
fn save_waits_for_in_flight_calls() -> Result<()> {
    let func = CapturedFunction::new(|_, element| {
        thread::sleep(Duration::from_millis(10));
        Ok(element)
    });
    let dataset = MapAndBatchDataset::new(
        Arc::new(RangeDataset::new(0, 8)),
        func,
        2,
        4,
        false,
        vec![DType::I64],
        vec![PartialShape::known(&[])],
    )?;

    let iterator = dataset.make_iterator("root");
    let first = iterator.get_next()?.expect("first batch");
    assert_eq!(first, vec![i64_batch(&[0, 1])]);

    // The runner has more calls in flight; save must quiesce them all
    // before serializing.
    let mut bundle = StateBundle::new();
    iterator.save(&mut bundle.writer())?;
    drop(iterator);

    let resumed = dataset.make_iterator("root");
    resumed.restore(&bundle.reader())?;
    assert_eq!(
        collect(&*resumed)?,
        vec![
            vec![i64_batch(&[2, 3])],
            vec![i64_batch(&[4, 5])],
            vec![i64_batch(&[6, 7])],
        ]
    );
    Ok(())
}

#[test]
fn drop_waits_for_calls_and_stops_dispatch() -> Result<()> {
    let dispatched = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&dispatched);
    let func = CapturedFunction::new(move |_, element| {
        counter.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        Ok(element)
    });
    let dataset = MapAndBatchDataset::new(
        Arc::new(RangeDataset::new(0, 1000)),
        func,
        2,
        4,
        false,
        vec![DType::I64],
        vec![PartialShape::known(&[])],
    )?;

    let iterator = dataset.make_iterator("root");
    assert_eq!(iterator.get_next()?, Some(vec![i64_batch(&[0, 1])]));

    // Tear down while calls are in flight: drop blocks until they
    // complete and the runner has exited.
    drop(iterator);

    let settled = dispatched.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(150));
    assert_eq!(
        dispatched.load(Ordering::SeqCst),
        settled,
        "no dispatches may happen after teardown"
    );
    Ok(())
}
