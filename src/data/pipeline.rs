//! Batch production, sequential or one step ahead of the consumer
//!
//! Prefetching only changes when a batch is built, never what it contains:
//! the same schedule yields identical tensors at any depth.

use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use super::exogenous::ExogenousBatchBuilder;
use super::schedule::{Batch, BatchSchedule};
use super::tec_batch::TecBatchBuilder;
use super::tensors::{BatchedTensors, LossWeights};
use crate::error::{TecError, TecResult};

/// A scheduled batch together with its tensors
#[derive(Debug, Clone)]
pub struct MaterializedBatch {
    pub batch: Batch,
    pub tensors: BatchedTensors,
}

#[derive(Debug, Clone)]
struct Builders {
    tec: Arc<TecBatchBuilder>,
    exogenous: Option<Arc<ExogenousBatchBuilder>>,
    loss_weights: Option<Arc<LossWeights>>,
}

impl Builders {
    fn materialize(&self, batch: &Batch) -> TecResult<MaterializedBatch> {
        let mut tensors = self.tec.create_batch(&batch.anchors)?;
        if let Some(exo) = &self.exogenous {
            let sequences = exo.batch_for(&batch.anchors).map_err(|e| elevate(batch, e))?;
            tensors = tensors.with_exogenous(sequences)?;
        }
        if let Some(weights) = &self.loss_weights {
            tensors = tensors.with_loss_weights(weights)?;
        }
        Ok(MaterializedBatch {
            batch: batch.clone(),
            tensors,
        })
    }
}

/// Missing data at batch time means schedule validation was bypassed
fn elevate(batch: &Batch, err: TecError) -> TecError {
    match (err.is_missing_data(), batch.key()) {
        (true, Some(anchor)) => TecError::InvalidAnchor {
            anchor,
            reason: format!("batch {}: {}", batch.index, err),
        },
        _ => err,
    }
}

/// Turns a schedule into a stream of materialized batches
#[derive(Debug, Clone)]
pub struct BatchPipeline {
    builders: Builders,
    batches: Vec<Batch>,
}

impl BatchPipeline {
    pub fn new(tec: Arc<TecBatchBuilder>, schedule: &BatchSchedule) -> Self {
        Self {
            builders: Builders {
                tec,
                exogenous: None,
                loss_weights: None,
            },
            batches: schedule.batches.clone(),
        }
    }

    pub fn with_exogenous(mut self, exogenous: Arc<ExogenousBatchBuilder>) -> Self {
        self.builders.exogenous = Some(exogenous);
        self
    }

    pub fn with_loss_weights(mut self, weights: Arc<LossWeights>) -> Self {
        self.builders.loss_weights = Some(weights);
        self
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Build one batch
    pub fn materialize(&self, batch: &Batch) -> TecResult<MaterializedBatch> {
        self.builders.materialize(batch)
    }

    /// Build batches lazily on the calling thread
    pub fn iter(&self) -> impl Iterator<Item = TecResult<MaterializedBatch>> + '_ {
        self.batches.iter().map(move |b| self.builders.materialize(b))
    }

    /// Build batches on a worker thread, keeping up to `depth` ready
    ///
    /// The worker stops after forwarding the first error.
    pub fn prefetch(self, depth: usize) -> Prefetcher {
        let (tx, rx) = sync_channel(depth);
        let Self { builders, batches } = self;
        let handle = thread::spawn(move || {
            for batch in &batches {
                let result = builders.materialize(batch);
                let failed = result.is_err();
                if tx.send(result).is_err() {
                    debug!("Prefetch consumer went away after batch {}", batch.index);
                    break;
                }
                if failed {
                    break;
                }
            }
        });
        Prefetcher {
            rx: Some(rx),
            handle: Some(handle),
        }
    }
}

/// Iterator over batches produced by a background worker
pub struct Prefetcher {
    rx: Option<Receiver<TecResult<MaterializedBatch>>>,
    handle: Option<JoinHandle<()>>,
}

impl Iterator for Prefetcher {
    type Item = TecResult<MaterializedBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Prefetch worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::exogenous::{ExogenousOptions, ExogenousRecord, ExogenousTable, GapPolicy, NormalizationMode};
    use crate::data::grid::{GridSpec, LoadPolicy, TimeGridIndex};
    use crate::data::schedule::BatchScheduleBuilder;
    use crate::data::tec_map::TecMap;
    use crate::data::timestamp::{parse_datetime, ticks_between};
    use crate::data::window::{OutputSpec, WindowSampler, WindowSpec};
    use chrono::NaiveDateTime;
    use ndarray::Array2;
    use tempfile::tempdir;

    fn ts(s: &str) -> NaiveDateTime {
        parse_datetime(s).unwrap()
    }

    fn tec() -> Arc<TecBatchBuilder> {
        let spec = GridSpec {
            start: ts("2015-01-02"),
            end: ts("2015-01-02 03:00:00"),
            resolution_minutes: 5,
            load_window_days: 0,
            policy: LoadPolicy::Strict,
        };
        let maps = ticks_between(spec.start, spec.end, 5, 1)
            .into_iter()
            .enumerate()
            .map(|(i, t)| TecMap::new(t, Array2::from_elem((2, 2), i as f32)));
        let index = TimeGridIndex::from_maps(maps, &spec).unwrap();
        let sampler = WindowSampler::new(
            WindowSpec::new(1, 3),
            WindowSpec::new(6, 2),
            WindowSpec::disabled(36, 2),
            OutputSpec::new(1, 2),
            5,
        )
        .unwrap();
        Arc::new(TecBatchBuilder::new(Arc::new(index), sampler))
    }

    fn schedule(tec: &TecBatchBuilder) -> BatchSchedule {
        BatchScheduleBuilder::new(ts("2015-01-02"), ts("2015-01-02 03:00:00"), 5, 4)
            .with_coverage(tec)
            .build()
            .unwrap()
    }

    #[test]
    fn test_prefetch_matches_sequential() {
        let tec = tec();
        let schedule = schedule(&tec);
        let pipeline = BatchPipeline::new(tec, &schedule);

        let sequential: Vec<_> = pipeline.iter().map(|r| r.unwrap()).collect();
        for depth in [0, 1, 3] {
            let prefetched: Vec<_> = pipeline.clone().prefetch(depth).map(|r| r.unwrap()).collect();
            assert_eq!(prefetched.len(), sequential.len());
            for (a, b) in prefetched.iter().zip(&sequential) {
                assert_eq!(a.batch, b.batch);
                assert_eq!(a.tensors.closeness, b.tensors.closeness);
                assert_eq!(a.tensors.output, b.tensors.output);
            }
        }
    }

    #[test]
    fn test_exogenous_gap_at_batch_time_is_elevated() {
        let tec = tec();
        let schedule = schedule(&tec);
        let dir = tempdir().unwrap();
        // records begin too late for the trend windows of the first batch
        let table = ExogenousTable::new(
            vec!["Bz".to_string()],
            ticks_between(ts("2015-01-01 20:00:00"), ts("2015-01-02 01:00:00"), 5, 1)
                .into_iter()
                .map(|t| ExogenousRecord { timestamp: t, values: vec![0.0] }),
        )
        .unwrap();
        let exo = ExogenousBatchBuilder::from_table(
            table,
            &ExogenousOptions {
                gap_policy: GapPolicy::Fail,
                normalization: NormalizationMode::Disabled,
                run_dir: dir.path().to_path_buf(),
                trend_freq: 36,
                trend_length: 2,
                resolution_minutes: 5,
            },
        )
        .unwrap();

        let pipeline = BatchPipeline::new(tec, &schedule).with_exogenous(Arc::new(exo));
        let results: Vec<_> = pipeline.prefetch(1).collect();
        let err = results.last().unwrap().as_ref().unwrap_err();
        assert!(matches!(err, TecError::InvalidAnchor { .. }));
        assert!(results.len() < schedule.len());
    }
}
