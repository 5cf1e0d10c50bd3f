//! Wiring a validated [`Config`] into loaded data and a batch schedule
//!
//! All bulk loading happens in [`Session::open`]; everything after that is
//! in-memory lookups against shared, read-only state.

use chrono::NaiveDateTime;
use std::sync::Arc;
use tracing::info;

use crate::data::exogenous::{ExogenousBatchBuilder, NormalizationMode, NormalizationParams};
use crate::data::grid::{MapArchive, NpyArchive, TimeGridIndex};
use crate::data::pipeline::BatchPipeline;
use crate::data::schedule::{BatchSchedule, BatchScheduleBuilder};
use crate::data::tec_batch::TecBatchBuilder;
use crate::data::tensors::LossWeights;
use crate::error::{TecError, TecResult};
use crate::utils::Config;

/// Loaded TEC index plus optional exogenous table and loss weights
pub struct Session {
    config: Config,
    tec: Arc<TecBatchBuilder>,
    exogenous: Option<Arc<ExogenousBatchBuilder>>,
    loss_weights: Option<Arc<LossWeights>>,
}

impl Session {
    /// Load everything the configuration asks for from the archive on disk
    pub fn open(config: &Config) -> TecResult<Self> {
        let archive = NpyArchive::new(&config.data.archive_dir);
        Self::open_with(config, &archive)
    }

    /// Like `open`, reading maps from any archive
    pub fn open_with<A: MapArchive + Sync>(config: &Config, archive: &A) -> TecResult<Self> {
        config.validate()?;
        let sampler = config.sampler()?;
        info!("Window layout: {}", sampler);

        let index = TimeGridIndex::load(archive, &config.grid_spec()?)?;
        let tec = Arc::new(TecBatchBuilder::new(Arc::new(index), sampler));

        let exogenous = match config.exogenous_source()? {
            Some(source) => {
                let (start, end) = config.exogenous_range()?;
                let options = config.exogenous_options()?;
                let mut builder = ExogenousBatchBuilder::load(&*source, start, end, &options)?;
                if options.normalization == NormalizationMode::FitTraining {
                    let (fit_start, fit_end) = training_span(config, &tec, &builder)?;
                    builder.fit_normalization(fit_start, fit_end, &options.run_dir)?;
                }
                Some(Arc::new(builder))
            }
            None => None,
        };

        let loss_weights = match &config.data.loss_weights {
            Some(path) => {
                let weights = LossWeights::load(path)?;
                if Some(weights.shape()) != tec.index().shape() {
                    return Err(TecError::Config(format!(
                        "loss weights {:?} do not match TEC maps {:?}",
                        weights.shape(),
                        tec.index().shape()
                    )));
                }
                Some(Arc::new(weights))
            }
            None => None,
        };

        Ok(Self {
            config: config.clone(),
            tec,
            exogenous,
            loss_weights,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tec(&self) -> &Arc<TecBatchBuilder> {
        &self.tec
    }

    pub fn exogenous(&self) -> Option<&Arc<ExogenousBatchBuilder>> {
        self.exogenous.as_ref()
    }

    /// Valid anchors over the configured range, batched and optionally shuffled
    pub fn schedule(&self) -> TecResult<BatchSchedule> {
        let mut schedule = chronological_schedule(&self.config, &self.tec, self.exogenous.as_deref())?;
        if let Some(seed) = self.config.batch.shuffle_seed {
            schedule.shuffle(seed);
        }
        Ok(schedule)
    }

    /// Chronological train/validation split; only the train part is shuffled
    ///
    /// Exogenous normalization is fitted on exactly the train part returned here.
    pub fn split_schedule(&self) -> TecResult<(BatchSchedule, BatchSchedule)> {
        let schedule = chronological_schedule(&self.config, &self.tec, self.exogenous.as_deref())?;
        let (mut train, val) = schedule.split(self.config.batch.train_ratio);
        if let Some(seed) = self.config.batch.shuffle_seed {
            train.shuffle(seed);
        }
        Ok((train, val))
    }

    pub fn pipeline(&self, schedule: &BatchSchedule) -> BatchPipeline {
        let mut pipeline = BatchPipeline::new(Arc::clone(&self.tec), schedule);
        if let Some(exo) = &self.exogenous {
            pipeline = pipeline.with_exogenous(Arc::clone(exo));
        }
        if let Some(weights) = &self.loss_weights {
            pipeline = pipeline.with_loss_weights(Arc::clone(weights));
        }
        pipeline
    }
}

fn chronological_schedule(
    config: &Config,
    tec: &TecBatchBuilder,
    exogenous: Option<&ExogenousBatchBuilder>,
) -> TecResult<BatchSchedule> {
    let mut builder = BatchScheduleBuilder::new(
        config.start()?,
        config.end()?,
        config.data.resolution_minutes,
        config.batch.batch_size,
    )
    .with_anchor_stride(config.batch.anchor_stride)
    .with_coverage(tec);
    if let Some(exo) = exogenous {
        builder = builder.with_coverage(exo);
    }
    builder.build()
}

/// Exogenous span read by the train part of the chronological split
fn training_span(
    config: &Config,
    tec: &TecBatchBuilder,
    exogenous: &ExogenousBatchBuilder,
) -> TecResult<(NaiveDateTime, NaiveDateTime)> {
    let schedule = chronological_schedule(config, tec, Some(exogenous))?;
    let (train, _) = schedule.split(config.batch.train_ratio);
    let span = match (train.anchors().next(), train.anchors().last()) {
        (Some(first), Some(last)) => Ok(exogenous.history_span(*first, *last)),
        _ => Err(TecError::Normalization(
            "no training anchors to fit exogenous normalization on".to_string(),
        )),
    };
    span
}

/// Fit exogenous normalization on the training split and persist it
pub fn fit_normalization(config: &Config) -> TecResult<NormalizationParams> {
    if !config.exogenous.enabled {
        return Err(TecError::Config("exogenous input is disabled".to_string()));
    }
    let mut config = config.clone();
    config.exogenous.normalize = true;
    config.run.training = true;
    let session = Session::open(&config)?;
    session
        .exogenous()
        .and_then(|exo| exo.params())
        .cloned()
        .ok_or_else(|| TecError::Normalization("no parameters were fitted".to_string()))
}
