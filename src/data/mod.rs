//! Data module
//!
//! This module provides:
//! - Timestamp keys and the fixed-resolution time axis
//! - The in-memory TEC map index and its on-disk archive
//! - Closeness/period/trend window sampling and batch scheduling
//! - Batch tensor construction for TEC maps and exogenous series
//! - Batch export and prediction artifacts for offline validation

pub mod exogenous;
pub mod export;
pub mod grid;
pub mod pipeline;
pub mod prediction;
pub mod schedule;
pub mod tec_batch;
pub mod tec_map;
pub mod tensors;
pub mod timestamp;
pub mod window;

pub use exogenous::{
    exogenous_range, CsvExogenousSource, ExogenousBatchBuilder, ExogenousOptions, ExogenousRecord, ExogenousSource,
    ExogenousTable, GapPolicy, NormalizationMode, NormalizationParams, SqliteExogenousSource,
};
pub use export::{BatchExporter, Manifest};
pub use grid::{GridSpec, LoadPolicy, MapArchive, NpyArchive, TimeGridIndex};
pub use pipeline::{BatchPipeline, MaterializedBatch, Prefetcher};
pub use prediction::{ArtifactKind, PredictionStore};
pub use schedule::{Batch, BatchSchedule, BatchScheduleBuilder};
pub use tec_batch::TecBatchBuilder;
pub use tec_map::TecMap;
pub use tensors::{requested_slots, BatchedTensors, LossWeights, TensorSlot};
pub use window::{AnchorCoverage, ChannelKind, OutputSpec, WindowSampler, WindowSpec};
