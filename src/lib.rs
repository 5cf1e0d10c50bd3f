//! # Deep-learning TEC forecasting: data batching engine
//!
//! Turns an archive of Total Electron Content (TEC) maps, one 2-D grid per
//! 5-minute tick, into batched tensors for ST-ResNet style models: for each
//! anchor time a closeness, period and trend history plus the future maps
//! to predict, optionally paired with exogenous solar-wind / IMF series.
//!
//! ## Modules
//!
//! - `data`: Archive loading, window sampling, scheduling, batch tensors, export
//! - `session`: Config-driven wiring of the data layer
//! - `utils`: Configuration, logging and forecast metrics
//! - `error`: Error types
//!
//! ## Example
//!
//! ```no_run
//! use deep_pred_tec::{Config, Session};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/default.toml")?;
//!     let session = Session::open(&config)?;
//!     let schedule = session.schedule()?;
//!
//!     for batch in session.pipeline(&schedule).prefetch(2) {
//!         let batch = batch?;
//!         let inputs = batch.tensors.feed(&config.requested_slots())?;
//!         println!("batch {}: {} slots", batch.batch.index, inputs.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod data;
pub mod error;
pub mod session;
pub mod utils;

pub use data::{
    BatchPipeline, BatchSchedule, BatchScheduleBuilder, BatchedTensors, ChannelKind, ExogenousBatchBuilder,
    PredictionStore, TecBatchBuilder, TensorSlot, TimeGridIndex, WindowSampler,
};
pub use error::{TecError, TecResult};
pub use session::Session;
pub use utils::Config;
