//! Utility module
//!
//! This module provides:
//! - Configuration management
//! - Logging setup
//! - Forecast error metrics

mod config;
mod logging;
pub mod metrics;

pub use config::{
    BatchConfig, ChannelsConfig, Config, DataConfig, ExogenousBackend, ExogenousConfig, LoggingConfig, RunConfig,
};
pub use logging::{level_for_verbosity, setup_logging};
pub use metrics::{compare_sets, ForecastMetrics};
