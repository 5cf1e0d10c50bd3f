//! Configuration management
//!
//! A run is described by one TOML file. It is loaded once, CLI overrides are
//! applied, it is validated, and from then on only read.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::data::exogenous::{
    exogenous_range, CsvExogenousSource, ExogenousOptions, ExogenousSource, GapPolicy, NormalizationMode,
    SqliteExogenousSource,
};
use crate::data::grid::{GridSpec, LoadPolicy};
use crate::data::tensors::{requested_slots, TensorSlot};
use crate::data::timestamp::parse_datetime;
use crate::data::window::{ChannelKind, OutputSpec, WindowSampler, WindowSpec};
use crate::error::{TecError, TecResult};

/// TEC archive and date range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub archive_dir: PathBuf,
    /// First anchor, inclusive
    pub start_date: String,
    /// Last anchor, inclusive
    pub end_date: String,
    pub resolution_minutes: u32,
    /// Extra days loaded around the range so edge anchors have history
    pub load_window_days: u32,
    pub load_policy: LoadPolicy,
    /// Optional `[H, W]` loss-weight matrix
    pub loss_weights: Option<PathBuf>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("data/tec_maps"),
            start_date: "2015-01-01 00:00:00".to_string(),
            end_date: "2015-01-31 23:55:00".to_string(),
            resolution_minutes: 5,
            load_window_days: 1,
            load_policy: LoadPolicy::Strict,
            loss_weights: None,
        }
    }
}

/// Closeness, period and trend views
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    pub closeness: WindowSpec,
    pub period: WindowSpec,
    pub trend: WindowSpec,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            closeness: WindowSpec::new(1, 12),
            period: WindowSpec::new(12, 24),
            trend: WindowSpec::new(36, 8),
        }
    }
}

/// Batching and scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub batch_size: usize,
    /// Consider every n-th tick as an anchor
    pub anchor_stride: u32,
    pub train_ratio: f64,
    /// Shuffle batch order with this seed; chronological when absent
    pub shuffle_seed: Option<u64>,
    pub prefetch_depth: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            anchor_stride: 1,
            train_ratio: 0.8,
            shuffle_seed: None,
            prefetch_depth: 2,
        }
    }
}

/// Backend of the exogenous store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExogenousBackend {
    #[default]
    Sqlite,
    Csv,
}

/// OMNI / IMF exogenous input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExogenousConfig {
    pub enabled: bool,
    pub backend: ExogenousBackend,
    pub path: Option<PathBuf>,
    pub table: String,
    pub datetime_column: String,
    pub fields: Vec<String>,
    pub gap_policy: GapPolicy,
    pub normalize: bool,
}

impl Default for ExogenousConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: ExogenousBackend::Sqlite,
            path: Some(PathBuf::from("data/omni_imf_res_5.sqlite")),
            table: "IMF".to_string(),
            datetime_column: "datetime".to_string(),
            fields: ["Bx", "By", "Bz", "Vx", "Np"].iter().map(|s| s.to_string()).collect(),
            gap_policy: GapPolicy::Fail,
            normalize: true,
        }
    }
}

/// Where a run keeps its artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub run_dir: PathBuf,
    /// Training mode fits normalization; evaluation reuses it
    pub training: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from("runs/default"),
            training: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default = "default_output")]
    pub output: OutputSpec,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub exogenous: ExogenousConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_output() -> OutputSpec {
    OutputSpec::new(1, 12)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: DataConfig::default(),
            channels: ChannelsConfig::default(),
            output: default_output(),
            batch: BatchConfig::default(),
            exogenous: ExogenousConfig::default(),
            run: RunConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> TecResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> TecResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create default configuration file
    pub fn create_default<P: AsRef<Path>>(path: P) -> TecResult<()> {
        Config::default().save(path)
    }

    pub fn start(&self) -> TecResult<NaiveDateTime> {
        parse_datetime(&self.data.start_date)
    }

    pub fn end(&self) -> TecResult<NaiveDateTime> {
        parse_datetime(&self.data.end_date)
    }

    pub fn validate(&self) -> TecResult<()> {
        let res = self.data.resolution_minutes;
        if res == 0 || 1440 % res != 0 {
            return Err(TecError::Config(format!(
                "resolution of {} minutes does not divide a day",
                res
            )));
        }
        if self.start()? > self.end()? {
            return Err(TecError::Config(format!(
                "end date {} precedes start date {}",
                self.data.end_date, self.data.start_date
            )));
        }
        if self.batch.batch_size < 1 {
            return Err(TecError::Config("batch size must be at least 1".to_string()));
        }
        if self.batch.anchor_stride < 1 {
            return Err(TecError::Config("anchor stride must be at least 1".to_string()));
        }
        if !(self.batch.train_ratio > 0.0 && self.batch.train_ratio <= 1.0) {
            return Err(TecError::Config(format!(
                "train ratio {} is outside (0, 1]",
                self.batch.train_ratio
            )));
        }
        if self.exogenous.enabled {
            if self.exogenous.path.is_none() {
                return Err(TecError::Config("exogenous input enabled without a source path".to_string()));
            }
            if self.exogenous.fields.is_empty() {
                return Err(TecError::Config("exogenous input enabled without fields".to_string()));
            }
            if !self.channels.trend.enabled {
                return Err(TecError::Config(
                    "exogenous sequences follow the trend window, which is disabled".to_string(),
                ));
            }
        }
        // channel and output checks
        self.sampler().map(|_| ())
    }

    pub fn grid_spec(&self) -> TecResult<GridSpec> {
        Ok(GridSpec {
            start: self.start()?,
            end: self.end()?,
            resolution_minutes: self.data.resolution_minutes,
            load_window_days: self.data.load_window_days,
            policy: self.data.load_policy,
        })
    }

    pub fn sampler(&self) -> TecResult<WindowSampler> {
        WindowSampler::new(
            self.channels.closeness,
            self.channels.period,
            self.channels.trend,
            self.output,
            self.data.resolution_minutes,
        )
    }

    pub fn enabled_channels(&self) -> Vec<ChannelKind> {
        ChannelKind::ALL
            .into_iter()
            .filter(|&k| match k {
                ChannelKind::Closeness => self.channels.closeness.enabled,
                ChannelKind::Period => self.channels.period.enabled,
                ChannelKind::Trend => self.channels.trend.enabled,
            })
            .collect()
    }

    /// Slots the model graph consumes under this configuration
    pub fn requested_slots(&self) -> Vec<TensorSlot> {
        requested_slots(
            &self.enabled_channels(),
            self.exogenous.enabled,
            self.data.loss_weights.is_some(),
        )
    }

    /// Exogenous store as configured, if enabled
    pub fn exogenous_source(&self) -> TecResult<Option<Box<dyn ExogenousSource>>> {
        if !self.exogenous.enabled {
            return Ok(None);
        }
        let path = self
            .exogenous
            .path
            .as_ref()
            .ok_or_else(|| TecError::Config("exogenous input enabled without a source path".to_string()))?;
        let fields = self.exogenous.fields.clone();
        let source: Box<dyn ExogenousSource> = match self.exogenous.backend {
            ExogenousBackend::Csv => Box::new(CsvExogenousSource::new(path, fields)),
            ExogenousBackend::Sqlite => Box::new(SqliteExogenousSource::new(
                path,
                &self.exogenous.table,
                &self.exogenous.datetime_column,
                fields,
            )?),
        };
        Ok(Some(source))
    }

    /// Range the exogenous table must span
    pub fn exogenous_range(&self) -> TecResult<(NaiveDateTime, NaiveDateTime)> {
        Ok(exogenous_range(self.start()?, self.end()?, self.data.load_window_days))
    }

    /// Builder options; training defers the fit until the train split is known
    pub fn exogenous_options(&self) -> TecResult<ExogenousOptions> {
        let normalization = match (self.exogenous.normalize, self.run.training) {
            (false, _) => NormalizationMode::Disabled,
            (true, true) => NormalizationMode::FitTraining,
            (true, false) => NormalizationMode::Load,
        };
        Ok(ExogenousOptions {
            gap_policy: self.exogenous.gap_policy,
            normalization,
            run_dir: self.run.run_dir.clone(),
            trend_freq: self.channels.trend.freq,
            trend_length: self.channels.trend.length,
            resolution_minutes: self.data.resolution_minutes,
        })
    }
}
