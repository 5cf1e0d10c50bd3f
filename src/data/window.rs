//! Closeness / period / trend windows and the output horizon
//!
//! Offsets are counted in base-resolution ticks relative to the anchor.
//! Historical offsets are always ordered chronologically, most distant
//! first: a channel with frequency `f` and length `L` yields
//! `[-L*f, ..., -2f, -f]`. The output horizon with frequency `of`, count
//! `O` and start offset `s` yields `[s + of, s + 2*of, ..., s + O*of]`.
//! Every consumer (TEC stacking, exogenous alignment, tests) relies on
//! this ordering.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::grid::TimeGridIndex;
use super::timestamp::{format_key, is_aligned, shift};
use crate::error::{TecError, TecResult};

/// The three historical views fed to the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Closeness,
    Period,
    Trend,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [Self::Closeness, Self::Period, Self::Trend];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Closeness => "closeness",
            Self::Period => "period",
            Self::Trend => "trend",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sampling of one historical view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    /// Disabled channels contribute no offsets and no tensor
    pub enabled: bool,
    /// Sample every `freq` ticks
    pub freq: u32,
    /// Number of samples
    pub length: u32,
}

impl WindowSpec {
    pub fn new(freq: u32, length: u32) -> Self {
        Self {
            enabled: true,
            freq,
            length,
        }
    }

    pub fn disabled(freq: u32, length: u32) -> Self {
        Self {
            enabled: false,
            freq,
            length,
        }
    }

    pub fn validate(&self, kind: ChannelKind) -> TecResult<()> {
        if self.enabled && (self.freq < 1 || self.length < 1) {
            return Err(TecError::Config(format!(
                "{} channel needs freq >= 1 and length >= 1 (got freq={}, length={})",
                kind, self.freq, self.length
            )));
        }
        Ok(())
    }

    /// Offsets of this view, empty when disabled
    pub fn offsets(&self) -> Vec<i64> {
        if self.enabled {
            history_offsets(self.freq, self.length)
        } else {
            Vec::new()
        }
    }
}

/// Future horizon used as ground truth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Spacing between output maps, in ticks
    pub freq: u32,
    /// Number of output maps
    pub count: u32,
    /// Ticks to skip past the anchor before the first step
    #[serde(default)]
    pub start_offset: u32,
}

impl OutputSpec {
    pub fn new(freq: u32, count: u32) -> Self {
        Self {
            freq,
            count,
            start_offset: 0,
        }
    }

    pub fn validate(&self) -> TecResult<()> {
        if self.freq < 1 || self.count < 1 {
            return Err(TecError::Config(format!(
                "output needs freq >= 1 and count >= 1 (got freq={}, count={})",
                self.freq, self.count
            )));
        }
        Ok(())
    }

    pub fn offsets(&self) -> Vec<i64> {
        (1..=self.count as i64)
            .map(|k| self.start_offset as i64 + k * self.freq as i64)
            .collect()
    }
}

/// `[-L*f, ..., -f]`
pub fn history_offsets(freq: u32, length: u32) -> Vec<i64> {
    (1..=length as i64).rev().map(|k| -k * freq as i64).collect()
}

/// Anything that can tell whether an anchor has all the data it needs
pub trait AnchorCoverage {
    /// Ok when the anchor is fully covered, otherwise the first missing-data error
    fn check(&self, anchor: &NaiveDateTime) -> TecResult<()>;

    fn covers(&self, anchor: &NaiveDateTime) -> bool {
        self.check(anchor).is_ok()
    }

    /// Short label for logs
    fn label(&self) -> &'static str;
}

/// Computes required timestamps for every enabled view and the output
#[derive(Debug, Clone)]
pub struct WindowSampler {
    closeness: WindowSpec,
    period: WindowSpec,
    trend: WindowSpec,
    output: OutputSpec,
    resolution_minutes: u32,
}

impl WindowSampler {
    pub fn new(
        closeness: WindowSpec,
        period: WindowSpec,
        trend: WindowSpec,
        output: OutputSpec,
        resolution_minutes: u32,
    ) -> TecResult<Self> {
        closeness.validate(ChannelKind::Closeness)?;
        period.validate(ChannelKind::Period)?;
        trend.validate(ChannelKind::Trend)?;
        output.validate()?;
        if !(closeness.enabled || period.enabled || trend.enabled) {
            return Err(TecError::Config(
                "at least one of closeness, period or trend must be enabled".to_string(),
            ));
        }
        if resolution_minutes == 0 {
            return Err(TecError::Config("resolution must be positive".to_string()));
        }
        Ok(Self {
            closeness,
            period,
            trend,
            output,
            resolution_minutes,
        })
    }

    pub fn channel(&self, kind: ChannelKind) -> &WindowSpec {
        match kind {
            ChannelKind::Closeness => &self.closeness,
            ChannelKind::Period => &self.period,
            ChannelKind::Trend => &self.trend,
        }
    }

    pub fn output(&self) -> &OutputSpec {
        &self.output
    }

    pub fn resolution_minutes(&self) -> u32 {
        self.resolution_minutes
    }

    pub fn is_enabled(&self, kind: ChannelKind) -> bool {
        self.channel(kind).enabled
    }

    /// Enabled views in closeness, period, trend order
    pub fn enabled_channels(&self) -> Vec<ChannelKind> {
        ChannelKind::ALL
            .into_iter()
            .filter(|k| self.is_enabled(*k))
            .collect()
    }

    pub fn channel_offsets(&self, kind: ChannelKind) -> Vec<i64> {
        self.channel(kind).offsets()
    }

    pub fn output_offsets(&self) -> Vec<i64> {
        self.output.offsets()
    }

    /// Sorted union of every offset an anchor needs
    pub fn required_offsets(&self) -> Vec<i64> {
        let mut all: Vec<i64> = ChannelKind::ALL
            .into_iter()
            .flat_map(|k| self.channel_offsets(k))
            .chain(self.output_offsets())
            .collect();
        all.sort_unstable();
        all.dedup();
        all
    }

    /// Furthest tick looked back by any enabled view
    pub fn max_lookback_ticks(&self) -> i64 {
        self.required_offsets().first().map(|o| (-o).max(0)).unwrap_or(0)
    }

    /// Furthest tick looked ahead by the output
    pub fn max_lookahead_ticks(&self) -> i64 {
        self.required_offsets().last().map(|o| (*o).max(0)).unwrap_or(0)
    }

    pub fn channel_timestamps(&self, anchor: NaiveDateTime, kind: ChannelKind) -> Vec<NaiveDateTime> {
        self.to_timestamps(anchor, &self.channel_offsets(kind))
    }

    pub fn output_timestamps(&self, anchor: NaiveDateTime) -> Vec<NaiveDateTime> {
        self.to_timestamps(anchor, &self.output_offsets())
    }

    pub fn required_timestamps(&self, anchor: NaiveDateTime) -> Vec<NaiveDateTime> {
        self.to_timestamps(anchor, &self.required_offsets())
    }

    fn to_timestamps(&self, anchor: NaiveDateTime, offsets: &[i64]) -> Vec<NaiveDateTime> {
        offsets
            .iter()
            .map(|&o| shift(anchor, o, self.resolution_minutes))
            .collect()
    }

    /// Ok when every required map of `anchor` is present in `index`
    pub fn validate_anchor(&self, index: &TimeGridIndex, anchor: &NaiveDateTime) -> TecResult<()> {
        if !is_aligned(anchor, self.resolution_minutes) {
            return Err(TecError::InvalidAnchor {
                anchor: *anchor,
                reason: format!("not aligned to {}-minute grid", self.resolution_minutes),
            });
        }
        for ts in self.required_timestamps(*anchor) {
            index.get(&ts)?;
        }
        Ok(())
    }

    pub fn is_anchor_valid(&self, index: &TimeGridIndex, anchor: &NaiveDateTime) -> bool {
        self.validate_anchor(index, anchor).is_ok()
    }
}

impl fmt::Display for WindowSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for kind in ChannelKind::ALL {
            let spec = self.channel(kind);
            if spec.enabled {
                write!(f, "{}(f={}, L={}) ", kind, spec.freq, spec.length)?;
            } else {
                write!(f, "{}(off) ", kind)?;
            }
        }
        write!(
            f,
            "output(f={}, O={}, s={}) @{}min",
            self.output.freq, self.output.count, self.output.start_offset, self.resolution_minutes
        )
    }
}

/// Describe an anchor's required range, for diagnostics
pub fn describe_span(sampler: &WindowSampler, anchor: &NaiveDateTime) -> String {
    let required = sampler.required_timestamps(*anchor);
    match (required.first(), required.last()) {
        (Some(first), Some(last)) => format!("{} .. {}", format_key(first), format_key(last)),
        _ => format_key(anchor),
    }
}
