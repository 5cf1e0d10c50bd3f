//! Stacking TEC maps into per-batch tensors

use chrono::NaiveDateTime;
use ndarray::{s, Array4};
use std::sync::Arc;
use tracing::{debug, error};

use super::grid::TimeGridIndex;
use super::tensors::BatchedTensors;
use super::window::{describe_span, AnchorCoverage, ChannelKind, WindowSampler};
use crate::error::{TecError, TecResult};

/// Resolves anchors against the TEC index and stacks the maps
///
/// The index is shared read-only, so several builders (or a prefetch
/// thread) can work from the same loaded archive.
#[derive(Debug, Clone)]
pub struct TecBatchBuilder {
    index: Arc<TimeGridIndex>,
    sampler: WindowSampler,
}

impl TecBatchBuilder {
    pub fn new(index: Arc<TimeGridIndex>, sampler: WindowSampler) -> Self {
        Self { index, sampler }
    }

    pub fn index(&self) -> &TimeGridIndex {
        &self.index
    }

    pub fn sampler(&self) -> &WindowSampler {
        &self.sampler
    }

    /// Build closeness/period/trend/output tensors for `anchors`
    ///
    /// Anchors are expected to have passed schedule-time validation. Any
    /// anchor that fails here is a contract violation and aborts the whole
    /// batch; no partial tensors are returned.
    pub fn create_batch(&self, anchors: &[NaiveDateTime]) -> TecResult<BatchedTensors> {
        if anchors.is_empty() {
            return Err(TecError::Config("cannot build an empty batch".to_string()));
        }
        for anchor in anchors {
            if let Err(e) = self.sampler.validate_anchor(&self.index, anchor) {
                error!(
                    "Anchor passed to create_batch failed validation (needs {}): {}",
                    describe_span(&self.sampler, anchor),
                    e
                );
                return Err(match e {
                    TecError::InvalidAnchor { .. } => e,
                    other => TecError::InvalidAnchor {
                        anchor: *anchor,
                        reason: other.to_string(),
                    },
                });
            }
        }

        let grid = self
            .index
            .shape()
            .ok_or_else(|| TecError::Config("TEC index is empty".to_string()))?;

        let mut channels: [Option<Array4<f32>>; 3] = [None, None, None];
        for (slot, kind) in channels.iter_mut().zip(ChannelKind::ALL) {
            if self.sampler.is_enabled(kind) {
                *slot = Some(self.stack(anchors, grid, |a| self.sampler.channel_timestamps(a, kind))?);
            }
        }
        let output = self.stack(anchors, grid, |a| self.sampler.output_timestamps(a))?;

        let [closeness, period, trend] = channels;
        debug!("Built TEC batch of {} anchors", anchors.len());
        Ok(BatchedTensors {
            anchors: anchors.to_vec(),
            closeness,
            period,
            trend,
            output,
            exogenous: None,
            loss_weights: None,
        })
    }

    fn stack<F>(&self, anchors: &[NaiveDateTime], grid: (usize, usize), timestamps: F) -> TecResult<Array4<f32>>
    where
        F: Fn(NaiveDateTime) -> Vec<NaiveDateTime>,
    {
        let steps = timestamps(anchors[0]).len();
        let (h, w) = grid;
        let mut stacked = Array4::zeros((anchors.len(), steps, h, w));

        for (b, &anchor) in anchors.iter().enumerate() {
            for (t, ts) in timestamps(anchor).iter().enumerate() {
                let map = self.index.get(ts).map_err(|e| TecError::InvalidAnchor {
                    anchor,
                    reason: e.to_string(),
                })?;
                if map.shape() != grid {
                    return Err(TecError::ShapeMismatch {
                        timestamp: *ts,
                        expected: grid,
                        actual: map.shape(),
                    });
                }
                stacked.slice_mut(s![b, t, .., ..]).assign(&map.values);
            }
        }
        Ok(stacked)
    }
}

impl AnchorCoverage for TecBatchBuilder {
    fn check(&self, anchor: &NaiveDateTime) -> TecResult<()> {
        self.sampler.validate_anchor(&self.index, anchor)
    }

    fn label(&self) -> &'static str {
        "tec"
    }
}
