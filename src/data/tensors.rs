//! Named tensor slots handed to the model graph
//!
//! Rather than branching over every combination of enabled channels and
//! exogenous input, callers ask for a list of slots and feed whatever the
//! list names.

use chrono::NaiveDateTime;
use ndarray::{Array2, Array3, Array4, ArrayViewD, Axis};
use ndarray_npy::ReadNpyExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::path::Path;

use super::window::ChannelKind;
use crate::error::{TecError, TecResult};

/// One named input or target of the model graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorSlot {
    Closeness,
    Period,
    Trend,
    Output,
    Exogenous,
    LossWeights,
}

impl TensorSlot {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Closeness => "closeness",
            Self::Period => "period",
            Self::Trend => "trend",
            Self::Output => "output",
            Self::Exogenous => "exogenous",
            Self::LossWeights => "loss_weights",
        }
    }
}

impl From<ChannelKind> for TensorSlot {
    fn from(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Closeness => Self::Closeness,
            ChannelKind::Period => Self::Period,
            ChannelKind::Trend => Self::Trend,
        }
    }
}

impl fmt::Display for TensorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Slots the model consumes for a given set of enabled inputs
pub fn requested_slots(channels: &[ChannelKind], exogenous: bool, loss_weights: bool) -> Vec<TensorSlot> {
    let mut slots: Vec<TensorSlot> = channels.iter().map(|&k| k.into()).collect();
    slots.push(TensorSlot::Output);
    if exogenous {
        slots.push(TensorSlot::Exogenous);
    }
    if loss_weights {
        slots.push(TensorSlot::LossWeights);
    }
    slots
}

/// Tensors for one batch of anchors
///
/// Channel tensors are `[batch, length, height, width]`, the output is
/// `[batch, horizon, height, width]` and the exogenous tensor is
/// `[batch, trend_length, features]`.
#[derive(Debug, Clone)]
pub struct BatchedTensors {
    pub anchors: Vec<NaiveDateTime>,
    pub closeness: Option<Array4<f32>>,
    pub period: Option<Array4<f32>>,
    pub trend: Option<Array4<f32>>,
    pub output: Array4<f32>,
    pub exogenous: Option<Array3<f32>>,
    pub loss_weights: Option<Array4<f32>>,
}

impl BatchedTensors {
    pub fn batch_size(&self) -> usize {
        self.anchors.len()
    }

    pub fn channel(&self, kind: ChannelKind) -> Option<&Array4<f32>> {
        match kind {
            ChannelKind::Closeness => self.closeness.as_ref(),
            ChannelKind::Period => self.period.as_ref(),
            ChannelKind::Trend => self.trend.as_ref(),
        }
    }

    /// Attach the exogenous sequence tensor for the same anchors
    pub fn with_exogenous(mut self, exogenous: Array3<f32>) -> TecResult<Self> {
        if exogenous.len_of(Axis(0)) != self.batch_size() {
            return Err(TecError::TensorShape {
                slot: TensorSlot::Exogenous.name(),
                expected: vec![self.batch_size()],
                actual: vec![exogenous.len_of(Axis(0))],
            });
        }
        self.exogenous = Some(exogenous);
        Ok(self)
    }

    /// Attach a tiled loss-weight tensor
    pub fn with_loss_weights(mut self, weights: &LossWeights) -> TecResult<Self> {
        let (_, horizon, h, w) = self.output.dim();
        if weights.shape() != (h, w) {
            let (wh, ww) = weights.shape();
            return Err(TecError::TensorShape {
                slot: TensorSlot::LossWeights.name(),
                expected: vec![h, w],
                actual: vec![wh, ww],
            });
        }
        self.loss_weights = Some(weights.tile(self.batch_size(), horizon));
        Ok(self)
    }

    /// Dynamic view of a slot, if present
    pub fn slot(&self, slot: TensorSlot) -> Option<ArrayViewD<'_, f32>> {
        match slot {
            TensorSlot::Closeness => self.closeness.as_ref().map(|a| a.view().into_dyn()),
            TensorSlot::Period => self.period.as_ref().map(|a| a.view().into_dyn()),
            TensorSlot::Trend => self.trend.as_ref().map(|a| a.view().into_dyn()),
            TensorSlot::Output => Some(self.output.view().into_dyn()),
            TensorSlot::Exogenous => self.exogenous.as_ref().map(|a| a.view().into_dyn()),
            TensorSlot::LossWeights => self.loss_weights.as_ref().map(|a| a.view().into_dyn()),
        }
    }

    /// Views for every requested slot, failing on the first one that is absent
    pub fn feed(&self, slots: &[TensorSlot]) -> TecResult<Vec<(TensorSlot, ArrayViewD<'_, f32>)>> {
        slots
            .iter()
            .map(|&s| {
                self.slot(s)
                    .map(|view| (s, view))
                    .ok_or(TecError::MissingSlot(s.name()))
            })
            .collect()
    }

    /// Shapes of every present slot
    pub fn shapes(&self) -> Vec<(TensorSlot, Vec<usize>)> {
        [
            TensorSlot::Closeness,
            TensorSlot::Period,
            TensorSlot::Trend,
            TensorSlot::Output,
            TensorSlot::Exogenous,
            TensorSlot::LossWeights,
        ]
        .into_iter()
        .filter_map(|s| self.slot(s).map(|v| (s, v.shape().to_vec())))
        .collect()
    }
}

/// Per-cell weights for the model's weighted loss
#[derive(Debug, Clone)]
pub struct LossWeights {
    weights: Array2<f32>,
}

impl LossWeights {
    pub fn new(weights: Array2<f32>) -> Self {
        Self { weights }
    }

    /// Load an `[H, W]` matrix stored as f64 or f32
    pub fn load<P: AsRef<Path>>(path: P) -> TecResult<Self> {
        let path = path.as_ref();
        let weights = match Array2::<f64>::read_npy(File::open(path)?) {
            Ok(w) => w.mapv(|v| v as f32),
            Err(_) => Array2::<f32>::read_npy(File::open(path)?)?,
        };
        Ok(Self { weights })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.weights.dim()
    }

    /// Repeat into `[batch, horizon, H, W]`
    pub fn tile(&self, batch: usize, horizon: usize) -> Array4<f32> {
        let (h, w) = self.weights.dim();
        let mut tiled = Array4::zeros((batch, horizon, h, w));
        for mut per_anchor in tiled.outer_iter_mut() {
            for mut step in per_anchor.outer_iter_mut() {
                step.assign(&self.weights);
            }
        }
        tiled
    }
}
