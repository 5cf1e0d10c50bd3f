//! Per-anchor prediction artifacts for offline validation
//!
//! Files live in `<run_dir>/predicted_tec/` and are keyed by the anchor's
//! `YYYYMMDD.HHMM` string, e.g. `20150305.1200_pred.npy`.

use chrono::NaiveDateTime;
use ndarray::{Array1, Array4, ArrayBase, ArrayD, Axis, Data, Dimension};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::tensors::BatchedTensors;
use super::timestamp::{format_key, is_aligned, ticks_between};
use super::window::ChannelKind;
use crate::error::{TecError, TecResult};

/// Directory name under the run directory
pub const PREDICTION_DIR: &str = "predicted_tec";

/// Kinds of per-anchor artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Prediction,
    Truth,
    Channel(ChannelKind),
}

impl ArtifactKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Prediction => "pred",
            Self::Truth => "true",
            Self::Channel(ChannelKind::Closeness) => "close",
            Self::Channel(ChannelKind::Period) => "period",
            Self::Channel(ChannelKind::Trend) => "trend",
        }
    }
}

/// Reader/writer for prediction artifacts of one run
#[derive(Debug, Clone)]
pub struct PredictionStore {
    dir: PathBuf,
    resolution_minutes: u32,
}

impl PredictionStore {
    pub fn new(run_dir: &Path, resolution_minutes: u32) -> Self {
        Self {
            dir: run_dir.join(PREDICTION_DIR),
            resolution_minutes,
        }
    }

    /// Like `new`, creating the directory
    pub fn create(run_dir: &Path, resolution_minutes: u32) -> TecResult<Self> {
        let store = Self::new(run_dir, resolution_minutes);
        fs::create_dir_all(&store.dir)?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, anchor: &NaiveDateTime, kind: ArtifactKind) -> PathBuf {
        self.dir
            .join(format!("{}_{}.npy", format_key(anchor), kind.suffix()))
    }

    pub fn write<S, D>(&self, anchor: &NaiveDateTime, kind: ArtifactKind, array: &ArrayBase<S, D>) -> TecResult<PathBuf>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        let path = self.path(anchor, kind);
        array.write_npy(BufWriter::new(File::create(&path)?))?;
        Ok(path)
    }

    /// Write prediction, ground truth and the enabled channel inputs of every anchor
    ///
    /// `prediction` must have the same shape as the batch's output tensor.
    pub fn write_batch(&self, tensors: &BatchedTensors, prediction: &Array4<f32>) -> TecResult<usize> {
        if prediction.dim() != tensors.output.dim() {
            return Err(TecError::TensorShape {
                slot: "prediction",
                expected: tensors.output.shape().to_vec(),
                actual: prediction.shape().to_vec(),
            });
        }

        let mut written = 0;
        for (j, anchor) in tensors.anchors.iter().enumerate() {
            self.write(anchor, ArtifactKind::Prediction, &prediction.index_axis(Axis(0), j))?;
            self.write(anchor, ArtifactKind::Truth, &tensors.output.index_axis(Axis(0), j))?;
            written += 2;
            for kind in ChannelKind::ALL {
                if let Some(channel) = tensors.channel(kind) {
                    self.write(anchor, ArtifactKind::Channel(kind), &channel.index_axis(Axis(0), j))?;
                    written += 1;
                }
            }
        }
        debug!("Wrote {} prediction artifacts to {:?}", written, self.dir);
        Ok(written)
    }

    /// Per-batch losses of an evaluation run
    pub fn write_losses(&self, losses: &[f32]) -> TecResult<PathBuf> {
        let path = self.dir.join("prediction_loss.npy");
        Array1::from(losses.to_vec()).write_npy(BufWriter::new(File::create(&path)?))?;
        info!("Saved {} loss values to {:?}", losses.len(), path);
        Ok(path)
    }

    pub fn read(&self, anchor: &NaiveDateTime, kind: ArtifactKind) -> TecResult<ArrayD<f32>> {
        let path = self.path(anchor, kind);
        Ok(ArrayD::<f32>::read_npy(File::open(&path)?)?)
    }

    /// Artifacts of `kind` for every grid tick in `[start, end]` that has one
    pub fn read_range(
        &self,
        kind: ArtifactKind,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> TecResult<BTreeMap<NaiveDateTime, ArrayD<f32>>> {
        for bound in [&start, &end] {
            if !is_aligned(bound, self.resolution_minutes) {
                return Err(TecError::Config(format!(
                    "{} is not aligned to the {}-minute grid",
                    format_key(bound),
                    self.resolution_minutes
                )));
            }
        }
        let mut found = BTreeMap::new();
        for ts in ticks_between(start, end, self.resolution_minutes, 1) {
            if self.path(&ts, kind).is_file() {
                found.insert(ts, self.read(&ts, kind)?);
            }
        }
        Ok(found)
    }
}
