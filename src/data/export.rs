//! Writing materialized batches to disk for an external trainer
//!
//! Each batch becomes one `.npy` file per requested slot,
//! `batch_0003_closeness.npy` and so on, and the run is described by a
//! `manifest.json` listing anchors, files and shapes.

use ndarray_npy::WriteNpyExt;
use serde::Serialize;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::info;

use super::pipeline::MaterializedBatch;
use super::tensors::TensorSlot;
use super::timestamp::format_key;
use crate::error::TecResult;

pub const MANIFEST_FILE: &str = "manifest.json";

/// One exported slot of one batch
#[derive(Debug, Clone, Serialize)]
pub struct SlotFile {
    pub slot: TensorSlot,
    pub file: String,
    pub shape: Vec<usize>,
}

/// Manifest entry for one batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchEntry {
    pub index: usize,
    pub anchors: Vec<String>,
    pub files: Vec<SlotFile>,
}

/// Contents of `manifest.json`
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub slots: Vec<TensorSlot>,
    pub batches: Vec<BatchEntry>,
}

/// Streams batches into an output directory
#[derive(Debug)]
pub struct BatchExporter {
    out_dir: PathBuf,
    manifest: Manifest,
}

impl BatchExporter {
    pub fn create<P: AsRef<Path>>(out_dir: P, slots: Vec<TensorSlot>) -> TecResult<Self> {
        let out_dir = out_dir.as_ref().to_path_buf();
        fs::create_dir_all(&out_dir)?;
        Ok(Self {
            out_dir,
            manifest: Manifest {
                slots,
                batches: Vec::new(),
            },
        })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Write every requested slot of `batch`
    ///
    /// Fails with `MissingSlot` before writing anything if a slot is absent.
    pub fn write(&mut self, batch: &MaterializedBatch) -> TecResult<()> {
        let views = batch.tensors.feed(&self.manifest.slots)?;
        let mut files = Vec::with_capacity(views.len());
        for (slot, view) in views {
            let file = format!("batch_{:04}_{}.npy", batch.batch.index, slot.name());
            view.write_npy(BufWriter::new(File::create(self.out_dir.join(&file))?))?;
            files.push(SlotFile {
                slot,
                file,
                shape: view.shape().to_vec(),
            });
        }
        self.manifest.batches.push(BatchEntry {
            index: batch.batch.index,
            anchors: batch.batch.anchors.iter().map(format_key).collect(),
            files,
        });
        Ok(())
    }

    /// Write the manifest and return its path
    pub fn finish(self) -> TecResult<PathBuf> {
        let path = self.out_dir.join(MANIFEST_FILE);
        let file = File::create(&path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.manifest)?;
        info!(
            "Exported {} batches to {:?}",
            self.manifest.batches.len(),
            self.out_dir
        );
        Ok(path)
    }
}
