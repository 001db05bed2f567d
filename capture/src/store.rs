//! Persistence of drained frames.
//!
//! Each drain gets its own batch directory under `IMG_DIR`, named after the
//! moment the drain started, e.g. `images/2024-03-01T14-05-09-123456/`.
//! Frames inside are `img_0.png`, `img_1.png`, … in the order they were
//! written (newest capture first), followed by a `batch.json` summary.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::debug;

use crate::drain::DrainReport;
use crate::error::CaptureError;

pub trait FrameSink: Send {
    type Batch;

    fn create_batch(&self, started: DateTime<Local>) -> Result<Self::Batch, CaptureError>;

    fn write_frame(
        &self,
        batch: &Self::Batch,
        index: usize,
        blob: &[u8],
    ) -> Result<(), CaptureError>;

    /// Called once all frames of a batch have been attempted.
    fn finish_batch(&self, _batch: &Self::Batch, _report: &DrainReport) -> Result<(), CaptureError> {
        Ok(())
    }
}

/// Batch directory name for a drain that started at `started`.
pub fn batch_dir_name(started: &DateTime<Local>) -> String {
    started.format("%Y-%m-%dT%H-%M-%S-%6f").to_string()
}

pub fn frame_file_name(index: usize, extension: &str) -> String {
    format!("img_{index}.{extension}")
}

/// Summary written next to the frames of each batch.
#[derive(Debug, Serialize)]
struct BatchManifest<'a> {
    started: DateTime<Local>,
    frames_persisted: usize,
    frames_failed: usize,
    /// Index 0 is the frame captured last before the event.
    order: &'a str,
    image_type: &'a str,
}

#[derive(Debug, Clone)]
pub struct DiskSink {
    root: PathBuf,
    extension: String,
}

impl DiskSink {
    pub fn new(root: &Path, extension: &str) -> Self {
        DiskSink {
            root: root.to_path_buf(),
            extension: extension.to_string(),
        }
    }
}

impl FrameSink for DiskSink {
    type Batch = PathBuf;

    fn create_batch(&self, started: DateTime<Local>) -> Result<PathBuf, CaptureError> {
        let dir = self.root.join(batch_dir_name(&started));
        std::fs::create_dir_all(&dir).map_err(|source| CaptureError::Destination {
            path: dir.clone(),
            source,
        })?;
        debug!("Created batch directory {}", dir.display());
        Ok(dir)
    }

    fn write_frame(&self, batch: &PathBuf, index: usize, blob: &[u8]) -> Result<(), CaptureError> {
        let path = batch.join(frame_file_name(index, &self.extension));
        std::fs::write(&path, blob).map_err(|source| CaptureError::Write { index, source })
    }

    fn finish_batch(&self, batch: &PathBuf, report: &DrainReport) -> Result<(), CaptureError> {
        let manifest = BatchManifest {
            started: report.started,
            frames_persisted: report.persisted,
            frames_failed: report.failed,
            order: "newest-first",
            image_type: &self.extension,
        };
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| CaptureError::Manifest(e.to_string()))?;
        std::fs::write(batch.join("batch.json"), json)
            .map_err(|e| CaptureError::Manifest(e.to_string()))
    }
}
