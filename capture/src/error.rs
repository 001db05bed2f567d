//! Error types for the capture side of the node.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("cannot open camera {device}: {reason}")]
    Open { device: String, reason: String },

    #[error("frame read failed: {0}")]
    Frame(String),

    #[error("camera stream lost: {0}")]
    SourceLost(String),

    #[error("frame encode failed: {0}")]
    Encode(String),

    #[error("cannot create batch destination {}: {source}", path.display())]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write frame {index}: {source}")]
    Write {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write batch manifest: {0}")]
    Manifest(String),

    #[error("camera release failed: {0}")]
    Release(String),
}

impl CaptureError {
    /// Single-frame faults the capture loop skips over.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Frame(_) | Self::Encode(_) | Self::Write { .. } | Self::Manifest(_)
        )
    }
}
