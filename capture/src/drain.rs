//! Buffer drain – persists every buffered frame, newest first.
//!
//! Writing the frame closest to the event first means an interrupted drain
//! still leaves the most relevant frames on disk.

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::buffer::RollingBuffer;
use crate::error::CaptureError;
use crate::status::SystemStatus;
use crate::store::FrameSink;

/// Result of one drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Batch identity: when the drain started.
    pub started: DateTime<Local>,
    pub persisted: usize,
    pub failed: usize,
}

/// Persist the buffer's contents into a new batch.
///
/// Frame `i` of the batch is the `i`-th most recent capture.  A frame that
/// fails to write is logged and skipped, leaving a gap at its index; the
/// persisted counter only moves for frames that made it to the sink.  If
/// the batch itself cannot be created nothing is written and the error is
/// returned.
pub fn drain_buffer<K: FrameSink>(
    buffer: &RollingBuffer<Vec<u8>>,
    sink: &K,
    status: &SystemStatus,
    started: DateTime<Local>,
) -> Result<DrainReport, CaptureError> {
    let batch = sink.create_batch(started)?;

    let mut report = DrainReport {
        started,
        persisted: 0,
        failed: 0,
    };

    for (index, blob) in buffer.iter_newest_first().enumerate() {
        match sink.write_frame(&batch, index, blob) {
            Ok(()) => {
                let total = status.record_persisted();
                report.persisted += 1;
                debug!("Wrote frame {index} ({total} persisted in total)");
            }
            Err(e) => {
                warn!("Skipping frame {index}: {e}");
                report.failed += 1;
            }
        }
    }

    if let Err(e) = sink.finish_batch(&batch, &report) {
        warn!("Batch summary not written: {e}");
    }

    info!(
        "Drain complete: {} frames persisted, {} failed",
        report.persisted, report.failed
    );
    Ok(report)
}
