//! Capture loop – fills the rolling buffer and drains it on events.
//!
//! The loop owns the camera and the buffer outright.  Each iteration
//! looks at the shared status and is in exactly one phase:
//!
//! * `Acquire`    – camera running, no event: read, encode, push.
//! * `Drain`      – camera running, event pending: persist the buffer,
//!                  clear it, clear the event.
//! * `Terminated` – camera stopped: release the camera and return.
//!
//! Acquiring and draining never overlap since both run on this thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::buffer::RollingBuffer;
use crate::camera::CameraGuard;
use crate::drain;
use crate::encode::FrameEncoder;
use crate::error::CaptureError;
use crate::status::SystemStatus;
use crate::store::FrameSink;

/// Pause after a failed read so a flapping camera doesn't spin the CPU.
const READ_RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Log every this-many consecutive read failures.
const FAILURE_LOG_INTERVAL: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Acquire,
    Drain,
    Terminated,
}

impl Phase {
    fn observe(status: &SystemStatus) -> Self {
        if !status.is_camera_running() {
            Phase::Terminated
        } else if status.is_event_pending() {
            Phase::Drain
        } else {
            Phase::Acquire
        }
    }
}

/// Why the capture loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Shutdown was requested.
    Terminated,
    /// The camera or the loop body failed.
    Faulted,
}

pub struct CaptureLoop<E, K> {
    camera: CameraGuard,
    encoder: E,
    sink: K,
    buffer: RollingBuffer<Vec<u8>>,
    status: Arc<SystemStatus>,
    frame_interval: Option<Duration>,
    consecutive_failures: u64,
}

impl<E: FrameEncoder, K: FrameSink> CaptureLoop<E, K> {
    pub fn new(
        camera: CameraGuard,
        encoder: E,
        sink: K,
        capacity: usize,
        status: Arc<SystemStatus>,
    ) -> Self {
        CaptureLoop {
            camera,
            encoder,
            sink,
            buffer: RollingBuffer::new(capacity),
            status,
            frame_interval: None,
            consecutive_failures: 0,
        }
    }

    /// Pace acquisition to at most one frame per `interval`.
    pub fn with_frame_interval(mut self, interval: Option<Duration>) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Run until shutdown or a fatal fault.  The camera is released and the
    /// status marked stopped on every path out.
    pub fn run(mut self) -> LoopExit {
        info!(
            "Capture loop started (buffer capacity {})",
            self.buffer.capacity()
        );

        let outcome = catch_unwind(AssertUnwindSafe(|| self.run_phases()));
        let exit = match outcome {
            Ok(Ok(())) => {
                info!("Received signal to stop capturing");
                LoopExit::Terminated
            }
            Ok(Err(e)) => {
                error!("Capture loop stopped: {e}");
                LoopExit::Faulted
            }
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                error!("Capture loop panicked: {msg}");
                LoopExit::Faulted
            }
        };

        let CaptureLoop { camera, status, .. } = self;
        camera.release();
        status.mark_capture_stopped();
        exit
    }

    fn run_phases(&mut self) -> Result<(), CaptureError> {
        loop {
            match Phase::observe(&self.status) {
                Phase::Terminated => return Ok(()),
                Phase::Drain => self.drain(),
                Phase::Acquire => self.acquire()?,
            }
        }
    }

    fn acquire(&mut self) -> Result<(), CaptureError> {
        let tick = Instant::now();

        let frame = match self.camera.read_frame() {
            Ok(frame) => frame,
            Err(e) if e.is_transient() => {
                self.consecutive_failures += 1;
                if self.consecutive_failures % FAILURE_LOG_INTERVAL == 1 {
                    warn!(
                        "Frame read failed ({} in a row): {e}",
                        self.consecutive_failures
                    );
                }
                std::thread::sleep(READ_RETRY_BACKOFF);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.consecutive_failures = 0;

        match self.encoder.encode(&frame) {
            Ok(blob) => {
                self.buffer.push(blob);
            }
            Err(e) => warn!("Dropping frame: {e}"),
        }

        if let Some(interval) = self.frame_interval {
            let elapsed = tick.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        Ok(())
    }

    fn drain(&mut self) {
        if self.buffer.is_empty() {
            warn!("Event pending with nothing buffered – writing an empty batch");
        } else {
            info!("Event pending – draining {} buffered frames", self.buffer.len());
        }

        match drain::drain_buffer(&self.buffer, &self.sink, &self.status, Local::now()) {
            Ok(report) => {
                debug!("Batch {} done", report.started.to_rfc3339());
                self.buffer.clear();
            }
            // Nothing was written, so the frames stay for the next event.
            Err(e) => error!("Drain aborted: {e}"),
        }

        self.status.clear_event();
    }
}
