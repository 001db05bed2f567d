//! In-memory collaborators shared by the unit tests.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

use crate::camera::{FrameSource, RawFrame};
use crate::encode::FrameEncoder;
use crate::error::CaptureError;
use crate::store::FrameSink;

type ExhaustedHook = Box<dyn FnMut() -> CaptureError + Send>;

/// Hands out a fixed list of frames, then calls `on_exhausted` on every
/// further read.
pub struct ScriptedSource {
    frames: VecDeque<Vec<u8>>,
    delivered: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
    on_exhausted: Option<ExhaustedHook>,
}

impl ScriptedSource {
    pub fn new(frames: Vec<&str>) -> Self {
        ScriptedSource {
            frames: frames.into_iter().map(|f| f.as_bytes().to_vec()).collect(),
            delivered: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
            on_exhausted: None,
        }
    }

    pub fn on_exhausted(mut self, hook: impl FnMut() -> CaptureError + Send + 'static) -> Self {
        self.on_exhausted = Some(Box::new(hook));
        self
    }

    pub fn delivered_counter(&self) -> Arc<AtomicUsize> {
        self.delivered.clone()
    }

    pub fn release_counter(&self) -> Arc<AtomicUsize> {
        self.released.clone()
    }
}

impl FrameSource for ScriptedSource {
    fn describe(&self) -> String {
        "scripted".into()
    }

    fn read_frame(&mut self) -> Result<RawFrame, CaptureError> {
        match self.frames.pop_front() {
            Some(pixels) => {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                Ok(RawFrame {
                    width: 1,
                    height: 1,
                    pixels,
                })
            }
            None => match self.on_exhausted.as_mut() {
                Some(hook) => Err(hook()),
                None => Err(CaptureError::Frame("script exhausted".into())),
            },
        }
    }

    fn release(&mut self) -> Result<(), CaptureError> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Stores the raw pixels unchanged.
pub struct PassthroughEncoder;

impl FrameEncoder for PassthroughEncoder {
    fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>, CaptureError> {
        Ok(frame.pixels.clone())
    }
}

/// Records every batch and frame written to it.
#[derive(Clone, Default)]
pub struct MemorySink {
    batches: Arc<Mutex<Vec<Vec<(usize, Vec<u8>)>>>>,
    created: Arc<Mutex<Vec<Instant>>>,
    fail_index: Option<usize>,
    fail_batches: bool,
    write_delay: Duration,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_index(mut self, index: usize) -> Self {
        self.fail_index = Some(index);
        self
    }

    pub fn failing_batches(mut self) -> Self {
        self.fail_batches = true;
        self
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    /// When batch `batch` was created.
    pub fn created_at(&self, batch: usize) -> Instant {
        self.created.lock().unwrap()[batch]
    }

    pub fn frames(&self, batch: usize) -> Vec<(usize, Vec<u8>)> {
        self.batches.lock().unwrap()[batch].clone()
    }
}

impl FrameSink for MemorySink {
    type Batch = usize;

    fn create_batch(&self, _started: DateTime<Local>) -> Result<usize, CaptureError> {
        if self.fail_batches {
            return Err(CaptureError::Destination {
                path: PathBuf::from("memory"),
                source: std::io::Error::other("batch creation disabled"),
            });
        }
        let mut batches = self.batches.lock().unwrap();
        self.created.lock().unwrap().push(Instant::now());
        batches.push(Vec::new());
        Ok(batches.len() - 1)
    }

    fn write_frame(&self, batch: &usize, index: usize, blob: &[u8]) -> Result<(), CaptureError> {
        if !self.write_delay.is_zero() {
            std::thread::sleep(self.write_delay);
        }
        if self.fail_index == Some(index) {
            return Err(CaptureError::Write {
                index,
                source: std::io::Error::other("injected write failure"),
            });
        }
        self.batches.lock().unwrap()[*batch].push((index, blob.to_vec()));
        Ok(())
    }
}
