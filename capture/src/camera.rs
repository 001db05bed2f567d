//! Frame sources – the camera side of the capture loop.
//!
//! A real camera is read through `ffmpeg` (V4L2 → raw `rgb24` on stdout),
//! the same way the node shells out to external recorders elsewhere.  A
//! synthetic test pattern stands in when no device is configured.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;

use tracing::{debug, info, warn};

use burstcam_common::config::Config;

use crate::error::CaptureError;

/// One uncompressed frame, packed RGB8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RawFrame {
    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }
}

/// Something frames can be read from.
///
/// `release` is called exactly once, by [`CameraGuard`], and nothing is
/// read afterwards.
pub trait FrameSource: Send {
    fn describe(&self) -> String;
    fn read_frame(&mut self) -> Result<RawFrame, CaptureError>;
    fn release(&mut self) -> Result<(), CaptureError>;
}

/// Exclusive owner of an open frame source.
///
/// The source is released when the guard is consumed with
/// [`release`](Self::release) or, failing that, when it is dropped – so a
/// panic in the capture loop still closes the camera.
pub struct CameraGuard {
    source: Option<Box<dyn FrameSource>>,
}

impl CameraGuard {
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        CameraGuard {
            source: Some(source),
        }
    }

    pub fn read_frame(&mut self) -> Result<RawFrame, CaptureError> {
        match self.source.as_mut() {
            Some(source) => source.read_frame(),
            None => Err(CaptureError::SourceLost("camera already released".into())),
        }
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(mut source) = self.source.take() {
            let name = source.describe();
            match source.release() {
                Ok(()) => info!("Released camera {name}"),
                Err(e) => warn!("Releasing camera {name} failed: {e}"),
            }
        }
    }
}

impl Drop for CameraGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Open the source named by `CAMERA_DEVICE`.
pub fn open_source(config: &Config) -> Result<Box<dyn FrameSource>, CaptureError> {
    if config.uses_synthetic_camera() {
        info!(
            "Using synthetic camera ({}x{})",
            config.frame_width, config.frame_height
        );
        Ok(Box::new(SyntheticSource::new(
            config.frame_width,
            config.frame_height,
        )))
    } else {
        Ok(Box::new(FfmpegSource::open(
            &config.camera_device,
            config.frame_width,
            config.frame_height,
            config.fps,
        )?))
    }
}

// ── synthetic test pattern ──────────────────────────────────────────────

/// Moving gradient; the first eight bytes carry the frame number.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    frame_number: u64,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        SyntheticSource {
            width: width.max(3),
            height: height.max(1),
            frame_number: 0,
        }
    }

    /// Decode the frame number stamped into a synthetic frame.
    #[allow(dead_code)]
    pub fn frame_number_of(pixels: &[u8]) -> Option<u64> {
        let stamp: [u8; 8] = pixels.get(..8)?.try_into().ok()?;
        Some(u64::from_le_bytes(stamp))
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("synthetic {}x{}", self.width, self.height)
    }

    fn read_frame(&mut self) -> Result<RawFrame, CaptureError> {
        let n = self.frame_number;
        self.frame_number += 1;

        let shift = (n % 256) as u8;
        let mut pixels = Vec::with_capacity(RawFrame::expected_len(self.width, self.height));
        for y in 0..self.height {
            for x in 0..self.width {
                pixels.push((x as u8).wrapping_add(shift));
                pixels.push((y as u8).wrapping_add(shift));
                pixels.push(shift);
            }
        }
        pixels[..8].copy_from_slice(&n.to_le_bytes());

        Ok(RawFrame {
            width: self.width,
            height: self.height,
            pixels,
        })
    }

    fn release(&mut self) -> Result<(), CaptureError> {
        debug!("Synthetic camera stopped after {} frames", self.frame_number);
        Ok(())
    }
}

// ── V4L2 via ffmpeg ─────────────────────────────────────────────────────

pub struct FfmpegSource {
    device: String,
    width: u32,
    height: u32,
    child: Child,
    stdout: ChildStdout,
}

impl FfmpegSource {
    pub fn open(device: &str, width: u32, height: u32, fps: u32) -> Result<Self, CaptureError> {
        let open_err = |reason: String| CaptureError::Open {
            device: device.to_string(),
            reason,
        };

        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"]);
        cmd.args(["-f", "v4l2"]);
        if fps > 0 {
            cmd.args(["-framerate", &fps.to_string()]);
        }
        cmd.args(["-video_size", &format!("{width}x{height}")]);
        cmd.args(["-i", device]);
        cmd.args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!("Spawning: ffmpeg -f v4l2 -video_size {width}x{height} -i {device} → rgb24");

        let mut child = cmd
            .spawn()
            .map_err(|e| open_err(format!("failed to spawn ffmpeg: {e}")))?;

        // Drain stderr in a background thread so device errors reach the log
        // and the pipe never fills up and stalls ffmpeg.
        if let Some(stderr) = child.stderr.take() {
            std::thread::Builder::new()
                .name("ffmpeg-stderr".into())
                .spawn(move || {
                    let reader = BufReader::new(stderr);
                    for line in reader.lines() {
                        match line {
                            Ok(l) if l.is_empty() => {}
                            Ok(l) => warn!("[ffmpeg] {l}"),
                            Err(_) => break,
                        }
                    }
                    debug!("ffmpeg stderr stream ended");
                })
                .ok();
        }

        // Give ffmpeg a moment to fail on a bad device before declaring success.
        std::thread::sleep(Duration::from_millis(500));
        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(open_err(format!(
                    "ffmpeg exited immediately with {status} (check CAMERA_DEVICE)"
                )));
            }
            Ok(None) => {}
            Err(e) => warn!("Cannot check ffmpeg status: {e}"),
        }

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(open_err("ffmpeg stdout not captured".into()));
        };

        info!("ffmpeg started (pid={}, device={device})", child.id());

        Ok(FfmpegSource {
            device: device.to_string(),
            width,
            height,
            child,
            stdout,
        })
    }
}

impl FrameSource for FfmpegSource {
    fn describe(&self) -> String {
        format!("{} ({}x{})", self.device, self.width, self.height)
    }

    fn read_frame(&mut self) -> Result<RawFrame, CaptureError> {
        let mut pixels = vec![0u8; RawFrame::expected_len(self.width, self.height)];
        match self.stdout.read_exact(&mut pixels) {
            Ok(()) => Ok(RawFrame {
                width: self.width,
                height: self.height,
                pixels,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                Err(CaptureError::Frame(e.to_string()))
            }
            Err(e) => Err(CaptureError::SourceLost(format!("ffmpeg stream ended: {e}"))),
        }
    }

    fn release(&mut self) -> Result<(), CaptureError> {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!("ffmpeg already exited with {status}");
            return Ok(());
        }
        self.child
            .kill()
            .map_err(|e| CaptureError::Release(format!("cannot stop ffmpeg: {e}")))?;
        self.child
            .wait()
            .map_err(|e| CaptureError::Release(format!("cannot reap ffmpeg: {e}")))?;
        Ok(())
    }
}
