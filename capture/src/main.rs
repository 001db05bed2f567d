//! Burstcam capture node – keeps a rolling buffer of camera frames and
//! writes it to disk when the controller reports an event.
//!
//! This binary:
//! 1. Reads configuration from `burstcam.conf`
//! 2. Binds the command socket and opens the camera
//! 3. Runs the capture loop on its own thread
//! 4. Serves `UPTIME` / `EVENT` / `SHUTDOWN` until told to stop

mod buffer;
mod camera;
mod capture;
mod drain;
mod encode;
mod error;
mod logging;
mod server;
mod status;
mod store;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::camera::CameraGuard;
use crate::capture::CaptureLoop;
use crate::encode::ImageEncoder;
use crate::server::CommandServer;
use crate::status::SystemStatus;
use crate::store::DiskSink;

#[tokio::main]
async fn main() -> Result<()> {
    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| burstcam_common::config::Config::default_path().to_string());
    let config = burstcam_common::config::load(&PathBuf::from(&config_path))
        .context("Config load failed")?;

    let _log_guard = logging::init(config.log_dir.as_deref())?;
    info!("Loaded config from {config_path}");
    info!(
        "Burstcam node starting (listen={}, buffer={} frames, camera={})",
        config.listen_addr, config.roll_buf_size, config.camera_device
    );

    std::fs::create_dir_all(&config.img_dir)
        .with_context(|| format!("Cannot create image directory {}", config.img_dir.display()))?;

    let status = Arc::new(SystemStatus::new());

    // ── command socket ───────────────────────────────────────────────
    let server = CommandServer::bind(&config.listen_addr, config.listen_backlog, status.clone())
        .await?
        .with_event_delay(config.event_delay)
        .with_event_timeout(config.event_timeout);

    // ── camera + capture loop ────────────────────────────────────────
    let encoder = ImageEncoder::from_extension(&config.img_type)?;
    // Without a camera there is nothing to serve.
    let source = camera::open_source(&config).context("Cannot open camera")?;
    let sink = DiskSink::new(&config.img_dir, &config.img_type);
    let capture_loop = CaptureLoop::new(
        CameraGuard::new(source),
        encoder,
        sink,
        config.roll_buf_size,
        status.clone(),
    )
    .with_frame_interval(config.frame_interval());

    let capture_thread = std::thread::Builder::new()
        .name("capture".into())
        .spawn(move || capture_loop.run())
        .context("Cannot spawn capture thread")?;

    // ── ctrl-c ───────────────────────────────────────────────────────
    let signal_status = status.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        signal_status.request_shutdown();
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── serve until SHUTDOWN ─────────────────────────────────────────
    if let Err(e) = server.run().await {
        error!("Command server error: {e:#}");
    }

    // Make sure the capture loop stops even if the server ended on its own.
    status.request_shutdown();
    match tokio::task::spawn_blocking(move || capture_thread.join()).await {
        Ok(Ok(exit)) => info!("Capture loop finished ({exit:?})"),
        _ => error!("Capture thread did not exit cleanly"),
    }

    info!(
        "Burstcam node stopped ({} images persisted)",
        status.images_persisted()
    );
    Ok(())
}
