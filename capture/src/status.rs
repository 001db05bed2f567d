//! Process-wide node status shared by the capture loop and the command
//! server.
//!
//! One `SystemStatus` is created in `main` and handed to both actors as an
//! `Arc`.  Every field is individually atomic; no transition needs more
//! than the `event_pending` + `camera_running` pair, and the capture loop
//! polls often enough that seeing the two writes land separately is fine.
//! The pending flag and the drain generation live in one watched value so
//! a clear can never swallow an event raised against the new generation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// How an `EVENT` wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The capture loop drained the buffer and cleared the flag.
    Drained,
    /// Shutdown cleared the flag before a drain finished.
    ShutDown,
    /// The capture loop exited with the event still pending.
    CaptureStopped,
    /// The bounded wait expired.
    TimedOut,
}

/// Pending flag plus the number of drains finished so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct EventState {
    pending: bool,
    drains: u64,
}

pub struct SystemStatus {
    camera_running: AtomicBool,
    /// Watched so the command server can await the clear instead of spinning.
    event: watch::Sender<EventState>,
    images_persisted: AtomicU64,
    capture_stopped: AtomicBool,
    shutdown: CancellationToken,
}

impl SystemStatus {
    pub fn new() -> Self {
        let (event, _) = watch::channel(EventState::default());
        SystemStatus {
            camera_running: AtomicBool::new(true),
            event,
            images_persisted: AtomicU64::new(0),
            capture_stopped: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn is_camera_running(&self) -> bool {
        self.camera_running.load(Ordering::Acquire)
    }

    pub fn is_event_pending(&self) -> bool {
        self.event.borrow().pending
    }

    pub fn images_persisted(&self) -> u64 {
        self.images_persisted.load(Ordering::Acquire)
    }

    pub fn is_capture_stopped(&self) -> bool {
        self.capture_stopped.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled once shutdown has been requested.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Mark an event pending and keep the camera running.
    ///
    /// Returns the drain generation observed while raising; pass it to
    /// [`wait_event_cleared`](Self::wait_event_cleared).  A drain already
    /// in flight completes the new event too.
    pub fn raise_event(&self) -> u64 {
        self.camera_running.store(true, Ordering::Release);
        let mut generation = 0;
        self.event.send_modify(|state| {
            generation = state.drains;
            state.pending = true;
        });
        // Nobody is left to clear the flag if the loop already exited.
        if self.is_capture_stopped() {
            self.drop_pending_event();
        }
        generation
    }

    /// Called by the capture loop once a drain has finished (or failed).
    pub fn clear_event(&self) {
        self.event.send_modify(|state| {
            state.drains += 1;
            state.pending = false;
        });
    }

    /// Count one persisted frame.  Returns the new total.
    pub fn record_persisted(&self) -> u64 {
        self.images_persisted.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Stop the camera, drop any pending event and release everything
    /// waiting on shutdown.
    pub fn request_shutdown(&self) {
        self.camera_running.store(false, Ordering::Release);
        self.drop_pending_event();
        self.shutdown.cancel();
    }

    /// Called by the capture loop on every exit path.
    pub fn mark_capture_stopped(&self) {
        self.capture_stopped.store(true, Ordering::SeqCst);
        self.drop_pending_event();
    }

    /// Clear the flag without counting a drain.
    fn drop_pending_event(&self) {
        self.event.send_if_modified(|state| std::mem::take(&mut state.pending));
    }

    /// Wait until `event_pending` clears, bounded by `timeout` when set.
    pub async fn wait_event_cleared(
        &self,
        raised_at: u64,
        timeout: Option<Duration>,
    ) -> EventOutcome {
        let mut rx = self.event.subscribe();
        let cleared = async move {
            loop {
                let state = *rx.borrow_and_update();
                if !state.pending {
                    return state;
                }
                // The sender lives in `self`, so this only errors on teardown.
                if rx.changed().await.is_err() {
                    return *rx.borrow();
                }
            }
        };
        let state = match timeout {
            Some(limit) => match tokio::time::timeout(limit, cleared).await {
                Ok(state) => state,
                Err(_) => return EventOutcome::TimedOut,
            },
            None => cleared.await,
        };

        if state.drains > raised_at {
            EventOutcome::Drained
        } else if self.is_shutting_down() {
            EventOutcome::ShutDown
        } else {
            EventOutcome::CaptureStopped
        }
    }
}

impl Default for SystemStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SystemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemStatus")
            .field("camera_running", &self.is_camera_running())
            .field("event_pending", &self.is_event_pending())
            .field("images_persisted", &self.images_persisted())
            .finish()
    }
}
