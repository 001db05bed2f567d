//! Command server – one connection, one command, one reply.
//!
//! Connections are handled strictly one after another: the listener is not
//! polled again until the current reply has been sent.  An `EVENT` therefore
//! holds every other client at the transport layer until its drain is done.
//!
//! Commands:
//!   UPTIME    → seconds since the server started
//!   EVENT     → settle, mark the event pending, reply once the buffer is on disk
//!   SHUTDOWN  → stop the camera and this server, reply with the image total

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info, warn};

use burstcam_common::protocol::{
    self, event_failed_response, shutdown_response, uptime_response, Command, EVENT_RESP,
    MAX_REQUEST_LEN, UNKNOWN_RESP,
};

use crate::status::{EventOutcome, SystemStatus};

/// How long a client may take to send its command after connecting.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(30);

const ACCEPT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub struct CommandServer {
    listener: TcpListener,
    status: Arc<SystemStatus>,
    start_time: Instant,
    event_delay: Duration,
    event_timeout: Option<Duration>,
}

impl CommandServer {
    /// Bind the command socket with a short accept backlog.
    pub async fn bind(listen_addr: &str, backlog: u32, status: Arc<SystemStatus>) -> Result<Self> {
        let addr = tokio::net::lookup_host(listen_addr)
            .await
            .with_context(|| format!("Cannot resolve {listen_addr}"))?
            .next()
            .ok_or_else(|| anyhow!("{listen_addr} did not resolve to an address"))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("Cannot create command socket")?;
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .with_context(|| format!("Cannot bind command socket to {addr}"))?;
        let listener = socket.listen(backlog).context("Cannot listen on command socket")?;

        Ok(CommandServer {
            listener,
            status,
            start_time: Instant::now(),
            event_delay: Duration::ZERO,
            event_timeout: None,
        })
    }

    /// Pause between accepting `EVENT` and marking it pending.
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    /// Bound on the wait for a drain.  `None` waits forever.
    pub fn with_event_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.event_timeout = timeout;
        self
    }

    #[cfg(test)]
    fn with_start_time(mut self, start_time: Instant) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve commands until `SHUTDOWN` or until shutdown is requested
    /// elsewhere.  The listener is closed on return.
    pub async fn run(self) -> Result<()> {
        let shutdown = self.status.shutdown_token();
        info!("Command server listening on {}", self.local_addr()?);

        loop {
            debug!("Waiting for connection ({:?})", self.status);

            let accepted = tokio::select! {
                res = self.listener.accept() => res,
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested – closing command listener");
                    break;
                }
            };

            let (mut stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Accept failed: {e}");
                    tokio::time::sleep(ACCEPT_RETRY_BACKOFF).await;
                    continue;
                }
            };
            info!("Got connection from {peer}");

            let flow = match self.handle(&mut stream).await {
                Ok(flow) => flow,
                Err(e) => {
                    warn!("Connection from {peer} abandoned: {e:#}");
                    Flow::Continue
                }
            };
            drop(stream);

            if flow == Flow::Stop {
                break;
            }
        }

        info!("Command server stopped");
        Ok(())
    }

    async fn handle(&self, stream: &mut TcpStream) -> Result<Flow> {
        let mut buf = [0u8; MAX_REQUEST_LEN];
        let n = tokio::time::timeout(REQUEST_READ_TIMEOUT, stream.read(&mut buf))
            .await
            .context("Timed out waiting for a command")?
            .context("Cannot read command")?;

        let command = match protocol::parse_request(&buf[..n]) {
            Ok(command) => command,
            Err(e) => {
                warn!("Ignoring request: {e}");
                write_reply(stream, UNKNOWN_RESP).await?;
                return Ok(Flow::Continue);
            }
        };
        info!("Command received: {command}");

        match command {
            Command::Uptime => {
                let reply = uptime_response(self.start_time.elapsed());
                write_reply(stream, &reply).await?;
                Ok(Flow::Continue)
            }
            Command::Event => {
                let reply = self.handle_event().await;
                write_reply(stream, &reply).await?;
                Ok(Flow::Continue)
            }
            Command::Shutdown => {
                self.status.request_shutdown();
                let reply = shutdown_response(self.status.images_persisted());
                // The server stops whether or not the reply gets through.
                if let Err(e) = write_reply(stream, &reply).await {
                    warn!("Shutdown reply not delivered: {e:#}");
                }
                Ok(Flow::Stop)
            }
        }
    }

    async fn handle_event(&self) -> String {
        if self.status.is_shutting_down() {
            return event_failed_response("node shutting down");
        }
        if self.status.is_capture_stopped() {
            return event_failed_response("camera offline");
        }

        if !self.event_delay.is_zero() {
            debug!("Settling for {:?} before marking the event", self.event_delay);
            let shutdown = self.status.shutdown_token();
            tokio::select! {
                _ = tokio::time::sleep(self.event_delay) => {}
                _ = shutdown.cancelled() => return event_failed_response("node shutting down"),
            }
        }

        let generation = self.status.raise_event();
        let waited = Instant::now();

        match self
            .status
            .wait_event_cleared(generation, self.event_timeout)
            .await
        {
            EventOutcome::Drained => {
                info!(
                    "Event captured in {:.3}s ({} images persisted in total)",
                    waited.elapsed().as_secs_f64(),
                    self.status.images_persisted()
                );
                EVENT_RESP.to_string()
            }
            EventOutcome::ShutDown => event_failed_response("node shutting down"),
            EventOutcome::CaptureStopped => {
                error!("Capture loop exited before draining the event");
                event_failed_response("camera offline")
            }
            EventOutcome::TimedOut => {
                error!(
                    "Drain did not finish within {:?}; the event stays pending",
                    self.event_timeout
                );
                event_failed_response("drain timed out")
            }
        }
    }
}

async fn write_reply(stream: &mut TcpStream, reply: &str) -> Result<()> {
    stream
        .write_all(reply.as_bytes())
        .await
        .context("Cannot send reply")?;
    stream.shutdown().await.context("Cannot close connection")?;
    Ok(())
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraGuard, SyntheticSource};
    use crate::capture::{CaptureLoop, LoopExit};
    use crate::testing::{MemorySink, PassthroughEncoder, ScriptedSource};
    use burstcam_common::protocol::send_command;
    use std::io::{Read, Write};
    use std::sync::atomic::Ordering;

    const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

    async fn bind(status: &Arc<SystemStatus>) -> CommandServer {
        CommandServer::bind("127.0.0.1:0", 1, status.clone())
            .await
            .unwrap()
    }

    fn serve(server: CommandServer) -> (SocketAddr, tokio::task::JoinHandle<Result<()>>) {
        let addr = server.local_addr().unwrap();
        (addr, tokio::spawn(server.run()))
    }

    async fn send(addr: SocketAddr, command: Command) -> std::io::Result<String> {
        tokio::task::spawn_blocking(move || send_command(addr, command, CLIENT_TIMEOUT))
            .await
            .unwrap()
    }

    async fn send_raw(addr: SocketAddr, payload: &'static [u8]) -> String {
        tokio::task::spawn_blocking(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();
            stream.write_all(payload).unwrap();
            let mut reply = String::new();
            stream.read_to_string(&mut reply).unwrap();
            reply
        })
        .await
        .unwrap()
    }

    async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_uptime_reports_elapsed_seconds() {
        let status = Arc::new(SystemStatus::new());
        let started = Instant::now()
            .checked_sub(Duration::from_millis(2500))
            .unwrap();
        let (addr, server) = serve(bind(&status).await.with_start_time(started));

        let reply = send(addr, Command::Uptime).await.unwrap();
        let secs = reply
            .strip_prefix("The server's uptime is ")
            .and_then(|r| r.strip_suffix(" seconds."))
            .unwrap_or_else(|| panic!("unexpected reply: {reply}"));
        let (whole, frac) = secs.split_once('.').unwrap();
        assert_eq!(whole, "2");
        assert_eq!(frac.len(), 6);
        assert!(secs.starts_with("2.5"), "got {secs}");
        assert!(status.is_camera_running());

        status.request_shutdown();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_command_changes_nothing() {
        let status = Arc::new(SystemStatus::new());
        let (addr, server) = serve(bind(&status).await);

        assert_eq!(send_raw(addr, b"STANDBY").await, UNKNOWN_RESP);
        assert_eq!(send_raw(addr, b"event").await, UNKNOWN_RESP);
        assert!(status.is_camera_running());
        assert!(!status.is_event_pending());
        assert_eq!(status.images_persisted(), 0);

        // Still serving.
        let reply = send(addr, Command::Uptime).await.unwrap();
        assert!(reply.starts_with("The server's uptime is"));

        status.request_shutdown();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dropped_client_does_not_stop_server() {
        let status = Arc::new(SystemStatus::new());
        let (addr, server) = serve(bind(&status).await);

        tokio::task::spawn_blocking(move || {
            drop(std::net::TcpStream::connect(addr).unwrap());
        })
        .await
        .unwrap();

        let reply = send(addr, Command::Uptime).await.unwrap();
        assert!(reply.starts_with("The server's uptime is"));

        status.request_shutdown();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_event_persists_last_frames_newest_first() {
        let status = Arc::new(SystemStatus::new());
        let source = ScriptedSource::new(vec!["f1", "f2", "f3", "f4", "f5"]);
        let delivered = source.delivered_counter();
        let released = source.release_counter();
        let sink = MemorySink::new();
        let capture = CaptureLoop::new(
            CameraGuard::new(Box::new(source)),
            PassthroughEncoder,
            sink.clone(),
            3,
            status.clone(),
        );
        let capture_thread = std::thread::spawn(move || capture.run());
        let (addr, server) = serve(bind(&status).await);

        wait_until("five frames", || delivered.load(Ordering::SeqCst) == 5).await;

        let reply = send(addr, Command::Event).await.unwrap();
        assert_eq!(reply, EVENT_RESP);
        assert_eq!(
            sink.frames(0),
            vec![
                (0, b"f5".to_vec()),
                (1, b"f4".to_vec()),
                (2, b"f3".to_vec())
            ]
        );
        assert_eq!(status.images_persisted(), 3);
        assert!(!status.is_event_pending());

        let reply = send(addr, Command::Shutdown).await.unwrap();
        assert_eq!(reply, "Server SHUTDOWN. Captured 3 images in total.");
        server.await.unwrap().unwrap();
        assert_eq!(capture_thread.join().unwrap(), LoopExit::Terminated);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_reports_total_and_stops_listening() {
        let status = Arc::new(SystemStatus::new());
        for _ in 0..7 {
            status.record_persisted();
        }
        let (addr, server) = serve(bind(&status).await);

        let reply = send(addr, Command::Shutdown).await.unwrap();
        assert_eq!(reply, "Server SHUTDOWN. Captured 7 images in total.");
        server.await.unwrap().unwrap();

        assert!(!status.is_camera_running());
        assert!(!status.is_event_pending());
        assert!(send(addr, Command::Uptime).await.is_err());
    }

    #[tokio::test]
    async fn test_second_client_waits_for_event_reply() {
        let status = Arc::new(SystemStatus::new());
        let sink = MemorySink::new().with_write_delay(Duration::from_millis(100));
        let capture = CaptureLoop::new(
            CameraGuard::new(Box::new(SyntheticSource::new(4, 4))),
            PassthroughEncoder,
            sink.clone(),
            3,
            status.clone(),
        )
        .with_frame_interval(Some(Duration::from_millis(1)));
        let capture_thread = std::thread::spawn(move || capture.run());
        let (addr, server) = serve(bind(&status).await);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let first = tokio::task::spawn_blocking(move || send_command(addr, Command::Event, CLIENT_TIMEOUT));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let observer = status.clone();
        let second = tokio::task::spawn_blocking(move || {
            let sent = Instant::now();
            let reply = send_command(addr, Command::Uptime, CLIENT_TIMEOUT);
            (reply, sent.elapsed(), observer.images_persisted())
        });

        assert_eq!(first.await.unwrap().unwrap(), EVENT_RESP);
        let (reply, waited, persisted_when_served) = second.await.unwrap();
        assert!(reply.unwrap().starts_with("The server's uptime is"));
        // The second client was only served after the whole drain.
        assert_eq!(persisted_when_served, 3);
        assert!(waited >= Duration::from_millis(150), "served after {waited:?}");

        let frames = sink.frames(0);
        let numbers: Vec<u64> = frames
            .iter()
            .map(|(_, blob)| SyntheticSource::frame_number_of(blob).unwrap())
            .collect();
        assert_eq!(numbers.len(), 3);
        assert!(numbers[0] > numbers[1] && numbers[1] > numbers[2]);

        send(addr, Command::Shutdown).await.unwrap();
        server.await.unwrap().unwrap();
        assert_eq!(capture_thread.join().unwrap(), LoopExit::Terminated);
    }

    #[tokio::test]
    async fn test_back_to_back_events_drain_one_at_a_time() {
        let status = Arc::new(SystemStatus::new());
        let sink = MemorySink::new().with_write_delay(Duration::from_millis(50));
        let capture = CaptureLoop::new(
            CameraGuard::new(Box::new(SyntheticSource::new(4, 4))),
            PassthroughEncoder,
            sink.clone(),
            3,
            status.clone(),
        )
        .with_frame_interval(Some(Duration::from_millis(1)));
        let capture_thread = std::thread::spawn(move || capture.run());
        // The settle delay keeps the second drain well clear of the first reply.
        let server = bind(&status)
            .await
            .with_event_delay(Duration::from_millis(100));
        let (addr, server) = serve(server);

        tokio::time::sleep(Duration::from_millis(20)).await;

        let (observer, first_sink) = (status.clone(), sink.clone());
        let first = tokio::task::spawn_blocking(move || {
            let reply = send_command(addr, Command::Event, CLIENT_TIMEOUT);
            let answered = Instant::now();
            (
                reply,
                answered,
                observer.images_persisted(),
                first_sink.batch_count(),
            )
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = tokio::task::spawn_blocking(move || {
            send_command(addr, Command::Event, CLIENT_TIMEOUT)
        });

        let (reply, answered, persisted, batches) = first.await.unwrap();
        assert_eq!(reply.unwrap(), EVENT_RESP);
        assert_eq!(persisted, 3);
        assert_eq!(batches, 1);

        assert_eq!(second.await.unwrap().unwrap(), EVENT_RESP);
        assert_eq!(sink.batch_count(), 2);
        assert!(sink.created_at(1) > answered);
        assert_eq!(status.images_persisted(), 6);

        let numbers = |batch: usize| -> Vec<u64> {
            sink.frames(batch)
                .iter()
                .map(|(_, blob)| SyntheticSource::frame_number_of(blob).unwrap())
                .collect()
        };
        let (older, newer) = (numbers(0), numbers(1));
        assert_eq!(newer.len(), 3);
        // The buffer was emptied by the first drain.
        assert!(newer.iter().min() > older.iter().max());

        send(addr, Command::Shutdown).await.unwrap();
        server.await.unwrap().unwrap();
        assert_eq!(capture_thread.join().unwrap(), LoopExit::Terminated);
    }

    #[tokio::test]
    async fn test_event_after_timeout_is_served_by_running_drain() {
        let status = Arc::new(SystemStatus::new());
        let sink = MemorySink::new().with_write_delay(Duration::from_millis(100));
        let capture = CaptureLoop::new(
            CameraGuard::new(Box::new(SyntheticSource::new(4, 4))),
            PassthroughEncoder,
            sink.clone(),
            3,
            status.clone(),
        )
        .with_frame_interval(Some(Duration::from_millis(1)));
        let capture_thread = std::thread::spawn(move || capture.run());
        let server = bind(&status)
            .await
            .with_event_timeout(Some(Duration::from_millis(200)));
        let (addr, server) = serve(server);

        tokio::time::sleep(Duration::from_millis(20)).await;

        // Three 100 ms writes outlast the first wait but not the retry.
        let reply = send(addr, Command::Event).await.unwrap();
        assert_eq!(reply, "ERROR event not captured: drain timed out.");

        let reply = send(addr, Command::Event).await.unwrap();
        assert_eq!(reply, EVENT_RESP);
        assert_eq!(sink.batch_count(), 1);
        assert_eq!(status.images_persisted(), 3);
        assert!(!status.is_event_pending());

        send(addr, Command::Shutdown).await.unwrap();
        server.await.unwrap().unwrap();
        assert_eq!(capture_thread.join().unwrap(), LoopExit::Terminated);
    }

    #[tokio::test]
    async fn test_settle_delay_precedes_event() {
        let status = Arc::new(SystemStatus::new());
        let capture = CaptureLoop::new(
            CameraGuard::new(Box::new(SyntheticSource::new(4, 4))),
            PassthroughEncoder,
            MemorySink::new(),
            3,
            status.clone(),
        )
        .with_frame_interval(Some(Duration::from_millis(1)));
        let capture_thread = std::thread::spawn(move || capture.run());
        let server = bind(&status)
            .await
            .with_event_delay(Duration::from_millis(200));
        let (addr, server) = serve(server);

        let sent = Instant::now();
        let reply = send(addr, Command::Event).await.unwrap();
        assert_eq!(reply, EVENT_RESP);
        assert!(sent.elapsed() >= Duration::from_millis(200));
        assert_eq!(status.images_persisted(), 3);

        send(addr, Command::Shutdown).await.unwrap();
        server.await.unwrap().unwrap();
        capture_thread.join().unwrap();
    }

    #[tokio::test]
    async fn test_event_without_capture_loop_reports_error() {
        let status = Arc::new(SystemStatus::new());
        status.mark_capture_stopped();
        let (addr, server) = serve(bind(&status).await);

        let reply = send(addr, Command::Event).await.unwrap();
        assert_eq!(reply, "ERROR event not captured: camera offline.");
        assert!(!status.is_event_pending());

        status.request_shutdown();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_event_wait_is_bounded() {
        let status = Arc::new(SystemStatus::new());
        let server = bind(&status)
            .await
            .with_event_timeout(Some(Duration::from_millis(50)));
        let (addr, server) = serve(server);

        let reply = send(addr, Command::Event).await.unwrap();
        assert_eq!(reply, "ERROR event not captured: drain timed out.");
        assert!(status.is_event_pending());

        status.request_shutdown();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_external_shutdown_closes_listener() {
        let status = Arc::new(SystemStatus::new());
        let (addr, server) = serve(bind(&status).await);

        status.request_shutdown();
        server.await.unwrap().unwrap();
        assert!(send(addr, Command::Uptime).await.is_err());
    }
}
