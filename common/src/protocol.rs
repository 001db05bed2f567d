//! Wire protocol between the controller and a camera node.
//!
//! One command per connection: the client writes a bare ASCII command,
//! the node answers with a single human-readable line and closes.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Largest request payload the node reads in one call.
pub const MAX_REQUEST_LEN: usize = 4096;

pub const EVENT_RESP: &str = "EVENT captured.";
pub const UNKNOWN_RESP: &str = "ERROR unrecognized command.";

/// A control command accepted by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Uptime,
    Event,
    Shutdown,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uptime => "UPTIME",
            Self::Event => "EVENT",
            Self::Shutdown => "SHUTDOWN",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unrecognized command: {0:?}")]
    Unrecognized(String),
}

impl FromStr for Command {
    type Err = ProtocolError;

    /// Commands are case-sensitive.  Trailing whitespace (e.g. the newline
    /// `nc` appends) is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_end() {
            "UPTIME" => Ok(Self::Uptime),
            "EVENT" => Ok(Self::Event),
            "SHUTDOWN" => Ok(Self::Shutdown),
            other => Err(ProtocolError::Unrecognized(other.to_string())),
        }
    }
}

/// Decode a raw request payload into a command.
pub fn parse_request(payload: &[u8]) -> Result<Command, ProtocolError> {
    String::from_utf8_lossy(payload).parse()
}

pub fn uptime_response(elapsed: Duration) -> String {
    format!("The server's uptime is {:.6} seconds.", elapsed.as_secs_f64())
}

pub fn shutdown_response(images_persisted: u64) -> String {
    format!("Server SHUTDOWN. Captured {images_persisted} images in total.")
}

pub fn event_failed_response(reason: &str) -> String {
    format!("ERROR event not captured: {reason}.")
}

/// Send one command and return the node's reply.
///
/// `timeout` bounds the connect and each read/write.  `EVENT` replies only
/// after the drain, so callers should allow for the settle delay plus the
/// time to persist a full buffer.
pub fn send_command(
    addr: impl ToSocketAddrs,
    command: Command,
    timeout: Duration,
) -> std::io::Result<String> {
    let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "no address to connect to")
    })?;
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.write_all(command.as_str().as_bytes())?;

    let mut reply = String::new();
    stream.read_to_string(&mut reply)?;
    Ok(reply)
}
