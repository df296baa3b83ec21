//! Streaming captured frames to a consumer over TCP.
//!
//! The transport never blocks the presenting thread on a slow consumer. The
//! socket is non-blocking and holds at most one frame in flight: while a
//! previous frame is still draining, new frames are dropped rather than
//! queued, so a stalled consumer costs frames, never latency.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::frame::{DropReason, FRAME_HEADER_LEN, FrameDisposition, FrameSink, FrameView};

/// How long one connection attempt may take.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(50);
/// Minimum gap between connection attempts after one failed.
pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
/// Connection failures logged at warn level before dropping to debug.
const LOGGED_CONNECT_FAILURES: u32 = 3;
/// Sleep between drain attempts while flushing.
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Counters describing what happened to presented frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Frames completely written to the socket.
    pub frames_sent: u64,
    /// Frames discarded for any reason.
    pub frames_dropped: u64,
    /// Connections established after an earlier one was lost.
    pub reconnects: u64,
    /// Connections torn down after a write error.
    pub disconnects: u64,
    /// Connection attempts made, successful or not.
    pub connect_attempts: u64,
}

/// TCP client that sends frames in the `width, height, pixels` wire format.
pub struct FrameTransport {
    endpoint: SocketAddr,
    stream: Option<TcpStream>,
    /// Serialized frame currently in flight; reused across frames.
    pending: Vec<u8>,
    /// Bytes of `pending` already written.
    sent: usize,
    stats: TransportStats,
    connect_failures: u32,
    /// No connection attempt before this instant.
    retry_at: Option<Instant>,
    reconnect_backoff: Duration,
    ever_connected: bool,
}

impl FrameTransport {
    /// Creates a disconnected transport. The first send connects.
    pub fn new(endpoint: SocketAddr) -> Self {
        Self::with_reconnect_backoff(endpoint, RECONNECT_BACKOFF)
    }

    /// Like [`new`](Self::new), waiting `backoff` after a failed connection
    /// attempt before the next one. Frames sent in between are dropped
    /// without touching the network.
    pub fn with_reconnect_backoff(endpoint: SocketAddr, backoff: Duration) -> Self {
        Self {
            endpoint,
            stream: None,
            pending: Vec::new(),
            sent: 0,
            stats: TransportStats::default(),
            connect_failures: 0,
            retry_at: None,
            reconnect_backoff: backoff,
            ever_connected: false,
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    /// Whether part of a frame is still waiting to be written.
    pub fn has_pending(&self) -> bool {
        self.sent < self.pending.len()
    }

    /// Sends one frame, de-striding padded rows into the wire format.
    pub fn send_frame(&mut self, frame: &FrameView<'_>) -> FrameDisposition {
        let disposition = self.try_send(frame);
        match disposition {
            FrameDisposition::Delivered => self.stats.frames_sent += 1,
            FrameDisposition::Queued => {}
            FrameDisposition::Dropped(reason) => {
                self.stats.frames_dropped += 1;
                debug!("dropped frame: {reason:?}");
            }
        }
        disposition
    }

    fn try_send(&mut self, frame: &FrameView<'_>) -> FrameDisposition {
        if !self.ensure_connected() {
            return FrameDisposition::Dropped(DropReason::NotConnected);
        }

        if self.has_pending() {
            match self.drain() {
                Ok(true) => self.stats.frames_sent += 1,
                Ok(false) => return FrameDisposition::Dropped(DropReason::Backpressure),
                Err(err) => {
                    self.disconnect(&err);
                    return FrameDisposition::Dropped(DropReason::ConnectionLost);
                }
            }
        }

        self.pending.clear();
        self.pending.reserve(FRAME_HEADER_LEN + frame.header().payload_len());
        self.pending.extend_from_slice(&frame.header().to_bytes());
        frame.write_packed(&mut self.pending);
        self.sent = 0;

        match self.drain() {
            Ok(true) => FrameDisposition::Delivered,
            Ok(false) => FrameDisposition::Queued,
            Err(err) => {
                self.disconnect(&err);
                FrameDisposition::Dropped(DropReason::ConnectionLost)
            }
        }
    }

    /// Writes as much of the pending frame as the socket takes.
    ///
    /// Returns `Ok(true)` once nothing is pending, `Ok(false)` when the socket
    /// would block.
    fn drain(&mut self) -> io::Result<bool> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        while self.sent < self.pending.len() {
            match stream.write(&self.pending[self.sent..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => self.sent += written,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        self.pending.clear();
        self.sent = 0;
        Ok(true)
    }

    fn ensure_connected(&mut self) -> bool {
        if self.stream.is_some() {
            return true;
        }
        let now = Instant::now();
        if self.retry_at.is_some_and(|retry_at| now < retry_at) {
            return false;
        }
        self.stats.connect_attempts += 1;
        match connect(self.endpoint) {
            Ok(stream) => {
                info!("connected to frame consumer at {}", self.endpoint);
                self.stream = Some(stream);
                self.pending.clear();
                self.sent = 0;
                self.connect_failures = 0;
                self.retry_at = None;
                if self.ever_connected {
                    self.stats.reconnects += 1;
                }
                self.ever_connected = true;
                true
            }
            Err(err) => {
                self.connect_failures = self.connect_failures.saturating_add(1);
                self.retry_at = Some(now + self.reconnect_backoff);
                if self.connect_failures <= LOGGED_CONNECT_FAILURES {
                    warn!("cannot reach frame consumer at {}: {err}", self.endpoint);
                } else {
                    debug!("cannot reach frame consumer at {}: {err}", self.endpoint);
                }
                false
            }
        }
    }

    fn disconnect(&mut self, err: &io::Error) {
        warn!("frame consumer connection lost: {err}");
        self.stream = None;
        self.pending.clear();
        self.sent = 0;
        self.stats.disconnects += 1;
    }
}

impl FrameSink for FrameTransport {
    fn consume(&mut self, frame: &FrameView<'_>) -> FrameDisposition {
        self.send_frame(frame)
    }

    /// Keeps draining the frame in flight until it is written or `timeout`
    /// passes.
    fn flush(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.has_pending() {
            match self.drain() {
                Ok(true) => {
                    self.stats.frames_sent += 1;
                    return true;
                }
                Ok(false) if Instant::now() < deadline => thread::sleep(FLUSH_POLL_INTERVAL),
                Ok(false) => return false,
                Err(err) => {
                    self.disconnect(&err);
                    self.stats.frames_dropped += 1;
                    return false;
                }
            }
        }
        true
    }
}

fn connect(endpoint: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&endpoint, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}
