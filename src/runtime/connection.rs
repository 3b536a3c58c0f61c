//! Connection state machine for managing TCP connections.
//!
//! Each connection owns its socket and two buffers. Reads append to the
//! input buffer and hand it to the protocol handler, which moves reply bytes
//! into the output buffer. Writes drain the output buffer from the front.
//!
//! ```text
//!   Open --EOF, output empty------------------> Closed
//!   Open --EOF, output pending--> Closing --drained--> Closed
//!   Open/Closing --read or write error--------> Closed
//! ```
//!
//! The connection never talks to the registry. It reports the interest it
//! needs through [`Connection::interest`] and the event loop reconciles that
//! with what is actually registered.

use super::interest::Interest;
use super::registry::RegistryError;
use super::socket::{try_read, try_write, ReadOutcome, WriteOutcome};
use crate::config::Config;
use crate::protocols::Handler;
use bytes::{Buf, BytesMut};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Reading and writing normally.
    Open,
    /// Peer finished sending; flushing what is still queued.
    Closing,
    /// Terminal. The event loop removes the connection.
    Closed,
}

/// Per-connection buffer limits.
#[derive(Debug, Clone, Copy)]
pub struct BufferLimits {
    /// Unconsumed input beyond this is a protocol violation.
    pub max_input: usize,
    /// Reading pauses while this much output is queued.
    pub max_output: usize,
}

impl From<&Config> for BufferLimits {
    fn from(config: &Config) -> Self {
        Self {
            max_input: config.max_input,
            max_output: config.max_output,
        }
    }
}

/// How a read drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDrain {
    /// The socket has nothing more to give.
    WouldBlock,
    /// The peer shut down its sending side.
    Eof,
    /// Output reached its limit; reading stops until it drains.
    Paused,
}

/// How a flush ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The output buffer is empty.
    Drained,
    /// The socket send buffer is full; the remainder stays queued.
    Blocked,
}

/// A single client connection.
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    state: ConnState,
    input: BytesMut,
    output: BytesMut,
    /// Interest the registry currently holds for this socket.
    registered: Interest,
    /// Reading suspended by backpressure.
    paused: bool,
    limits: BufferLimits,
    received: u64,
    sent: u64,
}

impl<S> Connection<S> {
    /// Create a new connection. The caller registers it for `READABLE`.
    pub fn new(stream: S, peer: SocketAddr, limits: BufferLimits) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Open,
            input: BytesMut::new(),
            output: BytesMut::new(),
            registered: Interest::READABLE,
            paused: false,
            limits,
            received: 0,
            sent: 0,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Whether a readable notification should be acted on.
    pub fn wants_read(&self) -> bool {
        self.state == ConnState::Open && !self.paused
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn has_pending_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Bytes queued but not yet accepted by the kernel.
    pub fn pending_output(&self) -> &[u8] {
        &self.output
    }

    /// Bytes read but not yet consumed by the handler.
    pub fn buffered_input(&self) -> &[u8] {
        &self.input
    }

    /// Interest this connection needs right now: readable while open and
    /// not paused, writable while output is queued.
    pub fn interest(&self) -> Interest {
        let mut interest = Interest::NONE;
        if self.wants_read() {
            interest = interest.add(Interest::READABLE);
        }
        if self.state != ConnState::Closed && self.has_pending_output() {
            interest = interest.add(Interest::WRITABLE);
        }
        interest
    }

    pub fn registered(&self) -> Interest {
        self.registered
    }

    /// Record what the registry now holds for this socket.
    pub fn set_registered(&mut self, interest: Interest) {
        self.registered = interest;
    }

    /// Total bytes read from the peer.
    pub fn bytes_received(&self) -> u64 {
        self.received
    }

    /// Total bytes written to the peer.
    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    /// Lift backpressure once output has drained below the limit.
    ///
    /// Returns `true` if reading was resumed; the caller must then drain the
    /// socket, since data may have arrived while reads were suspended.
    pub fn try_resume(&mut self) -> bool {
        if self.paused
            && self.state == ConnState::Open
            && self.output.len() < self.limits.max_output
        {
            self.paused = false;
            true
        } else {
            false
        }
    }

    fn abort(&mut self) {
        self.state = ConnState::Closed;
        self.output.clear();
    }
}

impl<S: AsRawFd> Connection<S> {
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl<S: Read + Write> Connection<S> {
    /// Read until the socket would block, the peer closes, or backpressure
    /// kicks in. Each chunk is passed to `handler` as it arrives.
    ///
    /// `scratch` must not be empty.
    pub fn fill<H: Handler + ?Sized>(
        &mut self,
        handler: &H,
        scratch: &mut [u8],
    ) -> Result<ReadDrain, ConnError> {
        debug_assert!(!scratch.is_empty(), "read scratch buffer is empty");
        if self.state != ConnState::Open {
            return Ok(ReadDrain::Eof);
        }

        loop {
            if self.paused {
                return Ok(ReadDrain::Paused);
            }

            match try_read(&mut self.stream, scratch) {
                ReadOutcome::Data(n) => {
                    self.received += n as u64;
                    self.input.extend_from_slice(&scratch[..n]);

                    if let Err(e) = handler.on_data(&mut self.input, &mut self.output) {
                        self.abort();
                        return Err(ConnError::Handler(e));
                    }
                    if self.input.len() > self.limits.max_input {
                        let buffered = self.input.len();
                        self.abort();
                        return Err(ConnError::InputOverflow {
                            buffered,
                            limit: self.limits.max_input,
                        });
                    }
                    if self.output.len() >= self.limits.max_output {
                        self.paused = true;
                    }
                }
                ReadOutcome::Eof => {
                    self.state = if self.output.is_empty() {
                        ConnState::Closed
                    } else {
                        ConnState::Closing
                    };
                    return Ok(ReadDrain::Eof);
                }
                ReadOutcome::WouldBlock => return Ok(ReadDrain::WouldBlock),
                ReadOutcome::Fatal(e) => {
                    self.abort();
                    return Err(ConnError::Read(e));
                }
            }
        }
    }

    /// Write queued output until it is empty or the socket would block.
    /// A `Closing` connection becomes `Closed` once everything is flushed.
    pub fn flush(&mut self) -> Result<FlushOutcome, ConnError> {
        while !self.output.is_empty() {
            match try_write(&mut self.stream, &self.output) {
                WriteOutcome::Written(n) => {
                    self.output.advance(n);
                    self.sent += n as u64;
                }
                WriteOutcome::WouldBlock => return Ok(FlushOutcome::Blocked),
                WriteOutcome::Fatal(e) => {
                    self.abort();
                    return Err(ConnError::Write(e));
                }
            }
        }

        if self.state == ConnState::Closing {
            self.state = ConnState::Closed;
        }
        Ok(FlushOutcome::Drained)
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("input", &self.input.len())
            .field("output", &self.output.len())
            .field("registered", &self.registered)
            .field("paused", &self.paused)
            .finish()
    }
}

/// Errors that end a single connection.
#[derive(Debug)]
pub enum ConnError {
    Read(io::Error),
    Write(io::Error),
    /// Error reported asynchronously on the socket (`SO_ERROR`).
    Socket(io::Error),
    Handler(io::Error),
    InputOverflow { buffered: usize, limit: usize },
    Registry(RegistryError),
}

impl ConnError {
    fn io_error(&self) -> Option<&io::Error> {
        match self {
            ConnError::Read(e) | ConnError::Write(e) | ConnError::Socket(e) => Some(e),
            ConnError::Handler(e) => Some(e),
            ConnError::Registry(RegistryError::Io(e)) => Some(e),
            _ => None,
        }
    }

    /// The peer reset or abandoned the connection.
    pub fn is_peer_reset(&self) -> bool {
        match self {
            ConnError::Read(e) | ConnError::Write(e) | ConnError::Socket(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// OS error code, if the failure came from a syscall.
    pub fn raw_os_error(&self) -> Option<i32> {
        self.io_error().and_then(|e| e.raw_os_error())
    }
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnError::Read(e) => write!(f, "read failed: {e}"),
            ConnError::Write(e) => write!(f, "write failed: {e}"),
            ConnError::Socket(e) => write!(f, "socket error: {e}"),
            ConnError::Handler(e) => write!(f, "handler failed: {e}"),
            ConnError::InputOverflow { buffered, limit } => {
                write!(f, "input buffer overflow: {buffered} > {limit} bytes")
            }
            ConnError::Registry(e) => write!(f, "registry update failed: {e}"),
        }
    }
}

impl std::error::Error for ConnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnError::Registry(e) => Some(e),
            _ => self
                .io_error()
                .map(|e| e as &(dyn std::error::Error + 'static)),
        }
    }
}

/// Why a connection was released.
#[derive(Debug)]
pub enum CloseReason {
    /// Orderly shutdown by the peer, after all output was flushed.
    PeerClosed,
    /// The peer reset the connection.
    PeerReset(ConnError),
    /// Per-connection failure.
    Error(ConnError),
    /// The event loop is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Expected lifecycle event rather than a failure.
    pub fn is_graceful(&self) -> bool {
        !matches!(self, CloseReason::Error(_))
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            CloseReason::PeerReset(e) | CloseReason::Error(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl From<ConnError> for CloseReason {
    fn from(e: ConnError) -> Self {
        if e.is_peer_reset() {
            CloseReason::PeerReset(e)
        } else {
            CloseReason::Error(e)
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::PeerReset(e) => write!(f, "peer reset ({e})"),
            CloseReason::Error(e) => write!(f, "{e}"),
            CloseReason::Shutdown => f.write_str("shutdown"),
        }
    }
}
