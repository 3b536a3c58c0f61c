//! Readiness-based event loop.
//!
//! One loop owns one registry, one listening socket and every connection it
//! accepted. Nothing is shared with other loops, so running N loops on N
//! threads needs no locking.
//!
//! Per notification batch:
//! - listener readable: accept until the backlog is empty
//! - connection readable: read until `WouldBlock`, EOF or backpressure,
//!   feeding each chunk to the handler, then flush eagerly
//! - connection writable: flush until `WouldBlock` or the output is empty
//!
//! after which the connection's registered interest is reconciled with what
//! it now needs. Every notification is drained completely before the next
//! wait, which keeps edge-triggered registrations from stalling.
//!
//! Per-connection failures close only that connection; the loop carries on
//! with the rest of the batch. Only registry failures end the loop.

use super::connection::{BufferLimits, CloseReason, ConnError, Connection};
use super::interest::{Interest, Readiness};
use super::registry::{Event, Events, Registry};
use super::socket::{self, AcceptOutcome};
use super::{ServerError, Shutdown};
use crate::config::{Config, TriggerMode};
use crate::protocols::{Echo, Handler};
use mio::net::TcpStream;
use mio::Token;
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// How long the listener stays disarmed after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Counters for one event loop. Byte totals cover closed connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub accepted: u64,
    /// Connections dropped on accept because the loop was full.
    pub rejected: u64,
    pub closed: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl LoopStats {
    /// Sum counters across loops.
    pub fn merge(&mut self, other: &LoopStats) {
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.closed += other.closed;
        self.bytes_received += other.bytes_received;
        self.bytes_sent += other.bytes_sent;
    }
}

/// Single-threaded dispatcher owning a listener and its connections.
pub struct EventLoop<H = Echo> {
    worker_id: usize,
    registry: Registry,
    events: Events,
    listener: TcpListener,
    connections: Slab<Connection<TcpStream>>,
    handler: H,
    limits: BufferLimits,
    max_connections: usize,
    poll_timeout: Duration,
    /// Read target shared by all connections of this loop.
    scratch: Vec<u8>,
    /// Set while the listener is disarmed after an accept failure.
    accept_paused_until: Option<Instant>,
    stats: LoopStats,
}

impl<H: Handler> EventLoop<H> {
    /// Bind to the configured address.
    pub fn bind(worker_id: usize, config: &Config, handler: H) -> Result<Self, ServerError> {
        let addr = config.addr()?;
        Self::bind_addr(worker_id, addr, config, handler)
    }

    /// Bind to `addr`, taking every other setting from `config`.
    ///
    /// The port is shared with sibling loops only when `config` asks for
    /// more than one worker.
    pub fn bind_addr(
        worker_id: usize,
        addr: SocketAddr,
        config: &Config,
        handler: H,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let mut registry = Registry::new(config.trigger).map_err(ServerError::Registry)?;

        let reuse_port = config.worker_count() > 1;
        let listener = socket::bind_listener(addr, config.backlog, reuse_port)
            .map_err(|source| ServerError::Bind { addr, source })?;
        registry
            .register(listener.as_raw_fd(), LISTENER_TOKEN, Interest::READABLE)
            .map_err(ServerError::Listener)?;

        Ok(Self {
            worker_id,
            registry,
            events: Events::with_capacity(config.batch_size),
            listener,
            connections: Slab::with_capacity(config.max_connections.min(1024)),
            handler,
            limits: BufferLimits::from(config),
            max_connections: config.max_connections,
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            scratch: vec![0u8; config.read_chunk],
            accept_paused_until: None,
            stats: LoopStats::default(),
        })
    }

    /// Run until `shutdown` is triggered, then close every connection.
    pub fn run(&mut self, shutdown: &Shutdown) -> Result<LoopStats, ServerError> {
        info!(
            worker = self.worker_id,
            addr = ?self.listener.local_addr().ok(),
            trigger = ?self.registry.mode(),
            batch_size = self.events.capacity(),
            "Worker started"
        );

        while !shutdown.is_triggered() {
            self.turn(Some(self.poll_timeout))?;
        }

        self.close_all();
        info!(
            worker = self.worker_id,
            accepted = self.stats.accepted,
            rejected = self.stats.rejected,
            closed = self.stats.closed,
            bytes_received = self.stats.bytes_received,
            bytes_sent = self.stats.bytes_sent,
            "Worker stopped"
        );
        Ok(self.stats)
    }

    /// Wait once and dispatch the resulting batch.
    ///
    /// Returns the number of events handled.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<usize, ServerError> {
        let timeout = self.resume_accepting(timeout);
        self.registry
            .wait(&mut self.events, timeout)
            .map_err(ServerError::Wait)?;

        let n = self.events.len();
        for idx in 0..n {
            if let Some(event) = self.events.get(idx) {
                self.dispatch(event);
            }
        }
        Ok(n)
    }

    fn dispatch(&mut self, event: Event) {
        match event.token() {
            LISTENER_TOKEN => self.accept_all(),
            Token(key) => self.ready(key, event.readiness()),
        }
    }

    fn accept_all(&mut self) {
        loop {
            match socket::try_accept(&self.listener) {
                AcceptOutcome::NewConnection(stream, peer) => self.admit(stream, peer),
                AcceptOutcome::WouldBlock => break,
                AcceptOutcome::Fatal(e) => {
                    error!(
                        worker = self.worker_id,
                        error = %e,
                        errno = ?e.raw_os_error(),
                        "Accept failed"
                    );
                    self.pause_accepting();
                    break;
                }
            }
        }
    }

    /// Disarm the listener for `ACCEPT_BACKOFF`. A persistent failure such
    /// as `EMFILE` would otherwise be reported by every level-triggered wait.
    fn pause_accepting(&mut self) {
        if let Err(e) = self
            .registry
            .modify(self.listener.as_raw_fd(), Interest::NONE)
        {
            error!(worker = self.worker_id, error = %e, "Failed to pause listener");
        }
        self.accept_paused_until = Some(Instant::now() + ACCEPT_BACKOFF);
    }

    /// Re-arm the listener once the backoff has passed. Until then the wait
    /// is shortened so it ends with the backoff.
    ///
    /// Re-arming goes through `EPOLL_CTL_MOD`, so connections queued during
    /// the pause are reported again in edge mode too.
    fn resume_accepting(&mut self, timeout: Option<Duration>) -> Option<Duration> {
        let Some(until) = self.accept_paused_until else {
            return timeout;
        };

        let now = Instant::now();
        if now >= until {
            match self
                .registry
                .modify(self.listener.as_raw_fd(), Interest::READABLE)
            {
                Ok(()) => {
                    debug!(worker = self.worker_id, "Accepting resumed");
                    self.accept_paused_until = None;
                    return timeout;
                }
                Err(e) => {
                    error!(worker = self.worker_id, error = %e, "Failed to re-arm listener");
                    self.accept_paused_until = Some(now + ACCEPT_BACKOFF);
                }
            }
        }

        let remaining = self
            .accept_paused_until
            .map_or(Duration::ZERO, |until| until.saturating_duration_since(now));
        Some(timeout.map_or(remaining, |t| t.min(remaining)))
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.connections.len() >= self.max_connections {
            self.stats.rejected += 1;
            warn!(worker = self.worker_id, peer = %peer, "Connection limit reached");
            return;
        }

        let fd = stream.as_raw_fd();
        let entry = self.connections.vacant_entry();
        let key = entry.key();

        if let Err(e) = self.registry.register(fd, Token(key), Interest::READABLE) {
            warn!(
                worker = self.worker_id,
                fd,
                peer = %peer,
                error = %e,
                "Failed to register connection"
            );
            return;
        }

        entry.insert(Connection::new(stream, peer, self.limits));
        self.stats.accepted += 1;
        info!(worker = self.worker_id, fd, peer = %peer, "Connection accepted");
    }

    fn ready(&mut self, key: usize, readiness: Readiness) {
        // Already closed earlier in this batch.
        let Some(conn) = self.connections.get_mut(key) else {
            return;
        };

        let result = if readiness.is_error() {
            Err(socket_error(conn.stream()))
        } else {
            service(conn, readiness, &self.handler, &mut self.scratch)
        };

        match result {
            Ok(()) if conn.is_closed() => self.close(key, CloseReason::PeerClosed),
            Ok(()) => self.sync_interest(key),
            Err(e) => self.close(key, e.into()),
        }
    }
}

impl<H> EventLoop<H> {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Descriptors in the registry, including the listener.
    pub fn registered_count(&self) -> usize {
        self.registry.len()
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        self.registry.mode()
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// Close every connection, discarding unflushed output.
    pub fn close_all(&mut self) {
        let keys: Vec<usize> = self.connections.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.close(key, CloseReason::Shutdown);
        }
    }

    /// Bring the registered interest in line with what the connection needs.
    fn sync_interest(&mut self, key: usize) {
        let Some(conn) = self.connections.get_mut(key) else {
            return;
        };

        let wanted = conn.interest();
        if wanted == conn.registered() {
            return;
        }

        match self.registry.modify(conn.fd(), wanted) {
            Ok(()) => {
                trace!(fd = conn.fd(), from = ?conn.registered(), to = ?wanted, "Interest updated");
                conn.set_registered(wanted);
            }
            Err(e) => self.close(key, ConnError::Registry(e).into()),
        }
    }

    /// Remove a connection: unregister, then drop the socket. Removing from
    /// the slab makes a second close of the same key a no-op.
    fn close(&mut self, key: usize, reason: CloseReason) {
        let Some(conn) = self.connections.try_remove(key) else {
            return;
        };

        let fd = conn.fd();
        if let Err(e) = self.registry.unregister(fd) {
            debug!(worker = self.worker_id, fd, error = %e, "Unregister failed");
            // The socket is dropped below, which takes it out of the epoll set.
            self.registry.forget(fd);
        }

        self.stats.closed += 1;
        self.stats.bytes_received += conn.bytes_received();
        self.stats.bytes_sent += conn.bytes_sent();

        if reason.is_graceful() {
            info!(
                worker = self.worker_id,
                fd,
                peer = %conn.peer(),
                reason = %reason,
                errno = ?reason.raw_os_error(),
                received = conn.bytes_received(),
                sent = conn.bytes_sent(),
                "Connection closed"
            );
        } else {
            warn!(
                worker = self.worker_id,
                fd,
                peer = %conn.peer(),
                reason = %reason,
                errno = ?reason.raw_os_error(),
                received = conn.bytes_received(),
                sent = conn.bytes_sent(),
                "Connection closed"
            );
        }
    }
}

impl<H> Drop for EventLoop<H> {
    fn drop(&mut self) {
        self.close_all();
        let _ = self.registry.unregister(self.listener.as_raw_fd());
    }
}

/// Handle one notification for one connection: drain reads, then flush.
fn service<S, H>(
    conn: &mut Connection<S>,
    readiness: Readiness,
    handler: &H,
    scratch: &mut [u8],
) -> Result<(), ConnError>
where
    S: Read + Write,
    H: Handler + ?Sized,
{
    let mut read = readiness.is_readable() || readiness.is_read_closed();
    loop {
        if read && conn.wants_read() {
            conn.fill(handler, scratch)?;
        }
        if conn.has_pending_output() {
            conn.flush()?;
        }
        // Reads were suspended by backpressure; anything that arrived in
        // the meantime is still unread and no new edge will announce it.
        if conn.try_resume() {
            read = true;
            continue;
        }
        return Ok(());
    }
}

fn socket_error(stream: &TcpStream) -> ConnError {
    let err = match stream.take_error() {
        Ok(Some(e)) | Err(e) => e,
        Ok(None) => io::Error::new(io::ErrorKind::Other, "socket reported an error"),
    };
    ConnError::Socket(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use std::fs;
    use std::io::ErrorKind;
    use std::net::{Shutdown as SocketShutdown, TcpStream as StdTcpStream};
    use std::path::{Path, PathBuf};
    use std::thread;
    use std::time::Instant;

    const STEP: Option<Duration> = Some(Duration::from_millis(5));
    const DEADLINE: Duration = Duration::from_secs(10);

    fn config(trigger: TriggerMode) -> Config {
        Config {
            port: 0,
            trigger,
            poll_timeout_ms: 10,
            ..Config::default()
        }
    }

    fn bind(config: &Config) -> EventLoop {
        EventLoop::bind(0, config, Echo).unwrap()
    }

    fn connect(ev: &EventLoop) -> StdTcpStream {
        let stream = StdTcpStream::connect(ev.local_addr().unwrap()).unwrap();
        stream.set_read_timeout(Some(DEADLINE)).unwrap();
        stream
    }

    fn pump_until(ev: &mut EventLoop, mut done: impl FnMut(&EventLoop) -> bool) {
        let deadline = Instant::now() + DEADLINE;
        while !done(ev) {
            assert!(Instant::now() < deadline, "event loop did not converge");
            ev.turn(STEP).unwrap();
        }
    }

    /// Pump the loop while collecting `n` bytes (or EOF) from `client`.
    fn pump_read(ev: &mut EventLoop, client: &mut StdTcpStream, n: usize) -> Vec<u8> {
        client.set_nonblocking(true).unwrap();
        let deadline = Instant::now() + DEADLINE;
        let mut received = Vec::with_capacity(n);
        let mut buf = [0u8; 16 * 1024];

        'outer: while received.len() < n {
            assert!(Instant::now() < deadline, "echo did not arrive");
            ev.turn(STEP).unwrap();
            loop {
                match client.read(&mut buf) {
                    Ok(0) => break 'outer,
                    Ok(k) => received.extend_from_slice(&buf[..k]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => panic!("client read failed: {e}"),
                }
            }
        }

        client.set_nonblocking(false).unwrap();
        received
    }

    fn assert_hello_round_trip(trigger: TriggerMode) {
        let mut ev = bind(&config(trigger));
        let mut client = connect(&ev);

        client.write_all(b"hello").unwrap();
        assert_eq!(pump_read(&mut ev, &mut client, 5), b"hello");
        assert_eq!(ev.connection_count(), 1);
        assert_eq!(ev.registered_count(), 2);

        client.shutdown(SocketShutdown::Write).unwrap();
        pump_until(&mut ev, |ev| ev.connection_count() == 0);

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        // Only the listener remains registered.
        assert_eq!(ev.registered_count(), 1);
        assert_eq!(ev.stats().closed, 1);
        assert_eq!(ev.stats().bytes_sent, 5);
    }

    #[test]
    fn test_hello_round_trip_edge() {
        assert_hello_round_trip(TriggerMode::Edge);
    }

    #[test]
    fn test_hello_round_trip_level() {
        assert_hello_round_trip(TriggerMode::Level);
    }

    /// What each descriptor owned by the loop points at, e.g. `socket:[4711]`.
    fn loop_descriptors(ev: &EventLoop) -> Vec<PathBuf> {
        let mut fds = vec![ev.registry.as_raw_fd(), ev.listener.as_raw_fd()];
        fds.extend(ev.connections.iter().map(|(_, conn)| conn.fd()));
        fds.into_iter()
            .map(|fd| fs::read_link(format!("/proc/self/fd/{fd}")).unwrap())
            .collect()
    }

    fn process_holds(target: &Path) -> bool {
        fs::read_dir("/proc/self/fd")
            .unwrap()
            .filter_map(Result::ok)
            .filter_map(|entry| fs::read_link(entry.path()).ok())
            .any(|link| link == target)
    }

    #[test]
    fn test_closed_connection_releases_descriptor() {
        for trigger in [TriggerMode::Edge, TriggerMode::Level] {
            let mut ev = bind(&config(trigger));
            let baseline = loop_descriptors(&ev);

            let mut client = connect(&ev);
            client.write_all(b"hello").unwrap();
            assert_eq!(pump_read(&mut ev, &mut client, 5), b"hello");

            let open = loop_descriptors(&ev);
            assert_eq!(open.len(), baseline.len() + 1);
            let accepted = open[baseline.len()].clone();
            assert!(process_holds(&accepted));

            client.shutdown(SocketShutdown::Write).unwrap();
            pump_until(&mut ev, |ev| ev.connection_count() == 0);

            // Socket inodes are not reused, so another test's descriptor
            // cannot stand in for the accepted one.
            assert_eq!(loop_descriptors(&ev), baseline);
            assert!(!process_holds(&accepted));
        }
    }

    #[test]
    fn test_second_bind_on_taken_port_fails() {
        let config = Config {
            workers: 1,
            ..config(TriggerMode::Edge)
        };
        let first = bind(&config);
        let addr = first.local_addr().unwrap();

        assert!(matches!(
            EventLoop::bind_addr(0, addr, &config, Echo),
            Err(ServerError::Bind { .. })
        ));
    }

    #[test]
    fn test_bind_rejects_zero_read_chunk() {
        let config = Config {
            read_chunk: 0,
            ..config(TriggerMode::Level)
        };
        assert!(matches!(
            EventLoop::bind(0, &config, Echo),
            Err(ServerError::Config(ConfigError::Invalid("read_chunk")))
        ));
    }

    #[test]
    fn test_paused_listener_accepts_after_backoff() {
        for trigger in [TriggerMode::Edge, TriggerMode::Level] {
            let mut ev = bind(&config(trigger));
            let listener = ev.listener.as_raw_fd();

            ev.pause_accepting();
            assert_eq!(ev.registry.interest(listener), Some(Interest::NONE));
            let _client = connect(&ev);

            // An unbounded wait still ends when the backoff does.
            ev.turn(None).unwrap();
            assert_eq!(ev.stats().accepted, 0);

            pump_until(&mut ev, |ev| ev.stats().accepted == 1);
            assert_eq!(ev.registry.interest(listener), Some(Interest::READABLE));
            assert!(ev.accept_paused_until.is_none());
        }
    }

    #[test]
    fn test_fragmented_sends_echo_in_order() {
        let mut ev = bind(&config(TriggerMode::Edge));
        let mut client = connect(&ev);

        let chunks: [&[u8]; 4] = [b"ab", b"cde", b"", b"fghij"];
        let mut expected = Vec::new();
        for chunk in chunks {
            client.write_all(chunk).unwrap();
            expected.extend_from_slice(chunk);
            ev.turn(STEP).unwrap();
        }

        assert_eq!(pump_read(&mut ev, &mut client, expected.len()), expected);
    }

    #[test]
    fn test_back_to_back_writes_drained_on_one_notification() {
        let config = Config {
            read_chunk: 4,
            ..config(TriggerMode::Edge)
        };
        let mut ev = bind(&config);
        let mut client = connect(&ev);

        client.write_all(b"first").unwrap();
        client.write_all(b"second").unwrap();
        pump_until(&mut ev, |ev| ev.stats().accepted == 1);

        // A single readable edge must yield every byte, four at a time.
        thread::sleep(Duration::from_millis(20));
        ev.turn(Some(Duration::from_secs(1))).unwrap();

        thread::sleep(Duration::from_millis(20));
        client.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"firstsecond");
    }

    #[test]
    fn test_backlog_drained_in_one_cycle() {
        let mut ev = bind(&config(TriggerMode::Edge));
        let clients: Vec<_> = (0..8).map(|_| connect(&ev)).collect();
        thread::sleep(Duration::from_millis(50));

        ev.turn(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(ev.stats().accepted, 8);
        assert_eq!(ev.connection_count(), 8);
        drop(clients);
    }

    #[test]
    fn test_reset_is_isolated() {
        let mut ev = bind(&config(TriggerMode::Edge));
        let a = connect(&ev);
        let mut b = connect(&ev);
        pump_until(&mut ev, |ev| ev.connection_count() == 2);

        // Close with an RST instead of a FIN.
        socket2::SockRef::from(&a)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(a);

        b.write_all(b"still here").unwrap();
        assert_eq!(pump_read(&mut ev, &mut b, 10), b"still here");
        pump_until(&mut ev, |ev| ev.connection_count() == 1);

        b.write_all(b"and again").unwrap();
        assert_eq!(pump_read(&mut ev, &mut b, 9), b"and again");
        assert_eq!(ev.stats().closed, 1);
    }

    fn assert_large_echo_under_backpressure(trigger: TriggerMode) {
        let config = Config {
            read_chunk: 1024,
            max_output: 4096,
            ..config(trigger)
        };
        let mut ev = bind(&config);
        let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();

        let mut client = connect(&ev);
        let mut writer = client.try_clone().unwrap();
        let outgoing = payload.clone();
        let reader = thread::spawn(move || {
            let sender = thread::spawn(move || {
                writer.write_all(&outgoing).unwrap();
                writer.shutdown(SocketShutdown::Write).unwrap();
            });
            let mut received = Vec::new();
            client.read_to_end(&mut received).unwrap();
            sender.join().unwrap();
            received
        });

        pump_until(&mut ev, |ev| ev.stats().closed == 1);
        let received = reader.join().unwrap();

        assert_eq!(received.len(), payload.len());
        assert!(received == payload, "echoed bytes differ");
        assert_eq!(ev.stats().bytes_received, payload.len() as u64);
        assert_eq!(ev.stats().bytes_sent, payload.len() as u64);
    }

    #[test]
    fn test_large_echo_under_backpressure_edge() {
        assert_large_echo_under_backpressure(TriggerMode::Edge);
    }

    #[test]
    fn test_large_echo_under_backpressure_level() {
        assert_large_echo_under_backpressure(TriggerMode::Level);
    }

    #[test]
    fn test_connection_limit_rejects() {
        let config = Config {
            max_connections: 1,
            ..config(TriggerMode::Edge)
        };
        let mut ev = bind(&config);
        let _first = connect(&ev);
        let _second = connect(&ev);

        pump_until(&mut ev, |ev| ev.stats().accepted + ev.stats().rejected == 2);
        assert_eq!(ev.stats().accepted, 1);
        assert_eq!(ev.stats().rejected, 1);
        assert_eq!(ev.connection_count(), 1);
    }

    #[test]
    fn test_run_closes_connections_on_shutdown() {
        let mut ev = bind(&config(TriggerMode::Edge));
        let mut a = connect(&ev);
        let mut b = connect(&ev);
        pump_until(&mut ev, |ev| ev.connection_count() == 2);

        let shutdown = Shutdown::new();
        shutdown.trigger();
        let stats = ev.run(&shutdown).unwrap();

        assert_eq!(stats.closed, 2);
        assert_eq!(ev.connection_count(), 0);
        assert_eq!(ev.registered_count(), 1);

        let mut buf = [0u8; 4];
        assert_eq!(a.read(&mut buf).unwrap(), 0);
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }
}
