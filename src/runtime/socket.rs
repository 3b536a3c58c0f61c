//! Non-blocking socket primitives.
//!
//! Every call here returns immediately. "No progress possible right now" is
//! an ordinary outcome (`WouldBlock`), kept apart from end-of-stream and from
//! real failures so the event loop can match on it instead of inspecting
//! error kinds. Nothing here buffers: a partial write is reported as such and
//! the caller keeps the remainder.

use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};

/// Result of one accept attempt.
#[derive(Debug)]
pub enum AcceptOutcome {
    /// A queued connection, already switched to non-blocking mode.
    NewConnection(TcpStream, SocketAddr),
    /// The backlog is empty.
    WouldBlock,
    Fatal(io::Error),
}

/// Result of one read attempt.
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n` bytes were placed at the front of the buffer.
    Data(usize),
    /// Orderly shutdown by the peer.
    Eof,
    /// Nothing to read until the next readiness notification.
    WouldBlock,
    Fatal(io::Error),
}

/// Result of one write attempt.
#[derive(Debug)]
pub enum WriteOutcome {
    /// `n` bytes from the front of the slice were accepted by the kernel.
    /// May be fewer than requested.
    Written(usize),
    /// The send buffer is full.
    WouldBlock,
    Fatal(io::Error),
}

/// Put a descriptor into non-blocking mode.
pub fn set_non_blocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    if flags & libc::O_NONBLOCK == 0 {
        syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }
    Ok(())
}

/// Create a non-blocking listening socket.
///
/// With `reuse_port` set, `SO_REUSEPORT` lets several event loops each own a
/// listener on the same address, with the kernel spreading new connections
/// across them. Without it a second bind on a taken address fails.
pub fn bind_listener(
    addr: SocketAddr,
    backlog: i32,
    reuse_port: bool,
) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Accept one pending connection without blocking.
pub fn try_accept(listener: &TcpListener) -> AcceptOutcome {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = set_non_blocking(stream.as_raw_fd()) {
                    return AcceptOutcome::Fatal(e);
                }
                return AcceptOutcome::NewConnection(TcpStream::from_std(stream), peer);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return AcceptOutcome::WouldBlock,
            // The peer gave up while queued, or a signal arrived: try the next one.
            Err(e)
                if e.kind() == io::ErrorKind::Interrupted
                    || e.kind() == io::ErrorKind::ConnectionAborted => {}
            Err(e) => return AcceptOutcome::Fatal(e),
        }
    }
}

/// Read once into `buf` without blocking.
pub fn try_read<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> ReadOutcome {
    loop {
        match source.read(buf) {
            Ok(0) => return ReadOutcome::Eof,
            Ok(n) => return ReadOutcome::Data(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return ReadOutcome::Fatal(e),
        }
    }
}

/// Write once from `bytes` without blocking.
pub fn try_write<W: Write + ?Sized>(sink: &mut W, bytes: &[u8]) -> WriteOutcome {
    loop {
        match sink.write(bytes) {
            Ok(0) if !bytes.is_empty() => {
                return WriteOutcome::Fatal(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write returned 0",
                ));
            }
            Ok(n) => return WriteOutcome::Written(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return WriteOutcome::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return WriteOutcome::Fatal(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpStream as StdTcpStream;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_set_non_blocking() {
        let (a, _b) = UnixStream::pair().unwrap();
        set_non_blocking(a.as_raw_fd()).unwrap();
        // Idempotent.
        set_non_blocking(a.as_raw_fd()).unwrap();

        let mut a = a;
        let mut buf = [0u8; 8];
        assert!(matches!(try_read(&mut a, &mut buf), ReadOutcome::WouldBlock));
    }

    #[test]
    fn test_read_outcomes() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 8];

        assert!(matches!(try_read(&mut b, &mut buf), ReadOutcome::WouldBlock));

        a.write_all(b"abc").unwrap();
        assert!(matches!(try_read(&mut b, &mut buf), ReadOutcome::Data(3)));
        assert_eq!(&buf[..3], b"abc");

        drop(a);
        assert!(matches!(try_read(&mut b, &mut buf), ReadOutcome::Eof));
    }

    #[test]
    fn test_write_until_would_block() {
        let (mut a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let chunk = [0x5au8; 64 * 1024];

        let mut total = 0;
        loop {
            match try_write(&mut a, &chunk) {
                WriteOutcome::Written(n) => total += n,
                WriteOutcome::WouldBlock => break,
                WriteOutcome::Fatal(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(total > 0);
    }

    #[test]
    fn test_write_zero_is_fatal() {
        let mut storage: [u8; 0] = [];
        let mut full = Cursor::new(&mut storage[..]);
        match try_write(&mut full, b"data") {
            WriteOutcome::Fatal(e) => assert_eq!(e.kind(), io::ErrorKind::WriteZero),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_taken_address_needs_reuse_port() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap(), 16, false).unwrap();
        let addr = first.local_addr().unwrap();
        let err = bind_listener(addr, 16, false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        let shared = bind_listener("127.0.0.1:0".parse().unwrap(), 16, true).unwrap();
        let addr = shared.local_addr().unwrap();
        let sibling = bind_listener(addr, 16, true).unwrap();
        assert_eq!(sibling.local_addr().unwrap(), addr);
    }

    #[test]
    fn test_accept_drains_backlog() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16, false).unwrap();
        let addr = listener.local_addr().unwrap();

        assert!(matches!(try_accept(&listener), AcceptOutcome::WouldBlock));

        let _clients: Vec<_> = (0..3).map(|_| StdTcpStream::connect(addr).unwrap()).collect();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut accepted = Vec::new();
        loop {
            match try_accept(&listener) {
                AcceptOutcome::NewConnection(stream, peer) => {
                    assert!(peer.ip().is_loopback());
                    accepted.push(stream);
                }
                AcceptOutcome::WouldBlock => break,
                AcceptOutcome::Fatal(e) => panic!("accept failed: {e}"),
            }
        }
        assert_eq!(accepted.len(), 3);

        // Accepted streams never block.
        let mut buf = [0u8; 4];
        assert!(matches!(
            try_read(&mut accepted[0], &mut buf),
            ReadOutcome::WouldBlock
        ));
    }
}
