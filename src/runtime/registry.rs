//! Readiness registry backed by Linux `epoll`.
//!
//! The registry is the only place the event loop suspends. It keeps its own
//! map of registered descriptors so that misuse (double register, modifying
//! or removing an unknown descriptor) is reported as an error instead of
//! being silently forwarded to the kernel.
//!
//! ## Trigger modes
//!
//! In edge-triggered mode (`EPOLLET`) a descriptor is reported once per
//! state transition. A consumer that stops reading before `WouldBlock` will
//! not hear about the remaining bytes again until new data arrives, which for
//! an idle peer means never. The event loop therefore drains every ready
//! descriptor in both modes; under level-triggered mode that only saves
//! redundant wakeups.
//!
//! `modify` always re-arms the descriptor: the kernel re-evaluates readiness
//! on `EPOLL_CTL_MOD`, so re-adding an interest for data that is already
//! pending produces a fresh notification.

use super::interest::{Interest, Readiness};
use crate::config::TriggerMode;
use mio::Token;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Watched state for one descriptor.
#[derive(Debug, Clone, Copy)]
struct Registration {
    token: Token,
    interest: Interest,
}

/// Descriptor registry over an epoll instance.
#[derive(Debug)]
pub struct Registry {
    epfd: OwnedFd,
    mode: TriggerMode,
    entries: HashMap<RawFd, Registration>,
}

impl Registry {
    /// Create a new epoll instance.
    pub fn new(mode: TriggerMode) -> io::Result<Self> {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        // SAFETY: epoll_create1 returned a fresh descriptor that nothing else owns.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };

        Ok(Self {
            epfd,
            mode,
            entries: HashMap::new(),
        })
    }

    /// Trigger mode applied to every registration.
    pub fn mode(&self) -> TriggerMode {
        self.mode
    }

    /// Start watching `fd`. Events for it carry `token`.
    pub fn register(
        &mut self,
        fd: RawFd,
        token: Token,
        interest: Interest,
    ) -> Result<(), RegistryError> {
        if self.entries.contains_key(&fd) {
            return Err(RegistryError::AlreadyRegistered(fd));
        }

        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)?;
        self.entries.insert(fd, Registration { token, interest });
        Ok(())
    }

    /// Replace the watched events for `fd`.
    pub fn modify(&mut self, fd: RawFd, interest: Interest) -> Result<(), RegistryError> {
        let token = match self.entries.get(&fd) {
            Some(registration) => registration.token,
            None => return Err(RegistryError::NotRegistered(fd)),
        };

        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)?;
        if let Some(registration) = self.entries.get_mut(&fd) {
            registration.interest = interest;
        }
        Ok(())
    }

    /// Stop watching `fd`. Must be called exactly once per `register`,
    /// and before the descriptor is closed.
    ///
    /// On failure the entry is kept, since the kernel may still be watching.
    pub fn unregister(&mut self, fd: RawFd) -> Result<(), RegistryError> {
        if !self.entries.contains_key(&fd) {
            return Err(RegistryError::NotRegistered(fd));
        }

        syscall!(epoll_ctl(
            self.epfd.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut()
        ))?;
        self.entries.remove(&fd);
        Ok(())
    }

    /// Drop the entry for a descriptor that is about to be closed. Closing
    /// the last handle removes it from the epoll set.
    pub(crate) fn forget(&mut self, fd: RawFd) -> bool {
        self.entries.remove(&fd).is_some()
    }

    /// Block until a registered descriptor is ready or `timeout` elapses.
    ///
    /// `None` waits indefinitely. A wait interrupted by a signal returns
    /// with no events so the caller can check for shutdown.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout.map(timeout_millis).unwrap_or(-1);

        events.inner.clear();
        let n = match syscall!(epoll_wait(
            self.epfd.as_raw_fd(),
            events.inner.as_mut_ptr(),
            max_events(events.inner.capacity()),
            timeout_ms
        )) {
            Ok(n) => n as usize,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(e),
        };

        // SAFETY: the kernel initialized the first `n` entries, and `n` is
        // bounded by the capacity passed to epoll_wait.
        unsafe { events.inner.set_len(n) };
        Ok(())
    }

    /// Events currently watched for `fd`.
    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.entries.get(&fd).map(|r| r.interest)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.entries.contains_key(&fd)
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: self.interest_bits(interest),
            u64: usize::from(token) as u64,
        };
        syscall!(epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event))?;
        Ok(())
    }

    fn interest_bits(&self, interest: Interest) -> u32 {
        let mut bits = 0;
        if interest.is_readable() {
            bits |= libc::EPOLLIN | libc::EPOLLRDHUP;
        }
        if interest.is_writable() {
            bits |= libc::EPOLLOUT;
        }
        if self.mode == TriggerMode::Edge {
            bits |= libc::EPOLLET;
        }
        bits as u32
    }
}

fn max_events(capacity: usize) -> i32 {
    capacity.min(i32::MAX as usize) as i32
}

/// Round up so that a sub-millisecond timeout does not become a busy poll.
fn timeout_millis(timeout: Duration) -> i32 {
    let mut ms = timeout.as_millis();
    if Duration::from_millis(ms as u64) < timeout {
        ms += 1;
    }
    ms.min(i32::MAX as u128) as i32
}

impl AsRawFd for Registry {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd.as_raw_fd()
    }
}

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    token: Token,
    readiness: Readiness,
}

impl Event {
    /// Token supplied when the descriptor was registered.
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    fn from_raw(raw: &libc::epoll_event) -> Event {
        let bits = raw.events as libc::c_int;
        let data = raw.u64;

        let has = |flag: libc::c_int| bits & flag != 0;
        let readiness = Readiness::from_bits(
            has(libc::EPOLLIN) || has(libc::EPOLLPRI),
            has(libc::EPOLLOUT),
            has(libc::EPOLLHUP) || (has(libc::EPOLLIN) && has(libc::EPOLLRDHUP)),
            has(libc::EPOLLHUP) || (has(libc::EPOLLOUT) && has(libc::EPOLLERR)),
            has(libc::EPOLLERR),
        );

        Event {
            token: Token(data as usize),
            readiness,
        }
    }
}

/// Reusable buffer of events filled by [`Registry::wait`].
pub struct Events {
    inner: Vec<libc::epoll_event>,
}

impl Events {
    /// Room for at most `capacity` events per wait.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity.max(1)),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn get(&self, idx: usize) -> Option<Event> {
        self.inner.get(idx).map(Event::from_raw)
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.inner.iter().map(Event::from_raw)
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Registry operation errors.
#[derive(Debug)]
pub enum RegistryError {
    /// `register` on a descriptor that is already registered.
    AlreadyRegistered(RawFd),
    /// `modify` or `unregister` on a descriptor that is not registered.
    NotRegistered(RawFd),
    /// The kernel rejected the operation.
    Io(io::Error),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::AlreadyRegistered(fd) => write!(f, "descriptor {fd} is already registered"),
            RegistryError::NotRegistered(fd) => write!(f, "descriptor {fd} is not registered"),
            RegistryError::Io(e) => write!(f, "epoll error: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RegistryError {
    fn from(e: io::Error) -> Self {
        RegistryError::Io(e)
    }
}
