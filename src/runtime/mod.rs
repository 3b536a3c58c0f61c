//! Readiness-based runtime for non-blocking networking.
//!
//! Layers, leaf first:
//! - `socket`: non-blocking accept/read/write with explicit outcomes
//! - `registry`: epoll wrapper tracking watched descriptors
//! - `connection`: per-client buffers and state machine
//! - `event_loop`: the dispatcher tying them together
//!
//! Each `EventLoop` is self-contained. Parallelism comes from running several
//! loops on separate threads, each with its own registry, connections and
//! listener. The listeners share the port through `SO_REUSEPORT`.

/// Call a libc function, turning `-1` into the last OS error.
macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)? ) ) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg),*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

mod connection;
mod event_loop;
mod interest;
mod registry;
pub mod socket;

pub use connection::{
    BufferLimits, CloseReason, ConnError, ConnState, Connection, FlushOutcome, ReadDrain,
};
pub use event_loop::{EventLoop, LoopStats};
pub use interest::{Interest, Readiness};
pub use registry::{Event, Events, Registry, RegistryError};

use crate::config::ConfigError;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative stop signal shared by every event loop of a server.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every loop to stop after its current wait.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Errors that stop the server. Per-connection failures never surface here.
#[derive(Debug)]
pub enum ServerError {
    Config(ConfigError),
    /// The epoll instance could not be created.
    Registry(io::Error),
    Bind { addr: SocketAddr, source: io::Error },
    /// The listener could not be registered.
    Listener(RegistryError),
    /// Waiting for readiness failed.
    Wait(io::Error),
    Spawn(io::Error),
    WorkerPanicked(usize),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Config(e) => write!(f, "{e}"),
            ServerError::Registry(e) => write!(f, "Failed to create readiness registry: {e}"),
            ServerError::Bind { addr, source } => write!(f, "Failed to listen on {addr}: {source}"),
            ServerError::Listener(e) => write!(f, "Failed to register listener: {e}"),
            ServerError::Wait(e) => write!(f, "Readiness wait failed: {e}"),
            ServerError::Spawn(e) => write!(f, "Failed to spawn worker thread: {e}"),
            ServerError::WorkerPanicked(id) => write!(f, "Worker {id} panicked"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Config(e) => Some(e),
            ServerError::Registry(e)
            | ServerError::Wait(e)
            | ServerError::Spawn(e)
            | ServerError::Bind { source: e, .. } => Some(e),
            ServerError::Listener(e) => Some(e),
            ServerError::WorkerPanicked(_) => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        ServerError::Config(e)
    }
}
