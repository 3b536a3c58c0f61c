//! edge-echo: a readiness-based, non-blocking TCP echo server.
//!
//! One thread multiplexes many connections over a single epoll instance.
//! Sockets never block; the only suspension point is the registry wait.
//! Bytes received on a connection are written back to it unchanged and in
//! order, with bounded buffering per connection.
//!
//! Modules:
//! - `config`: CLI and TOML configuration
//! - `protocols`: the handler seam and the echo handler
//! - `runtime`: sockets, registry, connections and the event loop
//! - `server`: runs one event loop per worker thread

#[cfg(not(target_os = "linux"))]
compile_error!("edge-echo requires Linux epoll");

pub mod config;
pub mod protocols;
pub mod runtime;
pub mod server;

pub use config::{Config, TriggerMode};
pub use runtime::{EventLoop, LoopStats, ServerError, Shutdown};
pub use server::Server;
