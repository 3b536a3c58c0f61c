//! Protocol handlers.
//!
//! A handler turns bytes buffered from a connection into bytes queued for
//! that connection. Handlers run inside the event loop between a read and
//! the following write, so they must never block: they only transform data
//! that is already buffered.
//!
//! ## Handlers
//! - `echo`: returns every byte unmodified

pub mod echo;

pub use echo::Echo;

use bytes::BytesMut;
use std::io;

/// Application logic plugged into the event loop.
///
/// `on_data` is called after each successful read with everything the
/// connection has buffered so far. The handler consumes what it understands
/// from `input` and appends its reply to `output`. Bytes left in `input` stay
/// buffered for the next call.
///
/// Returning an error closes the connection.
pub trait Handler {
    fn on_data(&self, input: &mut BytesMut, output: &mut BytesMut) -> io::Result<()>;
}
