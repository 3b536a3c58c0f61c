//! Echo protocol implementation.
//!
//! Raw byte-stream echo: whatever arrives on a connection is written back
//! to it, byte for byte and in order. There is no framing, no length prefix
//! and no negotiation.
//!
//! ```text
//! Client sends:  hello
//! Server sends:  hello
//! ```

use super::Handler;
use bytes::BytesMut;
use std::io;

/// Copies input to output unmodified.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl Handler for Echo {
    fn on_data(&self, input: &mut BytesMut, output: &mut BytesMut) -> io::Result<()> {
        if output.is_empty() {
            // Nothing queued ahead of us: hand the buffer over without copying.
            output.unsplit(input.split());
        } else {
            output.extend_from_slice(input);
            input.clear();
        }
        Ok(())
    }
}
