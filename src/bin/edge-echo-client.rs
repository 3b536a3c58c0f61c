//! Smoke-test client for edge-echo.
//!
//! Sends one payload per interval over a single connection and checks that
//! the exact same bytes come back. Without `--message` the payload is the
//! sequence number.

use clap::Parser;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "edge-echo-client")]
#[command(version = "0.1.0")]
#[command(about = "Send payloads to an echo server and verify the replies", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:8000")]
    connect: String,

    /// Delay between payloads, in milliseconds
    #[arg(short, long, default_value_t = 1000)]
    interval_ms: u64,

    /// Number of payloads to send (0 = until interrupted)
    #[arg(short = 'n', long, default_value_t = 0)]
    count: u64,

    /// Fixed payload instead of the sequence number
    #[arg(short, long)]
    message: Option<String>,

    /// Seconds to wait for each reply
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut stream = TcpStream::connect(&args.connect)?;
    stream.set_read_timeout(Some(Duration::from_secs(args.timeout)))?;
    stream.set_nodelay(true)?;
    info!(addr = %args.connect, "Connected to server");

    let interval = Duration::from_millis(args.interval_ms);
    let mut seq = 0u64;

    while args.count == 0 || seq < args.count {
        if seq > 0 {
            thread::sleep(interval);
        }

        let payload = match &args.message {
            Some(message) => message.as_bytes().to_vec(),
            None => seq.to_string().into_bytes(),
        };

        let started = Instant::now();
        round_trip(&mut stream, &payload)?;
        info!(
            seq,
            bytes = payload.len(),
            rtt_us = started.elapsed().as_micros() as u64,
            payload = %String::from_utf8_lossy(&payload),
            "Echo received"
        );
        seq += 1;
    }

    // Half-close and confirm the server has nothing left for us.
    stream.shutdown(Shutdown::Write)?;
    let mut trailing = Vec::new();
    stream.read_to_end(&mut trailing)?;
    if !trailing.is_empty() {
        warn!(bytes = trailing.len(), "Unexpected trailing data");
    }
    info!(sent = seq, "Done");
    Ok(())
}

/// Write `payload` and read back exactly as many bytes.
fn round_trip(stream: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
    stream.write_all(payload)?;

    let mut echoed = vec![0u8; payload.len()];
    stream.read_exact(&mut echoed)?;

    if echoed != payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "echoed bytes differ from payload",
        ));
    }
    Ok(())
}
