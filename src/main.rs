//! edge-echo: a non-blocking TCP echo server
//!
//! Features:
//! - Edge- or level-triggered epoll event loop
//! - Optional multiple independent loops sharing one port
//! - Per-connection backpressure with bounded buffers
//! - Configuration via CLI arguments or TOML file

use edge_echo::config::Config;
use edge_echo::runtime::Shutdown;
use edge_echo::server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        workers = config.worker_count(),
        trigger = ?config.trigger,
        max_connections = config.max_connections,
        "Starting edge-echo server"
    );

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown requested");
        signal.trigger();
    })?;

    server::run(&config, &shutdown)?;
    Ok(())
}
