//! TCP echo server built from independent event loops.
//!
//! Every loop is bound up front on the calling thread, so address and
//! registry failures are reported before any worker starts. Each loop then
//! runs on its own thread until the shared [`Shutdown`] is triggered.

use crate::config::Config;
use crate::protocols::{Echo, Handler};
use crate::runtime::{EventLoop, LoopStats, ServerError, Shutdown};
use std::net::SocketAddr;
use std::thread;
use tracing::{error, info};

/// Server instance
pub struct Server<H = Echo> {
    loops: Vec<EventLoop<H>>,
    addr: SocketAddr,
}

impl<H> Server<H>
where
    H: Handler + Clone + Send + 'static,
{
    /// Bind one event loop per configured worker.
    ///
    /// With port 0 the first loop picks the port and the rest share it.
    pub fn bind(config: &Config, handler: H) -> Result<Self, ServerError> {
        config.validate()?;

        let workers = config.worker_count();
        let mut addr = config.addr()?;
        let mut loops = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let event_loop = EventLoop::bind_addr(worker_id, addr, config, handler.clone())?;
            if worker_id == 0 {
                addr = event_loop
                    .local_addr()
                    .map_err(|source| ServerError::Bind { addr, source })?;
            }
            loops.push(event_loop);
        }

        info!(
            workers,
            addr = %addr,
            trigger = ?config.trigger,
            backlog = config.backlog,
            max_output = config.max_output,
            "Server listening"
        );

        Ok(Server { loops, addr })
    }

    /// Address shared by every loop's listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Run every loop on its own thread until `shutdown` is triggered or a
    /// loop fails. A failing loop triggers shutdown for the others.
    pub fn run(self, shutdown: &Shutdown) -> Result<Vec<LoopStats>, ServerError> {
        let mut handles = Vec::with_capacity(self.loops.len());
        let mut spawn_error = None;

        for mut event_loop in self.loops {
            let worker_id = event_loop.worker_id();
            let worker_shutdown = shutdown.clone();

            let spawned = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || {
                    let result = event_loop.run(&worker_shutdown);
                    if result.is_err() {
                        worker_shutdown.trigger();
                    }
                    result
                });

            match spawned {
                Ok(handle) => handles.push((worker_id, handle)),
                Err(e) => {
                    shutdown.trigger();
                    spawn_error = Some(ServerError::Spawn(e));
                    break;
                }
            }
        }

        let mut stats = Vec::with_capacity(handles.len());
        let mut first_error = spawn_error;

        // Wait for all workers
        for (worker_id, handle) in handles {
            match handle.join() {
                Ok(Ok(worker_stats)) => stats.push(worker_stats),
                Ok(Err(e)) => {
                    error!(worker = worker_id, error = %e, "Worker failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(_) => {
                    error!(worker = worker_id, "Worker panicked");
                    shutdown.trigger();
                    if first_error.is_none() {
                        first_error = Some(ServerError::WorkerPanicked(worker_id));
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

/// Bind the echo server described by `config` and run it until `shutdown`.
pub fn run(config: &Config, shutdown: &Shutdown) -> Result<LoopStats, ServerError> {
    let server = Server::bind(config, Echo)?;
    let per_worker = server.run(shutdown)?;

    let mut total = LoopStats::default();
    for stats in &per_worker {
        total.merge(stats);
    }

    info!(
        accepted = total.accepted,
        closed = total.closed,
        bytes_received = total.bytes_received,
        bytes_sent = total.bytes_sent,
        "Server stopped"
    );
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    fn config(workers: usize) -> Config {
        Config {
            port: 0,
            workers,
            poll_timeout_ms: 10,
            ..Config::default()
        }
    }

    #[test]
    fn test_workers_share_one_port() {
        let server = Server::bind(&config(3), Echo).unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.loops.len(), 3);
        for event_loop in &server.loops {
            assert_eq!(event_loop.local_addr().unwrap(), server.local_addr());
        }
    }

    #[test]
    fn test_server_echoes_and_stops() {
        let server = Server::bind(&config(2), Echo).unwrap();
        let addr = server.local_addr();
        let shutdown = Shutdown::new();

        let runner = {
            let shutdown = shutdown.clone();
            thread::spawn(move || server.run(&shutdown))
        };

        let mut clients = Vec::new();
        for i in 0..4u8 {
            let mut client = TcpStream::connect(addr).unwrap();
            client
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            let message = [b'a' + i; 32];
            client.write_all(&message).unwrap();

            let mut echoed = [0u8; 32];
            client.read_exact(&mut echoed).unwrap();
            assert_eq!(echoed, message);
            clients.push(client);
        }

        shutdown.trigger();
        let stats = runner.join().unwrap().unwrap();

        let mut total = LoopStats::default();
        for s in &stats {
            total.merge(s);
        }
        assert_eq!(stats.len(), 2);
        assert_eq!(total.accepted, 4);
        assert_eq!(total.closed, 4);
        assert_eq!(total.bytes_sent, 4 * 32);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = Config {
            read_chunk: 0,
            ..config(1)
        };
        assert!(matches!(
            Server::bind(&config, Echo),
            Err(ServerError::Config(_))
        ));
    }
}
