//! TCP Driver Loop
//!
//! Binds the engine to TCP. Accepted sockets are taken out of the tokio
//! reactor, switched to non-blocking std sockets and handed to the pool;
//! from then on the loop below steps them round-robin.
//!
//! ```text
//!   ┌────────────────────────────────────────────┐
//!   │ loop                                       │
//!   │   step_all()  ──> remove exited / failed   │
//!   │   select!                                  │
//!   │     accept()       ──> pool.add(...)       │
//!   │     yield / sleep(poll_interval)           │
//!   └────────────────────────────────────────────┘
//! ```
//!
//! The whole engine runs on one task. A round where no connection made
//! progress is followed by a `poll_interval` sleep so idle sessions do not
//! spin the CPU.

use crate::connection::{ConnectionError, ConnectionId, ConnectionPool, StepOutcome};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Runs the engine on `listener` until the future is dropped or accepting
/// fails permanently.
pub async fn serve(listener: TcpListener, mut pool: ConnectionPool) -> io::Result<()> {
    let scratch_size = pool.config().scratch_size;
    let poll_interval = pool.config().poll_interval;
    let mut peers: HashMap<ConnectionId, SocketAddr> = HashMap::new();

    info!(addr = %listener.local_addr()?, "Engine ready");

    loop {
        let busy = run_round(&mut pool, &mut peers);

        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if let Some(id) = register(&mut pool, stream, addr, scratch_size) {
                        peers.insert(id, addr);
                    }
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            _ = pause(busy, poll_interval) => {}
        }
    }
}

/// Yields after a busy round, sleeps after an idle one.
async fn pause(busy: bool, poll_interval: Duration) {
    if busy {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(poll_interval).await;
    }
}

/// Steps every connection once. Returns true if any of them advanced.
fn run_round(pool: &mut ConnectionPool, peers: &mut HashMap<ConnectionId, SocketAddr>) -> bool {
    let mut busy = false;

    for (id, outcome) in pool.step_all() {
        let addr = peers.get(&id).copied();

        match outcome {
            Ok(StepOutcome::Advanced) => busy = true,
            Ok(StepOutcome::WouldBlock) => {}
            Ok(StepOutcome::Exit) => {
                info!(conn = %id, client = ?addr, "Client exited");
                release(pool, peers, id);
            }
            Err(e) => {
                log_connection_error(id, addr, &e);
                release(pool, peers, id);
            }
        }
    }

    busy
}

fn register(
    pool: &mut ConnectionPool,
    stream: TcpStream,
    addr: SocketAddr,
    scratch_size: usize,
) -> Option<ConnectionId> {
    let stream = match into_nonblocking(stream) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(client = %addr, error = %e, "Failed to prepare socket");
            return None;
        }
    };

    match pool.add(stream, vec![0u8; scratch_size]) {
        Ok(id) => {
            info!(conn = %id, client = %addr, "Client connected");
            Some(id)
        }
        Err(e) => {
            warn!(client = %addr, error = %e, "Rejecting connection");
            None
        }
    }
}

fn into_nonblocking(stream: TcpStream) -> io::Result<std::net::TcpStream> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn release(
    pool: &mut ConnectionPool,
    peers: &mut HashMap<ConnectionId, SocketAddr>,
    id: ConnectionId,
) {
    peers.remove(&id);
    pool.remove(id);
}

fn log_connection_error(id: ConnectionId, addr: Option<SocketAddr>, err: &ConnectionError) {
    match err {
        ConnectionError::ClientDisconnected => {
            debug!(conn = %id, client = ?addr, "Client disconnected");
        }
        ConnectionError::IoError(e) if e.kind() == io::ErrorKind::ConnectionReset => {
            debug!(conn = %id, client = ?addr, "Connection reset by peer");
        }
        _ => {
            warn!(conn = %id, client = ?addr, error = %err, "Connection error");
        }
    }
}
