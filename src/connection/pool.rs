//! Connection Pool
//!
//! A fixed number of connection slots plus the state every connection
//! shares: the device operation table, the engine configuration and the
//! statistics counters.
//!
//! The pool never runs anything by itself. An external driver loop adds
//! connections as the transport accepts them, calls [`ConnectionPool::step`]
//! for each live id, and removes connections that exit or fail.
//!
//! ```text
//!  accept ──> add(transport, scratch) ──> ConnectionId
//!                                            │
//!                 ┌──────────────────────────┘
//!                 ▼
//!            step(id) ──> Advanced / WouldBlock ──> step again
//!                 │
//!                 └─────> Exit / Err ──> remove(id)
//! ```

use crate::config::EngineConfig;
use crate::connection::handler::{Connection, ConnectionError, EngineContext, State, StepOutcome};
use crate::connection::transport::Transport;
use crate::ops::{DeviceOps, OpContext};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Identifies a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub usize);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors returned when registering a connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot is taken
    #[error("connection pool is full ({capacity} slots)")]
    Full { capacity: usize },

    /// The scratch buffer has no room for payload bytes
    #[error("scratch buffer must not be empty")]
    EmptyScratch,
}

/// Statistics for the pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of connections registered
    pub connections_accepted: AtomicU64,
    /// Currently registered connections
    pub active_connections: AtomicU64,
    /// Total request lines parsed
    pub commands_processed: AtomicU64,
    /// Total bytes received
    pub bytes_read: AtomicU64,
    /// Total bytes sent
    pub bytes_written: AtomicU64,
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Fixed-capacity registry of live connections.
pub struct ConnectionPool {
    slots: Vec<Option<Connection>>,
    env: EngineContext,
    /// Slot where the next round-robin pass starts
    cursor: usize,
}

impl ConnectionPool {
    /// Creates a pool with `config.max_connections` free slots.
    pub fn new(ops: Arc<dyn DeviceOps>, config: EngineConfig) -> Self {
        let capacity = config.max_connections;
        let stats = Arc::new(PoolStats::new());

        Self {
            slots: (0..capacity).map(|_| None).collect(),
            env: EngineContext::new(ops, config, stats),
            cursor: 0,
        }
    }

    /// Registers a connection.
    ///
    /// `scratch` holds attribute values and bulk samples for this
    /// connection; its length bounds WRITE payloads and buffer chunks. It
    /// is handed back by [`remove`](Self::remove).
    pub fn add<T>(&mut self, transport: T, scratch: Vec<u8>) -> Result<ConnectionId, PoolError>
    where
        T: Transport + 'static,
    {
        if scratch.is_empty() {
            return Err(PoolError::EmptyScratch);
        }

        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(PoolError::Full {
                capacity: self.slots.len(),
            })?;

        let id = ConnectionId(index);
        self.slots[index] = Some(Connection::new(
            id,
            Box::new(transport),
            scratch,
            self.env.config.line_size,
        ));
        self.env.stats.connection_opened();
        info!(conn = %id, "Connection registered");

        Ok(id)
    }

    /// Releases a slot, returning the transport and scratch buffer.
    ///
    /// A buffer the connection still has open is closed on its device.
    pub fn remove(&mut self, id: ConnectionId) -> Option<(Box<dyn Transport>, Vec<u8>)> {
        let conn = self.slots.get_mut(id.0)?.take()?;
        if let Some(open) = conn.open_buffer() {
            let closed = self.env.ops.close(&OpContext::new(id), &open.device);
            warn!(
                conn = %id,
                device = %open.device,
                cyclic = open.cyclic,
                closed,
                "Closing buffer left open"
            );
        }
        self.env.stats.connection_closed();
        debug!(conn = %id, state = ?conn.state(), "Connection removed");
        Some(conn.into_parts())
    }

    /// Advances one connection by one state.
    pub fn step(&mut self, id: ConnectionId) -> Result<StepOutcome, ConnectionError> {
        match self.slots.get_mut(id.0) {
            Some(Some(conn)) => conn.step(&self.env),
            _ => Err(ConnectionError::UnknownConnection(id)),
        }
    }

    /// Steps every live connection once, starting one slot further along
    /// each call.
    pub fn step_all(&mut self) -> Vec<(ConnectionId, Result<StepOutcome, ConnectionError>)> {
        let capacity = self.slots.len();
        if capacity == 0 {
            return Vec::new();
        }

        let start = self.cursor % capacity;
        self.cursor = (start + 1) % capacity;

        let mut outcomes = Vec::new();
        for offset in 0..capacity {
            let index = (start + offset) % capacity;
            if let Some(conn) = self.slots[index].as_mut() {
                outcomes.push((ConnectionId(index), conn.step(&self.env)));
            }
        }
        outcomes
    }

    /// Returns a live connection.
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    /// Returns the state of a live connection.
    pub fn state(&self, id: ConnectionId) -> Option<State> {
        self.get(id).map(Connection::state)
    }

    /// Ids of every live connection in slot order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| ConnectionId(index))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.env.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.env.stats)
    }
}
