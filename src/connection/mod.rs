//! Connection Engine Module
//!
//! This module owns the per-client state machines and the pool that holds
//! them. Nothing in here waits on I/O: the driver loop decides when to
//! step which connection, and every step returns as soon as the transport
//! would block.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Driver loop (server.rs)                     │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ add / step / remove
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ConnectionPool                            │
//! │                                                             │
//! │  ┌─────────────┐  ┌─────────────┐        ┌─────────────┐    │
//! │  │ Connection  │  │ Connection  │  ...   │   (free)    │    │
//! │  │ state mach. │  │ state mach. │        │             │    │
//! │  └──────┬──────┘  └──────┬──────┘        └─────────────┘    │
//! └─────────┼────────────────┼──────────────────────────────────┘
//!           │                │
//!           ▼                ▼
//!      Transport        DeviceOps
//!   (recv / send)    (open, read_attr, ...)
//! ```
//!
//! ## Modules
//!
//! - `transport`: The non-blocking byte stream boundary
//! - `cursor`: Resumable progress through partial transfers
//! - `handler`: The request/response state machine
//! - `stream`: READBUF / WRITEBUF chunking and cyclic push
//! - `pool`: Fixed-capacity slots, ids and statistics
//!
//! ## Example
//!
//! ```ignore
//! use nbiiod::config::EngineConfig;
//! use nbiiod::connection::{ConnectionPool, StepOutcome};
//! use nbiiod::ops::LoopbackOps;
//! use std::sync::Arc;
//!
//! let mut pool = ConnectionPool::new(Arc::new(LoopbackOps::new(["dev0"])), EngineConfig::default());
//! let id = pool.add(stream, vec![0; 64 * 1024])?;
//!
//! loop {
//!     match pool.step(id) {
//!         Ok(StepOutcome::Advanced) => continue,
//!         Ok(StepOutcome::WouldBlock) => wait_for_io(),
//!         Ok(StepOutcome::Exit) | Err(_) => break,
//!     }
//! }
//! pool.remove(id);
//! ```

pub mod cursor;
pub mod handler;
pub mod pool;
pub mod stream;
pub mod transport;

// Re-export commonly used types
pub use cursor::BufferCursor;
pub use handler::{Connection, ConnectionError, Framing, OpenBuffer, State, StepOutcome};
pub use pool::{ConnectionId, ConnectionPool, PoolError, PoolStats};
pub use transport::Transport;
