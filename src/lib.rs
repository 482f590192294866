//! # nbiiod - A Non-Blocking IIO Daemon Protocol Engine
//!
//! nbiiod serves the IIO network-daemon protocol: remote clients open
//! devices, read and write attributes, and stream samples to and from
//! ADCs, DACs and sensors. The engine is a set of cooperative state
//! machines that never block, so one thread can serve many clients
//! without threads or an async runtime inside the engine itself.
//!
//! ## Features
//!
//! - **Non-Blocking**: every step returns as soon as I/O would block
//! - **Bounded Memory**: fixed line buffers and caller-supplied scratch
//!   buffers, nothing grows per request
//! - **Bulk Streaming**: chunked READBUF / WRITEBUF and cyclic output
//!   buffers
//! - **Pluggable Devices**: drivers implement the [`DeviceOps`] trait
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                nbiiod                                   │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────────────────────────┐                 │
//! │  │ TCP driver  │───>│         ConnectionPool          │                 │
//! │  │ (server.rs) │    │  ┌────────────┐ ┌────────────┐  │                 │
//! │  └─────────────┘    │  │ Connection │ │ Connection │  │                 │
//! │                     │  │  (state    │ │  (state    │  │                 │
//! │                     │  │  machine)  │ │  machine)  │  │                 │
//! │                     │  └─────┬──────┘ └─────┬──────┘  │                 │
//! │                     └────────┼──────────────┼─────────┘                 │
//! │                              │              │                           │
//! │          ┌───────────────────┘              └──────────┐                │
//! │          ▼                                             ▼                │
//! │  ┌─────────────┐                               ┌──────────────┐         │
//! │  │  Command    │                               │  DeviceOps   │         │
//! │  │  Parser     │                               │ (your driver │         │
//! │  └─────────────┘                               │ or Loopback) │         │
//! │                                                └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use nbiiod::{serve, ConnectionPool, EngineConfig, LoopbackOps};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let ops = Arc::new(LoopbackOps::new(["iio:device0"]));
//!     let pool = ConnectionPool::new(ops, EngineConfig::default());
//!
//!     let listener = TcpListener::bind("0.0.0.0:30431").await?;
//!     serve(listener, pool).await
//! }
//! ```
//!
//! ## Supported Commands
//!
//! - `HELP`, `EXIT`, `PRINT`, `VERSION`, `BINARY`
//! - `TIMEOUT <ms>`
//! - `OPEN <dev> <samples> <mask> [CYCLIC]` / `CLOSE <dev>`
//! - `READ <dev> [DEBUG|BUFFER|INPUT <ch>|OUTPUT <ch>] [attr]`
//! - `WRITE <dev> [DEBUG|BUFFER|INPUT <ch>|OUTPUT <ch>] [attr] <bytes>`
//! - `READBUF <dev> <bytes>` / `WRITEBUF <dev> <bytes>`
//! - `GETTRIG <dev>` / `SETTRIG <dev> [trigger]`
//! - `SET <dev> BUFFERS_COUNT <n>`
//!
//! ## Module Overview
//!
//! - [`protocol`]: Command descriptors and the line parser
//! - [`connection`]: State machine, buffer streaming and the pool
//! - [`ops`]: The device operation table and an in-memory implementation
//! - [`config`]: Engine configuration
//! - [`server`]: A tokio TCP driver for the pool

pub mod config;
pub mod connection;
pub mod ops;
pub mod protocol;
pub mod server;

// Re-export commonly used types for convenience
pub use config::EngineConfig;
pub use connection::{
    ConnectionError, ConnectionId, ConnectionPool, PoolError, PoolStats, State, StepOutcome,
    Transport,
};
pub use ops::{DeviceOps, LoopbackOps, NoOps, OpContext};
pub use protocol::{parse_command, Command, CommandKind, ParseError};
pub use server::serve;

/// The default port nbiiod listens on (same as iiod)
pub const DEFAULT_PORT: u16 = 30431;

/// The default host nbiiod binds to
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Version of nbiiod
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
