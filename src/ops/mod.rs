//! Device Operations Module
//!
//! This module defines the boundary between the protocol engine and the
//! device drivers that actually read attributes and move samples.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ Connection      │  (connection module)
//! │ State Machine   │
//! └────────┬────────┘
//!          │ OpContext + command arguments
//!          ▼
//! ┌─────────────────┐
//! │   DeviceOps     │  (this module)
//! │                 │
//! │  - LoopbackOps  │  in-memory devices
//! │  - your driver  │
//! └─────────────────┘
//! ```
//!
//! - `dispatcher`: The [`DeviceOps`] trait and its `-ENOSYS` defaults
//! - `loopback`: An in-memory implementation for demos and tests

pub mod dispatcher;
pub mod loopback;

// Re-export commonly used types
pub use dispatcher::{DeviceOps, NoOps, OpContext};
pub use loopback::LoopbackOps;

/// Error numbers used in negative results.
///
/// Values match Linux so that libiio clients print the usual messages.
pub mod errno {
    pub const ENOENT: isize = 2;
    pub const EIO: isize = 5;
    pub const ENOMEM: isize = 12;
    pub const EBUSY: isize = 16;
    pub const ENODEV: isize = 19;
    pub const EINVAL: isize = 22;
    pub const ENOSYS: isize = 38;
}
