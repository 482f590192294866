//! IIOD Command Protocol
//!
//! This module turns one request line into a typed [`Command`].
//!
//! ## Overview
//!
//! Requests are whitespace-separated ASCII words. The first word names the
//! command (upper case), the rest are its arguments:
//!
//! ```text
//! OPEN iio:device0 1024 0x3 CYCLIC
//! READ iio:device0 INPUT voltage0 raw
//! WRITE iio:device0 DEBUG direct_reg_access 4
//! READBUF iio:device0 4096
//! ```
//!
//! Numbers are unsigned decimal, except channel masks which are hex.
//! Malformed requests produce a [`ParseError`], which the connection
//! reports as `-EINVAL` without closing the session.
//!
//! ## Modules
//!
//! - `command`: The `Command` record and its argument types
//! - `parser`: The keyword table and the line parser

pub mod command;
pub mod parser;

// Re-export commonly used types for convenience
pub use command::{AttrTarget, Command, CommandKind};
pub use parser::{lookup_command, parse_command, parse_command_bytes, ParseError, ParseResult};
