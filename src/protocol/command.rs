//! IIOD Command Descriptors
//!
//! This module defines the data types produced by the command parser.
//! A [`Command`] is an ephemeral description of one request line: which
//! operation the client asked for and the arguments that operation needs.
//!
//! ## Wire Format
//!
//! Every request is a single ASCII line, tokens separated by spaces:
//!
//! ```text
//! OPEN iio:device0 400 3 CYCLIC
//! READ iio:device0 INPUT voltage0 raw
//! WRITE iio:device0 OUTPUT altvoltage0 frequency 8
//! READBUF iio:device0 4096
//! ```
//!
//! Fields that are not meaningful for a given command kind are left at
//! their default (zero / empty) value.

use std::fmt;

/// Every command understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommandKind {
    /// `HELP` (not implemented, always answers with a failure)
    #[default]
    Help,
    /// `EXIT` - terminate the connection
    Exit,
    /// `PRINT` - send the context XML
    Print,
    /// `VERSION` - send the protocol version string
    Version,
    /// `BINARY` - switch the connection to length-prefixed framing
    Binary,
    /// `TIMEOUT <ms>`
    Timeout,
    /// `OPEN <dev> <samples> <mask> [CYCLIC]`
    Open,
    /// `CLOSE <dev>`
    Close,
    /// `READ <dev> [target] [attr]`
    Read,
    /// `WRITE <dev> [target] [attr] <bytes>`
    Write,
    /// `READBUF <dev> <bytes>`
    ReadBuf,
    /// `WRITEBUF <dev> <bytes>`
    WriteBuf,
    /// `GETTRIG <dev>`
    GetTrig,
    /// `SETTRIG <dev> [trigger]`
    SetTrig,
    /// `SET <dev> BUFFERS_COUNT <count>`
    Set,
}

impl CommandKind {
    /// Returns the wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Help => "HELP",
            CommandKind::Exit => "EXIT",
            CommandKind::Print => "PRINT",
            CommandKind::Version => "VERSION",
            CommandKind::Binary => "BINARY",
            CommandKind::Timeout => "TIMEOUT",
            CommandKind::Open => "OPEN",
            CommandKind::Close => "CLOSE",
            CommandKind::Read => "READ",
            CommandKind::Write => "WRITE",
            CommandKind::ReadBuf => "READBUF",
            CommandKind::WriteBuf => "WRITEBUF",
            CommandKind::GetTrig => "GETTRIG",
            CommandKind::SetTrig => "SETTRIG",
            CommandKind::Set => "SET",
        }
    }

    /// Returns true for the two bulk-transfer commands.
    #[inline]
    pub fn is_buffer_transfer(&self) -> bool {
        matches!(self, CommandKind::ReadBuf | CommandKind::WriteBuf)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The scope an attribute read or write applies to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AttrTarget {
    /// A device-level attribute
    #[default]
    Device,
    /// A debug attribute (`DEBUG`)
    Debug,
    /// A buffer attribute (`BUFFER`)
    Buffer,
    /// A channel attribute (`INPUT <ch>` or `OUTPUT <ch>`)
    Channel {
        /// Channel id, e.g. `voltage0`
        id: String,
        /// True for `OUTPUT`, false for `INPUT`
        output: bool,
    },
}

impl AttrTarget {
    /// Creates an input channel target.
    pub fn input(id: impl Into<String>) -> Self {
        AttrTarget::Channel {
            id: id.into(),
            output: false,
        }
    }

    /// Creates an output channel target.
    pub fn output(id: impl Into<String>) -> Self {
        AttrTarget::Channel {
            id: id.into(),
            output: true,
        }
    }
}

impl fmt::Display for AttrTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrTarget::Device => f.write_str("device"),
            AttrTarget::Debug => f.write_str("DEBUG"),
            AttrTarget::Buffer => f.write_str("BUFFER"),
            AttrTarget::Channel { id, output: false } => write!(f, "INPUT {}", id),
            AttrTarget::Channel { id, output: true } => write!(f, "OUTPUT {}", id),
        }
    }
}

/// A parsed request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Command {
    /// Which command this is
    pub kind: CommandKind,
    /// Target device name (empty for device-less commands)
    pub device: String,
    /// Attribute scope for READ / WRITE
    pub target: AttrTarget,
    /// Attribute name for READ / WRITE (None = device default)
    pub attr: Option<String>,
    /// Trigger name for SETTRIG (None = detach trigger)
    pub trigger: Option<String>,
    /// Samples per buffer for OPEN
    pub sample_count: usize,
    /// Channel mask for OPEN
    pub mask: u32,
    /// Cyclic flag for OPEN
    pub cyclic: bool,
    /// Payload size for WRITE, READBUF and WRITEBUF
    pub bytes_count: usize,
    /// Buffer count for SET
    pub buffers_count: u32,
    /// Timeout for TIMEOUT, in milliseconds
    pub timeout_ms: u32,
}

impl Command {
    /// Creates a command of the given kind with every argument defaulted.
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// Creates a command of the given kind targeting a device.
    pub fn with_device(kind: CommandKind, device: impl Into<String>) -> Self {
        Self {
            kind,
            device: device.into(),
            ..Default::default()
        }
    }
}
