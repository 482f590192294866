//! Connection State Machine
//!
//! This module drives a single client session. Nothing here blocks: each
//! call to [`Connection::step`] performs the work of the current state and
//! returns as soon as the transport (or the device) cannot make progress.
//!
//! ## Command Lifecycle
//!
//! ```text
//!            ┌──────────────┐
//!     ┌─────>│ ReadingLine  │─────── WRITE ───────┐
//!     │      └──────┬───────┘                     ▼
//!     │             │ parsed            ┌──────────────────┐
//!     │             ▼                   │ ReadingWriteData │
//!     │      ┌──────────────┐<──────────┴──────────────────┘
//!     │      │  RunningCmd  │<──────── CLOSE ────────┐
//!     │      └──────┬───────┘                        │
//!     │             ▼                                │
//!     │   ┌──────────────────┐  READBUF   ┌───────┐  │
//!     │   │ WritingCmdResult │──WRITEBUF─>│ RwBuf │  │
//!     │   └────────┬─────────┘<───ack─────└───────┘  │
//!     │            │ cyclic buffer open              │
//!     │            ├───────────────>┌──────────────────┐
//!     │            ▼                │ PushCyclicBuffer │
//!     │      ┌──────────┐<──────────└──────────────────┘
//!     └──────│ LineDone │   push failure
//!            └──────────┘
//! ```
//!
//! ## Suspension
//!
//! A transport reporting would-block makes the step return
//! [`StepOutcome::WouldBlock`] with all progress kept: partially received
//! lines stay in the line buffer and partially sent responses resume from
//! their [`BufferCursor`]. Hard I/O errors are returned as
//! [`ConnectionError`] and the caller must remove the connection.

use crate::config::EngineConfig;
use crate::connection::cursor::BufferCursor;
use crate::connection::pool::{ConnectionId, PoolStats};
use crate::connection::stream::Transfer;
use crate::connection::transport::{is_retryable, Transport};
use crate::ops::{errno, DeviceOps, OpContext};
use crate::protocol::{parse_command_bytes, Command, CommandKind};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tracing::{debug, trace};

/// The state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    /// Assembling the next request
    #[default]
    ReadingLine,
    /// Receiving the payload announced by a WRITE
    ReadingWriteData,
    /// Executing the parsed command
    RunningCmd,
    /// Sending the numeric result and any attached payload
    WritingCmdResult,
    /// Streaming READBUF / WRITEBUF data
    RwBuf,
    /// Pushing a cyclic buffer until CLOSE arrives
    PushCyclicBuffer,
    /// Resetting per-command scratch state
    LineDone,
}

/// What a call to [`Connection::step`] achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Work was done; step again
    Advanced,
    /// Nothing can move right now; step again later
    WouldBlock,
    /// The client sent EXIT; remove the connection
    Exit,
}

/// How requests and responses are framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Newline-terminated text
    #[default]
    Ascii,
    /// Length-prefixed requests, little-endian numeric results
    Binary,
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Client closed its end of the stream
    #[error("Client disconnected")]
    ClientDisconnected,

    /// A request did not fit in the line buffer
    #[error("Line too long (max: {max} bytes)")]
    LineTooLong { max: usize },

    /// A WRITE announced more data than the scratch buffer holds
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A device error cut a READBUF short after raw bytes were sent
    #[error("Buffer transfer aborted after {sent} bytes (error {code})")]
    TransferAborted { code: isize, sent: usize },

    /// The id does not name a live connection
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

/// State shared by every connection of a pool.
pub(crate) struct EngineContext {
    pub(crate) ops: Arc<dyn DeviceOps>,
    pub(crate) config: EngineConfig,
    pub(crate) version: Bytes,
    pub(crate) stats: Arc<PoolStats>,
}

impl EngineContext {
    pub(crate) fn new(ops: Arc<dyn DeviceOps>, config: EngineConfig, stats: Arc<PoolStats>) -> Self {
        let version = Bytes::from(config.version_string());
        Self {
            ops,
            config,
            version,
            stats,
        }
    }
}

/// Bytes attached to a result after the numeric value.
#[derive(Debug, Clone, Default)]
pub(crate) enum Payload {
    #[default]
    None,
    /// The first `n` bytes of the scratch buffer
    Scratch(usize),
    /// A shared buffer such as the context XML
    Shared(Bytes),
}

impl Payload {
    fn len(&self) -> Option<usize> {
        match self {
            Payload::None => None,
            Payload::Scratch(n) => Some(*n),
            Payload::Shared(bytes) => Some(bytes.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum WriteStage {
    #[default]
    Value,
    Payload,
    Trailer,
    Done,
}

impl WriteStage {
    fn next(self) -> Self {
        match self {
            WriteStage::Value => WriteStage::Payload,
            WriteStage::Payload => WriteStage::Trailer,
            WriteStage::Trailer | WriteStage::Done => WriteStage::Done,
        }
    }
}

/// The response to one command.
#[derive(Debug, Default)]
pub(crate) struct ResultRecord {
    pub(crate) value: isize,
    pub(crate) write_val: bool,
    pub(crate) payload: Payload,
    stage: WriteStage,
    cursor: BufferCursor,
}

impl ResultRecord {
    /// A bare numeric result.
    pub(crate) fn value(value: isize) -> Self {
        Self {
            value,
            write_val: true,
            ..Default::default()
        }
    }

    /// A numeric result followed by a payload.
    pub(crate) fn with_payload(value: isize, payload: Payload) -> Self {
        Self {
            value,
            write_val: true,
            payload,
            ..Default::default()
        }
    }

    /// A payload with no numeric prefix.
    pub(crate) fn payload_only(payload: Payload) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    /// Nothing to send.
    pub(crate) fn silent() -> Self {
        Self::default()
    }
}

/// The buffer a connection has opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenBuffer {
    pub device: String,
    pub mask: u32,
    pub cyclic: bool,
}

pub(crate) enum Progress {
    Done,
    Blocked,
}

/// One client session.
pub struct Connection {
    pub(super) id: ConnectionId,
    pub(super) transport: Box<dyn Transport>,
    pub(super) state: State,
    pub(super) framing: Framing,
    pub(super) pending_framing: Option<Framing>,

    /// Request assembly
    pub(super) line: Box<[u8]>,
    pub(super) line_len: usize,
    pub(super) frame_header: [u8; 2],
    pub(super) frame_header_cursor: BufferCursor,
    pub(super) frame_body: Option<BufferCursor>,

    /// Attribute values and bulk samples
    pub(super) scratch: Vec<u8>,
    /// Rendered numeric result
    pub(super) header: Vec<u8>,

    pub(super) cmd: Command,
    pub(super) data: BufferCursor,
    pub(super) result: ResultRecord,
    pub(super) transfer: Transfer,
    pub(super) open: Option<OpenBuffer>,
    /// Payload bytes of an ignored command still to be skipped
    pub(super) discard: usize,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        transport: Box<dyn Transport>,
        scratch: Vec<u8>,
        line_size: usize,
    ) -> Self {
        Self {
            id,
            transport,
            state: State::ReadingLine,
            framing: Framing::Ascii,
            pending_framing: None,
            line: vec![0u8; line_size].into_boxed_slice(),
            line_len: 0,
            frame_header: [0u8; 2],
            frame_header_cursor: BufferCursor::new(2),
            frame_body: None,
            scratch,
            header: Vec::with_capacity(24),
            cmd: Command::default(),
            data: BufferCursor::default(),
            result: ResultRecord::default(),
            transfer: Transfer::default(),
            open: None,
            discard: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// The buffer opened by this connection, if any.
    pub fn open_buffer(&self) -> Option<&OpenBuffer> {
        self.open.as_ref()
    }

    /// True while a cyclic buffer is open.
    pub fn is_cyclic(&self) -> bool {
        self.open.as_ref().is_some_and(|open| open.cyclic)
    }

    pub(crate) fn into_parts(self) -> (Box<dyn Transport>, Vec<u8>) {
        (self.transport, self.scratch)
    }

    /// Advances the state machine by one state.
    pub(crate) fn step(&mut self, env: &EngineContext) -> Result<StepOutcome, ConnectionError> {
        match self.state {
            State::ReadingLine => self.step_reading_line(env),
            State::ReadingWriteData => self.step_reading_write_data(env),
            State::RunningCmd => Ok(self.run_command(env)),
            State::WritingCmdResult => self.step_writing_result(env),
            State::RwBuf => self.step_rw_buf(env),
            State::PushCyclicBuffer => self.step_push_cyclic(env),
            State::LineDone => {
                self.finish_command();
                Ok(StepOutcome::Advanced)
            }
        }
    }

    fn step_reading_line(&mut self, env: &EngineContext) -> Result<StepOutcome, ConnectionError> {
        if let Progress::Blocked = self.skip_ignored_payload(&env.stats)? {
            return Ok(StepOutcome::WouldBlock);
        }
        if let Progress::Blocked = self.read_request(&env.stats)? {
            return Ok(StepOutcome::WouldBlock);
        }

        let parsed = parse_command_bytes(&self.line[..self.line_len]);
        self.line_len = 0;
        env.stats.command_processed();

        match parsed {
            Ok(cmd) => self.accept_command(cmd)?,
            Err(e) => {
                debug!(conn = %self.id, error = %e, "Malformed command");
                self.cmd = Command::default();
                self.respond(ResultRecord::value(e.code()));
            }
        }

        Ok(StepOutcome::Advanced)
    }

    fn accept_command(&mut self, cmd: Command) -> Result<(), ConnectionError> {
        debug!(
            conn = %self.id,
            command = %cmd.kind,
            device = %cmd.device,
            "Command received"
        );

        if cmd.kind == CommandKind::Write {
            if cmd.bytes_count > self.scratch.len() {
                return Err(ConnectionError::PayloadTooLarge {
                    size: cmd.bytes_count,
                    max: self.scratch.len(),
                });
            }
            self.data.reset(cmd.bytes_count);
            self.state = State::ReadingWriteData;
        } else {
            self.state = State::RunningCmd;
        }

        self.cmd = cmd;
        Ok(())
    }

    fn step_reading_write_data(
        &mut self,
        env: &EngineContext,
    ) -> Result<StepOutcome, ConnectionError> {
        while !self.data.is_drained() {
            let window = self.data.pending_mut(&mut self.scratch);
            match recv_some(self.transport.as_mut(), window, &env.stats)? {
                Some(n) => self.data.advance(n),
                None => return Ok(StepOutcome::WouldBlock),
            }
        }

        trace!(conn = %self.id, bytes = self.data.len(), "Write payload received");
        self.state = State::RunningCmd;
        Ok(StepOutcome::Advanced)
    }

    fn run_command(&mut self, env: &EngineContext) -> StepOutcome {
        let ops = env.ops.as_ref();
        let ctx = OpContext::new(self.id);
        let cmd = &self.cmd;

        let record = match cmd.kind {
            CommandKind::Exit => {
                debug!(conn = %self.id, "Client requested exit");
                return StepOutcome::Exit;
            }

            CommandKind::Help => ResultRecord::value(-errno::ENOSYS),

            CommandKind::Print => ResultRecord::with_payload(
                env.config.context_xml.len() as isize,
                Payload::Shared(env.config.context_xml.clone()),
            ),

            CommandKind::Version => ResultRecord::payload_only(Payload::Shared(env.version.clone())),

            CommandKind::Binary => {
                self.pending_framing = Some(Framing::Binary);
                ResultRecord::value(0)
            }

            CommandKind::Timeout => ResultRecord::value(ops.set_timeout(&ctx, cmd.timeout_ms)),

            CommandKind::Open => {
                let ret = ops.open(&ctx, &cmd.device, cmd.sample_count, cmd.mask, cmd.cyclic);
                if ret >= 0 {
                    self.open = Some(OpenBuffer {
                        device: cmd.device.clone(),
                        mask: cmd.mask,
                        cyclic: cmd.cyclic,
                    });
                }
                ResultRecord::value(ret)
            }

            CommandKind::Close => {
                let ret = ops.close(&ctx, &cmd.device);
                if self
                    .open
                    .as_ref()
                    .is_some_and(|open| open.device == cmd.device)
                {
                    self.open = None;
                }
                ResultRecord::value(ret)
            }

            CommandKind::Read => {
                let ret = ops.read_attr(
                    &ctx,
                    &cmd.device,
                    &cmd.target,
                    cmd.attr.as_deref(),
                    &mut self.scratch,
                );
                scratch_result(ret, &self.scratch)
            }

            CommandKind::Write => {
                let value = self.data.done(&self.scratch);
                ResultRecord::value(ops.write_attr(
                    &ctx,
                    &cmd.device,
                    &cmd.target,
                    cmd.attr.as_deref(),
                    value,
                ))
            }

            CommandKind::ReadBuf | CommandKind::WriteBuf => ResultRecord::silent(),

            CommandKind::GetTrig => {
                let ret = ops.get_trigger(&ctx, &cmd.device, &mut self.scratch);
                scratch_result(ret, &self.scratch)
            }

            CommandKind::SetTrig => {
                ResultRecord::value(ops.set_trigger(&ctx, &cmd.device, cmd.trigger.as_deref()))
            }

            CommandKind::Set => {
                ResultRecord::value(ops.set_buffers_count(&ctx, &cmd.device, cmd.buffers_count))
            }
        };

        trace!(conn = %self.id, command = %self.cmd.kind, value = record.value, "Command executed");
        self.respond(record);
        StepOutcome::Advanced
    }

    fn step_writing_result(&mut self, env: &EngineContext) -> Result<StepOutcome, ConnectionError> {
        if let Progress::Blocked = self.write_result(&env.stats)? {
            return Ok(StepOutcome::WouldBlock);
        }

        self.state = if self.cmd.kind.is_buffer_transfer() && !self.transfer.is_finished() {
            self.transfer = Transfer::start(self.cmd.bytes_count, self.scratch.len());
            State::RwBuf
        } else {
            self.next_state_after_command()
        };

        Ok(StepOutcome::Advanced)
    }

    /// Where a finished command leaves the connection.
    pub(super) fn next_state_after_command(&self) -> State {
        if self.is_cyclic() && self.cmd.kind != CommandKind::Open {
            State::PushCyclicBuffer
        } else {
            State::LineDone
        }
    }

    fn finish_command(&mut self) {
        self.cmd = Command::default();
        self.data = BufferCursor::default();
        self.result = ResultRecord::default();
        self.transfer = Transfer::default();
        self.header.clear();

        if let Some(framing) = self.pending_framing.take() {
            debug!(conn = %self.id, ?framing, "Switching framing");
            self.framing = framing;
        }

        self.state = State::ReadingLine;
    }

    /// Queues a result for sending and enters `WritingCmdResult`.
    pub(super) fn respond(&mut self, mut record: ResultRecord) {
        if self.framing == Framing::Binary && !record.write_val {
            if let Some(len) = record.payload.len() {
                record.value = len as isize;
                record.write_val = true;
            }
        }

        self.header.clear();
        if record.write_val {
            match self.framing {
                Framing::Ascii => {
                    self.header
                        .extend_from_slice(record.value.to_string().as_bytes());
                    self.header.push(b'\n');
                }
                Framing::Binary => {
                    let value = i32::try_from(record.value).unwrap_or(i32::MIN);
                    self.header.extend_from_slice(&value.to_le_bytes());
                }
            }
        }

        record.stage = WriteStage::Value;
        record.cursor = BufferCursor::new(self.header.len());
        self.result = record;
        self.state = State::WritingCmdResult;
    }

    fn write_result(&mut self, stats: &PoolStats) -> Result<Progress, ConnectionError> {
        let Connection {
            transport,
            result,
            header,
            scratch,
            framing,
            ..
        } = self;

        loop {
            let Some(bytes) = stage_bytes(result.stage, header, &result.payload, scratch, *framing)
            else {
                return Ok(Progress::Done);
            };

            while !result.cursor.is_drained() {
                match send_some(transport.as_mut(), result.cursor.pending(bytes), stats)? {
                    Some(n) => result.cursor.advance(n),
                    None => return Ok(Progress::Blocked),
                }
            }

            result.stage = result.stage.next();
            let next = stage_bytes(result.stage, header, &result.payload, scratch, *framing)
                .map_or(0, <[u8]>::len);
            result.cursor.reset(next);
        }
    }

    /// Reads the next request into the line buffer.
    pub(super) fn read_request(&mut self, stats: &PoolStats) -> Result<Progress, ConnectionError> {
        match self.framing {
            Framing::Ascii => self.read_line(stats),
            Framing::Binary => self.read_frame(stats),
        }
    }

    fn read_line(&mut self, stats: &PoolStats) -> Result<Progress, ConnectionError> {
        let max = self.line.len();

        loop {
            // One byte at a time: anything after the newline belongs to
            // the payload of the command being read.
            let mut byte = [0u8; 1];
            if recv_some(self.transport.as_mut(), &mut byte, stats)?.is_none() {
                return Ok(Progress::Blocked);
            }

            if byte[0] == b'\n' {
                if self.line_len > 0 && self.line[self.line_len - 1] == b'\r' {
                    self.line_len -= 1;
                }
                return Ok(Progress::Done);
            }

            if self.line_len == max {
                return Err(ConnectionError::LineTooLong { max });
            }
            self.line[self.line_len] = byte[0];
            self.line_len += 1;
        }
    }

    fn read_frame(&mut self, stats: &PoolStats) -> Result<Progress, ConnectionError> {
        let max = self.line.len();

        loop {
            match self.frame_body {
                None => {
                    while !self.frame_header_cursor.is_drained() {
                        let window = self.frame_header_cursor.pending_mut(&mut self.frame_header);
                        match recv_some(self.transport.as_mut(), window, stats)? {
                            Some(n) => self.frame_header_cursor.advance(n),
                            None => return Ok(Progress::Blocked),
                        }
                    }

                    let len = u16::from_le_bytes(self.frame_header) as usize;
                    if len > max {
                        return Err(ConnectionError::LineTooLong { max });
                    }
                    self.frame_body = Some(BufferCursor::new(len));
                }
                Some(mut body) => {
                    while !body.is_drained() {
                        let window = body.pending_mut(&mut self.line);
                        match recv_some(self.transport.as_mut(), window, stats)? {
                            Some(n) => body.advance(n),
                            None => {
                                self.frame_body = Some(body);
                                return Ok(Progress::Blocked);
                            }
                        }
                    }

                    self.line_len = body.len();
                    self.frame_body = None;
                    self.frame_header_cursor.reset(2);
                    return Ok(Progress::Done);
                }
            }
        }
    }
}

/// Builds the result of an op that filled the scratch buffer.
///
/// Values are C strings: the payload stops at the first NUL byte.
fn scratch_result(ret: isize, scratch: &[u8]) -> ResultRecord {
    if ret < 0 {
        return ResultRecord::value(ret);
    }

    let filled = &scratch[..(ret as usize).min(scratch.len())];
    let len = filled.iter().position(|&b| b == 0).unwrap_or(filled.len());
    ResultRecord::with_payload(len as isize, Payload::Scratch(len))
}

/// The bytes sent during a write stage, or None once the result is done.
fn stage_bytes<'a>(
    stage: WriteStage,
    header: &'a [u8],
    payload: &'a Payload,
    scratch: &'a [u8],
    framing: Framing,
) -> Option<&'a [u8]> {
    const EMPTY: &[u8] = b"";
    const NEWLINE: &[u8] = b"\n";

    let bytes: &[u8] = match stage {
        WriteStage::Value => header,
        WriteStage::Payload => match payload {
            Payload::None => EMPTY,
            Payload::Scratch(n) => &scratch[..*n],
            Payload::Shared(bytes) => bytes,
        },
        WriteStage::Trailer => match (payload, framing) {
            (Payload::None, _) | (_, Framing::Binary) => EMPTY,
            _ => NEWLINE,
        },
        WriteStage::Done => return None,
    };
    Some(bytes)
}

/// Receives into `buf`. `Ok(None)` means would-block.
pub(super) fn recv_some(
    transport: &mut dyn Transport,
    buf: &mut [u8],
    stats: &PoolStats,
) -> Result<Option<usize>, ConnectionError> {
    if buf.is_empty() {
        return Ok(Some(0));
    }

    match transport.recv(buf) {
        Ok(0) => Err(ConnectionError::ClientDisconnected),
        Ok(n) => {
            stats.bytes_read(n);
            Ok(Some(n))
        }
        Err(e) if is_retryable(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Sends from `buf`. `Ok(None)` means would-block.
pub(super) fn send_some(
    transport: &mut dyn Transport,
    buf: &[u8],
    stats: &PoolStats,
) -> Result<Option<usize>, ConnectionError> {
    if buf.is_empty() {
        return Ok(Some(0));
    }

    match transport.send(buf) {
        Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero).into()),
        Ok(n) => {
            stats.bytes_written(n);
            Ok(Some(n))
        }
        Err(e) if is_retryable(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
