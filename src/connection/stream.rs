//! Buffer Streaming Engine
//!
//! This module implements the bulk-transfer states of the connection
//! state machine: `RwBuf` for `READBUF` / `WRITEBUF` and
//! `PushCyclicBuffer` for cyclic output buffers.
//!
//! ## Chunking
//!
//! Samples move through the connection's scratch buffer in chunks of at
//! most `scratch.len()` bytes. Each chunk is filled, then drained:
//!
//! ```text
//! READBUF:   device ──read_buffer──> scratch ──send──> client
//! WRITEBUF:  client ──recv──> scratch ──write_buffer──> device
//! ```
//!
//! In serial mode a chunk is drained as soon as any bytes are in it, which
//! keeps latency low on slow links. In network mode `READBUF` waits until
//! the whole chunk is filled so the socket sees fewer, larger writes.
//!
//! At most one chunk moves per step, so a long transfer never starves the
//! other connections of the pool.

use crate::connection::cursor::BufferCursor;
use crate::connection::handler::{
    recv_some, send_some, Connection, EngineContext, Progress, ResultRecord, State, StepOutcome,
};
use crate::connection::pool::PoolStats;
use crate::connection::ConnectionError;
use crate::ops::{errno, OpContext};
use crate::protocol::{parse_command_bytes, CommandKind};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Fill,
    Drain,
}

/// Progress of one READBUF / WRITEBUF transfer.
#[derive(Debug, Default)]
pub(crate) struct Transfer {
    /// Bytes announced by the command
    total: usize,
    /// Bytes not yet moved into the scratch buffer
    remaining: usize,
    /// The chunk currently in the scratch buffer
    chunk: BufferCursor,
    phase: Phase,
    /// First device error of a WRITEBUF; later data is discarded
    error: Option<isize>,
    finished: bool,
}

impl Transfer {
    pub(crate) fn start(total: usize, chunk_size: usize) -> Self {
        Self {
            total,
            remaining: total,
            chunk: BufferCursor::new(total.min(chunk_size)),
            ..Default::default()
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes already handed on, not counting the chunk being filled.
    fn moved(&self) -> usize {
        self.total - self.remaining
    }

    /// Switches from filling to draining the bytes gathered so far.
    fn begin_drain(&mut self) {
        let filled = self.chunk.index();
        self.remaining -= filled;
        self.chunk.reset(filled);
        self.phase = Phase::Drain;
    }

    /// Prepares the next chunk.
    fn begin_fill(&mut self, chunk_size: usize) {
        self.chunk.reset(self.remaining.min(chunk_size));
        self.phase = Phase::Fill;
    }
}

impl Connection {
    pub(super) fn step_rw_buf(&mut self, env: &EngineContext) -> Result<StepOutcome, ConnectionError> {
        match self.cmd.kind {
            CommandKind::ReadBuf => self.step_read_buf(env),
            CommandKind::WriteBuf => self.step_write_buf(env),
            _ => {
                self.state = State::LineDone;
                Ok(StepOutcome::Advanced)
            }
        }
    }

    fn step_read_buf(&mut self, env: &EngineContext) -> Result<StepOutcome, ConnectionError> {
        let ops = env.ops.as_ref();
        let ctx = OpContext::new(self.id);
        let capacity = self.scratch.len();

        if self.transfer.phase == Phase::Fill {
            if self.transfer.remaining == 0 && self.transfer.chunk.is_empty() {
                trace!(conn = %self.id, bytes = self.transfer.total, "READBUF complete");
                self.transfer.finished = true;
                self.state = self.next_state_after_command();
                return Ok(StepOutcome::Advanced);
            }

            let mut refilled = false;
            while !self.transfer.chunk.is_drained() {
                let window = self.transfer.chunk.pending_mut(&mut self.scratch);
                let ret = ops.read_buffer(&ctx, &self.cmd.device, window);

                if ret < 0 {
                    return self.abort_transfer(ret);
                }

                if ret == 0 {
                    if refilled {
                        return Ok(StepOutcome::WouldBlock);
                    }
                    match ops.refill_buffer(&ctx, &self.cmd.device) {
                        r if r == -errno::ENOSYS => return Ok(StepOutcome::WouldBlock),
                        r if r < 0 => return self.abort_transfer(r),
                        _ => {
                            refilled = true;
                            continue;
                        }
                    }
                }

                self.transfer.chunk.advance(ret as usize);
                if !env.config.network {
                    break;
                }
            }

            self.transfer.begin_drain();
        }

        while !self.transfer.chunk.is_drained() {
            let pending = self.transfer.chunk.pending(&self.scratch);
            match send_some(self.transport.as_mut(), pending, &env.stats)? {
                Some(n) => self.transfer.chunk.advance(n),
                None => return Ok(StepOutcome::WouldBlock),
            }
        }

        trace!(
            conn = %self.id,
            sent = self.transfer.chunk.len(),
            remaining = self.transfer.remaining,
            "READBUF chunk sent"
        );
        self.transfer.begin_fill(capacity);
        Ok(StepOutcome::Advanced)
    }

    fn step_write_buf(&mut self, env: &EngineContext) -> Result<StepOutcome, ConnectionError> {
        let ops = env.ops.as_ref();
        let ctx = OpContext::new(self.id);
        let capacity = self.scratch.len();

        if self.transfer.phase == Phase::Fill {
            if self.transfer.remaining == 0 && self.transfer.chunk.is_empty() {
                let value = match self.transfer.error {
                    Some(code) => code,
                    None => match ops.push_buffer(&ctx, &self.cmd.device) {
                        r if r < 0 => r,
                        _ => self.transfer.total as isize,
                    },
                };
                debug!(conn = %self.id, device = %self.cmd.device, value, "WRITEBUF complete");
                self.transfer.finished = true;
                self.respond(ResultRecord::value(value));
                return Ok(StepOutcome::Advanced);
            }

            while !self.transfer.chunk.is_drained() {
                let window = self.transfer.chunk.pending_mut(&mut self.scratch);
                match recv_some(self.transport.as_mut(), window, &env.stats)? {
                    Some(n) => self.transfer.chunk.advance(n),
                    None if self.transfer.chunk.index() > 0 && !env.config.network => break,
                    None => return Ok(StepOutcome::WouldBlock),
                }
            }

            self.transfer.begin_drain();
        }

        while !self.transfer.chunk.is_drained() {
            if self.transfer.error.is_some() {
                // Keep draining the wire so the next request lines up.
                let rest = self.transfer.chunk.remaining();
                self.transfer.chunk.advance(rest);
                break;
            }

            let pending = self.transfer.chunk.pending(&self.scratch);
            let ret = ops.write_buffer(&ctx, &self.cmd.device, pending);
            if ret < 0 {
                warn!(conn = %self.id, device = %self.cmd.device, error = ret, "write_buffer failed");
                self.transfer.error = Some(ret);
                continue;
            }
            if ret == 0 {
                return Ok(StepOutcome::WouldBlock);
            }
            self.transfer.chunk.advance(ret as usize);
        }

        self.transfer.begin_fill(capacity);
        Ok(StepOutcome::Advanced)
    }

    /// Ends a READBUF on a device error.
    ///
    /// Before the first raw byte the error goes out as a numeric line. Once
    /// samples have been sent the client expects the rest of them, so the
    /// connection is dropped instead.
    fn abort_transfer(&mut self, code: isize) -> Result<StepOutcome, ConnectionError> {
        let sent = self.transfer.moved();
        if sent > 0 {
            return Err(ConnectionError::TransferAborted { code, sent });
        }

        warn!(
            conn = %self.id,
            command = %self.cmd.kind,
            device = %self.cmd.device,
            error = code,
            "Buffer transfer failed"
        );
        self.transfer.finished = true;
        self.respond(ResultRecord::value(code));
        Ok(StepOutcome::Advanced)
    }

    pub(super) fn step_push_cyclic(
        &mut self,
        env: &EngineContext,
    ) -> Result<StepOutcome, ConnectionError> {
        let ops = env.ops.as_ref();
        let ctx = OpContext::new(self.id);

        let ret = match &self.open {
            Some(open) if open.cyclic => ops.push_buffer(&ctx, &open.device),
            _ => {
                self.state = State::LineDone;
                return Ok(StepOutcome::Advanced);
            }
        };

        if ret < 0 {
            if let Some(open) = self.open.take() {
                let closed = ops.close(&ctx, &open.device);
                warn!(
                    conn = %self.id,
                    device = %open.device,
                    error = ret,
                    closed,
                    "Cyclic push failed, buffer closed"
                );
            }
            self.state = State::LineDone;
            return Ok(StepOutcome::Advanced);
        }

        if let Progress::Blocked = self.skip_ignored_payload(&env.stats)? {
            return Ok(StepOutcome::Advanced);
        }
        if let Progress::Blocked = self.read_request(&env.stats)? {
            return Ok(StepOutcome::Advanced);
        }

        let parsed = parse_command_bytes(&self.line[..self.line_len]);
        self.line_len = 0;

        match parsed {
            Ok(cmd) if cmd.kind == CommandKind::Close => {
                env.stats.command_processed();
                debug!(conn = %self.id, device = %cmd.device, "CLOSE received while cyclic");
                self.cmd = cmd;
                self.transfer = Transfer::default();
                self.state = State::RunningCmd;
            }
            Ok(cmd) => {
                if matches!(cmd.kind, CommandKind::Write | CommandKind::WriteBuf) {
                    self.discard = cmd.bytes_count;
                }
                debug!(
                    conn = %self.id,
                    command = %cmd.kind,
                    skipped = self.discard,
                    "Ignoring command while cyclic"
                );
            }
            Err(e) => {
                debug!(conn = %self.id, error = %e, "Ignoring malformed command while cyclic");
            }
        }

        Ok(StepOutcome::Advanced)
    }

    /// Reads and drops the payload announced by a command that was ignored.
    pub(super) fn skip_ignored_payload(
        &mut self,
        stats: &PoolStats,
    ) -> Result<Progress, ConnectionError> {
        while self.discard > 0 {
            let n = self.discard.min(self.scratch.len());
            match recv_some(self.transport.as_mut(), &mut self.scratch[..n], stats)? {
                Some(n) => self.discard -= n,
                None => return Ok(Progress::Blocked),
            }
        }
        Ok(Progress::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::connection::pool::{ConnectionId, ConnectionPool};
    use crate::connection::transport::mock::MockTransport;
    use crate::ops::{DeviceOps, LoopbackOps, NoOps};
    use crate::protocol::AttrTarget;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Produces an endless byte ramp, at most 64 bytes per read.
    #[derive(Default)]
    struct RampOps {
        produced: AtomicUsize,
        reads: AtomicUsize,
    }

    impl DeviceOps for RampOps {
        fn open(&self, _: &OpContext, _: &str, _: usize, _: u32, _: bool) -> isize {
            0
        }

        fn read_buffer(&self, _: &OpContext, _: &str, buf: &mut [u8]) -> isize {
            self.reads.fetch_add(1, Ordering::Relaxed);
            let n = buf.len().min(64);
            let start = self.produced.fetch_add(n, Ordering::Relaxed);
            for (i, byte) in buf[..n].iter_mut().enumerate() {
                *byte = (start + i) as u8;
            }
            n as isize
        }
    }

    /// Hands out one 16-byte block, then fails with -EIO.
    #[derive(Default)]
    struct FlakyOps {
        reads: AtomicUsize,
    }

    impl DeviceOps for FlakyOps {
        fn read_buffer(&self, _: &OpContext, _: &str, buf: &mut [u8]) -> isize {
            if self.reads.fetch_add(1, Ordering::Relaxed) > 0 {
                return -errno::EIO;
            }
            let n = buf.len().min(16);
            buf[..n].fill(0xAB);
            n as isize
        }
    }

    fn ramp(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    fn setup(
        ops: Arc<dyn DeviceOps>,
        network: bool,
        scratch: usize,
    ) -> (ConnectionPool, MockTransport, ConnectionId) {
        let config = EngineConfig {
            network,
            ..Default::default()
        };
        let mut pool = ConnectionPool::new(ops, config);
        let mock = MockTransport::new();
        let id = pool.add(mock.clone(), vec![0; scratch]).unwrap();
        (pool, mock, id)
    }

    fn drive(pool: &mut ConnectionPool, id: ConnectionId) -> StepOutcome {
        for _ in 0..100_000 {
            match pool.step(id).unwrap() {
                StepOutcome::Advanced => continue,
                outcome => return outcome,
            }
        }
        panic!("connection never settled");
    }

    fn request(
        pool: &mut ConnectionPool,
        mock: &MockTransport,
        id: ConnectionId,
        input: &[u8],
    ) -> Vec<u8> {
        mock.push_input(input);
        assert_eq!(drive(pool, id), StepOutcome::WouldBlock);
        mock.take_output()
    }

    fn drive_to_error(pool: &mut ConnectionPool, id: ConnectionId) -> ConnectionError {
        for _ in 0..1000 {
            if let Err(e) = pool.step(id) {
                return e;
            }
        }
        panic!("connection never failed");
    }

    fn step_times(pool: &mut ConnectionPool, id: ConnectionId, n: usize) {
        for _ in 0..n {
            pool.step(id).unwrap();
        }
    }

    #[test]
    fn test_readbuf_network_mode_sends_full_chunks() {
        let (mut pool, mock, id) = setup(Arc::new(RampOps::default()), true, 128);

        assert_eq!(request(&mut pool, &mock, id, b"OPEN dev0 100 3\n"), b"0\n");
        let calls_before = mock.send_calls();

        let out = request(&mut pool, &mock, id, b"READBUF dev0 400\n");
        assert_eq!(out, ramp(400));
        // 128 + 128 + 128 + 16
        assert_eq!(mock.send_calls() - calls_before, 4);
        assert_eq!(pool.state(id), Some(State::ReadingLine));
    }

    #[test]
    fn test_readbuf_serial_mode_sends_each_read() {
        let (mut pool, mock, id) = setup(Arc::new(RampOps::default()), false, 128);

        assert_eq!(request(&mut pool, &mock, id, b"OPEN dev0 100 3\n"), b"0\n");
        let calls_before = mock.send_calls();

        let out = request(&mut pool, &mock, id, b"READBUF dev0 400\n");
        assert_eq!(out, ramp(400));
        // Six 64-byte reads and a 16-byte tail
        assert_eq!(mock.send_calls() - calls_before, 7);
    }

    #[test]
    fn test_readbuf_one_byte_sends() {
        let (mut pool, mock, id) = setup(Arc::new(RampOps::default()), true, 128);

        mock.set_max_send(1);
        let out = request(&mut pool, &mock, id, b"READBUF dev0 300\n");
        assert_eq!(out, ramp(300));
    }

    #[test]
    fn test_readbuf_one_chunk_per_step() {
        let ops = Arc::new(RampOps::default());
        let (mut pool, mock, id) = setup(ops.clone(), true, 128);

        mock.push_input(b"READBUF dev0 1024\n");
        while pool.state(id) != Some(State::RwBuf) {
            pool.step(id).unwrap();
        }

        pool.step(id).unwrap();
        assert_eq!(mock.take_output().len(), 128);
        // Two 64-byte reads fill one chunk
        assert_eq!(ops.reads.load(Ordering::Relaxed), 2);

        pool.step(id).unwrap();
        assert_eq!(mock.take_output().len(), 128);
    }

    #[test]
    fn test_readbuf_zero_bytes() {
        let (mut pool, mock, id) = setup(Arc::new(RampOps::default()), true, 128);

        let out = request(&mut pool, &mock, id, b"READBUF dev0 0\nVERSION\n");
        assert_eq!(out, b"0.25 0000000\n");
    }

    #[test]
    fn test_readbuf_without_driver_reports_error() {
        let (mut pool, mock, id) = setup(Arc::new(NoOps), true, 128);

        let out = request(&mut pool, &mock, id, b"READBUF dev0 400\n");
        assert_eq!(out, b"-38\n");
        assert_eq!(pool.state(id), Some(State::ReadingLine));
    }

    #[test]
    fn test_readbuf_error_before_any_data_is_a_result_line() {
        // Network mode holds the 16 good bytes back until the chunk fills
        let (mut pool, mock, id) = setup(Arc::new(FlakyOps::default()), true, 128);

        let out = request(&mut pool, &mock, id, b"READBUF dev0 64\n");
        assert_eq!(out, b"-5\n");
        assert_eq!(pool.state(id), Some(State::ReadingLine));
    }

    #[test]
    fn test_readbuf_error_after_data_is_fatal() {
        let (mut pool, mock, id) = setup(Arc::new(FlakyOps::default()), false, 128);

        mock.push_input(b"READBUF dev0 64\n");
        let err = drive_to_error(&mut pool, id);
        assert!(matches!(
            err,
            ConnectionError::TransferAborted { code: -5, sent: 16 }
        ));
        // Only samples went out, no result line after them
        assert_eq!(mock.take_output(), vec![0xAB; 16]);
    }

    #[test]
    fn test_readbuf_waits_for_samples() {
        let ops = Arc::new(LoopbackOps::new(["dev0"]));
        let (mut pool, mock, id) = setup(ops.clone(), true, 128);

        assert_eq!(request(&mut pool, &mock, id, b"OPEN dev0 4 1\n"), b"0\n");

        let out = request(&mut pool, &mock, id, b"READBUF dev0 4\n");
        assert!(out.is_empty());
        assert_eq!(pool.state(id), Some(State::RwBuf));

        ops.write_buffer(&OpContext::new(id), "dev0", b"abcd");
        assert_eq!(drive(&mut pool, id), StepOutcome::WouldBlock);
        assert_eq!(mock.take_output(), b"abcd");
        assert_eq!(pool.state(id), Some(State::ReadingLine));
    }

    #[test]
    fn test_writebuf_then_readbuf_loops_back() {
        let ops = Arc::new(LoopbackOps::new(["dev0"]));
        let (mut pool, mock, id) = setup(ops.clone(), true, 128);
        let samples = ramp(300);

        assert_eq!(request(&mut pool, &mock, id, b"OPEN dev0 16 1\n"), b"0\n");

        let mut input = b"WRITEBUF dev0 300\n".to_vec();
        input.extend_from_slice(&samples);
        assert_eq!(request(&mut pool, &mock, id, &input), b"300\n");
        assert_eq!(ops.push_count("dev0"), 1);
        assert_eq!(ops.pending_samples("dev0"), 300);

        let out = request(&mut pool, &mock, id, b"READBUF dev0 300\n");
        assert_eq!(out, samples);
    }

    #[test]
    fn test_writebuf_data_in_pieces() {
        let ops = Arc::new(LoopbackOps::new(["dev0"]));
        let (mut pool, mock, id) = setup(ops.clone(), true, 128);

        assert_eq!(request(&mut pool, &mock, id, b"OPEN dev0 16 1\n"), b"0\n");
        assert!(request(&mut pool, &mock, id, b"WRITEBUF dev0 8\nabc").is_empty());
        assert_eq!(pool.state(id), Some(State::RwBuf));

        assert_eq!(request(&mut pool, &mock, id, b"defgh"), b"8\n");
        assert_eq!(ops.pending_samples("dev0"), 8);
    }

    #[test]
    fn test_writebuf_small_reads_serial_mode() {
        let ops = Arc::new(LoopbackOps::new(["dev0"]));
        let (mut pool, mock, id) = setup(ops.clone(), false, 128);
        let samples = ramp(300);

        assert_eq!(request(&mut pool, &mock, id, b"OPEN dev0 16 1\n"), b"0\n");

        mock.set_max_recv(7);
        let mut input = b"WRITEBUF dev0 300\n".to_vec();
        input.extend_from_slice(&samples);
        assert_eq!(request(&mut pool, &mock, id, &input), b"300\n");

        let out = request(&mut pool, &mock, id, b"READBUF dev0 300\n");
        assert_eq!(out, samples);
    }

    #[test]
    fn test_writebuf_error_discards_payload() {
        let ops = Arc::new(LoopbackOps::new(["dev0"]));
        let (mut pool, mock, id) = setup(ops.clone(), true, 128);

        // Not opened: write_buffer fails with -EINVAL
        let mut input = b"WRITEBUF dev0 200\n".to_vec();
        input.extend_from_slice(&[0xAA; 200]);
        input.extend_from_slice(b"VERSION\n");

        let out = request(&mut pool, &mock, id, &input);
        assert_eq!(out, b"-22\n0.25 0000000\n");
        assert_eq!(mock.pending_input(), 0);
        assert_eq!(ops.push_count("dev0"), 0);
    }

    #[test]
    fn test_cyclic_close_mid_stream() {
        let ops = Arc::new(LoopbackOps::new(["dev0"]));
        let (mut pool, mock, id) = setup(ops.clone(), true, 128);

        let out = request(&mut pool, &mock, id, b"OPEN dev0 4 1 CYCLIC\n");
        assert_eq!(out, b"0\n");
        assert!(pool.get(id).unwrap().is_cyclic());
        assert_eq!(pool.state(id), Some(State::ReadingLine));

        mock.push_input(b"WRITEBUF dev0 4\nabcd");
        while pool.state(id) != Some(State::PushCyclicBuffer) {
            pool.step(id).unwrap();
        }
        assert_eq!(mock.take_output(), b"4\n");

        step_times(&mut pool, id, 10);
        assert_eq!(ops.push_count("dev0"), 11);

        // Other commands are ignored while pushing
        mock.push_input(b"VERSION\n");
        step_times(&mut pool, id, 3);
        assert!(mock.take_output().is_empty());
        assert_eq!(pool.state(id), Some(State::PushCyclicBuffer));

        mock.push_input(b"CLOSE dev0\n");
        assert_eq!(drive(&mut pool, id), StepOutcome::WouldBlock);
        assert_eq!(mock.take_output(), b"0\n");
        assert_eq!(ops.close_count("dev0"), 1);
        assert!(!pool.get(id).unwrap().is_cyclic());

        let pushes = ops.push_count("dev0");
        step_times(&mut pool, id, 5);
        assert_eq!(ops.push_count("dev0"), pushes);
        assert_eq!(ops.close_count("dev0"), 1);
    }

    #[test]
    fn test_cyclic_skips_payload_of_ignored_write() {
        let ops = Arc::new(LoopbackOps::new(["dev0"]));
        let (mut pool, mock, id) = setup(ops.clone(), true, 128);

        request(&mut pool, &mock, id, b"OPEN dev0 4 1 CYCLIC\n");
        mock.push_input(b"WRITEBUF dev0 4\nabcd");
        while pool.state(id) != Some(State::PushCyclicBuffer) {
            pool.step(id).unwrap();
        }
        mock.take_output();

        // 600 bytes with no newline, larger than the scratch buffer
        let mut input = b"WRITE dev0 attr 600\n".to_vec();
        input.extend_from_slice(&[b'x'; 600]);
        input.extend_from_slice(b"CLOSE dev0\n");
        mock.push_input(&input);

        assert_eq!(drive(&mut pool, id), StepOutcome::WouldBlock);
        assert_eq!(mock.take_output(), b"0\n");
        assert_eq!(mock.pending_input(), 0);
        assert!(!ops.is_open("dev0"));
        assert_eq!(ops.attr("dev0", &AttrTarget::Device, Some("attr")), None);
    }

    #[test]
    fn test_cyclic_push_failure_closes_buffer() {
        let ops = Arc::new(LoopbackOps::new(["dev0"]));
        let (mut pool, mock, id) = setup(ops.clone(), true, 128);

        request(&mut pool, &mock, id, b"OPEN dev0 4 1 CYCLIC\n");
        mock.push_input(b"WRITEBUF dev0 4\nabcd");
        while pool.state(id) != Some(State::PushCyclicBuffer) {
            pool.step(id).unwrap();
        }

        // Closing behind the engine's back makes the next push fail.
        ops.close(&OpContext::new(id), "dev0");
        assert_eq!(drive(&mut pool, id), StepOutcome::WouldBlock);
        assert_eq!(ops.close_count("dev0"), 2);
        assert!(pool.get(id).unwrap().open_buffer().is_none());
        assert_eq!(pool.state(id), Some(State::ReadingLine));
    }
}
