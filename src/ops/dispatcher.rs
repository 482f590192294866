//! Device Operation Table
//!
//! The engine never talks to hardware itself. Every command that touches a
//! device is forwarded to a [`DeviceOps`] implementation supplied by the
//! embedding application.
//!
//! ## Slots
//!
//! | Slot                | Command                |
//! |---------------------|------------------------|
//! | `open`              | `OPEN`                 |
//! | `close`             | `CLOSE`, forced closes |
//! | `read_attr`         | `READ`                 |
//! | `write_attr`        | `WRITE`                |
//! | `read_buffer`       | `READBUF`              |
//! | `write_buffer`      | `WRITEBUF`             |
//! | `get_trigger`       | `GETTRIG`              |
//! | `set_trigger`       | `SETTRIG`              |
//! | `set_timeout`       | `TIMEOUT`              |
//! | `set_buffers_count` | `SET ... BUFFERS_COUNT`|
//! | `refill_buffer`     | `READBUF` (device dry) |
//! | `push_buffer`       | `WRITEBUF`, cyclic push|
//!
//! Every slot has a default body that fails with `-ENOSYS`, so an
//! implementation overrides only what its hardware supports.
//!
//! ## Return Values
//!
//! All slots return `isize`: zero or a positive byte count on success, a
//! negative errno on failure. Negative values are sent to the client
//! verbatim.

use crate::connection::ConnectionId;
use crate::ops::errno;
use crate::protocol::AttrTarget;

/// Per-call context handed to every slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpContext {
    /// The connection issuing the command
    pub conn: ConnectionId,
}

impl OpContext {
    pub fn new(conn: ConnectionId) -> Self {
        Self { conn }
    }
}

/// Device operations backing the protocol commands.
///
/// Implementations are shared by every connection of a pool and may be
/// called from whichever task steps the pool, so they handle their own
/// locking.
#[allow(unused_variables)]
pub trait DeviceOps: Send + Sync {
    /// Opens a buffer of `sample_count` samples on the channels in `mask`.
    fn open(
        &self,
        ctx: &OpContext,
        device: &str,
        sample_count: usize,
        mask: u32,
        cyclic: bool,
    ) -> isize {
        -errno::ENOSYS
    }

    /// Closes the buffer opened on `device`.
    fn close(&self, ctx: &OpContext, device: &str) -> isize {
        -errno::ENOSYS
    }

    /// Reads an attribute into `buf`, returning the number of bytes written.
    ///
    /// `attr` is None when the client asked for the whole target.
    fn read_attr(
        &self,
        ctx: &OpContext,
        device: &str,
        target: &AttrTarget,
        attr: Option<&str>,
        buf: &mut [u8],
    ) -> isize {
        -errno::ENOSYS
    }

    /// Writes `value` to an attribute.
    fn write_attr(
        &self,
        ctx: &OpContext,
        device: &str,
        target: &AttrTarget,
        attr: Option<&str>,
        value: &[u8],
    ) -> isize {
        -errno::ENOSYS
    }

    /// Moves up to `buf.len()` sample bytes from the device into `buf`.
    ///
    /// Returning 0 means no samples are available right now.
    fn read_buffer(&self, ctx: &OpContext, device: &str, buf: &mut [u8]) -> isize {
        -errno::ENOSYS
    }

    /// Hands sample bytes to the device, returning how many it accepted.
    fn write_buffer(&self, ctx: &OpContext, device: &str, data: &[u8]) -> isize {
        -errno::ENOSYS
    }

    /// Writes the name of the device's trigger into `buf`.
    fn get_trigger(&self, ctx: &OpContext, device: &str, buf: &mut [u8]) -> isize {
        -errno::ENOSYS
    }

    /// Attaches a trigger, or detaches the current one when `trigger` is None.
    fn set_trigger(&self, ctx: &OpContext, device: &str, trigger: Option<&str>) -> isize {
        -errno::ENOSYS
    }

    fn set_timeout(&self, ctx: &OpContext, timeout_ms: u32) -> isize {
        -errno::ENOSYS
    }

    fn set_buffers_count(&self, ctx: &OpContext, device: &str, count: u32) -> isize {
        -errno::ENOSYS
    }

    /// Asks the device to acquire a fresh block of samples.
    fn refill_buffer(&self, ctx: &OpContext, device: &str) -> isize {
        -errno::ENOSYS
    }

    /// Submits the samples written so far to the hardware.
    fn push_buffer(&self, ctx: &OpContext, device: &str) -> isize {
        -errno::ENOSYS
    }
}

/// An operation table with every slot left at its default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOps;

impl DeviceOps for NoOps {}

#[cfg(test)]
mod tests {
    use super::*;

    struct OpenOnly;

    impl DeviceOps for OpenOnly {
        fn open(&self, _: &OpContext, _: &str, _: usize, _: u32, _: bool) -> isize {
            0
        }
    }

    #[test]
    fn test_default_slots_fail_with_enosys() {
        let ops = NoOps;
        let ctx = OpContext::new(ConnectionId(0));
        let mut buf = [0u8; 8];

        assert_eq!(ops.open(&ctx, "dev0", 1, 1, false), -errno::ENOSYS);
        assert_eq!(ops.close(&ctx, "dev0"), -errno::ENOSYS);
        assert_eq!(
            ops.read_attr(&ctx, "dev0", &AttrTarget::Device, None, &mut buf),
            -errno::ENOSYS
        );
        assert_eq!(ops.read_buffer(&ctx, "dev0", &mut buf), -errno::ENOSYS);
        assert_eq!(ops.push_buffer(&ctx, "dev0"), -errno::ENOSYS);
        assert_eq!(ops.set_timeout(&ctx, 100), -errno::ENOSYS);
    }

    #[test]
    fn test_partial_table_keeps_other_defaults() {
        let ops = OpenOnly;
        let ctx = OpContext::new(ConnectionId(3));

        assert_eq!(ops.open(&ctx, "dev0", 1, 1, true), 0);
        assert_eq!(ops.close(&ctx, "dev0"), -errno::ENOSYS);
    }
}
