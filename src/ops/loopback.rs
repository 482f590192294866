//! In-Memory Loop-Back Devices
//!
//! [`LoopbackOps`] implements every [`DeviceOps`] slot against a set of
//! named devices that live entirely in memory:
//!
//! - Attributes are stored per target and handed back verbatim.
//! - `WRITEBUF` data goes into a FIFO and `READBUF` drains it, so a
//!   write followed by a read of the same size returns the same bytes.
//! - Open state, trigger, push and close counts are tracked so tests can
//!   observe what the engine did.
//!
//! The daemon binary uses it for its demo devices.

use crate::ops::dispatcher::{DeviceOps, OpContext};
use crate::ops::errno;
use crate::protocol::AttrTarget;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Buffer parameters recorded by `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferParams {
    pub sample_count: usize,
    pub mask: u32,
    pub cyclic: bool,
}

#[derive(Debug, Default)]
struct Device {
    attrs: HashMap<String, Vec<u8>>,
    open: Option<BufferParams>,
    fifo: VecDeque<u8>,
    trigger: Option<String>,
    buffers_count: u32,
    pushes: u64,
    closes: u64,
}

#[derive(Debug, Default)]
struct Inner {
    devices: HashMap<String, Device>,
    timeout_ms: u32,
}

/// A device table backed by memory.
#[derive(Debug, Default)]
pub struct LoopbackOps {
    inner: Mutex<Inner>,
}

impl LoopbackOps {
    /// Creates a table with the given device names.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ops = Self::default();
        for name in names {
            ops.add_device(name);
        }
        ops
    }

    /// Adds an empty device. Existing devices are left untouched.
    pub fn add_device(&self, name: impl Into<String>) {
        self.lock().devices.entry(name.into()).or_default();
    }

    /// Returns the device names in sorted order.
    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().devices.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stores an attribute value without going through the protocol.
    pub fn set_attr(&self, device: &str, target: &AttrTarget, attr: Option<&str>, value: &[u8]) {
        let mut inner = self.lock();
        let dev = inner.devices.entry(device.to_string()).or_default();
        dev.attrs.insert(attr_key(target, attr), value.to_vec());
    }

    /// Returns a stored attribute value.
    pub fn attr(&self, device: &str, target: &AttrTarget, attr: Option<&str>) -> Option<Vec<u8>> {
        self.lock()
            .devices
            .get(device)
            .and_then(|dev| dev.attrs.get(&attr_key(target, attr)).cloned())
    }

    /// Returns the open buffer of a device, if any.
    pub fn open_buffer(&self, device: &str) -> Option<BufferParams> {
        self.lock().devices.get(device).and_then(|dev| dev.open)
    }

    pub fn is_open(&self, device: &str) -> bool {
        self.open_buffer(device).is_some()
    }

    /// Number of successful `push_buffer` calls on a device.
    pub fn push_count(&self, device: &str) -> u64 {
        self.lock().devices.get(device).map_or(0, |dev| dev.pushes)
    }

    /// Number of `close` calls on a device.
    pub fn close_count(&self, device: &str) -> u64 {
        self.lock().devices.get(device).map_or(0, |dev| dev.closes)
    }

    /// Bytes waiting in the device FIFO.
    pub fn pending_samples(&self, device: &str) -> usize {
        self.lock().devices.get(device).map_or(0, |dev| dev.fifo.len())
    }

    pub fn trigger(&self, device: &str) -> Option<String> {
        self.lock()
            .devices
            .get(device)
            .and_then(|dev| dev.trigger.clone())
    }

    pub fn buffers_count(&self, device: &str) -> u32 {
        self.lock().devices.get(device).map_or(0, |dev| dev.buffers_count)
    }

    pub fn timeout_ms(&self) -> u32 {
        self.lock().timeout_ms
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` against an existing device, or fails with `-ENODEV`.
    fn with_device<F>(&self, device: &str, f: F) -> isize
    where
        F: FnOnce(&mut Device) -> isize,
    {
        match self.lock().devices.get_mut(device) {
            Some(dev) => f(dev),
            None => -errno::ENODEV,
        }
    }
}

impl DeviceOps for LoopbackOps {
    fn open(
        &self,
        ctx: &OpContext,
        device: &str,
        sample_count: usize,
        mask: u32,
        cyclic: bool,
    ) -> isize {
        self.with_device(device, |dev| {
            if dev.open.is_some() {
                return -errno::EBUSY;
            }
            if mask == 0 {
                return -errno::EINVAL;
            }
            trace!(conn = %ctx.conn, device, sample_count, mask, cyclic, "Loopback open");
            dev.open = Some(BufferParams {
                sample_count,
                mask,
                cyclic,
            });
            dev.fifo.clear();
            0
        })
    }

    fn close(&self, ctx: &OpContext, device: &str) -> isize {
        self.with_device(device, |dev| {
            dev.closes += 1;
            trace!(conn = %ctx.conn, device, "Loopback close");
            match dev.open.take() {
                Some(_) => 0,
                None => -errno::EINVAL,
            }
        })
    }

    fn read_attr(
        &self,
        _ctx: &OpContext,
        device: &str,
        target: &AttrTarget,
        attr: Option<&str>,
        buf: &mut [u8],
    ) -> isize {
        self.with_device(device, |dev| match dev.attrs.get(&attr_key(target, attr)) {
            Some(value) if value.len() <= buf.len() => {
                buf[..value.len()].copy_from_slice(value);
                value.len() as isize
            }
            Some(_) => -errno::ENOMEM,
            None => -errno::ENOENT,
        })
    }

    fn write_attr(
        &self,
        _ctx: &OpContext,
        device: &str,
        target: &AttrTarget,
        attr: Option<&str>,
        value: &[u8],
    ) -> isize {
        self.with_device(device, |dev| {
            dev.attrs.insert(attr_key(target, attr), value.to_vec());
            value.len() as isize
        })
    }

    fn read_buffer(&self, _ctx: &OpContext, device: &str, buf: &mut [u8]) -> isize {
        self.with_device(device, |dev| {
            if dev.open.is_none() {
                return -errno::EINVAL;
            }
            let n = buf.len().min(dev.fifo.len());
            for (slot, byte) in buf.iter_mut().zip(dev.fifo.drain(..n)) {
                *slot = byte;
            }
            n as isize
        })
    }

    fn write_buffer(&self, _ctx: &OpContext, device: &str, data: &[u8]) -> isize {
        self.with_device(device, |dev| {
            if dev.open.is_none() {
                return -errno::EINVAL;
            }
            dev.fifo.extend(data);
            data.len() as isize
        })
    }

    fn get_trigger(&self, _ctx: &OpContext, device: &str, buf: &mut [u8]) -> isize {
        self.with_device(device, |dev| match &dev.trigger {
            Some(name) if name.len() <= buf.len() => {
                buf[..name.len()].copy_from_slice(name.as_bytes());
                name.len() as isize
            }
            Some(_) => -errno::ENOMEM,
            None => -errno::ENOENT,
        })
    }

    fn set_trigger(&self, _ctx: &OpContext, device: &str, trigger: Option<&str>) -> isize {
        self.with_device(device, |dev| {
            dev.trigger = trigger.map(str::to_string);
            0
        })
    }

    fn set_timeout(&self, _ctx: &OpContext, timeout_ms: u32) -> isize {
        self.lock().timeout_ms = timeout_ms;
        0
    }

    fn set_buffers_count(&self, _ctx: &OpContext, device: &str, count: u32) -> isize {
        self.with_device(device, |dev| {
            if count == 0 {
                return -errno::EINVAL;
            }
            dev.buffers_count = count;
            0
        })
    }

    fn refill_buffer(&self, _ctx: &OpContext, device: &str) -> isize {
        self.with_device(device, |_| 0)
    }

    fn push_buffer(&self, _ctx: &OpContext, device: &str) -> isize {
        self.with_device(device, |dev| {
            if dev.open.is_none() {
                return -errno::EINVAL;
            }
            dev.pushes += 1;
            0
        })
    }
}

fn attr_key(target: &AttrTarget, attr: Option<&str>) -> String {
    format!("{}/{}", target, attr.unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionId;

    fn ctx() -> OpContext {
        OpContext::new(ConnectionId(0))
    }

    #[test]
    fn test_open_close() {
        let ops = LoopbackOps::new(["dev0"]);

        assert_eq!(ops.open(&ctx(), "dev0", 100, 3, false), 0);
        assert!(ops.is_open("dev0"));
        assert_eq!(ops.open(&ctx(), "dev0", 100, 3, false), -errno::EBUSY);

        assert_eq!(ops.close(&ctx(), "dev0"), 0);
        assert!(!ops.is_open("dev0"));
        assert_eq!(ops.close_count("dev0"), 1);
    }

    #[test]
    fn test_unknown_device() {
        let ops = LoopbackOps::new(["dev0"]);
        assert_eq!(ops.open(&ctx(), "dev9", 1, 1, false), -errno::ENODEV);
        assert_eq!(ops.push_buffer(&ctx(), "dev9"), -errno::ENODEV);
    }

    #[test]
    fn test_attributes() {
        let ops = LoopbackOps::new(["dev0"]);
        let target = AttrTarget::input("voltage0");

        assert_eq!(ops.write_attr(&ctx(), "dev0", &target, Some("raw"), b"42"), 2);

        let mut buf = [0u8; 16];
        let n = ops.read_attr(&ctx(), "dev0", &target, Some("raw"), &mut buf);
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"42");

        let n = ops.read_attr(&ctx(), "dev0", &AttrTarget::Device, Some("raw"), &mut buf);
        assert_eq!(n, -errno::ENOENT);
    }

    #[test]
    fn test_attribute_too_large_for_buffer() {
        let ops = LoopbackOps::new(["dev0"]);
        ops.set_attr("dev0", &AttrTarget::Device, Some("name"), b"a long value");

        let mut buf = [0u8; 4];
        let n = ops.read_attr(&ctx(), "dev0", &AttrTarget::Device, Some("name"), &mut buf);
        assert_eq!(n, -errno::ENOMEM);
    }

    #[test]
    fn test_fifo_loopback() {
        let ops = LoopbackOps::new(["dev0"]);
        let mut buf = [0u8; 4];

        assert_eq!(ops.write_buffer(&ctx(), "dev0", b"abcdef"), -errno::EINVAL);

        ops.open(&ctx(), "dev0", 3, 1, false);
        assert_eq!(ops.write_buffer(&ctx(), "dev0", b"abcdef"), 6);
        assert_eq!(ops.read_buffer(&ctx(), "dev0", &mut buf), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(ops.read_buffer(&ctx(), "dev0", &mut buf), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(ops.read_buffer(&ctx(), "dev0", &mut buf), 0);
    }

    #[test]
    fn test_trigger_and_settings() {
        let ops = LoopbackOps::new(["dev0"]);
        let mut buf = [0u8; 32];

        assert_eq!(ops.get_trigger(&ctx(), "dev0", &mut buf), -errno::ENOENT);
        assert_eq!(ops.set_trigger(&ctx(), "dev0", Some("trigger0")), 0);
        assert_eq!(ops.get_trigger(&ctx(), "dev0", &mut buf), 8);
        assert_eq!(&buf[..8], b"trigger0");

        assert_eq!(ops.set_buffers_count(&ctx(), "dev0", 4), 0);
        assert_eq!(ops.buffers_count("dev0"), 4);
        assert_eq!(ops.set_timeout(&ctx(), 1500), 0);
        assert_eq!(ops.timeout_ms(), 1500);
    }
}
