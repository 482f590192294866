//! Transport Boundary
//!
//! The engine only needs two non-blocking primitives from a transport:
//! receive some bytes and send some bytes. Either may report
//! [`io::ErrorKind::WouldBlock`], which is not an error: the current step
//! returns and the same work is retried on the next step.
//!
//! Any `Read + Write + Send` type is a transport, which covers
//! non-blocking `std::net::TcpStream`, Unix sockets and serial ports
//! opened in non-blocking mode.

use std::io::{self, Read, Write};

/// A non-blocking byte stream.
pub trait Transport: Send {
    /// Receives up to `buf.len()` bytes. `Ok(0)` means the peer closed.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Sends up to `buf.len()` bytes, returning how many were accepted.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl<T: Read + Write + Send> Transport for T {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.write(buf)?;
        // The bytes are accepted once write returns; a flush that would
        // block is retried by the next send.
        match self.flush() {
            Err(e) if !is_retryable(&e) => Err(e),
            _ => Ok(n),
        }
    }
}

/// Returns true for errors that only mean "try again later".
#[inline]
pub(crate) fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
