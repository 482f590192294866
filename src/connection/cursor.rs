//! Partial-Transfer Cursor
//!
//! Non-blocking sends and receives may move fewer bytes than asked for.
//! A [`BufferCursor`] remembers how far a transfer got so the next step
//! resumes exactly where the previous one stopped.
//!
//! The cursor does not own its storage; it describes the first `len`
//! bytes of whichever buffer the caller pairs it with.

/// Progress through a transfer of `len` bytes.
///
/// Invariant: `0 <= index <= len`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferCursor {
    len: usize,
    index: usize,
}

impl BufferCursor {
    /// Creates a cursor at the start of a `len`-byte transfer.
    pub fn new(len: usize) -> Self {
        Self { len, index: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes transferred so far.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.len - self.index
    }

    /// True once every byte has been transferred.
    #[inline]
    pub fn is_drained(&self) -> bool {
        self.index == self.len
    }

    /// Records `n` more transferred bytes, clamped to the length.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        self.index = (self.index + n).min(self.len);
    }

    /// Rewinds to the start.
    #[inline]
    pub fn rewind(&mut self) {
        self.index = 0;
    }

    /// Restarts the cursor for a transfer of `len` bytes.
    #[inline]
    pub fn reset(&mut self, len: usize) {
        *self = Self::new(len);
    }

    /// The part of `buf` still to be transferred.
    #[inline]
    pub fn pending<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.index..self.len]
    }

    /// The part of `buf` still to be filled.
    #[inline]
    pub fn pending_mut<'a>(&self, buf: &'a mut [u8]) -> &'a mut [u8] {
        &mut buf[self.index..self.len]
    }

    /// The part of `buf` already transferred.
    #[inline]
    pub fn done<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[..self.index]
    }
}
