//! Growable byte buffer with independent read and write cursors.
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |                   |     (CONTENT)    |                  |
//! +-------------------+------------------+------------------+
//! 0      <=      read_pos     <=     write_pos    <=    capacity
//! ```
//!
//! All socket I/O of a connection flows through two of these: one inbound,
//! one outbound. A buffer is owned by exactly one connection.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};

use crate::error::BufferError;

/// Initial capacity of a fresh buffer.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Size of the stack scratch area used by [`ByteBuffer::fill_from`].
const SCRATCH_SIZE: usize = 65535;

#[derive(Debug, Clone)]
pub struct ByteBuffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    #[inline]
    pub fn readable(&self) -> usize {
        self.write_pos - self.read_pos
    }

    #[inline]
    pub fn writable(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    #[inline]
    pub fn prependable(&self) -> usize {
        self.read_pos
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.readable() == 0
    }

    /// The unread region. Does not consume.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Advance the read cursor by `n`.
    pub fn consume(&mut self, n: usize) -> Result<(), BufferError> {
        let readable = self.readable();
        if n > readable {
            return Err(BufferError::ConsumeOverrun { requested: n, readable });
        }
        self.read_pos += n;
        Ok(())
    }

    /// Drop all unread content and rewind both cursors.
    pub fn consume_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Copy `data` in behind the write cursor, growing or compacting first
    /// when it does not fit.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    /// Make sure at least `len` bytes are writable.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable() >= len);
    }

    fn make_space(&mut self, len: usize) {
        if self.writable() + self.prependable() < len {
            self.buf.resize(self.write_pos + len + 1, 0);
        } else {
            // Enough room overall: slide the unread region to the front.
            let readable = self.readable();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }

    /// Fill from a source with one vectored read.
    ///
    /// The first vector is the live writable region, the second a stack
    /// scratch area, so a single call can take in more than the current
    /// capacity. Overflow into the scratch area is appended (growing the
    /// buffer) only when present.
    ///
    /// Returns the number of bytes read; `Ok(0)` means end of stream.
    pub fn fill_from<R: Read + ?Sized>(&mut self, src: &mut R) -> io::Result<usize> {
        let mut extra = [0u8; SCRATCH_SIZE];
        let writable = self.writable();

        let n = {
            let (_, tail) = self.buf.split_at_mut(self.write_pos);
            let mut iov = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra)];
            src.read_vectored(&mut iov)?
        };

        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// One vectored write of the unread region followed by `tail`.
    ///
    /// Cursors are NOT advanced: partial writes are expected and the caller
    /// decides how the written count splits between the two vectors.
    pub fn drain_to<W: Write + ?Sized>(&self, dst: &mut W, tail: &[u8]) -> io::Result<usize> {
        let iov = [IoSlice::new(self.peek()), IoSlice::new(tail)];
        dst.write_vectored(&iov)
    }
}
