//! Fixed-capacity circular byte buffer
//!
//! Used by every connection to stage inbound bytes until the protocol layer
//! has seen a complete line, and outbound bytes until the socket accepts
//! them. The buffer never grows: a write that does not fit is truncated and
//! the caller decides what sustained overflow means.

/// Circular byte store with independent read and write cursors
///
/// `len` tells the full and empty states apart since both have
/// `read == write`.
pub struct RingBuffer {
    buf: Box<[u8]>,
    read: usize,
    write: usize,
    len: usize,
}

impl RingBuffer {
    /// Create an empty buffer holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes currently stored
    pub fn used(&self) -> usize {
        self.len
    }

    /// Free space left for writers
    pub fn available(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Append as much of `data` as fits and return the number of bytes taken
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.available());
        if n == 0 {
            return 0;
        }

        let cap = self.capacity();
        let first = n.min(cap - self.write);
        self.buf[self.write..self.write + first].copy_from_slice(&data[..first]);
        if first < n {
            self.buf[..n - first].copy_from_slice(&data[first..n]);
        }

        self.write = (self.write + n) % cap;
        self.len += n;
        n
    }

    /// Remove up to `out.len()` bytes into `out`
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        self.advance(n);
        n
    }

    /// Copy up to `out.len()` bytes into `out` without consuming them
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        if n == 0 {
            return 0;
        }

        let cap = self.capacity();
        let first = n.min(cap - self.read);
        out[..first].copy_from_slice(&self.buf[self.read..self.read + first]);
        if first < n {
            out[first..n].copy_from_slice(&self.buf[..n - first]);
        }
        n
    }

    /// Drop up to `n` bytes from the front and return how many were dropped
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        self.advance(n);
        n
    }

    /// The stored bytes as at most two contiguous slices, oldest first
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        if self.len == 0 {
            return (&[], &[]);
        }
        let cap = self.capacity();
        let first = self.len.min(cap - self.read);
        (
            &self.buf[self.read..self.read + first],
            &self.buf[..self.len - first],
        )
    }

    /// Discard everything
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
        self.len = 0;
    }

    fn advance(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.read = (self.read + n) % self.capacity();
        self.len -= n;
        if self.len == 0 {
            self.read = 0;
            self.write = 0;
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("used", &self.len)
            .finish()
    }
}
