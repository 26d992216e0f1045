//! # Byte Queue
//!
//! Fixed-capacity circular byte buffer shared between a producer and the
//! link. The same type backs both directions: TX (producer → send cycle)
//! and RX (transport callback → consumer).
//!
//! Capacity is a power of two so index wraparound is a mask. Storage is
//! allocated once at construction and never resized.
//!
//! The queue itself is not synchronised; [`crate::link::PacedLink`] holds
//! it behind the same lock as the rest of the per-link state.

use bytes::{Bytes, BytesMut};

// ─── ByteQueue ───────────────────────────────────────────────────────────────

/// Power-of-two circular byte buffer with non-destructive peek.
pub struct ByteQueue {
    buf: Box<[u8]>,
    mask: usize,
    /// Next write position.
    head: usize,
    /// Oldest stored byte.
    tail: usize,
    len: usize,
}

impl ByteQueue {
    /// Create a queue holding up to `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or not a power of two. Use
    /// [`ByteQueue::try_new`] for unvalidated input.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "queue capacity must be a power of two, got {capacity}"
        );
        ByteQueue {
            buf: vec![0u8; capacity].into_boxed_slice(),
            mask: capacity - 1,
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    /// Create a queue, or `None` if `capacity` is not a power of two.
    pub fn try_new(capacity: usize) -> Option<Self> {
        capacity.is_power_of_two().then(|| Self::new(capacity))
    }

    /// Push `data`, returning the number of bytes stored.
    ///
    /// Without `overwrite`, a push that does not fit stores nothing and
    /// returns 0. With `overwrite`, the oldest bytes are evicted to make
    /// room; if `data` is longer than the whole queue only its last
    /// `capacity` bytes are kept. An empty push always returns 0.
    pub fn push(&mut self, data: &[u8], overwrite: bool) -> usize {
        if data.is_empty() {
            return 0;
        }
        let capacity = self.capacity();
        let free = capacity - self.len;

        if data.len() > free {
            if !overwrite {
                return 0;
            }
            if data.len() >= capacity {
                let newest = &data[data.len() - capacity..];
                self.buf.copy_from_slice(newest);
                self.head = 0;
                self.tail = 0;
                self.len = capacity;
                return capacity;
            }
            let overflow = data.len() - free;
            self.tail = (self.tail + overflow) & self.mask;
            self.len -= overflow;
        }

        let first = data.len().min(capacity - self.head);
        self.buf[self.head..self.head + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&data[first..]);
        }

        self.head = (self.head + data.len()) & self.mask;
        self.len += data.len();
        data.len()
    }

    /// The stored bytes, oldest first, as two contiguous runs.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        if self.len == 0 {
            return (&[], &[]);
        }
        let first = self.len.min(self.capacity() - self.tail);
        let second = self.len - first;
        (&self.buf[self.tail..self.tail + first], &self.buf[..second])
    }

    /// Copy up to `out.len()` of the oldest bytes into `out` without
    /// removing them. Returns the number copied.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        if n == 0 {
            return 0;
        }
        let (a, b) = self.as_slices();
        let from_a = n.min(a.len());
        out[..from_a].copy_from_slice(&a[..from_a]);
        if n > from_a {
            out[from_a..n].copy_from_slice(&b[..n - from_a]);
        }
        n
    }

    /// Snapshot up to `max_len` of the oldest bytes into a new buffer.
    pub fn peek_bytes(&self, max_len: usize) -> Bytes {
        let n = max_len.min(self.len);
        let mut out = BytesMut::with_capacity(n);
        let (a, b) = self.as_slices();
        let from_a = n.min(a.len());
        out.extend_from_slice(&a[..from_a]);
        out.extend_from_slice(&b[..n - from_a]);
        out.freeze()
    }

    /// The oldest byte, if any.
    pub fn peek_byte(&self) -> Option<u8> {
        (self.len > 0).then(|| self.buf[self.tail])
    }

    /// Copy out and remove up to `out.len()` of the oldest bytes.
    pub fn pop(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        self.consume(n)
    }

    /// Drop up to `n` of the oldest bytes without copying. Returns the
    /// number actually removed.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        if n == 0 {
            return 0;
        }
        self.tail = (self.tail + n) & self.mask;
        self.len -= n;
        if self.len == 0 {
            self.head = 0;
            self.tail = 0;
        }
        n
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.len = 0;
    }

    /// Number of bytes currently stored.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the queue holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the queue is at capacity.
    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes that can be pushed without eviction.
    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }
}

impl std::fmt::Debug for ByteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteQueue")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish()
    }
}
