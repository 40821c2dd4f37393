use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// How long a ring must have stayed under its initial capacity before an
/// oversized allocation is given back.
const SHRINK_AFTER: Duration = Duration::from_secs(10);

/// A growable byte ring with FIFO front access.
///
/// Backs the read-ahead and write-behind sides of a buffered channel. The
/// ring remembers its initial capacity and shrinks back towards it once the
/// stored volume has been small for a while.
pub struct ByteRing {
    buf: VecDeque<u8>,
    initial_capacity: usize,
    high_watermark: usize,
    last_large: Instant,
}

impl ByteRing {
    pub fn new(capacity: usize) -> Self {
        ByteRing {
            buf: VecDeque::with_capacity(capacity),
            initial_capacity: capacity,
            high_watermark: 0,
            last_large: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn initial_capacity(&self) -> usize {
        self.initial_capacity
    }

    pub fn high_watermark(&self) -> usize {
        self.high_watermark
    }

    pub fn push_back(&mut self, data: &[u8]) {
        self.buf.extend(data);
        if self.buf.len() > self.high_watermark {
            self.high_watermark = self.buf.len();
        }
        if self.buf.len() > self.initial_capacity {
            self.last_large = Instant::now();
        }
    }

    /// Remove and return up to `n` bytes from the front.
    pub fn take_front(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.buf.len());
        self.buf.drain(..n).collect()
    }

    /// Copy up to `n` bytes from the front without consuming them.
    pub fn peek_front(&self, n: usize) -> Vec<u8> {
        self.buf.iter().take(n).copied().collect()
    }

    /// Drop `n` bytes from the front.
    pub fn drop_front(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
    }

    /// Give back over-grown backing storage if the ring has been quiet.
    pub fn try_shrink(&mut self) {
        if self.buf.capacity() <= self.initial_capacity * 2 {
            return;
        }
        if self.buf.len() > self.initial_capacity {
            return;
        }
        if self.last_large.elapsed() < SHRINK_AFTER {
            return;
        }
        self.buf.shrink_to(self.initial_capacity);
    }
}
