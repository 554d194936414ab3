//! Inbound byte queue feeding synchronous reads from asynchronous completions
//!
//! The producer is the bulk-in completion callback: it writes into a tail
//! region pinned by [`InboundRing::prepare_tail`] and records the written
//! length with [`InboundRing::commit`]. The consumer is the port's
//! `receive_data`, which drains bytes from the front in arrival order.
//!
//! Compaction and reallocation happen only inside `prepare_tail`, so the
//! buffer never moves while a transfer is writing into it: the port calls
//! `prepare_tail` only while no transfer is outstanding on the endpoint.

/// Extra space added whenever the buffer has to grow.
const GROW_SLACK: usize = 64 * 1024;

/// Growable byte queue with a stable tail region for in-flight writes.
pub struct InboundRing {
    buf: Vec<u8>,
    /// Offset of the first byte not yet handed to a reader.
    consumed: usize,
    /// Offset one past the last byte received.
    end: usize,
}

impl InboundRing {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            consumed: 0,
            end: 0,
        }
    }

    /// Bytes received but not yet consumed.
    pub fn available(&self) -> usize {
        self.end - self.consumed
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Make room for `len` more bytes and return the writable tail.
    ///
    /// Unconsumed bytes are moved to the front of the buffer first; if the
    /// remaining tail is still smaller than `len`, the buffer is reallocated
    /// to hold the unconsumed bytes plus `len` plus slack.
    ///
    /// Must not be called while a previously returned tail is still being
    /// written to.
    pub fn prepare_tail(&mut self, len: usize) -> &mut [u8] {
        if self.consumed == self.end {
            self.consumed = 0;
            self.end = 0;
        } else if self.consumed > 0 {
            self.buf.copy_within(self.consumed..self.end, 0);
            self.end -= self.consumed;
            self.consumed = 0;
        }

        if self.buf.len() - self.end < len {
            self.buf.resize(self.end + len + GROW_SLACK, 0);
        }

        &mut self.buf[self.end..self.end + len]
    }

    /// Record that the producer wrote `len` bytes into the prepared tail.
    pub fn commit(&mut self, len: usize) {
        debug_assert!(self.end + len <= self.buf.len());
        self.end += len;
    }

    /// Copy out up to `dest.len()` bytes in arrival order.
    pub fn consume(&mut self, dest: &mut [u8]) -> usize {
        let n = dest.len().min(self.available());
        dest[..n].copy_from_slice(&self.buf[self.consumed..self.consumed + n]);
        self.consumed += n;
        n
    }

    /// Throw away everything received but not yet consumed.
    pub fn clear(&mut self) {
        self.consumed = self.end;
    }
}
