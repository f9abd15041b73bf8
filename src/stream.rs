//! Per-stream byte accounting and replay.
//!
//! Every stream position in the relay — producer or transit — is a
//! [`StreamBuf`]: a running byte counter, a bounded buffer of the most
//! recent bytes, a write cursor, and an end-of-stream flag. Producer-side
//! instances (local proxy: stream 0; daemon: streams 1 and 2) survive
//! reconnects and can rewind their cursor to a peer-confirmed byte count;
//! transit instances just absorb read/write rate mismatches.

use anyhow::Result;

/// End-of-stream sentinel, carried in-band so byte accounting treats it
/// like payload. Palindromic: `SSHIM_EOF` followed by its mirror, sharing
/// the middle `F`.
pub const EOF_MARKER: &[u8] = b"SSHIM_EOFOE_MIHSS";

/// Largest single read or write against any handle.
pub const CHUNK_SIZE: usize = 8192;

/// Backpressure threshold: reads for a stream pause while more than this
/// many bytes are buffered but unwritten.
pub const BUF_SIZE: usize = 1024 * 8192;

/// Once the buffer reaches this size the oldest `BUF_SIZE` bytes are
/// dropped. Anything dropped is gone for replay purposes.
const TRUNCATE_THRESHOLD: usize = 3 * BUF_SIZE;

/// One stream's worth of relay state.
///
/// Invariants: `ibuf <= buf.len()`; `rbytes` counts every byte ever
/// appended (including the EOF marker), not bytes retained; `eof` never
/// reverts once set.
#[derive(Debug, Default)]
pub struct StreamBuf {
    buf: Vec<u8>,
    /// Bytes of `buf` already written to the consumer.
    ibuf: usize,
    /// Total bytes ever read from the producer.
    rbytes: u64,
    eof: bool,
}

impl StreamBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes ever appended, marker included.
    pub fn rbytes(&self) -> u64 {
        self.rbytes
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Appends freshly read bytes, detecting an in-band EOF marker at the
    /// tail. Bytes arriving after EOF are dropped (anything past the
    /// marker is noise on a finished stream).
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.eof || data.is_empty() {
            return Ok(());
        }
        self.buf.extend_from_slice(data);
        self.rbytes += data.len() as u64;
        if self.buf.len() >= EOF_MARKER.len()
            && self.buf[self.buf.len() - EOF_MARKER.len()..] == *EOF_MARKER
        {
            self.eof = true;
        }
        self.truncate_oldest()
    }

    /// Synthesizes end-of-stream for an originating producer: appends the
    /// marker and accounts for it like payload.
    pub fn mark_eof(&mut self) -> Result<()> {
        self.append(EOF_MARKER)
    }

    fn truncate_oldest(&mut self) -> Result<()> {
        if self.buf.len() < TRUNCATE_THRESHOLD {
            return Ok(());
        }
        if self.ibuf < BUF_SIZE {
            anyhow::bail!(
                "replay buffer overrun: {} unwritten bytes would be discarded",
                BUF_SIZE - self.ibuf
            );
        }
        self.buf.drain(..BUF_SIZE);
        self.ibuf -= BUF_SIZE;
        Ok(())
    }

    /// Bytes not yet written to the consumer, marker included.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.ibuf..]
    }

    pub fn has_pending(&self) -> bool {
        self.ibuf < self.buf.len()
    }

    /// One write's worth of [`pending`](Self::pending).
    pub fn pending_chunk(&self) -> &[u8] {
        let pending = self.pending();
        &pending[..pending.len().min(CHUNK_SIZE)]
    }

    /// Producer-side backpressure predicate: true while too many bytes sit
    /// unwritten for further reads to be worthwhile.
    pub fn saturated(&self) -> bool {
        self.buf.len() - self.ibuf > BUF_SIZE
    }

    /// Records `n` bytes as written to the consumer.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.ibuf + n <= self.buf.len());
        self.ibuf += n;
    }

    /// Pending bytes with the trailing EOF marker held back, for endpoints
    /// that must never see it (the app, the user command's stdin).
    pub fn deliverable(&self) -> &[u8] {
        let end = if self.eof {
            self.buf.len() - EOF_MARKER.len()
        } else {
            self.buf.len()
        };
        if self.ibuf >= end {
            &[]
        } else {
            &self.buf[self.ibuf..end]
        }
    }

    /// One write's worth of [`deliverable`](Self::deliverable).
    pub fn deliverable_chunk(&self) -> &[u8] {
        let deliverable = self.deliverable();
        &deliverable[..deliverable.len().min(CHUNK_SIZE)]
    }

    /// True once every user-visible byte has been written; the marker may
    /// still be unconsumed.
    pub fn delivery_complete(&self) -> bool {
        self.eof && self.deliverable().is_empty()
    }

    /// Steps the cursor over the held-back marker once delivery is
    /// complete. Returns true the one time it actually consumes it.
    pub fn consume_marker(&mut self) -> bool {
        if self.delivery_complete() && self.ibuf < self.buf.len() {
            self.ibuf = self.buf.len();
            true
        } else {
            false
        }
    }

    /// True once the stream is finished and fully written, marker
    /// included — the forwarding-side notion of "done".
    pub fn complete(&self) -> bool {
        self.eof && self.ibuf == self.buf.len()
    }

    /// Drops whatever is pending without writing it (consumer vanished).
    pub fn discard_pending(&mut self) {
        self.ibuf = self.buf.len();
    }

    /// Moves the write cursor so replay resumes at the first byte the peer
    /// has not confirmed. `confirmed` is the peer's total received count.
    ///
    /// Fails if the peer claims more bytes than were ever produced, or if
    /// the resume point predates the retained window — both end the
    /// session.
    pub fn rewind_to(&mut self, confirmed: u64) -> Result<()> {
        if confirmed > self.rbytes {
            anyhow::bail!(
                "peer confirmed {} bytes of a stream that produced only {}",
                confirmed,
                self.rbytes
            );
        }
        let unconfirmed = self.rbytes - confirmed;
        if unconfirmed > self.buf.len() as u64 {
            anyhow::bail!(
                "resume point {} predates the retained window ({} of {} bytes kept)",
                confirmed,
                self.buf.len(),
                self.rbytes
            );
        }
        self.ibuf = self.buf.len() - unconfirmed as usize;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/stream_tests.rs"]
mod tests;
