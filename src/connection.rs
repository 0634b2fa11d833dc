// Per-connection outbound state.
//
// Every connection owns a FIFO of framed blobs pending write, with running
// byte accounting. The backpressure flag latches when the queued byte count
// first reaches the configured threshold and clears only when the queue
// drains to empty; the transition out is what drives the `drain` event.
//
// The queue is always mutated under the engine mutex; the writer task pops
// one blob at a time and performs the actual socket write outside the lock.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Notify;

use crate::events::ClientInfo;

// ---------------------------------------------------------------------------
// Send queue
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct SendQueue {
    frames: VecDeque<Bytes>,
    queued_bytes: usize,
    backpressured: bool,
    closing: bool,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a framed blob. Returns true when this push latched the
    /// backpressure flag (the caller emits the `backpressure` event).
    pub fn push(&mut self, frame: Bytes, threshold: usize) -> bool {
        self.queued_bytes += frame.len();
        self.frames.push_back(frame);
        if !self.backpressured && self.queued_bytes >= threshold {
            self.backpressured = true;
            return true;
        }
        false
    }

    /// Pop the oldest pending blob, keeping the byte accounting exact.
    pub fn pop(&mut self) -> Option<Bytes> {
        let frame = self.frames.pop_front()?;
        self.queued_bytes -= frame.len();
        Some(frame)
    }

    /// Called after a successful write: clears the latch when the queue has
    /// just emptied. Returns true when a `drain` event is due.
    pub fn check_drained(&mut self) -> bool {
        if self.frames.is_empty() && self.backpressured {
            self.backpressured = false;
            return true;
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn is_backpressured(&self) -> bool {
        self.backpressured
    }

    pub fn mark_closing(&mut self) {
        self.closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }
}

// ---------------------------------------------------------------------------
// Registry entry
// ---------------------------------------------------------------------------

/// A connection as seen from the engine registry. I/O lives in the
/// connection's own reader/writer tasks; this entry carries everything a
/// non-loop thread may touch, guarded by the engine mutex.
#[derive(Debug)]
pub(crate) struct ConnectionEntry {
    pub info: ClientInfo,
    pub queue: SendQueue,
    /// Wakes the writer task; the moral equivalent of requesting a
    /// writable callback on the socket.
    pub writable: Arc<Notify>,
}

impl ConnectionEntry {
    pub fn new(info: ClientInfo, writable: Arc<Notify>) -> Self {
        Self {
            info,
            queue: SendQueue::new(),
            writable,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
