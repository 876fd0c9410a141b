//! Bounded byte queue between the acquisition and processing loops.
//!
//! The producer appends whole chunks as they arrive from the network and never
//! blocks: once the chunk cap is exceeded the oldest chunk is dropped. The
//! consumer pulls exact byte counts; a partially consumed front chunk is kept in
//! place with a head offset so the remaining bytes stay first in line.

use crossbeam_channel::{Receiver, Sender, bounded};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct Chunks {
    queue: VecDeque<Vec<u8>>,
    /// Bytes already consumed from the front chunk.
    head: usize,
    /// Unconsumed bytes across all chunks.
    len: usize,
    dropped: u64,
    closed: bool,
}

impl Chunks {
    fn pop_oldest(&mut self) {
        if let Some(front) = self.queue.pop_front() {
            self.len -= front.len() - self.head;
            self.head = 0;
            self.dropped += 1;
        }
    }
}

/// Single-producer, single-consumer byte buffer with oldest-chunk eviction.
#[derive(Debug)]
pub struct StreamBuffer {
    chunks: Mutex<Chunks>,
    capacity: usize,
    ready_tx: Sender<()>,
    ready_rx: Receiver<()>,
}

impl StreamBuffer {
    /// Creates a buffer holding at most `capacity` chunks (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let (ready_tx, ready_rx) = bounded(1);
        Self {
            chunks: Mutex::new(Chunks::default()),
            capacity: capacity.max(1),
            ready_tx,
            ready_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Chunks> {
        self.chunks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        // A pending token already wakes the consumer.
        let _ = self.ready_tx.try_send(());
    }

    /// Appends a chunk at the tail, evicting the oldest chunk when over capacity.
    ///
    /// Empty chunks and pushes after [`close`](Self::close) are ignored.
    pub fn push(&self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        {
            let mut chunks = self.lock();
            if chunks.closed {
                return;
            }
            chunks.len += chunk.len();
            chunks.queue.push_back(chunk);
            while chunks.queue.len() > self.capacity {
                chunks.pop_oldest();
            }
        }
        self.notify();
    }

    /// Removes exactly `n` bytes from the front.
    ///
    /// Returns `None` and leaves the buffer untouched when fewer than `n` bytes
    /// are buffered.
    pub fn pull(&self, n: usize) -> Option<Vec<u8>> {
        let mut chunks = self.lock();
        if chunks.len < n {
            return None;
        }

        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let head = chunks.head;
            let Some(front) = chunks.queue.front() else {
                break;
            };
            let available = front.len() - head;
            let wanted = n - out.len();
            if available <= wanted {
                out.extend_from_slice(&front[head..]);
                chunks.queue.pop_front();
                chunks.head = 0;
            } else {
                out.extend_from_slice(&front[head..head + wanted]);
                chunks.head += wanted;
            }
        }
        chunks.len -= out.len();
        Some(out)
    }

    /// Blocks until a push or close happens, or `timeout` passes.
    ///
    /// Returns true when woken by new data or a close. Callers re-check with
    /// [`pull`](Self::pull) since one wake-up can cover several pushes.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.ready_rx.recv_timeout(timeout).is_ok()
    }

    /// Marks the buffer closed and wakes a waiting consumer.
    ///
    /// Already buffered bytes remain available to [`pull`](Self::pull).
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Drops every buffered chunk.
    pub fn clear(&self) {
        let mut chunks = self.lock();
        chunks.queue.clear();
        chunks.head = 0;
        chunks.len = 0;
    }

    /// Unconsumed bytes currently buffered.
    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chunks currently buffered, counting a partially consumed front chunk.
    pub fn chunk_count(&self) -> usize {
        self.lock().queue.len()
    }

    /// Chunks evicted because the buffer was full.
    pub fn dropped_chunks(&self) -> u64 {
        self.lock().dropped
    }
}
