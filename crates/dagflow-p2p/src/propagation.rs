//! Batched transaction-ID announcements.

use dagflow_core::types::Hash256;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

struct PropagationQueue {
    pending: Vec<Hash256>,
    last_flush: Instant,
}

/// Accumulates accepted transaction IDs and hands them out in batches.
///
/// A flush happens when a full batch is pending or the propagation interval
/// has elapsed since the previous flush. Enqueueing and flushing happen under
/// one lock, so no ID is sent twice or lost between concurrent callers.
pub struct TransactionPropagator {
    queue: Mutex<PropagationQueue>,
    max_batch: usize,
    interval: Duration,
}

impl TransactionPropagator {
    pub fn new(max_batch: usize, interval: Duration) -> Self {
        Self {
            queue: Mutex::new(PropagationQueue {
                pending: Vec::new(),
                last_flush: Instant::now(),
            }),
            max_batch: max_batch.max(1),
            interval,
        }
    }

    /// Enqueue `ids` and flush if due. Returns the number of batches sent.
    pub fn enqueue(&self, ids: Vec<Hash256>, send: impl FnMut(Vec<Hash256>)) -> usize {
        self.enqueue_at(ids, Instant::now(), send)
    }

    /// [`enqueue`](Self::enqueue) with an explicit clock.
    pub fn enqueue_at(&self, ids: Vec<Hash256>, now: Instant, mut send: impl FnMut(Vec<Hash256>)) -> usize {
        let mut queue = self.queue.lock();
        queue.pending.extend(ids);
        if queue.pending.is_empty() {
            return 0;
        }
        let due = now.saturating_duration_since(queue.last_flush) >= self.interval;
        if queue.pending.len() < self.max_batch && !due {
            trace!(pending = queue.pending.len(), "propagation: deferring flush");
            return 0;
        }

        let mut batches = 0;
        while !queue.pending.is_empty() {
            let take = queue.pending.len().min(self.max_batch);
            let batch: Vec<Hash256> = queue.pending.drain(..take).collect();
            send(batch);
            batches += 1;
        }
        queue.last_flush = now;
        batches
    }

    pub fn pending_len(&self) -> usize {
        self.queue.lock().pending.len()
    }
}

/// Gates the periodic rebroadcast of local transactions.
pub struct RebroadcastTimer {
    last: Mutex<Instant>,
    interval: Duration,
}

impl RebroadcastTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            last: Mutex::new(Instant::now()),
            interval,
        }
    }

    /// Returns true, and restarts the timer, if the interval has elapsed.
    pub fn should_rebroadcast_at(&self, now: Instant) -> bool {
        let mut last = self.last.lock();
        if now.saturating_duration_since(*last) < self.interval {
            return false;
        }
        *last = now;
        true
    }
}
