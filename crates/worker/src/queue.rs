//! Bounded FIFO admission queue
//!
//! Requests wait here until the worker pool has a free slot. Admission never
//! blocks: once `capacity` entries are pending, `enqueue` fails with
//! [`ServeError::QueueFull`] so callers see backpressure immediately. The
//! queue-length gauge is updated while the queue lock is held, so scrapers
//! always observe the true depth.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tidecast_common::{Result, ServeError, Telemetry};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Admission sequence number
pub type Sequence = u64;

/// A pending unit of work
#[derive(Debug)]
pub struct QueueEntry<T> {
    pub seq: Sequence,
    pub enqueued_at: Instant,
    pub item: T,
}

impl<T> QueueEntry<T> {
    /// Time spent waiting so far
    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

#[derive(Debug)]
struct QueueState<T> {
    entries: VecDeque<QueueEntry<T>>,
    next_seq: Sequence,
    high_water: usize,
    closed: bool,
}

/// Bounded FIFO with cancellation
#[derive(Debug)]
pub struct AdmissionQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
    telemetry: Telemetry,
}

impl<T> AdmissionQueue<T> {
    /// Create a new queue holding at most `capacity` entries
    pub fn new(capacity: usize, telemetry: Telemetry) -> Self {
        telemetry.set_queue_length(0);
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::with_capacity(capacity),
                next_seq: 0,
                high_water: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            telemetry,
        }
    }

    /// Admit an item
    ///
    /// Returns its sequence number, or an error if the queue is full or
    /// closed. Never waits.
    pub fn enqueue(&self, item: T) -> Result<Sequence> {
        let seq = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ServeError::model_not_ready("Service is shutting down"));
            }
            if state.entries.len() >= self.capacity {
                return Err(ServeError::queue_full(format!(
                    "Admission queue is at capacity ({})",
                    self.capacity
                )));
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.push_back(QueueEntry {
                seq,
                enqueued_at: Instant::now(),
                item,
            });
            state.high_water = state.high_water.max(state.entries.len());
            self.telemetry.set_queue_length(state.entries.len());
            trace!(seq, depth = state.entries.len(), "Request admitted");
            seq
        };

        self.notify.notify_one();
        Ok(seq)
    }

    /// Remove the head entry, if any
    pub fn try_dequeue(&self) -> Option<QueueEntry<T>> {
        let mut state = self.state.lock();
        let entry = state.entries.pop_front()?;
        self.telemetry.set_queue_length(state.entries.len());
        let oldest = state
            .entries
            .front()
            .map(QueueEntry::waited)
            .unwrap_or_default();
        self.telemetry.set_oldest_wait(oldest);
        Some(entry)
    }

    /// Wait until at least one entry is pending
    ///
    /// Does not dequeue. Returns `false` once the queue has been closed.
    pub async fn wait_pending(&self) -> bool {
        loop {
            {
                let state = self.state.lock();
                if state.closed {
                    return false;
                }
                if !state.entries.is_empty() {
                    return true;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Withdraw an entry that has not been dequeued yet
    ///
    /// Returns `true` if the entry was still queued.
    pub fn cancel(&self, seq: Sequence) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = state.entries.iter().position(|e| e.seq == seq) else {
            return false;
        };
        state.entries.remove(pos);
        self.telemetry.set_queue_length(state.entries.len());
        debug!(seq, depth = state.entries.len(), "Queued request withdrawn");
        true
    }

    /// Close the queue and hand back everything still pending
    pub fn close(&self) -> Vec<QueueEntry<T>> {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.closed = true;
            let drained = state.entries.drain(..).collect();
            self.telemetry.set_queue_length(0);
            drained
        };
        self.notify.notify_waiters();
        self.notify.notify_one();
        drained
    }

    /// Current depth
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest depth observed since creation
    pub fn high_water(&self) -> usize {
        self.state.lock().high_water
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Age of the head entry
    pub fn oldest_wait(&self) -> Duration {
        self.state
            .lock()
            .entries
            .front()
            .map(QueueEntry::waited)
            .unwrap_or_default()
    }
}
