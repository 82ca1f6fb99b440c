//! Bounded sample queue between producers and the sender task
//!
//! Producers push from any thread without blocking. When the queue holds
//! `capacity` samples the oldest evictable sample is dropped to make room.
//! Sequence headers and end-of-stream markers are never evicted, so the
//! stream stays decodable after a gap. Eviction never reorders what is left.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::media::EncodedSample;

/// An item taken from the queue by the drain loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEntry {
    Sample(EncodedSample),
    /// Flush up to here, then close the session gracefully. Carries the
    /// start generation it was issued under.
    Stop(u64),
}

impl QueueEntry {
    fn evictable(&self) -> bool {
        match self {
            QueueEntry::Sample(s) => !s.is_sequence_header() && !s.is_end_of_stream(),
            QueueEntry::Stop(_) => false,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<QueueEntry>,
    /// Number of `Sample` entries (stop markers do not count)
    samples: usize,
    closed: bool,
}

/// FIFO with drop-oldest overflow and async wake-up
#[derive(Debug)]
pub struct SampleQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

/// Result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting one older sample
    Evicted,
    /// Queue is closed; the sample was discarded
    Closed,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples currently queued
    pub fn len(&self) -> usize {
        self.lock().samples
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Append a sample, evicting the oldest evictable one when full
    pub fn push(&self, sample: EncodedSample) -> PushOutcome {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }

            let mut outcome = PushOutcome::Queued;
            if inner.samples >= self.capacity {
                if let Some(idx) = inner.entries.iter().position(QueueEntry::evictable) {
                    inner.entries.remove(idx);
                    inner.samples -= 1;
                    outcome = PushOutcome::Evicted;
                }
            }
            inner.entries.push_back(QueueEntry::Sample(sample));
            inner.samples += 1;
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Append a stop marker behind everything queued so far.
    ///
    /// Back-to-back stops collapse into one marker carrying the newest
    /// generation, so markers never outnumber samples by more than one.
    pub fn push_stop(&self, generation: u64) -> bool {
        {
            let mut inner = self.lock();
            if inner.closed {
                return false;
            }
            match inner.entries.back_mut() {
                Some(QueueEntry::Stop(last)) => *last = (*last).max(generation),
                _ => inner.entries.push_back(QueueEntry::Stop(generation)),
            }
        }
        self.notify.notify_one();
        true
    }

    /// Take the next entry without waiting
    pub fn try_pop(&self) -> Option<QueueEntry> {
        let mut inner = self.lock();
        let entry = inner.entries.pop_front()?;
        if matches!(entry, QueueEntry::Sample(_)) {
            inner.samples -= 1;
        }
        Some(entry)
    }

    /// Wait for the next entry. Returns `None` once the queue is closed
    /// and everything queued before closing has been taken.
    pub async fn pop(&self) -> Option<QueueEntry> {
        loop {
            let notified = self.notify.notified();
            if let Some(entry) = self.try_pop() {
                return Some(entry);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Refuse further pushes and wake the consumer
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}
