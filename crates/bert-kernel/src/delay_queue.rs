//! [`DelayQueue`] – time-ordered release of queued envelopes with pacing.
//!
//! Entries are ordered by their scheduled release time, ties broken by
//! arrival.  Releasing an entry moves a queue-wide watermark forward by that
//! entry's own delay, so the entry that follows is never released sooner
//! than the previous entry's delay after it, even when its own delay is
//! zero.
//!
//! The queue takes "now" as an argument everywhere so its ordering rules can
//! be tested without a clock; [`DelayQueue::pop_when_due`] is the async
//! wrapper the sequencer lanes use.

use std::collections::VecDeque;

use bert_types::RequestEnvelope;
use tokio::time::{Instant, sleep_until};

struct Entry {
    at: Instant,
    envelope: RequestEnvelope,
}

/// Ordered, paced queue of envelopes awaiting release.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use bert_kernel::DelayQueue;
/// use bert_types::{RequestEnvelope, RequestKind, Target};
/// use tokio::time::Instant;
///
/// let mut queue = DelayQueue::new();
/// let now = Instant::now();
/// queue.push(
///     RequestEnvelope::new(RequestKind::Heartbeat, Target::None).with_delay(Duration::from_millis(50)),
///     now,
/// );
///
/// assert!(queue.pop_due(now).is_none());
/// assert!(queue.pop_due(now + Duration::from_millis(50)).is_some());
/// ```
#[derive(Default)]
pub struct DelayQueue {
    entries: VecDeque<Entry>,
    watermark: Option<Instant>,
}

impl DelayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `envelope` for release at `now + delay`.  Returns the scheduled
    /// time.
    pub fn push(&mut self, envelope: RequestEnvelope, now: Instant) -> Instant {
        self.push_not_before(envelope, now, None)
    }

    /// Queue a batch of envelopes expanded from one request.  Each is
    /// scheduled no earlier than the one before it so the batch is released
    /// in the order given.
    pub fn push_batch<I>(&mut self, batch: I, now: Instant)
    where
        I: IntoIterator<Item = RequestEnvelope>,
    {
        let mut floor = None;
        for envelope in batch {
            floor = Some(self.push_not_before(envelope, now, floor));
        }
    }

    fn push_not_before(&mut self, mut envelope: RequestEnvelope, now: Instant, floor: Option<Instant>) -> Instant {
        let mut at = now + envelope.control.delay;
        if let Some(floor) = floor {
            at = at.max(floor);
        }
        envelope.control.scheduled_at = Some(at.into_std());
        let index = self.entries.partition_point(|e| e.at <= at);
        self.entries.insert(index, Entry { at, envelope });
        at
    }

    /// The earliest time the head entry may be released, taking the pacing
    /// watermark into account.
    pub fn next_release(&self) -> Option<Instant> {
        let head = self.entries.front()?;
        Some(match self.watermark {
            Some(watermark) => head.at.max(watermark),
            None => head.at,
        })
    }

    /// Release the head entry if it is due at `now`.
    ///
    /// The released envelope's `scheduled_at` records the moment it became
    /// eligible, and the watermark moves to `now + delay` of the released
    /// entry.
    pub fn pop_due(&mut self, now: Instant) -> Option<RequestEnvelope> {
        let release = self.next_release()?;
        if release > now {
            return None;
        }
        let Entry { mut envelope, .. } = self.entries.pop_front()?;
        envelope.control.scheduled_at = Some(release.into_std());
        self.watermark = Some(now + envelope.control.delay);
        Some(envelope)
    }

    /// Wait until the head entry is due and release it.  Returns `None` at
    /// once when the queue is empty.
    pub async fn pop_when_due(&mut self) -> Option<RequestEnvelope> {
        loop {
            let release = self.next_release()?;
            sleep_until(release).await;
            if let Some(envelope) = self.pop_due(Instant::now()) {
                return Some(envelope);
            }
        }
    }

    /// Drop every queued entry and forget the pacing watermark.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.watermark = None;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
