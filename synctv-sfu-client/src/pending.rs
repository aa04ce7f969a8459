//! Buffer for remote-producer announcements that arrive before capability
//! negotiation completes
//!
//! Announcements are queued while the queue is `Buffering` or `Draining`.
//! The drain hands them out strictly in arrival order, including those that
//! were appended while it ran, and only flips the queue to `Ready` once it
//! finds the buffer empty. After that callers handle announcements live.

use std::collections::VecDeque;
use std::future::Future;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::{ParticipantId, ProducerAnnouncement};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Held until the drain
    Queued,
    /// Negotiation is complete; the caller handles the returned announcement now
    NotQueued(ProducerAnnouncement),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Buffering,
    Draining,
    Ready,
}

struct QueueInner {
    state: QueueState,
    buffer: VecDeque<ProducerAnnouncement>,
}

pub struct PendingProducerQueue {
    inner: Mutex<QueueInner>,
}

impl Default for PendingProducerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingProducerQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                state: QueueState::Buffering,
                buffer: VecDeque::new(),
            }),
        }
    }

    pub fn enqueue_if_not_ready(&self, announcement: ProducerAnnouncement) -> EnqueueOutcome {
        let mut inner = self.inner.lock();
        if inner.state == QueueState::Ready {
            return EnqueueOutcome::NotQueued(announcement);
        }

        debug!(
            producer_id = %announcement.producer_id,
            participant_id = %announcement.participant_id,
            queued = inner.buffer.len() + 1,
            "Queued remote producer until negotiation completes"
        );
        inner.buffer.push_back(announcement);
        EnqueueOutcome::Queued
    }

    /// Feed every buffered announcement to `handler`, one at a time in arrival
    /// order, then mark the queue ready.
    ///
    /// Only the first call drains; later calls return 0 without touching the
    /// handler.
    pub async fn drain_into<F, Fut>(&self, mut handler: F) -> usize
    where
        F: FnMut(ProducerAnnouncement) -> Fut,
        Fut: Future<Output = ()>,
    {
        {
            let mut inner = self.inner.lock();
            if inner.state != QueueState::Buffering {
                warn!(state = ?inner.state, "Pending producer queue already drained");
                return 0;
            }
            inner.state = QueueState::Draining;
        }

        let mut drained = 0;
        loop {
            let next = {
                let mut inner = self.inner.lock();
                let next = inner.buffer.pop_front();
                if next.is_none() {
                    inner.state = QueueState::Ready;
                }
                next
            };

            let Some(announcement) = next else { break };
            handler(announcement).await;
            drained += 1;
        }

        debug!(drained, "Pending producer queue drained");
        drained
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.lock().state == QueueState::Ready
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().buffer.is_empty()
    }

    /// Forget buffered announcements of a participant that already left
    pub fn discard_participant(&self, participant_id: &ParticipantId) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.buffer.len();
        inner
            .buffer
            .retain(|a| &a.participant_id != participant_id);
        before - inner.buffer.len()
    }

    /// Drop anything still buffered; used on teardown
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        if !inner.buffer.is_empty() {
            debug!(discarded = inner.buffer.len(), "Discarding pending announcements");
        }
        inner.buffer.clear();
        inner.state = QueueState::Ready;
    }
}
