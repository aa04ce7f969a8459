//! Consumer registry and per-participant stream aggregation
//!
//! Every consumed track lands in its participant's audio or video slot. A slot
//! holds at most one track; a newer announcement for the same kind replaces
//! the older one and the replaced consumer is closed. Announcements carry a
//! sequence number taken when handling starts, so a slower, older consume
//! that completes late cannot overwrite a newer track.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::media::MediaTrack;
use crate::negotiator::ConsumerHandle;
use crate::types::{ConsumerId, MediaKind, ParticipantId, ProducerId};

/// Track occupying one media slot of a participant
struct TrackSlot {
    sequence: u64,
    consumer_id: ConsumerId,
    producer_id: ProducerId,
    track: MediaTrack,
}

struct Participant {
    joined_at: DateTime<Utc>,
    audio: Option<TrackSlot>,
    video: Option<TrackSlot>,
}

impl Participant {
    fn new() -> Self {
        Self {
            joined_at: Utc::now(),
            audio: None,
            video: None,
        }
    }

    fn slot_mut(&mut self, kind: MediaKind) -> &mut Option<TrackSlot> {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    fn slots(&self) -> impl Iterator<Item = &TrackSlot> {
        self.audio.iter().chain(self.video.iter())
    }

    fn snapshot(&self, participant_id: &ParticipantId) -> ParticipantStream {
        ParticipantStream {
            participant_id: participant_id.clone(),
            audio_producer_id: self.audio.as_ref().map(|s| s.producer_id.clone()),
            video_producer_id: self.video.as_ref().map(|s| s.producer_id.clone()),
            tracks: self.slots().map(|s| s.track.clone()).collect(),
            joined_at: self.joined_at,
        }
    }
}

/// Playable view of one remote participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantStream {
    pub participant_id: ParticipantId,
    pub audio_producer_id: Option<ProducerId>,
    pub video_producer_id: Option<ProducerId>,
    /// Audio first, then video
    pub tracks: Vec<MediaTrack>,
    pub joined_at: DateTime<Utc>,
}

/// What happened when a consumer was attached
pub enum AttachOutcome {
    /// The track now fills its slot
    Attached {
        stream: ParticipantStream,
        replaced: Option<ProducerId>,
    },
    /// A newer announcement already filled the slot; the consumer was closed
    Superseded,
}

#[derive(Default)]
struct RegistryInner {
    consumers: HashMap<ConsumerId, Box<dyn ConsumerHandle>>,
    participants: BTreeMap<ParticipantId, Participant>,
}

/// Owns every consumer of a broadcast and the participants they feed
#[derive(Default)]
pub struct ConsumerRegistry {
    sequence: AtomicU64,
    inner: Mutex<RegistryInner>,
}

impl ConsumerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number for an announcement about to be handled
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `consumer` and place its track in the participant's slot
    pub fn attach(
        &self,
        participant_id: &ParticipantId,
        sequence: u64,
        consumer: Box<dyn ConsumerHandle>,
    ) -> AttachOutcome {
        let kind = consumer.kind();
        let mut inner = self.inner.lock();
        let RegistryInner {
            consumers,
            participants,
        } = &mut *inner;

        let participant = participants
            .entry(participant_id.clone())
            .or_insert_with(Participant::new);
        let slot = participant.slot_mut(kind);

        if slot.as_ref().is_some_and(|s| s.sequence > sequence) {
            debug!(
                participant_id = %participant_id,
                consumer_id = %consumer.id(),
                kind = %kind,
                "Newer track already attached, closing superseded consumer"
            );
            consumer.close();
            return AttachOutcome::Superseded;
        }

        let previous = slot.replace(TrackSlot {
            sequence,
            consumer_id: consumer.id().clone(),
            producer_id: consumer.producer_id().clone(),
            track: consumer.track(),
        });

        let replaced = previous.map(|old| {
            if let Some(old_consumer) = consumers.remove(&old.consumer_id) {
                old_consumer.close();
            }
            info!(
                participant_id = %participant_id,
                kind = %kind,
                old_producer_id = %old.producer_id,
                new_producer_id = %consumer.producer_id(),
                "Replaced remote track"
            );
            old.producer_id
        });

        let stream = participant.snapshot(participant_id);
        consumers.insert(consumer.id().clone(), consumer);

        AttachOutcome::Attached { stream, replaced }
    }

    /// Drop a participant and close all of its consumers
    pub fn remove_participant(&self, participant_id: &ParticipantId) -> bool {
        let mut inner = self.inner.lock();
        let Some(participant) = inner.participants.remove(participant_id) else {
            return false;
        };

        let consumer_ids: Vec<ConsumerId> =
            participant.slots().map(|s| s.consumer_id.clone()).collect();
        for consumer_id in consumer_ids {
            if let Some(consumer) = inner.consumers.remove(&consumer_id) {
                consumer.close();
            }
        }

        info!(participant_id = %participant_id, "Remote participant removed");
        true
    }

    #[must_use]
    pub fn participant(&self, participant_id: &ParticipantId) -> Option<ParticipantStream> {
        self.inner
            .lock()
            .participants
            .get(participant_id)
            .map(|p| p.snapshot(participant_id))
    }

    #[must_use]
    pub fn participants(&self) -> Vec<ParticipantStream> {
        self.inner
            .lock()
            .participants
            .iter()
            .map(|(id, p)| p.snapshot(id))
            .collect()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    #[must_use]
    pub fn contains_consumer(&self, consumer_id: &ConsumerId) -> bool {
        self.inner.lock().consumers.contains_key(consumer_id)
    }

    /// Close every consumer and forget every participant; idempotent
    pub fn clear(&self) {
        let inner = std::mem::take(&mut *self.inner.lock());
        for consumer in inner.consumers.values() {
            consumer.close();
        }
        if !inner.participants.is_empty() {
            debug!(
                participants = inner.participants.len(),
                consumers = inner.consumers.len(),
                "Consumer registry cleared"
            );
        }
    }
}
