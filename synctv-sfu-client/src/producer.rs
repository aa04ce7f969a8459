//! Locally published producers, one per media kind

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::media::LocalMedia;
use crate::negotiator::ProducerHandle;
use crate::transport::SendTransport;
use crate::types::{MediaKind, ProducerId};

#[derive(Default)]
pub struct ProducerSet {
    producers: Mutex<BTreeMap<MediaKind, Box<dyn ProducerHandle>>>,
}

impl ProducerSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce every available local track on `transport`
    ///
    /// Kinds without a captured track are skipped. Returns the number of
    /// producers created.
    pub async fn publish_local_media(
        &self,
        media: &LocalMedia,
        transport: &SendTransport,
    ) -> Result<usize> {
        let mut published = 0;

        for kind in MediaKind::ALL {
            let Some(track) = media.track(kind) else {
                debug!(kind = %kind, "No local track, skipping producer");
                continue;
            };

            let producer = transport
                .handle()
                .produce(track)
                .await
                .map_err(|e| Error::negotiation(&e))?;

            info!(
                producer_id = %producer.id(),
                kind = %kind,
                transport_id = %transport.id(),
                "Local producer published"
            );

            if let Some(previous) = self.producers.lock().insert(kind, producer) {
                previous.close();
            }
            published += 1;
        }

        Ok(published)
    }

    #[must_use]
    pub fn producer_id(&self, kind: MediaKind) -> Option<ProducerId> {
        self.producers.lock().get(&kind).map(|p| p.id().clone())
    }

    /// Kinds currently being published
    #[must_use]
    pub fn kinds(&self) -> Vec<MediaKind> {
        self.producers.lock().keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.producers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.producers.lock().is_empty()
    }

    /// Close and forget every producer; idempotent
    pub fn teardown(&self) {
        let producers = std::mem::take(&mut *self.producers.lock());
        for (kind, producer) in producers {
            producer.close();
            debug!(producer_id = %producer.id(), kind = %kind, "Local producer closed");
        }
    }
}
