//! One broadcast epoch: from `start_broadcast` until stop or disconnect
//!
//! A [`Broadcast`] owns the transports, producers, consumers and pending
//! announcements of a single epoch plus the cancellation token that marks it
//! torn down. Work started in an epoch re-checks the token after every
//! suspension point and discards its result once the epoch is gone.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use crate::consumer::{AttachOutcome, ConsumerRegistry, ParticipantStream};
use crate::error::{Error, Result};
use crate::media::{LocalMedia, MediaDevices};
use crate::negotiator::CapabilityNegotiator;
use crate::pending::{EnqueueOutcome, PendingProducerQueue};
use crate::producer::ProducerSet;
use crate::session::SessionEvent;
use crate::signaling::{ServerEvent, SignalingChannel};
use crate::transport::TransportManager;
use crate::types::{
    ConsumerId, ParticipantId, ProducerAnnouncement, ProducerId, RtpCapabilities,
};

/// How a single remote-producer announcement was resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnouncementOutcome {
    Consumed {
        consumer_id: ConsumerId,
        replaced: Option<ProducerId>,
    },
    /// Announced by the local participant
    SelfLoopback,
    /// A newer announcement for the same slot won
    Superseded,
    /// The broadcast ended before the consumer was registered
    Discarded,
    /// Logged and dropped; other announcements are unaffected
    Failed,
}

pub(crate) struct BroadcastParams {
    pub epoch: u64,
    pub local_participant: ParticipantId,
    pub cancel: CancellationToken,
    pub channel: Arc<dyn SignalingChannel>,
    pub negotiator: Arc<dyn CapabilityNegotiator>,
    pub media_devices: Arc<dyn MediaDevices>,
    pub media: LocalMedia,
    pub force_tcp: bool,
    pub events: broadcast::Sender<SessionEvent>,
}

pub struct Broadcast {
    epoch: u64,
    local_participant: ParticipantId,
    cancel: CancellationToken,
    channel: Arc<dyn SignalingChannel>,
    negotiator: Arc<dyn CapabilityNegotiator>,
    media_devices: Arc<dyn MediaDevices>,
    media: Mutex<Option<LocalMedia>>,
    rtp_capabilities: RwLock<Option<RtpCapabilities>>,
    transports: TransportManager,
    producers: ProducerSet,
    consumers: ConsumerRegistry,
    pending: PendingProducerQueue,
    events: broadcast::Sender<SessionEvent>,
}

impl Broadcast {
    pub(crate) fn new(params: BroadcastParams) -> Self {
        let transports = TransportManager::new(
            Arc::clone(&params.channel),
            Arc::clone(&params.negotiator),
            params.force_tcp,
            params.cancel.clone(),
        );

        Self {
            epoch: params.epoch,
            local_participant: params.local_participant,
            cancel: params.cancel,
            channel: params.channel,
            negotiator: params.negotiator,
            media_devices: params.media_devices,
            media: Mutex::new(Some(params.media)),
            rtp_capabilities: RwLock::new(None),
            transports,
            producers: ProducerSet::new(),
            consumers: ConsumerRegistry::new(),
            pending: PendingProducerQueue::new(),
            events: params.events,
        }
    }

    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    #[must_use]
    pub fn rtp_capabilities(&self) -> Option<RtpCapabilities> {
        self.rtp_capabilities.read().clone()
    }

    #[must_use]
    pub const fn transports(&self) -> &TransportManager {
        &self.transports
    }

    #[must_use]
    pub const fn producers(&self) -> &ProducerSet {
        &self.producers
    }

    #[must_use]
    pub const fn consumers(&self) -> &ConsumerRegistry {
        &self.consumers
    }

    #[must_use]
    pub const fn pending(&self) -> &PendingProducerQueue {
        &self.pending
    }

    /// Load the router's capabilities and keep the negotiated local set
    pub async fn negotiate(&self, router_capabilities: &RtpCapabilities) -> Result<()> {
        let local = self
            .negotiator
            .load(router_capabilities)
            .await
            .map_err(|e| Error::negotiation(&e))?;
        self.check_open()?;

        *self.rtp_capabilities.write() = Some(local);
        debug!(epoch = self.epoch, "Capabilities negotiated");
        Ok(())
    }

    /// Create the send transport and produce every captured track
    pub async fn publish_local_media(&self) -> Result<usize> {
        let transport = self.transports.ensure_outbound().await?;
        let media = self.media.lock().clone().ok_or(Error::Cancelled)?;

        let published = self.producers.publish_local_media(&media, &transport).await?;
        if self.is_closed() {
            self.producers.teardown();
            return Err(Error::Cancelled);
        }
        Ok(published)
    }

    /// Hand every announcement buffered during negotiation to the live path
    pub async fn drain_pending(&self) -> usize {
        self.pending
            .drain_into(|announcement| async move {
                self.handle_remote_producer(announcement).await;
            })
            .await
    }

    /// Consume a remote producer and attach its track to the participant.
    ///
    /// Failures are logged and confined to this announcement.
    pub async fn handle_remote_producer(
        &self,
        announcement: ProducerAnnouncement,
    ) -> AnnouncementOutcome {
        if announcement.participant_id == self.local_participant {
            debug!(producer_id = %announcement.producer_id, "Ignoring own producer");
            return AnnouncementOutcome::SelfLoopback;
        }
        if self.is_closed() {
            return AnnouncementOutcome::Discarded;
        }

        let sequence = self.consumers.next_sequence();
        match self.consume(&announcement, sequence).await {
            Ok(outcome) => outcome,
            Err(Error::Cancelled) => {
                debug!(
                    epoch = self.epoch,
                    producer_id = %announcement.producer_id,
                    "Broadcast ended while consuming, discarding"
                );
                AnnouncementOutcome::Discarded
            }
            Err(e) => {
                warn!(
                    producer_id = %announcement.producer_id,
                    participant_id = %announcement.participant_id,
                    kind = %announcement.kind,
                    error = %e,
                    "Failed to consume remote producer"
                );
                AnnouncementOutcome::Failed
            }
        }
    }

    async fn consume(
        &self,
        announcement: &ProducerAnnouncement,
        sequence: u64,
    ) -> Result<AnnouncementOutcome> {
        let rtp_capabilities = self
            .rtp_capabilities()
            .ok_or_else(|| Error::Negotiation("capabilities not negotiated".to_string()))?;

        let transport = self.transports.ensure_inbound().await?;
        self.check_open()?;

        let descriptor = self
            .channel
            .consume(&announcement.producer_id, &rtp_capabilities)
            .await?;
        self.check_open()?;

        if descriptor.kind != announcement.kind {
            warn!(
                producer_id = %announcement.producer_id,
                announced = %announcement.kind,
                described = %descriptor.kind,
                "Consumer kind differs from announcement"
            );
        }

        let consumer = transport
            .handle()
            .consume(&descriptor)
            .await
            .map_err(|e| Error::negotiation(&e))?;
        if self.is_closed() {
            consumer.close();
            return Err(Error::Cancelled);
        }

        let consumer_id = consumer.id().clone();
        let outcome = match self
            .consumers
            .attach(&announcement.participant_id, sequence, consumer)
        {
            AttachOutcome::Attached { stream, replaced } => {
                info!(
                    consumer_id = %consumer_id,
                    producer_id = %announcement.producer_id,
                    participant_id = %announcement.participant_id,
                    "Remote producer consumed"
                );
                self.publish_event(SessionEvent::ParticipantUpdated(stream));
                AnnouncementOutcome::Consumed {
                    consumer_id,
                    replaced,
                }
            }
            AttachOutcome::Superseded => AnnouncementOutcome::Superseded,
        };

        // Teardown cancels before clearing; catch a clear that ran first
        if self.is_closed() {
            self.consumers.clear();
            return Err(Error::Cancelled);
        }
        Ok(outcome)
    }

    pub fn handle_peer_disconnected(&self, participant_id: &ParticipantId) -> bool {
        let discarded = self.pending.discard_participant(participant_id);
        if discarded > 0 {
            debug!(participant_id = %participant_id, discarded, "Dropped queued producers of departed peer");
        }

        let removed = self.consumers.remove_participant(participant_id);
        if removed {
            self.publish_event(SessionEvent::ParticipantLeft(participant_id.clone()));
        } else {
            debug!(participant_id = %participant_id, "Disconnected peer had no streams");
        }
        removed
    }

    fn publish_event(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    #[must_use]
    pub fn participants(&self) -> Vec<ParticipantStream> {
        self.consumers.participants()
    }

    /// Release local media, close both transports, clear producers,
    /// consumers and pending announcements; idempotent
    pub fn teardown(&self) {
        self.cancel.cancel();
        self.pending.clear();
        self.producers.teardown();
        self.consumers.clear();
        self.transports.close();

        if let Some(media) = self.media.lock().take() {
            self.media_devices.release(media);
            info!(epoch = self.epoch, "Broadcast torn down, local media released");
        }
    }

    /// Dispatch server-pushed events for this epoch until the stream ends
    ///
    /// Router capabilities go to `router_capabilities` (first one only).
    /// Announcements are buffered until `negotiated` delivers a reply sender;
    /// the buffered ones are then drained here, before the next event is read,
    /// and the drained count is sent back. Later announcements are handled in
    /// arrival order. Once the epoch is torn down every event is a no-op.
    pub(crate) async fn pump_events(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ServerEvent>,
        router_capabilities: oneshot::Sender<RtpCapabilities>,
        mut negotiated: oneshot::Receiver<oneshot::Sender<usize>>,
    ) {
        let mut router_capabilities = Some(router_capabilities);
        let mut awaiting_negotiation = true;

        loop {
            let event = tokio::select! {
                biased;
                signal = &mut negotiated, if awaiting_negotiation => {
                    awaiting_negotiation = false;
                    // A dropped sender means the start never completed
                    if let Ok(reply) = signal {
                        let drained = self.drain_pending().await;
                        let _ = reply.send(drained);
                    }
                    continue;
                }
                event = events.recv() => event,
            };
            let Some(event) = event else { break };

            match event {
                ServerEvent::RouterCapabilities(capabilities) => match router_capabilities.take() {
                    Some(tx) => {
                        let _ = tx.send(capabilities);
                    }
                    None => debug!(epoch = self.epoch, "Ignoring repeated router capabilities"),
                },
                ServerEvent::NewProducer(announcement) => {
                    if self.is_closed() {
                        debug!(
                            epoch = self.epoch,
                            producer_id = %announcement.producer_id,
                            "Broadcast stopped, discarding new producer"
                        );
                        continue;
                    }
                    if let EnqueueOutcome::NotQueued(announcement) =
                        self.pending.enqueue_if_not_ready(announcement)
                    {
                        self.handle_remote_producer(announcement).await;
                    }
                }
                ServerEvent::PeerDisconnected { participant_id } => {
                    if self.is_closed() {
                        debug!(
                            epoch = self.epoch,
                            participant_id = %participant_id,
                            "Broadcast stopped, ignoring peer departure"
                        );
                        continue;
                    }
                    self.handle_peer_disconnected(&participant_id);
                }
            }
        }

        debug!(epoch = self.epoch, "Signaling event stream ended");
    }
}
