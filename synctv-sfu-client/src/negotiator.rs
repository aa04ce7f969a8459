//! Capability negotiation and transport handle seams
//!
//! The negotiator owns ICE/DTLS/RTP mechanics. The orchestrator only sees
//! opaque handles and answers the callbacks a transport raises through its
//! [`TransportListener`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::media::MediaTrack;
use crate::types::{
    ConnectionState, ConsumerDescriptor, ConsumerId, DtlsParameters, MediaKind, ProducerId,
    RtpCapabilities, RtpParameters, TransportId, TransportParams,
};

/// Callbacks a transport handle raises while negotiating
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// The transport needs its DTLS parameters delivered to the router.
    /// The handle's pending operation resolves or rejects with the result.
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> Result<(), ChannelError>;

    /// The send transport needs a router-assigned id for a new producer
    async fn on_produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, ChannelError>;

    /// Connection state reported by the underlying ICE/DTLS stack
    fn on_connection_state_change(&self, state: ConnectionState);
}

/// Loads router capabilities and builds transport handles
#[async_trait]
pub trait CapabilityNegotiator: Send + Sync {
    /// Negotiate the local capability set against the router's
    async fn load(&self, router_capabilities: &RtpCapabilities) -> anyhow::Result<RtpCapabilities>;

    async fn create_send_transport(
        &self,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> anyhow::Result<Arc<dyn SendTransportHandle>>;

    async fn create_recv_transport(
        &self,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> anyhow::Result<Arc<dyn RecvTransportHandle>>;
}

pub trait TransportHandle: Send + Sync {
    fn id(&self) -> &TransportId;

    fn close(&self);
}

#[async_trait]
pub trait SendTransportHandle: TransportHandle {
    /// Start sending `track`; raises `on_connect` first if not yet connected
    async fn produce(&self, track: &MediaTrack) -> anyhow::Result<Box<dyn ProducerHandle>>;
}

#[async_trait]
pub trait RecvTransportHandle: TransportHandle {
    /// Start receiving the flow described by `descriptor`
    async fn consume(
        &self,
        descriptor: &ConsumerDescriptor,
    ) -> anyhow::Result<Box<dyn ConsumerHandle>>;
}

pub trait ProducerHandle: Send + Sync {
    fn id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    fn close(&self);
}

pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> &ConsumerId;

    fn producer_id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    /// The received track
    fn track(&self) -> MediaTrack;

    fn close(&self);
}
