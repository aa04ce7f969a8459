//! Signaling channel between the client and the SFU
//!
//! Request/response round-trips go through [`SignalingChannel`]; server-pushed
//! notifications arrive as [`ServerEvent`]s on the receiver returned by
//! [`SignalingConnector::open`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::credentials::SessionCredentials;
use crate::error::ChannelError;
use crate::types::{
    ConsumerDescriptor, DtlsParameters, MediaKind, ParticipantId, ProducerAnnouncement, ProducerId,
    RtpCapabilities, RtpParameters, TransportDirection, TransportId, TransportParams,
};

/// Notification pushed by the SFU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Router capabilities, sent once right after the channel opens
    #[serde(rename = "routerRtpCapabilities")]
    RouterCapabilities(RtpCapabilities),
    /// A remote participant started producing
    NewProducer(ProducerAnnouncement),
    /// A remote participant left the room
    #[serde(rename_all = "camelCase")]
    PeerDisconnected { participant_id: ParticipantId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest {
    pub direction: TransportDirection,
    pub force_tcp: bool,
}

/// Request/response half of the signaling channel
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn create_transport(
        &self,
        request: CreateTransportRequest,
    ) -> Result<TransportParams, ChannelError>;

    /// Supply the local DTLS parameters of a transport
    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), ChannelError>;

    /// Announce a local producer; the router answers with its id
    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, ChannelError>;

    /// Ask the router for a consumer of `producer_id`
    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerDescriptor, ChannelError>;

    async fn close(&self);
}

/// Opens signaling channels with session credentials
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn open(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::Receiver<ServerEvent>), ChannelError>;
}

/// Raw event-name keyed request/response transport (e.g. a websocket with acks)
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn request(
        &self,
        event: &'static str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, ChannelError>;

    async fn close(&self);
}

pub const CREATE_TRANSPORT_EVENT: &str = "createWebRtcTransport";
pub const CONNECT_TRANSPORT_EVENT: &str = "connectWebRtcTransport";
pub const PRODUCE_EVENT: &str = "produce";
pub const CONSUME_EVENT: &str = "consume";

/// [`SignalingChannel`] over an [`EventTransport`] with JSON payloads
///
/// A response object carrying a non-null `error` field is reported as
/// [`ChannelError::Remote`].
pub struct EventSignaling<T> {
    transport: T,
}

#[derive(Deserialize)]
struct ProduceResponse {
    id: ProducerId,
}

impl<T: EventTransport> EventSignaling<T> {
    pub const fn new(transport: T) -> Self {
        Self { transport }
    }

    async fn round_trip<R: DeserializeOwned>(
        &self,
        event: &'static str,
        payload: serde_json::Value,
    ) -> Result<R, ChannelError> {
        debug!(event, "Signaling request");
        let response = self.transport.request(event, payload).await?;

        if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
            let message = error
                .as_str()
                .map_or_else(|| error.to_string(), ToString::to_string);
            return Err(ChannelError::Remote(message));
        }

        serde_json::from_value(response).map_err(|e| ChannelError::UnexpectedResponse {
            event,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl<T: EventTransport> SignalingChannel for EventSignaling<T> {
    async fn create_transport(
        &self,
        request: CreateTransportRequest,
    ) -> Result<TransportParams, ChannelError> {
        self.round_trip(CREATE_TRANSPORT_EVENT, serde_json::to_value(&request)?)
            .await
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), ChannelError> {
        let payload = serde_json::json!({
            "transportId": transport_id,
            "dtlsParameters": dtls_parameters,
        });
        self.round_trip::<serde_json::Value>(CONNECT_TRANSPORT_EVENT, payload)
            .await
            .map(|_| ())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, ChannelError> {
        let payload = serde_json::json!({
            "transportId": transport_id,
            "kind": kind,
            "rtpParameters": rtp_parameters,
        });
        let response: ProduceResponse = self.round_trip(PRODUCE_EVENT, payload).await?;
        Ok(response.id)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerDescriptor, ChannelError> {
        let payload = serde_json::json!({
            "producerId": producer_id,
            "rtpCapabilities": rtp_capabilities,
        });
        self.round_trip(CONSUME_EVENT, payload).await
    }

    async fn close(&self) {
        self.transport.close().await;
    }
}
