//! Send/receive transport lifecycle
//!
//! At most one transport per direction is ever under construction or alive.
//! Construction is serialized by an async mutex per direction; callers that
//! arrive while a transport is being built suspend on the mutex and reuse the
//! cached handle once it is released.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ChannelError, Error, Result};
use crate::negotiator::{
    CapabilityNegotiator, RecvTransportHandle, SendTransportHandle, TransportHandle,
    TransportListener,
};
use crate::signaling::{CreateTransportRequest, SignalingChannel, PRODUCE_EVENT};
use crate::types::{
    ConnectionState, DtlsParameters, MediaKind, ProducerId, RtpParameters, TransportDirection,
    TransportId, TransportParams,
};

/// A negotiated transport plus its connection state
pub struct Transport<H: ?Sized> {
    id: TransportId,
    direction: TransportDirection,
    handle: Arc<H>,
    state: Arc<RwLock<ConnectionState>>,
}

pub type SendTransport = Transport<dyn SendTransportHandle>;
pub type RecvTransport = Transport<dyn RecvTransportHandle>;

impl<H: TransportHandle + ?Sized> Transport<H> {
    fn new(
        direction: TransportDirection,
        handle: Arc<H>,
        state: Arc<RwLock<ConnectionState>>,
    ) -> Self {
        Self {
            id: handle.id().clone(),
            direction,
            handle,
            state,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &TransportId {
        &self.id
    }

    #[must_use]
    pub const fn direction(&self) -> TransportDirection {
        self.direction
    }

    #[must_use]
    pub fn handle(&self) -> &H {
        &self.handle
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Close the underlying handle; idempotent
    pub fn close(&self) {
        {
            let mut state = self.state.write();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        self.handle.close();
        info!(transport_id = %self.id, direction = %self.direction, "Transport closed");
    }
}

/// Answers transport callbacks with signaling round-trips
struct SignalingListener {
    channel: Arc<dyn SignalingChannel>,
    transport_id: TransportId,
    direction: TransportDirection,
    state: Arc<RwLock<ConnectionState>>,
}

impl SignalingListener {
    /// Move to `next` unless the transport was already closed
    fn advance(&self, next: ConnectionState) {
        let mut state = self.state.write();
        if *state != ConnectionState::Closed && *state != next {
            debug!(
                transport_id = %self.transport_id,
                old_state = ?*state,
                new_state = ?next,
                "Transport state change"
            );
            *state = next;
        }
    }
}

#[async_trait]
impl TransportListener for SignalingListener {
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> std::result::Result<(), ChannelError> {
        self.advance(ConnectionState::Connecting);

        match self
            .channel
            .connect_transport(&self.transport_id, dtls_parameters)
            .await
        {
            Ok(()) => {
                self.advance(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!(
                    transport_id = %self.transport_id,
                    error = %e,
                    "Transport connect rejected"
                );
                self.advance(ConnectionState::New);
                Err(e)
            }
        }
    }

    async fn on_produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> std::result::Result<ProducerId, ChannelError> {
        if self.direction != TransportDirection::Send {
            return Err(ChannelError::UnexpectedResponse {
                event: PRODUCE_EVENT,
                reason: "receive transport cannot produce".to_string(),
            });
        }

        self.channel
            .produce(&self.transport_id, kind, rtp_parameters)
            .await
    }

    fn on_connection_state_change(&self, state: ConnectionState) {
        self.advance(state);
    }
}

/// Creation guard plus the cached transport of one direction
struct TransportSlot<H: ?Sized> {
    creation: Mutex<()>,
    current: RwLock<Option<Arc<Transport<H>>>>,
}

impl<H: TransportHandle + ?Sized> TransportSlot<H> {
    fn new() -> Self {
        Self {
            creation: Mutex::new(()),
            current: RwLock::new(None),
        }
    }

    fn cached(&self) -> Option<Arc<Transport<H>>> {
        self.current.read().clone()
    }

    fn close(&self) {
        if let Some(transport) = self.current.write().take() {
            transport.close();
        }
    }
}

/// Owns the single outbound and single inbound transport of a broadcast
pub struct TransportManager {
    channel: Arc<dyn SignalingChannel>,
    negotiator: Arc<dyn CapabilityNegotiator>,
    force_tcp: bool,
    cancel: CancellationToken,
    outbound: TransportSlot<dyn SendTransportHandle>,
    inbound: TransportSlot<dyn RecvTransportHandle>,
}

impl TransportManager {
    pub fn new(
        channel: Arc<dyn SignalingChannel>,
        negotiator: Arc<dyn CapabilityNegotiator>,
        force_tcp: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel,
            negotiator,
            force_tcp,
            cancel,
            outbound: TransportSlot::new(),
            inbound: TransportSlot::new(),
        }
    }

    /// Get the send transport, creating it on first use
    pub async fn ensure_outbound(&self) -> Result<Arc<SendTransport>> {
        let negotiator = Arc::clone(&self.negotiator);
        self.ensure(&self.outbound, TransportDirection::Send, |params, listener| async move {
            negotiator.create_send_transport(params, listener).await
        })
        .await
    }

    /// Get the receive transport, creating it on first use
    pub async fn ensure_inbound(&self) -> Result<Arc<RecvTransport>> {
        let negotiator = Arc::clone(&self.negotiator);
        self.ensure(&self.inbound, TransportDirection::Recv, |params, listener| async move {
            negotiator.create_recv_transport(params, listener).await
        })
        .await
    }

    async fn ensure<H, F, Fut>(
        &self,
        slot: &TransportSlot<H>,
        direction: TransportDirection,
        construct: F,
    ) -> Result<Arc<Transport<H>>>
    where
        H: TransportHandle + ?Sized,
        F: FnOnce(TransportParams, Arc<dyn TransportListener>) -> Fut,
        Fut: Future<Output = anyhow::Result<Arc<H>>>,
    {
        if let Some(transport) = slot.cached() {
            return Ok(transport);
        }

        let _creating = slot.creation.lock().await;

        // Whoever held the guard before us may have finished the job
        if let Some(transport) = slot.cached() {
            debug!(direction = %direction, "Reusing transport created by concurrent caller");
            return Ok(transport);
        }
        self.check_open()?;

        debug!(direction = %direction, "Requesting transport parameters");
        let params = self
            .channel
            .create_transport(CreateTransportRequest {
                direction,
                force_tcp: self.force_tcp,
            })
            .await?;
        self.check_open()?;

        let state = Arc::new(RwLock::new(ConnectionState::New));
        let listener: Arc<dyn TransportListener> = Arc::new(SignalingListener {
            channel: Arc::clone(&self.channel),
            transport_id: params.id.clone(),
            direction,
            state: Arc::clone(&state),
        });

        let handle = construct(params, listener)
            .await
            .map_err(|e| Error::negotiation(&e))?;
        let transport = Arc::new(Transport::new(direction, handle, state));

        *slot.current.write() = Some(Arc::clone(&transport));
        // Teardown cancels before it empties the slot, so either it saw this
        // transport or we see the cancellation here.
        if self.cancel.is_cancelled() {
            slot.close();
            return Err(Error::Cancelled);
        }

        info!(
            transport_id = %transport.id(),
            direction = %direction,
            "Transport created"
        );
        Ok(transport)
    }

    fn check_open(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    #[must_use]
    pub fn outbound(&self) -> Option<Arc<SendTransport>> {
        self.outbound.cached()
    }

    #[must_use]
    pub fn inbound(&self) -> Option<Arc<RecvTransport>> {
        self.inbound.cached()
    }

    /// Connection state of the live transport of `direction`, if any
    #[must_use]
    pub fn connection_state(&self, direction: TransportDirection) -> Option<ConnectionState> {
        match direction {
            TransportDirection::Send => self.outbound().map(|t| t.connection_state()),
            TransportDirection::Recv => self.inbound().map(|t| t.connection_state()),
        }
    }

    /// Close both transports; creations still in flight discard their result
    pub fn close(&self) {
        self.cancel.cancel();
        self.outbound.close();
        self.inbound.close();
    }
}
