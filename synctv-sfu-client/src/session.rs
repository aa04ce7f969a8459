//! Session lifecycle state machine
//!
//! `Idle → Connected → Negotiating → Broadcasting`, with `stop_broadcast`
//! returning to `Connected` and `disconnect` returning to `Idle` from anywhere.
//! `close` ends the session in `Stopped`.
//!
//! Each `start_broadcast` begins a new broadcast epoch. `stop_broadcast` and
//! `disconnect` tear the epoch down immediately; work of that epoch that is
//! still in flight notices the cancelled token and discards its result.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::{Broadcast, BroadcastParams};
use crate::config::ClientConfig;
use crate::consumer::ParticipantStream;
use crate::credentials::{CredentialProvider, SessionCredentials};
use crate::error::{ChannelError, Error, Result};
use crate::media::MediaDevices;
use crate::negotiator::CapabilityNegotiator;
use crate::signaling::{SignalingChannel, SignalingConnector};
use crate::types::{
    ConnectionState, MediaKind, ParticipantId, RoomId, RtpCapabilities, TransportDirection,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connected,
    Negotiating,
    Broadcasting,
    /// Terminal; entered through [`SfuSession::close`]
    Stopped,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connected => "connected",
            Self::Negotiating => "negotiating",
            Self::Broadcasting => "broadcasting",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote participant changes, published to [`SfuSession::subscribe_events`]
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A track was added to or replaced in a participant's stream
    ParticipantUpdated(ParticipantStream),
    ParticipantLeft(ParticipantId),
}

/// External services the session drives
#[derive(Clone)]
pub struct Collaborators {
    pub credentials: Arc<dyn CredentialProvider>,
    pub media: Arc<dyn MediaDevices>,
    pub signaling: Arc<dyn SignalingConnector>,
    pub negotiator: Arc<dyn CapabilityNegotiator>,
}

#[derive(Debug, Clone)]
struct Identity {
    room_id: RoomId,
    participant_id: ParticipantId,
}

/// An open signaling channel and the task pumping its server events
struct SignalingLink {
    channel: Arc<dyn SignalingChannel>,
    pump: JoinHandle<()>,
}

impl SignalingLink {
    async fn close(self) {
        self.pump.abort();
        self.channel.close().await;
        debug!("Signaling channel closed");
    }
}

enum BroadcastSlot {
    Empty,
    /// Media acquisition or channel setup in progress
    Starting { epoch: u64, cancel: CancellationToken },
    Active(Arc<Broadcast>),
}

struct SessionInner {
    identity: Option<Identity>,
    credentials: Option<SessionCredentials>,
    pending_connect: Option<CancellationToken>,
    broadcast: BroadcastSlot,
    signaling: Option<SignalingLink>,
    epoch: u64,
}

/// Client-side SFU session for one `(room, participant)` pair
pub struct SfuSession {
    config: ClientConfig,
    collaborators: Collaborators,
    inner: Mutex<SessionInner>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SfuSession {
    #[must_use]
    pub fn new(config: ClientConfig, collaborators: Collaborators) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (events, _) = broadcast::channel(config.signaling.event_buffer.max(1));

        Self {
            config,
            collaborators,
            inner: Mutex::new(SessionInner {
                identity: None,
                credentials: None,
                pending_connect: None,
                broadcast: BroadcastSlot::Empty,
                signaling: None,
                epoch: 0,
            }),
            state,
            events,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Only called with the inner lock held
    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Session state changed");
        }
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            state: self.state(),
        }
    }

    /// Acquire session credentials for `(room_id, participant_id)`
    ///
    /// On failure the session stays `Idle`; nothing is retried.
    pub async fn connect(&self, room_id: RoomId, participant_id: ParticipantId) -> Result<()> {
        let cancel = {
            let mut inner = self.inner.lock();
            if self.state() != SessionState::Idle || inner.pending_connect.is_some() {
                return Err(self.invalid("connect"));
            }
            let cancel = CancellationToken::new();
            inner.pending_connect = Some(cancel.clone());
            cancel
        };

        let acquired = tokio::select! {
            acquired = self.collaborators.credentials.acquire(&room_id, &participant_id) => acquired,
            () = cancel.cancelled() => return Err(Error::Cancelled),
        };

        let mut inner = self.inner.lock();
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        inner.pending_connect = None;

        match acquired {
            Ok(credentials) => {
                info!(
                    room_id = %room_id,
                    participant_id = %participant_id,
                    ice_servers = credentials.ice_servers.len(),
                    "Session credentials acquired"
                );
                inner.identity = Some(Identity {
                    room_id,
                    participant_id,
                });
                inner.credentials = Some(credentials);
                self.set_state(SessionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!(
                    room_id = %room_id,
                    participant_id = %participant_id,
                    error = %e,
                    "Credential handshake failed"
                );
                Err(Error::Credential(format!("{e:#}")))
            }
        }
    }

    /// Capture local media, open signaling, negotiate and publish
    ///
    /// Remote producers announced before negotiation completes are consumed
    /// once it does, in arrival order. A failure returns the session to
    /// `Connected` with every partially created resource released.
    pub async fn start_broadcast(&self) -> Result<()> {
        let (epoch, cancel, identity, credentials, stale_link) = {
            let mut inner = self.inner.lock();
            if self.state() != SessionState::Connected
                || !matches!(inner.broadcast, BroadcastSlot::Empty)
            {
                return Err(self.invalid("start broadcast"));
            }
            let (Some(identity), Some(credentials)) =
                (inner.identity.clone(), inner.credentials.clone())
            else {
                return Err(self.invalid("start broadcast"));
            };

            inner.epoch += 1;
            let epoch = inner.epoch;
            let cancel = CancellationToken::new();
            inner.broadcast = BroadcastSlot::Starting {
                epoch,
                cancel: cancel.clone(),
            };
            (epoch, cancel, identity, credentials, inner.signaling.take())
        };

        // Left open by the previous stop_broadcast
        if let Some(link) = stale_link {
            link.close().await;
        }

        let constraints = self.config.media.constraints();
        let media = match self.collaborators.media.acquire(&constraints).await {
            Ok(media) if media.is_empty() && (constraints.audio || constraints.video) => {
                self.collaborators.media.release(media);
                self.abandon_start(epoch);
                return Err(Error::MediaAcquisition("no local tracks available".to_string()));
            }
            Ok(media) => media,
            Err(e) => {
                self.abandon_start(epoch);
                warn!(epoch, error = %e, "Local media unavailable");
                return Err(Error::MediaAcquisition(format!("{e:#}")));
            }
        };
        if cancel.is_cancelled() {
            self.collaborators.media.release(media);
            return Err(Error::Cancelled);
        }

        let (channel, server_events) = match self.collaborators.signaling.open(&credentials).await {
            Ok(opened) => opened,
            Err(e) => {
                self.collaborators.media.release(media);
                self.abandon_start(epoch);
                warn!(epoch, error = %e, "Failed to open signaling channel");
                return Err(e.into());
            }
        };

        let broadcast = Arc::new(Broadcast::new(BroadcastParams {
            epoch,
            local_participant: identity.participant_id.clone(),
            cancel: cancel.clone(),
            channel: Arc::clone(&channel),
            negotiator: Arc::clone(&self.collaborators.negotiator),
            media_devices: Arc::clone(&self.collaborators.media),
            media,
            force_tcp: self.config.transport.force_tcp,
            events: self.events.clone(),
        }));

        let (capabilities_tx, capabilities_rx) = oneshot::channel();
        let (negotiated_tx, negotiated_rx) = oneshot::channel();
        let pump = tokio::spawn(Arc::clone(&broadcast).pump_events(
            server_events,
            capabilities_tx,
            negotiated_rx,
        ));
        let link = SignalingLink { channel, pump };

        let rejected = {
            let mut inner = self.inner.lock();
            if cancel.is_cancelled() {
                Some(link)
            } else {
                inner.broadcast = BroadcastSlot::Active(Arc::clone(&broadcast));
                inner.signaling = Some(link);
                self.set_state(SessionState::Negotiating);
                None
            }
        };
        if let Some(link) = rejected {
            broadcast.teardown();
            link.close().await;
            return Err(Error::Cancelled);
        }

        let published = match Self::negotiate(&broadcast, capabilities_rx).await {
            Ok(published) => published,
            Err(e) => return Err(self.fail_start(&broadcast, e).await),
        };

        let entered = {
            let inner = self.inner.lock();
            let current = matches!(
                &inner.broadcast,
                BroadcastSlot::Active(active) if Arc::ptr_eq(active, &broadcast)
            );
            if current && !broadcast.is_closed() {
                self.set_state(SessionState::Broadcasting);
                true
            } else {
                false
            }
        };
        if !entered {
            return Err(Error::Cancelled);
        }

        // The pump drains buffered announcements; it keeps going if this future is dropped
        let (reply_tx, reply_rx) = oneshot::channel();
        let drained = if negotiated_tx.send(reply_tx).is_ok() {
            reply_rx.await.unwrap_or_default()
        } else {
            0
        };
        info!(
            room_id = %identity.room_id,
            participant_id = %identity.participant_id,
            epoch,
            published,
            drained,
            "Broadcast started"
        );
        Ok(())
    }

    async fn negotiate(
        broadcast: &Broadcast,
        router_capabilities: oneshot::Receiver<RtpCapabilities>,
    ) -> Result<usize> {
        let router_capabilities = tokio::select! {
            received = router_capabilities => received.map_err(|_| ChannelError::Closed)?,
            () = broadcast.cancelled() => return Err(Error::Cancelled),
        };

        broadcast.negotiate(&router_capabilities).await?;
        broadcast.publish_local_media().await
    }

    /// Undo a start that failed before any broadcast was installed
    fn abandon_start(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if matches!(inner.broadcast, BroadcastSlot::Starting { epoch: e, .. } if e == epoch) {
            inner.broadcast = BroadcastSlot::Empty;
        }
    }

    /// Release everything a failed negotiation created and fall back to `Connected`
    async fn fail_start(&self, broadcast: &Arc<Broadcast>, error: Error) -> Error {
        if error.is_cancelled() {
            return error;
        }

        let link = {
            let mut inner = self.inner.lock();
            let current = matches!(
                &inner.broadcast,
                BroadcastSlot::Active(active) if Arc::ptr_eq(active, broadcast)
            );
            if !current {
                // Torn down by a concurrent disconnect; its failure is stale
                return Error::Cancelled;
            }
            inner.broadcast = BroadcastSlot::Empty;
            broadcast.teardown();
            self.set_state(SessionState::Connected);
            inner.signaling.take()
        };
        if let Some(link) = link {
            link.close().await;
        }

        warn!(epoch = broadcast.epoch(), error = %error, "Broadcast start failed");
        error
    }

    /// Stop publishing and consuming; the session stays `Connected`
    ///
    /// Server events still arriving on the open channel are discarded until
    /// the next `start_broadcast` or `disconnect`.
    pub fn stop_broadcast(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if self.state() != SessionState::Broadcasting {
            return Err(self.invalid("stop broadcast"));
        }
        let BroadcastSlot::Active(broadcast) =
            std::mem::replace(&mut inner.broadcast, BroadcastSlot::Empty)
        else {
            return Err(self.invalid("stop broadcast"));
        };

        broadcast.teardown();
        self.set_state(SessionState::Connected);
        info!(epoch = broadcast.epoch(), "Broadcast stopped");
        Ok(())
    }

    /// Tear down whatever is running, close signaling and forget the
    /// credentials; no-op once the session is `Stopped`
    pub async fn disconnect(&self) {
        let link = {
            let mut inner = self.inner.lock();
            if self.state() == SessionState::Stopped {
                return;
            }

            if let Some(cancel) = inner.pending_connect.take() {
                cancel.cancel();
            }
            match std::mem::replace(&mut inner.broadcast, BroadcastSlot::Empty) {
                BroadcastSlot::Empty => {}
                BroadcastSlot::Starting { epoch, cancel } => {
                    debug!(epoch, "Cancelling broadcast start");
                    cancel.cancel();
                }
                BroadcastSlot::Active(broadcast) => broadcast.teardown(),
            }

            inner.credentials = None;
            if let Some(identity) = inner.identity.take() {
                info!(
                    room_id = %identity.room_id,
                    participant_id = %identity.participant_id,
                    "Session disconnected"
                );
            }
            self.set_state(SessionState::Idle);
            inner.signaling.take()
        };

        if let Some(link) = link {
            link.close().await;
        }
    }

    /// Disconnect and enter the terminal `Stopped` state
    pub async fn close(&self) {
        self.disconnect().await;
        let _inner = self.inner.lock();
        self.set_state(SessionState::Stopped);
    }

    fn active_broadcast(&self) -> Option<Arc<Broadcast>> {
        match &self.inner.lock().broadcast {
            BroadcastSlot::Active(broadcast) => Some(Arc::clone(broadcast)),
            _ => None,
        }
    }

    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        self.inner.lock().identity.as_ref().map(|i| i.room_id.clone())
    }

    #[must_use]
    pub fn participant_id(&self) -> Option<ParticipantId> {
        self.inner
            .lock()
            .identity
            .as_ref()
            .map(|i| i.participant_id.clone())
    }

    /// Remote participants with at least one consumed track
    #[must_use]
    pub fn participants(&self) -> Vec<ParticipantStream> {
        self.active_broadcast()
            .map(|b| b.participants())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn participant(&self, participant_id: &ParticipantId) -> Option<ParticipantStream> {
        self.active_broadcast()?.consumers().participant(participant_id)
    }

    /// Kinds with a live local producer
    #[must_use]
    pub fn published_kinds(&self) -> Vec<MediaKind> {
        self.active_broadcast()
            .map(|b| b.producers().kinds())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn transport_state(&self, direction: TransportDirection) -> Option<ConnectionState> {
        self.active_broadcast()?
            .transports()
            .connection_state(direction)
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.active_broadcast()
            .map_or(0, |b| b.consumers().consumer_count())
    }

    /// Announcements waiting for negotiation to complete
    #[must_use]
    pub fn pending_announcements(&self) -> usize {
        self.active_broadcast().map_or(0, |b| b.pending().len())
    }
}

impl Drop for SfuSession {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let BroadcastSlot::Active(broadcast) = &inner.broadcast {
            broadcast.teardown();
        }
        if let Some(link) = inner.signaling.take() {
            link.pump.abort();
        }
    }
}
