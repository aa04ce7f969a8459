//! `SyncTV` SFU client session orchestrator
//!
//! Client side of a many-to-many SFU session: each participant publishes its
//! local media over one send transport and receives every other participant
//! over one receive transport. This crate drives the lifecycle around those
//! transports; ICE/DTLS/RTP mechanics, capture devices and the signaling wire
//! format are supplied by the caller through traits.
//!
//! ## Architecture
//!
//! - **`SfuSession`**: lifecycle state machine (`connect`, `start_broadcast`,
//!   `stop_broadcast`, `disconnect`)
//! - **`TransportManager`**: at most one send and one receive transport,
//!   created lazily behind a per-direction async lock
//! - **`ProducerSet`**: local producers, one per media kind
//! - **`PendingProducerQueue`**: remote producers announced before
//!   negotiation completes, drained once in arrival order
//! - **`ConsumerRegistry`**: consumers and the per-participant streams they feed
//!
//! ## Usage
//!
//! ```rust,ignore
//! use synctv_sfu_client::{ClientConfig, Collaborators, SfuSession};
//!
//! let config = ClientConfig::load(Some("sfu-client.toml"))?;
//! synctv_sfu_client::logging::init_logging(&config.logging)?;
//!
//! let session = SfuSession::new(config, Collaborators {
//!     credentials,
//!     media,
//!     signaling,
//!     negotiator,
//! });
//! session.connect("room_id".into(), "user_id".into()).await?;
//! session.start_broadcast().await?;
//!
//! let mut events = session.subscribe_events();
//! while let Ok(event) = events.recv().await {
//!     // render participant streams
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod consumer;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod media;
pub mod negotiator;
pub mod pending;
pub mod producer;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod test_helpers;


pub use broadcast::AnnouncementOutcome;
pub use config::ClientConfig;
pub use consumer::{ConsumerRegistry, ParticipantStream};
pub use credentials::{CredentialProvider, IceServer, SessionCredentials};
pub use error::{ChannelError, Error, Result};
pub use media::{LocalMedia, MediaConstraints, MediaDevices, MediaTrack};
pub use negotiator::{
    CapabilityNegotiator, ConsumerHandle, ProducerHandle, RecvTransportHandle,
    SendTransportHandle, TransportHandle, TransportListener,
};
pub use pending::{EnqueueOutcome, PendingProducerQueue};
pub use producer::ProducerSet;
pub use session::{Collaborators, SessionEvent, SessionState, SfuSession};
pub use signaling::{EventSignaling, EventTransport, ServerEvent, SignalingChannel, SignalingConnector};
pub use transport::{RecvTransport, SendTransport, TransportManager};
pub use types::{
    ConnectionState, ConsumerId, MediaKind, ParticipantId, ProducerId, RoomId, TrackId,
    TransportDirection, TransportId,
};
