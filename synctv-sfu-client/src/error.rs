use thiserror::Error;

use crate::session::SessionState;

/// Failure of a single signaling round-trip
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The remote side answered with an error payload
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Signaling channel closed")]
    Closed,

    #[error("Unexpected response to {event}: {reason}")]
    UnexpectedResponse { event: &'static str, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum Error {
    /// Session credential handshake failed
    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Media acquisition error: {0}")]
    MediaAcquisition(String),

    /// Capability loading, transport construction or produce/consume setup failed
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// The broadcast this operation belonged to was torn down while it was in flight
    #[error("Operation cancelled by session teardown")]
    Cancelled,
}

impl Error {
    pub(crate) fn negotiation(err: &anyhow::Error) -> Self {
        Self::Negotiation(format!("{err:#}"))
    }

    /// Whether this error came from a stale completion rather than a real failure
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
