//! Session credential handshake

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{ParticipantId, RoomId};

/// ICE server entry handed out with the session credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Credentials issued by the handshake for one `(room, participant)` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredentials {
    /// Where the signaling channel connects
    pub signaling_url: String,
    pub access_token: String,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

/// Issues session credentials; called once per `connect`
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn acquire(
        &self,
        room_id: &RoomId,
        participant_id: &ParticipantId,
    ) -> anyhow::Result<SessionCredentials>;
}
