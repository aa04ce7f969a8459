//! Local and remote media tracks

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{MediaKind, TrackId};

/// Handle to a media track
///
/// The orchestrator never touches samples; a track is identified by its id and kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: TrackId,
    pub kind: MediaKind,
}

impl MediaTrack {
    pub fn new(id: impl Into<TrackId>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Which kinds to request from the capture devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Captured local media, at most one track per kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalMedia {
    pub audio: Option<MediaTrack>,
    pub video: Option<MediaTrack>,
}

impl LocalMedia {
    #[must_use]
    pub const fn track(&self, kind: MediaKind) -> Option<&MediaTrack> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

/// Capture device access
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open the capture devices allowed by `constraints`
    async fn acquire(&self, constraints: &MediaConstraints) -> anyhow::Result<LocalMedia>;

    /// Stop every track of previously acquired media
    fn release(&self, media: LocalMedia);
}
