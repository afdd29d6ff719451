//! Media provider port
//!
//! Capture, playback and level metering are supplied by the host
//! application. The engine only acquires/releases opaque handles and
//! polls audio levels for conference fan-out.

use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::SipUri;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which media directions a session wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDirections {
    pub audio: bool,
    pub video: bool,
}

impl MediaDirections {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

impl Default for MediaDirections {
    fn default() -> Self {
        Self::audio_only()
    }
}

/// Opaque handle for an acquired local media session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSessionHandle {
    pub id: Uuid,
    pub directions: MediaDirections,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Acquire local capture devices for the given directions.
    async fn acquire(&self, directions: MediaDirections) -> Result<MediaSessionHandle>;

    /// Release a previously acquired handle. Must be safe to call for
    /// handles that were already torn down remotely.
    async fn release(&self, handle: MediaSessionHandle);

    /// Local mute toggle, applied synchronously to the capture path.
    fn set_muted(&self, handle: &MediaSessionHandle, muted: bool);

    /// Current audio level for a participant, 0.0 - 1.0. `None` when the
    /// provider has no meter data for that participant.
    fn audio_level(&self, participant: &SipUri) -> Option<f32>;
}
