//! Zugriff auf Capture-Hardware
//!
//! `MediaDevices` ist die Naht zwischen `MediaController` und der
//! echten Hardware. `SystemDevices` liefert das Mikrofon über cpal.

use super::audio;
use super::controller::MediaError;
use super::track::{LocalTrack, TrackSource};
use async_trait::async_trait;
use std::sync::Arc;

/// Quelle für lokale Tracks
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Öffnet das Standard-Mikrofon
    async fn open_microphone(&self) -> Result<Arc<LocalTrack>, MediaError>;

    /// Öffnet die Standard-Kamera
    async fn open_camera(&self) -> Result<Arc<LocalTrack>, MediaError>;

    /// Startet eine Bildschirmaufnahme
    async fn open_display(&self) -> Result<Arc<LocalTrack>, MediaError>;
}

/// Produktive Geräte: Mikrofon über cpal
///
/// Video-Capture ist in diesem Backend nicht enthalten; Kamera und
/// Bildschirm melden `DeviceUnavailable`, der Call läuft dann Audio-only.
#[derive(Debug, Default, Clone)]
pub struct SystemDevices;

impl SystemDevices {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaDevices for SystemDevices {
    async fn open_microphone(&self) -> Result<Arc<LocalTrack>, MediaError> {
        audio::open_microphone()
            .await
            .map_err(|e| MediaError::DeviceUnavailable {
                source_kind: TrackSource::Microphone,
                reason: e.to_string(),
            })
    }

    async fn open_camera(&self) -> Result<Arc<LocalTrack>, MediaError> {
        Err(MediaError::DeviceUnavailable {
            source_kind: TrackSource::Camera,
            reason: "no video capture backend".to_string(),
        })
    }

    async fn open_display(&self) -> Result<Arc<LocalTrack>, MediaError> {
        Err(MediaError::DeviceUnavailable {
            source_kind: TrackSource::Screen,
            reason: "no display capture backend".to_string(),
        })
    }
}
