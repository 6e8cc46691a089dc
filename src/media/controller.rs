//! Media Controller
//!
//! Beschafft und verwaltet die lokalen Tracks eines Calls:
//! - Kamera + Mikrofon mit Fallback auf Audio-only
//! - Lokales Stummschalten ohne Neuverhandlung
//! - Bildschirmfreigabe mit geparkter Kamera
//! - Garantierte Freigabe aller Tracks

use super::devices::MediaDevices;
use super::track::{LocalTrack, TrackSource};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MediaError {
    #[error("{source_kind} unavailable: {reason}")]
    DeviceUnavailable {
        source_kind: TrackSource,
        reason: String,
    },

    #[error("Microphone unavailable, cannot start call: {0}")]
    AudioUnavailable(String),

    #[error("Screen share already active")]
    ScreenShareActive,

    #[error("No active screen share")]
    NoScreenShare,

    #[error("Media handle already released")]
    Released,
}

// ============================================================================
// LOCAL MEDIA HANDLE
// ============================================================================

/// Die lokalen Tracks eines Calls
///
/// Höchstens ein Audio- und ein Kamera-Track sind live. Während einer
/// Bildschirmfreigabe belegt der Screen-Track den ausgehenden Video-Slot,
/// die Kamera bleibt geparkt. Beim Drop werden alle Tracks gestoppt.
#[derive(Debug)]
pub struct LocalMediaHandle {
    audio: Arc<LocalTrack>,
    camera: Option<Arc<LocalTrack>>,
    screen: Option<Arc<LocalTrack>>,
    video_unavailable: bool,
    released: bool,
}

impl LocalMediaHandle {
    pub fn audio(&self) -> &Arc<LocalTrack> {
        &self.audio
    }

    pub fn camera(&self) -> Option<&Arc<LocalTrack>> {
        self.camera.as_ref()
    }

    pub fn screen(&self) -> Option<&Arc<LocalTrack>> {
        self.screen.as_ref()
    }

    /// Aktuelle Quelle des ausgehenden Video-Slots
    pub fn outbound_video(&self) -> Option<&Arc<LocalTrack>> {
        self.screen.as_ref().or(self.camera.as_ref())
    }

    /// Kamera konnte nicht geöffnet werden
    pub fn video_unavailable(&self) -> bool {
        self.video_unavailable
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Anzahl der noch laufenden Tracks
    pub fn live_tracks(&self) -> usize {
        std::iter::once(&self.audio)
            .chain(self.camera.iter())
            .chain(self.screen.iter())
            .filter(|t| t.is_live())
            .count()
    }

    fn stop_all(&mut self) {
        self.audio.stop();
        if let Some(camera) = &self.camera {
            camera.stop();
        }
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        self.released = true;
    }
}

impl Drop for LocalMediaHandle {
    fn drop(&mut self) {
        if !self.released {
            tracing::debug!("Releasing media handle on drop");
            self.stop_all();
        }
    }
}

// ============================================================================
// MEDIA CONTROLLER
// ============================================================================

/// Verwaltet lokale Media-Tracks über eine `MediaDevices`-Quelle
#[derive(Clone)]
pub struct MediaController {
    devices: Arc<dyn MediaDevices>,
}

impl MediaController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self { devices }
    }

    /// Beschafft Kamera und Mikrofon
    ///
    /// Ein Kamera-Fehler ist nicht fatal (Fallback auf Audio-only mit
    /// `video_unavailable`), ein Mikrofon-Fehler schon.
    pub async fn acquire(&self, prefer_video: bool) -> Result<LocalMediaHandle, MediaError> {
        let (camera, video_unavailable) = if prefer_video {
            match self.devices.open_camera().await {
                Ok(track) => (Some(track), false),
                Err(e) => {
                    tracing::warn!("Camera unavailable, falling back to audio-only: {}", e);
                    (None, true)
                }
            }
        } else {
            (None, false)
        };

        let audio = match self.devices.open_microphone().await {
            Ok(track) => track,
            Err(e) => {
                // Kamera nicht offen lassen
                if let Some(camera) = camera {
                    camera.stop();
                }
                tracing::error!("Microphone unavailable: {}", e);
                return Err(MediaError::AudioUnavailable(e.to_string()));
            }
        };

        tracing::info!(
            "Local media acquired (audio: {}, video: {})",
            audio.id(),
            camera.as_ref().map(|c| c.id()).unwrap_or("none")
        );

        Ok(LocalMediaHandle {
            audio,
            camera,
            screen: None,
            video_unavailable,
            released: false,
        })
    }

    /// Mikrofon lokal an/aus (keine Neuverhandlung)
    pub fn set_audio_enabled(&self, handle: &LocalMediaHandle, enabled: bool) {
        handle.audio.set_enabled(enabled);
    }

    /// Kamera lokal an/aus (keine Neuverhandlung)
    ///
    /// Gibt `false` zurück, wenn kein Kamera-Track existiert.
    pub fn set_video_enabled(&self, handle: &LocalMediaHandle, enabled: bool) -> bool {
        match &handle.camera {
            Some(camera) => {
                camera.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Öffnet einen Screen-Track
    ///
    /// Der Track belegt den Video-Slot erst mit `commit_screen_share`,
    /// nachdem die Peer Connection ihn übernommen hat. Über
    /// `LocalTrack::ended()` lässt sich das Beenden durch den Benutzer
    /// beobachten.
    ///
    /// Der Zustand des Handles wird beim Aufruf geprüft; das zurückgegebene
    /// Future hält keine Referenz auf das Handle.
    pub fn start_screen_share(
        &self,
        handle: &LocalMediaHandle,
    ) -> impl Future<Output = Result<Arc<LocalTrack>, MediaError>> + Send + 'static {
        let precheck = if handle.released {
            Err(MediaError::Released)
        } else if handle.screen.is_some() {
            Err(MediaError::ScreenShareActive)
        } else {
            Ok(())
        };
        let devices = Arc::clone(&self.devices);

        async move {
            precheck?;
            devices.open_display().await
        }
    }

    /// Übernimmt den Screen-Track als ausgehende Video-Quelle (Kamera wird geparkt)
    pub fn commit_screen_share(
        &self,
        handle: &mut LocalMediaHandle,
        screen: Arc<LocalTrack>,
    ) -> Result<(), MediaError> {
        if handle.released {
            screen.stop();
            return Err(MediaError::Released);
        }
        if handle.screen.is_some() {
            screen.stop();
            return Err(MediaError::ScreenShareActive);
        }
        tracing::info!("Screen share {} takes the video slot", screen.id());
        handle.screen = Some(screen);
        Ok(())
    }

    /// Beendet die Bildschirmfreigabe; die geparkte Kamera ist wieder die Quelle
    ///
    /// Gibt die wiederhergestellte Kamera zurück (dasselbe Track-Objekt).
    pub fn stop_screen_share(
        &self,
        handle: &mut LocalMediaHandle,
    ) -> Result<Option<Arc<LocalTrack>>, MediaError> {
        let screen = handle.screen.take().ok_or(MediaError::NoScreenShare)?;
        screen.stop();
        tracing::info!("Screen share {} stopped, camera restored", screen.id());
        Ok(handle.camera.clone())
    }

    /// Stoppt alle Tracks (idempotent)
    pub fn release(&self, handle: &mut LocalMediaHandle) {
        if handle.released {
            return;
        }
        handle.stop_all();
        tracing::info!("Local media released");
    }
}

impl std::fmt::Debug for MediaController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaController").finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
