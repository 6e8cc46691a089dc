//! Lokale Media-Tracks
//!
//! Ein `LocalTrack` ist eine laufende Capture-Quelle (Mikrofon, Kamera
//! oder Bildschirm). Die Quelle schiebt kodierte Frames hinein, die
//! Peer Connection liest sie über `subscribe()`.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Kapazität des Frame-Kanals pro Track
const FRAME_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// TRACK TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Herkunft eines Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

impl std::fmt::Display for TrackSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TrackSource::Microphone => "microphone",
            TrackSource::Camera => "camera",
            TrackSource::Screen => "screen",
        };
        f.write_str(name)
    }
}

/// Codec-Beschreibung der Frames, die ein Track liefert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackCodec {
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
}

impl TrackCodec {
    /// G.711 µ-law, 8 kHz mono
    pub fn pcmu() -> Self {
        Self {
            mime_type: "audio/PCMU".to_string(),
            clock_rate: 8000,
            channels: 1,
        }
    }

    pub fn vp8() -> Self {
        Self {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: 0,
        }
    }
}

/// Ein kodierter Media-Frame
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub data: Bytes,
    pub duration: Duration,
}

// ============================================================================
// LOCAL TRACK
// ============================================================================

type StopHook = Box<dyn FnOnce() + Send>;

/// Laufende lokale Capture-Quelle
pub struct LocalTrack {
    id: String,
    source: TrackSource,
    codec: TrackCodec,
    enabled: AtomicBool,
    live: AtomicBool,
    frames: broadcast::Sender<MediaFrame>,
    ended: watch::Sender<bool>,
    stop_hook: Mutex<Option<StopHook>>,
}

impl LocalTrack {
    pub fn new(source: TrackSource, codec: TrackCodec) -> Arc<Self> {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let (ended, _) = watch::channel(false);

        Arc::new(Self {
            id: format!("{}-{}", source, uuid::Uuid::new_v4()),
            source,
            codec,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            frames,
            ended,
            stop_hook: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    pub fn codec(&self) -> &TrackCodec {
        &self.codec
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Schaltet den Track lokal stumm bzw. wieder an
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::debug!("Track {} enabled: {}", self.id, enabled);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Registriert eine Aktion, die beim Stoppen die Hardware freigibt
    ///
    /// Ist der Track bereits gestoppt, läuft der Hook sofort.
    pub fn on_stop(&self, hook: impl FnOnce() + Send + 'static) {
        let mut slot = self.stop_hook.lock();
        if !self.is_live() {
            drop(slot);
            hook();
            return;
        }
        *slot = Some(Box::new(hook));
    }

    /// Stoppt den Track (idempotent)
    pub fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            if let Some(hook) = self.stop_hook.lock().take() {
                hook();
            }
            self.ended.send_replace(true);
            tracing::info!("Track {} stopped", self.id);
        }
    }

    /// Die Quelle wurde von außen beendet (z.B. "Freigabe beenden" im OS)
    pub fn end_from_source(&self) {
        tracing::info!("Track {} ended by its source", self.id);
        self.stop();
    }

    /// Beobachter für das Ende des Tracks
    pub fn ended(&self) -> watch::Receiver<bool> {
        self.ended.subscribe()
    }

    /// Frames für die Übertragung abonnieren
    pub fn subscribe(&self) -> broadcast::Receiver<MediaFrame> {
        self.frames.subscribe()
    }

    /// Schiebt einen Frame in den Track
    ///
    /// Gibt `false` zurück, wenn der Frame verworfen wurde (stumm oder gestoppt).
    pub fn push_frame(&self, frame: MediaFrame) -> bool {
        if !self.is_live() || !self.is_enabled() {
            return false;
        }
        // Ohne Abonnenten gibt es niemanden, der den Frame braucht
        let _ = self.frames.send(frame);
        true
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
