//! Test-Doubles für Hardware und WebRTC

use crate::media::{LocalTrack, MediaDevices, MediaError, TrackCodec, TrackKind, TrackSource};
use crate::peer::{PeerConnection, PeerConnector, PeerError, PeerEvent};
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// FAKE DEVICES
// ============================================================================

/// Geräte ohne Hardware; merkt sich alle geöffneten Tracks
#[derive(Default)]
pub struct FakeDevices {
    pub camera_fails: bool,
    pub microphone_fails: bool,
    pub display_fails: bool,
    /// Verzögerung pro Öffnung (langsamer Berechtigungsdialog)
    pub open_delay: Duration,
    pub(crate) opened: Mutex<Vec<Arc<LocalTrack>>>,
}

impl FakeDevices {
    async fn open(&self, source: TrackSource, fails: bool) -> Result<Arc<LocalTrack>, MediaError> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if fails {
            return Err(MediaError::DeviceUnavailable {
                source_kind: source,
                reason: "permission denied".to_string(),
            });
        }
        let codec = match source.kind() {
            TrackKind::Audio => TrackCodec::pcmu(),
            TrackKind::Video => TrackCodec::vp8(),
        };
        let track = LocalTrack::new(source, codec);
        self.opened.lock().push(Arc::clone(&track));
        Ok(track)
    }

    /// Anzahl der noch laufenden Tracks über alle Öffnungen
    pub fn live_tracks(&self) -> usize {
        self.opened.lock().iter().filter(|t| t.is_live()).count()
    }

    /// Wie oft eine Quelle geöffnet wurde
    pub fn open_count(&self, source: TrackSource) -> usize {
        self.opened
            .lock()
            .iter()
            .filter(|t| t.source() == source)
            .count()
    }

    /// Zuletzt geöffneter Track einer Quelle
    pub fn last_opened(&self, source: TrackSource) -> Option<Arc<LocalTrack>> {
        self.opened
            .lock()
            .iter()
            .rev()
            .find(|t| t.source() == source)
            .cloned()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open_microphone(&self) -> Result<Arc<LocalTrack>, MediaError> {
        self.open(TrackSource::Microphone, self.microphone_fails).await
    }

    async fn open_camera(&self) -> Result<Arc<LocalTrack>, MediaError> {
        self.open(TrackSource::Camera, self.camera_fails).await
    }

    async fn open_display(&self) -> Result<Arc<LocalTrack>, MediaError> {
        self.open(TrackSource::Screen, self.display_fails).await
    }
}

// ============================================================================
// FAKE PEER CONNECTIONS
// ============================================================================

/// Verbindungen ohne Netzwerk
///
/// Remote-Media "kommt an", sobald Offer und Answer ausgetauscht sind,
/// außer `silent` ist gesetzt.
#[derive(Default)]
pub struct FakeConnector {
    pub fail_negotiation: bool,
    pub silent: bool,
    pub(crate) created: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeConnector {
    /// Anzahl erzeugter Verbindungen
    pub fn connections(&self) -> usize {
        self.created.lock().len()
    }

    pub fn last(&self) -> Option<Arc<FakeConnection>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let connection = Arc::new(FakeConnection {
            events,
            fail_negotiation: self.fail_negotiation,
            silent: self.silent,
            outbound_audio: Mutex::new(None),
            outbound_video: Mutex::new(None),
            remote_answer: Mutex::new(None),
            video_replacements: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        });
        self.created.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}

pub struct FakeConnection {
    events: mpsc::UnboundedSender<PeerEvent>,
    fail_negotiation: bool,
    silent: bool,
    outbound_audio: Mutex<Option<String>>,
    outbound_video: Mutex<Option<String>>,
    remote_answer: Mutex<Option<String>>,
    video_replacements: AtomicUsize,
    close_calls: AtomicUsize,
}

impl FakeConnection {
    /// Simuliert ein Event der Verbindung
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn outbound_audio_id(&self) -> Option<String> {
        self.outbound_audio.lock().clone()
    }

    pub fn outbound_video_id(&self) -> Option<String> {
        self.outbound_video.lock().clone()
    }

    pub fn remote_answer(&self) -> Option<String> {
        self.remote_answer.lock().clone()
    }

    pub fn video_replacements(&self) -> usize {
        self.video_replacements.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn remote_media_arrives(&self) {
        if self.silent {
            return;
        }
        for kind in [TrackKind::Audio, TrackKind::Video] {
            self.emit(PeerEvent::RemoteTrack {
                kind,
                track_id: format!("remote-{:?}", kind).to_lowercase(),
            });
        }
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn attach_local_media(
        &self,
        audio: &Arc<LocalTrack>,
        video: Option<&Arc<LocalTrack>>,
    ) -> Result<(), PeerError> {
        *self.outbound_audio.lock() = Some(audio.id().to_string());
        *self.outbound_video.lock() = video.map(|t| t.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        if self.fail_negotiation {
            return Err(PeerError::WebRTC("negotiation failed".to_string()));
        }
        Ok("v=0 fake-offer".to_string())
    }

    async fn create_answer(&self, offer_sdp: &str) -> Result<String, PeerError> {
        if self.fail_negotiation {
            return Err(PeerError::InvalidSdp(offer_sdp.to_string()));
        }
        self.remote_media_arrives();
        Ok("v=0 fake-answer".to_string())
    }

    async fn set_remote_answer(&self, answer_sdp: &str) -> Result<(), PeerError> {
        *self.remote_answer.lock() = Some(answer_sdp.to_string());
        self.remote_media_arrives();
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: &IceCandidate) -> Result<(), PeerError> {
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<&Arc<LocalTrack>>) -> Result<(), PeerError> {
        *self.outbound_video.lock() = track.map(|t| t.id().to_string());
        self.video_replacements.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
