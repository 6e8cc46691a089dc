//! Peer Session
//!
//! Besitzt genau eine Peer Connection für die Dauer eines Calls:
//! - Offer/Answer-Austausch als Initiator oder Responder
//! - Anwenden eingehender Signale (veraltete werden verworfen)
//! - Austausch des ausgehenden Video-Tracks für Bildschirmfreigabe
//! - `RemoteStream` genau einmal pro Session

use super::connection::{PeerConnection, PeerConnectionState, PeerConnector, PeerError, PeerEvent};
use crate::media::{LocalMediaHandle, LocalTrack};
use crate::signaling::{SignalEnvelope, SignalPayload};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// TYPES
// ============================================================================

/// Rolle in der Verhandlung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Initiator,
    Responder,
}

/// Events einer Session an den Coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSessionEvent {
    /// Media der Gegenstelle ist angekommen (einmal pro Session)
    RemoteStream,

    /// Verbindung ist vorübergehend unterbrochen
    Disconnected,

    /// Verbindung ist endgültig fehlgeschlagen
    ConnectionFailed,
}

/// Session-Event mit Absender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEvent {
    pub session_id: u64,
    pub event: PeerSessionEvent,
}

/// Ergebnis von `apply_remote_signal`
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    /// Signal wurde auf die Verbindung angewendet
    Applied,

    /// Veraltet oder nicht für diese Session; ignoriert
    Dropped,

    /// Neues Offer; die Session muss durch einen Responder ersetzt werden
    Renegotiate { sdp: String },
}

/// Ausgehende Tracks für eine neue Session
#[derive(Debug, Clone)]
pub struct OutboundTracks {
    pub audio: Arc<LocalTrack>,
    pub video: Option<Arc<LocalTrack>>,
}

impl OutboundTracks {
    pub fn from_handle(handle: &LocalMediaHandle) -> Self {
        Self {
            audio: Arc::clone(handle.audio()),
            video: handle.outbound_video().cloned(),
        }
    }
}

// ============================================================================
// PEER SESSION
// ============================================================================

pub struct PeerSession {
    id: u64,
    local_id: String,
    remote_peer: String,
    role: PeerRole,
    connection: Arc<dyn PeerConnection>,
    answered: AtomicBool,
    closed: AtomicBool,
    forwarder: JoinHandle<()>,
}

impl PeerSession {
    /// Erstellt eine Session als Initiator und liefert das Offer
    pub async fn create_as_initiator(
        connector: &dyn PeerConnector,
        local_id: &str,
        remote_peer: &str,
        tracks: OutboundTracks,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<(Self, SignalEnvelope), PeerError> {
        let session = Self::open(connector, local_id, remote_peer, PeerRole::Initiator, events).await?;

        let sdp = match session.negotiate_offer(&tracks).await {
            Ok(sdp) => sdp,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        tracing::info!("Session {}: offer for '{}' ready", session.id, remote_peer);
        let envelope = SignalEnvelope::offer(local_id, remote_peer, sdp);
        Ok((session, envelope))
    }

    /// Erstellt eine Session als Responder und liefert das Answer
    pub async fn create_as_responder(
        connector: &dyn PeerConnector,
        local_id: &str,
        remote_peer: &str,
        tracks: OutboundTracks,
        offer_sdp: &str,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<(Self, SignalEnvelope), PeerError> {
        let session = Self::open(connector, local_id, remote_peer, PeerRole::Responder, events).await?;

        let sdp = match session.negotiate_answer(&tracks, offer_sdp).await {
            Ok(sdp) => sdp,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };
        session.answered.store(true, Ordering::SeqCst);

        tracing::info!("Session {}: answer for '{}' ready", session.id, remote_peer);
        let envelope = SignalEnvelope::answer(local_id, remote_peer, sdp);
        Ok((session, envelope))
    }

    async fn open(
        connector: &dyn PeerConnector,
        local_id: &str,
        remote_peer: &str,
        role: PeerRole,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, PeerError> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let connection = connector.connect(peer_tx).await?;

        tracing::debug!("Session {}: opened as {:?} for '{}'", id, role, remote_peer);

        Ok(Self {
            id,
            local_id: local_id.to_string(),
            remote_peer: remote_peer.to_string(),
            role,
            connection,
            answered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            forwarder: tokio::spawn(forward_peer_events(id, peer_rx, events)),
        })
    }

    async fn negotiate_offer(&self, tracks: &OutboundTracks) -> Result<String, PeerError> {
        self.connection
            .attach_local_media(&tracks.audio, tracks.video.as_ref())
            .await?;
        self.connection.create_offer().await
    }

    async fn negotiate_answer(
        &self,
        tracks: &OutboundTracks,
        offer_sdp: &str,
    ) -> Result<String, PeerError> {
        self.connection
            .attach_local_media(&tracks.audio, tracks.video.as_ref())
            .await?;
        self.connection.create_answer(offer_sdp).await
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wendet ein eingehendes Signal an
    ///
    /// Signale einer anderen Gegenstelle, doppelte Answers und alles nach
    /// `close()` werden verworfen. Ein Offer wird nicht angewendet, sondern
    /// als `Renegotiate` zurückgegeben.
    pub async fn apply_remote_signal(
        &self,
        from: &str,
        payload: &SignalPayload,
    ) -> Result<SignalOutcome, PeerError> {
        if self.is_closed() {
            tracing::debug!("Session {}: dropping signal after close", self.id);
            return Ok(SignalOutcome::Dropped);
        }
        if from != self.remote_peer {
            tracing::debug!(
                "Session {}: dropping signal from '{}' (expected '{}')",
                self.id,
                from,
                self.remote_peer
            );
            return Ok(SignalOutcome::Dropped);
        }

        match payload {
            SignalPayload::Offer { sdp } => Ok(SignalOutcome::Renegotiate { sdp: sdp.clone() }),

            SignalPayload::Answer { sdp } => {
                if self.role != PeerRole::Initiator || self.answered.swap(true, Ordering::SeqCst) {
                    tracing::debug!("Session {}: dropping unexpected answer", self.id);
                    return Ok(SignalOutcome::Dropped);
                }
                if let Err(e) = self.connection.set_remote_answer(sdp).await {
                    self.answered.store(false, Ordering::SeqCst);
                    return Err(e);
                }
                tracing::info!("Session {}: remote answer applied", self.id);
                Ok(SignalOutcome::Applied)
            }

            SignalPayload::Candidate { candidate } => {
                self.connection.add_remote_candidate(candidate).await?;
                Ok(SignalOutcome::Applied)
            }
        }
    }

    /// Tauscht die ausgehende Video-Quelle ohne neue Verbindung
    pub async fn replace_outbound_video_track(
        &self,
        track: Option<&Arc<LocalTrack>>,
    ) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        self.connection.replace_video_track(track).await
    }

    /// Schließt die Verbindung (idempotent)
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.forwarder.abort();
        if let Err(e) = self.connection.close().await {
            tracing::warn!("Session {}: error closing connection: {}", self.id, e);
        }
        tracing::info!("Session {}: closed", self.id);
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.forwarder.abort();

        let connection = Arc::clone(&self.connection);
        let id = self.id;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = connection.close().await {
                    tracing::warn!("Session {}: error closing connection: {}", id, e);
                }
            });
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("remote_peer", &self.remote_peer)
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Übersetzt Verbindungs-Events in Session-Events
async fn forward_peer_events(
    session_id: u64,
    mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut remote_stream_seen = false;

    while let Some(peer_event) = peer_rx.recv().await {
        let event = match peer_event {
            PeerEvent::RemoteTrack { kind, track_id } => {
                tracing::debug!("Session {}: remote {:?} track {}", session_id, kind, track_id);
                if remote_stream_seen {
                    continue;
                }
                remote_stream_seen = true;
                PeerSessionEvent::RemoteStream
            }
            PeerEvent::StateChanged(PeerConnectionState::Disconnected) => {
                PeerSessionEvent::Disconnected
            }
            PeerEvent::StateChanged(PeerConnectionState::Failed) => {
                PeerSessionEvent::ConnectionFailed
            }
            PeerEvent::StateChanged(state) => {
                tracing::debug!("Session {}: connection {:?}", session_id, state);
                continue;
            }
        };

        if events.send(SessionEvent { session_id, event }).is_err() {
            break;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
