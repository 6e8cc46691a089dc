//! Peer Connection Abstraktion
//!
//! Trennt `PeerSession` vom konkreten WebRTC-Stack.

use crate::media::{LocalTrack, TrackKind};
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Peer connection closed")]
    Closed,
}

// ============================================================================
// PEER EVENTS
// ============================================================================

/// Zustand der darunterliegenden Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events einer Peer Connection
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Media der Gegenstelle ist angekommen
    RemoteTrack { kind: TrackKind, track_id: String },

    /// Verbindungsstatus hat sich geändert
    StateChanged(PeerConnectionState),
}

// ============================================================================
// TRAITS
// ============================================================================

/// Eine einzelne Peer Connection
///
/// Offer und Answer enthalten bereits alle ICE Candidates (kein Trickle ICE).
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Hängt die ausgehenden Tracks an; der Video-Slot existiert immer,
    /// auch ohne Kamera.
    async fn attach_local_media(
        &self,
        audio: &Arc<LocalTrack>,
        video: Option<&Arc<LocalTrack>>,
    ) -> Result<(), PeerError>;

    /// Erstellt das Offer und wartet auf das Ende des ICE Gathering
    async fn create_offer(&self) -> Result<String, PeerError>;

    /// Setzt das Offer der Gegenstelle und erstellt das Answer
    async fn create_answer(&self, offer_sdp: &str) -> Result<String, PeerError>;

    /// Setzt das Answer der Gegenstelle
    async fn set_remote_answer(&self, answer_sdp: &str) -> Result<(), PeerError>;

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;

    /// Tauscht die Quelle des Video-Slots ohne Neuverhandlung
    async fn replace_video_track(&self, track: Option<&Arc<LocalTrack>>) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Erzeugt neue Peer Connections
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
