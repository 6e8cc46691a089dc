//! Call Session
//!
//! Unveränderlicher Snapshot eines Calls. Jede Änderung geht über eine
//! Transition-Funktion, die einen neuen Wert liefert oder den Übergang
//! ablehnt. Ended und Failed sind terminal.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// STATES
// ============================================================================

/// Warum ein Call regulär beendet wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LocalHangup,
    RemoteEnded,
    RemoteRejected,
}

/// Warum ein Call fehlgeschlagen ist
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Kein Mikrofon
    MediaUnavailable,
    /// Relay nicht erreichbar
    SignalingUnreachable,
    /// Kein Peer oder keine Verbindung innerhalb des Timeouts
    Timeout,
    /// Offer/Answer fehlgeschlagen
    Negotiation(String),
    /// Verbindung nach der Verhandlung verloren
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Requesting,
    Waiting,
    Negotiating,
    Connected,
    Ended(EndReason),
    Failed(FailureReason),
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended(_) | CallState::Failed(_))
    }

    /// Media ist vorhanden und der Call läuft
    pub fn has_media(&self) -> bool {
        matches!(
            self,
            CallState::Waiting | CallState::Negotiating | CallState::Connected
        )
    }

    fn name(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Requesting => "requesting",
            CallState::Waiting => "waiting",
            CallState::Negotiating => "negotiating",
            CallState::Connected => "connected",
            CallState::Ended(_) => "ended",
            CallState::Failed(_) => "failed",
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallState::Ended(reason) => write!(f, "ended ({:?})", reason),
            CallState::Failed(reason) => write!(f, "failed ({:?})", reason),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Initiator,
    Responder,
    Unknown,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot {action} while {from}")]
pub struct TransitionError {
    pub from: CallState,
    pub action: &'static str,
}

// ============================================================================
// CALL SESSION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub call_id: u64,
    pub room_id: String,
    pub state: CallState,
    pub role: CallRole,
    pub remote_peer: Option<String>,
    pub is_muted: bool,
    pub is_video_off: bool,
    pub is_screen_sharing: bool,
    pub video_unavailable: bool,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn new(call_id: u64, room_id: impl Into<String>) -> Self {
        Self {
            call_id,
            room_id: room_id.into(),
            state: CallState::Idle,
            role: CallRole::Unknown,
            remote_peer: None,
            is_muted: false,
            is_video_off: false,
            is_screen_sharing: false,
            video_unavailable: false,
            started_at: Utc::now(),
            connected_at: None,
        }
    }

    fn reject(&self, action: &'static str) -> TransitionError {
        TransitionError {
            from: self.state.clone(),
            action,
        }
    }

    fn with_state(&self, state: CallState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// Idle → Requesting
    pub fn request_media(&self) -> Result<Self, TransitionError> {
        match self.state {
            CallState::Idle => Ok(self.with_state(CallState::Requesting)),
            _ => Err(self.reject("request media")),
        }
    }

    /// Requesting → Waiting
    ///
    /// Ohne Kamera-Track startet der Call mit ausgeschaltetem Video, egal ob
    /// die Kamera fehlte oder gar nicht angefragt wurde.
    pub fn media_acquired(
        &self,
        has_camera: bool,
        video_unavailable: bool,
    ) -> Result<Self, TransitionError> {
        match self.state {
            CallState::Requesting => Ok(Self {
                state: CallState::Waiting,
                video_unavailable,
                is_video_off: !has_camera,
                ..self.clone()
            }),
            _ => Err(self.reject("finish media acquisition")),
        }
    }

    /// Waiting/Negotiating/Connected → Negotiating
    ///
    /// Aus Negotiating und Connected nur, wenn die Session ersetzt wird
    /// (Glare oder neues Offer der Gegenstelle).
    pub fn negotiate(&self, role: CallRole, remote_peer: &str) -> Result<Self, TransitionError> {
        match self.state {
            CallState::Waiting | CallState::Negotiating | CallState::Connected => Ok(Self {
                state: CallState::Negotiating,
                role,
                remote_peer: Some(remote_peer.to_string()),
                connected_at: None,
                ..self.clone()
            }),
            _ => Err(self.reject("negotiate")),
        }
    }

    /// Negotiating → Connected
    pub fn connected(&self) -> Result<Self, TransitionError> {
        match self.state {
            CallState::Negotiating => Ok(Self {
                state: CallState::Connected,
                connected_at: Some(Utc::now()),
                ..self.clone()
            }),
            _ => Err(self.reject("connect")),
        }
    }

    pub fn with_muted(&self, muted: bool) -> Result<Self, TransitionError> {
        if !self.state.has_media() {
            return Err(self.reject("toggle mute"));
        }
        Ok(Self {
            is_muted: muted,
            ..self.clone()
        })
    }

    pub fn with_video_off(&self, video_off: bool) -> Result<Self, TransitionError> {
        if !self.state.has_media() {
            return Err(self.reject("toggle video"));
        }
        Ok(Self {
            is_video_off: video_off,
            ..self.clone()
        })
    }

    pub fn with_screen_sharing(&self, sharing: bool) -> Result<Self, TransitionError> {
        if !self.state.has_media() {
            return Err(self.reject("toggle screen share"));
        }
        Ok(Self {
            is_screen_sharing: sharing,
            ..self.clone()
        })
    }

    /// any → Ended
    pub fn end(&self, reason: EndReason) -> Result<Self, TransitionError> {
        if self.state.is_terminal() {
            return Err(self.reject("end"));
        }
        Ok(Self {
            is_screen_sharing: false,
            ..self.with_state(CallState::Ended(reason))
        })
    }

    /// any → Failed
    pub fn fail(&self, reason: FailureReason) -> Result<Self, TransitionError> {
        if self.state.is_terminal() {
            return Err(self.reject("fail"));
        }
        Ok(Self {
            is_screen_sharing: false,
            ..self.with_state(CallState::Failed(reason))
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
