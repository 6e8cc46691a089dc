//! Message Types für das Relay-Protokoll
//!
//! Jede Nachricht ist ein JSON-Frame `{"event": ..., "data": ...}`.
//! Der Inhalt von `call:signal` wird nur transportiert, nicht interpretiert.

use serde::{Deserialize, Serialize};

// ============================================================================
// RELAY FRAMES
// ============================================================================

/// Alle Nachrichten zwischen Client und Relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum RelayMessage {
    /// Raum betreten (Client → Relay)
    #[serde(rename = "joinRoom")]
    JoinRoom { room: String },

    /// Raum verlassen (Client → Relay)
    #[serde(rename = "leaveRoom")]
    LeaveRoom { room: String },

    /// Ein anderer Teilnehmer hat den Raum betreten (Relay → Client)
    #[serde(rename = "user-joined")]
    UserJoined {
        #[serde(rename = "userId")]
        user_id: String,
    },

    /// Verhandlungsnachricht (in beide Richtungen, weitergeleitet)
    #[serde(rename = "call:signal")]
    Signal {
        to: String,
        from: String,
        signal: SignalPayload,
    },

    /// Anruf abgelehnt (Relay → Client)
    #[serde(rename = "call:rejected")]
    CallRejected {},

    /// Anruf beendet (in beide Richtungen, weitergeleitet)
    #[serde(rename = "call:ended")]
    CallEnded {
        #[serde(rename = "roomId")]
        room_id: String,
    },
}

impl RelayMessage {
    /// Name des Events auf der Leitung
    pub fn event_name(&self) -> &'static str {
        match self {
            RelayMessage::JoinRoom { .. } => "joinRoom",
            RelayMessage::LeaveRoom { .. } => "leaveRoom",
            RelayMessage::UserJoined { .. } => "user-joined",
            RelayMessage::Signal { .. } => "call:signal",
            RelayMessage::CallRejected {} => "call:rejected",
            RelayMessage::CallEnded { .. } => "call:ended",
        }
    }
}

// ============================================================================
// SIGNAL PAYLOAD
// ============================================================================

/// Inhalt von `call:signal`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    /// SDP Offer inklusive aller gesammelten Candidates
    Offer { sdp: String },

    /// SDP Answer inklusive aller gesammelten Candidates
    Answer { sdp: String },

    /// Einzelner ICE Candidate (nur von Gegenstellen mit Trickle ICE)
    Candidate { candidate: IceCandidate },
}

/// ICE Candidate im Browser-Format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

// ============================================================================
// SIGNAL ENVELOPE
// ============================================================================

/// Art einer Signaling-Nachricht
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    CallEnded,
    CallRejected,
}

/// Inhalt eines Umschlags
#[derive(Debug, Clone, PartialEq)]
pub enum SignalBody {
    Signal(SignalPayload),
    CallEnded { room_id: String },
    CallRejected,
}

/// Adressierte, flüchtige Signaling-Nachricht
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    pub to: String,
    pub from: String,
    pub body: SignalBody,
}

impl SignalEnvelope {
    pub fn offer(from: impl Into<String>, to: impl Into<String>, sdp: String) -> Self {
        Self {
            to: to.into(),
            from: from.into(),
            body: SignalBody::Signal(SignalPayload::Offer { sdp }),
        }
    }

    pub fn answer(from: impl Into<String>, to: impl Into<String>, sdp: String) -> Self {
        Self {
            to: to.into(),
            from: from.into(),
            body: SignalBody::Signal(SignalPayload::Answer { sdp }),
        }
    }

    pub fn call_ended(from: impl Into<String>, to: impl Into<String>, room_id: String) -> Self {
        Self {
            to: to.into(),
            from: from.into(),
            body: SignalBody::CallEnded { room_id },
        }
    }

    pub fn kind(&self) -> SignalKind {
        match &self.body {
            SignalBody::Signal(SignalPayload::Offer { .. }) => SignalKind::Offer,
            SignalBody::Signal(SignalPayload::Answer { .. }) => SignalKind::Answer,
            SignalBody::Signal(SignalPayload::Candidate { .. }) => SignalKind::Candidate,
            SignalBody::CallEnded { .. } => SignalKind::CallEnded,
            SignalBody::CallRejected => SignalKind::CallRejected,
        }
    }

    /// Umwandlung in den Leitungs-Frame
    pub fn into_relay_message(self) -> RelayMessage {
        match self.body {
            SignalBody::Signal(signal) => RelayMessage::Signal {
                to: self.to,
                from: self.from,
                signal,
            },
            SignalBody::CallEnded { room_id } => RelayMessage::CallEnded { room_id },
            SignalBody::CallRejected => RelayMessage::CallRejected {},
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_room_wire_format() {
        let msg = RelayMessage::JoinRoom {
            room: "R1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"event": "joinRoom", "data": {"room": "R1"}})
        );
    }

    #[test]
    fn test_parse_relay_frames() {
        let joined: RelayMessage =
            serde_json::from_value(json!({"event": "user-joined", "data": {"userId": "b"}}))
                .unwrap();
        assert_eq!(
            joined,
            RelayMessage::UserJoined {
                user_id: "b".to_string()
            }
        );

        let rejected: RelayMessage =
            serde_json::from_value(json!({"event": "call:rejected", "data": {}})).unwrap();
        assert_eq!(rejected, RelayMessage::CallRejected {});

        let ended: RelayMessage =
            serde_json::from_value(json!({"event": "call:ended", "data": {"roomId": "R1"}}))
                .unwrap();
        assert_eq!(ended.event_name(), "call:ended");
    }

    #[test]
    fn test_signal_payload_format() {
        let msg: RelayMessage = serde_json::from_value(json!({
            "event": "call:signal",
            "data": {
                "to": "b",
                "from": "a",
                "signal": {
                    "type": "candidate",
                    "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0}
                }
            }
        }))
        .unwrap();

        match msg {
            RelayMessage::Signal { signal: SignalPayload::Candidate { candidate }, .. } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert_eq!(candidate.username_fragment, None);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_envelope_kinds() {
        let offer = SignalEnvelope::offer("a", "b", "v=0".to_string());
        assert_eq!(offer.kind(), SignalKind::Offer);
        assert_eq!(
            offer.into_relay_message(),
            RelayMessage::Signal {
                to: "b".to_string(),
                from: "a".to_string(),
                signal: SignalPayload::Offer {
                    sdp: "v=0".to_string()
                },
            }
        );

        let ended = SignalEnvelope::call_ended("a", "", "R1".to_string());
        assert_eq!(ended.kind(), SignalKind::CallEnded);
        assert_eq!(
            ended.into_relay_message(),
            RelayMessage::CallEnded {
                room_id: "R1".to_string()
            }
        );
    }
}
