//! Signaling Client
//!
//! Dünne Schicht über dem Relay-Kanal:
//! - Räume betreten und verlassen
//! - Umschläge senden
//! - Relay-Events als typisierte `SignalingEvent`s weiterreichen
//! - Nach jedem Reconnect alle Räume erneut betreten

use super::messages::*;
use super::relay::{RelayChannel, RelayEvent, SignalingError};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Kapazität der Event-Queue zum Coordinator
const EVENT_QUEUE_CAPACITY: usize = 100;

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Verbunden mit dem Relay
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Ein Peer hat den Raum betreten
    PeerJoined { peer_id: String },

    /// Verhandlungsnachricht von einem Peer
    SignalReceived { from: String, payload: SignalPayload },

    /// Anruf abgelehnt
    CallRejected,

    /// Anruf beendet
    CallEnded { room_id: String },
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// Client für das Signaling-Relay
#[derive(Clone)]
pub struct SignalingClient {
    relay: Arc<dyn RelayChannel>,
    rooms: Arc<Mutex<BTreeSet<String>>>,
}

impl SignalingClient {
    /// Erstellt den Client und startet die Event-Weiterleitung
    ///
    /// Die Events kommen in Empfangsreihenfolge über eine begrenzte Queue.
    pub fn start(relay: Arc<dyn RelayChannel>) -> (Self, mpsc::Receiver<SignalingEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let client = Self {
            relay,
            rooms: Arc::new(Mutex::new(BTreeSet::new())),
        };

        let relay_rx = client.relay.subscribe();
        tokio::spawn(client.clone().forward_events(relay_rx, event_tx));

        (client, event_rx)
    }

    /// Eigene Peer-ID
    pub fn local_id(&self) -> String {
        self.relay.local_id()
    }

    pub fn is_connected(&self) -> bool {
        self.relay.is_connected()
    }

    /// Aktuell betretene Räume
    pub fn rooms(&self) -> Vec<String> {
        self.rooms.lock().iter().cloned().collect()
    }

    /// Betritt einen Raum
    pub async fn join_room(&self, room_id: &str) -> Result<(), SignalingError> {
        self.rooms.lock().insert(room_id.to_string());
        tracing::info!("Joining room {}", room_id);
        self.relay
            .send(RelayMessage::JoinRoom {
                room: room_id.to_string(),
            })
            .await
    }

    /// Verlässt einen Raum
    pub async fn leave_room(&self, room_id: &str) -> Result<(), SignalingError> {
        if !self.rooms.lock().remove(room_id) {
            return Ok(());
        }
        tracing::info!("Leaving room {}", room_id);
        self.relay
            .send(RelayMessage::LeaveRoom {
                room: room_id.to_string(),
            })
            .await
    }

    /// Sendet einen Umschlag über das Relay
    pub async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        tracing::debug!("Sending {:?} to '{}'", envelope.kind(), envelope.to);
        self.relay.send(envelope.into_relay_message()).await
    }

    /// Leitet Relay-Events an die Queue weiter
    async fn forward_events(
        self,
        mut relay_rx: broadcast::Receiver<RelayEvent>,
        event_tx: mpsc::Sender<SignalingEvent>,
    ) {
        loop {
            let event = match relay_rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Signaling event queue lagged, {} events lost", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let Some(signaling_event) = self.translate(event).await else {
                continue;
            };

            if event_tx.send(signaling_event).await.is_err() {
                tracing::debug!("Signaling event receiver dropped");
                break;
            }
        }
    }

    async fn translate(&self, event: RelayEvent) -> Option<SignalingEvent> {
        match event {
            RelayEvent::Connected => {
                // Raum-Mitgliedschaft nach Reconnect wiederherstellen
                for room in self.rooms() {
                    tracing::info!("Re-joining room {} after connect", room);
                    if let Err(e) = self
                        .relay
                        .send(RelayMessage::JoinRoom { room: room.clone() })
                        .await
                    {
                        tracing::error!("Failed to re-join room {}: {}", room, e);
                    }
                }
                Some(SignalingEvent::Connected)
            }

            RelayEvent::Disconnected => Some(SignalingEvent::Disconnected),

            RelayEvent::Message(message) => match message {
                RelayMessage::UserJoined { user_id } => {
                    Some(SignalingEvent::PeerJoined { peer_id: user_id })
                }

                RelayMessage::Signal { to, from, signal } => {
                    if to != self.relay.local_id() {
                        tracing::debug!("Dropping signal addressed to '{}'", to);
                        return None;
                    }
                    Some(SignalingEvent::SignalReceived {
                        from,
                        payload: signal,
                    })
                }

                RelayMessage::CallRejected {} => Some(SignalingEvent::CallRejected),

                RelayMessage::CallEnded { room_id } => Some(SignalingEvent::CallEnded { room_id }),

                RelayMessage::JoinRoom { .. } | RelayMessage::LeaveRoom { .. } => {
                    tracing::debug!("Ignoring client-only relay message");
                    None
                }
            },
        }
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("local_id", &self.relay.local_id())
            .field("rooms", &*self.rooms.lock())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::LocalRelayHub;
    use std::time::Duration;

    async fn next_event(rx: &mut mpsc::Receiver<SignalingEvent>) -> SignalingEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for signaling event")
            .expect("event queue closed")
    }

    #[tokio::test]
    async fn test_peer_joined_is_reported_to_existing_member() {
        let hub = LocalRelayHub::new();
        let (alice, mut alice_rx) = SignalingClient::start(hub.connect("alice"));
        let (bob, _bob_rx) = SignalingClient::start(hub.connect("bob"));

        alice.join_room("R1").await.unwrap();
        bob.join_room("R1").await.unwrap();

        assert_eq!(
            next_event(&mut alice_rx).await,
            SignalingEvent::PeerJoined {
                peer_id: "bob".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_signal_is_relayed_untouched() {
        let hub = LocalRelayHub::new();
        let (alice, _alice_rx) = SignalingClient::start(hub.connect("alice"));
        let (bob, mut bob_rx) = SignalingClient::start(hub.connect("bob"));
        alice.join_room("R1").await.unwrap();
        bob.join_room("R1").await.unwrap();

        alice
            .send(SignalEnvelope::offer("alice", "bob", "v=0 offer".to_string()))
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut bob_rx).await,
            SignalingEvent::SignalReceived {
                from: "alice".to_string(),
                payload: SignalPayload::Offer {
                    sdp: "v=0 offer".to_string()
                },
            }
        );
    }

    #[tokio::test]
    async fn test_rejoins_rooms_after_reconnect() {
        let hub = LocalRelayHub::new();
        let alice_relay = hub.connect("alice");
        let (alice, mut alice_rx) = SignalingClient::start(alice_relay.clone());
        alice.join_room("R1").await.unwrap();
        assert_eq!(hub.members("R1"), vec!["alice".to_string()]);

        alice_relay.simulate_reconnect();

        assert_eq!(next_event(&mut alice_rx).await, SignalingEvent::Disconnected);
        assert_eq!(next_event(&mut alice_rx).await, SignalingEvent::Connected);
        assert_eq!(hub.members("R1"), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_leave_room_forgets_membership() {
        let hub = LocalRelayHub::new();
        let (alice, _rx) = SignalingClient::start(hub.connect("alice"));
        alice.join_room("R1").await.unwrap();
        alice.leave_room("R1").await.unwrap();

        assert!(alice.rooms().is_empty());
        assert!(hub.members("R1").is_empty());
        // Zweites Verlassen ist ein No-op
        alice.leave_room("R1").await.unwrap();
    }
}
