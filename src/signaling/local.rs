//! In-Process Relay
//!
//! Verhält sich wie der Signaling-Server: Räume, `user-joined` an die
//! übrigen Mitglieder, `call:signal` an den Adressaten, `call:ended` an
//! den Raum. Wird für Tests und lokale Demos verwendet.

use super::messages::RelayMessage;
use super::relay::{RelayChannel, RelayEvent, SignalingError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Default)]
struct HubState {
    peers: HashMap<String, PeerSlot>,
    rooms: BTreeMap<String, Vec<String>>,
}

struct PeerSlot {
    events: broadcast::Sender<RelayEvent>,
    connected: bool,
}

impl HubState {
    fn deliver(&self, peer_id: &str, event: RelayEvent) {
        match self.peers.get(peer_id) {
            Some(slot) if slot.connected => {
                let _ = slot.events.send(event);
            }
            _ => tracing::debug!("Relay dropping message for offline peer '{}'", peer_id),
        }
    }

    fn others_in_room(&self, room: &str, peer_id: &str) -> Vec<String> {
        self.rooms
            .get(room)
            .map(|members| members.iter().filter(|m| *m != peer_id).cloned().collect())
            .unwrap_or_default()
    }

    fn rooms_of(&self, peer_id: &str) -> Vec<String> {
        self.rooms
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m == peer_id))
            .map(|(room, _)| room.clone())
            .collect()
    }

    fn remove_from_rooms(&mut self, peer_id: &str) {
        for members in self.rooms.values_mut() {
            members.retain(|m| m != peer_id);
        }
        self.rooms.retain(|_, members| !members.is_empty());
    }
}

// ============================================================================
// HUB
// ============================================================================

/// Gemeinsamer Relay-Zustand aller lokalen Endpunkte
#[derive(Clone, Default)]
pub struct LocalRelayHub {
    state: Arc<Mutex<HubState>>,
}

impl LocalRelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verbindet einen neuen Endpunkt mit der angegebenen Peer-ID
    pub fn connect(&self, peer_id: impl Into<String>) -> Arc<LocalRelay> {
        let peer_id = peer_id.into();
        let (events, _) = broadcast::channel(100);

        self.state.lock().peers.insert(
            peer_id.clone(),
            PeerSlot {
                events: events.clone(),
                connected: true,
            },
        );

        Arc::new(LocalRelay {
            peer_id,
            state: Arc::clone(&self.state),
            events,
        })
    }

    /// Mitglieder eines Raums in Beitrittsreihenfolge
    pub fn members(&self, room: &str) -> Vec<String> {
        self.state.lock().rooms.get(room).cloned().unwrap_or_default()
    }
}

// ============================================================================
// ENDPOINT
// ============================================================================

/// Ein Endpunkt am lokalen Relay
pub struct LocalRelay {
    peer_id: String,
    state: Arc<Mutex<HubState>>,
    events: broadcast::Sender<RelayEvent>,
}

impl LocalRelay {
    /// Trennt die Verbindung; das Relay vergisst die Raum-Mitgliedschaft
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        state.remove_from_rooms(&self.peer_id);
        if let Some(slot) = state.peers.get_mut(&self.peer_id) {
            slot.connected = false;
        }
        let _ = self.events.send(RelayEvent::Disconnected);
    }

    /// Baut die Verbindung wieder auf
    pub fn reconnect(&self) {
        if let Some(slot) = self.state.lock().peers.get_mut(&self.peer_id) {
            slot.connected = true;
        }
        let _ = self.events.send(RelayEvent::Connected);
    }

    /// Verbindungsabbruch mit sofortigem Reconnect
    pub fn simulate_reconnect(&self) {
        self.disconnect();
        self.reconnect();
    }
}

#[async_trait]
impl RelayChannel for LocalRelay {
    fn local_id(&self) -> String {
        self.peer_id.clone()
    }

    fn is_connected(&self) -> bool {
        self.state
            .lock()
            .peers
            .get(&self.peer_id)
            .map(|slot| slot.connected)
            .unwrap_or(false)
    }

    async fn send(&self, message: RelayMessage) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        let connected = state
            .peers
            .get(&self.peer_id)
            .map(|slot| slot.connected)
            .unwrap_or(false);
        if !connected {
            return Err(SignalingError::NotConnected);
        }

        match message {
            RelayMessage::JoinRoom { room } => {
                let members = state.rooms.entry(room.clone()).or_default();
                if members.contains(&self.peer_id) {
                    return Ok(());
                }
                members.push(self.peer_id.clone());
                for other in state.others_in_room(&room, &self.peer_id) {
                    state.deliver(
                        &other,
                        RelayEvent::Message(RelayMessage::UserJoined {
                            user_id: self.peer_id.clone(),
                        }),
                    );
                }
            }

            RelayMessage::LeaveRoom { room } => {
                if let Some(members) = state.rooms.get_mut(&room) {
                    members.retain(|m| *m != self.peer_id);
                }
                state.rooms.retain(|_, members| !members.is_empty());
            }

            RelayMessage::Signal { to, signal, .. } => {
                // Das Relay setzt den Absender selbst
                let relayed = RelayMessage::Signal {
                    to: to.clone(),
                    from: self.peer_id.clone(),
                    signal,
                };
                state.deliver(&to, RelayEvent::Message(relayed));
            }

            RelayMessage::CallEnded { room_id } => {
                for other in state.others_in_room(&room_id, &self.peer_id) {
                    state.deliver(
                        &other,
                        RelayEvent::Message(RelayMessage::CallEnded {
                            room_id: room_id.clone(),
                        }),
                    );
                }
            }

            RelayMessage::CallRejected {} => {
                for room in state.rooms_of(&self.peer_id) {
                    for other in state.others_in_room(&room, &self.peer_id) {
                        state.deliver(&other, RelayEvent::Message(RelayMessage::CallRejected {}));
                    }
                }
            }

            RelayMessage::UserJoined { .. } => {
                tracing::debug!("Relay ignoring user-joined from client '{}'", self.peer_id);
            }
        }

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for LocalRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRelay")
            .field("peer_id", &self.peer_id)
            .finish()
    }
}
