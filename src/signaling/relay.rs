//! Relay-Kanal
//!
//! Der Transport zum Signaling-Relay wird von außen bereitgestellt.
//! `SignalingClient` kennt nur dieses Trait.

use super::messages::RelayMessage;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Relay channel closed")]
    Closed,
}

// ============================================================================
// RELAY EVENTS
// ============================================================================

/// Events des Relay-Kanals
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Verbunden (auch nach jedem Reconnect)
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Eingehende Nachricht
    Message(RelayMessage),
}

// ============================================================================
// RELAY CHANNEL
// ============================================================================

/// Nachrichten-Kanal zum Relay
#[async_trait]
pub trait RelayChannel: Send + Sync {
    /// Eigene Peer-ID, unter der das Relay uns adressiert
    fn local_id(&self) -> String;

    /// Prüft ob verbunden
    fn is_connected(&self) -> bool;

    /// Sendet eine Nachricht an das Relay
    async fn send(&self, message: RelayMessage) -> Result<(), SignalingError>;

    /// Gibt einen Event-Receiver zurück
    fn subscribe(&self) -> broadcast::Receiver<RelayEvent>;
}
