//! Signaling Module - Relay-Kanal für Verhandlungsnachrichten
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Relay:
//! - Räume betreten und verlassen
//! - Offer/Answer/Candidate-Nachrichten weiterleiten
//! - Raum-Mitgliedschaft nach Reconnect wiederherstellen
//!

mod client;
mod local;
mod messages;
mod relay;
mod websocket;

pub use client::{SignalingClient, SignalingEvent};
pub use local::{LocalRelay, LocalRelayHub};
pub use messages::*;
pub use relay::{RelayChannel, RelayEvent, SignalingError};
pub use websocket::WebSocketRelay;
