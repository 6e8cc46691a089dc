//! Callroom - P2P Audio/Video Calls
//!
//! Call-Subsystem für zwei Teilnehmer in einem Raum:
//! - Signaling über ein Relay (WebSocket oder In-Process)
//! - WebRTC Peer Connection ohne Trickle ICE
//! - Zustandsmaschine für Aufbau, Betrieb und Abbau eines Calls
//! - Lebenszyklus der lokalen Media-Tracks (Kamera, Mikrofon, Bildschirm)

pub mod call;
pub mod config;
pub mod media;
pub mod peer;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use call::{CallCoordinator, CallError, CallEvent, CallRole, CallSession, CallState};
pub use config::{CallConfig, ConfigError, IceServerConfig};
pub use media::{MediaController, MediaDevices, SystemDevices};
pub use peer::{PeerConnector, WebRtcConnector};
pub use signaling::{LocalRelayHub, SignalingClient, WebSocketRelay};

use tracing_subscriber::EnvFilter;

/// Standard-Filter, wenn `RUST_LOG` nicht gesetzt ist
const DEFAULT_LOG_FILTER: &str = "callroom=debug,webrtc=warn";

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging
///
/// `RUST_LOG` überschreibt den Standard-Filter. Mehrfache Aufrufe sind
/// harmlos; nur der erste installiert den Subscriber.
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
    {
        tracing::info!("Logging initialized");
    }
}
