//! Peer-to-Peer Verbindung
//!
//! `PeerSession` besitzt genau eine Verbindung pro Call. Der WebRTC-Stack
//! steckt hinter `PeerConnector`/`PeerConnection`.

pub mod connection;
pub mod rtc;
pub mod session;

pub use connection::{PeerConnection, PeerConnectionState, PeerConnector, PeerError, PeerEvent};
pub use session::{
    OutboundTracks, PeerRole, PeerSession, PeerSessionEvent, SessionEvent, SignalOutcome,
};
pub use rtc::WebRtcConnector;
