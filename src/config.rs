//! Konfiguration des Call-Subsystems
//!
//! ICE-Server, Signaling-URL und Timeouts sind Eingaben und keine
//! fest verdrahteten Konstanten. Werte können aus Umgebungsvariablen
//! geladen werden.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Standard Signaling-Server (lokaler Relay)
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8080";

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 45;
const DEFAULT_ICE_GATHERING_TIMEOUT_MS: u64 = 3000;
const DEFAULT_RECONNECT_INITIAL_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid signaling URL '{url}': {reason}")]
    InvalidSignalingUrl { url: String, reason: String },

    #[error("At least one STUN server is required")]
    MissingStunServer,

    #[error("Invalid ICE server URL: {0}")]
    InvalidIceUrl(String),

    #[error("TURN server {0} requires username and credential")]
    MissingTurnCredentials(String),

    #[error("Invalid value for {name}: {reason}")]
    InvalidEnv { name: &'static str, reason: String },
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Ein Eintrag der geordneten ICE-Server-Liste
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// STUN-Eintrag ohne Credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// TURN-Eintrag mit Credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    fn is_stun(&self) -> bool {
        self.urls.iter().any(|u| u.starts_with("stun:"))
    }

    fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        // Google STUN Server (kostenlos, für die meisten Verbindungen ausreichend)
        IceServerConfig {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            username: None,
            credential: None,
        },
    ]
}

// ============================================================================
// CALL CONFIG
// ============================================================================

/// Gesamte Konfiguration eines Call-Clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub signaling_url: String,
    pub local_peer_id: String,
    pub ice_servers: Vec<IceServerConfig>,
    /// Kamera anfragen (sonst direkt Audio-only)
    pub prefer_video: bool,
    /// Obergrenze für Waiting + Negotiating
    pub connect_timeout_secs: u64,
    pub ice_gathering_timeout_ms: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            local_peer_id: uuid::Uuid::new_v4().to_string(),
            ice_servers: default_ice_servers(),
            prefer_video: true,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            ice_gathering_timeout_ms: DEFAULT_ICE_GATHERING_TIMEOUT_MS,
            reconnect_initial_delay_ms: DEFAULT_RECONNECT_INITIAL_MS,
            reconnect_max_delay_ms: DEFAULT_RECONNECT_MAX_MS,
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus Umgebungsvariablen
    ///
    /// - `SIGNALING_URL`
    /// - `CALL_PEER_ID`
    /// - `CALL_ICE_SERVERS` (JSON-Array aus `{ urls, username?, credential? }`)
    /// - `CALL_PREFER_VIDEO` (`true`/`false`)
    /// - `CALL_CONNECT_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("SIGNALING_URL") {
            config.signaling_url = url;
        }
        if let Ok(peer_id) = std::env::var("CALL_PEER_ID") {
            config.local_peer_id = peer_id;
        }
        if let Ok(raw) = std::env::var("CALL_ICE_SERVERS") {
            config.ice_servers =
                serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidEnv {
                    name: "CALL_ICE_SERVERS",
                    reason: e.to_string(),
                })?;
        }
        if let Ok(raw) = std::env::var("CALL_PREFER_VIDEO") {
            config.prefer_video = raw.parse().map_err(|_| ConfigError::InvalidEnv {
                name: "CALL_PREFER_VIDEO",
                reason: format!("expected true or false, got '{}'", raw),
            })?;
        }
        if let Ok(raw) = std::env::var("CALL_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout_secs =
                raw.parse().map_err(|e: std::num::ParseIntError| ConfigError::InvalidEnv {
                    name: "CALL_CONNECT_TIMEOUT_SECS",
                    reason: e.to_string(),
                })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Prüft URL-Schema und ICE-Server-Liste
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.signaling_url).map_err(|e| {
            ConfigError::InvalidSignalingUrl {
                url: self.signaling_url.clone(),
                reason: e.to_string(),
            }
        })?;
        if !matches!(url.scheme(), "ws" | "wss" | "http" | "https") {
            return Err(ConfigError::InvalidSignalingUrl {
                url: self.signaling_url.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        for server in &self.ice_servers {
            for url in &server.urls {
                let known = ["stun:", "turn:", "turns:"]
                    .iter()
                    .any(|scheme| url.starts_with(scheme));
                if !known {
                    return Err(ConfigError::InvalidIceUrl(url.clone()));
                }
            }
            if server.is_turn() && (server.username.is_none() || server.credential.is_none()) {
                return Err(ConfigError::MissingTurnCredentials(server.urls.join(",")));
            }
        }

        if !self.ice_servers.iter().any(IceServerConfig::is_stun) {
            return Err(ConfigError::MissingStunServer);
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

// ============================================================================
// TESTS
// ============================================================================
