//! WebSocket-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Signaling-Server:
//! - Erster Verbindungsaufbau mit Timeout
//! - Automatische Reconnection mit Backoff
//! - JSON-Frames in beide Richtungen

use super::messages::RelayMessage;
use super::relay::{RelayChannel, RelayEvent, SignalingError};
use crate::config::CallConfig;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Maximale Dauer eines Verbindungsversuchs
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    ConnectionLost,
    Shutdown,
}

// ============================================================================
// WEBSOCKET RELAY
// ============================================================================

/// Relay-Kanal über WebSocket
pub struct WebSocketRelay {
    peer_id: String,
    url: Url,
    connected: Arc<RwLock<bool>>,
    outgoing: mpsc::Sender<String>,
    event_tx: broadcast::Sender<RelayEvent>,
    shutdown: watch::Sender<bool>,
}

impl WebSocketRelay {
    /// Verbindet mit dem Signaling-Server
    ///
    /// Schlägt der erste Verbindungsaufbau fehl, wird `ConnectionFailed`
    /// zurückgegeben. Spätere Abbrüche werden im Hintergrund repariert.
    pub async fn connect(config: &CallConfig) -> Result<Arc<Self>, SignalingError> {
        let url = build_ws_url(&config.signaling_url, &config.local_peer_id)?;

        tracing::info!("Connecting to signaling server: {}", url);
        let first = open_socket(&url).await?;

        let (outgoing, outgoing_rx) = mpsc::channel::<String>(100);
        let (event_tx, _) = broadcast::channel(100);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let relay = Arc::new(Self {
            peer_id: config.local_peer_id.clone(),
            url: url.clone(),
            // Der Handshake ist bereits abgeschlossen
            connected: Arc::new(RwLock::new(true)),
            outgoing,
            event_tx: event_tx.clone(),
            shutdown,
        });

        let backoff = Backoff::new(config.reconnect_initial_delay(), config.reconnect_max_delay());
        tokio::spawn(connection_loop(
            url,
            first,
            outgoing_rx,
            event_tx,
            Arc::clone(&relay.connected),
            shutdown_rx,
            backoff,
        ));

        Ok(relay)
    }

    /// Beendet die Verbindung und den Reconnect-Loop
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

impl Drop for WebSocketRelay {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl RelayChannel for WebSocketRelay {
    fn local_id(&self) -> String {
        self.peer_id.clone()
    }

    fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    async fn send(&self, message: RelayMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let text = serde_json::to_string(&message)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        self.outgoing
            .send(text)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.event_tx.subscribe()
    }
}

impl std::fmt::Debug for WebSocketRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketRelay")
            .field("url", &self.url.as_str())
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ============================================================================
// CONNECTION LOOP
// ============================================================================

/// Baut die WebSocket-URL: `<base>/ws?peerId=<id>`
fn build_ws_url(signaling_url: &str, peer_id: &str) -> Result<Url, SignalingError> {
    let mut url =
        Url::parse(signaling_url).map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::ConnectionFailed(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::ConnectionFailed("cannot set scheme".to_string()))?;

    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().clear().append_pair("peerId", peer_id);

    Ok(url)
}

async fn open_socket(url: &Url) -> Result<WsStream, SignalingError> {
    match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
        Ok(Ok((stream, _))) => Ok(stream),
        Ok(Err(e)) => Err(SignalingError::ConnectionFailed(e.to_string())),
        Err(_) => Err(SignalingError::ConnectionFailed("Timeout".to_string())),
    }
}

/// Exponentielles Backoff mit Jitter
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }
}

async fn connection_loop(
    url: Url,
    first: WsStream,
    mut outgoing_rx: mpsc::Receiver<String>,
    event_tx: broadcast::Sender<RelayEvent>,
    connected: Arc<RwLock<bool>>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut backoff: Backoff,
) {
    let mut pending = Some(first);

    loop {
        let stream = match pending.take() {
            Some(stream) => stream,
            None => match open_socket(&url).await {
                Ok(stream) => stream,
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Reconnect failed ({}), retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown_rx.changed() => break,
                    }
                }
            },
        };

        *connected.write() = true;
        backoff.reset();
        let _ = event_tx.send(RelayEvent::Connected);
        tracing::info!("Connected to signaling server");

        let end = pump(stream, &mut outgoing_rx, &event_tx, &mut shutdown_rx).await;

        *connected.write() = false;
        let _ = event_tx.send(RelayEvent::Disconnected);

        if end == PumpEnd::Shutdown {
            tracing::info!("Signaling connection closed");
            break;
        }
        tracing::warn!("Signaling connection lost, reconnecting");
    }
}

/// Liest und schreibt Frames, bis die Verbindung endet
async fn pump(
    stream: WsStream,
    outgoing_rx: &mut mpsc::Receiver<String>,
    event_tx: &broadcast::Sender<RelayEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> PumpEnd {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayMessage>(&text) {
                    Ok(message) => {
                        let _ = event_tx.send(RelayEvent::Message(message));
                    }
                    Err(e) => tracing::debug!("Ignoring unknown relay frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("WebSocket closed by server");
                    return PumpEnd::ConnectionLost;
                }
                Some(Err(e)) => {
                    tracing::error!("WebSocket error: {}", e);
                    return PumpEnd::ConnectionLost;
                }
                Some(Ok(_)) => {}
            },

            outgoing = outgoing_rx.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        tracing::error!("Failed to send WebSocket message: {}", e);
                        return PumpEnd::ConnectionLost;
                    }
                }
                None => return PumpEnd::Shutdown,
            },

            _ = shutdown_rx.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return PumpEnd::Shutdown;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
