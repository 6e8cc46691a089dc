//! callroom <room-id>
//!
//! Betritt einen Call-Raum über den Signaling-Server aus `SIGNALING_URL`
//! und gibt Zustandswechsel aus. Ctrl-C legt auf.

use anyhow::{bail, Context, Result};
use callroom::{
    init_logging, CallConfig, CallCoordinator, CallEvent, SignalingClient, SystemDevices,
    WebRtcConnector, WebSocketRelay,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let Some(room_id) = std::env::args().nth(1) else {
        bail!("usage: callroom <room-id>");
    };

    let config = CallConfig::from_env().context("invalid configuration")?;
    tracing::info!("Starting callroom as peer {}", config.local_peer_id);

    // Relay verbinden
    let relay = WebSocketRelay::connect(&config)
        .await
        .context("signaling server unreachable")?;
    let (signaling, signaling_rx) = SignalingClient::start(relay.clone());

    let coordinator = CallCoordinator::new(
        config.clone(),
        Arc::new(SystemDevices::new()),
        signaling,
        signaling_rx,
        Arc::new(WebRtcConnector::new(&config)),
    );

    // Zustandswechsel ausgeben
    let mut events = coordinator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CallEvent::StateChanged(session) => {
                    println!(
                        "[{}] {} (role: {:?}, peer: {}, muted: {}, video off: {})",
                        session.room_id,
                        session.state,
                        session.role,
                        session.remote_peer.as_deref().unwrap_or("-"),
                        session.is_muted,
                        session.is_video_off
                    );
                    if session.state.is_terminal() {
                        break;
                    }
                }
                CallEvent::Error(message) => eprintln!("error: {}", message),
            }
        }
    });

    coordinator
        .enter_room(&room_id)
        .await
        .with_context(|| format!("cannot enter room {}", room_id))?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, hanging up");
            coordinator.hangup();
        }
        _ = printer => {}
    }

    // Zeit für call:ended und leaveRoom
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    relay.close();
    Ok(())
}
