//! WebRTC Peer Connection
//!
//! Implementierung von `PeerConnector` mit dem webrtc-Crate.
//! ICE Candidates werden nicht einzeln verschickt, sondern nach
//! abgeschlossenem Gathering im SDP mitgeliefert.

use super::connection::{PeerConnection, PeerConnectionState, PeerConnector, PeerError, PeerEvent};
use crate::config::CallConfig;
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "callroom";

fn webrtc_err(e: webrtc::Error) -> PeerError {
    PeerError::WebRTC(e.to_string())
}

// ============================================================================
// CONNECTOR
// ============================================================================

/// Erzeugt WebRTC Peer Connections mit den konfigurierten ICE Servern
#[derive(Debug, Clone)]
pub struct WebRtcConnector {
    ice_servers: Vec<RTCIceServer>,
    gathering_timeout: Duration,
}

impl WebRtcConnector {
    pub fn new(config: &CallConfig) -> Self {
        let ice_servers = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        Self {
            ice_servers,
            gathering_timeout: config.ice_gathering_timeout(),
        }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        // Media Engine mit Standard-Codecs (Opus, PCMU, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);
        register_handlers(&pc, events);

        Ok(Arc::new(WebRtcConnection {
            pc,
            gathering_timeout: self.gathering_timeout,
            video_sender: Mutex::new(None),
            video_pump: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

/// Registriert Event Handler für die Peer Connection
fn register_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<PeerEvent>) {
    let state_tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);

        let state = match s {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                PeerConnectionState::New
            }
            RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
            RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
            RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        };
        let _ = state_tx.send(PeerEvent::StateChanged(state));

        Box::pin(async {})
    }));

    // Track Handler (eingehende Media der Gegenstelle)
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        let track_id = track.id();
        tracing::info!("Received remote {:?} track {}: {:?}", kind, track_id, track.codec());
        let _ = events.send(PeerEvent::RemoteTrack { kind, track_id });

        Box::pin(async move {
            // Wiedergabe ist Sache der Oberfläche; RTP wird nur abgenommen
            tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
        })
    }));
}

// ============================================================================
// CONNECTION
// ============================================================================

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    gathering_timeout: Duration,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    video_pump: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebRtcConnection {
    /// Wartet auf das Ende des ICE Gathering und liefert das vollständige SDP
    async fn finish_local_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<String, PeerError> {
        let mut gather_complete = self.pc.gathering_complete_promise().await;

        self.pc
            .set_local_description(description)
            .await
            .map_err(webrtc_err)?;

        if tokio::time::timeout(self.gathering_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            tracing::debug!(
                "ICE gathering timeout after {:?}, sending candidates gathered so far",
                self.gathering_timeout
            );
        }

        self.pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| PeerError::WebRTC("No local description".to_string()))
    }

    fn track_rtcp(&self, sender: Arc<RTCRtpSender>) {
        // RTCP muss gelesen werden, damit die Interceptors arbeiten
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        self.tasks.lock().push(handle);
    }
}

fn sample_track_for(track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
    let codec = track.codec();
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: codec.mime_type.clone(),
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            ..Default::default()
        },
        track.id().to_string(),
        STREAM_ID.to_string(),
    ))
}

/// Leitet die Frames eines lokalen Tracks in den WebRTC-Track
fn spawn_sample_pump(source: &LocalTrack, sink: Arc<TrackLocalStaticSample>) -> JoinHandle<()> {
    let mut frames = source.subscribe();
    let track_id = source.id().to_string();

    tokio::spawn(async move {
        loop {
            match frames.recv().await {
                Ok(frame) => {
                    let sample = Sample {
                        data: frame.data,
                        duration: frame.duration,
                        ..Default::default()
                    };
                    if let Err(e) = sink.write_sample(&sample).await {
                        tracing::debug!("Failed to write sample for {}: {}", track_id, e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Track {} lagged, {} frames skipped", track_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn attach_local_media(
        &self,
        audio: &Arc<LocalTrack>,
        video: Option<&Arc<LocalTrack>>,
    ) -> Result<(), PeerError> {
        let audio_sample = sample_track_for(audio);
        let audio_sender = self
            .pc
            .add_track(Arc::clone(&audio_sample) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_err)?;
        self.track_rtcp(audio_sender);
        let pump = spawn_sample_pump(audio, audio_sample);
        self.tasks.lock().push(pump);

        // Video-Slot immer anlegen, damit später ohne Neuverhandlung
        // ein Screen-Track eingesetzt werden kann
        let video_sender = match video {
            Some(track) => {
                let sample = sample_track_for(track);
                let sender = self
                    .pc
                    .add_track(Arc::clone(&sample) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(webrtc_err)?;
                *self.video_pump.lock() = Some(spawn_sample_pump(track, sample));
                sender
            }
            None => {
                let transceiver = self
                    .pc
                    .add_transceiver_from_kind(
                        RTPCodecType::Video,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Sendrecv,
                            send_encodings: vec![],
                        }),
                    )
                    .await
                    .map_err(webrtc_err)?;
                transceiver.sender().await
            }
        };

        self.track_rtcp(Arc::clone(&video_sender));
        *self.video_sender.lock() = Some(video_sender);
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        self.finish_local_description(offer).await
    }

    async fn create_answer(&self, offer_sdp: &str) -> Result<String, PeerError> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| PeerError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(webrtc_err)?;

        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        self.finish_local_description(answer).await
    }

    async fn set_remote_answer(&self, answer_sdp: &str) -> Result<(), PeerError> {
        let answer = RTCSessionDescription::answer(answer_sdp.to_string())
            .map_err(|e| PeerError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(webrtc_err)
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };

        self.pc.add_ice_candidate(init).await.map_err(webrtc_err)
    }

    async fn replace_video_track(&self, track: Option<&Arc<LocalTrack>>) -> Result<(), PeerError> {
        let sender = self
            .video_sender
            .lock()
            .clone()
            .ok_or_else(|| PeerError::WebRTC("No video sender".to_string()))?;

        let sample = track.map(|t| sample_track_for(t));
        sender
            .replace_track(
                sample
                    .clone()
                    .map(|s| s as Arc<dyn TrackLocal + Send + Sync>),
            )
            .await
            .map_err(webrtc_err)?;

        // Erst nach erfolgreichem Austausch die Frame-Quelle umhängen
        let new_pump = match (track, sample) {
            (Some(track), Some(sample)) => Some(spawn_sample_pump(track, sample)),
            _ => None,
        };
        if let Some(old) = std::mem::replace(&mut *self.video_pump.lock(), new_pump) {
            old.abort();
        }

        tracing::info!(
            "Outbound video replaced with {}",
            track.map(|t| t.id()).unwrap_or("nothing")
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        if let Some(pump) = self.video_pump.lock().take() {
            pump.abort();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.pc.close().await.map_err(webrtc_err)
    }
}
