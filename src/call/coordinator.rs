//! Call Coordinator
//!
//! Führt MediaController, SignalingClient und PeerSession durch die
//! Zustandsmaschine eines Calls:
//!
//! Idle → Requesting → Waiting → Negotiating → Connected → Ended
//!
//! Failed ist ein paralleler Endzustand. Beim Eintritt in Ended oder
//! Failed werden die lokalen Tracks immer freigegeben.

use super::session::{CallRole, CallSession, CallState, EndReason, FailureReason, TransitionError};
use crate::config::CallConfig;
use crate::media::{LocalMediaHandle, LocalTrack, MediaController, MediaDevices, MediaError, TrackSource};
use crate::peer::{
    OutboundTracks, PeerConnector, PeerError, PeerRole, PeerSession, PeerSessionEvent,
    SessionEvent, SignalOutcome,
};
use crate::signaling::{SignalEnvelope, SignalPayload, SignalingClient, SignalingError, SignalingEvent};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Already in a call (room {room_id})")]
    AlreadyInCall { room_id: String },

    #[error("No active call")]
    NoActiveCall,

    #[error("Call ended before the operation completed")]
    Aborted,

    #[error("Not possible while {0}")]
    InvalidState(CallState),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Peer(#[from] PeerError),
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events für Beobachter (UI, CLI)
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Neuer Snapshot nach jeder Transition
    StateChanged(CallSession),

    /// Fehler, der dem Benutzer gemeldet wird
    Error(String),
}

/// Interne Nachrichten an den Event-Loop
#[derive(Debug)]
enum Internal {
    Timeout { call_id: u64 },
    ScreenShareEnded { call_id: u64, track_id: String },
    ReplayOffer { call_id: u64, from: String, sdp: String },
}

enum LoopMessage {
    Signaling(SignalingEvent),
    Session(SessionEvent),
    Internal(Internal),
}

#[derive(Debug, Clone)]
enum Termination {
    End(EndReason),
    Fail(FailureReason),
}

impl Termination {
    fn apply(&self, session: &CallSession) -> Result<CallSession, TransitionError> {
        match self {
            Termination::End(reason) => session.end(*reason),
            Termination::Fail(reason) => session.fail(reason.clone()),
        }
    }

    /// Ob die Gegenstelle per `call:ended` informiert wird
    fn notifies_peer(&self, previous: &CallState, remote_known: bool) -> bool {
        match self {
            Termination::End(EndReason::LocalHangup) => previous.has_media(),
            Termination::End(_) => false,
            Termination::Fail(FailureReason::MediaUnavailable) => false,
            Termination::Fail(_) => previous.has_media() && remote_known,
        }
    }
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Alles, was zu einem laufenden Call gehört
struct ActiveCall {
    session: CallSession,
    media: Option<LocalMediaHandle>,
    peer: Option<Arc<PeerSession>>,
    pending_offer: Option<(String, String)>,
    timer: Option<JoinHandle<()>>,
}

impl ActiveCall {
    fn new(session: CallSession) -> Self {
        Self {
            session,
            media: None,
            peer: None,
            pending_offer: None,
            timer: None,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveCall>,
    last: Option<CallSession>,
}

impl Slot {
    fn current_mut(&mut self, call_id: Option<u64>) -> Result<&mut ActiveCall, CallError> {
        match (self.active.as_mut(), call_id) {
            (None, _) => Err(CallError::NoActiveCall),
            (Some(call), Some(id)) if call.session.call_id != id => Err(CallError::Aborted),
            (Some(call), _) => Ok(call),
        }
    }
}

// ============================================================================
// CALL COORDINATOR
// ============================================================================

/// Orchestriert genau einen Call zur Zeit
///
/// Wird der Coordinator gedroppt (Navigation weg vom Call), wird aufgelegt.
pub struct CallCoordinator {
    inner: Arc<Inner>,
    event_loop: JoinHandle<()>,
}

impl CallCoordinator {
    /// Erstellt den Coordinator und startet den Event-Loop
    ///
    /// Muss innerhalb einer Tokio-Runtime aufgerufen werden.
    pub fn new(
        config: CallConfig,
        devices: Arc<dyn MediaDevices>,
        signaling: SignalingClient,
        signaling_rx: mpsc::Receiver<SignalingEvent>,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(100);

        let inner = Arc::new(Inner {
            local_id: signaling.local_id(),
            config,
            media: MediaController::new(devices),
            signaling,
            connector,
            slot: Mutex::new(Slot::default()),
            op_lock: tokio::sync::Mutex::new(()),
            next_call_id: AtomicU64::new(1),
            events,
            internal_tx,
            session_tx,
            runtime: tokio::runtime::Handle::current(),
        });

        let event_loop = tokio::spawn(run_event_loop(
            Arc::downgrade(&inner),
            signaling_rx,
            internal_rx,
            session_rx,
        ));

        tracing::info!("Call coordinator ready (peer id {})", inner.local_id);
        Self { inner, event_loop }
    }

    /// Events abonnieren
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// Aktueller Call oder der zuletzt beendete
    pub fn session(&self) -> Option<CallSession> {
        let slot = self.inner.slot.lock();
        slot.active
            .as_ref()
            .map(|call| call.session.clone())
            .or_else(|| slot.last.clone())
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    /// Betritt einen Call-Raum: Media beschaffen, Raum betreten, auf Peer warten
    ///
    /// Der Aufbau läuft als eigener Task weiter, auch wenn der Aufrufer das
    /// Future fallen lässt; der Call landet dann trotzdem in Waiting mit
    /// laufendem Timeout.
    pub async fn enter_room(&self, room_id: &str) -> Result<CallSession, CallError> {
        let inner = Arc::clone(&self.inner);
        let room_id = room_id.to_string();
        self.inner
            .runtime
            .spawn(async move { inner.enter_room(&room_id).await })
            .await
            .map_err(|e| {
                tracing::error!("Entering room aborted: {}", e);
                CallError::Aborted
            })?
    }

    /// Legt sofort auf; Aufräumen läuft im Hintergrund weiter
    pub fn hangup(&self) -> Option<CallSession> {
        self.inner
            .terminate(None, Termination::End(EndReason::LocalHangup))
    }

    /// Mikrofon stumm schalten (nur lokal)
    pub fn set_muted(&self, muted: bool) -> Result<CallSession, CallError> {
        self.inner.set_muted(muted)
    }

    /// Kamera aus-/einschalten (nur lokal)
    pub fn set_video_off(&self, video_off: bool) -> Result<CallSession, CallError> {
        self.inner.set_video_off(video_off)
    }

    /// Bildschirmfreigabe starten; ersetzt den ausgehenden Video-Track
    pub async fn start_screen_share(&self) -> Result<CallSession, CallError> {
        self.inner.start_screen_share().await
    }

    /// Bildschirmfreigabe beenden; die Kamera ist wieder die Quelle
    pub async fn stop_screen_share(&self) -> Result<CallSession, CallError> {
        self.inner.stop_screen_share(None).await
    }
}

impl Drop for CallCoordinator {
    fn drop(&mut self) {
        if self.inner.terminate(None, Termination::End(EndReason::LocalHangup)).is_some() {
            tracing::info!("Call coordinator dropped, call ended");
        }
        self.event_loop.abort();
    }
}

impl std::fmt::Debug for CallCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCoordinator")
            .field("local_id", &self.inner.local_id)
            .field("session", &self.session())
            .finish()
    }
}

// ============================================================================
// EVENT LOOP
// ============================================================================

async fn run_event_loop(
    inner: Weak<Inner>,
    mut signaling_rx: mpsc::Receiver<SignalingEvent>,
    mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
) {
    loop {
        let message = tokio::select! {
            biased;
            Some(event) = signaling_rx.recv() => LoopMessage::Signaling(event),
            Some(event) = session_rx.recv() => LoopMessage::Session(event),
            Some(event) = internal_rx.recv() => LoopMessage::Internal(event),
            else => break,
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.dispatch(message).await;
    }

    tracing::debug!("Call coordinator event loop stopped");
}

// ============================================================================
// INNER
// ============================================================================

struct Inner {
    config: CallConfig,
    local_id: String,
    media: MediaController,
    signaling: SignalingClient,
    connector: Arc<dyn PeerConnector>,
    slot: Mutex<Slot>,
    /// Serialisiert Verhandlung und Track-Austausch
    op_lock: tokio::sync::Mutex<()>,
    next_call_id: AtomicU64,
    events: broadcast::Sender<CallEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    runtime: tokio::runtime::Handle,
}

impl Inner {
    fn emit_state(&self, session: &CallSession) {
        tracing::info!(
            "Call {} in room {}: {}",
            session.call_id,
            session.room_id,
            session.state
        );
        let _ = self.events.send(CallEvent::StateChanged(session.clone()));
    }

    fn report_error(&self, message: impl std::fmt::Display) {
        let _ = self.events.send(CallEvent::Error(message.to_string()));
    }

    /// Ändert den aktuellen Call unter dem Lock und meldet den neuen Zustand
    fn update<F>(&self, call_id: Option<u64>, f: F) -> Result<CallSession, CallError>
    where
        F: FnOnce(&mut ActiveCall) -> Result<CallSession, CallError>,
    {
        let session = {
            let mut slot = self.slot.lock();
            let call = slot.current_mut(call_id)?;
            let next = f(call)?;
            call.session = next.clone();
            next
        };
        self.emit_state(&session);
        Ok(session)
    }

    fn current_state(&self) -> Option<(u64, CallState)> {
        self.slot
            .lock()
            .active
            .as_ref()
            .map(|call| (call.session.call_id, call.session.state.clone()))
    }

    fn arm_timeout(&self, call: &mut ActiveCall) {
        if call.timer.is_some() {
            return;
        }
        let call_id = call.session.call_id;
        let timeout = self.config.connect_timeout();
        let tx = self.internal_tx.clone();
        call.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Internal::Timeout { call_id });
        }));
    }

    /// Übergang nach Ended/Failed mit vollständigem Aufräumen
    ///
    /// Tracks werden synchron gestoppt, Verbindung und Raum im Hintergrund
    /// geschlossen. Gibt `None` zurück, wenn kein passender Call läuft.
    fn terminate(&self, call_id: Option<u64>, termination: Termination) -> Option<CallSession> {
        let (previous, next, mut call) = {
            let mut slot = self.slot.lock();
            let current = slot.active.as_ref()?;
            if call_id.is_some_and(|id| id != current.session.call_id) {
                return None;
            }
            let next = match termination.apply(&current.session) {
                Ok(next) => next,
                Err(e) => {
                    tracing::debug!("Ignoring termination: {}", e);
                    return None;
                }
            };
            let previous = current.session.state.clone();
            let call = slot.active.take()?;
            slot.last = Some(next.clone());
            (previous, next, call)
        };

        call.cancel_timer();
        if let Some(mut media) = call.media.take() {
            self.media.release(&mut media);
        }
        self.emit_state(&next);

        let notify = termination.notifies_peer(&previous, next.remote_peer.is_some());
        let peer = call.peer.take();
        let signaling = self.signaling.clone();
        let local_id = self.local_id.clone();
        let remote = next.remote_peer.clone().unwrap_or_default();
        let room_id = next.room_id.clone();

        self.runtime.spawn(async move {
            if notify {
                let envelope = SignalEnvelope::call_ended(local_id, remote, room_id.clone());
                if let Err(e) = signaling.send(envelope).await {
                    tracing::warn!("Failed to send call:ended: {}", e);
                }
            }
            if let Some(peer) = peer {
                peer.close().await;
            }
            if let Err(e) = signaling.leave_room(&room_id).await {
                tracing::debug!("Failed to leave room {}: {}", room_id, e);
            }
        });

        Some(next)
    }

    // ------------------------------------------------------------------------
    // USER OPERATIONS
    // ------------------------------------------------------------------------

    async fn enter_room(&self, room_id: &str) -> Result<CallSession, CallError> {
        let requesting = {
            let mut slot = self.slot.lock();
            if let Some(call) = &slot.active {
                return Err(CallError::AlreadyInCall {
                    room_id: call.session.room_id.clone(),
                });
            }
            let call_id = self.next_call_id.fetch_add(1, Ordering::SeqCst);
            let session = CallSession::new(call_id, room_id).request_media()?;
            slot.active = Some(ActiveCall::new(session.clone()));
            session
        };
        let call_id = requesting.call_id;
        self.emit_state(&requesting);

        // Requesting → Waiting
        let handle = match self.media.acquire(self.config.prefer_video).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Call {}: media unavailable: {}", call_id, e);
                self.report_error(&e);
                self.terminate(Some(call_id), Termination::Fail(FailureReason::MediaUnavailable));
                return Err(e.into());
            }
        };

        let video_unavailable = handle.video_unavailable();
        let has_camera = handle.camera().is_some();
        let mut handle = Some(handle);
        let mut pending_offer = None;
        let waiting = {
            let mut slot = self.slot.lock();
            match slot.current_mut(Some(call_id)) {
                Ok(call) => match call.session.media_acquired(has_camera, video_unavailable) {
                    Ok(next) => {
                        call.session = next.clone();
                        call.media = handle.take();
                        pending_offer = call.pending_offer.take();
                        Ok(next)
                    }
                    Err(e) => Err(CallError::from(e)),
                },
                Err(e) => Err(e),
            }
        };
        let waiting = match waiting {
            Ok(waiting) => waiting,
            Err(e) => {
                // Aufgelegt während der Beschaffung
                tracing::info!("Call {}: abandoned during media acquisition", call_id);
                if let Some(mut handle) = handle.take() {
                    self.media.release(&mut handle);
                }
                return Err(match e {
                    CallError::NoActiveCall => CallError::Aborted,
                    other => other,
                });
            }
        };
        self.emit_state(&waiting);

        if let Err(e) = self.signaling.join_room(room_id).await {
            tracing::error!("Call {}: cannot join room {}: {}", call_id, room_id, e);
            self.report_error(&e);
            self.terminate(
                Some(call_id),
                Termination::Fail(FailureReason::SignalingUnreachable),
            );
            return Err(e.into());
        }

        let still_current = {
            let mut slot = self.slot.lock();
            match slot.current_mut(Some(call_id)) {
                Ok(call) => {
                    self.arm_timeout(call);
                    true
                }
                Err(_) => false,
            }
        };
        if !still_current {
            // Aufgelegt während joinRoom; das leaveRoom des Abbaus kann davor gelaufen sein
            tracing::info!("Call {}: abandoned while joining room {}", call_id, room_id);
            if let Err(e) = self.signaling.leave_room(room_id).await {
                tracing::debug!("Failed to leave room {}: {}", room_id, e);
            }
            return Err(CallError::Aborted);
        }

        if let Some((from, sdp)) = pending_offer {
            tracing::info!("Call {}: replaying offer from '{}'", call_id, from);
            let _ = self
                .internal_tx
                .send(Internal::ReplayOffer { call_id, from, sdp });
        }

        Ok(waiting)
    }

    fn set_muted(&self, muted: bool) -> Result<CallSession, CallError> {
        self.update(None, |call| {
            let next = call.session.with_muted(muted)?;
            let media = call.media.as_ref().ok_or(CallError::NoActiveCall)?;
            self.media.set_audio_enabled(media, !muted);
            Ok(next)
        })
    }

    fn set_video_off(&self, video_off: bool) -> Result<CallSession, CallError> {
        self.update(None, |call| {
            let next = call.session.with_video_off(video_off)?;
            let media = call.media.as_ref().ok_or(CallError::NoActiveCall)?;
            if !self.media.set_video_enabled(media, !video_off) && !video_off {
                return Err(MediaError::DeviceUnavailable {
                    source_kind: TrackSource::Camera,
                    reason: "no camera track".to_string(),
                }
                .into());
            }
            Ok(next)
        })
    }

    async fn start_screen_share(&self) -> Result<CallSession, CallError> {
        let _op = self.op_lock.lock().await;

        let (call_id, opening) = {
            let mut slot = self.slot.lock();
            let call = slot.current_mut(None)?;
            if !call.session.state.has_media() {
                return Err(CallError::InvalidState(call.session.state.clone()));
            }
            let media = call.media.as_ref().ok_or(CallError::NoActiveCall)?;
            (call.session.call_id, self.media.start_screen_share(media))
        };

        let screen = match opening.await {
            Ok(screen) => screen,
            Err(e) => {
                tracing::warn!("Call {}: screen share unavailable: {}", call_id, e);
                self.report_error(&e);
                return Err(e.into());
            }
        };

        // Erst an die Verbindung hängen, dann lokal übernehmen
        let peer = self
            .slot
            .lock()
            .current_mut(Some(call_id))
            .map(|call| call.peer.clone());
        let peer = match peer {
            Ok(peer) => peer,
            Err(e) => {
                screen.stop();
                return Err(e);
            }
        };
        if let Some(peer) = peer {
            if let Err(e) = peer.replace_outbound_video_track(Some(&screen)).await {
                tracing::error!("Call {}: cannot attach screen track: {}", call_id, e);
                screen.stop();
                self.report_error(&e);
                return Err(e.into());
            }
        }

        let result = self.update(Some(call_id), |call| {
            let media = call.media.as_mut().ok_or(CallError::NoActiveCall)?;
            self.media.commit_screen_share(media, Arc::clone(&screen))?;
            Ok(call.session.with_screen_sharing(true)?)
        });
        if result.is_err() {
            screen.stop();
            return result;
        }

        self.watch_screen_share(call_id, &screen);
        result
    }

    /// Meldet, wenn die Freigabe von außen beendet wird
    fn watch_screen_share(&self, call_id: u64, screen: &LocalTrack) {
        let mut ended = screen.ended();
        let track_id = screen.id().to_string();
        let tx = self.internal_tx.clone();

        self.runtime.spawn(async move {
            if ended.wait_for(|ended| *ended).await.is_ok() {
                let _ = tx.send(Internal::ScreenShareEnded { call_id, track_id });
            }
        });
    }

    /// Beendet die Freigabe
    ///
    /// `ended_track` ist gesetzt, wenn die Quelle selbst beendet wurde; dann
    /// wird auch bei einem Fehler der Verbindung lokal zurückgeschaltet.
    async fn stop_screen_share(
        &self,
        ended_track: Option<(u64, String)>,
    ) -> Result<CallSession, CallError> {
        let _op = self.op_lock.lock().await;
        let expected_call = ended_track.as_ref().map(|(call_id, _)| *call_id);

        let (call_id, peer, camera) = {
            let mut slot = self.slot.lock();
            let call = slot.current_mut(expected_call)?;
            let media = call.media.as_ref().ok_or(CallError::NoActiveCall)?;
            let screen = media.screen().ok_or(MediaError::NoScreenShare)?;
            if let Some((_, track_id)) = &ended_track {
                if screen.id() != track_id {
                    return Err(MediaError::NoScreenShare.into());
                }
            }
            (
                call.session.call_id,
                call.peer.clone(),
                media.camera().cloned(),
            )
        };

        if let Some(peer) = peer {
            if let Err(e) = peer.replace_outbound_video_track(camera.as_ref()).await {
                tracing::error!("Call {}: cannot restore camera track: {}", call_id, e);
                self.report_error(&e);
                if ended_track.is_none() {
                    return Err(e.into());
                }
            }
        }

        self.update(Some(call_id), |call| {
            let media = call.media.as_mut().ok_or(CallError::NoActiveCall)?;
            self.media.stop_screen_share(media)?;
            Ok(call.session.with_screen_sharing(false)?)
        })
    }

    // ------------------------------------------------------------------------
    // EVENT HANDLING
    // ------------------------------------------------------------------------

    async fn dispatch(&self, message: LoopMessage) {
        match message {
            LoopMessage::Signaling(event) => self.on_signaling_event(event).await,
            LoopMessage::Session(event) => self.on_session_event(event),
            LoopMessage::Internal(Internal::Timeout { call_id }) => self.on_timeout(call_id),
            LoopMessage::Internal(Internal::ScreenShareEnded { call_id, track_id }) => {
                match self.stop_screen_share(Some((call_id, track_id))).await {
                    Ok(_) => tracing::info!("Call {}: screen share ended by source", call_id),
                    Err(e) => tracing::debug!("Ignoring ended screen track: {}", e),
                }
            }
            LoopMessage::Internal(Internal::ReplayOffer { call_id, from, sdp }) => {
                if self.current_state().map(|(id, _)| id) == Some(call_id) {
                    self.on_signal(from, SignalPayload::Offer { sdp }).await;
                }
            }
        }
    }

    async fn on_signaling_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => tracing::info!("Signaling connected"),

            SignalingEvent::Disconnected => {
                tracing::warn!("Signaling disconnected, waiting for reconnect")
            }

            SignalingEvent::PeerJoined { peer_id } => self.on_peer_joined(peer_id).await,

            SignalingEvent::SignalReceived { from, payload } => self.on_signal(from, payload).await,

            SignalingEvent::CallRejected => {
                if let Some((call_id, _)) = self.current_state() {
                    tracing::info!("Call {}: rejected by remote", call_id);
                    self.terminate(Some(call_id), Termination::End(EndReason::RemoteRejected));
                }
            }

            SignalingEvent::CallEnded { room_id } => {
                let call_id = {
                    let slot = self.slot.lock();
                    slot.active
                        .as_ref()
                        .filter(|call| call.session.room_id == room_id)
                        .map(|call| call.session.call_id)
                };
                match call_id {
                    Some(call_id) => {
                        tracing::info!("Call {}: ended by remote", call_id);
                        self.terminate(Some(call_id), Termination::End(EndReason::RemoteEnded));
                    }
                    None => tracing::debug!("Ignoring call:ended for room {}", room_id),
                }
            }
        }
    }

    /// Waiting → Negotiating als Initiator
    async fn on_peer_joined(&self, peer_id: String) {
        if peer_id == self.local_id {
            return;
        }
        let _op = self.op_lock.lock().await;

        let prepared = {
            let mut slot = self.slot.lock();
            match slot.active.as_mut() {
                Some(call) if call.session.state == CallState::Waiting => {
                    match (
                        call.media.as_ref(),
                        call.session.negotiate(CallRole::Initiator, &peer_id),
                    ) {
                        (Some(media), Ok(next)) => {
                            let tracks = OutboundTracks::from_handle(media);
                            call.session = next.clone();
                            Some((tracks, next))
                        }
                        _ => None,
                    }
                }
                Some(call) => {
                    tracing::debug!(
                        "Ignoring peer-joined from '{}' while {}",
                        peer_id,
                        call.session.state
                    );
                    None
                }
                None => None,
            }
        };
        let Some((tracks, session)) = prepared else {
            return;
        };
        self.emit_state(&session);

        let result = PeerSession::create_as_initiator(
            self.connector.as_ref(),
            &self.local_id,
            &peer_id,
            tracks,
            self.session_tx.clone(),
        )
        .await;
        self.install_session(session.call_id, result).await;
    }

    async fn on_signal(&self, from: String, payload: SignalPayload) {
        if from == self.local_id {
            return;
        }
        let _op = self.op_lock.lock().await;

        let current = {
            let mut slot = self.slot.lock();
            match slot.active.as_mut() {
                None => None,
                Some(call) if call.session.state == CallState::Requesting => {
                    match &payload {
                        SignalPayload::Offer { sdp } => {
                            tracing::info!("Queueing offer from '{}' until media is ready", from);
                            call.pending_offer = Some((from.clone(), sdp.clone()));
                        }
                        _ => tracing::debug!("Dropping signal from '{}' before media", from),
                    }
                    return;
                }
                Some(call) => Some((
                    call.session.call_id,
                    call.session.state.clone(),
                    call.peer.clone(),
                )),
            }
        };

        let Some((call_id, state, peer)) = current else {
            tracing::debug!("Dropping stale signal from '{}': no active call", from);
            return;
        };

        let Some(peer) = peer else {
            match payload {
                SignalPayload::Offer { sdp } if state == CallState::Waiting => {
                    self.respond(call_id, from, sdp).await
                }
                _ => tracing::debug!("Dropping signal from '{}' while {}", from, state),
            }
            return;
        };

        match peer.apply_remote_signal(&from, &payload).await {
            Ok(SignalOutcome::Applied) | Ok(SignalOutcome::Dropped) => {}

            Ok(SignalOutcome::Renegotiate { sdp }) => {
                let glare = peer.role() == PeerRole::Initiator && state == CallState::Negotiating;
                if glare && self.local_id.as_str() > from.as_str() {
                    tracing::info!("Glare with '{}': keeping our offer", from);
                    return;
                }
                if glare {
                    tracing::info!("Glare with '{}': yielding, answering their offer", from);
                } else {
                    tracing::info!("New offer from '{}', replacing peer session", from);
                }
                self.respond(call_id, from, sdp).await;
            }

            Err(e) => match payload {
                SignalPayload::Answer { .. } => {
                    tracing::error!("Call {}: cannot apply answer: {}", call_id, e);
                    self.report_error(&e);
                    self.terminate(
                        Some(call_id),
                        Termination::Fail(FailureReason::Negotiation(e.to_string())),
                    );
                }
                _ => tracing::warn!("Call {}: cannot apply remote signal: {}", call_id, e),
            },
        }
    }

    /// → Negotiating als Responder; eine bestehende Session wird ersetzt
    async fn respond(&self, call_id: u64, from: String, sdp: String) {
        let prepared = {
            let mut slot = self.slot.lock();
            match slot.current_mut(Some(call_id)) {
                Ok(call) => match (
                    call.media.as_ref(),
                    call.session.negotiate(CallRole::Responder, &from),
                ) {
                    (Some(media), Ok(next)) => {
                        let tracks = OutboundTracks::from_handle(media);
                        call.session = next.clone();
                        let old_peer = call.peer.take();
                        self.arm_timeout(call);
                        Some((tracks, old_peer, next))
                    }
                    _ => None,
                },
                Err(_) => None,
            }
        };
        let Some((tracks, old_peer, session)) = prepared else {
            return;
        };
        self.emit_state(&session);

        if let Some(old_peer) = old_peer {
            old_peer.close().await;
        }

        let result = PeerSession::create_as_responder(
            self.connector.as_ref(),
            &self.local_id,
            &from,
            tracks,
            &sdp,
            self.session_tx.clone(),
        )
        .await;
        self.install_session(call_id, result).await;
    }

    /// Übernimmt eine neue PeerSession und verschickt Offer bzw. Answer
    async fn install_session(
        &self,
        call_id: u64,
        result: Result<(PeerSession, SignalEnvelope), PeerError>,
    ) {
        let (peer, envelope) = match result {
            Ok(created) => created,
            Err(e) => {
                tracing::error!("Call {}: negotiation failed: {}", call_id, e);
                self.report_error(&e);
                self.terminate(
                    Some(call_id),
                    Termination::Fail(FailureReason::Negotiation(e.to_string())),
                );
                return;
            }
        };
        let peer = Arc::new(peer);

        let installed = {
            let mut slot = self.slot.lock();
            match slot.current_mut(Some(call_id)) {
                Ok(call) if call.session.state == CallState::Negotiating => {
                    call.peer = Some(Arc::clone(&peer));
                    true
                }
                _ => false,
            }
        };
        if !installed {
            tracing::debug!("Call {} is gone, discarding new peer session", call_id);
            peer.close().await;
            return;
        }

        if let Err(e) = self.signaling.send(envelope).await {
            tracing::error!("Call {}: cannot send {:?}: {}", call_id, peer.role(), e);
            self.report_error(&e);
            self.terminate(
                Some(call_id),
                Termination::Fail(FailureReason::SignalingUnreachable),
            );
        }
    }

    fn on_session_event(&self, event: SessionEvent) {
        let call_id = {
            let slot = self.slot.lock();
            slot.active
                .as_ref()
                .filter(|call| {
                    call.peer
                        .as_ref()
                        .is_some_and(|peer| peer.id() == event.session_id)
                })
                .map(|call| call.session.call_id)
        };
        let Some(call_id) = call_id else {
            tracing::debug!("Dropping event of stale session {}", event.session_id);
            return;
        };

        match event.event {
            PeerSessionEvent::RemoteStream => {
                let result = self.update(Some(call_id), |call| {
                    let next = call.session.connected()?;
                    call.cancel_timer();
                    Ok(next)
                });
                if let Err(e) = result {
                    tracing::debug!("Remote stream ignored: {}", e);
                }
            }

            PeerSessionEvent::Disconnected => {
                tracing::warn!("Call {}: peer connection interrupted", call_id);
            }

            PeerSessionEvent::ConnectionFailed => {
                tracing::error!("Call {}: peer connection failed", call_id);
                self.report_error("Connection to peer lost");
                self.terminate(
                    Some(call_id),
                    Termination::Fail(FailureReason::ConnectionLost),
                );
            }
        }
    }

    fn on_timeout(&self, call_id: u64) {
        match self.current_state() {
            Some((id, CallState::Waiting | CallState::Negotiating)) if id == call_id => {
                tracing::warn!(
                    "Call {}: no connection after {:?}",
                    call_id,
                    self.config.connect_timeout()
                );
                self.report_error("Timed out waiting for the other participant");
                self.terminate(Some(call_id), Termination::Fail(FailureReason::Timeout));
            }
            _ => {}
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerConnectionState, PeerEvent};
    use crate::signaling::{LocalRelay, LocalRelayHub, RelayChannel, RelayEvent, RelayMessage};
    use crate::testing::{FakeConnector, FakeDevices};
    use std::time::Duration;

    struct TestPeer {
        coordinator: CallCoordinator,
        devices: Arc<FakeDevices>,
        connector: Arc<FakeConnector>,
        events: broadcast::Receiver<CallEvent>,
    }

    fn test_peer(
        hub: &LocalRelayHub,
        id: &str,
        devices: FakeDevices,
        connector: FakeConnector,
    ) -> TestPeer {
        let config = CallConfig {
            local_peer_id: id.to_string(),
            connect_timeout_secs: 30,
            ..Default::default()
        };
        configured_peer(hub, config, devices, connector)
    }

    fn configured_peer(
        hub: &LocalRelayHub,
        config: CallConfig,
        devices: FakeDevices,
        connector: FakeConnector,
    ) -> TestPeer {
        let (signaling, signaling_rx) = SignalingClient::start(hub.connect(&config.local_peer_id));
        let devices = Arc::new(devices);
        let connector = Arc::new(connector);
        let coordinator = CallCoordinator::new(
            config,
            devices.clone(),
            signaling,
            signaling_rx,
            connector.clone(),
        );
        let events = coordinator.subscribe();

        TestPeer {
            coordinator,
            devices,
            connector,
            events,
        }
    }

    fn default_peer(hub: &LocalRelayHub, id: &str) -> TestPeer {
        test_peer(hub, id, FakeDevices::default(), FakeConnector::default())
    }

    fn silent_peer(hub: &LocalRelayHub, id: &str) -> TestPeer {
        let connector = FakeConnector {
            silent: true,
            ..Default::default()
        };
        test_peer(hub, id, FakeDevices::default(), connector)
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<CallEvent>,
        predicate: impl Fn(&CallSession) -> bool,
    ) -> CallSession {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Ok(CallEvent::StateChanged(session)) if predicate(&session) => return session,
                    Ok(_) => continue,
                    Err(e) => panic!("call event stream broke: {}", e),
                }
            }
        })
        .await
        .expect("timed out waiting for call state")
    }

    async fn wait_for_state(
        events: &mut broadcast::Receiver<CallEvent>,
        state: CallState,
    ) -> CallSession {
        wait_for(events, |session| session.state == state).await
    }

    async fn next_signal(rx: &mut broadcast::Receiver<RelayEvent>) -> (String, SignalPayload) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(RelayEvent::Message(RelayMessage::Signal { from, signal, .. })) =
                    rx.recv().await
                {
                    return (from, signal);
                }
            }
        })
        .await
        .expect("timed out waiting for signal")
    }

    async fn connected_pair(hub: &LocalRelayHub) -> (TestPeer, TestPeer) {
        let mut alice = default_peer(hub, "alice");
        let mut bob = default_peer(hub, "bob");

        alice.coordinator.enter_room("R1").await.unwrap();
        bob.coordinator.enter_room("R1").await.unwrap();

        wait_for_state(&mut alice.events, CallState::Connected).await;
        wait_for_state(&mut bob.events, CallState::Connected).await;
        (alice, bob)
    }

    fn raw_peer(hub: &LocalRelayHub, id: &str) -> (Arc<LocalRelay>, broadcast::Receiver<RelayEvent>) {
        let relay = hub.connect(id);
        let rx = relay.subscribe();
        (relay, rx)
    }

    #[tokio::test]
    async fn test_two_peers_connect() {
        let hub = LocalRelayHub::new();
        let (alice, bob) = connected_pair(&hub).await;

        let a = alice.coordinator.session().unwrap();
        let b = bob.coordinator.session().unwrap();
        assert_eq!(a.role, CallRole::Initiator);
        assert_eq!(a.remote_peer.as_deref(), Some("bob"));
        assert_eq!(b.role, CallRole::Responder);
        assert_eq!(b.remote_peer.as_deref(), Some("alice"));
        assert!(a.connected_at.is_some());

        let connection = alice.connector.last().unwrap();
        assert_eq!(connection.remote_answer().as_deref(), Some("v=0 fake-answer"));
        assert_eq!(alice.connector.connections(), 1);
        assert_eq!(bob.connector.connections(), 1);
    }

    #[tokio::test]
    async fn test_hangup_while_negotiating_ends_both_sides() {
        let hub = LocalRelayHub::new();
        let mut alice = silent_peer(&hub, "alice");
        let mut bob = silent_peer(&hub, "bob");

        alice.coordinator.enter_room("R1").await.unwrap();
        bob.coordinator.enter_room("R1").await.unwrap();
        wait_for_state(&mut alice.events, CallState::Negotiating).await;
        wait_for_state(&mut bob.events, CallState::Negotiating).await;

        let ended = alice.coordinator.hangup().unwrap();
        assert_eq!(ended.state, CallState::Ended(EndReason::LocalHangup));
        assert_eq!(alice.devices.live_tracks(), 0);

        wait_for_state(&mut bob.events, CallState::Ended(EndReason::RemoteEnded)).await;
        assert_eq!(bob.devices.live_tracks(), 0);

        // Zweites Auflegen ist ein No-op
        assert!(alice.coordinator.hangup().is_none());
    }

    #[tokio::test]
    async fn test_answer_after_hangup_is_dropped() {
        let hub = LocalRelayHub::new();
        let mut alice = default_peer(&hub, "alice");
        let (bob, _bob_rx) = raw_peer(&hub, "bob");

        alice.coordinator.enter_room("R1").await.unwrap();
        alice.coordinator.hangup();

        bob.send(RelayMessage::Signal {
            to: "alice".to_string(),
            from: "bob".to_string(),
            signal: SignalPayload::Answer {
                sdp: "v=0 late".to_string(),
            },
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            alice.coordinator.session().unwrap().state,
            CallState::Ended(EndReason::LocalHangup)
        );
        assert_eq!(alice.connector.connections(), 0);
        while let Ok(event) = alice.events.try_recv() {
            assert!(!matches!(event, CallEvent::Error(_)), "unexpected {:?}", event);
        }
    }

    #[tokio::test]
    async fn test_mute_and_video_off_send_no_signals() {
        let hub = LocalRelayHub::new();
        let mut alice = default_peer(&hub, "alice");
        let (bob, mut bob_rx) = raw_peer(&hub, "bob");

        alice.coordinator.enter_room("R1").await.unwrap();
        bob.send(RelayMessage::JoinRoom {
            room: "R1".to_string(),
        })
        .await
        .unwrap();
        next_signal(&mut bob_rx).await;
        bob.send(RelayMessage::Signal {
            to: "alice".to_string(),
            from: "bob".to_string(),
            signal: SignalPayload::Answer {
                sdp: "v=0 bob".to_string(),
            },
        })
        .await
        .unwrap();
        wait_for_state(&mut alice.events, CallState::Connected).await;

        let muted = alice.coordinator.set_muted(true).unwrap();
        let video_off = alice.coordinator.set_video_off(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(muted.is_muted);
        assert!(video_off.is_video_off);
        assert_eq!(video_off.state, CallState::Connected);
        let microphone = alice.devices.last_opened(TrackSource::Microphone).unwrap();
        assert!(!microphone.is_enabled());
        assert!(microphone.is_live());
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(alice.connector.connections(), 1);
        assert_eq!(alice.connector.last().unwrap().video_replacements(), 0);

        let unmuted = alice.coordinator.set_muted(false).unwrap();
        assert!(!unmuted.is_muted);
        assert!(microphone.is_enabled());
    }

    #[tokio::test]
    async fn test_screen_share_swaps_track_without_new_session() {
        let hub = LocalRelayHub::new();
        let (alice, _bob) = connected_pair(&hub).await;
        let camera = alice.devices.last_opened(TrackSource::Camera).unwrap();
        let connection = alice.connector.last().unwrap();

        let sharing = alice.coordinator.start_screen_share().await.unwrap();
        let screen = alice.devices.last_opened(TrackSource::Screen).unwrap();

        assert!(sharing.is_screen_sharing);
        assert_eq!(alice.connector.connections(), 1);
        assert_eq!(connection.outbound_video_id(), Some(screen.id().to_string()));
        assert!(camera.is_live());

        let stopped = alice.coordinator.stop_screen_share().await.unwrap();
        assert!(!stopped.is_screen_sharing);
        assert!(!screen.is_live());
        assert_eq!(connection.outbound_video_id(), Some(camera.id().to_string()));
        assert_eq!(alice.devices.open_count(TrackSource::Camera), 1);
        assert_eq!(alice.connector.connections(), 1);
    }

    #[tokio::test]
    async fn test_operator_ending_share_reverts_to_camera() {
        let hub = LocalRelayHub::new();
        let (mut alice, _bob) = connected_pair(&hub).await;
        let camera = alice.devices.last_opened(TrackSource::Camera).unwrap();

        alice.coordinator.start_screen_share().await.unwrap();
        while alice.events.try_recv().is_ok() {}
        alice
            .devices
            .last_opened(TrackSource::Screen)
            .unwrap()
            .end_from_source();

        let reverted = wait_for(&mut alice.events, |s| !s.is_screen_sharing).await;
        assert_eq!(reverted.state, CallState::Connected);
        assert_eq!(
            alice.connector.last().unwrap().outbound_video_id(),
            Some(camera.id().to_string())
        );
    }

    #[tokio::test]
    async fn test_camera_failure_waits_audio_only() {
        let hub = LocalRelayHub::new();
        let devices = FakeDevices {
            camera_fails: true,
            ..Default::default()
        };
        let peer = test_peer(&hub, "alice", devices, FakeConnector::default());

        let session = peer.coordinator.enter_room("R1").await.unwrap();

        assert_eq!(session.state, CallState::Waiting);
        assert!(session.is_video_off);
        assert!(session.video_unavailable);
        assert_eq!(hub.members("R1"), vec!["alice".to_string()]);
        assert!(peer.coordinator.set_video_off(false).is_err());
    }

    #[tokio::test]
    async fn test_microphone_failure_fails_without_joining() {
        let hub = LocalRelayHub::new();
        let devices = FakeDevices {
            microphone_fails: true,
            ..Default::default()
        };
        let peer = test_peer(&hub, "alice", devices, FakeConnector::default());

        let result = peer.coordinator.enter_room("R1").await;

        assert!(matches!(
            result,
            Err(CallError::Media(MediaError::AudioUnavailable(_)))
        ));
        assert_eq!(
            peer.coordinator.session().unwrap().state,
            CallState::Failed(FailureReason::MediaUnavailable)
        );
        assert!(hub.members("R1").is_empty());
        assert_eq!(peer.devices.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_camera_and_microphone_failure_fails_without_joining() {
        let hub = LocalRelayHub::new();
        let devices = FakeDevices {
            camera_fails: true,
            microphone_fails: true,
            ..Default::default()
        };
        let peer = test_peer(&hub, "alice", devices, FakeConnector::default());

        let result = peer.coordinator.enter_room("R1").await;

        assert!(matches!(
            result,
            Err(CallError::Media(MediaError::AudioUnavailable(_)))
        ));
        assert_eq!(
            peer.coordinator.session().unwrap().state,
            CallState::Failed(FailureReason::MediaUnavailable)
        );
        assert!(hub.members("R1").is_empty());
        assert_eq!(peer.devices.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_audio_only_by_choice_reports_video_off() {
        let hub = LocalRelayHub::new();
        let config = CallConfig {
            local_peer_id: "alice".to_string(),
            prefer_video: false,
            ..Default::default()
        };
        let peer = configured_peer(&hub, config, FakeDevices::default(), FakeConnector::default());

        let session = peer.coordinator.enter_room("R1").await.unwrap();

        assert!(session.is_video_off);
        assert!(!session.video_unavailable);
        assert_eq!(peer.devices.open_count(TrackSource::Camera), 0);
        assert!(peer.coordinator.set_video_off(false).is_err());
    }

    #[tokio::test]
    async fn test_hangup_while_requesting_releases_media() {
        let hub = LocalRelayHub::new();
        let devices = FakeDevices {
            open_delay: Duration::from_millis(100),
            ..Default::default()
        };
        let peer = test_peer(&hub, "alice", devices, FakeConnector::default());

        let (entered, hung_up) = tokio::join!(peer.coordinator.enter_room("R1"), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            peer.coordinator.hangup()
        });

        assert!(matches!(entered, Err(CallError::Aborted)));
        assert_eq!(
            hung_up.unwrap().state,
            CallState::Ended(EndReason::LocalHangup)
        );
        assert_eq!(peer.devices.open_count(TrackSource::Microphone), 1);
        assert_eq!(peer.devices.live_tracks(), 0);
        assert!(hub.members("R1").is_empty());
    }

    #[tokio::test]
    async fn test_hangup_right_after_waiting_leaves_room() {
        let hub = LocalRelayHub::new();
        let TestPeer {
            coordinator,
            devices,
            mut events,
            ..
        } = default_peer(&hub, "alice");

        let (entered, _) = tokio::join!(coordinator.enter_room("R1"), async {
            wait_for_state(&mut events, CallState::Waiting).await;
            coordinator.hangup();
        });
        assert!(matches!(entered, Ok(_) | Err(CallError::Aborted)));

        tokio::time::timeout(Duration::from_secs(2), async {
            while !hub.members("R1").is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("still a member of R1 after hangup");

        assert_eq!(devices.live_tracks(), 0);
        assert_eq!(
            coordinator.session().unwrap().state,
            CallState::Ended(EndReason::LocalHangup)
        );
    }

    #[tokio::test]
    async fn test_second_call_fails_loudly() {
        let hub = LocalRelayHub::new();
        let peer = default_peer(&hub, "alice");
        peer.coordinator.enter_room("R1").await.unwrap();

        let result = peer.coordinator.enter_room("R2").await;

        assert!(matches!(result, Err(CallError::AlreadyInCall { room_id }) if room_id == "R1"));
        assert_eq!(peer.devices.live_tracks(), 2);
        assert_eq!(peer.coordinator.session().unwrap().room_id, "R1");
    }

    #[tokio::test]
    async fn test_new_call_after_hangup() {
        let hub = LocalRelayHub::new();
        let peer = default_peer(&hub, "alice");
        peer.coordinator.enter_room("R1").await.unwrap();
        peer.coordinator.hangup();

        let session = peer.coordinator.enter_room("R2").await.unwrap();
        assert_eq!(session.state, CallState::Waiting);
        assert_eq!(peer.devices.live_tracks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_times_out() {
        let hub = LocalRelayHub::new();
        let relay = hub.connect("alice");
        let (signaling, signaling_rx) = SignalingClient::start(relay);
        let devices = Arc::new(FakeDevices::default());
        let config = CallConfig {
            local_peer_id: "alice".to_string(),
            connect_timeout_secs: 1,
            ..Default::default()
        };
        let coordinator = CallCoordinator::new(
            config,
            devices.clone(),
            signaling,
            signaling_rx,
            Arc::new(FakeConnector::default()),
        );
        let mut events = coordinator.subscribe();

        coordinator.enter_room("R1").await.unwrap();
        wait_for_state(&mut events, CallState::Failed(FailureReason::Timeout)).await;

        assert_eq!(devices.live_tracks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_enter_room_still_times_out() {
        let hub = LocalRelayHub::new();
        let config = CallConfig {
            local_peer_id: "alice".to_string(),
            connect_timeout_secs: 1,
            ..Default::default()
        };
        let devices = FakeDevices {
            open_delay: Duration::from_millis(100),
            ..Default::default()
        };
        let mut peer = configured_peer(&hub, config, devices, FakeConnector::default());

        // Aufrufer gibt während der Media-Beschaffung auf
        let gave_up =
            tokio::time::timeout(Duration::from_millis(10), peer.coordinator.enter_room("R1")).await;
        assert!(gave_up.is_err());

        wait_for_state(&mut peer.events, CallState::Waiting).await;
        wait_for_state(&mut peer.events, CallState::Failed(FailureReason::Timeout)).await;
        assert_eq!(peer.devices.live_tracks(), 0);

        let session = peer.coordinator.enter_room("R2").await.unwrap();
        assert_eq!(session.room_id, "R2");
        assert_eq!(session.state, CallState::Waiting);
    }

    #[tokio::test]
    async fn test_offer_before_media_is_ready_is_queued() {
        let hub = LocalRelayHub::new();
        let devices = FakeDevices {
            open_delay: Duration::from_millis(100),
            ..Default::default()
        };
        let mut bob = test_peer(&hub, "bob", devices, FakeConnector::default());
        let (alice, mut alice_rx) = raw_peer(&hub, "alice");

        let (entered, _) = tokio::join!(bob.coordinator.enter_room("R1"), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(
                bob.coordinator.session().unwrap().state,
                CallState::Requesting
            );
            alice
                .send(RelayMessage::Signal {
                    to: "bob".to_string(),
                    from: "alice".to_string(),
                    signal: SignalPayload::Offer {
                        sdp: "v=0 early".to_string(),
                    },
                })
                .await
                .unwrap();
        });
        entered.unwrap();

        let (from, answer) = next_signal(&mut alice_rx).await;
        assert_eq!(from, "bob");
        assert!(matches!(answer, SignalPayload::Answer { .. }));

        let connected = wait_for_state(&mut bob.events, CallState::Connected).await;
        assert_eq!(connected.role, CallRole::Responder);
    }

    #[tokio::test]
    async fn test_glare_smaller_id_yields() {
        let hub = LocalRelayHub::new();
        let mut alice = silent_peer(&hub, "alice");
        let (bob, mut bob_rx) = raw_peer(&hub, "bob");

        alice.coordinator.enter_room("R1").await.unwrap();
        bob.send(RelayMessage::JoinRoom {
            room: "R1".to_string(),
        })
        .await
        .unwrap();

        let (_, offer) = next_signal(&mut bob_rx).await;
        assert!(matches!(offer, SignalPayload::Offer { .. }));

        // Gleichzeitiges Offer der Gegenstelle
        bob.send(RelayMessage::Signal {
            to: "alice".to_string(),
            from: "bob".to_string(),
            signal: SignalPayload::Offer {
                sdp: "v=0 bob".to_string(),
            },
        })
        .await
        .unwrap();

        let (_, answer) = next_signal(&mut bob_rx).await;
        assert!(matches!(answer, SignalPayload::Answer { .. }));
        let session = wait_for(&mut alice.events, |s| s.role == CallRole::Responder).await;
        assert_eq!(session.state, CallState::Negotiating);
        assert_eq!(alice.connector.connections(), 2);
    }

    #[tokio::test]
    async fn test_glare_larger_id_keeps_offer() {
        let hub = LocalRelayHub::new();
        let mut zoe = silent_peer(&hub, "zoe");
        let (bob, mut bob_rx) = raw_peer(&hub, "bob");

        zoe.coordinator.enter_room("R1").await.unwrap();
        bob.send(RelayMessage::JoinRoom {
            room: "R1".to_string(),
        })
        .await
        .unwrap();
        wait_for_state(&mut zoe.events, CallState::Negotiating).await;
        next_signal(&mut bob_rx).await;

        bob.send(RelayMessage::Signal {
            to: "zoe".to_string(),
            from: "bob".to_string(),
            signal: SignalPayload::Offer {
                sdp: "v=0 bob".to_string(),
            },
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(zoe.coordinator.session().unwrap().role, CallRole::Initiator);
        assert_eq!(zoe.connector.connections(), 1);
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_rejection_ends_call() {
        let hub = LocalRelayHub::new();
        let mut alice = default_peer(&hub, "alice");
        let (bob, _bob_rx) = raw_peer(&hub, "bob");

        alice.coordinator.enter_room("R1").await.unwrap();
        bob.send(RelayMessage::JoinRoom {
            room: "R1".to_string(),
        })
        .await
        .unwrap();
        bob.send(RelayMessage::CallRejected {}).await.unwrap();

        wait_for_state(
            &mut alice.events,
            CallState::Ended(EndReason::RemoteRejected),
        )
        .await;
        assert_eq!(alice.devices.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_connection_failure_fails_call_and_notifies_peer() {
        let hub = LocalRelayHub::new();
        let (mut alice, mut bob) = connected_pair(&hub).await;

        alice
            .connector
            .last()
            .unwrap()
            .emit(PeerEvent::StateChanged(PeerConnectionState::Failed));

        wait_for_state(
            &mut alice.events,
            CallState::Failed(FailureReason::ConnectionLost),
        )
        .await;
        wait_for_state(&mut bob.events, CallState::Ended(EndReason::RemoteEnded)).await;
        assert_eq!(alice.devices.live_tracks(), 0);
        assert_eq!(bob.devices.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_media_and_leaves_room() {
        let hub = LocalRelayHub::new();
        let peer = default_peer(&hub, "alice");
        peer.coordinator.enter_room("R1").await.unwrap();
        let devices = Arc::clone(&peer.devices);

        drop(peer);

        assert_eq!(devices.live_tracks(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(hub.members("R1").is_empty());
    }
}
