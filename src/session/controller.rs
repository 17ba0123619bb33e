//! Session Controller
//!
//! Besitzt die Peer Session eines Calls und die beiden Media-Streams:
//! - legt die Peer Session an und schließt sie genau einmal
//! - hängt lokale Tracks an die Session
//! - sammelt eingehende Remote-Tracks
//! - leitet lokale Candidates an die laufende Negotiation weiter

use super::media::{
    LocalStream, MediaAccessError, MediaConstraints, MediaDevices, RemoteStream, RemoteTrack,
};
use super::peer::{ConnectionState, PeerEvent, PeerSession, PeerSessionError, PeerSessionFactory};
use crate::config::IceConfig;
use crate::store::IceCandidate;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Media access failed: {0}")]
    Media(#[from] MediaAccessError),

    #[error("Peer session error: {0}")]
    Peer(#[from] PeerSessionError),

    #[error("No peer session")]
    NoSession,

    #[error("Peer session is already negotiating a call")]
    Busy,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events die vom SessionController ausgelöst werden
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Lokale Medien sind bereit, Calls können erstellt werden
    MediaReady,
    RemoteTrack(RemoteTrack),
    ConnectionState(ConnectionState),
    /// Peer Session wurde geschlossen
    Closed,
}

/// Empfänger für lokale Candidates
pub type CandidateSink = Box<dyn Fn(IceCandidate) + Send + Sync>;

// ============================================================================
// CONTROLLER STATE
// ============================================================================

struct ActiveSession {
    peer: Arc<dyn PeerSession>,
    dispatcher: JoinHandle<()>,
}

#[derive(Default)]
struct ControllerState {
    session: Option<ActiveSession>,
    local_stream: Option<LocalStream>,
    remote_stream: Option<RemoteStream>,
    candidate_sink: Option<CandidateSink>,
    /// Candidates, die vor der ersten Negotiation gefunden wurden
    early_candidates: Vec<IceCandidate>,
}

// ============================================================================
// SESSION CONTROLLER
// ============================================================================

pub struct SessionController {
    factory: Arc<dyn PeerSessionFactory>,
    devices: Arc<dyn MediaDevices>,
    state: Arc<Mutex<ControllerState>>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    pub fn new(factory: Arc<dyn PeerSessionFactory>, devices: Arc<dyn MediaDevices>) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            factory,
            devices,
            state: Arc::new(Mutex::new(ControllerState::default())),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Legt die Peer Session an. Existiert bereits eine, wird diese
    /// zurückgegeben.
    pub async fn init_session(
        &self,
        config: &IceConfig,
    ) -> Result<Arc<dyn PeerSession>, SessionError> {
        if let Some(peer) = self.session() {
            return Ok(peer);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = self.factory.create(config, events_tx).await?;

        let dispatcher = tokio::spawn(dispatch_peer_events(
            events_rx,
            Arc::clone(&self.state),
            self.event_tx.clone(),
        ));

        let mut state = self.state.lock();
        if let Some(existing) = state.session.as_ref() {
            // Parallel angelegt, die zweite Session wird verworfen
            dispatcher.abort();
            let duplicate = Arc::clone(&peer);
            tokio::spawn(async move {
                let _ = duplicate.close().await;
            });
            return Ok(Arc::clone(&existing.peer));
        }

        state.session = Some(ActiveSession {
            peer: Arc::clone(&peer),
            dispatcher,
        });

        tracing::info!("Peer session initialized");
        Ok(peer)
    }

    /// Aktuelle Peer Session (falls vorhanden)
    pub fn session(&self) -> Option<Arc<dyn PeerSession>> {
        self.state
            .lock()
            .session
            .as_ref()
            .map(|s| Arc::clone(&s.peer))
    }

    /// Startet die lokale Aufnahme und hängt alle Tracks an die Peer Session
    pub async fn start_local_media(&self, constraints: MediaConstraints) -> Result<(), SessionError> {
        let peer = self.session().ok_or(SessionError::NoSession)?;

        if self.is_media_ready() {
            tracing::debug!("Local media already running");
            return Ok(());
        }

        let mut stream = self.devices.get_user_media(constraints)?;

        let tracks = stream.tracks().to_vec();
        for track in &tracks {
            if let Err(e) = peer.add_track(track).await {
                stream.stop();
                return Err(e.into());
            }
            tracing::debug!("Attached local {:?} track {}", track.kind, track.id);
        }

        {
            let mut state = self.state.lock();
            state.local_stream = Some(stream);
            state.remote_stream = Some(RemoteStream::new());
        }

        let _ = self.event_tx.send(SessionEvent::MediaReady);
        Ok(())
    }

    /// "Webcam ready": lokale Medien laufen
    pub fn is_media_ready(&self) -> bool {
        self.state.lock().local_stream.is_some()
    }

    pub fn local_stream_id(&self) -> Option<String> {
        self.state.lock().local_stream.as_ref().map(|s| s.id.clone())
    }

    /// Bisher empfangene Remote-Tracks
    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.state
            .lock()
            .remote_stream
            .as_ref()
            .map(|s| s.tracks().to_vec())
            .unwrap_or_default()
    }

    /// Registriert den Empfänger für lokale Candidates. Schlägt fehl, wenn
    /// bereits eine Negotiation die Session benutzt.
    pub fn set_candidate_sink(&self, sink: CandidateSink) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if state.session.is_none() {
            return Err(SessionError::NoSession);
        }
        if state.candidate_sink.is_some() {
            return Err(SessionError::Busy);
        }

        for candidate in state.early_candidates.drain(..) {
            sink(candidate);
        }
        state.candidate_sink = Some(sink);
        Ok(())
    }

    pub fn clear_candidate_sink(&self) {
        self.state.lock().candidate_sink = None;
    }

    /// Schließt die Peer Session und gibt die Capture-Geräte frei.
    /// Weitere Aufrufe sind No-Ops.
    pub async fn teardown(&self) -> Result<(), SessionError> {
        let (session, local_stream) = {
            let mut state = self.state.lock();
            state.candidate_sink = None;
            state.early_candidates.clear();
            state.remote_stream = None;
            (state.session.take(), state.local_stream.take())
        };

        if let Some(mut stream) = local_stream {
            stream.stop();
        }

        let Some(session) = session else {
            return Ok(());
        };

        session.dispatcher.abort();
        session.peer.close().await?;

        tracing::info!("Peer session closed");
        let _ = self.event_tx.send(SessionEvent::Closed);
        Ok(())
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let Some(session) = self.state.lock().session.take() else {
            return;
        };

        session.dispatcher.abort();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = session.peer.close().await;
            });
        }
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SessionController")
            .field("has_session", &state.session.is_some())
            .field("media_ready", &state.local_stream.is_some())
            .finish()
    }
}

/// Verteilt die Callbacks der Peer Session
async fn dispatch_peer_events(
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    state: Arc<Mutex<ControllerState>>,
    event_tx: broadcast::Sender<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let mut guard = state.lock();
                let inner = &mut *guard;
                match &inner.candidate_sink {
                    Some(sink) => sink(candidate),
                    None => inner.early_candidates.push(candidate),
                }
            }

            PeerEvent::RemoteTrack(track) => {
                let added = {
                    let mut guard = state.lock();
                    match guard.remote_stream.as_mut() {
                        Some(stream) => stream.add_track(track.clone()),
                        None => {
                            tracing::warn!("Remote track {} before local media, dropped", track.id);
                            false
                        }
                    }
                };

                if added {
                    tracing::info!("Remote {:?} track added: {}", track.kind, track.id);
                    let _ = event_tx.send(SessionEvent::RemoteTrack(track));
                }
            }

            PeerEvent::ConnectionState(s) => {
                tracing::info!("Connection state: {:?}", s);
                let _ = event_tx.send(SessionEvent::ConnectionState(s));
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
