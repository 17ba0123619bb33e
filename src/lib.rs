//! Duocall - P2P Call Setup über einen geteilten Document Store
//!
//! Zwei Teilnehmer bauen eine direkte Verbindung auf:
//! - Offer/Answer über einen Call-Record im Store
//! - ICE Candidates über zwei Sub-Kanäle pro Call
//! - WebRTC für die eigentliche Medienverbindung

pub mod config;
pub mod session;
pub mod signaling;
pub mod store;

#[cfg(test)]
mod testing;

use config::IceConfig;
use session::{
    MediaConstraints, MediaDevices, PeerSessionFactory, RemoteTrack, SessionController,
    SessionError, SessionEvent, SystemMediaDevices, WebRtcSessionFactory,
};
use signaling::{CallTable, Negotiation, NegotiationState, SignalingError, SignalingMachine};
use std::sync::Arc;
use std::time::Duration;
use store::{CallId, CallStore, CandidateRelay, MemoryStore};
use tokio::sync::broadcast;

/// Installiert den Log-Subscriber. `RUST_LOG` überschreibt die Defaults.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("duocall=debug,webrtc=warn"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// CALL APP
// ============================================================================

/// Bedienoberfläche eines Teilnehmers: Medien starten, Call erstellen,
/// Call beitreten, auflegen
pub struct CallApp {
    controller: SessionController,
    machine: SignalingMachine,
    calls: CallTable,
    config: IceConfig,
}

impl CallApp {
    pub fn new(
        store: Arc<dyn CallStore>,
        relay: Arc<dyn CandidateRelay>,
        factory: Arc<dyn PeerSessionFactory>,
        devices: Arc<dyn MediaDevices>,
        config: IceConfig,
    ) -> Self {
        Self {
            controller: SessionController::new(factory, devices),
            machine: SignalingMachine::new(store, relay),
            calls: CallTable::new(),
            config,
        }
    }

    /// Legt die Peer Session an
    pub async fn mount(&self) -> Result<(), SessionError> {
        self.controller.init_session(&self.config).await?;
        Ok(())
    }

    /// Fordert die lokalen Medien an und hängt sie an die Peer Session.
    /// `SystemMediaDevices` hat kein Kamera-Backend und akzeptiert nur
    /// `MediaConstraints::audio_only()`; mit Video schlägt der Aufruf mit
    /// `MediaAccessError::NoDevice(Video)` fehl.
    pub async fn start_webcam(&self, constraints: MediaConstraints) -> Result<(), SessionError> {
        self.controller.start_local_media(constraints).await
    }

    pub fn is_media_ready(&self) -> bool {
        self.controller.is_media_ready()
    }

    // ========================================================================
    // CALLS
    // ========================================================================

    /// Startet einen ausgehenden Call und gibt die Call-ID zum Teilen zurück
    pub async fn create_call(&self) -> Result<CallId, SignalingError> {
        if !self.controller.is_media_ready() {
            return Err(SignalingError::MediaNotReady);
        }

        let negotiation = self.calls.insert(self.machine.create_call(&self.controller).await?);
        tracing::info!("Share call ID {} with the callee", negotiation.call_id());
        Ok(negotiation.call_id().clone())
    }

    /// Tritt einem bestehenden Call bei
    pub async fn answer_call(&self, call_id: &CallId) -> Result<(), SignalingError> {
        if !self.controller.is_media_ready() {
            return Err(SignalingError::MediaNotReady);
        }

        let negotiation = self
            .calls
            .insert(self.machine.answer_call(&self.controller, call_id).await?);
        tracing::info!("Joined call {}", negotiation.call_id());
        Ok(())
    }

    /// Beendet die Negotiation und schließt die Peer Session. Der
    /// Call-Record bleibt im Store.
    pub async fn hangup(&self, call_id: &CallId) -> Result<(), SessionError> {
        tracing::info!("Hanging up call {}", call_id);

        match self.calls.remove(call_id) {
            Some(negotiation) => negotiation.hangup().await,
            None => tracing::warn!("No active negotiation for call {}", call_id),
        }

        self.controller.teardown().await
    }

    pub fn negotiation(&self, call_id: &CallId) -> Option<Arc<Negotiation>> {
        self.calls.get(call_id)
    }

    /// Aktueller Negotiation-Status eines Calls
    pub fn call_state(&self, call_id: &CallId) -> Option<NegotiationState> {
        self.calls.get(call_id).map(|n| n.state())
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.controller.remote_tracks()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.controller.subscribe()
    }
}

impl std::fmt::Debug for CallApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallApp")
            .field("controller", &self.controller)
            .field("calls", &self.calls.len())
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
// LOOPBACK DEMO
// ============================================================================

/// Wie lange der Demo-Call gehalten wird
const DEMO_CALL_SECS: u64 = 10;

async fn wait_for_connected(events: &mut broadcast::Receiver<SessionEvent>) -> bool {
    loop {
        match events.recv().await {
            Ok(SessionEvent::ConnectionState(session::ConnectionState::Connected)) => return true,
            Ok(SessionEvent::ConnectionState(session::ConnectionState::Failed)) => return false,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return false,
        }
    }
}

/// Caller und Callee in einem Prozess, verbunden über den Memory Store
pub async fn run() -> anyhow::Result<()> {
    init_logging();

    let config = IceConfig::from_env()?;
    tracing::info!("Using ICE servers: {:?}", config.ice_servers);

    let store = Arc::new(MemoryStore::new());
    let app = |config: IceConfig| {
        CallApp::new(
            Arc::clone(&store) as _,
            Arc::clone(&store) as _,
            Arc::new(WebRtcSessionFactory),
            Arc::new(SystemMediaDevices),
            config,
        )
    };
    let caller = app(config.clone());
    let callee = app(config);

    futures::future::try_join(caller.mount(), callee.mount()).await?;
    futures::future::try_join(
        caller.start_webcam(MediaConstraints::audio_only()),
        callee.start_webcam(MediaConstraints::audio_only()),
    )
    .await?;

    let mut caller_events = caller.subscribe();

    let call_id = caller.create_call().await?;
    callee.answer_call(&call_id).await?;

    match tokio::time::timeout(Duration::from_secs(15), wait_for_connected(&mut caller_events))
        .await
    {
        Ok(true) => tracing::info!("Call {} connected", call_id),
        Ok(false) => tracing::warn!("Call {} failed to connect", call_id),
        Err(_) => tracing::warn!("Call {} did not connect in time", call_id),
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(DEMO_CALL_SECS)) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
    }

    let (a, b) = futures::future::join(caller.hangup(&call_id), callee.hangup(&call_id)).await;
    a?;
    b?;

    tracing::info!("Demo finished");
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
