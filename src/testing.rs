//! Test-Doubles für Peer Session und Capture-Geräte

use crate::config::IceConfig;
use crate::session::{
    LocalStream, LocalTrack, MediaAccessError, MediaConstraints, MediaDevices, MediaKind,
    PeerEvent, PeerSession, PeerSessionError, PeerSessionFactory,
};
use crate::store::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Wartet bis `condition` erfüllt ist (max. 2 Sekunden)
pub async fn eventually<F>(condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn candidate(name: &str) -> IceCandidate {
    IceCandidate(serde_json::json!({
        "candidate": format!("candidate:{} 1 udp 2122260223 10.0.0.1 5000 typ host", name),
        "sdpMid": "0",
        "sdpMLineIndex": 0
    }))
}

// ============================================================================
// FAKE PEER SESSION
// ============================================================================

#[derive(Default)]
struct FakeState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_sets: usize,
    candidates: Vec<IceCandidate>,
    tracks: Vec<String>,
    closes: usize,
}

/// Peer Session mit festem SDP. Lokale Candidates werden beim Setzen der
/// Local Description gemeldet.
pub struct FakePeerSession {
    sdp: String,
    config: IceConfig,
    local_candidates: Vec<IceCandidate>,
    reject_candidates: bool,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<FakeState>,
}

impl FakePeerSession {
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn config(&self) -> &IceConfig {
        &self.config
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn remote_set_count(&self) -> usize {
        self.state.lock().remote_sets
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn tracks(&self) -> Vec<String> {
        self.state.lock().tracks.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }
}

#[async_trait]
impl PeerSession for FakePeerSession {
    async fn create_offer(&self) -> Result<SessionDescription, PeerSessionError> {
        Ok(SessionDescription::offer(self.sdp.clone()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerSessionError> {
        if self.state.lock().remote.is_none() {
            return Err(PeerSessionError::WebRTC("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer(self.sdp.clone()))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerSessionError> {
        self.state.lock().local = Some(description);
        for candidate in &self.local_candidates {
            self.emit(PeerEvent::LocalCandidate(candidate.clone()));
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerSessionError> {
        if description.sdp.is_empty() {
            return Err(PeerSessionError::InvalidSdp("empty".to_string()));
        }
        let mut state = self.state.lock();
        state.remote = Some(description);
        state.remote_sets += 1;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerSessionError> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(PeerSessionError::WebRTC("remote description not set".to_string()));
        }
        if self.reject_candidates {
            return Err(PeerSessionError::InvalidCandidate("rejected".to_string()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerSessionError> {
        self.state.lock().tracks.push(track.id.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerSessionError> {
        self.state.lock().closes += 1;
        Ok(())
    }
}

// ============================================================================
// FAKE FACTORY
// ============================================================================

pub struct FakeSessionFactory {
    sdp: String,
    local_candidates: Vec<IceCandidate>,
    reject_candidates: bool,
    created: Mutex<Vec<Arc<FakePeerSession>>>,
}

impl FakeSessionFactory {
    pub fn new(sdp: &str) -> Arc<Self> {
        Self::with_candidates(sdp, Vec::new())
    }

    pub fn with_candidates(sdp: &str, local_candidates: Vec<IceCandidate>) -> Arc<Self> {
        Arc::new(Self {
            sdp: sdp.to_string(),
            local_candidates,
            reject_candidates: false,
            created: Mutex::new(Vec::new()),
        })
    }

    /// Sessions dieser Factory lehnen jeden Remote-Candidate ab
    pub fn rejecting(sdp: &str) -> Arc<Self> {
        Arc::new(Self {
            sdp: sdp.to_string(),
            local_candidates: Vec::new(),
            reject_candidates: true,
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn created(&self) -> Vec<Arc<FakePeerSession>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Arc<FakePeerSession> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no session created")
    }
}

#[async_trait]
impl PeerSessionFactory for FakeSessionFactory {
    async fn create(
        &self,
        config: &IceConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerSession>, PeerSessionError> {
        let session = Arc::new(FakePeerSession {
            sdp: self.sdp.clone(),
            config: config.clone(),
            local_candidates: self.local_candidates.clone(),
            reject_candidates: self.reject_candidates,
            events,
            state: Mutex::new(FakeState::default()),
        });
        self.created.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

// ============================================================================
// FAKE MEDIA DEVICES
// ============================================================================

#[derive(Debug, Default)]
pub struct FakeMediaDevices {
    deny: bool,
}

impl FakeMediaDevices {
    pub fn denied() -> Self {
        Self { deny: true }
    }
}

impl MediaDevices for FakeMediaDevices {
    fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalStream, MediaAccessError> {
        if self.deny {
            return Err(MediaAccessError::PermissionDenied(MediaKind::Video));
        }

        let stream_id = "local".to_string();
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(MediaKind::Audio, &stream_id));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(MediaKind::Video, &stream_id));
        }
        Ok(LocalStream::new(stream_id, tracks))
    }
}
