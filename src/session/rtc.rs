//! Peer Session auf Basis von webrtc-rs
//!
//! Übersetzt zwischen den Dokument-Typen des Stores und den
//! RTC-Typen und meldet die Callbacks der Peer Connection als `PeerEvent`s.

use super::media::{LocalTrack, MediaKind, RemoteTrack};
use super::peer::{ConnectionState, PeerEvent, PeerSession, PeerSessionError, PeerSessionFactory};
use crate::config::IceConfig;
use crate::store::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn rtc_error(e: webrtc::Error) -> PeerSessionError {
    PeerSessionError::WebRTC(e.to_string())
}

// ============================================================================
// CONVERSIONS
// ============================================================================

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, PeerSessionError> {
    let result = match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(|e| PeerSessionError::InvalidSdp(e.to_string()))
}

fn from_rtc_description(
    description: RTCSessionDescription,
) -> Result<SessionDescription, PeerSessionError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(PeerSessionError::InvalidSdp(format!(
            "unexpected description type {:?}",
            other
        ))),
    }
}

fn to_rtc_candidate(candidate: IceCandidate) -> Result<RTCIceCandidateInit, PeerSessionError> {
    serde_json::from_value(candidate.into_inner())
        .map_err(|e| PeerSessionError::InvalidCandidate(e.to_string()))
}

fn from_rtc_candidate(candidate: &RTCIceCandidate) -> Option<IceCandidate> {
    let init = candidate.to_json().ok()?;
    serde_json::to_value(init).ok().map(IceCandidate)
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn remote_track(track: Arc<TrackRemote>) -> RemoteTrack {
    let kind = match track.kind() {
        RTPCodecType::Video => MediaKind::Video,
        _ => MediaKind::Audio,
    };

    RemoteTrack {
        id: track.id(),
        kind,
        stream_id: track.stream_id(),
        source: Some(track),
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt Peer Connections mit Default-Codecs und -Interceptors
#[derive(Debug, Default)]
pub struct WebRtcSessionFactory;

#[async_trait]
impl PeerSessionFactory for WebRtcSessionFactory {
    async fn create(
        &self,
        config: &IceConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerSession>, PeerSessionError> {
        // Media Engine mit Default-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }],
            ice_candidate_pool_size: config.candidate_pool_size,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(rtc_error)?,
        );

        register_handlers(&pc, events);

        tracing::info!(
            "Peer connection created ({} ICE server(s), pool size {})",
            config.ice_servers.len(),
            config.candidate_pool_size
        );

        Ok(Arc::new(WebRtcPeerSession { pc }))
    }
}

/// Registriert die Callbacks der Peer Connection
fn register_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<PeerEvent>) {
    let state_tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);
        let _ = state_tx.send(PeerEvent::ConnectionState(connection_state(s)));
        Box::pin(async {})
    }));

    let candidate_tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        // `None` markiert das Ende der Suche
        if let Some(candidate) = candidate.as_ref().and_then(from_rtc_candidate) {
            let _ = candidate_tx.send(PeerEvent::LocalCandidate(candidate));
        }
        Box::pin(async {})
    }));

    let track_tx = events;
    pc.on_track(Box::new(move |track, _, _| {
        tracing::info!("Received track: {:?}", track.codec());
        let _ = track_tx.send(PeerEvent::RemoteTrack(remote_track(track)));
        Box::pin(async {})
    }));
}

// ============================================================================
// PEER SESSION
// ============================================================================

pub struct WebRtcPeerSession {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerSession for WebRtcPeerSession {
    async fn create_offer(&self) -> Result<SessionDescription, PeerSessionError> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_error)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerSessionError> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_error)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerSessionError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(rtc_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerSessionError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(rtc_error)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerSessionError> {
        let candidate = to_rtc_candidate(candidate)?;
        self.pc.add_ice_candidate(candidate).await.map_err(rtc_error)
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerSessionError> {
        self.pc
            .add_track(Arc::clone(&track.rtp) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_error)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerSessionError> {
        self.pc.close().await.map_err(rtc_error)
    }
}

impl std::fmt::Debug for WebRtcPeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcPeerSession")
            .field("state", &self.pc.connection_state())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
