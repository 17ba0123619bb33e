//! Vertrag für die Peer Session (Transport-Schicht)
//!
//! Die Peer Session kapselt eine P2P-Medienverbindung. Ihre Callbacks
//! (neue lokale Candidates, neue Remote-Tracks, Verbindungsstatus) werden
//! als `PeerEvent`s über einen Channel gemeldet.

use super::media::{LocalTrack, RemoteTrack};
use crate::config::IceConfig;
use crate::store::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerSessionError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Peer session closed")]
    Closed,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Verbindungsstatus der Peer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks der Peer Session
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Neuer lokaler Candidate gefunden
    LocalCandidate(IceCandidate),
    /// Remote-Track empfangen
    RemoteTrack(RemoteTrack),
    /// Verbindungsstatus geändert
    ConnectionState(ConnectionState),
}

// ============================================================================
// TRAITS
// ============================================================================

#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerSessionError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerSessionError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerSessionError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerSessionError>;

    /// Ob bereits eine Remote Description gesetzt ist
    async fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerSessionError>;

    /// Hängt einen lokalen Track zum Senden an
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerSessionError>;

    async fn close(&self) -> Result<(), PeerSessionError>;
}

/// Erzeugt Peer Sessions. Events der Session gehen an `events`.
#[async_trait]
pub trait PeerSessionFactory: Send + Sync {
    async fn create(
        &self,
        config: &IceConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerSession>, PeerSessionError>;
}
