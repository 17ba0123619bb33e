//! Session Module - Peer Session und Medien
//!
//! Dieses Modul verwaltet:
//! - die Peer Session (WebRTC Peer Connection) eines Calls
//! - lokale Aufnahme und Remote-Tracks
//! - den Lebenszyklus beider über den SessionController

mod controller;
mod media;
mod peer;
mod rtc;

pub use controller::{CandidateSink, SessionController, SessionError, SessionEvent};
pub use media::{
    AudioCapture, LocalStream, LocalTrack, MediaAccessError, MediaConstraints, MediaDevices,
    MediaKind, RemoteStream, RemoteTrack, SystemMediaDevices, SAMPLE_RATE,
};
pub use peer::{ConnectionState, PeerEvent, PeerSession, PeerSessionError, PeerSessionFactory};
pub use rtc::{WebRtcPeerSession, WebRtcSessionFactory};
