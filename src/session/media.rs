//! Lokale und Remote Media-Streams
//!
//! `SystemMediaDevices` belegt das Standard-Mikrofon über cpal, solange
//! der lokale Stream lebt. Samples in die `LocalTrack`s zu schreiben ist
//! Sache eines Encoders außerhalb dieses Crates.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream};
use std::sync::Arc;
use thiserror::Error;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// CONSTANTS
// ============================================================================

/// RTP Clock Rate für Opus
pub const SAMPLE_RATE: u32 = 48000;

const VIDEO_CLOCK_RATE: u32 = 90000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("Permission to access {0:?} capture device denied")]
    PermissionDenied(MediaKind),

    #[error("No {0:?} capture device found")]
    NoDevice(MediaKind),

    #[error("Capture failed: {0}")]
    Capture(String),
}

// ============================================================================
// TRACKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Angeforderte Medien für `get_user_media`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

/// Lokaler Track, der über die Peer Session gesendet wird
#[derive(Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
    pub rtp: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let codec = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
        };

        let rtp = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_string(),
        ));

        Self { id, kind, rtp }
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Vom Peer empfangener Track
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    pub stream_id: String,
    /// RTP-Quelle für die Darstellung, fehlt bei simulierten Tracks
    pub source: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

// ============================================================================
// STREAMS
// ============================================================================

/// Lokaler Stream. Hält das Capture-Gerät offen, bis `stop()` gerufen
/// oder der Stream gedroppt wird.
#[derive(Debug)]
pub struct LocalStream {
    pub id: String,
    tracks: Vec<LocalTrack>,
    capture: Option<AudioCapture>,
}

impl LocalStream {
    pub fn new(id: String, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id,
            tracks,
            capture: None,
        }
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// Gibt die Capture-Geräte frei
    pub fn stop(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
    }
}

/// Sammelt die Remote-Tracks eines Calls
#[derive(Debug, Default)]
pub struct RemoteStream {
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fügt einen Track hinzu, bekannte Track-IDs werden ignoriert
    pub fn add_track(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }
}

// ============================================================================
// MEDIA DEVICES
// ============================================================================

/// Zugriff auf lokale Capture-Geräte
pub trait MediaDevices: Send + Sync {
    fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalStream, MediaAccessError>;
}

/// Capture über das Standard-Eingabegerät des Systems (nur Audio)
#[derive(Debug, Default)]
pub struct SystemMediaDevices;

impl MediaDevices for SystemMediaDevices {
    fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalStream, MediaAccessError> {
        if constraints.video {
            // Kein Kamera-Backend vorhanden
            return Err(MediaAccessError::NoDevice(MediaKind::Video));
        }

        let stream_id = uuid::Uuid::new_v4().to_string();
        let mut stream = LocalStream::new(stream_id, Vec::new());

        if constraints.audio {
            let mut capture = AudioCapture::open_default()?;
            capture.start()?;
            stream.tracks.push(LocalTrack::new(MediaKind::Audio, &stream.id));
            stream.capture = Some(capture);
        }

        tracing::info!(
            "Local media ready: {} track(s) in stream {}",
            stream.tracks.len(),
            stream.id
        );

        Ok(stream)
    }
}

// ============================================================================
// AUDIO CAPTURE
// ============================================================================

/// Offener Eingabestream des Mikrofons. Belegt das Gerät, solange er läuft.
pub struct AudioCapture {
    device: Device,
    stream: Option<Stream>,
}

// cpal-Streams sind nicht Send; angefasst wird der Stream nur hinter dem
// Mutex des Controllers
unsafe impl Send for AudioCapture {}

impl AudioCapture {
    pub fn open_default() -> Result<Self, MediaAccessError> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or(MediaAccessError::NoDevice(MediaKind::Audio))?;

        Ok(Self {
            device,
            stream: None,
        })
    }

    /// Öffnet den Eingabestream mit der Standard-Konfiguration des Geräts
    pub fn start(&mut self) -> Result<(), MediaAccessError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let supported = self
            .device
            .default_input_config()
            .map_err(map_config_error)?;
        let sample_format = supported.sample_format();
        let config = supported.config();

        tracing::info!(
            "Opening microphone: {} Hz, {} channel(s), {:?}",
            config.sample_rate.0,
            config.channels,
            sample_format
        );

        let stream = self
            .device
            .build_input_stream_raw(
                &config,
                sample_format,
                |_data: &cpal::Data, _: &cpal::InputCallbackInfo| {},
                |err| tracing::error!("Microphone stream error: {}", err),
                None,
            )
            .map_err(map_build_error)?;

        stream
            .play()
            .map_err(|e| MediaAccessError::Capture(e.to_string()))?;

        self.stream = Some(stream);
        Ok(())
    }

    /// Schließt den Stream und gibt das Gerät frei
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!("Microphone released");
        }
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for AudioCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCapture")
            .field("running", &self.is_running())
            .finish()
    }
}

fn is_denied(description: &str) -> bool {
    let description = description.to_lowercase();
    description.contains("denied") || description.contains("permission")
}

fn map_config_error(err: cpal::DefaultStreamConfigError) -> MediaAccessError {
    match err {
        cpal::DefaultStreamConfigError::DeviceNotAvailable
        | cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
            MediaAccessError::NoDevice(MediaKind::Audio)
        }
        cpal::DefaultStreamConfigError::BackendSpecific { err } if is_denied(&err.description) => {
            MediaAccessError::PermissionDenied(MediaKind::Audio)
        }
        other => MediaAccessError::Capture(other.to_string()),
    }
}

fn map_build_error(err: cpal::BuildStreamError) -> MediaAccessError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => MediaAccessError::NoDevice(MediaKind::Audio),
        cpal::BuildStreamError::BackendSpecific { err } if is_denied(&err.description) => {
            MediaAccessError::PermissionDenied(MediaKind::Audio)
        }
        other => MediaAccessError::Capture(other.to_string()),
    }
}

// ============================================================================
// TESTS
// ============================================================================
