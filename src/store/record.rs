//! Dokument-Typen für den Call-Record und die Candidate-Kanäle
//!
//! Das Wire-Format entspricht den Dokumenten im Store:
//! `{ offer: { type: "offer", sdp }, answer?: { type: "answer", sdp } }`

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// CALL ID
// ============================================================================

/// Vom Store vergebene ID eines Call-Records
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for CallId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ============================================================================
// SESSION DESCRIPTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Offer oder Answer, wie sie im Call-Record abgelegt werden
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

// ============================================================================
// CALL RECORD
// ============================================================================

/// Ein Dokument pro Anruf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub offer: SessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

impl CallRecord {
    pub fn with_offer(offer: SessionDescription) -> Self {
        Self {
            offer,
            answer: None,
        }
    }
}

/// Teil-Update für `update()`. Gesetzte Felder werden nur geschrieben,
/// wenn sie im Record noch fehlen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

impl CallRecordPatch {
    pub fn answer(answer: SessionDescription) -> Self {
        Self {
            answer: Some(answer),
        }
    }
}

// ============================================================================
// CANDIDATES
// ============================================================================

/// Richtungsgebundener Unterkanal eines Calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubChannel {
    OfferCandidates,
    AnswerCandidates,
}

impl SubChannel {
    /// Name der Sub-Collection im Store
    pub fn name(&self) -> &'static str {
        match self {
            SubChannel::OfferCandidates => "offerCandidates",
            SubChannel::AnswerCandidates => "answerCandidates",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            SubChannel::OfferCandidates => SubChannel::AnswerCandidates,
            SubChannel::AnswerCandidates => SubChannel::OfferCandidates,
        }
    }
}

impl fmt::Display for SubChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Serialisierter Connectivity-Candidate. Der Inhalt (Adresse, Protokoll,
/// Priorität) wird nur durchgereicht.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(pub serde_json::Value);

impl IceCandidate {
    pub fn into_inner(self) -> serde_json::Value {
        self.0
    }
}

/// Vom Relay vergebene ID eines Kanal-Eintrags
pub type EntryId = String;
