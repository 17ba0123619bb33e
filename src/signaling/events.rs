//! Events der Negotiation
//!
//! Store-Abos, Relay-Abos und die Peer Session schreiben in eine
//! Queue pro Call, die von der Negotiation abgearbeitet wird.

use crate::store::{
    CallRecord, CandidateChange, ChangeKind, EntryId, IceCandidate, StoreError, SubChannel,
};

// ============================================================================
// QUEUE EVENTS
// ============================================================================

#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Neuer Stand des Call-Records
    RecordChanged(Option<CallRecord>),
    /// Neuer Eintrag im Candidate-Kanal der Gegenseite
    CandidateAdded {
        entry_id: EntryId,
        candidate: IceCandidate,
    },
    /// Die eigene Peer Session hat einen Candidate gefunden
    LocalCandidate(IceCandidate),
}

/// Übersetzt einen Änderungs-Batch in Queue-Events. Nur neue Einträge
/// zählen, Änderungen und Löschungen werden ignoriert.
pub fn candidate_events(batch: Vec<CandidateChange>) -> impl Iterator<Item = SignalingEvent> {
    batch.into_iter().filter_map(|change| match change.kind {
        ChangeKind::Added => Some(SignalingEvent::CandidateAdded {
            entry_id: change.entry_id,
            candidate: change.candidate,
        }),
        kind => {
            tracing::trace!("Ignoring {:?} change for entry {}", kind, change.entry_id);
            None
        }
    })
}

// ============================================================================
// ROLE & STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

impl Role {
    /// Kanal, in den die eigenen Candidates geschrieben werden
    pub fn local_channel(&self) -> SubChannel {
        match self {
            Role::Caller => SubChannel::OfferCandidates,
            Role::Callee => SubChannel::AnswerCandidates,
        }
    }

    /// Kanal der Gegenseite
    pub fn remote_channel(&self) -> SubChannel {
        self.local_channel().opposite()
    }
}

/// Fortschritt einer Negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    /// Caller: ID vergeben; Callee: Record gelesen
    RecordCreated,
    LocalDescriptionSet,
    /// Offer liegt im Store, Answer steht aus
    RemoteDescriptionPending,
    RemoteDescriptionSet,
    CandidateExchangeActive,
    Failed(String),
    HungUp,
}

/// Beobachtbare Events einer Negotiation
#[derive(Debug, Clone)]
pub enum NegotiationEvent {
    StateChanged(NegotiationState),
    /// Ein lokaler Candidate konnte nicht geschrieben werden und ist verloren
    CandidateWriteFailed {
        channel: SubChannel,
        error: StoreError,
    },
}
