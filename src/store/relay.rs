//! Vertrag für die Candidate-Kanäle

use super::{CallId, EntryId, IceCandidate, StoreError, SubChannel, Subscription};
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// Ein Eintrag aus einem Änderungs-Batch
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateChange {
    pub kind: ChangeKind,
    pub entry_id: EntryId,
    pub candidate: IceCandidate,
}

impl CandidateChange {
    pub fn added(entry_id: impl Into<EntryId>, candidate: IceCandidate) -> Self {
        Self {
            kind: ChangeKind::Added,
            entry_id: entry_id.into(),
            candidate,
        }
    }
}

/// Append-only Kanäle pro Call und Richtung
///
/// `subscribe` liefert zuerst den gesamten Backlog als `Added`-Batch und
/// danach jede Änderung, innerhalb eines Kanals in Speicher-Reihenfolge.
#[async_trait]
pub trait CandidateRelay: Send + Sync {
    async fn append(
        &self,
        call_id: &CallId,
        channel: SubChannel,
        candidate: IceCandidate,
    ) -> Result<EntryId, StoreError>;

    async fn subscribe(
        &self,
        call_id: &CallId,
        channel: SubChannel,
    ) -> Result<Subscription<Vec<CandidateChange>>, StoreError>;
}
