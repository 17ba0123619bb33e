//! Store Module - Signaling über einen geteilten Dokument-Store
//!
//! Dieses Modul beschreibt die beiden Verträge, über die sich Caller und
//! Callee austauschen, bevor eine direkte Verbindung besteht:
//! - Call-Records (Offer/Answer)
//! - Candidate-Kanäle (`offerCandidates` / `answerCandidates`)
//!
//! `MemoryStore` implementiert beide Verträge im Prozess.

mod documents;
mod memory;
mod record;
mod relay;

pub use documents::CallStore;
pub use memory::MemoryStore;
pub use record::*;
pub use relay::{CandidateChange, CandidateRelay, ChangeKind};

use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(CallId),

    #[error("Record already exists: {0}")]
    AlreadyExists(CallId),

    #[error("Field '{field}' already set on {call_id}")]
    Conflict { call_id: CallId, field: &'static str },

    #[error("Write failed: {0}")]
    WriteFailed(String),
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Push-basierter Änderungs-Stream. Drop beendet das Abo.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }

    /// Wartet auf die nächste Änderung, `None` wenn der Store das Abo beendet
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Nicht-blockierende Variante
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}
