//! Vertrag für den Call-Record-Store

use super::{CallId, CallRecord, CallRecordPatch, StoreError, Subscription};
use async_trait::async_trait;

/// Dokument-Store für Call-Records
///
/// Erwartete Semantik:
/// - `create` schreibt den Record in einem Schritt, inklusive Offer
/// - `update` setzt nur Felder, die im Record noch fehlen
/// - `subscribe` liefert sofort den aktuellen Stand (`None` solange der
///   Record fehlt) und danach jeden neuen Stand, bis das Abo gedroppt wird
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Vergibt eine neue, eindeutige Record-ID
    fn new_call_id(&self) -> CallId;

    async fn create(&self, call_id: &CallId, record: CallRecord) -> Result<(), StoreError>;

    async fn read(&self, call_id: &CallId) -> Result<Option<CallRecord>, StoreError>;

    async fn update(&self, call_id: &CallId, patch: CallRecordPatch) -> Result<(), StoreError>;

    async fn subscribe(
        &self,
        call_id: &CallId,
    ) -> Result<Subscription<Option<CallRecord>>, StoreError>;
}
