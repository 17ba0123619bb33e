//! In-Process Store
//!
//! Hält Call-Records und Candidate-Kanäle im Speicher und verteilt
//! Änderungen an alle Abonnenten. Beide Peers eines Calls können sich
//! denselben `MemoryStore` teilen (Loopback, Tests).

use super::{
    CallId, CallRecord, CallRecordPatch, CallStore, CandidateChange, CandidateRelay, EntryId,
    IceCandidate, StoreError, SubChannel, Subscription,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Länge der automatisch vergebenen IDs
const AUTO_ID_LEN: usize = 20;

fn auto_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(AUTO_ID_LEN)
        .map(char::from)
        .collect()
}

#[derive(Default)]
struct CandidateChannel {
    entries: Vec<(EntryId, IceCandidate)>,
    watchers: Vec<mpsc::UnboundedSender<Vec<CandidateChange>>>,
}

#[derive(Default)]
struct CallDocument {
    record: Option<CallRecord>,
    watchers: Vec<mpsc::UnboundedSender<Option<CallRecord>>>,
    channels: HashMap<SubChannel, CandidateChannel>,
}

impl CallDocument {
    fn notify(&mut self) {
        let snapshot = self.record.clone();
        self.watchers.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }
}

// ============================================================================
// MEMORY STORE
// ============================================================================

/// Store für Call-Records und Candidate-Kanäle (Thread-safe durch Mutex)
#[derive(Default)]
pub struct MemoryStore {
    calls: Mutex<HashMap<CallId, CallDocument>>,
    #[cfg(test)]
    failing_writes: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anzahl der Calls mit Record
    pub fn record_count(&self) -> usize {
        self.calls
            .lock()
            .values()
            .filter(|doc| doc.record.is_some())
            .count()
    }

    /// Anzahl der Einträge in einem Kanal
    pub fn entry_count(&self, call_id: &CallId, channel: SubChannel) -> usize {
        self.calls
            .lock()
            .get(call_id)
            .and_then(|doc| doc.channels.get(&channel))
            .map(|ch| ch.entries.len())
            .unwrap_or(0)
    }

    /// Anzahl offener Abos auf Record und Kanälen eines Calls
    pub fn subscriber_count(&self, call_id: &CallId) -> usize {
        let calls = self.calls.lock();
        let Some(doc) = calls.get(call_id) else {
            return 0;
        };

        let record_watchers = doc.watchers.iter().filter(|tx| !tx.is_closed()).count();
        let channel_watchers: usize = doc
            .channels
            .values()
            .map(|ch| ch.watchers.iter().filter(|tx| !tx.is_closed()).count())
            .sum();

        record_watchers + channel_watchers
    }

    /// Lässt alle folgenden Schreibzugriffe fehlschlagen
    #[cfg(test)]
    pub fn fail_writes(&self, fail: bool) {
        self.failing_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        #[cfg(test)]
        if self
            .failing_writes
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(StoreError::WriteFailed("writes disabled".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("calls", &self.calls.lock().len())
            .finish()
    }
}

// ============================================================================
// CALL STORE
// ============================================================================

#[async_trait]
impl CallStore for MemoryStore {
    fn new_call_id(&self) -> CallId {
        CallId::new(auto_id())
    }

    async fn create(&self, call_id: &CallId, record: CallRecord) -> Result<(), StoreError> {
        self.check_writable()?;

        let mut calls = self.calls.lock();
        let doc = calls.entry(call_id.clone()).or_default();
        if doc.record.is_some() {
            return Err(StoreError::AlreadyExists(call_id.clone()));
        }

        doc.record = Some(record);
        doc.notify();

        tracing::debug!("Created call record {}", call_id);
        Ok(())
    }

    async fn read(&self, call_id: &CallId) -> Result<Option<CallRecord>, StoreError> {
        Ok(self
            .calls
            .lock()
            .get(call_id)
            .and_then(|doc| doc.record.clone()))
    }

    async fn update(&self, call_id: &CallId, patch: CallRecordPatch) -> Result<(), StoreError> {
        self.check_writable()?;

        let mut calls = self.calls.lock();
        let doc = calls
            .get_mut(call_id)
            .ok_or_else(|| StoreError::NotFound(call_id.clone()))?;
        let record = doc
            .record
            .as_mut()
            .ok_or_else(|| StoreError::NotFound(call_id.clone()))?;

        if let Some(answer) = patch.answer {
            if record.answer.is_some() {
                return Err(StoreError::Conflict {
                    call_id: call_id.clone(),
                    field: "answer",
                });
            }
            record.answer = Some(answer);
        }

        doc.notify();

        tracing::debug!("Updated call record {}", call_id);
        Ok(())
    }

    async fn subscribe(
        &self,
        call_id: &CallId,
    ) -> Result<Subscription<Option<CallRecord>>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut calls = self.calls.lock();
        let doc = calls.entry(call_id.clone()).or_default();

        // Initialer Stand
        let _ = tx.send(doc.record.clone());
        doc.watchers.push(tx);

        Ok(Subscription::new(rx))
    }
}

// ============================================================================
// CANDIDATE RELAY
// ============================================================================

#[async_trait]
impl CandidateRelay for MemoryStore {
    async fn append(
        &self,
        call_id: &CallId,
        channel: SubChannel,
        candidate: IceCandidate,
    ) -> Result<EntryId, StoreError> {
        self.check_writable()?;

        let entry_id = auto_id();

        let mut calls = self.calls.lock();
        let ch = calls
            .entry(call_id.clone())
            .or_default()
            .channels
            .entry(channel)
            .or_default();

        ch.entries.push((entry_id.clone(), candidate.clone()));

        let batch = vec![CandidateChange::added(entry_id.clone(), candidate)];
        ch.watchers.retain(|tx| tx.send(batch.clone()).is_ok());

        tracing::trace!("Appended candidate {} to {}/{}", entry_id, call_id, channel);
        Ok(entry_id)
    }

    async fn subscribe(
        &self,
        call_id: &CallId,
        channel: SubChannel,
    ) -> Result<Subscription<Vec<CandidateChange>>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut calls = self.calls.lock();
        let ch = calls
            .entry(call_id.clone())
            .or_default()
            .channels
            .entry(channel)
            .or_default();

        // Backlog als ein Batch
        let backlog: Vec<CandidateChange> = ch
            .entries
            .iter()
            .map(|(id, c)| CandidateChange::added(id.clone(), c.clone()))
            .collect();
        let _ = tx.send(backlog);
        ch.watchers.push(tx);

        Ok(Subscription::new(rx))
    }
}

// ============================================================================
// TESTS
// ============================================================================
