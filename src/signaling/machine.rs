//! Signaling State Machine
//!
//! Führt Caller und Callee durch Offer/Answer und den Candidate-Austausch.
//! Jeder Call bekommt eine eigene Queue; Store-Abos, Relay-Abos und die
//! Peer Session schreiben hinein, ein Task pro Call arbeitet sie ab.
//!
//! Caller:
//! ```text
//! Idle → RecordCreated → LocalDescriptionSet → RemoteDescriptionPending
//!      → RemoteDescriptionSet → CandidateExchangeActive
//! ```
//! Callee:
//! ```text
//! Idle → RecordCreated → RemoteDescriptionSet → LocalDescriptionSet
//!      → CandidateExchangeActive
//! ```

use super::events::{candidate_events, NegotiationEvent, NegotiationState, Role, SignalingEvent};
use super::SignalingError;
use crate::session::{CandidateSink, PeerSession, PeerSessionError, SessionController};
use crate::store::{
    CallId, CallRecord, CallRecordPatch, CallStore, CandidateChange, CandidateRelay, EntryId,
    IceCandidate, StoreError, Subscription,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

// ============================================================================
// PROGRESS
// ============================================================================

/// Status und Events einer Negotiation, geteilt zwischen Handle und Task
#[derive(Clone)]
struct Progress {
    call_id: CallId,
    state_tx: Arc<watch::Sender<NegotiationState>>,
    event_tx: broadcast::Sender<NegotiationEvent>,
    /// Events aller Calls der Machine, auch von Calls ohne Handle
    machine_tx: broadcast::Sender<(CallId, NegotiationEvent)>,
}

impl Progress {
    fn new(call_id: CallId, machine_tx: broadcast::Sender<(CallId, NegotiationEvent)>) -> Self {
        let (state_tx, _) = watch::channel(NegotiationState::Idle);
        let (event_tx, _) = broadcast::channel(100);

        Self {
            call_id,
            state_tx: Arc::new(state_tx),
            event_tx,
            machine_tx,
        }
    }

    fn set(&self, state: NegotiationState) {
        tracing::info!("Call {}: {:?}", self.call_id, state);
        self.state_tx.send_replace(state.clone());
        self.emit(NegotiationEvent::StateChanged(state));
    }

    fn fail(&self, reason: String) {
        self.set(NegotiationState::Failed(reason));
    }

    fn emit(&self, event: NegotiationEvent) {
        let _ = self.machine_tx.send((self.call_id.clone(), event.clone()));
        let _ = self.event_tx.send(event);
    }

    fn current(&self) -> NegotiationState {
        self.state_tx.borrow().clone()
    }
}

// ============================================================================
// NEGOTIATION HANDLE
// ============================================================================

/// Laufende Negotiation eines Calls
pub struct Negotiation {
    role: Role,
    progress: Progress,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Negotiation {
    fn new(role: Role, progress: Progress, tasks: Vec<JoinHandle<()>>) -> Self {
        Self {
            role,
            progress,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.progress.call_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.progress.current()
    }

    /// Receiver für Statusänderungen
    pub fn watch_state(&self) -> watch::Receiver<NegotiationState> {
        self.progress.state_tx.subscribe()
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<NegotiationEvent> {
        self.progress.event_tx.subscribe()
    }

    /// Beendet Queue-Task und alle Abos. Weitere Aufrufe sind No-Ops.
    pub async fn hangup(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() && self.state() == NegotiationState::HungUp {
            return;
        }

        for task in &tasks {
            task.abort();
        }
        // Erst nach dem Join sind die Abos wirklich gedroppt
        for task in tasks {
            let _ = task.await;
        }

        self.progress.set(NegotiationState::HungUp);
    }
}

impl Drop for Negotiation {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Negotiation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiation")
            .field("call_id", self.call_id())
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// SIGNALING MACHINE
// ============================================================================

pub struct SignalingMachine {
    store: Arc<dyn CallStore>,
    relay: Arc<dyn CandidateRelay>,
    event_tx: broadcast::Sender<(CallId, NegotiationEvent)>,
}

impl SignalingMachine {
    pub fn new(store: Arc<dyn CallStore>, relay: Arc<dyn CandidateRelay>) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            store,
            relay,
            event_tx,
        }
    }

    /// Events aller Negotiations dieser Machine, inklusive fehlgeschlagener
    /// Setups, für die kein `Negotiation`-Handle existiert
    pub fn subscribe(&self) -> broadcast::Receiver<(CallId, NegotiationEvent)> {
        self.event_tx.subscribe()
    }

    /// Caller: legt den Call-Record mit Offer an und wartet auf die Answer
    pub async fn create_call(
        &self,
        controller: &SessionController,
    ) -> Result<Negotiation, SignalingError> {
        let session = controller.session().ok_or(SignalingError::NoSession)?;

        let role = Role::Caller;
        let call_id = self.store.new_call_id();
        let progress = Progress::new(call_id.clone(), self.event_tx.clone());

        tracing::info!("Creating call {}", call_id);

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        controller.set_candidate_sink(local_candidate_sink(queue_tx.clone()))?;
        progress.set(NegotiationState::RecordCreated);

        let setup = async {
            let offer = session.create_offer().await?;
            session.set_local_description(offer.clone()).await?;
            progress.set(NegotiationState::LocalDescriptionSet);

            self.store
                .create(&call_id, CallRecord::with_offer(offer))
                .await?;
            progress.set(NegotiationState::RemoteDescriptionPending);

            let records = self.store.subscribe(&call_id).await?;
            let candidates = self.relay.subscribe(&call_id, role.remote_channel()).await?;
            Ok::<_, SignalingError>((records, candidates))
        };

        let (records, candidates) = match setup.await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                controller.clear_candidate_sink();
                progress.fail(e.to_string());
                return Err(e);
            }
        };

        let negotiator = Negotiator::new(
            role,
            Arc::clone(&session),
            Arc::clone(&self.relay),
            progress.clone(),
            false,
        );

        let tasks = vec![
            tokio::spawn(forward_records(records, queue_tx.clone())),
            tokio::spawn(forward_candidates(candidates, queue_tx)),
            tokio::spawn(negotiator.run(queue_rx)),
        ];

        Ok(Negotiation::new(role, progress, tasks))
    }

    /// Callee: liest das Offer, schreibt die Answer in denselben Record
    pub async fn answer_call(
        &self,
        controller: &SessionController,
        call_id: &CallId,
    ) -> Result<Negotiation, SignalingError> {
        if call_id.is_empty() {
            return Err(SignalingError::MissingCallId);
        }
        let session = controller.session().ok_or(SignalingError::NoSession)?;

        let role = Role::Callee;
        let progress = Progress::new(call_id.clone(), self.event_tx.clone());

        tracing::info!("Answering call {}", call_id);

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        controller.set_candidate_sink(local_candidate_sink(queue_tx.clone()))?;

        let setup = async {
            let record = self
                .store
                .read(call_id)
                .await?
                .ok_or_else(|| SignalingError::CallNotFound(call_id.clone()))?;
            if record.answer.is_some() {
                return Err(SignalingError::AlreadyAnswered(call_id.clone()));
            }
            progress.set(NegotiationState::RecordCreated);

            session.set_remote_description(record.offer).await?;
            progress.set(NegotiationState::RemoteDescriptionSet);

            let answer = session.create_answer().await?;
            session.set_local_description(answer.clone()).await?;
            progress.set(NegotiationState::LocalDescriptionSet);

            self.store
                .update(call_id, CallRecordPatch::answer(answer))
                .await
                .map_err(|e| match e {
                    StoreError::Conflict { .. } => SignalingError::AlreadyAnswered(call_id.clone()),
                    other => other.into(),
                })?;

            let candidates = self.relay.subscribe(call_id, role.remote_channel()).await?;
            Ok::<_, SignalingError>(candidates)
        };

        let candidates = match setup.await {
            Ok(subscription) => subscription,
            Err(e) => {
                controller.clear_candidate_sink();
                progress.fail(e.to_string());
                return Err(e);
            }
        };

        let negotiator = Negotiator::new(
            role,
            Arc::clone(&session),
            Arc::clone(&self.relay),
            progress.clone(),
            true,
        );
        progress.set(NegotiationState::CandidateExchangeActive);

        let tasks = vec![
            tokio::spawn(forward_candidates(candidates, queue_tx)),
            tokio::spawn(negotiator.run(queue_rx)),
        ];

        Ok(Negotiation::new(role, progress, tasks))
    }
}

impl std::fmt::Debug for SignalingMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingMachine").finish_non_exhaustive()
    }
}

fn local_candidate_sink(queue: mpsc::UnboundedSender<SignalingEvent>) -> CandidateSink {
    Box::new(move |candidate| {
        let _ = queue.send(SignalingEvent::LocalCandidate(candidate));
    })
}

async fn forward_records(
    mut records: Subscription<Option<CallRecord>>,
    queue: mpsc::UnboundedSender<SignalingEvent>,
) {
    while let Some(record) = records.recv().await {
        if queue.send(SignalingEvent::RecordChanged(record)).is_err() {
            break;
        }
    }
}

async fn forward_candidates(
    mut candidates: Subscription<Vec<CandidateChange>>,
    queue: mpsc::UnboundedSender<SignalingEvent>,
) {
    while let Some(batch) = candidates.recv().await {
        for event in candidate_events(batch) {
            if queue.send(event).is_err() {
                return;
            }
        }
    }
}

// ============================================================================
// NEGOTIATOR
// ============================================================================

/// Arbeitet die Queue eines Calls ab
struct Negotiator {
    role: Role,
    session: Arc<dyn PeerSession>,
    relay: Arc<dyn CandidateRelay>,
    progress: Progress,
    /// Bereits verarbeitete Einträge der Gegenseite
    seen: HashSet<EntryId>,
    /// Candidates, die vor der Remote Description ankamen
    pending: Vec<IceCandidate>,
    remote_ready: bool,
}

impl Negotiator {
    fn new(
        role: Role,
        session: Arc<dyn PeerSession>,
        relay: Arc<dyn CandidateRelay>,
        progress: Progress,
        remote_ready: bool,
    ) -> Self {
        Self {
            role,
            session,
            relay,
            progress,
            seen: HashSet::new(),
            pending: Vec::new(),
            remote_ready,
        }
    }

    fn call_id(&self) -> &CallId {
        &self.progress.call_id
    }

    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<SignalingEvent>) {
        while let Some(event) = queue.recv().await {
            if let Err(e) = self.handle(event).await {
                tracing::error!("Negotiation for call {} failed: {}", self.call_id(), e);
                self.progress.fail(e.to_string());
                break;
            }
        }
    }

    async fn handle(&mut self, event: SignalingEvent) -> Result<(), PeerSessionError> {
        match event {
            SignalingEvent::LocalCandidate(candidate) => {
                self.publish_local_candidate(candidate).await;
                Ok(())
            }
            SignalingEvent::RecordChanged(record) => self.on_record_changed(record).await,
            SignalingEvent::CandidateAdded {
                entry_id,
                candidate,
            } => self.on_candidate_added(entry_id, candidate).await,
        }
    }

    /// Schreibt einen eigenen Candidate in den Kanal der eigenen Rolle.
    /// Läuft im Queue-Task, ein Hangup bricht also auch offene Writes ab.
    /// Fehlgeschlagene Writes werden gemeldet, aber nicht wiederholt.
    async fn publish_local_candidate(&self, candidate: IceCandidate) {
        let channel = self.role.local_channel();

        if let Err(error) = self.relay.append(self.call_id(), channel, candidate).await {
            tracing::warn!(
                "Failed to publish candidate to {}/{}: {}",
                self.call_id(),
                channel,
                error
            );
            self.progress
                .emit(NegotiationEvent::CandidateWriteFailed { channel, error });
        }
    }

    async fn on_record_changed(
        &mut self,
        record: Option<CallRecord>,
    ) -> Result<(), PeerSessionError> {
        if self.role != Role::Caller {
            return Ok(());
        }

        let Some(answer) = record.and_then(|r| r.answer) else {
            return Ok(());
        };

        if self.session.has_remote_description().await {
            tracing::debug!("Answer for call {} already applied", self.call_id());
            return Ok(());
        }

        self.session.set_remote_description(answer).await?;
        self.remote_ready = true;
        self.progress.set(NegotiationState::RemoteDescriptionSet);

        for candidate in std::mem::take(&mut self.pending) {
            self.session.add_ice_candidate(candidate).await?;
        }
        self.progress.set(NegotiationState::CandidateExchangeActive);
        Ok(())
    }

    async fn on_candidate_added(
        &mut self,
        entry_id: EntryId,
        candidate: IceCandidate,
    ) -> Result<(), PeerSessionError> {
        if !self.seen.insert(entry_id.clone()) {
            tracing::trace!("Candidate {} already handled", entry_id);
            return Ok(());
        }

        if !self.remote_ready {
            tracing::debug!("Remote description not set yet, queuing candidate {}", entry_id);
            self.pending.push(candidate);
            return Ok(());
        }

        self.session.add_ice_candidate(candidate).await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IceConfig;
    use crate::session::{PeerEvent, PeerSessionFactory};
    use crate::store::{MemoryStore, SessionDescription, SubChannel};
    use crate::testing::{candidate, eventually, FakeMediaDevices, FakeSessionFactory};

    struct Peer {
        factory: Arc<FakeSessionFactory>,
        controller: SessionController,
    }

    async fn peer(factory: Arc<FakeSessionFactory>) -> Peer {
        let controller = SessionController::new(
            Arc::clone(&factory) as _,
            Arc::new(FakeMediaDevices::default()),
        );
        controller.init_session(&IceConfig::default()).await.unwrap();
        Peer {
            factory,
            controller,
        }
    }

    fn machine(store: &Arc<MemoryStore>) -> SignalingMachine {
        SignalingMachine::new(Arc::clone(store) as _, Arc::clone(store) as _)
    }

    async fn wait_for_state(negotiation: &Negotiation, target: NegotiationState) {
        let mut rx = negotiation.watch_state();
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            rx.wait_for(|s| *s == target),
        )
        .await
        .expect("state not reached")
        .unwrap();
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let store = Arc::new(MemoryStore::new());
        let machine = machine(&store);
        let caller = peer(FakeSessionFactory::new("O1")).await;
        let callee = peer(FakeSessionFactory::new("A1")).await;

        let outgoing = machine.create_call(&caller.controller).await.unwrap();
        assert_eq!(outgoing.state(), NegotiationState::RemoteDescriptionPending);

        let id = outgoing.call_id().clone();
        let record = store.read(&id).await.unwrap().unwrap();
        assert_eq!(record, CallRecord::with_offer(SessionDescription::offer("O1")));

        let incoming = machine.answer_call(&callee.controller, &id).await.unwrap();
        assert_eq!(incoming.state(), NegotiationState::CandidateExchangeActive);

        let record = store.read(&id).await.unwrap().unwrap();
        assert_eq!(record.answer, Some(SessionDescription::answer("A1")));

        wait_for_state(&outgoing, NegotiationState::CandidateExchangeActive).await;

        let caller_peer = caller.factory.last();
        let callee_peer = callee.factory.last();
        assert_eq!(caller_peer.local_description(), Some(SessionDescription::offer("O1")));
        assert_eq!(caller_peer.remote_description(), Some(SessionDescription::answer("A1")));
        assert_eq!(callee_peer.local_description(), Some(SessionDescription::answer("A1")));
        assert_eq!(callee_peer.remote_description(), Some(SessionDescription::offer("O1")));
    }

    #[tokio::test]
    async fn test_candidates_cross_over() {
        let store = Arc::new(MemoryStore::new());
        let machine = machine(&store);
        let caller = peer(FakeSessionFactory::with_candidates("O1", vec![candidate("C1")])).await;
        let callee = peer(FakeSessionFactory::with_candidates("A1", vec![candidate("C2")])).await;

        let outgoing = machine.create_call(&caller.controller).await.unwrap();
        let id = outgoing.call_id().clone();

        // C1 liegt im Kanal, bevor der Callee abonniert
        eventually(|| store.entry_count(&id, SubChannel::OfferCandidates) == 1).await;

        let _incoming = machine.answer_call(&callee.controller, &id).await.unwrap();

        let callee_peer = callee.factory.last();
        let caller_peer = caller.factory.last();
        eventually(|| callee_peer.added_candidates() == vec![candidate("C1")]).await;
        eventually(|| caller_peer.added_candidates() == vec![candidate("C2")]).await;
        assert_eq!(store.entry_count(&id, SubChannel::AnswerCandidates), 1);
    }

    #[tokio::test]
    async fn test_unknown_call_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let machine = machine(&store);
        let callee = peer(FakeSessionFactory::new("A1")).await;
        let id = CallId::new("missing");

        let result = machine.answer_call(&callee.controller, &id).await;
        assert!(matches!(result, Err(SignalingError::CallNotFound(ref missing)) if *missing == id));
        assert_eq!(store.record_count(), 0);
        assert_eq!(store.entry_count(&id, SubChannel::AnswerCandidates), 0);
        assert_eq!(callee.factory.last().remote_set_count(), 0);

        // Die Session ist wieder frei
        assert!(callee
            .controller
            .set_candidate_sink(Box::new(|_| {}))
            .is_ok());
    }

    #[tokio::test]
    async fn test_preconditions() {
        let store = Arc::new(MemoryStore::new());
        let machine = machine(&store);
        let factory = FakeSessionFactory::new("O1");
        let controller =
            SessionController::new(factory as _, Arc::new(FakeMediaDevices::default()));

        assert!(matches!(
            machine.create_call(&controller).await,
            Err(SignalingError::NoSession)
        ));
        assert!(matches!(
            machine.answer_call(&controller, &CallId::new("")).await,
            Err(SignalingError::MissingCallId)
        ));
        assert_eq!(store.record_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_answers_write_once() {
        let store = Arc::new(MemoryStore::new());
        let machine = machine(&store);
        let caller = peer(FakeSessionFactory::new("O1")).await;
        let first = peer(FakeSessionFactory::new("A1")).await;
        let second = peer(FakeSessionFactory::new("A2")).await;

        let outgoing = machine.create_call(&caller.controller).await.unwrap();
        let id = outgoing.call_id().clone();

        let (a, b) = tokio::join!(
            machine.answer_call(&first.controller, &id),
            machine.answer_call(&second.controller, &id),
        );

        let answered: Vec<_> = [&a, &b].into_iter().filter(|r| r.is_ok()).collect();
        assert_eq!(answered.len(), 1);
        let rejected = if a.is_ok() { &b } else { &a };
        assert!(matches!(rejected, Err(SignalingError::AlreadyAnswered(_))));

        let record = store.read(&id).await.unwrap().unwrap();
        let expected = if a.is_ok() { "A1" } else { "A2" };
        assert_eq!(record.answer.unwrap().sdp, expected);
    }

    #[tokio::test]
    async fn test_second_answer_on_same_session_is_busy() {
        let store = Arc::new(MemoryStore::new());
        let machine = machine(&store);
        let caller = peer(FakeSessionFactory::new("O1")).await;
        let callee = peer(FakeSessionFactory::new("A1")).await;

        let outgoing = machine.create_call(&caller.controller).await.unwrap();
        let id = outgoing.call_id().clone();

        let _incoming = machine.answer_call(&callee.controller, &id).await.unwrap();
        let again = machine.answer_call(&callee.controller, &id).await;
        assert!(matches!(again, Err(SignalingError::Session(_))));
    }

    #[tokio::test]
    async fn test_answer_applied_once() {
        let store = Arc::new(MemoryStore::new());
        let machine = machine(&store);
        let caller = peer(FakeSessionFactory::new("O1")).await;
        let callee = peer(FakeSessionFactory::new("A1")).await;

        let outgoing = machine.create_call(&caller.controller).await.unwrap();
        let id = outgoing.call_id().clone();
        let _incoming = machine.answer_call(&callee.controller, &id).await.unwrap();
        wait_for_state(&outgoing, NegotiationState::CandidateExchangeActive).await;

        // Weitere Snapshots mit Answer
        store.update(&id, CallRecordPatch::default()).await.unwrap();
        store.update(&id, CallRecordPatch::default()).await.unwrap();

        let caller_peer = caller.factory.last();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(caller_peer.remote_set_count(), 1);
        assert_eq!(outgoing.state(), NegotiationState::CandidateExchangeActive);
    }

    #[tokio::test]
    async fn test_candidate_write_failure_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let machine = machine(&store);
        let caller = peer(FakeSessionFactory::new("O1")).await;

        let outgoing = machine.create_call(&caller.controller).await.unwrap();
        let mut events = outgoing.subscribe();
        store.fail_writes(true);

        caller
            .factory
            .last()
            .emit(PeerEvent::LocalCandidate(candidate("lost")));

        let failure = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                if let Ok(NegotiationEvent::CandidateWriteFailed { channel, error }) =
                    events.recv().await
                {
                    return (channel, error);
                }
            }
        })
        .await
        .expect("no failure reported");

        assert_eq!(failure.0, SubChannel::OfferCandidates);
        assert!(matches!(failure.1, StoreError::WriteFailed(_)));
        // Nicht terminal
        assert_eq!(outgoing.state(), NegotiationState::RemoteDescriptionPending);
    }

    #[tokio::test]
    async fn test_rejected_candidate_fails_negotiation() {
        let store = Arc::new(MemoryStore::new());
        let machine = machine(&store);
        let caller = peer(FakeSessionFactory::new("O1")).await;
        let callee = peer(FakeSessionFactory::rejecting("A1")).await;

        let outgoing = machine.create_call(&caller.controller).await.unwrap();
        let id = outgoing.call_id().clone();
        let incoming = machine.answer_call(&callee.controller, &id).await.unwrap();

        store
            .append(&id, SubChannel::OfferCandidates, candidate("bad"))
            .await
            .unwrap();

        let mut rx = incoming.watch_state();
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            rx.wait_for(|s| matches!(s, NegotiationState::Failed(_))),
        )
        .await
        .expect("negotiation did not fail")
        .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_entries_applied_once() {
        let store = Arc::new(MemoryStore::new());
        let factory = FakeSessionFactory::new("A1");
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = factory.create(&IceConfig::default(), tx).await.unwrap();
        let fake = factory.last();
        session
            .set_remote_description(SessionDescription::offer("O1"))
            .await
            .unwrap();

        let mut negotiator = Negotiator::new(
            Role::Callee,
            session,
            Arc::clone(&store) as _,
            Progress::new(CallId::new("abc123"), broadcast::channel(1).0),
            true,
        );

        for event in [
            SignalingEvent::CandidateAdded {
                entry_id: "e1".into(),
                candidate: candidate("C1"),
            },
            SignalingEvent::CandidateAdded {
                entry_id: "e1".into(),
                candidate: candidate("C1"),
            },
            SignalingEvent::CandidateAdded {
                entry_id: "e2".into(),
                candidate: candidate("C2"),
            },
        ] {
            negotiator.handle(event).await.unwrap();
        }

        assert_eq!(fake.added_candidates(), vec![candidate("C1"), candidate("C2")]);
    }

    #[tokio::test]
    async fn test_early_remote_candidates_wait_for_answer() {
        let store = Arc::new(MemoryStore::new());
        let factory = FakeSessionFactory::new("O1");
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = factory.create(&IceConfig::default(), tx).await.unwrap();
        let fake = factory.last();

        let mut negotiator = Negotiator::new(
            Role::Caller,
            session,
            Arc::clone(&store) as _,
            Progress::new(CallId::new("abc123"), broadcast::channel(1).0),
            false,
        );

        negotiator
            .handle(SignalingEvent::CandidateAdded {
                entry_id: "e1".into(),
                candidate: candidate("C2"),
            })
            .await
            .unwrap();
        assert!(fake.added_candidates().is_empty());

        let mut record = CallRecord::with_offer(SessionDescription::offer("O1"));
        record.answer = Some(SessionDescription::answer("A1"));
        negotiator
            .handle(SignalingEvent::RecordChanged(Some(record)))
            .await
            .unwrap();

        assert_eq!(fake.added_candidates(), vec![candidate("C2")]);
        assert_eq!(negotiator.progress.current(), NegotiationState::CandidateExchangeActive);
    }

    #[tokio::test]
    async fn test_hangup_drops_subscriptions() {
        let store = Arc::new(MemoryStore::new());
        let machine = machine(&store);
        let caller = peer(FakeSessionFactory::new("O1")).await;

        let outgoing = machine.create_call(&caller.controller).await.unwrap();
        let id = outgoing.call_id().clone();
        assert_eq!(store.subscriber_count(&id), 2);

        outgoing.hangup().await;
        outgoing.hangup().await;

        assert_eq!(store.subscriber_count(&id), 0);
        assert_eq!(outgoing.state(), NegotiationState::HungUp);
    }
    fn failure_for(
        events: &mut broadcast::Receiver<(CallId, NegotiationEvent)>,
    ) -> Option<(CallId, String)> {
        while let Ok((call_id, event)) = events.try_recv() {
            if let NegotiationEvent::StateChanged(NegotiationState::Failed(reason)) = event {
                return Some((call_id, reason));
            }
        }
        None
    }

    #[tokio::test]
    async fn test_offer_write_failure_releases_session() {
        let store = Arc::new(MemoryStore::new());
        let machine = machine(&store);
        let caller = peer(FakeSessionFactory::new("O1")).await;
        let mut events = machine.subscribe();

        store.fail_writes(true);
        let result = machine.create_call(&caller.controller).await;
        assert!(matches!(
            result,
            Err(SignalingError::Store(StoreError::WriteFailed(_)))
        ));
        assert_eq!(store.record_count(), 0);
        assert!(failure_for(&mut events).is_some());

        // Sink ist wieder frei, ein neuer Versuch klappt
        store.fail_writes(false);
        let outgoing = machine.create_call(&caller.controller).await.unwrap();
        assert_eq!(outgoing.state(), NegotiationState::RemoteDescriptionPending);
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_offer_leaves_record_unanswered() {
        let store = Arc::new(MemoryStore::new());
        let machine = machine(&store);
        let callee = peer(FakeSessionFactory::new("A1")).await;
        let mut events = machine.subscribe();

        let id = CallId::new("abc123");
        store
            .create(&id, CallRecord::with_offer(SessionDescription::offer("")))
            .await
            .unwrap();

        let result = machine.answer_call(&callee.controller, &id).await;
        assert!(matches!(
            result,
            Err(SignalingError::Peer(PeerSessionError::InvalidSdp(_)))
        ));

        let record = store.read(&id).await.unwrap().unwrap();
        assert_eq!(record.answer, None);
        assert_eq!(store.entry_count(&id, SubChannel::AnswerCandidates), 0);
        assert_eq!(failure_for(&mut events).map(|(call_id, _)| call_id), Some(id));
    }

    #[tokio::test]
    async fn test_no_candidate_writes_after_hangup() {
        let store = Arc::new(MemoryStore::new());
        let machine = machine(&store);
        let caller = peer(FakeSessionFactory::new("O1")).await;

        let outgoing = machine.create_call(&caller.controller).await.unwrap();
        let id = outgoing.call_id().clone();
        let fake = caller.factory.last();

        fake.emit(PeerEvent::LocalCandidate(candidate("C1")));
        eventually(|| store.entry_count(&id, SubChannel::OfferCandidates) == 1).await;

        outgoing.hangup().await;
        fake.emit(PeerEvent::LocalCandidate(candidate("C2")));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(store.entry_count(&id, SubChannel::OfferCandidates), 1);
    }
}
