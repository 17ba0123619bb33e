//! Aktive Calls dieser Instanz

use super::machine::Negotiation;
use crate::store::CallId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct CallTable {
    calls: RwLock<HashMap<CallId, Arc<Negotiation>>>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registriert eine Negotiation unter ihrer Call-ID
    pub fn insert(&self, negotiation: Negotiation) -> Arc<Negotiation> {
        let negotiation = Arc::new(negotiation);
        let previous = self
            .calls
            .write()
            .insert(negotiation.call_id().clone(), Arc::clone(&negotiation));

        if previous.is_some() {
            tracing::warn!("Replaced negotiation for call {}", negotiation.call_id());
        }
        negotiation
    }

    pub fn get(&self, call_id: &CallId) -> Option<Arc<Negotiation>> {
        self.calls.read().get(call_id).cloned()
    }

    pub fn remove(&self, call_id: &CallId) -> Option<Arc<Negotiation>> {
        self.calls.write().remove(call_id)
    }

    pub fn len(&self) -> usize {
        self.calls.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.read().is_empty()
    }
}
