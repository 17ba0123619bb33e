//! Signaling Module - Offer/Answer über den Call Store
//!
//! Dieses Modul verbindet die Peer Session mit dem Store:
//! - Caller legt den Call-Record mit Offer an
//! - Callee liest das Offer und schreibt die Answer
//! - Beide tauschen ICE Candidates über die Sub-Kanäle aus
//!

mod events;
mod machine;
mod table;

pub use events::{candidate_events, NegotiationEvent, NegotiationState, Role, SignalingEvent};
pub use machine::{Negotiation, SignalingMachine};
pub use table::CallTable;

use crate::session::{PeerSessionError, SessionError};
use crate::store::{CallId, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("No peer session, mount the call first")]
    NoSession,

    #[error("Call ID is required")]
    MissingCallId,

    #[error("Local media is not ready")]
    MediaNotReady,

    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    #[error("Call already answered: {0}")]
    AlreadyAnswered(CallId),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Peer session error: {0}")]
    Peer(#[from] PeerSessionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
