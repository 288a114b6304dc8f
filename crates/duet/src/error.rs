//! Error taxonomy seen by the lifecycle controller
//!
//! Every store and negotiation failure is converted into a `MatchError`
//! before it reaches the controller, which turns it into a state transition
//! and a status line for the user.

use duet_core::StoreError;
use thiserror::Error;

use crate::negotiation::NegotiationError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MatchError {
    /// Transient; retried with backoff
    #[error("rendezvous store unavailable: {0}")]
    StoreUnavailable(String),
    /// Expected outcome of contention, not a fault
    #[error("reservation lost")]
    ReservationLost,
    /// Treated like a lost reservation: the batch was not applied
    #[error("session write failed: {0}")]
    BatchWriteFailed(String),
    /// Terminal for the session, the client re-queues with backoff
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),
    /// Fatal to the whole flow until the user grants access again
    #[error("media permission denied: {0}")]
    PermissionDenied(String),
    #[error("local state error: {0}")]
    LocalState(String),
}

impl MatchError {
    /// Whether the controller should retry after a backoff
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            MatchError::PermissionDenied(_) | MatchError::LocalState(_)
        )
    }

    /// Short user-facing status line
    pub fn status_message(&self) -> String {
        match self {
            MatchError::StoreUnavailable(_) => "Connection problem, retrying".to_string(),
            MatchError::ReservationLost | MatchError::BatchWriteFailed(_) => {
                "Partner was taken, looking again".to_string()
            }
            MatchError::NegotiationFailed(_) => "Could not connect to partner".to_string(),
            MatchError::PermissionDenied(_) => {
                "Camera or microphone access denied".to_string()
            }
            MatchError::LocalState(e) => format!("Local storage error: {}", e),
        }
    }
}

impl From<StoreError> for MatchError {
    fn from(e: StoreError) -> Self {
        MatchError::StoreUnavailable(e.to_string())
    }
}

impl From<NegotiationError> for MatchError {
    fn from(e: NegotiationError) -> Self {
        match e {
            NegotiationError::PermissionDenied(msg) => MatchError::PermissionDenied(msg),
            other => MatchError::NegotiationFailed(other.to_string()),
        }
    }
}
