//! Media negotiation abstraction
//!
//! The negotiation primitive (a WebRTC peer connection in production) is
//! external. duet only needs it to produce and consume opaque offer, answer
//! and candidate payloads and to report connection state, so it is modelled
//! as a trait that real and mock implementations share.

use async_trait::async_trait;
use duet_core::{SessionId, SignalingPayload};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Errors from the negotiation primitive
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NegotiationError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("negotiation failed: {0}")]
    Failed(String),
    #[error("connection closed")]
    Closed,
}

/// Connection state reported by the negotiation primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// One peer connection, used for exactly one session
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Produce the local offer (initiator side)
    async fn create_offer(&self) -> Result<SignalingPayload, NegotiationError>;

    /// Apply the remote offer and produce the local answer (responder side)
    async fn create_answer(
        &self,
        remote_offer: &SignalingPayload,
    ) -> Result<SignalingPayload, NegotiationError>;

    /// Apply the remote answer (initiator side)
    async fn set_remote_description(&self, payload: &SignalingPayload)
        -> Result<(), NegotiationError>;

    /// Feed a candidate discovered by the peer
    async fn add_remote_candidate(&self, candidate: &SignalingPayload)
        -> Result<(), NegotiationError>;

    /// Stream of locally discovered candidates. Only the first call gets it.
    fn take_local_candidates(&self) -> Option<mpsc::UnboundedReceiver<SignalingPayload>>;

    /// Connection state changes
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// Release the connection and local media
    async fn close(&self);
}

/// Opens a fresh negotiator (peer connection plus local media) per session
#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    /// Fails with `PermissionDenied` when local media cannot be acquired
    async fn open(&self, session: &SessionId) -> Result<Arc<dyn Negotiator>, NegotiationError>;
}

#[async_trait]
impl<T: NegotiatorFactory + ?Sized> NegotiatorFactory for Arc<T> {
    async fn open(&self, session: &SessionId) -> Result<Arc<dyn Negotiator>, NegotiationError> {
        (**self).open(session).await
    }
}
