//! Mock negotiation primitive for testing and simulation
//!
//! `MockMediaNetwork` stands in for the media stack: offers and answers are
//! opaque tokens that link two `MockNegotiator`s, and each side emits a few
//! local candidates. A link becomes `Connected` on both ends once each side
//! has applied the remote description and received at least one remote
//! candidate, which mirrors what a real peer connection needs.

use async_trait::async_trait;
use duet_core::{SessionId, SignalingPayload};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, watch};

use crate::negotiation::{ConnectionState, Negotiator, NegotiatorFactory, NegotiationError};

const OFFER_PREFIX: &str = "mock-offer:";
const ANSWER_PREFIX: &str = "mock-answer:";
const CANDIDATE_PREFIX: &str = "mock-candidate:";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct SideStatus {
    token: Option<String>,
    remote_set: bool,
    remote_candidates: usize,
}

/// One end of a mock peer connection
struct Side {
    state_tx: watch::Sender<ConnectionState>,
    status: Mutex<SideStatus>,
}

impl Side {
    fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::New);
        Self {
            state_tx,
            status: Mutex::new(SideStatus::default()),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn is_ready(&self, needs_candidate: bool) -> bool {
        let status = lock(&self.status);
        status.remote_set && (!needs_candidate || status.remote_candidates > 0)
    }
}

struct Link {
    offerer: Arc<Side>,
    answerer: Option<Arc<Side>>,
}

struct NetworkInner {
    links: HashMap<String, Link>,
    sessions: HashMap<SessionId, Vec<Weak<Side>>>,
    deny_media: bool,
    fail_negotiation: bool,
    candidates_per_side: usize,
    opened: u64,
}

impl Default for NetworkInner {
    fn default() -> Self {
        Self {
            links: HashMap::new(),
            sessions: HashMap::new(),
            deny_media: false,
            fail_negotiation: false,
            candidates_per_side: 2,
            opened: 0,
        }
    }
}

impl NetworkInner {
    /// Promote both ends of a link once both are ready
    fn check_link(&self, token: &str) {
        let Some(link) = self.links.get(token) else {
            return;
        };
        let Some(answerer) = &link.answerer else {
            return;
        };
        let needs_candidate = self.candidates_per_side > 0;
        if !(link.offerer.is_ready(needs_candidate) && answerer.is_ready(needs_candidate)) {
            return;
        }
        let next = if self.fail_negotiation {
            ConnectionState::Failed
        } else {
            ConnectionState::Connected
        };
        for side in [&link.offerer, answerer] {
            if side.state() == ConnectionState::Connecting {
                side.set_state(next);
            }
        }
    }
}

/// In-memory stand-in for the media stack shared by all mock negotiators
#[derive(Clone, Default)]
pub struct MockMediaNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MockMediaNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `open` fail as if camera/microphone access was refused
    pub fn deny_media(&self, deny: bool) {
        lock(&self.inner).deny_media = deny;
    }

    /// Make links end in `Failed` instead of `Connected`
    pub fn fail_negotiations(&self, fail: bool) {
        lock(&self.inner).fail_negotiation = fail;
    }

    /// Candidates each side emits (0 = connect on descriptions alone)
    pub fn set_candidates_per_side(&self, n: usize) {
        lock(&self.inner).candidates_per_side = n;
    }

    /// Number of negotiators opened so far
    pub fn opened(&self) -> u64 {
        lock(&self.inner).opened
    }

    /// Number of links currently connected on both ends
    pub fn connected_links(&self) -> usize {
        lock(&self.inner)
            .links
            .values()
            .filter(|link| {
                link.offerer.state() == ConnectionState::Connected
                    && link
                        .answerer
                        .as_ref()
                        .map(|a| a.state() == ConnectionState::Connected)
                        .unwrap_or(false)
            })
            .count()
    }

    /// Drop the media link of a session on both ends
    pub fn fail_session(&self, session: &SessionId) {
        let inner = lock(&self.inner);
        if let Some(sides) = inner.sessions.get(session) {
            for side in sides.iter().filter_map(Weak::upgrade) {
                side.set_state(ConnectionState::Failed);
            }
        }
    }
}

#[async_trait]
impl NegotiatorFactory for MockMediaNetwork {
    async fn open(&self, session: &SessionId) -> Result<Arc<dyn Negotiator>, NegotiationError> {
        let mut inner = lock(&self.inner);
        if inner.deny_media {
            return Err(NegotiationError::PermissionDenied(
                "camera access denied".to_string(),
            ));
        }
        inner.opened += 1;

        let side = Arc::new(Side::new());
        let sides = inner.sessions.entry(session.clone()).or_default();
        sides.retain(|w| w.strong_count() > 0);
        sides.push(Arc::downgrade(&side));

        let (local_tx, local_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(MockNegotiator {
            network: self.clone(),
            side,
            local_tx,
            local_rx: Mutex::new(Some(local_rx)),
        }))
    }
}

/// Mock peer connection
pub struct MockNegotiator {
    network: MockMediaNetwork,
    side: Arc<Side>,
    local_tx: mpsc::UnboundedSender<SignalingPayload>,
    local_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalingPayload>>>,
}

impl MockNegotiator {
    fn emit_candidates(&self, token: &str, role: &str, count: usize) {
        for i in 0..count {
            let _ = self.local_tx.send(SignalingPayload::new(format!(
                "{}{}:{}:{}",
                CANDIDATE_PREFIX, token, role, i
            )));
        }
    }

    fn token(&self) -> Option<String> {
        lock(&self.side.status).token.clone()
    }
}

#[async_trait]
impl Negotiator for MockNegotiator {
    async fn create_offer(&self) -> Result<SignalingPayload, NegotiationError> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let count = {
            let mut inner = lock(&self.network.inner);
            inner.links.insert(
                token.clone(),
                Link {
                    offerer: self.side.clone(),
                    answerer: None,
                },
            );
            inner.candidates_per_side
        };
        lock(&self.side.status).token = Some(token.clone());
        self.side.set_state(ConnectionState::Connecting);
        self.emit_candidates(&token, "offerer", count);
        Ok(SignalingPayload::new(format!("{}{}", OFFER_PREFIX, token)))
    }

    async fn create_answer(
        &self,
        remote_offer: &SignalingPayload,
    ) -> Result<SignalingPayload, NegotiationError> {
        let token = remote_offer
            .as_str()
            .strip_prefix(OFFER_PREFIX)
            .ok_or_else(|| NegotiationError::Failed("malformed offer".to_string()))?
            .to_string();

        let count = {
            let mut inner = lock(&self.network.inner);
            let link = inner
                .links
                .get_mut(&token)
                .ok_or_else(|| NegotiationError::Failed("unknown offer".to_string()))?;
            if link.answerer.is_some() {
                return Err(NegotiationError::Failed(
                    "offer already answered".to_string(),
                ));
            }
            link.answerer = Some(self.side.clone());
            {
                let mut status = lock(&self.side.status);
                status.token = Some(token.clone());
                status.remote_set = true;
            }
            self.side.set_state(ConnectionState::Connecting);
            inner.check_link(&token);
            inner.candidates_per_side
        };

        self.emit_candidates(&token, "answerer", count);
        Ok(SignalingPayload::new(format!("{}{}", ANSWER_PREFIX, token)))
    }

    async fn set_remote_description(
        &self,
        payload: &SignalingPayload,
    ) -> Result<(), NegotiationError> {
        let token = payload
            .as_str()
            .strip_prefix(ANSWER_PREFIX)
            .ok_or_else(|| NegotiationError::Failed("malformed answer".to_string()))?;
        if self.token().as_deref() != Some(token) {
            return Err(NegotiationError::Failed(
                "answer does not match offer".to_string(),
            ));
        }

        let inner = lock(&self.network.inner);
        lock(&self.side.status).remote_set = true;
        inner.check_link(token);
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        candidate: &SignalingPayload,
    ) -> Result<(), NegotiationError> {
        let token = candidate
            .as_str()
            .strip_prefix(CANDIDATE_PREFIX)
            .and_then(|rest| rest.split(':').next())
            .ok_or_else(|| NegotiationError::Failed("malformed candidate".to_string()))?;

        let inner = lock(&self.network.inner);
        {
            let mut status = lock(&self.side.status);
            if !status.remote_set {
                return Err(NegotiationError::Failed(
                    "remote description not set".to_string(),
                ));
            }
            if status.token.as_deref() != Some(token) {
                return Err(NegotiationError::Failed(
                    "candidate for another connection".to_string(),
                ));
            }
            status.remote_candidates += 1;
        }
        inner.check_link(token);
        Ok(())
    }

    fn take_local_candidates(&self) -> Option<mpsc::UnboundedReceiver<SignalingPayload>> {
        lock(&self.local_rx).take()
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.side.state_tx.subscribe()
    }

    async fn close(&self) {
        self.side.set_state(ConnectionState::Closed);
        let Some(token) = self.token() else {
            return;
        };
        let mut inner = lock(&self.network.inner);
        if let Some(link) = inner.links.remove(&token) {
            let peer = if Arc::ptr_eq(&link.offerer, &self.side) {
                link.answerer
            } else {
                Some(link.offerer)
            };
            if let Some(peer) = peer {
                if matches!(
                    peer.state(),
                    ConnectionState::Connected | ConnectionState::Connecting
                ) {
                    peer.set_state(ConnectionState::Disconnected);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exchange(
        offerer: &Arc<dyn Negotiator>,
        answerer: &Arc<dyn Negotiator>,
    ) {
        let mut offer_cands = offerer.take_local_candidates().unwrap();
        let offer = offerer.create_offer().await.unwrap();
        let answer = answerer.create_answer(&offer).await.unwrap();
        let mut answer_cands = answerer.take_local_candidates().unwrap();
        offerer.set_remote_description(&answer).await.unwrap();

        while let Ok(c) = offer_cands.try_recv() {
            answerer.add_remote_candidate(&c).await.unwrap();
        }
        while let Ok(c) = answer_cands.try_recv() {
            offerer.add_remote_candidate(&c).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_mock_link_connects() {
        let network = MockMediaNetwork::new();
        let session = SessionId::new("s");
        let a = network.open(&session).await.unwrap();
        let b = network.open(&session).await.unwrap();

        exchange(&a, &b).await;

        assert_eq!(*a.connection_state().borrow(), ConnectionState::Connected);
        assert_eq!(*b.connection_state().borrow(), ConnectionState::Connected);
        assert_eq!(network.connected_links(), 1);
        assert_eq!(network.opened(), 2);
    }

    #[tokio::test]
    async fn test_candidate_before_description_rejected() {
        let network = MockMediaNetwork::new();
        let session = SessionId::new("s");
        let a = network.open(&session).await.unwrap();
        let b = network.open(&session).await.unwrap();

        let mut cands = a.take_local_candidates().unwrap();
        a.create_offer().await.unwrap();
        let c = cands.recv().await.unwrap();
        // b has not seen the offer yet
        assert!(b.add_remote_candidate(&c).await.is_err());
    }

    #[tokio::test]
    async fn test_close_disconnects_peer() {
        let network = MockMediaNetwork::new();
        let session = SessionId::new("s");
        let a = network.open(&session).await.unwrap();
        let b = network.open(&session).await.unwrap();
        exchange(&a, &b).await;

        a.close().await;
        assert_eq!(*a.connection_state().borrow(), ConnectionState::Closed);
        assert_eq!(*b.connection_state().borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_denied_media_and_failed_negotiation() {
        let network = MockMediaNetwork::new();
        let session = SessionId::new("s");

        network.deny_media(true);
        assert!(matches!(
            network.open(&session).await,
            Err(NegotiationError::PermissionDenied(_))
        ));

        network.deny_media(false);
        network.fail_negotiations(true);
        let a = network.open(&session).await.unwrap();
        let b = network.open(&session).await.unwrap();
        exchange(&a, &b).await;
        assert_eq!(*a.connection_state().borrow(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_local_candidates_taken_once() {
        let network = MockMediaNetwork::new();
        let a = network.open(&SessionId::new("s")).await.unwrap();
        assert!(a.take_local_candidates().is_some());
        assert!(a.take_local_candidates().is_none());
    }
}
