//! Signaling relay for one session
//!
//! Carries the offer, the answer and both candidate streams between the two
//! participants through the rendezvous store. Offer and answer are set-once
//! fields; candidates are append-only lists consumed through child watches.
//! Payloads are relayed without being inspected.
//!
//! Per participant the relay moves through
//! `Created -> LocalDescriptionSet / RemoteDescriptionPending -> Negotiating ->
//! Established | Failed`, and reports `SessionClosed` when the room record
//! disappears.

use duet_core::keys;
use duet_core::{
    from_value, to_value, RendezvousStore, Role, SessionRecord, SignalingPayload, Value,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::error::MatchError;
use crate::negotiation::{ConnectionState, Negotiator};

/// Relay state from the point of view of one participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Created,
    LocalDescriptionSet,
    RemoteDescriptionPending,
    Negotiating,
    Established,
    Failed,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayState::Created => "created",
            RelayState::LocalDescriptionSet => "local-description-set",
            RelayState::RemoteDescriptionPending => "remote-description-pending",
            RelayState::Negotiating => "negotiating",
            RelayState::Established => "established",
            RelayState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Notifications from a running relay
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    StateChanged(RelayState),
    /// Terminal: the relay stopped
    Failed(MatchError),
    /// Terminal: the room record was deleted (peer left or skipped)
    SessionClosed,
}

/// Bounded waits
#[derive(Debug, Clone, Copy)]
pub struct RelayTimeouts {
    /// Until the peer's offer (responder) or answer (initiator) arrives
    pub answer: Duration,
    /// Until the media link reports connected
    pub negotiation: Duration,
}

impl Default for RelayTimeouts {
    fn default() -> Self {
        Self {
            answer: Duration::from_secs(10),
            negotiation: Duration::from_secs(20),
        }
    }
}

pub struct SignalingRelay<S: RendezvousStore> {
    store: Arc<S>,
    negotiator: Arc<dyn Negotiator>,
    session: SessionRecord,
    role: Role,
    timeouts: RelayTimeouts,
    state: RelayState,
    remote_applied: bool,
    /// Remote candidates received before the remote description
    pending_candidates: Vec<SignalingPayload>,
    seen_candidates: HashSet<String>,
    next_seq: u64,
}

/// A store watch ended because this side's connection went away
fn store_closed() -> MatchError {
    MatchError::StoreUnavailable("store connection closed".to_string())
}

async fn next_local(
    rx: &mut Option<mpsc::UnboundedReceiver<SignalingPayload>>,
) -> Option<SignalingPayload> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_media_state(
    rx: &mut Option<watch::Receiver<ConnectionState>>,
) -> Option<ConnectionState> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

impl<S: RendezvousStore + 'static> SignalingRelay<S> {
    pub fn new(
        store: Arc<S>,
        negotiator: Arc<dyn Negotiator>,
        session: SessionRecord,
        role: Role,
        timeouts: RelayTimeouts,
    ) -> Self {
        Self {
            store,
            negotiator,
            session,
            role,
            timeouts,
            state: RelayState::Created,
            remote_applied: false,
            pending_candidates: Vec::new(),
            seen_candidates: HashSet::new(),
            next_seq: 0,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    fn transition<F: FnMut(RelayEvent)>(&mut self, state: RelayState, emit: &mut F) {
        if self.state == state {
            return;
        }
        debug!(
            "[relay {}] {} {} -> {}",
            self.session.session_id, self.role, self.state, state
        );
        self.state = state;
        emit(RelayEvent::StateChanged(state));
    }

    fn fail<F: FnMut(RelayEvent)>(&mut self, error: MatchError, emit: &mut F) {
        warn!(
            "[relay {}] {} failed: {}",
            self.session.session_id, self.role, error
        );
        self.transition(RelayState::Failed, emit);
        emit(RelayEvent::Failed(error));
    }

    /// Key holding the description this side writes
    fn local_description_key(&self) -> String {
        match self.role {
            Role::Initiator => keys::offer(&self.session.session_id),
            Role::Responder => keys::answer(&self.session.session_id),
        }
    }

    /// Key holding the description the peer writes
    fn remote_description_key(&self) -> String {
        match self.role {
            Role::Initiator => keys::answer(&self.session.session_id),
            Role::Responder => keys::offer(&self.session.session_id),
        }
    }

    /// Write a set-once field. A second write never replaces the first.
    async fn publish_description(&self, payload: &SignalingPayload) -> Result<(), MatchError> {
        let key = self.local_description_key();
        let value = to_value(payload)?;
        if !self
            .store
            .compare_and_set(&key, None, Some(value.clone()))
            .await?
        {
            let existing = self.store.get(&key).await?;
            if existing.as_ref() != Some(&value) {
                warn!("[relay {}] {} already written, keeping it", self.session.session_id, key);
            }
        }
        Ok(())
    }

    async fn append_local_candidate(&mut self, candidate: SignalingPayload) -> Result<(), MatchError> {
        let key = keys::candidate(&self.session.session_id, self.role, self.next_seq);
        self.next_seq += 1;
        self.store.set(&key, Some(to_value(&candidate)?)).await?;
        Ok(())
    }

    async fn apply_remote_candidate(&mut self, candidate: SignalingPayload) -> Result<(), MatchError> {
        if !self.remote_applied {
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.negotiator.add_remote_candidate(&candidate).await?;
        Ok(())
    }

    /// Handle the first non-empty remote description; later ones are ignored
    async fn apply_remote_description<F: FnMut(RelayEvent)>(
        &mut self,
        value: Value,
        emit: &mut F,
    ) -> Result<(), MatchError> {
        if self.remote_applied {
            return Ok(());
        }
        let payload: SignalingPayload = from_value(value)?;
        match self.role {
            Role::Initiator => {
                self.negotiator.set_remote_description(&payload).await?;
                self.remote_applied = true;
            }
            Role::Responder => {
                let answer = self.negotiator.create_answer(&payload).await?;
                self.remote_applied = true;
                self.publish_description(&answer).await?;
                self.transition(RelayState::LocalDescriptionSet, emit);
            }
        }
        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.negotiator.add_remote_candidate(&candidate).await?;
        }
        self.transition(RelayState::Negotiating, emit);
        Ok(())
    }

    /// Delete anything written under the room after it was removed. Writes
    /// from this side can land after the peer's teardown.
    async fn sweep_closed_room(&self) {
        let key = keys::room(&self.session.session_id);
        if let Err(e) = self.store.set(&key, None).await {
            debug!("[relay {}] sweeping closed room failed: {}", self.session.session_id, e);
        }
    }

    /// Drive the session until it fails or the room disappears.
    ///
    /// Every state change is passed to `emit`; the last event is always
    /// `Failed` or `SessionClosed`. A closed store connection is a failure.
    pub async fn run<F>(mut self, mut emit: F)
    where
        F: FnMut(RelayEvent) + Send,
    {
        if let Err(e) = self.drive(&mut emit).await {
            self.fail(e, &mut emit);
        }
    }

    async fn drive<F>(&mut self, emit: &mut F) -> Result<(), MatchError>
    where
        F: FnMut(RelayEvent) + Send,
    {
        let sid = self.session.session_id.clone();
        let started = Instant::now();
        let answer_deadline = started + self.timeouts.answer;
        let negotiation_deadline = started + self.timeouts.negotiation;

        let mut room = self.store.watch_value(&keys::room(&sid)).await?;
        let mut remote_description = self
            .store
            .watch_value(&self.remote_description_key())
            .await?;
        let mut remote_candidates = self
            .store
            .watch_children(&keys::candidates(&sid, self.role.peer()))
            .await?;
        let mut local_candidates = self.negotiator.take_local_candidates();
        let mut media_state = Some(self.negotiator.connection_state());

        if self.role == Role::Initiator {
            let offer = self.negotiator.create_offer().await?;
            self.publish_description(&offer).await?;
            self.transition(RelayState::LocalDescriptionSet, emit);
        }
        self.transition(RelayState::RemoteDescriptionPending, emit);
        info!("[relay {}] started as {}", sid, self.role);

        loop {
            tokio::select! {
                update = room.next() => match update {
                    Some(Some(_)) => {}
                    Some(None) => {
                        info!("[relay {}] room closed", sid);
                        self.sweep_closed_room().await;
                        emit(RelayEvent::SessionClosed);
                        return Ok(());
                    }
                    None => return Err(store_closed()),
                },
                update = remote_description.next() => match update {
                    Some(Some(value)) => self.apply_remote_description(value, emit).await?,
                    Some(None) => {}
                    None => return Err(store_closed()),
                },
                added = remote_candidates.next() => match added {
                    Some(child) => {
                        if self.seen_candidates.insert(child.key.clone()) {
                            let candidate: SignalingPayload = from_value(child.value)?;
                            self.apply_remote_candidate(candidate).await?;
                        }
                    }
                    None => return Err(store_closed()),
                },
                candidate = next_local(&mut local_candidates) => match candidate {
                    Some(candidate) => self.append_local_candidate(candidate).await?,
                    None => local_candidates = None,
                },
                state = next_media_state(&mut media_state) => match state {
                    Some(ConnectionState::Connected) => {
                        self.transition(RelayState::Established, emit);
                    }
                    Some(ConnectionState::Failed) => {
                        return Err(MatchError::NegotiationFailed("media link failed".to_string()));
                    }
                    Some(s @ (ConnectionState::Disconnected | ConnectionState::Closed)) => {
                        // A peer that leaves removes the room before dropping its media
                        if self.store.get(&keys::room(&sid)).await?.is_none() {
                            info!("[relay {}] room closed", sid);
                            self.sweep_closed_room().await;
                            emit(RelayEvent::SessionClosed);
                            return Ok(());
                        }
                        return Err(MatchError::NegotiationFailed(format!("media link {}", s)));
                    }
                    Some(_) => {}
                    None => media_state = None,
                },
                _ = sleep_until(answer_deadline), if !self.remote_applied => {
                    return Err(MatchError::NegotiationFailed(format!(
                        "no {} from peer within {:?}",
                        if self.role == Role::Initiator { "answer" } else { "offer" },
                        self.timeouts.answer
                    )));
                }
                _ = sleep_until(negotiation_deadline), if self.state != RelayState::Established => {
                    return Err(MatchError::NegotiationFailed(format!(
                        "not connected within {:?}",
                        self.timeouts.negotiation
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockMediaNetwork;
    use crate::negotiation::NegotiatorFactory;
    use duet_core::{ClientId, MemoryRendezvous, RendezvousStoreExt, SessionId};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn record() -> SessionRecord {
        SessionRecord::new(SessionId::new("room1"), ClientId::new("a"), ClientId::new("b"))
    }

    async fn spawn_relay(
        store: &MemoryRendezvous,
        network: &MockMediaNetwork,
        record: &SessionRecord,
        role: Role,
        timeouts: RelayTimeouts,
    ) -> UnboundedReceiver<RelayEvent> {
        let conn = Arc::new(store.connect());
        let negotiator = network.open(&record.session_id).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = SignalingRelay::new(conn, negotiator, record.clone(), role, timeouts);
        tokio::spawn(relay.run(move |ev| {
            let _ = tx.send(ev);
        }));
        rx
    }

    async fn wait_for(rx: &mut UnboundedReceiver<RelayEvent>, want: &RelayEvent) -> Vec<RelayEvent> {
        let mut seen = Vec::new();
        while let Some(ev) = rx.recv().await {
            let done = &ev == want;
            seen.push(ev);
            if done {
                break;
            }
        }
        seen
    }

    async fn create_room(store: &MemoryRendezvous, record: &SessionRecord) {
        let conn = store.connect();
        conn.set_json(&keys::room(&record.session_id), record).await.unwrap();
    }

    #[tokio::test]
    async fn test_both_sides_establish() {
        let store = MemoryRendezvous::new();
        let network = MockMediaNetwork::new();
        let record = record();
        create_room(&store, &record).await;

        let mut a = spawn_relay(&store, &network, &record, Role::Initiator, RelayTimeouts::default()).await;
        let mut b = spawn_relay(&store, &network, &record, Role::Responder, RelayTimeouts::default()).await;

        let established = RelayEvent::StateChanged(RelayState::Established);
        let seen_a = wait_for(&mut a, &established).await;
        let seen_b = wait_for(&mut b, &established).await;

        assert_eq!(seen_a[0], RelayEvent::StateChanged(RelayState::LocalDescriptionSet));
        assert!(seen_a.contains(&RelayEvent::StateChanged(RelayState::Negotiating)));
        assert_eq!(seen_b[0], RelayEvent::StateChanged(RelayState::RemoteDescriptionPending));
        assert!(seen_b.contains(&established));

        // Offer and answer were written once each, candidates appended on both sides
        assert!(store.value(&keys::offer(&record.session_id)).is_some());
        assert!(store.value(&keys::answer(&record.session_id)).is_some());
        assert!(!store
            .keys_with_prefix(&keys::candidates(&record.session_id, Role::Responder))
            .is_empty());
        assert_eq!(network.connected_links(), 1);
    }

    #[tokio::test]
    async fn test_responder_started_first() {
        let store = MemoryRendezvous::new();
        let network = MockMediaNetwork::new();
        let record = record();
        create_room(&store, &record).await;

        let mut b = spawn_relay(&store, &network, &record, Role::Responder, RelayTimeouts::default()).await;
        tokio::task::yield_now().await;
        let mut a = spawn_relay(&store, &network, &record, Role::Initiator, RelayTimeouts::default()).await;

        let established = RelayEvent::StateChanged(RelayState::Established);
        assert!(wait_for(&mut a, &established).await.contains(&established));
        assert!(wait_for(&mut b, &established).await.contains(&established));
    }

    #[tokio::test]
    async fn test_lost_store_connection_fails_session() {
        let store = MemoryRendezvous::new();
        let network = MockMediaNetwork::new();
        let record = record();
        create_room(&store, &record).await;

        let conn = Arc::new(store.connect());
        let negotiator = network.open(&record.session_id).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let relay = SignalingRelay::new(
            conn.clone(),
            negotiator,
            record.clone(),
            Role::Responder,
            RelayTimeouts::default(),
        );
        tokio::spawn(relay.run(move |ev| {
            let _ = tx.send(ev);
        }));

        let pending = RelayEvent::StateChanged(RelayState::RemoteDescriptionPending);
        assert!(wait_for(&mut rx, &pending).await.contains(&pending));
        conn.disconnect().await;

        let failed = RelayEvent::Failed(MatchError::StoreUnavailable(
            "store connection closed".to_string(),
        ));
        assert!(wait_for(&mut rx, &failed).await.contains(&failed));
    }

    #[tokio::test]
    async fn test_room_deletion_closes_session() {
        let store = MemoryRendezvous::new();
        let network = MockMediaNetwork::new();
        let record = record();
        create_room(&store, &record).await;

        let mut a = spawn_relay(&store, &network, &record, Role::Initiator, RelayTimeouts::default()).await;
        let mut b = spawn_relay(&store, &network, &record, Role::Responder, RelayTimeouts::default()).await;
        let established = RelayEvent::StateChanged(RelayState::Established);
        wait_for(&mut a, &established).await;
        wait_for(&mut b, &established).await;

        let conn = store.connect();
        conn.set(&keys::room(&record.session_id), None).await.unwrap();

        assert!(wait_for(&mut b, &RelayEvent::SessionClosed)
            .await
            .contains(&RelayEvent::SessionClosed));
    }

    #[tokio::test]
    async fn test_relay_on_deleted_room_leaves_nothing_behind() {
        let store = MemoryRendezvous::new();
        let network = MockMediaNetwork::new();
        let record = record();

        // The peer declined before this side started
        let mut a = spawn_relay(&store, &network, &record, Role::Initiator, RelayTimeouts::default()).await;
        let seen = wait_for(&mut a, &RelayEvent::SessionClosed).await;
        assert_eq!(seen.last(), Some(&RelayEvent::SessionClosed));
        assert!(store.keys_with_prefix("rooms/").is_empty(), "{:?}", store.keys_with_prefix("rooms/"));
    }

    #[tokio::test]
    async fn test_room_deletion_sweeps_late_signaling() {
        let store = MemoryRendezvous::new();
        let network = MockMediaNetwork::new();
        let record = record();
        create_room(&store, &record).await;

        let mut b = spawn_relay(&store, &network, &record, Role::Responder, RelayTimeouts::default()).await;
        wait_for(&mut b, &RelayEvent::StateChanged(RelayState::RemoteDescriptionPending)).await;

        // The peer wrote its offer and then deleted the room; the answer
        // may be written after the deletion
        let peer = network.open(&record.session_id).await.unwrap();
        let offer = peer.create_offer().await.unwrap();
        let conn = store.connect();
        conn.set_json(&keys::offer(&record.session_id), &offer).await.unwrap();
        conn.set(&keys::room(&record.session_id), None).await.unwrap();

        wait_for(&mut b, &RelayEvent::SessionClosed).await;
        assert!(store.keys_with_prefix("rooms/").is_empty(), "{:?}", store.keys_with_prefix("rooms/"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_answer_times_out() {
        let store = MemoryRendezvous::new();
        let network = MockMediaNetwork::new();
        let record = record();
        create_room(&store, &record).await;

        let timeouts = RelayTimeouts {
            answer: Duration::from_secs(2),
            negotiation: Duration::from_secs(5),
        };
        let mut a = spawn_relay(&store, &network, &record, Role::Initiator, timeouts).await;

        let mut failure = None;
        while let Some(ev) = a.recv().await {
            if let RelayEvent::Failed(e) = ev {
                failure = Some(e);
                break;
            }
        }
        match failure {
            Some(MatchError::NegotiationFailed(msg)) => assert!(msg.contains("no answer")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_offer_write_is_ignored() {
        let store = MemoryRendezvous::new();
        let network = MockMediaNetwork::new();
        let record = record();
        create_room(&store, &record).await;

        let conn = store.connect();
        let stale = SignalingPayload::new("mock-offer:earlier");
        conn.set_json(&keys::offer(&record.session_id), &stale).await.unwrap();

        let negotiator = network.open(&record.session_id).await.unwrap();
        let relay = SignalingRelay::new(
            Arc::new(store.connect()),
            negotiator.clone(),
            record.clone(),
            Role::Initiator,
            RelayTimeouts::default(),
        );
        let offer = negotiator.create_offer().await.unwrap();
        relay.publish_description(&offer).await.unwrap();

        let stored: SignalingPayload = conn
            .get_json(&keys::offer(&record.session_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, stale);
    }

    #[tokio::test]
    async fn test_media_failure_after_established() {
        let store = MemoryRendezvous::new();
        let network = MockMediaNetwork::new();
        let record = record();
        create_room(&store, &record).await;

        let mut a = spawn_relay(&store, &network, &record, Role::Initiator, RelayTimeouts::default()).await;
        let mut b = spawn_relay(&store, &network, &record, Role::Responder, RelayTimeouts::default()).await;
        let established = RelayEvent::StateChanged(RelayState::Established);
        wait_for(&mut a, &established).await;
        wait_for(&mut b, &established).await;

        network.fail_session(&record.session_id);
        let failed = RelayEvent::StateChanged(RelayState::Failed);
        assert!(wait_for(&mut a, &failed).await.contains(&failed));
        match a.recv().await {
            Some(RelayEvent::Failed(MatchError::NegotiationFailed(_))) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
