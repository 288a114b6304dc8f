//! Matchmaker: partner selection, reservation and session allocation
//!
//! Reservation is a compare-and-set on the candidate's whole queue entry,
//! so at most one reserver can move an entry from free to reserved. Before
//! reserving anybody a client also reserves its own entry. Two clients that
//! race to reserve each other therefore cannot both succeed: whoever locks
//! its own entry first makes the other's reservation fail, and the loser
//! waits for the winner's match row instead.
//!
//! Reservations carry a timestamp and lapse after the configured lease, so a
//! reserver that disappears before writing the session never blocks its
//! candidate for good.

use duet_core::keys;
use duet_core::{
    from_value, to_value, now_ms, BatchUpdate, ClientId, QueueEntry, RendezvousStore,
    Reservation, SessionId, SessionRecord, StoreError,
};
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::MatchError;
use crate::presence::PresenceQueue;
use crate::settings::ClientSettings;

/// Longest a sleeping matcher goes without checking for cancellation
const CANCEL_POLL: Duration = Duration::from_millis(25);

/// Sleep for `pause`, waking early once `cancel` is set
async fn pause_unless_cancelled(pause: Duration, cancel: &AtomicBool) {
    let deadline = tokio::time::Instant::now() + pause;
    while !cancel.load(Ordering::SeqCst) {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(CANCEL_POLL.min(deadline - now)).await;
    }
}

/// Result of a reservation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    /// Someone else holds the entry, or it is gone
    Lost,
}

/// Matcher progress, for status reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchProgress {
    /// Own entry locked, claiming this candidate
    Reserving(ClientId),
    /// Back to scanning after a lost round
    Searching,
}

/// Result of one find/reserve/create round
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// A session was created with this client as initiator
    Matched(SessionRecord),
    NoCandidate,
    /// The candidate was taken (`ReservationLost`) or the session write did
    /// not go through (`BatchWriteFailed`)
    Lost(MatchError),
    /// Another client reserved this one; its match row is on the way
    ReservedByOther,
    /// This client has no queue entry
    NotQueued,
}

pub struct Matchmaker<S: RendezvousStore> {
    store: Arc<S>,
    queue: PresenceQueue<S>,
    settings: ClientSettings,
}

impl<S: RendezvousStore> Clone for Matchmaker<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            queue: self.queue.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<S: RendezvousStore> Matchmaker<S> {
    pub fn new(store: Arc<S>, settings: ClientSettings) -> Self {
        Self {
            queue: PresenceQueue::new(store.clone()),
            store,
            settings,
        }
    }

    pub fn queue(&self) -> &PresenceQueue<S> {
        &self.queue
    }

    fn lease_ms(&self) -> u64 {
        self.settings.reservation_lease.as_millis() as u64
    }

    /// First waiting client that is not `self_id`, not excluded and not
    /// held by a live reservation. Key order, not arrival order.
    pub async fn find_partner(
        &self,
        self_id: &ClientId,
        excluded: &BTreeSet<ClientId>,
    ) -> Result<Option<ClientId>, StoreError> {
        let now = now_ms();
        let lease = self.lease_ms();
        Ok(self
            .queue
            .snapshot()
            .await?
            .into_iter()
            .find(|entry| {
                &entry.client_id != self_id
                    && !excluded.contains(&entry.client_id)
                    && entry.is_claimable(now, lease)
            })
            .map(|entry| entry.client_id))
    }

    /// Claim `target`'s queue entry for `by`.
    ///
    /// An entry already self-locked by `by` is refreshed; any other live
    /// reservation makes the claim fail.
    async fn claim(&self, by: &ClientId, target: &ClientId) -> Result<ReserveOutcome, StoreError> {
        let key = keys::queue_entry(target);
        loop {
            let Some(current) = self.store.get(&key).await? else {
                return Ok(ReserveOutcome::Lost);
            };
            let entry: QueueEntry = from_value(current.clone())?;
            let refresh = by == target && entry.is_reserved_by(by);
            if !refresh && !entry.is_claimable(now_ms(), self.lease_ms()) {
                return Ok(ReserveOutcome::Lost);
            }
            let claimed = QueueEntry {
                reserved_by: Some(Reservation::new(by.clone())),
                ..entry
            };
            if self
                .store
                .compare_and_set(&key, Some(&current), Some(to_value(&claimed)?))
                .await?
            {
                return Ok(ReserveOutcome::Reserved);
            }
            // Entry changed underneath us, look again
        }
    }

    /// Reserve `candidate` for `self_id`. Self-reservation is always `Lost`.
    pub async fn reserve(
        &self,
        self_id: &ClientId,
        candidate: &ClientId,
    ) -> Result<ReserveOutcome, StoreError> {
        if self_id == candidate {
            return Ok(ReserveOutcome::Lost);
        }
        let outcome = self.claim(self_id, candidate).await?;
        debug!(
            "[{}] reserve {} -> {:?}",
            self_id.short(),
            candidate.short(),
            outcome
        );
        Ok(outcome)
    }

    /// Mark the own entry as busy so nobody reserves this client meanwhile
    pub async fn lock_own_entry(&self, self_id: &ClientId) -> Result<ReserveOutcome, StoreError> {
        self.claim(self_id, self_id).await
    }

    /// Clear a reservation on `target` if `by` still holds it
    pub async fn release(&self, by: &ClientId, target: &ClientId) -> Result<(), StoreError> {
        let key = keys::queue_entry(target);
        loop {
            let Some(current) = self.store.get(&key).await? else {
                return Ok(());
            };
            let entry: QueueEntry = from_value(current.clone())?;
            if !entry.is_reserved_by(by) {
                return Ok(());
            }
            let released = QueueEntry {
                reserved_by: None,
                ..entry
            };
            if self
                .store
                .compare_and_set(&key, Some(&current), Some(to_value(&released)?))
                .await?
            {
                return Ok(());
            }
        }
    }

    /// Write both match rows and the room, and remove both queue entries,
    /// in one atomic batch. `self_id` becomes the initiator.
    pub async fn create_session(
        &self,
        self_id: &ClientId,
        partner: &ClientId,
    ) -> Result<SessionRecord, MatchError> {
        let record = SessionRecord::new(SessionId::generate(), self_id.clone(), partner.clone());
        let sid = to_value(&record.session_id)?;

        let mut batch = BatchUpdate::new();
        batch.insert(keys::match_row(self_id), Some(sid.clone()));
        batch.insert(keys::match_row(partner), Some(sid));
        batch.insert(keys::room(&record.session_id), Some(to_value(&record)?));
        batch.insert(keys::queue_entry(self_id), None);
        batch.insert(keys::queue_entry(partner), None);

        match self.store.batch_update(batch).await {
            Ok(()) => {
                info!(
                    "[{}] created session {} with {}",
                    self_id.short(),
                    record.session_id,
                    partner.short()
                );
                Ok(record)
            }
            Err(e @ (StoreError::Unavailable(_) | StoreError::Disconnected)) => {
                Err(MatchError::StoreUnavailable(e.to_string()))
            }
            Err(e) => Err(MatchError::BatchWriteFailed(e.to_string())),
        }
    }

    /// Drop both reservations after a failed round. Errors are logged only;
    /// the lease clears whatever could not be released.
    async fn release_both(&self, self_id: &ClientId, candidate: &ClientId) {
        for target in [candidate, self_id] {
            if let Err(e) = self.release(self_id, target).await {
                debug!("[{}] release of {} failed: {}", self_id.short(), target.short(), e);
            }
        }
    }

    /// One round of find, self-lock, reserve and create
    pub async fn attempt(
        &self,
        self_id: &ClientId,
        excluded: &BTreeSet<ClientId>,
    ) -> Result<AttemptOutcome, MatchError> {
        self.attempt_with(self_id, excluded, &mut |_| {}).await
    }

    async fn attempt_with(
        &self,
        self_id: &ClientId,
        excluded: &BTreeSet<ClientId>,
        progress: &mut (dyn FnMut(MatchProgress) + Send),
    ) -> Result<AttemptOutcome, MatchError> {
        let Some(candidate) = self.find_partner(self_id, excluded).await? else {
            return Ok(AttemptOutcome::NoCandidate);
        };

        if self.lock_own_entry(self_id).await? == ReserveOutcome::Lost {
            return match self.queue.entry(self_id).await? {
                Some(_) => Ok(AttemptOutcome::ReservedByOther),
                None => Ok(AttemptOutcome::NotQueued),
            };
        }

        progress(MatchProgress::Reserving(candidate.clone()));
        match self.reserve(self_id, &candidate).await {
            Ok(ReserveOutcome::Reserved) => {}
            Ok(ReserveOutcome::Lost) => {
                self.release_both(self_id, &candidate).await;
                progress(MatchProgress::Searching);
                return Ok(AttemptOutcome::Lost(MatchError::ReservationLost));
            }
            Err(e) => {
                self.release_both(self_id, &candidate).await;
                return Err(e.into());
            }
        }

        match self.create_session(self_id, &candidate).await {
            Ok(record) => Ok(AttemptOutcome::Matched(record)),
            Err(MatchError::BatchWriteFailed(reason)) => {
                warn!(
                    "[{}] session write with {} failed: {}",
                    self_id.short(),
                    candidate.short(),
                    reason
                );
                self.release_both(self_id, &candidate).await;
                progress(MatchProgress::Searching);
                Ok(AttemptOutcome::Lost(MatchError::BatchWriteFailed(reason)))
            }
            Err(e) => {
                self.release_both(self_id, &candidate).await;
                Err(e)
            }
        }
    }

    fn contention_backoff(&self) -> Duration {
        let min = self.settings.contention_backoff_min.as_millis() as u64;
        let max = self.settings.contention_backoff_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max.max(min)))
    }

    /// Keep trying until a session is created, `cancel` is set or this
    /// client's queue entry disappears.
    ///
    /// Returns `Ok(None)` in the last two cases. A session created in a race
    /// with cancellation is still returned; the caller owns it.
    pub async fn run_until_matched<P>(
        &self,
        self_id: &ClientId,
        excluded: &BTreeSet<ClientId>,
        cancel: &AtomicBool,
        mut progress: P,
    ) -> Result<Option<SessionRecord>, MatchError>
    where
        P: FnMut(MatchProgress) + Send,
    {
        while !cancel.load(Ordering::SeqCst) {
            let pause = match self.attempt_with(self_id, excluded, &mut progress).await? {
                AttemptOutcome::Matched(record) => return Ok(Some(record)),
                AttemptOutcome::NotQueued => {
                    debug!("[{}] no longer queued, matcher exits", self_id.short());
                    return Ok(None);
                }
                AttemptOutcome::NoCandidate | AttemptOutcome::ReservedByOther => {
                    self.settings.scan_interval
                }
                AttemptOutcome::Lost(reason) => {
                    debug!("[{}] {}, backing off", self_id.short(), reason);
                    self.contention_backoff()
                }
            };
            pause_unless_cancelled(pause, cancel).await;
        }
        Ok(None)
    }
}
