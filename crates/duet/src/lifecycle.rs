//! Session lifecycle controller
//!
//! Each client runs as one actor task. Helper tasks (the matcher, the match
//! row watcher, the relay and requeue timers) post events into the actor's
//! queue tagged with the epoch they were started in. Every phase change bumps
//! the epoch, so events from an abandoned phase are dropped, except a session
//! created by an abandoned matcher, which is torn down.
//!
//! ```text
//! Idle -> Queued -> Reserving -> SessionActive -> Connected -> Ended -> Queued
//!                                      \
//!                                       -> MatchFailed -> (backoff) -> Queued
//! ```

use duet_core::keys;
use duet_core::{from_value, to_value, ClientId, RendezvousStore, Role, SessionId, SessionRecord};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::MatchError;
use crate::ledger::FeedbackLedger;
use crate::local_state::SharedLocalState;
use crate::matchmaker::{MatchProgress, Matchmaker};
use crate::negotiation::{Negotiator, NegotiatorFactory};
use crate::relay::{RelayEvent, RelayState, SignalingRelay};
use crate::settings::ClientSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Queued,
    Reserving,
    SessionActive,
    Connected,
    Ended,
    MatchFailed,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Queued => "queued",
            LifecycleState::Reserving => "reserving",
            LifecycleState::SessionActive => "session-active",
            LifecycleState::Connected => "connected",
            LifecycleState::Ended => "ended",
            LifecycleState::MatchFailed => "match-failed",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Counters over the lifetime of a client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub sessions: u64,
    pub connections: u64,
    pub skips: u64,
    pub failures: u64,
}

/// What the user sees
#[derive(Debug, Clone, PartialEq)]
pub struct ClientStatus {
    pub state: LifecycleState,
    pub message: String,
    pub session: Option<SessionId>,
    pub peer: Option<ClientId>,
    pub role: Option<Role>,
    pub stats: ClientStats,
}

impl ClientStatus {
    fn idle() -> Self {
        Self {
            state: LifecycleState::Idle,
            message: String::new(),
            session: None,
            peer: None,
            role: None,
            stats: ClientStats::default(),
        }
    }
}

enum Event {
    Skip,
    BlockPeer(oneshot::Sender<Option<ClientId>>),
    Rate {
        liked: bool,
        reply: oneshot::Sender<Result<Option<SessionId>, MatchError>>,
    },
    ReportPeer(oneshot::Sender<Result<Option<ClientId>, MatchError>>),
    Stop,
    Progress {
        epoch: u64,
        progress: MatchProgress,
    },
    MatcherFinished {
        epoch: u64,
        result: Result<Option<SessionRecord>, MatchError>,
    },
    MatchRow {
        epoch: u64,
        session: Option<SessionId>,
    },
    Relay {
        epoch: u64,
        event: RelayEvent,
    },
    Requeue {
        epoch: u64,
    },
    Failure {
        epoch: u64,
        error: MatchError,
    },
}

struct MatcherTask {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<Result<Option<SessionRecord>, MatchError>>,
}

enum Phase {
    Idle,
    Queued {
        watcher: JoinHandle<()>,
        cancel: Arc<AtomicBool>,
    },
    Active(ActiveSession),
    /// Waiting for a requeue timer
    Waiting,
    Stopped,
}

struct ActiveSession {
    record: SessionRecord,
    role: Role,
    negotiator: Arc<dyn Negotiator>,
    relay: JoinHandle<()>,
}

/// Delete a session's room and both match rows that still point to it
async fn teardown_session<S: RendezvousStore + ?Sized>(store: &S, record: &SessionRecord) {
    let sid = record.session_id.clone();
    if let Err(e) = store.set(&keys::room(&sid), None).await {
        warn!("[session {}] room removal failed: {}", sid, e);
    }
    let sid_value = match to_value(&sid) {
        Ok(v) => v,
        Err(e) => {
            warn!("[session {}] {}", sid, e);
            return;
        }
    };
    for id in [&record.initiator, &record.responder] {
        if let Err(e) = store
            .compare_and_set(&keys::match_row(id), Some(&sid_value), None)
            .await
        {
            warn!("[session {}] clearing match row of {} failed: {}", sid, id.short(), e);
        }
    }
    debug!("[session {}] torn down", sid);
}

pub struct LifecycleController<S: RendezvousStore + 'static> {
    id: ClientId,
    store: Arc<S>,
    matchmaker: Matchmaker<S>,
    factory: Arc<dyn NegotiatorFactory>,
    local: SharedLocalState,
    ledger: FeedbackLedger<S>,
    settings: ClientSettings,
    events: mpsc::UnboundedSender<Event>,
    status: watch::Sender<ClientStatus>,
    transitions: broadcast::Sender<LifecycleState>,
    epoch: u64,
    phase: Phase,
    matchers: HashMap<u64, MatcherTask>,
    /// Consecutive failures since the last connection
    failures: u32,
    requeue_pending: bool,
    /// Partners who left a session before it connected, not picked again
    /// until the deadline passes
    early_leavers: HashMap<ClientId, Instant>,
    /// The current session, or the most recent one once it ended
    last_session: Option<(SessionId, ClientId)>,
    stats: ClientStats,
}

impl<S: RendezvousStore + 'static> LifecycleController<S> {
    /// Spawn the client actor. It enters the queue right away.
    pub async fn start(
        store: Arc<S>,
        factory: Arc<dyn NegotiatorFactory>,
        local: SharedLocalState,
        settings: ClientSettings,
    ) -> ClientHandle {
        let id = local.read().await.client_id().clone();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ClientStatus::idle());
        let (transitions, _) = broadcast::channel(256);

        let controller = Self {
            id: id.clone(),
            matchmaker: Matchmaker::new(store.clone(), settings.clone()),
            ledger: FeedbackLedger::new(store.clone(), local.clone()),
            store,
            factory,
            local,
            settings,
            events: events_tx.clone(),
            status: status_tx,
            transitions: transitions.clone(),
            epoch: 0,
            phase: Phase::Idle,
            matchers: HashMap::new(),
            failures: 0,
            requeue_pending: false,
            early_leavers: HashMap::new(),
            last_session: None,
            stats: ClientStats::default(),
        };
        let task = tokio::spawn(controller.run(events_rx));

        ClientHandle {
            id,
            events: events_tx,
            status: status_rx,
            transitions,
            task: Some(task),
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        info!("[{}] client started", self.id.short());
        self.enter_queue().await;
        while !matches!(self.phase, Phase::Stopped) {
            let Some(event) = events.recv().await else {
                break;
            };
            self.handle(event).await;
        }
        self.shutdown().await;
        info!("[{}] client stopped", self.id.short());
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Skip => self.on_skip().await,
            Event::BlockPeer(reply) => {
                let peer = self.on_block_peer().await;
                let _ = reply.send(peer);
            }
            Event::Rate { liked, reply } => {
                let _ = reply.send(self.on_rate(liked).await);
            }
            Event::ReportPeer(reply) => {
                let _ = reply.send(self.on_report_peer().await);
            }
            Event::Stop => {
                self.release_phase().await;
                self.phase = Phase::Stopped;
                self.set_state(LifecycleState::Stopped, "Stopped");
            }
            Event::MatcherFinished { epoch, result } => {
                self.on_matcher_finished(epoch, result).await
            }
            Event::Progress { epoch, progress } if epoch == self.epoch => {
                self.on_progress(progress)
            }
            Event::MatchRow { epoch, session } if epoch == self.epoch => {
                self.on_match_row(session).await
            }
            Event::Relay { epoch, event } if epoch == self.epoch => {
                self.on_relay_event(event).await
            }
            Event::Requeue { epoch } if epoch == self.epoch => {
                self.requeue_pending = false;
                self.enter_queue().await;
            }
            Event::Failure { epoch, error } if epoch == self.epoch => self.fail(error).await,
            _ => debug!("[{}] dropping stale event", self.id.short()),
        }
    }

    fn set_state(&mut self, state: LifecycleState, message: impl Into<String>) {
        let message = message.into();
        let (session, peer, role) = match &self.phase {
            Phase::Active(active) => (
                Some(active.record.session_id.clone()),
                active.record.peer_of(&self.id).cloned(),
                Some(active.role),
            ),
            _ => (None, None, None),
        };
        let previous = self.status.borrow().state;
        if previous != state {
            info!("[{}] {} -> {}: {}", self.id.short(), previous, state, message);
        }
        self.status.send_replace(ClientStatus {
            state,
            message,
            session,
            peer,
            role,
            stats: self.stats.clone(),
        });
        let _ = self.transitions.send(state);
    }

    fn current_state(&self) -> LifecycleState {
        self.status.borrow().state
    }

    /// Tear down whatever the current phase holds and go back to `Idle`
    async fn release_phase(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Queued { watcher, cancel } => {
                watcher.abort();
                cancel.store(true, Ordering::SeqCst);
                if let Err(e) = self.matchmaker.queue().leave(&self.id).await {
                    debug!("[{}] leaving queue failed: {}", self.id.short(), e);
                }
            }
            Phase::Active(active) => self.end_session(active).await,
            Phase::Stopped => self.phase = Phase::Stopped,
            Phase::Idle | Phase::Waiting => {}
        }
    }

    fn schedule_requeue(&mut self, delay: Duration) {
        self.epoch += 1;
        let epoch = self.epoch;
        self.phase = Phase::Waiting;
        self.requeue_pending = true;
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::Requeue { epoch });
        });
    }

    /// Remove a match row left over from an earlier session, and that
    /// session's room if it still exists
    async fn clear_stale_match_row(&self) -> Result<(), MatchError> {
        let key = keys::match_row(&self.id);
        let Some(value) = self.store.get(&key).await? else {
            return Ok(());
        };
        if let Ok(sid) = from_value::<SessionId>(value.clone()) {
            if let Some(room) = self.store.get(&keys::room(&sid)).await? {
                if let Ok(record) = from_value::<SessionRecord>(room) {
                    warn!("[{}] abandoning stale session {}", self.id.short(), sid);
                    teardown_session(self.store.as_ref(), &record).await;
                }
            }
        }
        self.store.compare_and_set(&key, Some(&value), None).await?;
        Ok(())
    }

    async fn enter_queue(&mut self) {
        self.release_phase().await;
        self.epoch += 1;
        let epoch = self.epoch;

        if let Err(e) = self.clear_stale_match_row().await {
            self.fail(e).await;
            return;
        }
        if let Err(e) = self.matchmaker.queue().enter(&self.id).await {
            self.fail(e.into()).await;
            return;
        }

        let watcher = self.spawn_match_row_watcher(epoch);
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = self.spawn_matcher(epoch, cancel.clone()).await;
        self.matchers.insert(
            epoch,
            MatcherTask {
                cancel: cancel.clone(),
                handle,
            },
        );
        self.phase = Phase::Queued { watcher, cancel };
        self.set_state(LifecycleState::Queued, "Looking for a partner");
    }

    /// Report every value of the own match row; a new row means another
    /// client paired with this one
    fn spawn_match_row_watcher(&self, epoch: u64) -> JoinHandle<()> {
        let store = self.store.clone();
        let events = self.events.clone();
        let key = keys::match_row(&self.id);
        tokio::spawn(async move {
            let mut rows = match store.watch_value(&key).await {
                Ok(rows) => rows,
                Err(e) => {
                    let _ = events.send(Event::Failure {
                        epoch,
                        error: e.into(),
                    });
                    return;
                }
            };
            while let Some(value) = rows.next().await {
                let session = value.and_then(|v| from_value::<SessionId>(v).ok());
                if events.send(Event::MatchRow { epoch, session }).is_err() {
                    break;
                }
            }
        })
    }

    async fn spawn_matcher(
        &mut self,
        epoch: u64,
        cancel: Arc<AtomicBool>,
    ) -> JoinHandle<Result<Option<SessionRecord>, MatchError>> {
        let matchmaker = self.matchmaker.clone();
        let id = self.id.clone();
        let excluded = self.excluded_partners().await;
        let events = self.events.clone();
        tokio::spawn(async move {
            let progress_events = events.clone();
            let result = matchmaker
                .run_until_matched(&id, &excluded, &cancel, move |progress| {
                    let _ = progress_events.send(Event::Progress { epoch, progress });
                })
                .await;
            let _ = events.send(Event::MatcherFinished {
                epoch,
                result: result.clone(),
            });
            result
        })
    }

    /// Block-list plus partners still cooling down after leaving early
    async fn excluded_partners(&mut self) -> BTreeSet<ClientId> {
        let now = Instant::now();
        self.early_leavers.retain(|_, until| *until > now);
        let mut excluded = self.local.read().await.blocked().clone();
        excluded.extend(self.early_leavers.keys().cloned());
        excluded
    }

    fn on_progress(&mut self, progress: MatchProgress) {
        if !matches!(self.phase, Phase::Queued { .. }) {
            return;
        }
        match progress {
            MatchProgress::Reserving(candidate) => {
                debug!("[{}] reserving {}", self.id.short(), candidate.short());
                self.set_state(LifecycleState::Reserving, "Reserving a partner");
            }
            MatchProgress::Searching => {
                self.set_state(LifecycleState::Queued, "Looking for a partner")
            }
        }
    }

    async fn on_matcher_finished(
        &mut self,
        epoch: u64,
        result: Result<Option<SessionRecord>, MatchError>,
    ) {
        self.matchers.remove(&epoch);
        if epoch != self.epoch || !matches!(self.phase, Phase::Queued { .. }) {
            // The client moved on while this matcher was committing
            if let Ok(Some(record)) = result {
                warn!(
                    "[{}] abandoning session {} from a cancelled match",
                    self.id.short(),
                    record.session_id
                );
                teardown_session(self.store.as_ref(), &record).await;
            }
            return;
        }
        match result {
            Ok(Some(record)) => self.begin_session(record, Role::Initiator).await,
            Ok(None) => match self.store.get(&keys::match_row(&self.id)).await {
                // Paired by someone else; the watcher delivers the row
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!("[{}] queue entry vanished, re-entering", self.id.short());
                    self.release_phase().await;
                    self.schedule_requeue(self.settings.scan_interval);
                }
                Err(e) => self.fail(e.into()).await,
            },
            Err(e) => self.fail(e).await,
        }
    }

    async fn on_match_row(&mut self, session: Option<SessionId>) {
        let Some(sid) = session else {
            return;
        };
        if !matches!(self.phase, Phase::Queued { .. }) {
            return;
        }
        let room = match self.store.get(&keys::room(&sid)).await {
            Ok(room) => room,
            Err(e) => {
                self.fail(e.into()).await;
                return;
            }
        };
        let record = match room.map(from_value::<SessionRecord>) {
            Some(Ok(record)) => record,
            Some(Err(e)) => {
                warn!("[{}] unreadable room {}: {}", self.id.short(), sid, e);
                return;
            }
            None => {
                info!("[{}] session {} closed before it started", self.id.short(), sid);
                self.release_phase().await;
                self.set_state(LifecycleState::Ended, "Partner left");
                self.schedule_requeue(self.settings.skip_delay);
                return;
            }
        };
        match record.role_of(&self.id) {
            Some(Role::Responder) => {
                let peer = record.initiator.clone();
                if self.local.read().await.is_blocked(&peer) {
                    info!(
                        "[{}] declining session with blocked {}",
                        self.id.short(),
                        peer.short()
                    );
                    teardown_session(self.store.as_ref(), &record).await;
                    self.release_phase().await;
                    self.set_state(LifecycleState::Ended, "Declined a blocked partner");
                    self.schedule_requeue(self.settings.skip_delay);
                    return;
                }
                self.begin_session(record, Role::Responder).await
            }
            // Our own matcher wrote it and reports it separately
            Some(Role::Initiator) => {}
            None => warn!(
                "[{}] match row points at foreign session {}",
                self.id.short(),
                sid
            ),
        }
    }

    fn session_rule_keys(&self, sid: &SessionId) -> [String; 2] {
        [keys::match_row(&self.id), keys::room(sid)]
    }

    async fn begin_session(&mut self, record: SessionRecord, role: Role) {
        self.release_phase().await;
        self.epoch += 1;
        let epoch = self.epoch;
        let sid = record.session_id.clone();
        info!(
            "[{}] session {} as {} with {}",
            self.id.short(),
            sid,
            role,
            record.peer_of(&self.id).map(|p| p.short()).unwrap_or("?")
        );

        for key in self.session_rule_keys(&sid) {
            if let Err(e) = self.store.on_disconnect_remove(&key).await {
                warn!("[{}] cleanup rule for {} failed: {}", self.id.short(), key, e);
            }
        }

        let negotiator = match self.factory.open(&sid).await {
            Ok(negotiator) => negotiator,
            Err(e) => {
                teardown_session(self.store.as_ref(), &record).await;
                self.drop_session_rules(&sid).await;
                self.fail(e.into()).await;
                return;
            }
        };

        let relay = SignalingRelay::new(
            self.store.clone(),
            negotiator.clone(),
            record.clone(),
            role,
            self.settings.relay_timeouts(),
        );
        let events = self.events.clone();
        let relay = tokio::spawn(relay.run(move |event| {
            let _ = events.send(Event::Relay { epoch, event });
        }));

        self.stats.sessions += 1;
        if let Some(peer) = record.peer_of(&self.id) {
            self.last_session = Some((sid.clone(), peer.clone()));
        }
        self.phase = Phase::Active(ActiveSession {
            record,
            role,
            negotiator,
            relay,
        });
        self.set_state(LifecycleState::SessionActive, "Partner found, connecting");
    }

    async fn drop_session_rules(&self, sid: &SessionId) {
        for key in self.session_rule_keys(sid) {
            if let Err(e) = self.store.cancel_on_disconnect(&key).await {
                debug!("[{}] cancelling rule for {} failed: {}", self.id.short(), key, e);
            }
        }
    }

    async fn end_session(&mut self, active: ActiveSession) {
        active.relay.abort();
        // Records first, so the peer sees the room vanish before the media drops
        teardown_session(self.store.as_ref(), &active.record).await;
        active.negotiator.close().await;
        self.drop_session_rules(&active.record.session_id).await;
    }

    async fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::StateChanged(RelayState::Established) => {
                if self.current_state() != LifecycleState::Connected {
                    self.failures = 0;
                    self.stats.connections += 1;
                    self.set_state(LifecycleState::Connected, "Connected");
                }
            }
            RelayEvent::StateChanged(state) => {
                debug!("[{}] relay {}", self.id.short(), state);
            }
            RelayEvent::SessionClosed => {
                // Partners who leave before the link is up (a decline looks
                // the same) are not picked again for a while
                if self.current_state() != LifecycleState::Connected {
                    if let Phase::Active(active) = &self.phase {
                        if let Some(peer) = active.record.peer_of(&self.id).cloned() {
                            debug!(
                                "[{}] {} left before connecting, cooling down",
                                self.id.short(),
                                peer.short()
                            );
                            let until = Instant::now() + self.settings.early_leave_cooldown;
                            self.early_leavers.insert(peer, until);
                        }
                    }
                }
                self.release_phase().await;
                self.set_state(LifecycleState::Ended, "Partner left");
                self.schedule_requeue(self.settings.skip_delay);
            }
            RelayEvent::Failed(error) => self.fail(error).await,
        }
    }

    /// Convert an error into a state transition: backoff and requeue, or
    /// stop for good when retrying cannot help
    async fn fail(&mut self, error: MatchError) {
        self.release_phase().await;
        if !error.is_transient() {
            error!("[{}] {}", self.id.short(), error);
            self.epoch += 1;
            self.phase = Phase::Stopped;
            self.set_state(LifecycleState::Stopped, error.status_message());
            return;
        }
        self.failures += 1;
        self.stats.failures += 1;
        let delay = self.settings.failure_backoff_for(self.failures);
        warn!("[{}] {}, requeue in {:?}", self.id.short(), error, delay);
        self.set_state(LifecycleState::MatchFailed, error.status_message());
        self.schedule_requeue(delay);
    }

    async fn on_skip(&mut self) {
        if self.requeue_pending {
            debug!("[{}] skip coalesced", self.id.short());
            return;
        }
        if !matches!(self.phase, Phase::Queued { .. } | Phase::Active(_)) {
            return;
        }
        self.stats.skips += 1;
        self.release_phase().await;
        self.set_state(LifecycleState::Ended, "Skipped");
        self.schedule_requeue(self.settings.skip_delay);
    }

    async fn on_block_peer(&mut self) -> Option<ClientId> {
        let peer = match &self.phase {
            Phase::Active(active) => active.record.peer_of(&self.id).cloned(),
            _ => None,
        }?;
        if let Err(e) = self.ledger.add_to_block_list(peer.clone()).await {
            warn!("[{}] saving block-list failed: {:#}", self.id.short(), e);
        }
        info!("[{}] blocked {}", self.id.short(), peer.short());
        self.on_skip().await;
        Some(peer)
    }

    async fn on_rate(&self, liked: bool) -> Result<Option<SessionId>, MatchError> {
        let Some((session, _)) = &self.last_session else {
            return Ok(None);
        };
        self.ledger.record_feedback(session, &self.id, liked).await?;
        Ok(Some(session.clone()))
    }

    /// Report the current or last partner, block them and leave them if
    /// still connected
    async fn on_report_peer(&mut self) -> Result<Option<ClientId>, MatchError> {
        let Some((session, peer)) = self.last_session.clone() else {
            return Ok(None);
        };
        self.ledger.report(&peer).await?;
        self.ledger
            .add_to_block_list(peer.clone())
            .await
            .map_err(|e| MatchError::LocalState(format!("{:#}", e)))?;
        let current = matches!(
            &self.phase,
            Phase::Active(active) if active.record.session_id == session
        );
        if current {
            self.on_skip().await;
        }
        Ok(Some(peer))
    }

    async fn shutdown(&mut self) {
        self.release_phase().await;
        self.epoch += 1;
        let matchers: Vec<MatcherTask> = self.matchers.drain().map(|(_, task)| task).collect();
        for task in matchers {
            task.cancel.store(true, Ordering::SeqCst);
            if let Ok(Ok(Some(record))) = task.handle.await {
                teardown_session(self.store.as_ref(), &record).await;
            }
        }
        self.phase = Phase::Stopped;
        if self.current_state() != LifecycleState::Stopped {
            self.set_state(LifecycleState::Stopped, "Stopped");
        }
    }
}

/// Handle to a running client actor
pub struct ClientHandle {
    id: ClientId,
    events: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<ClientStatus>,
    transitions: broadcast::Sender<LifecycleState>,
    task: Option<JoinHandle<()>>,
}

impl ClientHandle {
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Leave the current partner (or the queue) and look again shortly.
    /// Rapid repeated skips collapse into one.
    pub fn skip(&self) {
        let _ = self.events.send(Event::Skip);
    }

    /// Block the current partner and skip. Returns the blocked id.
    pub async fn block_current_peer(&self) -> Option<ClientId> {
        let (tx, rx) = oneshot::channel();
        if self.events.send(Event::BlockPeer(tx)).is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Like or dislike the current session, or the last one after it
    /// ended. Returns the rated session, `None` before the first session.
    pub async fn rate(&self, liked: bool) -> Result<Option<SessionId>, MatchError> {
        let (reply, rx) = oneshot::channel();
        if self.events.send(Event::Rate { liked, reply }).is_err() {
            return Ok(None);
        }
        rx.await.unwrap_or(Ok(None))
    }

    /// Report the current or last partner. The partner is also blocked,
    /// and left if still connected.
    pub async fn report_peer(&self) -> Result<Option<ClientId>, MatchError> {
        let (tx, rx) = oneshot::channel();
        if self.events.send(Event::ReportPeer(tx)).is_err() {
            return Ok(None);
        }
        rx.await.unwrap_or(Ok(None))
    }

    pub fn status(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientStatus> {
        self.status.clone()
    }

    /// Every state the client enters from now on, in order
    pub fn transitions(&self) -> broadcast::Receiver<LifecycleState> {
        self.transitions.subscribe()
    }

    /// Wait until the status satisfies `predicate`, or give up after `timeout`
    pub async fn wait_until<F>(&self, predicate: F, timeout: Duration) -> Option<ClientStatus>
    where
        F: Fn(&ClientStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let wait = async move {
            loop {
                {
                    let status = rx.borrow_and_update();
                    if predicate(&status) {
                        return Some(status.clone());
                    }
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    pub async fn wait_for_state(
        &self,
        state: LifecycleState,
        timeout: Duration,
    ) -> Option<ClientStatus> {
        self.wait_until(|s| s.state == state, timeout).await
    }

    /// Leave the queue or session, then wait for the actor to finish
    pub async fn stop(mut self) {
        let _ = self.events.send(Event::Stop);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.events.send(Event::Stop);
        }
    }
}
