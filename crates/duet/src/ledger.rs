//! Feedback and trust ledger
//!
//! Likes and dislikes are keyed by (session, rater) so writing one never
//! conflicts with anybody. Report counters are shared between all raters
//! and are incremented with a compare-and-set loop. The block-list is local.

use duet_core::keys;
use duet_core::{
    from_value, now_ms, to_value, ClientId, FeedbackRecord, RendezvousStore, RendezvousStoreExt,
    SessionId, StoreError,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::local_state::SharedLocalState;

pub struct FeedbackLedger<S: RendezvousStore> {
    store: Arc<S>,
    local: SharedLocalState,
}

impl<S: RendezvousStore> FeedbackLedger<S> {
    pub fn new(store: Arc<S>, local: SharedLocalState) -> Self {
        Self { store, local }
    }

    /// Record a like or dislike. Rating the same session again overwrites.
    pub async fn record_feedback(
        &self,
        session: &SessionId,
        rater: &ClientId,
        liked: bool,
    ) -> Result<FeedbackRecord, StoreError> {
        let record = FeedbackRecord {
            session_id: session.clone(),
            rater_id: rater.clone(),
            liked,
            timestamp: now_ms(),
        };
        self.store
            .set_json(&keys::feedback(session, rater), &record)
            .await?;
        debug!("[{}] feedback on {}: liked={}", rater.short(), session, liked);
        Ok(record)
    }

    pub async fn feedback(
        &self,
        session: &SessionId,
        rater: &ClientId,
    ) -> Result<Option<FeedbackRecord>, StoreError> {
        self.store.get_json(&keys::feedback(session, rater)).await
    }

    /// Increment the report counter of `target`; returns the new count
    pub async fn report(&self, target: &ClientId) -> Result<u64, StoreError> {
        let key = keys::report(target);
        loop {
            let current = self.store.get(&key).await?;
            let count = match &current {
                Some(value) => from_value::<u64>(value.clone())?,
                None => 0,
            };
            let next = count + 1;
            if self
                .store
                .compare_and_set(&key, current.as_ref(), Some(to_value(&next)?))
                .await?
            {
                info!("reported {} ({} reports)", target.short(), next);
                return Ok(next);
            }
        }
    }

    pub async fn report_count(&self, target: &ClientId) -> Result<u64, StoreError> {
        Ok(self.store.get_json(&keys::report(target)).await?.unwrap_or(0))
    }

    /// Add to the local block-list, persisted immediately
    pub async fn add_to_block_list(&self, target: ClientId) -> anyhow::Result<bool> {
        self.local.write().await.block(target)
    }

    pub async fn blocked(&self) -> BTreeSet<ClientId> {
        self.local.read().await.blocked().clone()
    }
}
