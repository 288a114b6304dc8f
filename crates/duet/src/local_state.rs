//! Device identity and personal block-list
//!
//! Owned by the local client only; persisted as JSON so both survive restarts.

use anyhow::{Context, Result};
use duet_core::ClientId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Local state shared between a client's controller and its ledger
pub type SharedLocalState = Arc<RwLock<LocalState>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalState {
    #[serde(rename = "clientId")]
    client_id: ClientId,
    #[serde(default)]
    blocked: BTreeSet<ClientId>,
    /// Where to persist; `None` keeps everything in memory
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl LocalState {
    /// Load the state at `path`, generating and saving a new identity if missing
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let mut state: LocalState = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            state.path = Some(path.to_path_buf());
            debug!("loaded identity {} from {}", state.client_id, path.display());
            Ok(state)
        } else {
            let state = LocalState {
                client_id: ClientId::generate(),
                blocked: BTreeSet::new(),
                path: Some(path.to_path_buf()),
            };
            state.save()?;
            info!("created identity {}", state.client_id);
            Ok(state)
        }
    }

    /// Fresh identity that is never written to disk
    pub fn in_memory() -> Self {
        Self::with_id(ClientId::generate())
    }

    pub fn with_id(client_id: ClientId) -> Self {
        Self {
            client_id,
            blocked: BTreeSet::new(),
            path: None,
        }
    }

    pub fn shared(self) -> SharedLocalState {
        Arc::new(RwLock::new(self))
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn blocked(&self) -> &BTreeSet<ClientId> {
        &self.blocked
    }

    pub fn is_blocked(&self, id: &ClientId) -> bool {
        self.blocked.contains(id)
    }

    /// Add to the block-list and persist. Returns false if already blocked.
    pub fn block(&mut self, id: ClientId) -> Result<bool> {
        if id == self.client_id || !self.blocked.insert(id) {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Remove from the block-list and persist. Returns false if not blocked.
    pub fn unblock(&mut self, id: &ClientId) -> Result<bool> {
        if !self.blocked.remove(id) {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}
