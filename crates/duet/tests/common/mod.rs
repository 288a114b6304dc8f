//! Shared helpers for duet integration tests

#![allow(dead_code)]

use duet::duet_core::{ClientId, MemoryConnection, MemoryRendezvous};
use duet::{
    check, ClientHandle, ClientSettings, LifecycleController, LifecycleState, LocalState,
    MockMediaNetwork, NegotiatorFactory,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

pub struct TestNet {
    pub store: MemoryRendezvous,
    pub network: MockMediaNetwork,
}

impl TestNet {
    pub fn new() -> Self {
        Self {
            store: MemoryRendezvous::new(),
            network: MockMediaNetwork::new(),
        }
    }

    pub async fn client(&self, id: &str) -> ClientHandle {
        self.client_with(LocalState::with_id(ClientId::new(id)), ClientSettings::fast())
            .await
    }

    pub async fn client_with(&self, local: LocalState, settings: ClientSettings) -> ClientHandle {
        let factory: Arc<dyn NegotiatorFactory> = Arc::new(self.network.clone());
        LifecycleController::start(Arc::new(self.store.connect()), factory, local.shared(), settings)
            .await
    }

    /// Start a client and hand back its store connection, so a test can
    /// cut it without stopping the client
    pub async fn client_with_connection(&self, id: &str) -> (ClientHandle, Arc<MemoryConnection>) {
        let conn = Arc::new(self.store.connect());
        let factory: Arc<dyn NegotiatorFactory> = Arc::new(self.network.clone());
        let local = LocalState::with_id(ClientId::new(id)).shared();
        let handle =
            LifecycleController::start(conn.clone(), factory, local, ClientSettings::fast()).await;
        (handle, conn)
    }

    /// Violations in the current store contents
    pub fn violations(&self) -> Vec<duet::Violation> {
        check(&self.store.snapshot())
    }

    pub fn room_count(&self) -> usize {
        self.store
            .keys_with_prefix("rooms/")
            .iter()
            .filter(|k| k.matches('/').count() == 1)
            .count()
    }
}

pub async fn connected(client: &ClientHandle) -> duet::ClientStatus {
    client
        .wait_for_state(LifecycleState::Connected, WAIT)
        .await
        .unwrap_or_else(|| panic!("{} never connected: {:?}", client.id(), client.status()))
}

/// Wait until both clients are connected to each other
pub async fn connected_pair(a: &ClientHandle, b: &ClientHandle) -> (duet::ClientStatus, duet::ClientStatus) {
    let status_a = a
        .wait_until(
            |s| s.state == LifecycleState::Connected && s.peer.as_ref() == Some(b.id()),
            WAIT,
        )
        .await
        .unwrap_or_else(|| panic!("{} never connected to {}: {:?}", a.id(), b.id(), a.status()));
    let status_b = b
        .wait_until(
            |s| s.state == LifecycleState::Connected && s.peer.as_ref() == Some(a.id()),
            WAIT,
        )
        .await
        .unwrap_or_else(|| panic!("{} never connected to {}: {:?}", b.id(), a.id(), b.status()));
    (status_a, status_b)
}

/// Receive transitions until `state` shows up
pub async fn wait_for_transition(
    rx: &mut broadcast::Receiver<LifecycleState>,
    state: LifecycleState,
) -> bool {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(s) if s == state => return true,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    };
    tokio::time::timeout(WAIT, wait).await.unwrap_or(false)
}
