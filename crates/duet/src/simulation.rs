//! In-process simulation of many clients
//!
//! Runs client actors against one in-memory store and mock media network,
//! with random skips and media failures, and checks the store invariants
//! while it runs and once everyone has stopped.

use duet_core::{MemoryRendezvous, MemoryStats};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::invariants::{check, check_strict, Violation};
use crate::lifecycle::{ClientHandle, ClientStats, LifecycleController, LifecycleState};
use crate::local_state::LocalState;
use crate::mock::MockMediaNetwork;
use crate::negotiation::NegotiatorFactory;
use crate::settings::ClientSettings;

/// Simulation configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub clients: usize,
    pub duration: Duration,
    /// Random seed for reproducibility
    pub seed: u64,
    /// Probability per tick that a connected client skips
    pub skip_rate: f64,
    /// Probability per tick that a connected client's media link fails
    pub fail_rate: f64,
    pub tick: Duration,
    /// Simulated store latency per operation
    pub store_latency: Duration,
    pub settings: ClientSettings,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            clients: 10,
            duration: Duration::from_secs(10),
            seed: 42,
            skip_rate: 0.05,
            fail_rate: 0.01,
            tick: Duration::from_millis(100),
            store_latency: Duration::from_millis(1),
            settings: ClientSettings::fast(),
        }
    }
}

/// Totals after a run
#[derive(Debug, Clone, Default)]
pub struct SimReport {
    pub clients: usize,
    /// Summed over all clients, so each session counts twice
    pub totals: ClientStats,
    pub store: MemoryStats,
    pub injected_skips: u64,
    pub injected_failures: u64,
    /// Violations seen while running that must never occur
    pub strict_violations: Vec<Violation>,
    /// Violations left after every client stopped
    pub final_violations: Vec<Violation>,
    /// Keys left in the store after every client stopped
    pub leftover_keys: usize,
}

impl SimReport {
    pub fn is_consistent(&self) -> bool {
        self.strict_violations.is_empty() && self.final_violations.is_empty()
    }
}

impl fmt::Display for SimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "clients:              {}", self.clients)?;
        writeln!(f, "sessions created:     {}", self.store.batches_applied)?;
        writeln!(f, "session joins:        {}", self.totals.sessions)?;
        writeln!(f, "connections:          {}", self.totals.connections)?;
        writeln!(f, "skips:                {}", self.totals.skips)?;
        writeln!(f, "failures:             {}", self.totals.failures)?;
        writeln!(f, "injected media drops: {}", self.injected_failures)?;
        writeln!(
            f,
            "reservations:         {} / {} compare-and-set committed",
            self.store.cas_commits, self.store.cas_attempts
        )?;
        writeln!(f, "leftover keys:        {}", self.leftover_keys)?;
        if self.is_consistent() {
            write!(f, "invariants:           ok")
        } else {
            write!(f, "invariants:           VIOLATED")?;
            for v in self.strict_violations.iter().chain(&self.final_violations) {
                write!(f, "\n  - {}", v)?;
            }
            Ok(())
        }
    }
}

pub async fn run_simulation(config: SimConfig) -> SimReport {
    let store = MemoryRendezvous::new();
    store.set_latency(config.store_latency);
    let network = MockMediaNetwork::new();
    let factory: Arc<dyn NegotiatorFactory> = Arc::new(network.clone());
    let mut rng = StdRng::seed_from_u64(config.seed);

    info!(
        "simulating {} clients for {:?} (seed {})",
        config.clients, config.duration, config.seed
    );

    let mut clients: Vec<ClientHandle> = Vec::with_capacity(config.clients);
    for _ in 0..config.clients {
        let handle = LifecycleController::start(
            Arc::new(store.connect()),
            factory.clone(),
            LocalState::in_memory().shared(),
            config.settings.clone(),
        )
        .await;
        clients.push(handle);
    }

    let mut report = SimReport {
        clients: config.clients,
        ..SimReport::default()
    };
    let deadline = Instant::now() + config.duration;
    while Instant::now() < deadline {
        tokio::time::sleep(config.tick).await;
        for client in &clients {
            let status = client.status();
            if status.state != LifecycleState::Connected {
                continue;
            }
            if rng.gen_bool(config.skip_rate.clamp(0.0, 1.0)) {
                debug!("[{}] simulated skip", client.id().short());
                client.skip();
                report.injected_skips += 1;
            } else if rng.gen_bool(config.fail_rate.clamp(0.0, 1.0)) {
                if let Some(session) = &status.session {
                    debug!("[{}] simulated media failure", client.id().short());
                    network.fail_session(session);
                    report.injected_failures += 1;
                }
            }
        }
        for v in check_strict(&store.snapshot()) {
            warn!("invariant violated: {}", v);
            report.strict_violations.push(v);
        }
    }

    for client in &clients {
        let stats = client.status().stats;
        report.totals.sessions += stats.sessions;
        report.totals.connections += stats.connections;
        report.totals.skips += stats.skips;
        report.totals.failures += stats.failures;
    }
    futures::future::join_all(clients.into_iter().map(ClientHandle::stop)).await;

    let snapshot = store.snapshot();
    report.final_violations = check(&snapshot);
    report.leftover_keys = snapshot.len();
    report.store = store.stats();
    report
}
