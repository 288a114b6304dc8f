//! duet - anonymous one-on-one session pairing
//!
//! Clients coordinate only through a shared [`RendezvousStore`]:
//!
//! - **Presence queue**: who is waiting, with automatic eviction on disconnect
//! - **Matchmaker**: picks a partner, reserves it with compare-and-set and
//!   creates the session in one atomic batch
//! - **Signaling relay**: carries offer, answer and candidates between the pair
//! - **Lifecycle controller**: one actor per client driving
//!   queue -> match -> connect -> teardown -> queue
//! - **Feedback ledger**: likes, report counters and the local block-list
//!
//! Media negotiation itself is behind the [`Negotiator`] trait; an in-memory
//! [`MockMediaNetwork`] stands in for it in tests and simulations.
//!
//! [`RendezvousStore`]: duet_core::RendezvousStore

pub mod error;
pub mod invariants;
pub mod ledger;
pub mod lifecycle;
pub mod local_state;
pub mod matchmaker;
pub mod mock;
pub mod negotiation;
pub mod presence;
pub mod relay;
pub mod settings;
pub mod simulation;

pub use error::MatchError;
pub use invariants::{check, check_strict, Violation};
pub use ledger::FeedbackLedger;
pub use lifecycle::{ClientHandle, ClientStats, ClientStatus, LifecycleController, LifecycleState};
pub use local_state::{LocalState, SharedLocalState};
pub use matchmaker::{AttemptOutcome, MatchProgress, Matchmaker, ReserveOutcome};
pub use mock::{MockMediaNetwork, MockNegotiator};
pub use negotiation::{ConnectionState, NegotiationError, Negotiator, NegotiatorFactory};
pub use presence::PresenceQueue;
pub use relay::{RelayEvent, RelayState, RelayTimeouts, SignalingRelay};
pub use settings::ClientSettings;
pub use simulation::{run_simulation, SimConfig, SimReport};

pub use duet_core;
