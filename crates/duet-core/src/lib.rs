//! Core types for duet
//!
//! Identifiers and records shared by every client, the `RendezvousStore`
//! trait that all cross-client coordination goes through, and an in-memory
//! store used by tests and simulations.
//!
//! # Overview
//!
//! - **Data model**: queue entries, reservations, sessions, feedback
//! - **Key schema**: where each record lives in the shared store
//! - **Store**: get/set, compare-and-set, atomic batch writes, watches and
//!   on-disconnect cleanup rules

pub mod keys;
pub mod memory;
pub mod store;
pub mod types;

pub use memory::{MemoryConnection, MemoryRendezvous, MemoryStats};
pub use store::{
    from_value, to_value, BatchUpdate, ChildAdded, RendezvousStore, RendezvousStoreExt,
    StoreError, Subscription, Value,
};
pub use types::{
    now_ms, ClientId, FeedbackRecord, QueueEntry, Reservation, Role, SessionId, SessionRecord,
    SignalingPayload,
};
