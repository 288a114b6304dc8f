//! Records exchanged through the rendezvous store
//!
//! Field names are camelCase on the wire so that clients written against
//! the same store layout in other languages read the same documents.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Stable anonymous identifier of a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id: random suffix plus creation timestamp.
    pub fn generate() -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        Self(format!("{}-{}", suffix.to_lowercase(), now_ms()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a session (room)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque blob produced or consumed by the negotiation primitive.
///
/// Offers, answers and reachability candidates are all relayed as-is;
/// nothing in duet looks inside them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalingPayload(String);

impl SignalingPayload {
    pub fn new(payload: impl Into<String>) -> Self {
        Self(payload.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// Claim placed on a queue entry by the client trying to pair with it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub by: ClientId,
    #[serde(rename = "at")]
    pub at_ms: u64,
}

impl Reservation {
    pub fn new(by: ClientId) -> Self {
        Self { by, at_ms: now_ms() }
    }

    /// A reservation older than the lease no longer blocks other reservers.
    pub fn is_expired(&self, now_ms: u64, lease_ms: u64) -> bool {
        now_ms.saturating_sub(self.at_ms) >= lease_ms
    }
}

/// A client waiting to be paired
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    #[serde(rename = "clientId")]
    pub client_id: ClientId,
    #[serde(rename = "enqueuedAt")]
    pub enqueued_at: u64,
    #[serde(rename = "reservedBy", default, skip_serializing_if = "Option::is_none")]
    pub reserved_by: Option<Reservation>,
}

impl QueueEntry {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            enqueued_at: now_ms(),
            reserved_by: None,
        }
    }

    /// Whether `reserver` may claim this entry at `now_ms`.
    ///
    /// Free entries and entries whose reservation lease ran out are claimable.
    /// An entry already held by `reserver` is not: reservations are not re-entrant.
    pub fn is_claimable(&self, now_ms: u64, lease_ms: u64) -> bool {
        match &self.reserved_by {
            None => true,
            Some(r) => r.is_expired(now_ms, lease_ms),
        }
    }

    pub fn is_reserved_by(&self, id: &ClientId) -> bool {
        self.reserved_by.as_ref().map(|r| &r.by == id).unwrap_or(false)
    }
}

/// Role of a participant, fixed when the session is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }

    pub fn peer(&self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session (room) metadata. Signaling fields live under the room key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    pub initiator: ClientId,
    pub responder: ClientId,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
}

impl SessionRecord {
    pub fn new(session_id: SessionId, initiator: ClientId, responder: ClientId) -> Self {
        Self {
            session_id,
            initiator,
            responder,
            created_at: now_ms(),
        }
    }

    pub fn role_of(&self, id: &ClientId) -> Option<Role> {
        if &self.initiator == id {
            Some(Role::Initiator)
        } else if &self.responder == id {
            Some(Role::Responder)
        } else {
            None
        }
    }

    pub fn peer_of(&self, id: &ClientId) -> Option<&ClientId> {
        match self.role_of(id)? {
            Role::Initiator => Some(&self.responder),
            Role::Responder => Some(&self.initiator),
        }
    }
}

/// Like/dislike left by one participant about a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    #[serde(rename = "raterId")]
    pub rater_id: ClientId,
    pub liked: bool,
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_client_ids_differ() {
        let a = ClientId::generate();
        let b = ClientId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().contains('-'));
        assert_eq!(a.short().len(), 8);
    }

    #[test]
    fn test_queue_entry_wire_format() {
        let mut entry = QueueEntry::new(ClientId::new("alice"));
        entry.enqueued_at = 10;
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json, serde_json::json!({"clientId": "alice", "enqueuedAt": 10}));

        entry.reserved_by = Some(Reservation {
            by: ClientId::new("bob"),
            at_ms: 20,
        });
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["reservedBy"], serde_json::json!({"by": "bob", "at": 20}));
    }

    #[test]
    fn test_reservation_lease() {
        let mut entry = QueueEntry::new(ClientId::new("alice"));
        assert!(entry.is_claimable(1_000, 500));

        entry.reserved_by = Some(Reservation {
            by: ClientId::new("bob"),
            at_ms: 1_000,
        });
        assert!(!entry.is_claimable(1_200, 500));
        assert!(entry.is_claimable(1_500, 500));
        assert!(entry.is_reserved_by(&ClientId::new("bob")));
        assert!(!entry.is_reserved_by(&ClientId::new("carol")));
    }

    #[test]
    fn test_session_roles() {
        let record = SessionRecord::new(
            SessionId::new("s1"),
            ClientId::new("a"),
            ClientId::new("b"),
        );
        assert_eq!(record.role_of(&ClientId::new("a")), Some(Role::Initiator));
        assert_eq!(record.role_of(&ClientId::new("b")), Some(Role::Responder));
        assert_eq!(record.role_of(&ClientId::new("c")), None);
        assert_eq!(record.peer_of(&ClientId::new("b")), Some(&ClientId::new("a")));
        assert_eq!(Role::Initiator.peer(), Role::Responder);
    }
}
