//! Consistency checks over a snapshot of the rendezvous store
//!
//! A match row exists only for members of a live room, both members of a
//! room point at it, and nobody is queued and matched at once. The first
//! two only hold once teardowns have settled; the last one must hold at
//! every instant.

use duet_core::keys;
use duet_core::{from_value, ClientId, SessionId, SessionRecord, Value};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Client has both a queue entry and a match row
    QueuedAndMatched(ClientId),
    /// Match row points at a room that does not exist
    DanglingMatch { client: ClientId, session: SessionId },
    /// Match row points at a room the client is not a member of
    ForeignMatch { client: ClientId, session: SessionId },
    /// A room member has no match row pointing at the room
    HalfMatchedRoom { session: SessionId, member: ClientId },
    /// A record that does not parse
    Unreadable(String),
}

impl Violation {
    /// Whether the violation can legitimately show up while a teardown is in flight
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Violation::DanglingMatch { .. } | Violation::HalfMatchedRoom { .. }
        )
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::QueuedAndMatched(c) => write!(f, "{} is queued and matched", c),
            Violation::DanglingMatch { client, session } => {
                write!(f, "{} matched to missing room {}", client, session)
            }
            Violation::ForeignMatch { client, session } => {
                write!(f, "{} matched to room {} without being a member", client, session)
            }
            Violation::HalfMatchedRoom { session, member } => {
                write!(f, "room {} member {} has no match row", session, member)
            }
            Violation::Unreadable(key) => write!(f, "unreadable record at {}", key),
        }
    }
}

/// Direct children of `prefix` in a flat snapshot, keyed by leaf name
fn children<'a>(
    snapshot: &'a BTreeMap<String, Value>,
    prefix: &str,
) -> impl Iterator<Item = (&'a str, &'a String, &'a Value)> + 'a {
    let prefix = format!("{}/", prefix);
    snapshot
        .range(prefix.clone()..)
        .take_while(move |(k, _)| k.starts_with(&prefix))
        .filter(|(k, _)| k.matches('/').count() == 1)
        .map(|(k, v)| (keys::leaf(k), k, v))
}

/// Every violation present in `snapshot`
pub fn check(snapshot: &BTreeMap<String, Value>) -> Vec<Violation> {
    let mut violations = Vec::new();

    let mut rooms = BTreeMap::new();
    for (_, key, value) in children(snapshot, keys::ROOMS) {
        match from_value::<SessionRecord>(value.clone()) {
            Ok(record) => {
                rooms.insert(record.session_id.clone(), record);
            }
            Err(_) => violations.push(Violation::Unreadable(key.clone())),
        }
    }

    let mut matches = BTreeMap::new();
    for (client, key, value) in children(snapshot, keys::MATCHES) {
        let client = ClientId::new(client);
        let session = match from_value::<SessionId>(value.clone()) {
            Ok(session) => session,
            Err(_) => {
                violations.push(Violation::Unreadable(key.clone()));
                continue;
            }
        };
        if snapshot.contains_key(&keys::queue_entry(&client)) {
            violations.push(Violation::QueuedAndMatched(client.clone()));
        }
        match rooms.get(&session) {
            None => violations.push(Violation::DanglingMatch {
                client: client.clone(),
                session: session.clone(),
            }),
            Some(record) if record.role_of(&client).is_none() => {
                violations.push(Violation::ForeignMatch {
                    client: client.clone(),
                    session: session.clone(),
                })
            }
            Some(_) => {}
        }
        matches.insert(client, session);
    }

    for (session, record) in &rooms {
        for member in [&record.initiator, &record.responder] {
            if matches.get(member) != Some(session) {
                violations.push(Violation::HalfMatchedRoom {
                    session: session.clone(),
                    member: member.clone(),
                });
            }
        }
    }

    violations
}

/// Violations that must never be observed, even mid-teardown
pub fn check_strict(snapshot: &BTreeMap<String, Value>) -> Vec<Violation> {
    check(snapshot)
        .into_iter()
        .filter(|v| !v.is_transient())
        .collect()
}
