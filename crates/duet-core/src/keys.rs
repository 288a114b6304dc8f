//! Key layout in the rendezvous store
//!
//! ```text
//! queue/{clientId}                                  QueueEntry
//! matches/{clientId}                                sessionId
//! rooms/{sessionId}                                 SessionRecord
//! rooms/{sessionId}/offer                           SignalingPayload
//! rooms/{sessionId}/answer                          SignalingPayload
//! rooms/{sessionId}/candidates/{role}/{seq}         SignalingPayload
//! feedback/{sessionId}/{raterId}                    FeedbackRecord
//! reports/{targetId}                                integer
//! ```

use crate::types::{ClientId, Role, SessionId};

pub const QUEUE: &str = "queue";
pub const MATCHES: &str = "matches";
pub const ROOMS: &str = "rooms";
pub const FEEDBACK: &str = "feedback";
pub const REPORTS: &str = "reports";

pub fn queue_entry(id: &ClientId) -> String {
    format!("{}/{}", QUEUE, id)
}

pub fn match_row(id: &ClientId) -> String {
    format!("{}/{}", MATCHES, id)
}

pub fn room(session: &SessionId) -> String {
    format!("{}/{}", ROOMS, session)
}

pub fn offer(session: &SessionId) -> String {
    format!("{}/{}/offer", ROOMS, session)
}

pub fn answer(session: &SessionId) -> String {
    format!("{}/{}/answer", ROOMS, session)
}

/// Prefix under which `role` appends its reachability candidates
pub fn candidates(session: &SessionId, role: Role) -> String {
    format!("{}/{}/candidates/{}", ROOMS, session, role.as_str())
}

/// Zero-padded so that key order equals append order
pub fn candidate(session: &SessionId, role: Role, seq: u64) -> String {
    format!("{}/{:010}", candidates(session, role), seq)
}

pub fn feedback(session: &SessionId, rater: &ClientId) -> String {
    format!("{}/{}/{}", FEEDBACK, session, rater)
}

pub fn report(target: &ClientId) -> String {
    format!("{}/{}", REPORTS, target)
}

/// Last path segment of a key
pub fn leaf(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_keys_sort_in_append_order() {
        let s = SessionId::new("s");
        let k9 = candidate(&s, Role::Initiator, 9);
        let k10 = candidate(&s, Role::Initiator, 10);
        assert!(k9 < k10);
        assert!(k10.starts_with(&candidates(&s, Role::Initiator)));
        assert_eq!(leaf(&k10), "0000000010");
    }

    #[test]
    fn test_signaling_keys_nest_under_room() {
        let s = SessionId::new("abc");
        let room = room(&s);
        assert!(offer(&s).starts_with(&format!("{}/", room)));
        assert!(answer(&s).starts_with(&format!("{}/", room)));
        assert!(candidates(&s, Role::Responder).starts_with(&format!("{}/", room)));
    }
}
