//! Reservation and session creation under contention
//!
//! - At most one of N concurrent reservers wins a candidate
//! - find_partner never returns self or a blocked id
//! - Two clients matching each other at once create exactly one session
//! - A reservation stranded by a store fault lapses with its lease

use duet::duet_core::{ClientId, MemoryConnection, MemoryRendezvous, QueueEntry};
use duet::{AttemptOutcome, ClientSettings, MatchError, Matchmaker, PresenceQueue, ReserveOutcome};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn matchmaker(store: &MemoryRendezvous, settings: ClientSettings) -> Matchmaker<MemoryConnection> {
    Matchmaker::new(Arc::new(store.connect()), settings)
}

/// Enter the queue on a connection that stays open for the test's duration
async fn enqueue(store: &MemoryRendezvous, id: &str) -> Arc<MemoryConnection> {
    let conn = Arc::new(store.connect());
    PresenceQueue::new(conn.clone())
        .enter(&ClientId::new(id))
        .await
        .unwrap();
    conn
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Exactly one concurrent reserver observes Reserved, the others Lost
    #[test]
    fn prop_single_reservation_wins(reservers in 2usize..24, latency_us in 0u64..500) {
        let rt = runtime();
        let winners = rt.block_on(async move {
            let store = MemoryRendezvous::new();
            let _target = enqueue(&store, "target").await;
            store.set_latency(Duration::from_micros(latency_us));

            let tasks: Vec<_> = (0..reservers)
                .map(|i| {
                    let mm = matchmaker(&store, ClientSettings::fast());
                    tokio::spawn(async move {
                        mm.reserve(&ClientId::new(format!("r{}", i)), &ClientId::new("target"))
                            .await
                            .unwrap()
                    })
                })
                .collect();
            let outcomes = futures::future::join_all(tasks).await;
            outcomes
                .into_iter()
                .map(|o| o.unwrap())
                .filter(|o| *o == ReserveOutcome::Reserved)
                .count()
        });
        prop_assert_eq!(winners, 1);
    }

    /// Blocked ids and self are never offered as partners
    #[test]
    fn prop_find_partner_respects_block_list(
        queued in prop::collection::btree_set(0u8..20, 0..12),
        blocked in prop::collection::btree_set(0u8..20, 0..12),
        me in 0u8..20,
    ) {
        let rt = runtime();
        let found = rt.block_on(async {
            let store = MemoryRendezvous::new();
            let mut conns = Vec::new();
            for q in &queued {
                conns.push(enqueue(&store, &format!("c{:02}", q)).await);
            }
            let excluded: BTreeSet<ClientId> =
                blocked.iter().map(|b| ClientId::new(format!("c{:02}", b))).collect();
            let mm = matchmaker(&store, ClientSettings::fast());
            mm.find_partner(&ClientId::new(format!("c{:02}", me)), &excluded)
                .await
                .unwrap()
        });

        let me_id = ClientId::new(format!("c{:02}", me));
        let eligible: Vec<ClientId> = queued
            .iter()
            .filter(|q| **q != me && !blocked.contains(q))
            .map(|q| ClientId::new(format!("c{:02}", q)))
            .collect();
        match found {
            Some(id) => {
                prop_assert_ne!(&id, &me_id);
                let found_blocked = blocked.iter().any(|b| ClientId::new(format!("c{:02}", b)) == id);
                prop_assert!(!found_blocked);
                // First eligible entry in key order
                prop_assert_eq!(Some(&id), eligible.first());
            }
            None => prop_assert!(eligible.is_empty()),
        }
    }
}

#[test]
fn test_mutual_attempts_create_one_session() {
    let rt = runtime();
    rt.block_on(async {
        for round in 0..50 {
            let store = MemoryRendezvous::new();
            let _a = enqueue(&store, "a").await;
            let _b = enqueue(&store, "b").await;
            store.set_latency(Duration::from_micros((round % 5) * 100));

            let attempt = |id: &'static str| {
                let mm = matchmaker(&store, ClientSettings::fast());
                tokio::spawn(async move {
                    mm.attempt(&ClientId::new(id), &BTreeSet::new()).await.unwrap()
                })
            };
            let (a, b) = tokio::join!(attempt("a"), attempt("b"));
            let outcomes = [a.unwrap(), b.unwrap()];

            let matched: Vec<_> = outcomes
                .iter()
                .filter_map(|o| match o {
                    AttemptOutcome::Matched(record) => Some(record.clone()),
                    _ => None,
                })
                .collect();
            assert!(matched.len() <= 1, "round {}: {:?}", round, outcomes);
            for outcome in &outcomes {
                assert!(
                    matches!(
                        outcome,
                        AttemptOutcome::Matched(_)
                            | AttemptOutcome::NoCandidate
                            | AttemptOutcome::ReservedByOther
                            | AttemptOutcome::NotQueued
                            | AttemptOutcome::Lost(MatchError::ReservationLost)
                    ),
                    "round {}: {:?}",
                    round,
                    outcomes
                );
            }
            assert_eq!(store.stats().batches_applied, matched.len() as u64);
            if let Some(record) = matched.first() {
                assert_ne!(record.initiator, record.responder);
                assert!(store.keys_with_prefix("queue/").is_empty());
            }
        }
    });
}

#[tokio::test]
async fn test_stranded_reservation_lapses() {
    let store = MemoryRendezvous::new();
    let _a = enqueue(&store, "a").await;
    let _b = enqueue(&store, "b").await;
    let settings = ClientSettings {
        reservation_lease: Duration::from_millis(200),
        ..ClientSettings::fast()
    };
    let a = ClientId::new("a");
    let b = ClientId::new("b");
    let c = ClientId::new("c");

    // a reserves b, then the store goes away before the session write
    let mm = matchmaker(&store, settings.clone());
    assert_eq!(mm.reserve(&a, &b).await.unwrap(), ReserveOutcome::Reserved);
    store.set_available(false);
    let err = mm.create_session(&a, &b).await.unwrap_err();
    assert!(matches!(err, MatchError::StoreUnavailable(_)));
    assert!(mm.release(&a, &b).await.is_err());
    store.set_available(true);

    assert!(store.keys_with_prefix("matches/").is_empty());
    assert!(store.keys_with_prefix("rooms/").is_empty());

    // Still held right after the fault
    let other = matchmaker(&store, settings.clone());
    assert_eq!(other.reserve(&c, &b).await.unwrap(), ReserveOutcome::Lost);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(other.reserve(&c, &b).await.unwrap(), ReserveOutcome::Reserved);
    let entry: QueueEntry = serde_json::from_value(store.value("queue/b").unwrap()).unwrap();
    assert!(entry.is_reserved_by(&c));
}

#[tokio::test]
async fn test_lost_candidate_moves_on_to_next() {
    let store = MemoryRendezvous::new();
    let _a = enqueue(&store, "a").await;
    let _b = enqueue(&store, "b").await;
    let _c = enqueue(&store, "c").await;
    let mm = matchmaker(&store, ClientSettings::fast());

    // Someone else holds b; a must skip it and pair with c
    let rival = matchmaker(&store, ClientSettings::fast());
    rival.reserve(&ClientId::new("z"), &ClientId::new("b")).await.unwrap();

    match mm.attempt(&ClientId::new("a"), &BTreeSet::new()).await.unwrap() {
        AttemptOutcome::Matched(record) => assert_eq!(record.responder, ClientId::new("c")),
        other => panic!("unexpected: {:?}", other),
    }
    assert!(store.value("queue/b").is_some());
}
