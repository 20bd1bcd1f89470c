//! Concurrency tests for the directory cache
//!
//! Readers run against the cache while refreshes are in flight, bursts of
//! change events are coalesced, and every snapshot handed out is checked to
//! be a complete, consistent view of the store.

mod fixtures;

use fixtures::{entry, fast_config, ids, orphan, TestSystem};
use futures::future::join_all;
use proptest::prelude::*;
use provider_directory::types::{ChangeEvent, ChangeKind};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

#[tokio::test(start_paused = true)]
async fn test_event_burst_is_coalesced() {
    let system = TestSystem::loaded(
        vec![entry("a", "Ana", true), entry("b", "Bruno", false)],
        fast_config(),
    )
    .await;
    system.store.set_latency(Duration::from_millis(200));
    let calls_before = system.store.list_available_calls();

    system.store.set_availability("b", true).await.unwrap();
    for _ in 0..49 {
        system.feed.publish(ChangeEvent::new("b", ChangeKind::Update));
    }

    // Let every refresh triggered by the burst run to completion
    tokio::time::sleep(Duration::from_secs(5)).await;

    let extra_calls = system.store.list_available_calls() - calls_before;
    assert!(
        (1..=2).contains(&extra_calls),
        "50 events caused {} refreshes",
        extra_calls
    );

    let stats = system.cache.stats();
    assert_eq!(stats.events_received, 50);
    assert_eq!(stats.events_received - stats.events_coalesced, extra_calls);
    assert_eq!(stats.version, 1 + extra_calls);
    assert_eq!(ids(&system.cache.get()), vec!["a", "b"]);

    system.cache.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_events_during_refresh_cause_one_follow_up() {
    let system = TestSystem::loaded(vec![entry("a", "Ana", true)], fast_config()).await;
    system.store.set_latency(Duration::from_millis(200));

    system.feed.publish(ChangeEvent::new("a", ChangeKind::Update));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // First refresh is in flight; these all collapse into one follow-up
    for _ in 0..10 {
        system.feed.publish(ChangeEvent::new("a", ChangeKind::Update));
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(system.store.list_available_calls(), 3);
    assert_eq!(system.cache.get().version(), 3);
    assert_eq!(system.cache.stats().events_coalesced, 9);

    system.cache.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reads_do_not_wait_for_slow_refresh() {
    let system = TestSystem::loaded(
        vec![entry("a", "Ana", true), entry("b", "Bruno", true)],
        fast_config(),
    )
    .await;
    system.store.set_latency(Duration::from_millis(300));

    let cache = std::sync::Arc::new(system.cache);
    let refresher = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.refresh_now().await })
    };

    let readers = (0..8).map(|_| {
        let cache = cache.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let mut last_version = 0;
            for _ in 0..1_000 {
                let snapshot = cache.get();
                assert!(snapshot.version() >= last_version);
                assert_eq!(snapshot.len(), 2);
                last_version = snapshot.version();
            }
            started.elapsed()
        })
    });

    for elapsed in join_all(readers).await {
        let elapsed = elapsed.unwrap();
        assert!(
            elapsed < Duration::from_millis(250),
            "1000 reads took {:?}",
            elapsed
        );
    }

    let refreshed = refresher.await.unwrap().unwrap();
    assert_eq!(refreshed.version(), 2);
    cache.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshots_stay_consistent_under_writes() {
    let entries = (0..20)
        .map(|i| entry(&format!("p{:02}", i), "Provider", i % 2 == 0))
        .collect();
    let system = TestSystem::loaded(entries, fast_config()).await;
    let cache = std::sync::Arc::new(system.cache);

    let writer = {
        let store = system.store.clone();
        tokio::spawn(async move {
            for round in 0..50 {
                let id = format!("p{:02}", round % 20);
                store.set_availability(&id, round % 3 != 0).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let readers = (0..4).map(|_| {
        let cache = cache.clone();
        tokio::spawn(async move {
            let mut last_version = 0;
            let deadline = Instant::now() + Duration::from_millis(200);
            while Instant::now() < deadline {
                let snapshot = cache.get();
                assert!(snapshot.version() >= last_version);
                assert!(snapshot.entries().iter().all(|e| e.provider.available));
                assert!(snapshot
                    .entries()
                    .windows(2)
                    .all(|pair| pair[0].provider.id < pair[1].provider.id));
                last_version = snapshot.version();
                tokio::task::yield_now().await;
            }
        })
    });

    for reader in join_all(readers).await {
        reader.unwrap();
    }
    writer.await.unwrap();

    // Once writes stop the cache converges on the store's final state
    let settled = cache.refresh_now().await.unwrap();
    let mut expected = BTreeSet::new();
    for i in 0..20 {
        let last_round = (0..50).rev().find(|round| round % 20 == i);
        let available = match last_round {
            Some(round) => round % 3 != 0,
            None => i % 2 == 0,
        };
        if available {
            expected.insert(format!("p{:02}", i));
        }
    }
    let actual: BTreeSet<String> = ids(&settled).into_iter().collect();
    assert_eq!(actual, expected);

    cache.stop().await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_snapshot_matches_store(
        providers in prop::collection::vec((any::<bool>(), any::<bool>()), 0..24)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let entries = providers
                .iter()
                .enumerate()
                .map(|(i, (available, has_identity))| {
                    let id = format!("p{:02}", i);
                    if *has_identity {
                        entry(&id, "Known", *available)
                    } else {
                        orphan(&id, *available)
                    }
                })
                .collect();
            let system = TestSystem::loaded(entries, fast_config()).await;
            let snapshot = system.cache.refresh_now().await.unwrap();

            let expected: Vec<String> = providers
                .iter()
                .enumerate()
                .filter(|(_, (available, _))| *available)
                .map(|(i, _)| format!("p{:02}", i))
                .collect();
            assert_eq!(ids(&snapshot), expected);

            let expected_unknown = providers
                .iter()
                .filter(|(available, has_identity)| *available && !*has_identity)
                .count();
            assert_eq!(snapshot.unknown_identity_count(), expected_unknown);

            system.cache.stop().await;
        });
    }
}
