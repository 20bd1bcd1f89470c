//! Performance benchmarks for directory reads and refreshes

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use provider_directory::directory::{DirectoryCache, DirectoryConfig};
use provider_directory::feed::ChannelChangeFeed;
use provider_directory::store::{InMemoryProviderStore, SeedEntry};
use provider_directory::types::{
    DirectoryEntry, DirectorySnapshot, IdentityRecord, ProviderRecord, Vehicle,
};
use std::sync::Arc;
use std::time::Duration;

const PROVIDERS: usize = 1_000;

fn provider(i: usize) -> ProviderRecord {
    ProviderRecord {
        id: format!("provider-{:04}", i),
        user_id: format!("user-{:04}", i),
        available: i % 4 != 0,
        rating: 4.0 + (i % 10) as f64 / 10.0,
        price_per_km: 1.5 + (i % 7) as f64 / 10.0,
        vehicle: Vehicle {
            make: Some("Chevrolet".to_string()),
            model: "Onix".to_string(),
            color: "Black".to_string(),
            year: 2015 + (i % 10) as i32,
            plate: format!("BEN{:04}", i),
        },
        profile_photo_url: None,
        car_photo_url: None,
    }
}

fn seed_entries() -> Vec<SeedEntry> {
    (0..PROVIDERS)
        .map(|i| SeedEntry {
            provider: provider(i),
            identity: Some(IdentityRecord::new(format!("Provider {}", i), "555-0100")),
        })
        .collect()
}

fn directory_entries() -> Vec<DirectoryEntry> {
    seed_entries()
        .into_iter()
        .map(|seed| DirectoryEntry {
            provider: seed.provider,
            identity: seed.identity.unwrap_or_else(IdentityRecord::unknown),
        })
        .collect()
}

fn create_bench_cache(rt: &tokio::runtime::Runtime) -> DirectoryCache {
    rt.block_on(async {
        let feed = Arc::new(ChannelChangeFeed::new(1024));
        let store = Arc::new(InMemoryProviderStore::with_publisher(feed.clone()));
        store.seed(seed_entries()).await;

        let cache = DirectoryCache::start(store, feed, DirectoryConfig::default());
        cache
            .wait_for_version(1, Duration::from_secs(10))
            .await
            .unwrap();
        cache
    })
}

fn bench_snapshot_get(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = create_bench_cache(&rt);

    c.bench_function("snapshot_get", |b| b.iter(|| black_box(cache.get())));

    c.bench_function("snapshot_find", |b| {
        let snapshot = cache.get();
        b.iter(|| black_box(snapshot.find(black_box("provider-0777"))))
    });

    rt.block_on(cache.stop());
}

fn bench_snapshot_build(c: &mut Criterion) {
    let entries = directory_entries();

    c.bench_function("snapshot_build_1000", |b| {
        b.iter(|| black_box(DirectorySnapshot::build(1, entries.clone())))
    });
}

fn bench_full_refresh(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = create_bench_cache(&rt);

    c.bench_function("full_refresh_1000", |b| {
        b.iter(|| rt.block_on(async { black_box(cache.refresh_now().await.unwrap()) }))
    });

    rt.block_on(cache.stop());
}

criterion_group!(
    benches,
    bench_snapshot_get,
    bench_snapshot_build,
    bench_full_refresh
);
criterion_main!(benches);
