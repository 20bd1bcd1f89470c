//! Test fixtures shared by the integration and concurrency tests
#![allow(dead_code)]

use provider_directory::directory::{DirectoryCache, DirectoryConfig};
use provider_directory::feed::ChannelChangeFeed;
use provider_directory::store::{InMemoryProviderStore, SeedEntry};
use provider_directory::types::{DirectorySnapshot, IdentityRecord, ProviderRecord, Vehicle};
use std::sync::Arc;
use std::time::Duration;

/// Generous bound for waits on real time
pub const WAIT: Duration = Duration::from_secs(5);

/// Timing tuned so retries happen within a few tens of milliseconds
pub fn fast_config() -> DirectoryConfig {
    DirectoryConfig {
        refresh_backoff_base: Duration::from_millis(10),
        refresh_backoff_cap: Duration::from_millis(80),
        store_timeout: Duration::from_secs(1),
        resubscribe_backoff_base: Duration::from_millis(10),
        resubscribe_backoff_cap: Duration::from_millis(80),
    }
}

pub fn user_of(provider_id: &str) -> String {
    format!("user-{}", provider_id)
}

/// A provider owned by `user-<id>`
pub fn provider(id: &str, available: bool) -> ProviderRecord {
    ProviderRecord {
        id: id.to_string(),
        user_id: user_of(id),
        available,
        rating: 4.9,
        price_per_km: 2.1,
        vehicle: Vehicle {
            make: Some("Volkswagen".to_string()),
            model: "Gol".to_string(),
            color: "Silver".to_string(),
            year: 2019,
            plate: format!("TST{}", id.len()),
        },
        profile_photo_url: None,
        car_photo_url: None,
    }
}

/// Seed entry for a provider with a resolvable identity
pub fn entry(id: &str, name: &str, available: bool) -> SeedEntry {
    SeedEntry {
        provider: provider(id, available),
        identity: Some(IdentityRecord::new(name, "555-0100")),
    }
}

/// Seed entry for a provider whose identity is missing from the store
pub fn orphan(id: &str, available: bool) -> SeedEntry {
    SeedEntry {
        provider: provider(id, available),
        identity: None,
    }
}

pub fn ids(snapshot: &DirectorySnapshot) -> Vec<String> {
    snapshot.provider_ids().map(str::to_string).collect()
}

/// Store, feed and cache wired the way the service wires its memory backends
pub struct TestSystem {
    pub store: Arc<InMemoryProviderStore>,
    pub feed: Arc<ChannelChangeFeed>,
    pub cache: DirectoryCache,
}

impl TestSystem {
    /// Seeded store announcing its writes on a fresh feed, no cache yet
    pub async fn parts(
        entries: Vec<SeedEntry>,
    ) -> (Arc<InMemoryProviderStore>, Arc<ChannelChangeFeed>) {
        let feed = Arc::new(ChannelChangeFeed::new(1024));
        let store = Arc::new(InMemoryProviderStore::with_publisher(feed.clone()));
        store.seed(entries).await;
        (store, feed)
    }

    /// Start a cache over an already prepared store and feed
    pub fn from_parts(
        store: Arc<InMemoryProviderStore>,
        feed: Arc<ChannelChangeFeed>,
        config: DirectoryConfig,
    ) -> Self {
        let cache = DirectoryCache::start(store.clone(), feed.clone(), config);
        Self { store, feed, cache }
    }

    /// Seed the store and start the cache without waiting for the first load
    pub async fn start(entries: Vec<SeedEntry>, config: DirectoryConfig) -> Self {
        let (store, feed) = Self::parts(entries).await;
        Self::from_parts(store, feed, config)
    }

    /// Start and wait for the initial snapshot
    pub async fn loaded(entries: Vec<SeedEntry>, config: DirectoryConfig) -> Self {
        let system = Self::start(entries, config).await;
        system
            .cache
            .wait_for_version(1, WAIT)
            .await
            .expect("initial load");
        system
    }

    pub async fn wait_for(&self, version: u64) -> Arc<DirectorySnapshot> {
        self.cache
            .wait_for_version(version, WAIT)
            .await
            .unwrap_or_else(|e| panic!("snapshot version {} never arrived: {}", version, e))
    }

    /// Poll until `condition` holds on the cache, or panic after `WAIT`
    pub async fn eventually<F>(&self, what: &str, condition: F)
    where
        F: Fn(&DirectoryCache) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !condition(&self.cache) {
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
