//! In-memory provider store
//!
//! Holds provider and identity records in process. Besides the read interface
//! used by the directory it exposes the writer side (availability toggles,
//! profile edits, removals) and publishes a change event for every provider
//! write. Used for local runs and tests, including fault injection.

use crate::error::{DirectoryError, Result};
use crate::feed::ChangePublisher;
use crate::store::provider::ProviderStore;
use crate::types::{ChangeEvent, ChangeKind, IdentityRecord, ProviderId, ProviderRecord, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A provider with its optional identity, as read from a seed file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedEntry {
    pub provider: ProviderRecord,
    #[serde(default)]
    pub identity: Option<IdentityRecord>,
}

/// Provider store that keeps everything in memory
pub struct InMemoryProviderStore {
    providers: RwLock<BTreeMap<ProviderId, ProviderRecord>>,
    identities: RwLock<HashMap<UserId, IdentityRecord>>,
    publisher: Option<Arc<dyn ChangePublisher>>,
    failures_remaining: AtomicU32,
    latency_ms: AtomicU64,
    list_available_calls: AtomicU64,
    list_identities_calls: AtomicU64,
}

impl InMemoryProviderStore {
    /// Create an empty store that publishes no change events
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(BTreeMap::new()),
            identities: RwLock::new(HashMap::new()),
            publisher: None,
            failures_remaining: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            list_available_calls: AtomicU64::new(0),
            list_identities_calls: AtomicU64::new(0),
        }
    }

    /// Create an empty store that announces provider writes on `publisher`
    pub fn with_publisher(publisher: Arc<dyn ChangePublisher>) -> Self {
        Self {
            publisher: Some(publisher),
            ..Self::new()
        }
    }

    /// Load providers and identities from a JSON seed file
    pub async fn load_seed_file(&self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DirectoryError::ConfigurationError {
                message: format!("Failed to read seed file {}: {}", path.display(), e),
            }
        })?;

        let entries: Vec<SeedEntry> =
            serde_json::from_str(&content).map_err(|e| DirectoryError::ConfigurationError {
                message: format!("Failed to parse seed file {}: {}", path.display(), e),
            })?;

        let count = entries.len();
        self.seed(entries).await;
        info!("Seeded {} providers from {}", count, path.display());
        Ok(count)
    }

    /// Insert records directly, without publishing change events
    pub async fn seed(&self, entries: Vec<SeedEntry>) {
        let mut providers = self.providers.write().await;
        let mut identities = self.identities.write().await;

        for entry in entries {
            if let Some(identity) = entry.identity {
                identities.insert(entry.provider.user_id.clone(), identity);
            }
            providers.insert(entry.provider.id.clone(), entry.provider);
        }
    }

    /// Insert or replace a provider record
    pub async fn upsert_provider(&self, record: ProviderRecord) -> Result<()> {
        let provider_id = record.id.clone();
        let kind = {
            let mut providers = self.providers.write().await;
            match providers.insert(provider_id.clone(), record) {
                Some(_) => ChangeKind::Update,
                None => ChangeKind::Insert,
            }
        };

        debug!("Stored provider '{}' ({})", provider_id, kind);
        self.announce(provider_id, kind).await;
        Ok(())
    }

    /// Flip a provider's availability flag
    pub async fn set_availability(&self, provider_id: &str, available: bool) -> Result<()> {
        {
            let mut providers = self.providers.write().await;
            let record =
                providers
                    .get_mut(provider_id)
                    .ok_or_else(|| DirectoryError::ProviderNotFound {
                        provider_id: provider_id.to_string(),
                    })?;
            record.available = available;
        }

        debug!(
            "Provider '{}' is now {}",
            provider_id,
            if available { "available" } else { "unavailable" }
        );
        self.announce(provider_id.to_string(), ChangeKind::Update)
            .await;
        Ok(())
    }

    /// Remove a provider record, returning whether it existed
    pub async fn remove_provider(&self, provider_id: &str) -> Result<bool> {
        let removed = self.providers.write().await.remove(provider_id).is_some();
        if removed {
            self.announce(provider_id.to_string(), ChangeKind::Delete)
                .await;
        }
        Ok(removed)
    }

    /// Insert or replace an identity record
    ///
    /// Identity changes are not announced on the feed; they become visible
    /// with the next refresh.
    pub async fn upsert_identity(&self, user_id: impl Into<UserId>, identity: IdentityRecord) {
        self.identities.write().await.insert(user_id.into(), identity);
    }

    /// Remove an identity record
    pub async fn remove_identity(&self, user_id: &str) -> bool {
        self.identities.write().await.remove(user_id).is_some()
    }

    /// Make the next `count` calls to `list_available` fail
    pub fn fail_next_list_available(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Delay every `list_available` call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `list_available` calls received so far
    pub fn list_available_calls(&self) -> u64 {
        self.list_available_calls.load(Ordering::SeqCst)
    }

    /// Number of `list_identities` calls received so far
    pub fn list_identities_calls(&self) -> u64 {
        self.list_identities_calls.load(Ordering::SeqCst)
    }

    /// Number of provider records, available or not
    pub async fn provider_count(&self) -> usize {
        self.providers.read().await.len()
    }

    async fn announce(&self, provider_id: ProviderId, kind: ChangeKind) {
        let Some(publisher) = &self.publisher else {
            return;
        };

        let event = ChangeEvent::new(provider_id.clone(), kind);
        if let Err(e) = publisher.publish_change(event).await {
            warn!(
                "Failed to announce {} of provider '{}': {}",
                kind, provider_id, e
            );
        }
    }
}

impl Default for InMemoryProviderStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderStore for InMemoryProviderStore {
    async fn list_available(&self) -> Result<Vec<ProviderRecord>> {
        self.list_available_calls.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if should_fail {
            return Err(DirectoryError::StoreUnavailable {
                message: "injected list_available failure".to_string(),
            }
            .into());
        }

        let providers = self.providers.read().await;
        Ok(providers
            .values()
            .filter(|record| record.available)
            .cloned()
            .collect())
    }

    async fn list_identities(
        &self,
        ids: &HashSet<UserId>,
    ) -> Result<HashMap<UserId, IdentityRecord>> {
        self.list_identities_calls.fetch_add(1, Ordering::SeqCst);

        let identities = self.identities.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| identities.get(id).map(|identity| (id.clone(), identity.clone())))
            .collect())
    }
}
