//! Read contract for presentation layers

use crate::directory::cache::DirectoryCache;
use crate::types::DirectorySnapshot;
use std::sync::Arc;

/// Source of the current set of available providers
pub trait DirectoryReader: Send + Sync {
    /// Latest published snapshot. Never blocks and has no side effects.
    fn current_available(&self) -> Arc<DirectorySnapshot>;
}

impl DirectoryReader for DirectoryCache {
    fn current_available(&self) -> Arc<DirectorySnapshot> {
        self.get()
    }
}

impl DirectoryReader for Arc<DirectoryCache> {
    fn current_available(&self) -> Arc<DirectorySnapshot> {
        self.as_ref().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DirectoryConfig;
    use crate::feed::ChannelChangeFeed;
    use crate::store::InMemoryProviderStore;
    use std::time::Duration;

    fn version_of(reader: &dyn DirectoryReader) -> u64 {
        reader.current_available().version()
    }

    #[tokio::test]
    async fn test_reader_sees_published_snapshot() {
        let cache = Arc::new(DirectoryCache::start(
            Arc::new(InMemoryProviderStore::new()),
            Arc::new(ChannelChangeFeed::new(8)),
            DirectoryConfig::default(),
        ));
        assert_eq!(version_of(&*cache), 0);

        cache
            .wait_for_version(1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(version_of(&cache), 1);
        assert!(Arc::ptr_eq(&cache.current_available(), &cache.get()));

        cache.stop().await;
    }
}
