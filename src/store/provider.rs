//! Provider store trait

use crate::error::Result;
use crate::types::{IdentityRecord, ProviderRecord, UserId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

/// Read interface over the backing store
#[async_trait]
pub trait ProviderStore: Send + Sync {
    /// List every provider record currently flagged as available
    ///
    /// Fails with `DirectoryError::StoreUnavailable` on transport or backend
    /// failure.
    async fn list_available(&self) -> Result<Vec<ProviderRecord>>;

    /// Resolve identities for the given user ids
    ///
    /// Ids with no identity record are simply absent from the result.
    async fn list_identities(&self, ids: &HashSet<UserId>)
        -> Result<HashMap<UserId, IdentityRecord>>;
}
