//! REST-backed provider store
//!
//! Reads the `driver_profiles` and `users` tables through a PostgREST style
//! HTTP API. Every transport, status or decoding failure is reported as
//! `DirectoryError::StoreUnavailable`.

use crate::error::{DirectoryError, Result};
use crate::store::provider::ProviderStore;
use crate::types::{IdentityRecord, ProviderRecord, UserId};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

/// Connection settings for the REST store
#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    /// Base URL of the API, e.g. `https://project.example.co`
    pub base_url: String,
    /// API key sent as `apikey` and bearer token when present
    pub api_key: Option<String>,
    pub providers_table: String,
    pub identities_table: String,
    /// Per-request timeout enforced by the HTTP client
    pub request_timeout: Duration,
}

impl Default for RestStoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321".to_string(),
            api_key: None,
            providers_table: "driver_profiles".to_string(),
            identities_table: "users".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdentityRow {
    id: UserId,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    phone: Option<String>,
}

/// Provider store over HTTP
pub struct RestProviderStore {
    client: reqwest::Client,
    config: RestStoreConfig,
}

impl RestProviderStore {
    /// Create a new REST store client
    pub fn new(config: RestStoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DirectoryError::ConfigurationError {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    fn table_url(&self, table: &str) -> String {
        format!(
            "{}/rest/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            table
        )
    }

    /// PostgREST `in` filter value for a set of ids, sorted for stable URLs
    fn in_filter(ids: &HashSet<UserId>) -> String {
        let mut ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        ids.sort_unstable();
        format!("in.({})", ids.join(","))
    }

    async fn get_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let mut request = self.client.get(self.table_url(table)).query(query);
        if let Some(api_key) = &self.config.api_key {
            request = request.header("apikey", api_key).bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DirectoryError::StoreUnavailable {
                message: format!("Request to {} failed: {}", table, e),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DirectoryError::StoreUnavailable {
                message: format!("{} responded with {}", table, status),
            }
            .into());
        }

        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| {
                DirectoryError::StoreUnavailable {
                    message: format!("Failed to decode {} rows: {}", table, e),
                }
                .into()
            })
    }
}

#[async_trait]
impl ProviderStore for RestProviderStore {
    async fn list_available(&self) -> Result<Vec<ProviderRecord>> {
        let rows: Vec<ProviderRecord> = self
            .get_rows(
                &self.config.providers_table,
                &[
                    ("select", "*".to_string()),
                    ("is_online", "eq.true".to_string()),
                ],
            )
            .await?;

        debug!("Fetched {} available providers", rows.len());
        Ok(rows)
    }

    async fn list_identities(
        &self,
        ids: &HashSet<UserId>,
    ) -> Result<HashMap<UserId, IdentityRecord>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<IdentityRow> = self
            .get_rows(
                &self.config.identities_table,
                &[
                    ("select", "id,name,phone".to_string()),
                    ("id", Self::in_filter(ids)),
                ],
            )
            .await?;

        debug!("Resolved {} of {} identities", rows.len(), ids.len());
        Ok(rows
            .into_iter()
            .map(|row| {
                let identity =
                    IdentityRecord::new(row.name.unwrap_or_default(), row.phone.unwrap_or_default());
                (row.id, identity)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_url_trims_trailing_slash() {
        let store = RestProviderStore::new(RestStoreConfig {
            base_url: "http://store.local/".to_string(),
            ..RestStoreConfig::default()
        })
        .unwrap();

        assert_eq!(
            store.table_url("driver_profiles"),
            "http://store.local/rest/v1/driver_profiles"
        );
    }

    #[test]
    fn test_in_filter_is_sorted() {
        let ids: HashSet<UserId> = ["u2", "u10", "u1"].iter().map(|s| s.to_string()).collect();
        assert_eq!(RestProviderStore::in_filter(&ids), "in.(u1,u10,u2)");
    }

    #[tokio::test]
    async fn test_unreachable_store_is_unavailable() {
        let store = RestProviderStore::new(RestStoreConfig {
            // Port 9 (discard) on localhost is not expected to serve HTTP.
            base_url: "http://127.0.0.1:9".to_string(),
            request_timeout: Duration::from_millis(500),
            ..RestStoreConfig::default()
        })
        .unwrap();

        let err = store.list_available().await.unwrap_err();
        assert!(DirectoryError::is_store_unavailable(&err));
    }

    #[tokio::test]
    async fn test_empty_identity_lookup_skips_request() {
        let store = RestProviderStore::new(RestStoreConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            ..RestStoreConfig::default()
        })
        .unwrap();

        let identities = store.list_identities(&HashSet::new()).await.unwrap();
        assert!(identities.is_empty());
    }
}
