//! Common types used throughout the provider directory

use crate::utils::current_timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for provider records
pub type ProviderId = String;

/// Unique identifier for user identities
pub type UserId = String;

/// Display name used when a provider's identity could not be resolved
pub const UNKNOWN_IDENTITY_NAME: &str = "Name unavailable";

fn default_rating() -> f64 {
    5.0
}

fn default_known() -> bool {
    true
}

/// Vehicle driven by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    #[serde(rename = "vehicle_make", default)]
    pub make: Option<String>,
    #[serde(rename = "vehicle_model")]
    pub model: String,
    #[serde(rename = "vehicle_color")]
    pub color: String,
    #[serde(rename = "vehicle_year")]
    pub year: i32,
    #[serde(rename = "vehicle_plate")]
    pub plate: String,
}

impl Vehicle {
    /// Short human readable description, e.g. "White Corolla 2020"
    pub fn describe(&self) -> String {
        match &self.make {
            Some(make) => format!("{} {} {} {}", self.color, make, self.model, self.year),
            None => format!("{} {} {}", self.color, self.model, self.year),
        }
    }
}

/// A provider record as held by the backing store
///
/// Field names on the wire follow the store's column names so rows decode
/// directly into this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: ProviderId,
    pub user_id: UserId,
    #[serde(rename = "is_online")]
    pub available: bool,
    #[serde(default = "default_rating")]
    pub rating: f64,
    pub price_per_km: f64,
    #[serde(flatten)]
    pub vehicle: Vehicle,
    #[serde(default)]
    pub profile_photo_url: Option<String>,
    #[serde(default)]
    pub car_photo_url: Option<String>,
}

/// Identity data joined into a provider record for presentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub name: String,
    pub phone: String,
    /// False for the placeholder produced when the identity lookup missed
    #[serde(default = "default_known")]
    pub known: bool,
}

impl IdentityRecord {
    pub fn new(name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phone: phone.into(),
            known: true,
        }
    }

    /// Placeholder identity for providers whose user record is missing
    pub fn unknown() -> Self {
        Self {
            name: UNKNOWN_IDENTITY_NAME.to_string(),
            phone: String::new(),
            known: false,
        }
    }

    pub fn is_unknown(&self) -> bool {
        !self.known
    }
}

/// A provider paired with its resolved identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub provider: ProviderRecord,
    pub identity: IdentityRecord,
}

/// Immutable point-in-time view of all available providers
///
/// Snapshots are never mutated after construction. Every entry is available
/// and entries are ordered by provider id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectorySnapshot {
    version: u64,
    built_at: DateTime<Utc>,
    entries: Vec<DirectoryEntry>,
}

impl DirectorySnapshot {
    /// The version-0 snapshot served before the first successful load
    pub fn empty() -> Self {
        Self {
            version: 0,
            built_at: DateTime::<Utc>::default(),
            entries: Vec::new(),
        }
    }

    /// Build a snapshot, dropping anything not marked available
    pub fn build(version: u64, entries: Vec<DirectoryEntry>) -> Self {
        let mut entries: Vec<DirectoryEntry> = entries
            .into_iter()
            .filter(|entry| entry.provider.available)
            .collect();
        entries.sort_by(|a, b| a.provider.id.cmp(&b.provider.id));

        Self {
            version,
            built_at: current_timestamp(),
            entries,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a single provider by id
    pub fn find(&self, provider_id: &str) -> Option<&DirectoryEntry> {
        self.entries
            .binary_search_by(|entry| entry.provider.id.as_str().cmp(provider_id))
            .ok()
            .map(|index| &self.entries[index])
    }

    pub fn provider_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.provider.id.as_str())
    }

    /// Number of entries carrying the placeholder identity
    pub fn unknown_identity_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.identity.is_unknown())
            .count()
    }
}

impl Default for DirectorySnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Kind of mutation reported by the change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    #[serde(alias = "INSERT")]
    Insert,
    #[serde(alias = "UPDATE")]
    Update,
    #[serde(alias = "DELETE")]
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Notification that a provider record changed
///
/// Carries no ordering guarantee relative to other providers and may
/// duplicate an earlier event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub provider_id: ProviderId,
    pub kind: ChangeKind,
    pub received_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(provider_id: impl Into<ProviderId>, kind: ChangeKind) -> Self {
        Self {
            provider_id: provider_id.into(),
            kind,
            received_at: current_timestamp(),
        }
    }
}
