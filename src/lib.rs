//! Provider Directory - near-real-time view of available service providers
//!
//! This crate maintains an in-memory projection of the providers that are
//! currently available, kept current by a change feed, and serves
//! point-in-time snapshots to any number of concurrent readers.

pub mod config;
pub mod directory;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod service;
pub mod session;
pub mod store;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{DirectoryError, Result};
pub use types::*;

// Re-export key components
pub use directory::{CacheState, DirectoryCache, DirectoryConfig, DirectoryReader};
pub use feed::{ChangeFeed, ChangePublisher, ChannelChangeFeed, FeedSubscription};
pub use store::{InMemoryProviderStore, ProviderStore, RestProviderStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
