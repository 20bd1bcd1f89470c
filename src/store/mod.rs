//! Backing store access for provider and identity records
//!
//! The directory only ever reads through the `ProviderStore` trait. Writes
//! belong to the surrounding screens and are observed through the change feed.

pub mod memory;
pub mod provider;
pub mod rest;

pub use memory::{InMemoryProviderStore, SeedEntry};
pub use provider::ProviderStore;
pub use rest::{RestProviderStore, RestStoreConfig};
