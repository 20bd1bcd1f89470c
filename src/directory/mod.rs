//! Availability directory: snapshot cache, lifecycle state and read contract

pub mod backoff;
pub mod cache;
pub mod reader;
pub mod state;

pub use backoff::ExponentialBackoff;
pub use cache::{DirectoryCache, DirectoryConfig, DirectoryStats};
pub use reader::DirectoryReader;
pub use state::CacheState;
