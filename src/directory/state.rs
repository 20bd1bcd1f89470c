//! Directory cache lifecycle state

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the cache is in its lifecycle
///
/// ```text
/// Uninitialized -> Loading -> Ready <-> Refreshing
///                               |          |
///                               +-> Disconnected -> Refreshing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CacheState {
    /// Before `DirectoryCache::start`. Only the state gauge of a fresh
    /// collector reports it; `start` moves to `Loading` before returning.
    Uninitialized = 0,
    /// No snapshot published yet; initial load in progress or backing off
    Loading = 1,
    Ready = 2,
    /// A refresh is in flight; the previous snapshot is still served
    Refreshing = 3,
    /// The feed subscription is gone; the last snapshot is still served
    Disconnected = 4,
}

impl CacheState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => CacheState::Loading,
            2 => CacheState::Ready,
            3 => CacheState::Refreshing,
            4 => CacheState::Disconnected,
            _ => CacheState::Uninitialized,
        }
    }

    /// Whether a loaded snapshot is being served
    pub fn is_serving(&self) -> bool {
        matches!(
            self,
            CacheState::Ready | CacheState::Refreshing | CacheState::Disconnected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Uninitialized => "uninitialized",
            CacheState::Loading => "loading",
            CacheState::Ready => "ready",
            CacheState::Refreshing => "refreshing",
            CacheState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
