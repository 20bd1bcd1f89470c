//! Health checks and monitoring
//!
//! Liveness and readiness are derived from the directory cache: it is alive
//! while its background task runs and ready once a snapshot is being served.

use crate::directory::{CacheState, DirectoryCache, DirectoryStats};
use crate::utils::current_timestamp;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Health check status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Value exported on the health gauge (0=unhealthy, 1=degraded, 2=healthy)
    pub fn as_metric(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 0,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "✅ healthy"),
            HealthStatus::Degraded => write!(f, "⚠️  degraded"),
            HealthStatus::Unhealthy => write!(f, "❌ unhealthy"),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Overall service status
    pub status: HealthStatus,
    /// Service name
    pub service: String,
    pub version: String,
    /// Current timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Detailed component checks
    pub checks: Vec<ComponentCheck>,
    /// Directory statistics
    pub stats: DirectoryStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    /// Component name
    pub name: String,
    /// Component status
    pub status: HealthStatus,
    /// Optional message when not healthy
    pub message: Option<String>,
    /// Check duration in milliseconds
    pub duration_ms: u64,
}

impl ComponentCheck {
    fn timed(name: &str, start: Instant, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

impl HealthCheck {
    /// Full health check of the directory
    pub fn check(directory: &DirectoryCache, service_name: &str) -> Self {
        let stats = directory.stats();
        let checks = vec![
            Self::check_task(directory),
            Self::check_snapshot(&stats),
            Self::check_feed(&stats),
            Self::check_store(&stats),
        ];

        let status = checks
            .iter()
            .map(|check| check.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        HealthCheck {
            status,
            service: service_name.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: current_timestamp(),
            checks,
            stats,
        }
    }

    /// Alive while the background task runs
    pub fn liveness_check(directory: &DirectoryCache) -> HealthStatus {
        if directory.is_running() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// Ready once a snapshot is served; degraded while disconnected or failing
    pub fn readiness_check(directory: &DirectoryCache) -> HealthStatus {
        if !directory.is_running() {
            return HealthStatus::Unhealthy;
        }

        let stats = directory.stats();
        match stats.state {
            CacheState::Uninitialized | CacheState::Loading => HealthStatus::Unhealthy,
            CacheState::Disconnected => HealthStatus::Degraded,
            CacheState::Ready | CacheState::Refreshing if stats.consecutive_failures > 0 => {
                HealthStatus::Degraded
            }
            CacheState::Ready | CacheState::Refreshing => HealthStatus::Healthy,
        }
    }

    fn check_task(directory: &DirectoryCache) -> ComponentCheck {
        let start = Instant::now();
        let (status, message) = if directory.is_running() {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some("Directory task is not running".to_string()),
            )
        };
        ComponentCheck::timed("directory_task", start, status, message)
    }

    fn check_snapshot(stats: &DirectoryStats) -> ComponentCheck {
        let start = Instant::now();
        let (status, message) = if stats.state.is_serving() {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some(format!("No snapshot published yet ({})", stats.state)),
            )
        };
        ComponentCheck::timed("snapshot", start, status, message)
    }

    fn check_feed(stats: &DirectoryStats) -> ComponentCheck {
        let start = Instant::now();
        let (status, message) = match stats.state {
            CacheState::Disconnected => (
                HealthStatus::Degraded,
                Some("Change feed disconnected, serving last snapshot".to_string()),
            ),
            _ => (HealthStatus::Healthy, None),
        };
        ComponentCheck::timed("change_feed", start, status, message)
    }

    fn check_store(stats: &DirectoryStats) -> ComponentCheck {
        let start = Instant::now();
        let (status, message) = if stats.consecutive_failures > 0 {
            (
                HealthStatus::Degraded,
                Some(format!(
                    "{} consecutive refresh failures",
                    stats.consecutive_failures
                )),
            )
        } else {
            (HealthStatus::Healthy, None)
        };
        ComponentCheck::timed("provider_store", start, status, message)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}
