//! Metrics and monitoring for the provider directory
//!
//! This module provides Prometheus metrics collection and the HTTP server
//! exposing health probes, metrics and directory reads.

pub mod collector;
pub mod health;

pub use collector::{DirectoryMetrics, MetricsCollector, PerformanceMetrics, ServiceMetrics};
pub use health::{HealthServer, HealthServerConfig};

use std::sync::Arc;

/// Metrics collector paired with the server that exposes it
#[derive(Clone)]
pub struct MetricsService {
    collector: Arc<MetricsCollector>,
    health_server: Arc<HealthServer>,
}

impl MetricsService {
    /// Create a new metrics service
    pub fn new(collector: Arc<MetricsCollector>, health_server: Arc<HealthServer>) -> Self {
        Self {
            collector,
            health_server,
        }
    }

    /// Get the metrics collector
    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    /// Get the health server
    pub fn health_server(&self) -> Arc<HealthServer> {
        self.health_server.clone()
    }

    /// Serve until stopped
    pub async fn start(&self) -> anyhow::Result<()> {
        self.health_server.start().await
    }

    /// Stop the metrics service
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.health_server.stop().await
    }
}
