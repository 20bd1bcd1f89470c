//! Metrics collection using Prometheus
//!
//! Every metric is registered on the collector's own registry under the
//! `provider_directory_` prefix.

use crate::directory::state::CacheState;
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the directory service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Service-level metrics
    service_metrics: ServiceMetrics,

    /// Snapshot, refresh and feed metrics
    directory_metrics: DirectoryMetrics,

    /// Performance metrics
    performance_metrics: PerformanceMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

/// Directory cache metrics
#[derive(Clone)]
pub struct DirectoryMetrics {
    /// Version of the published snapshot
    pub snapshot_version: IntGauge,

    /// Entries in the published snapshot
    pub providers_available: IntGauge,

    /// Cache state (0=uninitialized, 1=loading, 2=ready, 3=refreshing, 4=disconnected)
    pub cache_state: IntGauge,

    /// Refreshes by outcome
    pub refreshes_total: IntCounterVec,

    /// Feed signals received by kind
    pub feed_events_total: IntCounterVec,

    /// Events folded into an already pending refresh
    pub events_coalesced_total: IntCounter,

    /// Feed subscriptions that ended
    pub feed_disconnects_total: IntCounter,

    /// Resubscription attempts by status
    pub resubscriptions_total: IntCounterVec,

    /// Providers published with a placeholder identity
    pub unknown_identities_total: IntCounter,

    /// Change messages that could not be decoded
    pub invalid_messages_total: IntCounter,
}

/// Performance metrics
#[derive(Clone)]
pub struct PerformanceMetrics {
    /// End to end refresh time
    pub refresh_duration: Histogram,

    /// Store call durations
    pub store_operation_duration: HistogramVec,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let directory_metrics = DirectoryMetrics::new(&registry)?;
        let performance_metrics = PerformanceMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            directory_metrics,
            performance_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    pub fn directory(&self) -> &DirectoryMetrics {
        &self.directory_metrics
    }

    pub fn performance(&self) -> &PerformanceMetrics {
        &self.performance_metrics
    }

    /// Record the outcome of one refresh
    pub fn record_refresh(&self, success: bool, duration: Duration) {
        let outcome = if success { "success" } else { "failed" };

        self.directory_metrics
            .refreshes_total
            .with_label_values(&[outcome])
            .inc();

        self.performance_metrics
            .refresh_duration
            .observe(duration.as_secs_f64());
    }

    /// Record a newly published snapshot
    pub fn record_snapshot(&self, version: u64, providers: usize) {
        self.directory_metrics
            .snapshot_version
            .set(version as i64);
        self.directory_metrics
            .providers_available
            .set(providers as i64);
    }

    pub fn record_cache_state(&self, state: CacheState) {
        self.directory_metrics.cache_state.set(state as i64);
    }

    /// Record a feed signal; `kind` is a change kind or `lagged`
    pub fn record_feed_event(&self, kind: &str) {
        self.directory_metrics
            .feed_events_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn record_coalesced_event(&self) {
        self.directory_metrics.events_coalesced_total.inc();
    }

    pub fn record_feed_disconnect(&self) {
        self.directory_metrics.feed_disconnects_total.inc();
    }

    pub fn record_resubscription(&self, success: bool) {
        let status = if success { "success" } else { "failed" };
        self.directory_metrics
            .resubscriptions_total
            .with_label_values(&[status])
            .inc();
    }

    pub fn record_unknown_identities(&self, count: usize) {
        self.directory_metrics
            .unknown_identities_total
            .inc_by(count as u64);
    }

    pub fn record_invalid_message(&self) {
        self.directory_metrics.invalid_messages_total.inc();
    }

    /// Record a store call
    pub fn record_store_operation(&self, operation: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "error" };

        self.performance_metrics
            .store_operation_duration
            .with_label_values(&[operation, status])
            .observe(duration.as_secs_f64());
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds = IntGauge::new(
            "provider_directory_uptime_seconds",
            "Service uptime in seconds",
        )?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let health_status = IntGauge::new(
            "provider_directory_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new(
                "provider_directory_component_health",
                "Component health status",
            ),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            health_status,
            component_health,
        })
    }
}

impl DirectoryMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let snapshot_version = IntGauge::new(
            "provider_directory_snapshot_version",
            "Version of the published snapshot",
        )?;
        registry.register(Box::new(snapshot_version.clone()))?;

        let providers_available = IntGauge::new(
            "provider_directory_providers_available",
            "Providers in the published snapshot",
        )?;
        registry.register(Box::new(providers_available.clone()))?;

        let cache_state = IntGauge::new(
            "provider_directory_cache_state",
            "Cache state (0=uninitialized, 1=loading, 2=ready, 3=refreshing, 4=disconnected)",
        )?;
        registry.register(Box::new(cache_state.clone()))?;

        let refreshes_total = IntCounterVec::new(
            Opts::new("provider_directory_refreshes_total", "Refreshes by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(refreshes_total.clone()))?;

        let feed_events_total = IntCounterVec::new(
            Opts::new(
                "provider_directory_feed_events_total",
                "Feed signals received",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(feed_events_total.clone()))?;

        let events_coalesced_total = IntCounter::new(
            "provider_directory_events_coalesced_total",
            "Events folded into a pending refresh",
        )?;
        registry.register(Box::new(events_coalesced_total.clone()))?;

        let feed_disconnects_total = IntCounter::new(
            "provider_directory_feed_disconnects_total",
            "Feed subscriptions that ended",
        )?;
        registry.register(Box::new(feed_disconnects_total.clone()))?;

        let resubscriptions_total = IntCounterVec::new(
            Opts::new(
                "provider_directory_resubscriptions_total",
                "Feed resubscription attempts",
            ),
            &["status"],
        )?;
        registry.register(Box::new(resubscriptions_total.clone()))?;

        let unknown_identities_total = IntCounter::new(
            "provider_directory_unknown_identities_total",
            "Providers published without a resolved identity",
        )?;
        registry.register(Box::new(unknown_identities_total.clone()))?;

        let invalid_messages_total = IntCounter::new(
            "provider_directory_invalid_messages_total",
            "Change messages that could not be decoded",
        )?;
        registry.register(Box::new(invalid_messages_total.clone()))?;

        Ok(Self {
            snapshot_version,
            providers_available,
            cache_state,
            refreshes_total,
            feed_events_total,
            events_coalesced_total,
            feed_disconnects_total,
            resubscriptions_total,
            unknown_identities_total,
            invalid_messages_total,
        })
    }
}

impl PerformanceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let refresh_duration = Histogram::with_opts(
            HistogramOpts::new(
                "provider_directory_refresh_duration_seconds",
                "Refresh duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )?;
        registry.register(Box::new(refresh_duration.clone()))?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "provider_directory_store_operation_duration_seconds",
                "Store operation duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["operation", "status"],
        )?;
        registry.register(Box::new(store_operation_duration.clone()))?;

        Ok(Self {
            refresh_duration,
            store_operation_duration,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics collector")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");

        let _service = collector.service();
        let _directory = collector.directory();
        let _performance = collector.performance();
    }

    #[test]
    fn test_refresh_recording() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");

        collector.record_refresh(true, Duration::from_millis(20));
        collector.record_refresh(false, Duration::from_millis(5));
        collector.record_refresh(false, Duration::from_millis(5));

        let refreshes = &collector.directory().refreshes_total;
        assert_eq!(refreshes.with_label_values(&["success"]).get(), 1);
        assert_eq!(refreshes.with_label_values(&["failed"]).get(), 2);
        assert_eq!(collector.performance().refresh_duration.get_sample_count(), 3);
    }

    #[test]
    fn test_snapshot_and_state_gauges() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");

        collector.record_snapshot(7, 42);
        collector.record_cache_state(CacheState::Disconnected);

        assert_eq!(collector.directory().snapshot_version.get(), 7);
        assert_eq!(collector.directory().providers_available.get(), 42);
        assert_eq!(collector.directory().cache_state.get(), 4);
    }

    #[test]
    fn test_feed_counters() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");

        collector.record_feed_event("update");
        collector.record_feed_event("update");
        collector.record_coalesced_event();
        collector.record_feed_disconnect();
        collector.record_resubscription(true);
        collector.record_unknown_identities(3);
        collector.record_invalid_message();

        let directory = collector.directory();
        assert_eq!(directory.feed_events_total.with_label_values(&["update"]).get(), 2);
        assert_eq!(directory.events_coalesced_total.get(), 1);
        assert_eq!(directory.feed_disconnects_total.get(), 1);
        assert_eq!(directory.unknown_identities_total.get(), 3);
        assert_eq!(directory.invalid_messages_total.get(), 1);
    }

    #[test]
    fn test_health_status_updates() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");

        collector.update_health_status(2);
        collector.update_component_health("directory", true);
        collector.update_component_health("feed", false);

        assert_eq!(collector.service().health_status.get(), 2);
        assert_eq!(
            collector
                .service()
                .component_health
                .with_label_values(&["feed"])
                .get(),
            0
        );
    }

    #[test]
    fn test_metrics_timer() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");
        let timer = collector.start_timer();

        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.elapsed() >= Duration::from_millis(10));
        assert!(timer.stop() >= Duration::from_millis(10));
    }
}
