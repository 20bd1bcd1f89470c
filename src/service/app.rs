//! Main application state and service coordination
//!
//! `AppState` builds the provider store and change feed selected by the
//! configuration, starts the directory cache on top of them and runs the HTTP
//! server and maintenance tasks around it.

use crate::config::{AppConfig, FeedBackend, StoreBackend};
use crate::directory::DirectoryCache;
use crate::feed::{AmqpChangeFeed, ChangeFeed, ChannelChangeFeed};
use crate::metrics::{HealthServer, HealthServerConfig, MetricsCollector, MetricsService};
use crate::service::health::{HealthCheck, HealthStatus};
use crate::store::{InMemoryProviderStore, ProviderStore, RestProviderStore};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Change feed error: {message}")]
    Feed { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// How often service health gauges are refreshed
const HEALTH_METRICS_INTERVAL: Duration = Duration::from_secs(15);

/// Main application state containing all service components
pub struct AppState {
    /// Application configuration
    config: AppConfig,

    /// The availability directory
    directory: Arc<DirectoryCache>,

    /// Writable store when running on the in-memory backend
    memory_store: Option<Arc<InMemoryProviderStore>>,

    /// Metrics service for monitoring and health checks
    metrics_service: Arc<MetricsService>,

    /// Background task handles
    background_tasks: Vec<JoinHandle<()>>,

    /// Service status
    is_running: Arc<RwLock<bool>>,
}

impl AppState {
    /// Initialize the application with all dependencies
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        info!("Initializing provider directory service");
        info!(
            "Configuration: service={}, store={:?}, feed={:?}",
            config.service.name, config.store.backend, config.feed.backend
        );

        let collector = Arc::new(MetricsCollector::new().map_err(|e| {
            ServiceError::Initialization {
                message: format!("Failed to create metrics collector: {}", e),
            }
        })?);

        let (store, feed, memory_store) = Self::initialize_backends(&config, &collector).await?;

        let directory = Arc::new(DirectoryCache::start_with_metrics(
            store,
            feed,
            config.directory_config(),
            collector.clone(),
        ));

        let metrics_service = Self::initialize_metrics(&config, collector, directory.clone());

        Ok(Self {
            config,
            directory,
            memory_store,
            metrics_service,
            background_tasks: Vec::new(),
            is_running: Arc::new(RwLock::new(false)),
        })
    }

    /// Start the HTTP server and background tasks
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        info!("Starting provider directory service");

        *self.is_running.write().await = true;

        self.start_metrics_service().await?;
        self.start_background_tasks();

        info!("✅ Provider directory service started successfully");
        Ok(())
    }

    /// Perform graceful shutdown
    pub async fn shutdown(&mut self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of provider directory service");

        *self.is_running.write().await = false;

        info!("Stopping metrics service...");
        if let Err(e) = self.metrics_service.stop().await {
            warn!("Failed to stop metrics service: {}", e);
        }

        self.stop_background_tasks().await;

        let stop = tokio::time::timeout(self.config.shutdown_timeout(), self.directory.stop());
        if stop.await.is_err() {
            return Err(ServiceError::BackgroundTask {
                message: format!(
                    "Directory cache did not stop within {:?}",
                    self.config.shutdown_timeout()
                ),
            });
        }

        info!("Final directory statistics: {:?}", self.directory.stats());
        info!("✅ Provider directory service shutdown completed");
        Ok(())
    }

    /// Get service configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Check if service is running
    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// The availability directory
    pub fn directory(&self) -> Arc<DirectoryCache> {
        self.directory.clone()
    }

    /// The writable store, when the in-memory backend is configured
    pub fn memory_store(&self) -> Option<Arc<InMemoryProviderStore>> {
        self.memory_store.clone()
    }

    /// Get metrics service
    pub fn metrics_service(&self) -> Arc<MetricsService> {
        self.metrics_service.clone()
    }

    /// Build the store and feed selected by the configuration
    async fn initialize_backends(
        config: &AppConfig,
        collector: &Arc<MetricsCollector>,
    ) -> Result<
        (
            Arc<dyn ProviderStore>,
            Arc<dyn ChangeFeed>,
            Option<Arc<InMemoryProviderStore>>,
        ),
        ServiceError,
    > {
        let channel_feed = match config.feed.backend {
            FeedBackend::Memory => Some(Arc::new(ChannelChangeFeed::new(config.feed.buffer))),
            FeedBackend::Amqp => None,
        };

        let feed: Arc<dyn ChangeFeed> = match &channel_feed {
            Some(channel_feed) => {
                info!("Using in-process change feed");
                channel_feed.clone()
            }
            None => {
                let feed_config =
                    config
                        .amqp_feed_config()
                        .map_err(|e| ServiceError::Configuration {
                            message: format!("Failed to parse AMQP URL: {}", e),
                        })?;
                info!(
                    "Using AMQP change feed on exchange '{}'",
                    feed_config.exchange
                );
                Arc::new(AmqpChangeFeed::new(feed_config).with_metrics(collector.clone()))
            }
        };

        match config.store.backend {
            StoreBackend::Rest => {
                info!("Using REST provider store at {}", config.store.base_url);
                let store = RestProviderStore::new(config.rest_store_config()).map_err(|e| {
                    ServiceError::Initialization {
                        message: format!("Failed to create REST store: {}", e),
                    }
                })?;
                let store: Arc<dyn ProviderStore> = Arc::new(store);
                Ok((store, feed, None))
            }
            StoreBackend::Memory => {
                let store = Arc::new(match &channel_feed {
                    Some(channel_feed) => InMemoryProviderStore::with_publisher(channel_feed.clone()),
                    None => InMemoryProviderStore::new(),
                });

                if let Some(seed_file) = &config.store.seed_file {
                    store.load_seed_file(seed_file).await.map_err(|e| {
                        ServiceError::Configuration {
                            message: format!("Failed to seed in-memory store: {}", e),
                        }
                    })?;
                }

                info!(
                    "Using in-memory provider store with {} providers",
                    store.provider_count().await
                );
                let provider_store: Arc<dyn ProviderStore> = store.clone();
                Ok((provider_store, feed, Some(store)))
            }
        }
    }

    /// Initialize metrics service
    fn initialize_metrics(
        config: &AppConfig,
        collector: Arc<MetricsCollector>,
        directory: Arc<DirectoryCache>,
    ) -> Arc<MetricsService> {
        let health_config = HealthServerConfig {
            port: config.service.http_port,
            host: "0.0.0.0".to_string(),
            service_name: config.service.name.clone(),
        };

        let health_server =
            Arc::new(HealthServer::new(health_config, collector.clone()).with_directory(directory));
        Arc::new(MetricsService::new(collector, health_server))
    }

    /// Start metrics service
    async fn start_metrics_service(&mut self) -> Result<(), ServiceError> {
        info!("Starting metrics, health and directory endpoints");

        let metrics_service = self.metrics_service.clone();
        let port = self.config.service.http_port;

        let metrics_handle = tokio::spawn(async move {
            if let Err(e) = metrics_service.start().await {
                error!("Metrics service failed: {}", e);
            } else {
                info!("Metrics service task completed");
            }
        });

        self.background_tasks.push(metrics_handle);

        // Give the server a moment to bind
        tokio::time::sleep(Duration::from_millis(100)).await;

        info!("✅ HTTP endpoints started on port {}", port);
        Ok(())
    }

    /// Start background maintenance tasks
    fn start_background_tasks(&mut self) {
        info!(
            "Starting health metrics task ({}s interval)...",
            HEALTH_METRICS_INTERVAL.as_secs()
        );

        let health_metrics_task = {
            let metrics_collector = self.metrics_service.collector();
            let directory = self.directory.clone();
            let service_name = self.config.service.name.clone();
            let is_running = self.is_running.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(HEALTH_METRICS_INTERVAL);
                let start_time = tokio::time::Instant::now();
                info!("Health metrics task started");

                while *is_running.read().await {
                    interval.tick().await;

                    let uptime_seconds = start_time.elapsed().as_secs() as i64;
                    metrics_collector
                        .service()
                        .uptime_seconds
                        .set(uptime_seconds);

                    let health = HealthCheck::check(&directory, &service_name);
                    metrics_collector.update_health_status(health.status.as_metric());
                    for check in &health.checks {
                        metrics_collector.update_component_health(
                            &check.name,
                            check.status != HealthStatus::Unhealthy,
                        );
                    }

                    debug!(
                        "Updated service health metrics - uptime: {}s, status: {:?}, version: {}",
                        uptime_seconds, health.status, health.stats.version
                    );
                }

                info!("Health metrics task stopped");
            })
        };

        self.background_tasks.push(health_metrics_task);
        info!("{} background tasks running", self.background_tasks.len());
    }

    /// Stop all background tasks
    async fn stop_background_tasks(&mut self) {
        let task_count = self.background_tasks.len();
        if task_count == 0 {
            info!("No background tasks to stop");
            return;
        }

        info!("Stopping {} background tasks...", task_count);

        for (i, task) in self.background_tasks.drain(..).enumerate() {
            debug!("Aborting background task {}/{}", i + 1, task_count);
            task.abort();
        }

        info!("✅ All {} background tasks stopped", task_count);
    }
}
