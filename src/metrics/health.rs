//! Health, metrics and directory read endpoints
//!
//! Serves the probes, the Prometheus text exposition and a JSON view of the
//! current directory snapshot using Axum.

use crate::directory::{DirectoryCache, DirectoryReader};
use crate::metrics::collector::MetricsCollector;
use crate::service::health::{HealthCheck, HealthStatus};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Health server configuration
#[derive(Debug, Clone)]
pub struct HealthServerConfig {
    /// Port to bind the health server to
    pub port: u16,
    /// Host to bind to (typically "0.0.0.0" for all interfaces)
    pub host: String,
    /// Service name reported in responses
    pub service_name: String,
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            service_name: "provider-directory".to_string(),
        }
    }
}

/// Shared state for the health server
#[derive(Clone)]
pub struct HealthServerState {
    pub metrics_collector: Arc<MetricsCollector>,
    pub directory: Option<Arc<DirectoryCache>>,
    pub service_name: String,
}

/// HTTP server for monitoring and directory reads
pub struct HealthServer {
    config: HealthServerConfig,
    state: HealthServerState,
    shutdown_tx: broadcast::Sender<()>,
}

impl HealthServer {
    /// Create a new health server
    pub fn new(config: HealthServerConfig, metrics_collector: Arc<MetricsCollector>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let service_name = config.service_name.clone();

        Self {
            config,
            state: HealthServerState {
                metrics_collector,
                directory: None,
                service_name,
            },
            shutdown_tx,
        }
    }

    /// Serve probes and reads from `directory`
    pub fn with_directory(mut self, directory: Arc<DirectoryCache>) -> Self {
        self.state.directory = Some(directory);
        self
    }

    /// Start the health server
    pub async fn start(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .context("Invalid health server address")?;

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        info!("Health server listening on http://{}", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Health server shutdown signal received");
            })
            .await?;

        info!("Health server stopped");
        Ok(())
    }

    /// The Axum router with every endpoint
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/alive", get(alive_handler))
            .route("/metrics", get(metrics_handler))
            .route("/stats", get(stats_handler))
            .route("/providers", get(providers_handler))
            .route("/providers/{id}", get(provider_handler))
            .route("/refresh", post(refresh_handler))
            .with_state(self.state.clone())
    }

    /// Stop the health server
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping health server...");

        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to send shutdown signal to health server: {}", e);
        }

        Ok(())
    }
}

fn not_initialized(service: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "service": service,
            "status": "unhealthy",
            "error": "Service not initialized",
            "timestamp": chrono::Utc::now()
        })),
    )
        .into_response()
}

/// Root endpoint handler - shows service information
async fn root_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    Json(json!({
        "service": state.service_name,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "/health",
            "/ready",
            "/alive",
            "/metrics",
            "/stats",
            "/providers",
            "/providers/{id}",
            "/refresh"
        ]
    }))
}

/// Lightweight health check endpoint handler
async fn health_handler(State(state): State<HealthServerState>) -> Response {
    debug!("Health check requested");

    let Some(directory) = &state.directory else {
        return not_initialized(&state.service_name);
    };

    let status = HealthCheck::liveness_check(directory);
    let code = match status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };

    (
        code,
        Json(json!({
            "status": status,
            "service": state.service_name,
            "version": env!("CARGO_PKG_VERSION"),
            "cache_state": directory.state(),
            "snapshot_version": directory.get().version()
        })),
    )
        .into_response()
}

/// Readiness check endpoint handler
async fn ready_handler(State(state): State<HealthServerState>) -> Response {
    debug!("Readiness check requested");

    let Some(directory) = &state.directory else {
        return (StatusCode::SERVICE_UNAVAILABLE, "Service not initialized").into_response();
    };

    match HealthCheck::readiness_check(directory) {
        HealthStatus::Healthy => (StatusCode::OK, "Ready").into_response(),
        HealthStatus::Degraded => (StatusCode::OK, "Degraded but ready").into_response(),
        HealthStatus::Unhealthy => (StatusCode::SERVICE_UNAVAILABLE, "Not ready").into_response(),
    }
}

/// Liveness check endpoint handler
async fn alive_handler(State(state): State<HealthServerState>) -> Response {
    debug!("Liveness check requested");

    match &state.directory {
        Some(directory) => match HealthCheck::liveness_check(directory) {
            HealthStatus::Healthy => (StatusCode::OK, "Alive").into_response(),
            _ => (StatusCode::SERVICE_UNAVAILABLE, "Not alive").into_response(),
        },
        None => (StatusCode::SERVICE_UNAVAILABLE, "Service not initialized").into_response(),
    }
}

/// Prometheus metrics endpoint handler
async fn metrics_handler(State(state): State<HealthServerState>) -> Response {
    debug!("Metrics endpoint requested");

    let metric_families = state.metrics_collector.registry().gather();
    let encoder = TextEncoder::new();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics_output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            metrics_output,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics".to_string(),
            )
                .into_response()
        }
    }
}

/// Detailed service statistics endpoint handler
async fn stats_handler(State(state): State<HealthServerState>) -> Response {
    debug!("Stats endpoint requested");

    let Some(directory) = &state.directory else {
        return not_initialized(&state.service_name);
    };

    let health = HealthCheck::check(directory, &state.service_name);
    let stats = json!({
        "service": {
            "name": health.service,
            "version": health.version,
            "status": health.status
        },
        "directory": health.stats,
        "components": health.checks,
        "timestamp": health.timestamp
    });

    (StatusCode::OK, Json(stats)).into_response()
}

/// Current snapshot of available providers
async fn providers_handler(State(state): State<HealthServerState>) -> Response {
    let Some(directory) = &state.directory else {
        return not_initialized(&state.service_name);
    };

    let snapshot = directory.current_available();
    (
        StatusCode::OK,
        Json(json!({
            "version": snapshot.version(),
            "built_at": snapshot.built_at(),
            "count": snapshot.len(),
            "providers": snapshot.entries()
        })),
    )
        .into_response()
}

/// One provider from the current snapshot
async fn provider_handler(
    State(state): State<HealthServerState>,
    Path(provider_id): Path<String>,
) -> Response {
    let Some(directory) = &state.directory else {
        return not_initialized(&state.service_name);
    };

    let snapshot = directory.current_available();
    match snapshot.find(&provider_id) {
        Some(entry) => (
            StatusCode::OK,
            Json(json!({
                "version": snapshot.version(),
                "provider": entry
            })),
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": format!("Provider {} is not available", provider_id),
                "version": snapshot.version()
            })),
        )
            .into_response(),
    }
}

/// Force a full refresh and report the resulting version
async fn refresh_handler(State(state): State<HealthServerState>) -> Response {
    let Some(directory) = &state.directory else {
        return not_initialized(&state.service_name);
    };

    match directory.refresh_now().await {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(json!({
                "version": snapshot.version(),
                "count": snapshot.len()
            })),
        )
            .into_response(),
        Err(e) => {
            warn!("Requested refresh failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": e.to_string(),
                    "version": directory.get().version()
                })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DirectoryConfig;
    use crate::feed::ChannelChangeFeed;
    use crate::store::InMemoryProviderStore;
    use crate::types::{IdentityRecord, ProviderRecord, Vehicle};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use std::time::Duration;
    use tower::ServiceExt; // for oneshot

    fn server() -> HealthServer {
        let collector = Arc::new(MetricsCollector::new().expect("Failed to create collector"));
        HealthServer::new(HealthServerConfig::default(), collector)
    }

    async fn server_with_directory() -> (HealthServer, Arc<DirectoryCache>) {
        let store = Arc::new(InMemoryProviderStore::new());
        store
            .upsert_provider(ProviderRecord {
                id: "d-1".to_string(),
                user_id: "u-1".to_string(),
                available: true,
                rating: 4.9,
                price_per_km: 2.5,
                vehicle: Vehicle {
                    make: Some("Toyota".to_string()),
                    model: "Corolla".to_string(),
                    color: "Silver".to_string(),
                    year: 2021,
                    plate: "RIO4F22".to_string(),
                },
                profile_photo_url: None,
                car_photo_url: None,
            })
            .await
            .unwrap();
        store
            .upsert_identity("u-1", IdentityRecord::new("Bruna", "555-0142"))
            .await;

        let collector = Arc::new(MetricsCollector::new().expect("Failed to create collector"));
        let cache = Arc::new(DirectoryCache::start_with_metrics(
            store,
            Arc::new(ChannelChangeFeed::new(8)),
            DirectoryConfig::default(),
            collector.clone(),
        ));
        cache
            .wait_for_version(1, Duration::from_secs(5))
            .await
            .unwrap();

        let server =
            HealthServer::new(HealthServerConfig::default(), collector).with_directory(cache.clone());
        (server, cache)
    }

    async fn send_get(app: Router, uri: &str) -> Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_root_endpoint() {
        let response = send_get(server().router(), "/").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (server, cache) = server_with_directory().await;

        let response = send_get(server.router(), "/metrics").await;
        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("text/plain"));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("provider_directory_snapshot_version 1"));
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_endpoints_without_directory() {
        let app = server().router();

        for uri in ["/health", "/ready", "/alive", "/stats", "/providers", "/providers/x"] {
            let response = send_get(app.clone(), uri).await;
            assert_eq!(
                response.status(),
                StatusCode::SERVICE_UNAVAILABLE,
                "unexpected status for {}",
                uri
            );
        }
    }

    #[tokio::test]
    async fn test_probes_with_loaded_directory() {
        let (server, cache) = server_with_directory().await;
        let app = server.router();

        assert_eq!(send_get(app.clone(), "/health").await.status(), StatusCode::OK);
        assert_eq!(send_get(app.clone(), "/ready").await.status(), StatusCode::OK);
        assert_eq!(send_get(app.clone(), "/alive").await.status(), StatusCode::OK);

        let stats = body_json(send_get(app, "/stats").await).await;
        assert_eq!(stats["directory"]["version"], 1);
        assert_eq!(stats["directory"]["state"], "ready");
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_providers_endpoints() {
        let (server, cache) = server_with_directory().await;
        let app = server.router();

        let listing = body_json(send_get(app.clone(), "/providers").await).await;
        assert_eq!(listing["version"], 1);
        assert_eq!(listing["count"], 1);
        assert_eq!(listing["providers"][0]["identity"]["name"], "Bruna");
        assert_eq!(listing["providers"][0]["provider"]["vehicle_model"], "Corolla");

        let found = send_get(app.clone(), "/providers/d-1").await;
        assert_eq!(found.status(), StatusCode::OK);

        let missing = send_get(app, "/providers/d-404").await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_refresh_endpoint() {
        let (server, cache) = server_with_directory().await;

        let response = server
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/refresh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["version"], 2);
        cache.stop().await;
    }

    #[test]
    fn test_health_server_config() {
        let config = HealthServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.service_name, "provider-directory");
    }

    #[tokio::test]
    async fn test_404_handling() {
        let response = send_get(server().router(), "/nonexistent").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
