//! Main entry point for the provider directory service
//!
//! Loads configuration, starts the directory cache with its HTTP surface and
//! runs until SIGINT or SIGTERM, then shuts everything down gracefully.

use anyhow::Result;
use clap::Parser;
use provider_directory::config::{AppConfig, FeedBackend, StoreBackend};
use provider_directory::service::{AppState, HealthCheck, HealthStatus};
use std::path::PathBuf;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// How long `--health-check` waits for the first snapshot
const HEALTH_CHECK_LOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider Directory - near-real-time availability cache of service providers
#[derive(Parser)]
#[command(
    name = "provider-directory",
    version,
    about = "A near-real-time directory of available service providers",
    long_about = "Provider Directory keeps an in-memory snapshot of the service providers \
                 currently available for booking. It loads providers and their identities \
                 from a backing store, listens to a change feed for provider writes and \
                 republishes the snapshot after each change."
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Path to configuration file (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Perform health check and exit
    #[arg(long, help = "Load the directory once and exit with its health status")]
    health_check: bool,

    /// Log level override
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Override log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// AMQP URL override
    #[arg(long, value_name = "URL", help = "Override AMQP connection URL")]
    amqp_url: Option<String>,

    /// HTTP port override
    #[arg(long, value_name = "PORT", help = "Override HTTP server port")]
    http_port: Option<u16>,

    /// Store backend override
    #[arg(long, value_name = "BACKEND", help = "Provider store backend (rest, memory)")]
    store: Option<StoreBackend>,

    /// Feed backend override
    #[arg(long, value_name = "BACKEND", help = "Change feed backend (amqp, memory)")]
    feed: Option<FeedBackend>,

    /// Seed file for the in-memory store
    #[arg(long, value_name = "FILE", help = "JSON seed file for the in-memory store")]
    seed_file: Option<PathBuf>,

    /// Enable debug mode
    #[arg(short, long, help = "Enable debug mode with verbose logging")]
    debug: bool,

    /// Dry run mode (validate config and exit)
    #[arg(
        long,
        help = "Validate configuration and exit without starting service"
    )]
    dry_run: bool,
}

/// Initialize structured logging with the configured level
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Load the directory once and exit with its health status
async fn perform_health_check(config: AppConfig) -> Result<()> {
    info!("Performing health check...");

    let app_state = AppState::new(config).await?;
    let directory = app_state.directory();

    if let Err(e) = directory
        .wait_for_version(1, HEALTH_CHECK_LOAD_TIMEOUT)
        .await
    {
        warn!("Directory did not load: {}", e);
    }

    let health = HealthCheck::check(&directory, &app_state.config().service.name);
    directory.stop().await;

    println!("Health Check: {}", health.status);
    println!("  State: {}", health.stats.state);
    println!("  Snapshot version: {}", health.stats.version);
    println!("  Available providers: {}", health.stats.providers);
    println!(
        "  Refreshes: {} ok / {} failed",
        health.stats.refreshes_succeeded, health.stats.refreshes_failed
    );
    for check in health.checks.iter().filter(|c| c.message.is_some()) {
        println!(
            "  {}: {}",
            check.name,
            check.message.as_deref().unwrap_or_default()
        );
    }

    if health.status == HealthStatus::Healthy {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Wait for shutdown signals (SIGINT, SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C) signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// Display startup banner with service information
fn display_startup_banner(config: &AppConfig) {
    info!("🚀 Provider Directory Service");
    info!("   Service: {}", config.service.name);
    info!("   Log level: {}", config.service.log_level);
    info!("   HTTP port: {}", config.service.http_port);
    match config.store.backend {
        StoreBackend::Rest => info!("   Store: REST at {}", config.store.base_url),
        StoreBackend::Memory => info!(
            "   Store: in-memory (seed: {})",
            config
                .store
                .seed_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string())
        ),
    }
    match config.feed.backend {
        FeedBackend::Amqp => info!(
            "   Feed: AMQP exchange '{}' ({})",
            config.amqp.exchange_name, config.amqp.binding_key
        ),
        FeedBackend::Memory => info!("   Feed: in-process"),
    }
    info!(
        "   Refresh backoff: {}ms..{}ms, store timeout: {}ms",
        config.directory.refresh_backoff_base_ms,
        config.directory.refresh_backoff_cap_ms,
        config.directory.store_timeout_ms
    );
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

/// Load and merge configuration from environment and CLI arguments
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = if let Some(config_path) = &args.config {
        AppConfig::from_file(config_path)?
    } else {
        AppConfig::from_env()?
    };

    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }

    if args.debug {
        config.service.log_level = "debug".to_string();
    }

    if let Some(amqp_url) = &args.amqp_url {
        config.amqp.url = amqp_url.clone();
    }

    if let Some(http_port) = args.http_port {
        config.service.http_port = http_port;
    }

    if let Some(store) = args.store {
        config.store.backend = store;
    }

    if let Some(feed) = args.feed {
        config.feed.backend = feed;
    }

    if let Some(seed_file) = &args.seed_file {
        config.store.seed_file = Some(seed_file.clone());
    }

    provider_directory::config::validate_config(&config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // CLI args override environment/config file
    let config = load_config(&args).unwrap_or_else(|e| {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    });

    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    if args.health_check {
        return perform_health_check(config).await;
    }

    if args.dry_run {
        info!("Configuration validation successful");
        display_startup_banner(&config);
        info!("Dry run completed - exiting without starting service");
        return Ok(());
    }

    display_startup_banner(&config);

    info!("Initializing service components...");
    let mut app_state = match AppState::new(config).await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting service...");
    if let Err(e) = app_state.start().await {
        error!("Failed to start service: {}", e);
        std::process::exit(1);
    }

    info!("✅ Provider Directory Service is running");
    info!("Press Ctrl+C to shutdown gracefully...");

    wait_for_shutdown_signal().await;

    info!("🛑 Shutdown signal received, beginning graceful shutdown...");

    match app_state.shutdown().await {
        Ok(()) => info!("✅ Graceful shutdown completed successfully"),
        Err(e) => warn!("⚠️  Shutdown did not complete cleanly: {}", e),
    }

    info!("🛑 Provider Directory Service stopped");
    Ok(())
}
