//! Panel Cache Service
//!
//! Runs the cache maintenance loop and exposes health, status and metrics
//! endpoints for a multi-tier cache shared by panel orchestrator instances.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Panel Cache Service                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  L1 Memory   │───▶│  L2 Redis    │───▶│  L3 SQLite   │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │          ▲                                                       │
//! │  /healthz /readyz /status            /metrics                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use panel_cache::cache::{CacheConfig, CacheManager, RedisStore, SqliteBackend};
use panel_cache::error::{Error, Result};
use panel_cache::monitoring::CacheExporter;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Panel Cache - multi-tier response cache for expert-panel orchestration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "PANEL_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Redis URL for the shared tier (omit to run without L2)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// SQLite database file for the persistent tier (omit to run without L3)
    #[arg(long, env = "SQLITE_PATH")]
    sqlite_path: Option<PathBuf>,

    /// L1 memory budget in MiB, overrides the configuration file
    #[arg(long, env = "MEMORY_BUDGET_MB")]
    memory_budget_mb: Option<u64>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting Panel Cache");

    let mut config = match &args.config {
        Some(path) => {
            info!("  Config file: {}", path.display());
            CacheConfig::from_yaml_file(path)?
        }
        None => CacheConfig::default(),
    };
    if let Some(mb) = args.memory_budget_mb {
        config.memory_budget_bytes = mb * 1024 * 1024;
    }
    info!("  Memory budget: {} bytes", config.memory_budget_bytes);
    info!("  Namespaces: {}", config.namespaces.len());

    let mut builder = CacheManager::builder(config);

    if let Some(url) = &args.redis_url {
        let store = RedisStore::open(url)?;
        info!("  Shared tier: redis");
        builder = builder.shared_store(Arc::new(store));
    } else {
        warn!("No Redis URL given, running without the shared tier");
    }

    if let Some(path) = &args.sqlite_path {
        let backend = SqliteBackend::open(path).await?;
        info!("  Persistent tier: {}", path.display());
        builder = builder.persistent_backend(Arc::new(backend));
    } else {
        warn!("No SQLite path given, running without the persistent tier");
    }

    let cache = Arc::new(builder.build()?);

    let report = cache.health_check().await;
    for tier in &report.tiers {
        match &tier.message {
            Some(message) => info!("  {} tier {}: {}", tier.tier, tier.status, message),
            None => info!("  {} tier {}", tier.tier, tier.status),
        }
    }

    // Start background maintenance
    let maintenance = cache.spawn_maintenance();

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_cache = cache.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_cache).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let exporter = Arc::new(CacheExporter::new()?);
    let metrics_addr = args.metrics_addr.clone();
    let metrics_cache = cache.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_cache, exporter).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    cache.shutdown().await;
    if let Err(e) = maintenance.await {
        error!("Maintenance task failed: {}", e);
    }

    let stats = cache.stats();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        cost_saved = stats.cost_saved,
        "Panel Cache shutdown complete"
    );
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = ["hyper=warn", "sqlx=warn", "redis=info"]
        .iter()
        .filter_map(|d| d.parse::<Directive>().ok())
        .fold(
            EnvFilter::from_default_env().add_directive(level.into()),
            |filter, directive| filter.add_directive(directive),
        );

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// HTTP Helpers
// =============================================================================

fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            format!("serialization failed: {}", e),
        ),
    }
}

async fn bind(addr: &str, name: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid {} server address: {}", name, e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {} server: {}", name, e)))?;

    info!("{} server listening on {}", name, addr);
    Ok(listener)
}

// =============================================================================
// Health Server
// =============================================================================

async fn health_handler(
    req: Request<Incoming>,
    cache: Arc<CacheManager>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/healthz" | "/livez" => respond(StatusCode::OK, "text/plain", "ok"),
        "/readyz" => {
            let report = cache.health_check().await;
            let status = if report.is_serving() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json(status, &report)
        }
        "/status" => json(StatusCode::OK, &cache.status().await),
        "/popular" => json(StatusCode::OK, &cache.popular_entries(20)),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    };
    Ok(response)
}

async fn run_health_server(addr: &str, cache: Arc<CacheManager>) -> Result<()> {
    let listener = bind(addr, "Health").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Health server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let cache = cache.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| health_handler(req, cache.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn metrics_handler(
    req: Request<Incoming>,
    cache: Arc<CacheManager>,
    exporter: Arc<CacheExporter>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            exporter.update(&cache.stats());
            exporter.update_health(&cache.health_check().await);

            match exporter.render() {
                Ok(text) => respond(StatusCode::OK, exporter.content_type(), text),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                ),
            }
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    };
    Ok(response)
}

async fn run_metrics_server(
    addr: &str,
    cache: Arc<CacheManager>,
    exporter: Arc<CacheExporter>,
) -> Result<()> {
    let listener = bind(addr, "Metrics").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let cache = cache.clone();
        let exporter = exporter.clone();

        tokio::spawn(async move {
            let service =
                service_fn(move |req| metrics_handler(req, cache.clone(), exporter.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
