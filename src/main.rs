//! Multi-Level Cache node
//!
//! Runs one cache manager process: builds the remote store, circuit breaker,
//! and registry from configuration, keeps the invalidation listener
//! subscribed, and serves health and Prometheus metrics endpoints.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        multilevel-cache node                          │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐  │
//! │  │ Health server  │  │ Metrics server │  │ Invalidation listener  │  │
//! │  │ /healthz       │  │ /metrics       │  │ (subscribe + backoff)  │  │
//! │  │ /readyz        │  │                │  │                        │  │
//! │  └───────┬────────┘  └───────┬────────┘  └───────────┬────────────┘  │
//! │          └───────────────────┼───────────────────────┘               │
//! │                  ┌───────────┴────────────┐                          │
//! │                  │ MultiLevelCacheManager │                          │
//! │                  └───────────┬────────────┘                          │
//! │                  ┌───────────┴────────────┐                          │
//! │                  │ CircuitBreaker + store │                          │
//! │                  └────────────────────────┘                          │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use multilevel_cache::{
    CircuitBreaker, CircuitState, Error, InMemoryRemoteStore, InvalidationListener,
    MultiLevelCacheConfig, MultiLevelCacheManager, RemoteStoreRef, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Multi-Level Cache - in-process cache over a shared remote store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Redis URL for the remote tier; the in-memory store is used when unset
    #[cfg(feature = "redis")]
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

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

    init_logging(&args);

    info!("Starting Multi-Level Cache node");
    info!("  Version: {}", multilevel_cache::VERSION);
    info!("  Health: {}", args.health_addr);
    info!("  Metrics: {}", args.metrics_addr);

    let config = match &args.config {
        Some(path) => {
            info!("  Config: {}", path.display());
            MultiLevelCacheConfig::from_yaml_file(path)?
        }
        None => MultiLevelCacheConfig::default(),
    };

    let remote = build_remote(&args)?;
    let breaker = Arc::new(CircuitBreaker::new(
        format!("{}-remote", multilevel_cache::NAME),
        config.circuit_breaker.clone(),
    ));
    let topic = config.topic.clone();
    let manager = Arc::new(MultiLevelCacheManager::new(config, remote.clone(), breaker)?);
    info!(caches = ?manager.get_cache_names(), "Cache manager ready");

    let shutdown = CancellationToken::new();

    let listener = InvalidationListener::new(manager.clone());
    let listener_task = listener.spawn(remote, topic, shutdown.clone());

    let health_addr = parse_addr(&args.health_addr, "health")?;
    let health_manager = manager.clone();
    let health_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_manager, health_shutdown).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = parse_addr(&args.metrics_addr, "metrics")?;
    let metrics_manager = manager.clone();
    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics_manager, metrics_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    if let Err(e) = listener_task.await {
        warn!("Invalidation listener ended abnormally: {}", e);
    }

    info!("Cache node shutdown complete");
    Ok(())
}

#[cfg(feature = "redis")]
fn build_remote(args: &Args) -> Result<RemoteStoreRef> {
    use multilevel_cache::{RedisRemoteConfig, RedisRemoteStore};

    match &args.redis_url {
        Some(url) => {
            let config = RedisRemoteConfig {
                url: url.clone(),
                ..Default::default()
            };
            Ok(Arc::new(RedisRemoteStore::new(&config)?))
        }
        None => Ok(in_memory_remote()),
    }
}

#[cfg(not(feature = "redis"))]
fn build_remote(_args: &Args) -> Result<RemoteStoreRef> {
    Ok(in_memory_remote())
}

fn in_memory_remote() -> RemoteStoreRef {
    info!("Using the in-memory remote store; invalidation stays within this process");
    InMemoryRemoteStore::shared()
}

fn parse_addr(addr: &str, server: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} server address: {}", server, e)))
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

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "redis=info", "moka=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

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
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(
    addr: SocketAddr,
    manager: Arc<MultiLevelCacheManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let manager = manager.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let manager = manager.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        // degraded (breaker open) still serves from the local tier
                        "/readyz" => {
                            let state = manager.circuit_breaker().state();
                            let body = match state {
                                CircuitState::Closed => "ok".to_string(),
                                other => format!("degraded: remote circuit {}", other),
                            };
                            text_response(StatusCode::OK, body)
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server bind error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

/// Prometheus collectors refreshed from cache and breaker snapshots on scrape
#[derive(Clone)]
struct CacheCollectors {
    requests: prometheus::IntGaugeVec,
    operations: prometheus::IntGaugeVec,
    entries: prometheus::IntGaugeVec,
    breaker_state: prometheus::IntGauge,
    breaker_calls: prometheus::IntGaugeVec,
    breaker_failure_rate: prometheus::Gauge,
    breaker_slow_call_rate: prometheus::Gauge,
}

impl CacheCollectors {
    fn register() -> std::result::Result<Self, prometheus::Error> {
        Ok(Self {
            requests: prometheus::register_int_gauge_vec!(
                "multilevel_cache_requests",
                "Lookups per cache, tier, and result since start",
                &["cache", "tier", "result"]
            )?,
            operations: prometheus::register_int_gauge_vec!(
                "multilevel_cache_operations",
                "Coordinator operations per cache since start",
                &["cache", "operation"]
            )?,
            entries: prometheus::register_int_gauge_vec!(
                "multilevel_cache_local_entries",
                "Approximate local-tier entry count",
                &["cache"]
            )?,
            breaker_state: prometheus::register_int_gauge!(
                "multilevel_cache_circuit_state",
                "Remote circuit breaker state (0 closed, 1 open, 2 half-open)"
            )?,
            breaker_calls: prometheus::register_int_gauge_vec!(
                "multilevel_cache_circuit_calls",
                "Remote calls through the circuit breaker by outcome",
                &["outcome"]
            )?,
            breaker_failure_rate: prometheus::register_gauge!(
                "multilevel_cache_circuit_failure_rate",
                "Failure rate of the breaker window in percent, -1 below minimum calls"
            )?,
            breaker_slow_call_rate: prometheus::register_gauge!(
                "multilevel_cache_circuit_slow_call_rate",
                "Slow-call rate of the breaker window in percent, -1 below minimum calls"
            )?,
        })
    }

    fn refresh(&self, manager: &MultiLevelCacheManager) {
        for cache in manager.caches() {
            let name = cache.name();
            let stats = cache.stats();

            for (tier, snapshot) in [("local", &stats.local), ("remote", &stats.remote)] {
                self.requests
                    .with_label_values(&[name, tier, "hit"])
                    .set(snapshot.hits as i64);
                self.requests
                    .with_label_values(&[name, tier, "miss"])
                    .set(snapshot.misses as i64);
                self.requests
                    .with_label_values(&[name, tier, "failure"])
                    .set(snapshot.failures as i64);
            }

            for (operation, count) in [
                ("load", stats.loads),
                ("load_failure", stats.load_failures),
                ("put", stats.puts),
                ("evict", stats.evictions),
                ("clear", stats.clears),
                ("broadcast", stats.broadcasts),
                ("invalidation_applied", stats.invalidations_applied),
                ("expiration", stats.expirations),
                ("capacity_eviction", stats.capacity_evictions),
            ] {
                self.operations
                    .with_label_values(&[name, operation])
                    .set(count as i64);
            }

            self.entries
                .with_label_values(&[name])
                .set(stats.local_entry_count as i64);
        }

        let breaker = manager.circuit_breaker().metrics();
        self.breaker_state.set(breaker.state as i64);
        for (outcome, count) in [
            ("success", breaker.successful_calls),
            ("failure", breaker.failed_calls),
            ("slow", breaker.slow_calls),
            ("timeout", breaker.timed_out_calls),
            ("not_permitted", breaker.not_permitted_calls),
        ] {
            self.breaker_calls
                .with_label_values(&[outcome])
                .set(count as i64);
        }
        self.breaker_failure_rate
            .set(breaker.failure_rate.map_or(-1.0, f64::from));
        self.breaker_slow_call_rate
            .set(breaker.slow_call_rate.map_or(-1.0, f64::from));
    }
}

fn encode_metrics() -> hyper::Response<hyper::Body> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return text_response(
            hyper::StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {}", e),
        );
    }

    let mut response = text_response(hyper::StatusCode::OK, buffer);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
    response
}

async fn run_metrics_server(
    addr: SocketAddr,
    manager: Arc<MultiLevelCacheManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let collectors = CacheCollectors::register()
        .map_err(|e| Error::Internal(format!("Metrics registration failed: {}", e)))?;

    let make_svc = make_service_fn(move |_conn| {
        let manager = manager.clone();
        let collectors = collectors.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let manager = manager.clone();
                let collectors = collectors.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            collectors.refresh(&manager);
                            encode_metrics()
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server bind error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
