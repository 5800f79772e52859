use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use slidegate::config::{SlidegateConfig, StoreBackend};
use slidegate::http::{HeaderIdentityResolver, HttpServer, RateLimitState};
use slidegate::ratelimit::{CounterStore, MemoryStore, RateLimiter, RedisStore};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "slidegate")]
#[command(about = "Distributed sliding-window rate limiting in front of HTTP routes")]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Override the Redis URL
    #[arg(long)]
    redis_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }

    info!("Starting Slidegate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = SlidegateConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(url) = args.redis_url {
        config.store.redis_url = url;
    }
    info!(
        http_addr = %config.server.http_addr,
        limit = config.limiter.request_limit_per_window,
        window_ms = config.limiter.window_size_ms,
        allow_if_store_down = config.limiter.allow_if_store_down,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let store_timeout = Duration::from_millis(config.store.timeout_ms);
    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Redis => {
            let store = RedisStore::new(&config.store.redis_url)?.with_timeout(store_timeout);
            match tokio::time::timeout(store_timeout, store.connect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "Redis not reachable at startup, will retry on demand")
                }
                Err(_) => warn!("Redis connection timed out at startup, will retry on demand"),
            }
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("Using in-process counter store, limits are not shared between replicas");
            Arc::new(MemoryStore::new())
        }
    };

    let limiter = RateLimiter::new(config.limiter, store)?
        .with_store_timeout(store_timeout)
        .with_key_prefix(config.store.key_prefix.clone());
    info!("Rate limiter initialized");

    let resolver = Arc::new(HeaderIdentityResolver::new(&config.server.identity_header)?);
    let state = RateLimitState::new(Arc::new(limiter), resolver)
        .with_trust_forwarded_for(config.server.trust_forwarded_for);

    let routes = Router::new().route("/", get(index));
    let server = HttpServer::new(config.server.http_addr, state);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(routes, shutdown_signal()).await?;

    info!("Slidegate Rate Limiting Service stopped");
    Ok(())
}

async fn index() -> Json<Value> {
    Json(json!({ "message": "Request admitted" }))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
