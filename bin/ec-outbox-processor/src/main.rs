//! EventConduit Outbox Processor
//!
//! Claims pending integration events from the PostgreSQL outbox and either
//! processes them in place (default) or hands them to a broker endpoint in
//! publisher mode. A stale-processing reaper runs alongside either mode.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `EC_DB_URL` | - | PostgreSQL connection URL (required) |
//! | `EC_OUTBOX_MODE` | `processor` | `processor` or `publisher` |
//! | `EC_ENDPOINT_URL` | - | Downstream HTTP endpoint (required) |
//! | `EC_ENDPOINT_TOKEN` | - | Optional Bearer token for the endpoint |
//! | `EC_POLL_INTERVAL_MS` | `1000` | Poll interval in milliseconds |
//! | `EC_BATCH_SIZE` | `100` | Max rows per claim |
//! | `EC_MAX_RETRIES` | `10` | Outbox retry budget |
//! | `EC_BACKOFF_BASE_S` | `1` | Backoff base in seconds |
//! | `EC_BACKOFF_MAX_S` | `300` | Backoff cap in seconds |
//! | `EC_CONSUMER_NAME` | `outbox-processor` | Inbox consumer name |
//! | `EC_CLAIM_QUEUED` | `false` | Also claim `queued` rows (drain a publisher stage) |
//! | `EC_REAPER_STALE_AFTER_MS` | `60000` | Processing staleness threshold |
//! | `EC_REAPER_INTERVAL_MS` | `30000` | Reaper poll interval |
//! | `EC_REQUEST_TIMEOUT_MS` | `30000` | HTTP request timeout |
//! | `EC_METRICS_PORT` | `9090` | Metrics/health port |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ec_common::{OutboxStatus, RetryPolicy};
use ec_outbox::{
    HttpEventHandler, HttpEventHandlerConfig, OutboxProcessor, OutboxPublisher, ProcessorConfig,
    PublisherConfig, ReaperConfig, StaleReaper,
};
use ec_store::PostgresStore;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} environment variable is required", key))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting EventConduit Outbox Processor");

    // Configuration
    let mode = env_or("EC_OUTBOX_MODE", "processor");
    let db_url = env_required("EC_DB_URL")?;
    let endpoint_url = env_required("EC_ENDPOINT_URL")?;
    let endpoint_token = std::env::var("EC_ENDPOINT_TOKEN").ok();
    let poll_interval_ms: u64 = env_or_parse("EC_POLL_INTERVAL_MS", 1000);
    let batch_size: u32 = env_or_parse("EC_BATCH_SIZE", 100);
    let consumer_name = env_or("EC_CONSUMER_NAME", "outbox-processor");
    let claim_queued: bool = env_or_parse("EC_CLAIM_QUEUED", false);
    let reaper_stale_after_ms: u64 = env_or_parse("EC_REAPER_STALE_AFTER_MS", 60_000);
    let reaper_interval_ms: u64 = env_or_parse("EC_REAPER_INTERVAL_MS", 30_000);
    let request_timeout_ms: u64 = env_or_parse("EC_REQUEST_TIMEOUT_MS", 30_000);
    let metrics_port: u16 = env_or_parse("EC_METRICS_PORT", 9090);

    let outbox_policy = RetryPolicy {
        base_seconds: env_or_parse("EC_BACKOFF_BASE_S", 1),
        max_seconds: env_or_parse("EC_BACKOFF_MAX_S", 300),
        max_retries: env_or_parse("EC_MAX_RETRIES", 10),
    };

    // Setup shutdown signal
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Initialize store
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;
    let store = Arc::new(PostgresStore::new(
        pool,
        outbox_policy,
        RetryPolicy::subscriber(),
    ));
    store.init_schema().await?;
    info!("PostgreSQL outbox store initialized");

    // Initialize the downstream HTTP handler
    let handler = Arc::new(HttpEventHandler::new(HttpEventHandlerConfig {
        endpoint: endpoint_url.clone(),
        auth_token: endpoint_token,
        request_timeout: Duration::from_millis(request_timeout_ms),
        ..Default::default()
    })?);
    info!("HTTP handler initialized: {}", endpoint_url);

    // Start the worker for the selected mode
    let worker_handle = match mode.as_str() {
        "processor" => {
            let mut claim_statuses = vec![OutboxStatus::Pending, OutboxStatus::Failed];
            if claim_queued {
                claim_statuses.push(OutboxStatus::Queued);
            }
            let processor = OutboxProcessor::new(
                store.clone(),
                store.clone(),
                handler,
                ProcessorConfig {
                    consumer_name,
                    claim_statuses,
                    batch_size,
                    poll_interval: Duration::from_millis(poll_interval_ms),
                    ..Default::default()
                },
            );
            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    _ = processor.start() => {}
                    _ = shutdown_rx.recv() => {
                        info!("Outbox processor shutting down");
                    }
                }
            })
        }
        "publisher" => {
            let publisher = OutboxPublisher::new(
                store.clone(),
                handler,
                PublisherConfig {
                    batch_size,
                    poll_interval: Duration::from_millis(poll_interval_ms),
                    ..Default::default()
                },
            );
            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    _ = publisher.start() => {}
                    _ = shutdown_rx.recv() => {
                        info!("Outbox publisher shutting down");
                    }
                }
            })
        }
        other => {
            return Err(anyhow::anyhow!(
                "Unknown outbox mode: {}. Use processor or publisher",
                other
            ));
        }
    };
    info!("Outbox worker started in {} mode", mode);

    // Start the stale-processing reaper
    let reaper = StaleReaper::new(
        store.clone(),
        ReaperConfig {
            stale_after: Duration::from_millis(reaper_stale_after_ms),
            poll_interval: Duration::from_millis(reaper_interval_ms),
            batch_size,
            ..Default::default()
        },
    );
    let reaper_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = reaper.start() => {}
                _ = shutdown_rx.recv() => {
                    info!("Stale reaper shutting down");
                }
            }
        })
    };

    // Start metrics server
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    info!("Metrics server listening on http://{}/metrics", metrics_addr);

    let metrics_app = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics_handler))
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(ready_handler));

    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    let metrics_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(metrics_listener, metrics_app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    info!("EventConduit Outbox Processor started");
    info!("Press Ctrl+C to shutdown");

    // Wait for shutdown
    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = worker_handle.await;
        let _ = reaper_handle.await;
        let _ = metrics_handle.await;
    })
    .await;

    info!("EventConduit Outbox Processor shutdown complete");
    Ok(())
}

async fn metrics_handler() -> String {
    "# HELP ec_outbox_up Outbox processor is up\n# TYPE ec_outbox_up gauge\nec_outbox_up 1\n"
        .to_string()
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "READY"
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
