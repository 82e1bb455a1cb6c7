//! EventConduit Stream Processor
//!
//! Consumes `published` outbox rows without mutating them: a projection
//! processor feeds a read-model endpoint, and a subscriber dispatcher fans
//! events out to per-subscriber HTTP endpoints with isolated retry state.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `EC_DB_URL` | - | PostgreSQL connection URL (required) |
//! | `EC_PROJECTION_URL` | - | Read-model HTTP endpoint; projections run only if set |
//! | `EC_PROJECTION_EVENTS` | all | Comma-separated projection allow-list |
//! | `EC_SUBSCRIBERS` | - | Comma-separated `name\|event_name\|url` entries |
//! | `EC_SUBSCRIBER_PREFIX` | `subscriber` | Dispatcher consumer-name prefix |
//! | `EC_SUBSCRIBER_BACKOFF_BASE_S` | `5` | Subscriber backoff base seconds |
//! | `EC_SUBSCRIBER_BACKOFF_MAX_S` | `300` | Subscriber backoff cap seconds |
//! | `EC_SUBSCRIBER_MAX_RETRIES` | `20` | Subscriber retry ceiling |
//! | `EC_SUBSCRIBER_TIMEOUT_MS` | `30000` | Default subscriber handler timeout |
//! | `EC_POLL_INTERVAL_MS` | `1000` | Poll interval in milliseconds |
//! | `EC_BATCH_SIZE` | `100` | Max rows per scan |
//! | `EC_METRICS_PORT` | `9090` | Metrics/health port |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ec_common::{EventContext, IntegrationEventEnvelope, OutboxRecord, RetryPolicy};
use ec_store::PostgresStore;
use ec_stream::{
    DispatcherConfig, ProjectionConfig, ProjectionHandler, ProjectionProcessor, Subscriber,
    SubscriberDispatcher, SubscriberRegistration,
};

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

    info!("Starting EventConduit Stream Processor");

    // Configuration
    let db_url = env_required("EC_DB_URL")?;
    let poll_interval_ms: u64 = env_or_parse("EC_POLL_INTERVAL_MS", 1000);
    let batch_size: u32 = env_or_parse("EC_BATCH_SIZE", 100);
    let timeout_ms: u64 = env_or_parse("EC_SUBSCRIBER_TIMEOUT_MS", 30_000);
    let metrics_port: u16 = env_or_parse("EC_METRICS_PORT", 9090);

    let subscriber_policy = RetryPolicy {
        base_seconds: env_or_parse("EC_SUBSCRIBER_BACKOFF_BASE_S", 5),
        max_seconds: env_or_parse("EC_SUBSCRIBER_BACKOFF_MAX_S", 300),
        max_retries: env_or_parse("EC_SUBSCRIBER_MAX_RETRIES", 20),
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
        RetryPolicy::outbox(),
        subscriber_policy,
    ));
    store.init_schema().await?;
    info!("PostgreSQL store initialized");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()?;

    let mut worker_handles = Vec::new();

    // Projection processor, when a read-model endpoint is configured
    if let Ok(projection_url) = std::env::var("EC_PROJECTION_URL") {
        let event_names = std::env::var("EC_PROJECTION_EVENTS").ok().map(|names| {
            names
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        });
        let handler = Arc::new(HttpTarget::new(client.clone(), projection_url.clone()));
        let processor = ProjectionProcessor::new(
            store.clone(),
            store.clone(),
            handler,
            ProjectionConfig {
                event_names,
                batch_size,
                poll_interval: Duration::from_millis(poll_interval_ms),
                ..Default::default()
            },
        );
        info!("Projection processor targeting {}", projection_url);
        let mut shutdown_rx = shutdown_tx.subscribe();
        worker_handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = processor.start() => {}
                _ = shutdown_rx.recv() => {
                    info!("Projection processor shutting down");
                }
            }
        }));
    }

    // Subscriber dispatcher, when subscribers are configured
    if let Ok(spec) = std::env::var("EC_SUBSCRIBERS") {
        let registrations = parse_subscribers(&spec, &client)?;
        info!("Dispatching to {} subscribers", registrations.len());
        let dispatcher = SubscriberDispatcher::new(
            store.clone(),
            store.clone(),
            store.clone(),
            registrations,
            DispatcherConfig {
                consumer_prefix: env_or("EC_SUBSCRIBER_PREFIX", "subscriber"),
                default_timeout: Duration::from_millis(timeout_ms),
                batch_size,
                poll_interval: Duration::from_millis(poll_interval_ms),
            },
        );
        let mut shutdown_rx = shutdown_tx.subscribe();
        worker_handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = dispatcher.start() => {}
                _ = shutdown_rx.recv() => {
                    info!("Subscriber dispatcher shutting down");
                }
            }
        }));
    }

    if worker_handles.is_empty() {
        return Err(anyhow::anyhow!(
            "Nothing to run: set EC_PROJECTION_URL and/or EC_SUBSCRIBERS"
        ));
    }

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

    info!("EventConduit Stream Processor started");
    info!("Press Ctrl+C to shutdown");

    // Wait for shutdown
    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        for handle in worker_handles {
            let _ = handle.await;
        }
        let _ = metrics_handle.await;
    })
    .await;

    info!("EventConduit Stream Processor shutdown complete");
    Ok(())
}

/// Parse `name|event_name|url` entries, comma-separated.
fn parse_subscribers(spec: &str, client: &reqwest::Client) -> Result<Vec<SubscriberRegistration>> {
    let mut registrations = Vec::new();
    for entry in spec.split(',').filter(|e| !e.trim().is_empty()) {
        let parts: Vec<&str> = entry.trim().splitn(3, '|').collect();
        let [name, event_name, url] = parts.as_slice() else {
            return Err(anyhow::anyhow!(
                "Invalid subscriber entry '{}': expected name|event_name|url",
                entry
            ));
        };
        registrations.push(SubscriberRegistration {
            subscriber_name: name.to_string(),
            event_name: event_name.to_string(),
            event_version: None,
            timeout: None,
            handler: Arc::new(HttpTarget::new(client.clone(), url.to_string())),
        });
    }
    Ok(registrations)
}

// HTTP delivery target, shared by projections and subscribers
struct HttpTarget {
    client: reqwest::Client,
    url: String,
}

impl HttpTarget {
    fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }

    async fn post(&self, envelope: &IntegrationEventEnvelope) -> Result<()> {
        let response = self.client.post(&self.url).json(envelope).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("HTTP {}: {}", status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl ProjectionHandler for HttpTarget {
    async fn project(
        &self,
        _record: &OutboxRecord,
        envelope: &IntegrationEventEnvelope,
        _ctx: &EventContext,
    ) -> Result<()> {
        self.post(envelope).await
    }
}

#[async_trait]
impl Subscriber for HttpTarget {
    async fn handle(&self, envelope: &IntegrationEventEnvelope, _ctx: &EventContext) -> Result<()> {
        self.post(envelope).await
    }
}

async fn metrics_handler() -> String {
    "# HELP ec_stream_up Stream processor is up\n# TYPE ec_stream_up gauge\nec_stream_up 1\n"
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
