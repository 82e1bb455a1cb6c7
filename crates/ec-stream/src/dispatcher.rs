//! Subscriber dispatcher
//!
//! Fans published events out to registered subscribers. Each subscriber is
//! its own inbox consumer (`{prefix}.{subscriber_name}`) with its own retry
//! state, so a failing subscriber retries on its own schedule without
//! blocking delivery to the others and without touching outbox status.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use ec_common::{envelope, EventContext, IntegrationEventEnvelope, SubscriberRetryStatus};
use ec_store::{InboxStore, OutboxStore, PublishedScan, SubscriberRetryStore};

#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn handle(&self, envelope: &IntegrationEventEnvelope, ctx: &EventContext) -> Result<()>;
}

/// One subscriber bound to one event name (and optionally one schema
/// version).
#[derive(Clone)]
pub struct SubscriberRegistration {
    pub subscriber_name: String,
    pub event_name: String,
    /// `None` accepts any version of the event.
    pub event_version: Option<i32>,
    /// Per-subscriber handler deadline; falls back to the dispatcher default.
    pub timeout: Option<Duration>,
    pub handler: Arc<dyn Subscriber>,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Inbox consumer names are `{consumer_prefix}.{subscriber_name}`.
    pub consumer_prefix: String,
    pub default_timeout: Duration,
    pub batch_size: u32,
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            consumer_prefix: "subscriber".to_string(),
            default_timeout: Duration::from_millis(30_000),
            batch_size: 100,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchSummary {
    pub scanned: usize,
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
    pub dead: usize,
}

pub struct SubscriberDispatcher {
    store: Arc<dyn OutboxStore>,
    inbox: Arc<dyn InboxStore>,
    retry_store: Arc<dyn SubscriberRetryStore>,
    registrations: Vec<SubscriberRegistration>,
    config: DispatcherConfig,
}

impl SubscriberDispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        inbox: Arc<dyn InboxStore>,
        retry_store: Arc<dyn SubscriberRetryStore>,
        registrations: Vec<SubscriberRegistration>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            inbox,
            retry_store,
            registrations,
            config,
        }
    }

    fn consumer_name(&self, registration: &SubscriberRegistration) -> String {
        format!(
            "{}.{}",
            self.config.consumer_prefix, registration.subscriber_name
        )
    }

    pub async fn start(&self) {
        info!(
            subscribers = self.registrations.len(),
            "Starting subscriber dispatcher"
        );
        loop {
            if let Err(e) = self.dispatch_batch().await {
                error!("Error dispatching subscriber batch: {}", e);
            }
            sleep(self.config.poll_interval).await;
        }
    }

    pub async fn dispatch_batch(&self) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary::default();
        for registration in &self.registrations {
            self.dispatch_for(registration, &mut summary).await?;
        }
        if summary.scanned > 0 {
            info!(
                scanned = summary.scanned,
                delivered = summary.delivered,
                skipped = summary.skipped,
                failed = summary.failed,
                dead = summary.dead,
                "Dispatch batch complete"
            );
        }
        Ok(summary)
    }

    async fn dispatch_for(
        &self,
        registration: &SubscriberRegistration,
        summary: &mut DispatchSummary,
    ) -> Result<()> {
        let consumer_name = self.consumer_name(registration);
        // The scan itself excludes rows that are dead or inside a backoff
        // window for this subscriber, so a stuck old row cannot occupy the
        // oldest-first window and starve newer events out of the batch.
        let scan = PublishedScan {
            event_names: Some(vec![registration.event_name.clone()]),
            event_version: registration.event_version,
            consumer_name: consumer_name.clone(),
            subscriber_name: Some(registration.subscriber_name.clone()),
        };
        let records = self
            .store
            .fetch_published(&scan, self.config.batch_size)
            .await?;
        summary.scanned += records.len();

        for record in &records {
            let parsed = match envelope::parse_for_row(record) {
                Ok(parsed) => parsed,
                Err(e) => {
                    // Unrecoverable data problem; record the inbox mark so
                    // this subscriber stops seeing the row.
                    warn!(
                        event_id = %record.event_id,
                        subscriber = %registration.subscriber_name,
                        "Invalid envelope, skipping delivery permanently: {}", e
                    );
                    self.inbox
                        .mark_processed(&record.tenant_id, &record.event_id, &consumer_name)
                        .await?;
                    summary.skipped += 1;
                    continue;
                }
            };

            let ctx = EventContext::from_envelope(&parsed);
            let deadline = registration.timeout.unwrap_or(self.config.default_timeout);
            let outcome =
                match tokio::time::timeout(deadline, registration.handler.handle(&parsed, &ctx))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!(
                        "subscriber timed out after {}ms",
                        deadline.as_millis()
                    )),
                };

            match outcome {
                Ok(()) => {
                    self.retry_store
                        .clear(&record.event_id, &registration.subscriber_name)
                        .await?;
                    self.inbox
                        .mark_processed(&record.tenant_id, &record.event_id, &consumer_name)
                        .await?;
                    debug!(
                        event_id = %record.event_id,
                        subscriber = %registration.subscriber_name,
                        "Delivered event to subscriber"
                    );
                    summary.delivered += 1;
                }
                Err(e) => {
                    let state = self
                        .retry_store
                        .record_failure(
                            &record.event_id,
                            &registration.subscriber_name,
                            &e.to_string(),
                        )
                        .await?;
                    match state.status {
                        SubscriberRetryStatus::Retrying => {
                            warn!(
                                event_id = %record.event_id,
                                subscriber = %registration.subscriber_name,
                                retry_count = state.retry_count,
                                next_retry_at = ?state.next_retry_at,
                                "Subscriber delivery failed, scheduled for retry: {}", e
                            );
                            summary.failed += 1;
                        }
                        SubscriberRetryStatus::Dead => {
                            error!(
                                event_id = %record.event_id,
                                subscriber = %registration.subscriber_name,
                                retry_count = state.retry_count,
                                "Subscriber delivery failed permanently: {}", e
                            );
                            summary.dead += 1;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
