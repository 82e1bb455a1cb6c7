//! Publisher stage
//!
//! Optional stage between `pending` and full handler execution: validates the
//! envelope and hands it to an external broker, advancing the row to `queued`.
//! `published` stays reserved for terminal consumption success, so a
//! downstream processor configured to claim `queued` rows finishes the job.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{BatchSummary, RowOutcome};
use ec_common::{envelope, IntegrationEventEnvelope, OutboxRecord, OutboxStatus};
use ec_store::{FailureOutcome, OutboxStore};

/// Hand-off to the downstream broker (SQS, Kafka, HTTP ingest, ...).
/// Delivery semantics past this call belong to the broker.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    async fn publish(
        &self,
        envelope: &IntegrationEventEnvelope,
        record: &OutboxRecord,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub processor_name: String,
    pub claim_statuses: Vec<OutboxStatus>,
    pub batch_size: u32,
    pub poll_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            processor_name: "outbox-publisher".to_string(),
            claim_statuses: vec![OutboxStatus::Pending, OutboxStatus::Failed],
            batch_size: 100,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn BrokerPublisher>,
    config: PublisherConfig,
}

impl OutboxPublisher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn BrokerPublisher>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }

    pub async fn start(&self) {
        info!("Starting outbox publisher");
        loop {
            if let Err(e) = self.process_batch().await {
                error!("Error processing publisher batch: {}", e);
            }
            sleep(self.config.poll_interval).await;
        }
    }

    pub async fn process_batch(&self) -> Result<BatchSummary> {
        let records = self
            .store
            .claim_batch(&self.config.claim_statuses, self.config.batch_size)
            .await?;

        let mut summary = BatchSummary {
            claimed: records.len(),
            ..Default::default()
        };

        for record in &records {
            match self.publish_one(record).await {
                Ok(RowOutcome::Published) => summary.published += 1,
                Ok(RowOutcome::Retrying) => summary.retrying += 1,
                Ok(RowOutcome::Dead) => summary.dead += 1,
                Err(e) => {
                    summary.errors += 1;
                    error!(
                        event_id = %record.event_id,
                        "Failed to record publisher outcome: {}", e
                    );
                }
            }
        }

        if summary.claimed > 0 {
            info!(
                claimed = summary.claimed,
                queued = summary.published,
                retrying = summary.retrying,
                dead = summary.dead,
                "Publisher batch complete"
            );
        }
        Ok(summary)
    }

    async fn publish_one(&self, record: &OutboxRecord) -> Result<RowOutcome> {
        let parsed = match envelope::parse_for_row(record) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    event_id = %record.event_id,
                    "Invalid envelope, dead-lettering without broker hand-off: {}", e
                );
                self.store
                    .mark_dead(
                        &record.event_id,
                        &e.to_string(),
                        &self.config.processor_name,
                        None,
                    )
                    .await?;
                return Ok(RowOutcome::Dead);
            }
        };

        match self.broker.publish(&parsed, record).await {
            Ok(()) => {
                self.store.mark_queued(&record.event_id).await?;
                Ok(RowOutcome::Published)
            }
            Err(e) => {
                let outcome = self
                    .store
                    .mark_failed(
                        &record.event_id,
                        record.retry_count,
                        &e.to_string(),
                        &self.config.processor_name,
                        None,
                    )
                    .await?;
                warn!(
                    event_id = %record.event_id,
                    event_name = %record.event_name,
                    "Broker hand-off failed: {}", e
                );
                Ok(match outcome {
                    FailureOutcome::Scheduled { .. } => RowOutcome::Retrying,
                    FailureOutcome::Dead => RowOutcome::Dead,
                })
            }
        }
    }
}
