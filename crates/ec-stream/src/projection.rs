//! Read-model projections
//!
//! Scans `published` rows in a configured event allow-list that this
//! processor's consumer has not yet recorded in its inbox. Outbox status is
//! never mutated, so any number of projection processors can read the same
//! rows without coordinating. A failed projection leaves no inbox record;
//! the scan itself is the retry loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use ec_common::{envelope, EventContext, IntegrationEventEnvelope, OutboxRecord};
use ec_store::{InboxStore, OutboxStore, PublishedScan};

#[async_trait]
pub trait ProjectionHandler: Send + Sync {
    async fn project(
        &self,
        record: &OutboxRecord,
        envelope: &IntegrationEventEnvelope,
        ctx: &EventContext,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    pub consumer_name: String,
    /// Allow-list of event names to project; `None` projects everything.
    pub event_names: Option<Vec<String>>,
    pub batch_size: u32,
    pub poll_interval: Duration,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            consumer_name: "projections".to_string(),
            event_names: None,
            batch_size: 100,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProjectionSummary {
    pub scanned: usize,
    pub projected: usize,
    /// Rows with unrecoverable envelopes, inbox-marked so they never recur.
    pub skipped: usize,
    pub failed: usize,
}

pub struct ProjectionProcessor {
    store: Arc<dyn OutboxStore>,
    inbox: Arc<dyn InboxStore>,
    handler: Arc<dyn ProjectionHandler>,
    config: ProjectionConfig,
}

impl ProjectionProcessor {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        inbox: Arc<dyn InboxStore>,
        handler: Arc<dyn ProjectionHandler>,
        config: ProjectionConfig,
    ) -> Self {
        Self {
            store,
            inbox,
            handler,
            config,
        }
    }

    pub async fn start(&self) {
        info!(
            consumer = %self.config.consumer_name,
            "Starting projection processor"
        );
        loop {
            if let Err(e) = self.process_batch().await {
                error!("Error processing projection batch: {}", e);
            }
            sleep(self.config.poll_interval).await;
        }
    }

    pub async fn process_batch(&self) -> Result<ProjectionSummary> {
        let scan = PublishedScan {
            event_names: self.config.event_names.clone(),
            event_version: None,
            consumer_name: self.config.consumer_name.clone(),
            subscriber_name: None,
        };
        let records = self
            .store
            .fetch_published(&scan, self.config.batch_size)
            .await?;

        let mut summary = ProjectionSummary {
            scanned: records.len(),
            ..Default::default()
        };

        for record in &records {
            let parsed = match envelope::parse_for_row(record) {
                Ok(parsed) => parsed,
                Err(e) => {
                    // Unrecoverable data problem; mark the inbox so the scan
                    // stops returning this row for us. The outbox-level
                    // dead-lettering belongs to the processor, not here.
                    warn!(
                        event_id = %record.event_id,
                        "Invalid envelope, skipping projection permanently: {}", e
                    );
                    self.inbox
                        .mark_processed(
                            &record.tenant_id,
                            &record.event_id,
                            &self.config.consumer_name,
                        )
                        .await?;
                    summary.skipped += 1;
                    continue;
                }
            };

            let ctx = EventContext::from_envelope(&parsed);
            match self.handler.project(record, &parsed, &ctx).await {
                Ok(()) => {
                    self.inbox
                        .mark_processed(
                            &record.tenant_id,
                            &record.event_id,
                            &self.config.consumer_name,
                        )
                        .await?;
                    debug!(event_id = %record.event_id, "Projection applied");
                    summary.projected += 1;
                }
                Err(e) => {
                    // No inbox record, so the next scan retries this row.
                    warn!(
                        event_id = %record.event_id,
                        event_name = %record.event_name,
                        "Projection failed, will retry on next scan: {}", e
                    );
                    summary.failed += 1;
                }
            }
        }

        if summary.scanned > 0 {
            info!(
                scanned = summary.scanned,
                projected = summary.projected,
                skipped = summary.skipped,
                failed = summary.failed,
                "Projection batch complete"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ec_common::{OutboxStatus, RetryPolicy};
    use ec_store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockProjection {
        calls: AtomicUsize,
        fail_times: AtomicUsize,
    }

    impl MockProjection {
        fn new(fail_times: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_times: AtomicUsize::new(fail_times),
            }
        }
    }

    #[async_trait]
    impl ProjectionHandler for MockProjection {
        async fn project(
            &self,
            _record: &OutboxRecord,
            _envelope: &IntegrationEventEnvelope,
            _ctx: &EventContext,
        ) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times.load(Ordering::SeqCst) {
                anyhow::bail!("projection store unavailable");
            }
            Ok(())
        }
    }

    async fn published_row(store: &MemoryStore, event_id: &str, event_name: &str) {
        let payload = json!({
            "eventId": event_id,
            "eventName": event_name,
            "eventVersion": 1,
            "tenantId": "tenant-a",
            "partitionKey": "key-1",
            "data": {}
        });
        store
            .insert_record(ec_common::OutboxRecord {
                event_id: event_id.to_string(),
                tenant_id: "tenant-a".to_string(),
                event_name: event_name.to_string(),
                event_version: 1,
                partition_key: "key-1".to_string(),
                payload,
                status: OutboxStatus::Published,
                retry_count: 0,
                next_retry_at: None,
                last_error: None,
                occurred_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await;
    }

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(
            RetryPolicy::outbox(),
            RetryPolicy::subscriber(),
        ))
    }

    #[tokio::test]
    async fn test_projects_and_marks_inbox_without_touching_status() {
        let store = store();
        published_row(&store, "evt-1", "invoice.created").await;
        let handler = Arc::new(MockProjection::new(0));
        let processor = ProjectionProcessor::new(
            store.clone(),
            store.clone(),
            handler.clone(),
            ProjectionConfig::default(),
        );

        let summary = processor.process_batch().await.unwrap();
        assert_eq!(summary.projected, 1);
        assert!(store.is_processed("evt-1", "projections").await.unwrap());
        assert_eq!(
            store.get("evt-1").await.unwrap().status,
            OutboxStatus::Published,
            "projection must never mutate outbox status"
        );

        // Second scan sees nothing new
        let summary = processor.process_batch().await.unwrap();
        assert_eq!(summary.scanned, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_retried_by_next_scan() {
        let store = store();
        published_row(&store, "evt-1", "invoice.created").await;
        let handler = Arc::new(MockProjection::new(1));
        let processor = ProjectionProcessor::new(
            store.clone(),
            store.clone(),
            handler.clone(),
            ProjectionConfig::default(),
        );

        let summary = processor.process_batch().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert!(!store.is_processed("evt-1", "projections").await.unwrap());

        let summary = processor.process_batch().await.unwrap();
        assert_eq!(summary.projected, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_allow_list_filters_event_names() {
        let store = store();
        published_row(&store, "evt-1", "invoice.created").await;
        published_row(&store, "evt-2", "shipment.dispatched").await;
        let handler = Arc::new(MockProjection::new(0));
        let processor = ProjectionProcessor::new(
            store.clone(),
            store.clone(),
            handler,
            ProjectionConfig {
                event_names: Some(vec!["invoice.created".to_string()]),
                ..Default::default()
            },
        );

        let summary = processor.process_batch().await.unwrap();
        assert_eq!(summary.scanned, 1);
        assert!(store.is_processed("evt-1", "projections").await.unwrap());
        assert!(!store.is_processed("evt-2", "projections").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_envelope_skipped_with_inbox_mark() {
        let store = store();
        published_row(&store, "evt-1", "invoice.created").await;
        let mut record = store.get("evt-1").await.unwrap();
        record.payload = json!({"eventId": "evt-1"});
        store.insert_record(record).await;

        let handler = Arc::new(MockProjection::new(0));
        let processor = ProjectionProcessor::new(
            store.clone(),
            store.clone(),
            handler.clone(),
            ProjectionConfig::default(),
        );

        let summary = processor.process_batch().await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        // Marked so the scan never returns it again
        assert!(store.is_processed("evt-1", "projections").await.unwrap());
        assert_eq!(processor.process_batch().await.unwrap().scanned, 0);
    }
}
