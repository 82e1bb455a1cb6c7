pub mod http_handler;
pub mod publisher;
pub mod reaper;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use ec_common::{envelope, EventContext, IntegrationEventEnvelope, OutboxRecord, OutboxStatus};
use ec_store::{FailureOutcome, InboxStore, OutboxStore};

// Re-export key types
pub use http_handler::{HttpEventHandler, HttpEventHandlerConfig};
pub use publisher::{BrokerPublisher, OutboxPublisher, PublisherConfig};
pub use reaper::{ReaperConfig, StaleReaper};

/// Business handler supplied by the caller. Invoked at-least-once per event;
/// the inbox makes re-invocation after a crash harmless, but handlers should
/// still be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(
        &self,
        record: &OutboxRecord,
        envelope: &IntegrationEventEnvelope,
        ctx: &EventContext,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Inbox consumer name for this processor's own dedup records.
    pub consumer_name: String,
    /// Name recorded on dead letters this processor writes.
    pub processor_name: String,
    /// Statuses eligible for claiming. Add `Queued` to drain a publisher
    /// stage's hand-offs.
    pub claim_statuses: Vec<OutboxStatus>,
    pub batch_size: u32,
    pub poll_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            consumer_name: "outbox-processor".to_string(),
            processor_name: "outbox-processor".to_string(),
            claim_statuses: vec![OutboxStatus::Pending, OutboxStatus::Failed],
            batch_size: 100,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

/// Terminal state a claimed row reached within one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Published,
    Retrying,
    Dead,
}

/// Per-batch counts for operational logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchSummary {
    pub claimed: usize,
    pub published: usize,
    pub retrying: usize,
    pub dead: usize,
    pub errors: usize,
}

/// Claims pending/failed rows and drives each through validate → dedup →
/// handler → status write. Rows are independent; one row's failure never
/// blocks the rest of the batch.
pub struct OutboxProcessor {
    store: Arc<dyn OutboxStore>,
    inbox: Arc<dyn InboxStore>,
    handler: Arc<dyn EventHandler>,
    config: ProcessorConfig,
}

impl OutboxProcessor {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        inbox: Arc<dyn InboxStore>,
        handler: Arc<dyn EventHandler>,
        config: ProcessorConfig,
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
            "Starting outbox processor"
        );
        loop {
            if let Err(e) = self.process_batch().await {
                // Infrastructure-tier failure: nothing was claimed, the next
                // tick retries the whole claim.
                error!("Error processing outbox batch: {}", e);
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
        if records.is_empty() {
            return Ok(summary);
        }

        for record in &records {
            match self.process_one(record).await {
                Ok(RowOutcome::Published) => summary.published += 1,
                Ok(RowOutcome::Retrying) => summary.retrying += 1,
                Ok(RowOutcome::Dead) => summary.dead += 1,
                Err(e) => {
                    summary.errors += 1;
                    error!(
                        event_id = %record.event_id,
                        tenant_id = %record.tenant_id,
                        "Failed to record outcome for outbox row: {}", e
                    );
                }
            }
        }

        info!(
            claimed = summary.claimed,
            published = summary.published,
            retrying = summary.retrying,
            dead = summary.dead,
            errors = summary.errors,
            "Outbox batch complete"
        );
        Ok(summary)
    }

    async fn process_one(&self, record: &OutboxRecord) -> Result<RowOutcome> {
        debug!(event_id = %record.event_id, "Processing outbox row");

        // Envelope/consistency errors are unrecoverable data problems;
        // retrying cannot help, and the handler must never see the event.
        let parsed = match envelope::parse_for_row(record) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    event_id = %record.event_id,
                    tenant_id = %record.tenant_id,
                    "Invalid envelope, dead-lettering without dispatch: {}", e
                );
                self.store
                    .mark_dead(
                        &record.event_id,
                        &e.to_string(),
                        &self.config.processor_name,
                        Some(&self.config.consumer_name),
                    )
                    .await?;
                return Ok(RowOutcome::Dead);
            }
        };

        // A previous attempt may have run the handler and crashed before the
        // status write; the inbox record is the durable evidence.
        if self
            .inbox
            .is_processed(&record.event_id, &self.config.consumer_name)
            .await?
        {
            debug!(
                event_id = %record.event_id,
                "Already in inbox, short-circuiting to published"
            );
            self.store.mark_published(&record.event_id).await?;
            return Ok(RowOutcome::Published);
        }

        let ctx = EventContext::from_envelope(&parsed);
        let started = std::time::Instant::now();

        match self.handler.handle_event(record, &parsed, &ctx).await {
            Ok(()) => {
                self.inbox
                    .mark_processed(
                        &record.tenant_id,
                        &record.event_id,
                        &self.config.consumer_name,
                    )
                    .await?;
                self.store.mark_published(&record.event_id).await?;
                info!(
                    event_id = %record.event_id,
                    tenant_id = %record.tenant_id,
                    event_name = %record.event_name,
                    duration_ms = started.elapsed().as_millis() as u64,
                    lag_ms = record.lag_ms(Utc::now()),
                    "Event published"
                );
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
                        Some(&self.config.consumer_name),
                    )
                    .await?;
                match outcome {
                    FailureOutcome::Scheduled { next_retry_at } => {
                        warn!(
                            event_id = %record.event_id,
                            tenant_id = %record.tenant_id,
                            event_name = %record.event_name,
                            retry_count = record.retry_count + 1,
                            next_retry_at = %next_retry_at,
                            "Handler failed, retry scheduled: {}", e
                        );
                        Ok(RowOutcome::Retrying)
                    }
                    FailureOutcome::Dead => {
                        error!(
                            event_id = %record.event_id,
                            tenant_id = %record.tenant_id,
                            event_name = %record.event_name,
                            "Handler failed, retry budget exhausted, dead-lettered: {}", e
                        );
                        Ok(RowOutcome::Dead)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ec_common::RetryPolicy;
    use ec_store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockHandler {
        calls: AtomicUsize,
        fail_times: AtomicUsize,
        seen_tenants: Mutex<Vec<String>>,
    }

    impl MockHandler {
        fn new(fail_times: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_times: AtomicUsize::new(fail_times),
                seen_tenants: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for MockHandler {
        async fn handle_event(
            &self,
            _record: &OutboxRecord,
            _envelope: &IntegrationEventEnvelope,
            ctx: &EventContext,
        ) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_tenants.lock().unwrap().push(ctx.tenant_id.clone());
            if call < self.fail_times.load(Ordering::SeqCst) {
                anyhow::bail!("mock handler failure");
            }
            Ok(())
        }
    }

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(
            RetryPolicy::outbox(),
            RetryPolicy::subscriber(),
        ))
    }

    async fn append_event(store: &MemoryStore, event_id: &str) {
        let envelope = envelope::parse(&json!({
            "eventId": event_id,
            "eventName": "invoice.created",
            "eventVersion": 1,
            "tenantId": "tenant-a",
            "partitionKey": "invoice-1",
            "data": {"amount": 100}
        }))
        .unwrap();
        store.append(&envelope).await.unwrap();
    }

    fn processor(store: Arc<MemoryStore>, handler: Arc<MockHandler>) -> OutboxProcessor {
        OutboxProcessor::new(store.clone(), store, handler, ProcessorConfig::default())
    }

    #[tokio::test]
    async fn test_success_marks_inbox_and_published() {
        let store = store();
        let handler = Arc::new(MockHandler::new(0));
        append_event(&store, "evt-1").await;

        let summary = processor(store.clone(), handler.clone())
            .process_batch()
            .await
            .unwrap();

        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.published, 1);
        assert_eq!(handler.call_count(), 1);
        assert_eq!(
            handler.seen_tenants.lock().unwrap().as_slice(),
            ["tenant-a"]
        );
        assert_eq!(
            store.get("evt-1").await.unwrap().status,
            OutboxStatus::Published
        );
        assert!(store
            .is_processed("evt-1", "outbox-processor")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_inbox_hit_short_circuits_without_handler() {
        let store = store();
        let handler = Arc::new(MockHandler::new(0));
        append_event(&store, "evt-1").await;
        store
            .mark_processed("tenant-a", "evt-1", "outbox-processor")
            .await
            .unwrap();

        let summary = processor(store.clone(), handler.clone())
            .process_batch()
            .await
            .unwrap();

        assert_eq!(summary.published, 1);
        assert_eq!(handler.call_count(), 0, "handler must not re-run");
        assert_eq!(
            store.get("evt-1").await.unwrap().status,
            OutboxStatus::Published
        );
    }

    #[tokio::test]
    async fn test_handler_failure_schedules_retry_then_succeeds() {
        let store = store();
        let handler = Arc::new(MockHandler::new(1));
        append_event(&store, "evt-1").await;
        let processor = processor(store.clone(), handler.clone());

        let summary = processor.process_batch().await.unwrap();
        assert_eq!(summary.retrying, 1);

        let record = store.get("evt-1").await.unwrap();
        assert_eq!(record.status, OutboxStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert!(record.next_retry_at.unwrap() > Utc::now());

        // Force the backoff window open and run another tick
        let mut due = record;
        due.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(1));
        store.insert_record(due).await;

        let summary = processor.process_batch().await.unwrap();
        assert_eq!(summary.published, 1);
        assert_eq!(handler.call_count(), 2);
        assert_eq!(
            store.get("evt-1").await.unwrap().status,
            OutboxStatus::Published
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let store = store();
        let handler = Arc::new(MockHandler::new(usize::MAX));
        append_event(&store, "evt-1").await;

        // Pre-age the row to its last allowed attempt
        let mut record = store.get("evt-1").await.unwrap();
        record.status = OutboxStatus::Failed;
        record.retry_count = 9;
        record.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(1));
        store.insert_record(record).await;

        let summary = processor(store.clone(), handler.clone())
            .process_batch()
            .await
            .unwrap();

        assert_eq!(summary.dead, 1);
        assert_eq!(store.get("evt-1").await.unwrap().status, OutboxStatus::Dead);
        let dead = store.dead_letter("evt-1").await.unwrap();
        assert_eq!(dead.processor_name, "outbox-processor");
    }

    #[tokio::test]
    async fn test_inconsistent_envelope_never_reaches_handler() {
        let store = store();
        let handler = Arc::new(MockHandler::new(0));
        append_event(&store, "evt-1").await;

        // Corrupt the row so the column no longer matches the payload
        let mut record = store.get("evt-1").await.unwrap();
        record.event_id = "evt-TAMPERED".to_string();
        store.insert_record(record).await;

        let summary = processor(store.clone(), handler.clone())
            .process_batch()
            .await
            .unwrap();

        assert_eq!(summary.dead, 1);
        assert_eq!(handler.call_count(), 0);
        let dead = store.dead_letter("evt-TAMPERED").await.unwrap();
        assert!(dead.last_error.contains("event_id"));
        assert!(dead.last_error.contains("evt-TAMPERED"));
        assert!(dead.last_error.contains("evt-1"));
    }

    #[tokio::test]
    async fn test_one_bad_row_does_not_block_batch() {
        let store = store();
        let handler = Arc::new(MockHandler::new(0));
        append_event(&store, "evt-bad").await;
        let mut record = store.get("evt-bad").await.unwrap();
        record.payload = json!("not an object");
        record.occurred_at = Utc::now() - chrono::Duration::seconds(10);
        store.insert_record(record).await;
        append_event(&store, "evt-good").await;

        let summary = processor(store.clone(), handler.clone())
            .process_batch()
            .await
            .unwrap();

        assert_eq!(summary.claimed, 2);
        assert_eq!(summary.dead, 1);
        assert_eq!(summary.published, 1);
        assert_eq!(
            store.get("evt-good").await.unwrap().status,
            OutboxStatus::Published
        );
    }
}
