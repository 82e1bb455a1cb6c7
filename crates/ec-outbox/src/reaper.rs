//! Stale-processing reaper
//!
//! A worker that dies after claiming a row but before finishing leaves it in
//! `processing` forever. The reaper runs on its own schedule, reclaims rows
//! whose `updated_at` is past the staleness threshold, and pushes them
//! through the normal failed/dead decision with a synthetic error. It uses
//! the same locking read as the processor, so it never races a live worker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;
use tracing::{error, info, warn};

use ec_store::{FailureOutcome, OutboxStore};

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub processor_name: String,
    /// How long a row may sit in `processing` before it is presumed crashed.
    pub stale_after: Duration,
    pub batch_size: u32,
    pub poll_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            processor_name: "stale-reaper".to_string(),
            stale_after: Duration::from_millis(60_000),
            batch_size: 100,
            poll_interval: Duration::from_millis(30_000),
        }
    }
}

pub struct StaleReaper {
    store: Arc<dyn OutboxStore>,
    config: ReaperConfig,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReapSummary {
    pub reclaimed: usize,
    pub retrying: usize,
    pub dead: usize,
}

impl StaleReaper {
    pub fn new(store: Arc<dyn OutboxStore>, config: ReaperConfig) -> Self {
        Self { store, config }
    }

    pub async fn start(&self) {
        info!(
            stale_after_ms = self.config.stale_after.as_millis() as u64,
            "Starting stale-processing reaper"
        );
        loop {
            if let Err(e) = self.reap_once().await {
                error!("Error reaping stale outbox rows: {}", e);
            }
            sleep(self.config.poll_interval).await;
        }
    }

    pub async fn reap_once(&self) -> Result<ReapSummary> {
        let stale_after_ms = self.config.stale_after.as_millis() as i64;
        let records = self
            .store
            .claim_stale_processing(stale_after_ms, self.config.batch_size)
            .await?;

        let mut summary = ReapSummary {
            reclaimed: records.len(),
            ..Default::default()
        };

        for record in &records {
            let synthetic_error = format!(
                "stale processing: worker inactive for over {}ms",
                stale_after_ms
            );
            warn!(
                event_id = %record.event_id,
                tenant_id = %record.tenant_id,
                retry_count = record.retry_count,
                "Reclaiming stale processing row"
            );
            match self
                .store
                .mark_failed(
                    &record.event_id,
                    record.retry_count,
                    &synthetic_error,
                    &self.config.processor_name,
                    None,
                )
                .await
            {
                Ok(FailureOutcome::Scheduled { .. }) => summary.retrying += 1,
                Ok(FailureOutcome::Dead) => summary.dead += 1,
                Err(e) => {
                    error!(event_id = %record.event_id, "Failed to reap row: {}", e);
                }
            }
        }

        if summary.reclaimed > 0 {
            info!(
                reclaimed = summary.reclaimed,
                retrying = summary.retrying,
                dead = summary.dead,
                "Reaper pass complete"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ec_common::{envelope, OutboxStatus, RetryPolicy};
    use ec_store::MemoryStore;
    use serde_json::json;

    async fn stuck_row(store: &MemoryStore, event_id: &str, retry_count: u32, age_secs: i64) {
        let parsed = envelope::parse(&json!({
            "eventId": event_id,
            "eventName": "invoice.created",
            "eventVersion": 1,
            "tenantId": "tenant-a",
            "partitionKey": "invoice-1",
            "data": {}
        }))
        .unwrap();
        store.append(&parsed).await.unwrap();
        let mut record = store.get(event_id).await.unwrap();
        record.status = OutboxStatus::Processing;
        record.retry_count = retry_count;
        record.updated_at = Utc::now() - chrono::Duration::seconds(age_secs);
        store.insert_record(record).await;
    }

    fn reaper(store: Arc<MemoryStore>) -> StaleReaper {
        StaleReaper::new(
            store,
            ReaperConfig {
                stale_after: Duration::from_millis(60_000),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_reclaims_stale_row_into_failed() {
        let store = Arc::new(MemoryStore::new(
            RetryPolicy::outbox(),
            RetryPolicy::subscriber(),
        ));
        stuck_row(&store, "evt-1", 0, 120).await;

        let summary = reaper(store.clone()).reap_once().await.unwrap();
        assert_eq!(summary.reclaimed, 1);
        assert_eq!(summary.retrying, 1);

        let record = store.get("evt-1").await.unwrap();
        assert_eq!(record.status, OutboxStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert!(record.last_error.unwrap().contains("stale processing"));
        assert!(record.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn test_stale_row_past_budget_goes_dead() {
        let store = Arc::new(MemoryStore::new(
            RetryPolicy::outbox(),
            RetryPolicy::subscriber(),
        ));
        stuck_row(&store, "evt-1", 9, 120).await;

        let summary = reaper(store.clone()).reap_once().await.unwrap();
        assert_eq!(summary.dead, 1);
        assert_eq!(store.get("evt-1").await.unwrap().status, OutboxStatus::Dead);
        let dead = store.dead_letter("evt-1").await.unwrap();
        assert_eq!(dead.processor_name, "stale-reaper");
    }

    #[tokio::test]
    async fn test_fresh_processing_row_left_alone() {
        let store = Arc::new(MemoryStore::new(
            RetryPolicy::outbox(),
            RetryPolicy::subscriber(),
        ));
        stuck_row(&store, "evt-1", 0, 5).await;

        let summary = reaper(store.clone()).reap_once().await.unwrap();
        assert_eq!(summary.reclaimed, 0);
        assert_eq!(
            store.get("evt-1").await.unwrap().status,
            OutboxStatus::Processing
        );
    }
}
