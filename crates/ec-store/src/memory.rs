//! In-memory stores for tests and local development.
//!
//! Implements the same traits and semantics as the Postgres stores; a single
//! write lock over the row map stands in for row-level locking, which is
//! enough to make claims atomic within one process.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::{FailureOutcome, InboxStore, OutboxStore, PublishedScan, SubscriberRetryStore};
use ec_common::{
    DeadLetterRecord, IntegrationEventEnvelope, OutboxRecord, OutboxStatus, RetryPolicy,
    SubscriberRetryState, SubscriberRetryStatus,
};

#[derive(Clone)]
pub struct MemoryStore {
    rows: Arc<RwLock<HashMap<String, OutboxRecord>>>,
    inbox: Arc<RwLock<HashMap<(String, String), DateTime<Utc>>>>,
    dead_letters: Arc<RwLock<HashMap<String, DeadLetterRecord>>>,
    retry_states: Arc<RwLock<HashMap<(String, String), SubscriberRetryState>>>,
    outbox_policy: RetryPolicy,
    subscriber_policy: RetryPolicy,
}

impl MemoryStore {
    pub fn new(outbox_policy: RetryPolicy, subscriber_policy: RetryPolicy) -> Self {
        Self {
            rows: Arc::new(RwLock::new(HashMap::new())),
            inbox: Arc::new(RwLock::new(HashMap::new())),
            dead_letters: Arc::new(RwLock::new(HashMap::new())),
            retry_states: Arc::new(RwLock::new(HashMap::new())),
            outbox_policy,
            subscriber_policy,
        }
    }

    /// Append outside any transaction; the in-memory map has no atomicity
    /// boundary to share with a business write.
    pub async fn append(&self, envelope: &IntegrationEventEnvelope) -> Result<()> {
        let now = Utc::now();
        let record = OutboxRecord {
            event_id: envelope.event_id.clone(),
            tenant_id: envelope.tenant_id.clone(),
            event_name: envelope.event_name.clone(),
            event_version: envelope.event_version,
            partition_key: envelope.partition_key.clone(),
            payload: serde_json::to_value(envelope)?,
            status: OutboxStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            occurred_at: envelope.occurred_at.unwrap_or(now),
            updated_at: now,
        };
        self.rows
            .write()
            .await
            .insert(record.event_id.clone(), record);
        Ok(())
    }

    /// Insert a raw record, bypassing envelope construction. Test seam for
    /// corrupted or pre-aged rows.
    pub async fn insert_record(&self, record: OutboxRecord) {
        self.rows
            .write()
            .await
            .insert(record.event_id.clone(), record);
    }

    pub async fn get(&self, event_id: &str) -> Option<OutboxRecord> {
        self.rows.read().await.get(event_id).cloned()
    }

    pub async fn dead_letter(&self, event_id: &str) -> Option<DeadLetterRecord> {
        self.dead_letters.read().await.get(event_id).cloned()
    }

    pub async fn dead_letter_count(&self) -> usize {
        self.dead_letters.read().await.len()
    }

    async fn snapshot_dead_letter(
        &self,
        record: &OutboxRecord,
        error: &str,
        processor_name: &str,
        consumer_name: Option<&str>,
    ) {
        let mut dead_letters = self.dead_letters.write().await;
        // on-conflict-do-nothing semantics
        dead_letters
            .entry(record.event_id.clone())
            .or_insert_with(|| DeadLetterRecord {
                id: uuid::Uuid::new_v4().to_string(),
                event_id: record.event_id.clone(),
                tenant_id: record.tenant_id.clone(),
                event_name: record.event_name.clone(),
                event_version: record.event_version,
                partition_key: record.partition_key.clone(),
                payload: record.payload.clone(),
                retry_count: record.retry_count,
                last_error: error.to_string(),
                occurred_at: record.occurred_at,
                dead_at: Utc::now(),
                processor_name: processor_name.to_string(),
                consumer_name: consumer_name.map(|s| s.to_string()),
            });
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn claim_batch(
        &self,
        statuses: &[OutboxStatus],
        limit: u32,
    ) -> Result<Vec<OutboxRecord>> {
        let now = Utc::now();
        let mut rows = self.rows.write().await;

        let mut claimable: Vec<String> = rows
            .values()
            .filter(|r| statuses.contains(&r.status))
            .filter(|r| r.next_retry_at.map(|t| t <= now).unwrap_or(true))
            .map(|r| r.event_id.clone())
            .collect();
        claimable.sort_by_key(|id| rows[id].occurred_at);
        claimable.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(claimable.len());
        for id in claimable {
            if let Some(record) = rows.get_mut(&id) {
                record.status = OutboxStatus::Processing;
                record.updated_at = now;
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn claim_stale_processing(
        &self,
        stale_after_ms: i64,
        limit: u32,
    ) -> Result<Vec<OutboxRecord>> {
        let now = Utc::now();
        let cutoff = now - Duration::milliseconds(stale_after_ms);
        let mut rows = self.rows.write().await;

        let mut stale: Vec<String> = rows
            .values()
            .filter(|r| r.status == OutboxStatus::Processing && r.updated_at < cutoff)
            .map(|r| r.event_id.clone())
            .collect();
        stale.sort_by_key(|id| rows[id].occurred_at);
        stale.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(record) = rows.get_mut(&id) {
                record.updated_at = now;
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn fetch_published(
        &self,
        scan: &PublishedScan,
        limit: u32,
    ) -> Result<Vec<OutboxRecord>> {
        let now = Utc::now();
        let rows = self.rows.read().await;
        let inbox = self.inbox.read().await;
        let retry_states = self.retry_states.read().await;

        let mut matches: Vec<OutboxRecord> = rows
            .values()
            .filter(|r| r.status == OutboxStatus::Published)
            .filter(|r| {
                scan.event_names
                    .as_ref()
                    .map(|names| names.contains(&r.event_name))
                    .unwrap_or(true)
            })
            .filter(|r| {
                scan.event_version
                    .map(|v| r.event_version == v)
                    .unwrap_or(true)
            })
            .filter(|r| {
                !inbox.contains_key(&(r.event_id.clone(), scan.consumer_name.clone()))
            })
            .filter(|r| {
                scan.subscriber_name
                    .as_ref()
                    .and_then(|name| retry_states.get(&(r.event_id.clone(), name.clone())))
                    .map(|state| state.is_attemptable(now))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        matches.sort_by_key(|r| r.occurred_at);
        matches.truncate(limit as usize);
        Ok(matches)
    }

    async fn mark_queued(&self, event_id: &str) -> Result<()> {
        let mut rows = self.rows.write().await;
        if let Some(record) = rows.get_mut(event_id) {
            record.status = OutboxStatus::Queued;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_published(&self, event_id: &str) -> Result<()> {
        let mut rows = self.rows.write().await;
        if let Some(record) = rows.get_mut(event_id) {
            record.status = OutboxStatus::Published;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: &str,
        retry_count: u32,
        error: &str,
        processor_name: &str,
        consumer_name: Option<&str>,
    ) -> Result<FailureOutcome> {
        if self.outbox_policy.is_exhausted(retry_count) {
            let snapshot = {
                let mut rows = self.rows.write().await;
                let record = rows
                    .get_mut(event_id)
                    .ok_or_else(|| anyhow::anyhow!("unknown event '{event_id}'"))?;
                record.status = OutboxStatus::Dead;
                record.retry_count = retry_count + 1;
                record.last_error = Some(error.to_string());
                record.next_retry_at = None;
                record.updated_at = Utc::now();
                record.clone()
            };
            self.snapshot_dead_letter(&snapshot, error, processor_name, consumer_name)
                .await;
            return Ok(FailureOutcome::Dead);
        }

        let next_retry_at = self.outbox_policy.next_retry_at(Utc::now(), retry_count);
        let mut rows = self.rows.write().await;
        let record = rows
            .get_mut(event_id)
            .ok_or_else(|| anyhow::anyhow!("unknown event '{event_id}'"))?;
        record.status = OutboxStatus::Failed;
        record.retry_count = retry_count + 1;
        record.next_retry_at = Some(next_retry_at);
        record.last_error = Some(error.to_string());
        record.updated_at = Utc::now();
        Ok(FailureOutcome::Scheduled { next_retry_at })
    }

    async fn mark_dead(
        &self,
        event_id: &str,
        error: &str,
        processor_name: &str,
        consumer_name: Option<&str>,
    ) -> Result<()> {
        let snapshot = {
            let mut rows = self.rows.write().await;
            let record = rows
                .get_mut(event_id)
                .ok_or_else(|| anyhow::anyhow!("unknown event '{event_id}'"))?;
            record.status = OutboxStatus::Dead;
            record.last_error = Some(error.to_string());
            record.next_retry_at = None;
            record.updated_at = Utc::now();
            record.clone()
        };
        self.snapshot_dead_letter(&snapshot, error, processor_name, consumer_name)
            .await;
        Ok(())
    }
}

#[async_trait]
impl InboxStore for MemoryStore {
    async fn is_processed(&self, event_id: &str, consumer_name: &str) -> Result<bool> {
        Ok(self
            .inbox
            .read()
            .await
            .contains_key(&(event_id.to_string(), consumer_name.to_string())))
    }

    async fn mark_processed(
        &self,
        _tenant_id: &str,
        event_id: &str,
        consumer_name: &str,
    ) -> Result<()> {
        self.inbox
            .write()
            .await
            .entry((event_id.to_string(), consumer_name.to_string()))
            .or_insert_with(Utc::now);
        Ok(())
    }
}

#[async_trait]
impl SubscriberRetryStore for MemoryStore {
    async fn get(
        &self,
        event_id: &str,
        subscriber_name: &str,
    ) -> Result<Option<SubscriberRetryState>> {
        Ok(self
            .retry_states
            .read()
            .await
            .get(&(event_id.to_string(), subscriber_name.to_string()))
            .cloned())
    }

    async fn record_failure(
        &self,
        event_id: &str,
        subscriber_name: &str,
        error: &str,
    ) -> Result<SubscriberRetryState> {
        let mut states = self.retry_states.write().await;
        let key = (event_id.to_string(), subscriber_name.to_string());
        let prior_count = states.get(&key).map(|s| s.retry_count).unwrap_or(0);

        let (status, next_retry_at) = if self.subscriber_policy.is_exhausted(prior_count) {
            (SubscriberRetryStatus::Dead, None)
        } else {
            (
                SubscriberRetryStatus::Retrying,
                Some(self.subscriber_policy.next_retry_at(Utc::now(), prior_count)),
            )
        };

        let state = SubscriberRetryState {
            event_id: event_id.to_string(),
            subscriber_name: subscriber_name.to_string(),
            status,
            retry_count: prior_count + 1,
            next_retry_at,
            last_error: Some(error.to_string()),
        };
        states.insert(key, state.clone());
        Ok(state)
    }

    async fn clear(&self, event_id: &str, subscriber_name: &str) -> Result<()> {
        self.retry_states
            .write()
            .await
            .remove(&(event_id.to_string(), subscriber_name.to_string()));
        Ok(())
    }
}
