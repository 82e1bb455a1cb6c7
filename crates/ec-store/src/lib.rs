//! Storage seams for the integration event engine.
//!
//! All coordination between workers goes through these tables; row-level
//! locking with skip-locked claims is the only mutual-exclusion primitive.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ec_common::{OutboxRecord, OutboxStatus, SubscriberRetryState};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Outcome of recording a handler failure against an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Row went back to `failed` with a due time for the next attempt.
    Scheduled { next_retry_at: DateTime<Utc> },
    /// Retry budget exhausted; row is `dead` and snapshotted to the
    /// dead-letter table.
    Dead,
}

/// Filter for scanning `published` rows on behalf of a downstream consumer.
#[derive(Debug, Clone)]
pub struct PublishedScan {
    /// Allow-list of event names; `None` means all.
    pub event_names: Option<Vec<String>>,
    /// Optional schema-version filter (subscriber dispatcher).
    pub event_version: Option<i32>,
    /// Consumer whose inbox records exclude already-processed rows.
    pub consumer_name: String,
    /// When set, rows whose retry state for this subscriber is dead or
    /// inside a backoff window are excluded from the scan. Without this,
    /// such rows would occupy the oldest-first window forever and starve
    /// newer events out of the batch.
    pub subscriber_name: Option<String>,
}

/// Durable table of pending integration events.
///
/// Claim methods flip rows to `processing` inside one short transaction;
/// handler execution happens outside it.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` rows whose status is in `statuses` and whose
    /// `next_retry_at` is null or due, oldest first. Rows locked by a
    /// concurrent worker are skipped, never double-claimed.
    async fn claim_batch(&self, statuses: &[OutboxStatus], limit: u32)
        -> Result<Vec<OutboxRecord>>;

    /// Claim rows stuck in `processing` whose `updated_at` is older than
    /// `stale_after_ms`. Uses the same locking read as `claim_batch` so it
    /// never races a still-alive worker.
    async fn claim_stale_processing(
        &self,
        stale_after_ms: i64,
        limit: u32,
    ) -> Result<Vec<OutboxRecord>>;

    /// Scan `published` rows matching the filter that the scanning consumer
    /// has not yet recorded in its inbox. Read-only: never mutates status.
    async fn fetch_published(&self, scan: &PublishedScan, limit: u32)
        -> Result<Vec<OutboxRecord>>;

    /// Publisher stage success: broker accepted the envelope.
    async fn mark_queued(&self, event_id: &str) -> Result<()>;

    /// Terminal consumption success.
    async fn mark_published(&self, event_id: &str) -> Result<()>;

    /// Record a handler failure: schedules a backoff retry, or promotes to
    /// `dead` (plus an idempotent dead-letter insert) once the retry budget
    /// is exhausted.
    async fn mark_failed(
        &self,
        event_id: &str,
        retry_count: u32,
        error: &str,
        processor_name: &str,
        consumer_name: Option<&str>,
    ) -> Result<FailureOutcome>;

    /// Permanent failure path for unrecoverable data problems: `dead`
    /// immediately, no retry, dead-letter snapshot.
    async fn mark_dead(
        &self,
        event_id: &str,
        error: &str,
        processor_name: &str,
        consumer_name: Option<&str>,
    ) -> Result<()>;
}

/// Consumer-scoped dedup table making handler execution idempotent.
#[async_trait]
pub trait InboxStore: Send + Sync {
    async fn is_processed(&self, event_id: &str, consumer_name: &str) -> Result<bool>;

    /// Idempotent insert; a concurrent duplicate is not an error.
    async fn mark_processed(
        &self,
        tenant_id: &str,
        event_id: &str,
        consumer_name: &str,
    ) -> Result<()>;
}

/// Per (event, subscriber) retry bookkeeping for the dispatcher.
#[async_trait]
pub trait SubscriberRetryStore: Send + Sync {
    async fn get(
        &self,
        event_id: &str,
        subscriber_name: &str,
    ) -> Result<Option<SubscriberRetryState>>;

    /// Upsert a failure: increments the subscriber-scoped retry counter with
    /// its own backoff, flipping to `dead` past the subscriber's budget.
    async fn record_failure(
        &self,
        event_id: &str,
        subscriber_name: &str,
        error: &str,
    ) -> Result<SubscriberRetryState>;

    /// Remove retry state after a successful delivery.
    async fn clear(&self, event_id: &str, subscriber_name: &str) -> Result<()>;
}
