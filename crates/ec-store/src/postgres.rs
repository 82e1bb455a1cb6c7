//! PostgreSQL-backed stores.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never pick the
//! same row; the claim-and-flip-to-processing happens in one short statement
//! and the lock is released before any handler runs.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;

use crate::{FailureOutcome, InboxStore, OutboxStore, PublishedScan, SubscriberRetryStore};
use ec_common::{
    IntegrationEventEnvelope, OutboxRecord, OutboxStatus, RetryPolicy, SubscriberRetryState,
    SubscriberRetryStatus,
};

const RECORD_COLUMNS: &str = "event_id, tenant_id, event_name, event_version, partition_key, \
     payload, status, retry_count, next_retry_at, last_error, occurred_at, updated_at";

// Qualified flavor for UPDATE ... FROM ... RETURNING, where bare column
// names would be ambiguous between the target table and the claim CTE.
const CLAIMED_COLUMNS: &str = "o.event_id, o.tenant_id, o.event_name, o.event_version, \
     o.partition_key, o.payload, o.status, o.retry_count, o.next_retry_at, o.last_error, \
     o.occurred_at, o.updated_at";

pub struct PostgresStore {
    pool: PgPool,
    outbox_policy: RetryPolicy,
    subscriber_policy: RetryPolicy,
}

impl PostgresStore {
    pub fn new(pool: PgPool, outbox_policy: RetryPolicy, subscriber_policy: RetryPolicy) -> Self {
        Self {
            pool,
            outbox_policy,
            subscriber_policy,
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS integration_outbox (
                event_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                event_name TEXT NOT NULL,
                event_version INTEGER NOT NULL,
                partition_key TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at TIMESTAMPTZ,
                last_error TEXT,
                occurred_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_outbox_claim \
             ON integration_outbox(status, next_retry_at, occurred_at)",
            "CREATE INDEX IF NOT EXISTS idx_outbox_published \
             ON integration_outbox(status, event_name, occurred_at)",
            r#"
            CREATE TABLE IF NOT EXISTS integration_inbox_processed (
                event_id TEXT NOT NULL,
                consumer_name TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                processed_at TIMESTAMPTZ NOT NULL,
                UNIQUE(event_id, consumer_name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS integration_outbox_dead_letter (
                id TEXT PRIMARY KEY,
                event_id TEXT NOT NULL UNIQUE,
                tenant_id TEXT NOT NULL,
                event_name TEXT NOT NULL,
                event_version INTEGER NOT NULL,
                partition_key TEXT NOT NULL,
                payload TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                last_error TEXT NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL,
                dead_at TIMESTAMPTZ NOT NULL,
                processor_name TEXT NOT NULL,
                consumer_name TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS integration_event_subscriber_retry_state (
                event_id TEXT NOT NULL,
                subscriber_name TEXT NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at TIMESTAMPTZ,
                last_error TEXT,
                UNIQUE(event_id, subscriber_name)
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Outbox schema initialized");
        Ok(())
    }

    /// Append an event inside the caller's business transaction. This is the
    /// exactly-once write: the domain change and the outbox row commit
    /// atomically or not at all.
    pub async fn append(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        envelope: &IntegrationEventEnvelope,
    ) -> Result<()> {
        let now = Utc::now();
        let occurred_at = envelope.occurred_at.unwrap_or(now);
        let payload = serde_json::to_string(envelope)?;

        sqlx::query(
            r#"
            INSERT INTO integration_outbox
                (event_id, tenant_id, event_name, event_version, partition_key,
                 payload, status, retry_count, occurred_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $7, $8)
            "#,
        )
        .bind(&envelope.event_id)
        .bind(&envelope.tenant_id)
        .bind(&envelope.event_name)
        .bind(envelope.event_version)
        .bind(&envelope.partition_key)
        .bind(payload)
        .bind(occurred_at)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn insert_dead_letter(
        &self,
        event_id: &str,
        error: &str,
        processor_name: &str,
        consumer_name: Option<&str>,
    ) -> Result<()> {
        // Multiple code paths can independently decide a row is dead, so
        // the snapshot insert tolerates a conflict.
        sqlx::query(
            r#"
            INSERT INTO integration_outbox_dead_letter
                (id, event_id, tenant_id, event_name, event_version, partition_key,
                 payload, retry_count, last_error, occurred_at, dead_at,
                 processor_name, consumer_name)
            SELECT $2, event_id, tenant_id, event_name, event_version, partition_key,
                   payload, retry_count, $3, occurred_at, NOW(), $4, $5
            FROM integration_outbox
            WHERE event_id = $1
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(error)
        .bind(processor_name)
        .bind(consumer_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_status(&self, event_id: &str, status: OutboxStatus) -> Result<()> {
        sqlx::query("UPDATE integration_outbox SET status = $1, updated_at = NOW() WHERE event_id = $2")
            .bind(status.as_str())
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<OutboxRecord> {
    let status_str: String = row.get("status");
    let status = OutboxStatus::parse(&status_str)
        .ok_or_else(|| anyhow::anyhow!("unknown outbox status '{}'", status_str))?;
    let payload_str: String = row.get("payload");

    Ok(OutboxRecord {
        event_id: row.get("event_id"),
        tenant_id: row.get("tenant_id"),
        event_name: row.get("event_name"),
        event_version: row.get("event_version"),
        partition_key: row.get("partition_key"),
        payload: serde_json::from_str(&payload_str)?,
        status,
        retry_count: row.get::<i32, _>("retry_count") as u32,
        next_retry_at: row.get::<Option<DateTime<Utc>>, _>("next_retry_at"),
        last_error: row.get("last_error"),
        occurred_at: row.get("occurred_at"),
        updated_at: row.get("updated_at"),
    })
}

fn records_from_rows(rows: Vec<PgRow>) -> Result<Vec<OutboxRecord>> {
    let mut records = rows
        .iter()
        .map(record_from_row)
        .collect::<Result<Vec<_>>>()?;
    // UPDATE ... RETURNING does not preserve the CTE's ordering.
    records.sort_by_key(|r| r.occurred_at);
    Ok(records)
}

#[async_trait]
impl OutboxStore for PostgresStore {
    async fn claim_batch(
        &self,
        statuses: &[OutboxStatus],
        limit: u32,
    ) -> Result<Vec<OutboxRecord>> {
        let status_strs: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();

        let rows = sqlx::query(&format!(
            r#"
            WITH claimable AS (
                SELECT event_id FROM integration_outbox
                WHERE status = ANY($1)
                  AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                ORDER BY occurred_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE integration_outbox o
            SET status = 'processing', updated_at = NOW()
            FROM claimable c
            WHERE o.event_id = c.event_id
            RETURNING {CLAIMED_COLUMNS}
            "#
        ))
        .bind(&status_strs)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        records_from_rows(rows)
    }

    async fn claim_stale_processing(
        &self,
        stale_after_ms: i64,
        limit: u32,
    ) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            WITH stale AS (
                SELECT event_id FROM integration_outbox
                WHERE status = 'processing'
                  AND updated_at < NOW() - ($1 * INTERVAL '1 millisecond')
                ORDER BY occurred_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE integration_outbox o
            SET updated_at = NOW()
            FROM stale s
            WHERE o.event_id = s.event_id
            RETURNING {CLAIMED_COLUMNS}
            "#
        ))
        .bind(stale_after_ms)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        records_from_rows(rows)
    }

    async fn fetch_published(
        &self,
        scan: &PublishedScan,
        limit: u32,
    ) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM integration_outbox o
            WHERE o.status = 'published'
              AND ($1::text[] IS NULL OR o.event_name = ANY($1))
              AND ($2::integer IS NULL OR o.event_version = $2)
              AND NOT EXISTS (
                  SELECT 1 FROM integration_inbox_processed i
                  WHERE i.event_id = o.event_id AND i.consumer_name = $3
              )
              AND ($4::text IS NULL OR NOT EXISTS (
                  SELECT 1 FROM integration_event_subscriber_retry_state r
                  WHERE r.event_id = o.event_id AND r.subscriber_name = $4
                    AND (r.status = 'dead' OR r.next_retry_at > NOW())
              ))
            ORDER BY o.occurred_at
            LIMIT $5
            "#
        ))
        .bind(&scan.event_names)
        .bind(scan.event_version)
        .bind(&scan.consumer_name)
        .bind(&scan.subscriber_name)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn mark_queued(&self, event_id: &str) -> Result<()> {
        self.set_status(event_id, OutboxStatus::Queued).await
    }

    async fn mark_published(&self, event_id: &str) -> Result<()> {
        self.set_status(event_id, OutboxStatus::Published).await
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
            sqlx::query(
                "UPDATE integration_outbox \
                 SET status = 'dead', retry_count = $2, last_error = $3, \
                     next_retry_at = NULL, updated_at = NOW() \
                 WHERE event_id = $1",
            )
            .bind(event_id)
            .bind((retry_count + 1) as i32)
            .bind(error)
            .execute(&self.pool)
            .await?;

            self.insert_dead_letter(event_id, error, processor_name, consumer_name)
                .await?;
            return Ok(FailureOutcome::Dead);
        }

        let next_retry_at = self.outbox_policy.next_retry_at(Utc::now(), retry_count);
        sqlx::query(
            "UPDATE integration_outbox \
             SET status = 'failed', retry_count = $2, next_retry_at = $3, \
                 last_error = $4, updated_at = NOW() \
             WHERE event_id = $1",
        )
        .bind(event_id)
        .bind((retry_count + 1) as i32)
        .bind(next_retry_at)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(FailureOutcome::Scheduled { next_retry_at })
    }

    async fn mark_dead(
        &self,
        event_id: &str,
        error: &str,
        processor_name: &str,
        consumer_name: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE integration_outbox \
             SET status = 'dead', last_error = $2, next_retry_at = NULL, updated_at = NOW() \
             WHERE event_id = $1",
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        self.insert_dead_letter(event_id, error, processor_name, consumer_name)
            .await
    }
}

#[async_trait]
impl InboxStore for PostgresStore {
    async fn is_processed(&self, event_id: &str, consumer_name: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM integration_inbox_processed \
             WHERE event_id = $1 AND consumer_name = $2",
        )
        .bind(event_id)
        .bind(consumer_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn mark_processed(
        &self,
        tenant_id: &str,
        event_id: &str,
        consumer_name: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO integration_inbox_processed \
                 (event_id, consumer_name, tenant_id, processed_at) \
             VALUES ($1, $2, $3, NOW()) \
             ON CONFLICT (event_id, consumer_name) DO NOTHING",
        )
        .bind(event_id)
        .bind(consumer_name)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriberRetryStore for PostgresStore {
    async fn get(
        &self,
        event_id: &str,
        subscriber_name: &str,
    ) -> Result<Option<SubscriberRetryState>> {
        let row = sqlx::query(
            "SELECT event_id, subscriber_name, status, retry_count, next_retry_at, last_error \
             FROM integration_event_subscriber_retry_state \
             WHERE event_id = $1 AND subscriber_name = $2",
        )
        .bind(event_id)
        .bind(subscriber_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let status_str: String = row.get("status");
            let status = SubscriberRetryStatus::parse(&status_str).ok_or_else(|| {
                anyhow::anyhow!("unknown subscriber retry status '{}'", status_str)
            })?;
            Ok(SubscriberRetryState {
                event_id: row.get("event_id"),
                subscriber_name: row.get("subscriber_name"),
                status,
                retry_count: row.get::<i32, _>("retry_count") as u32,
                next_retry_at: row.get("next_retry_at"),
                last_error: row.get("last_error"),
            })
        })
        .transpose()
    }

    async fn record_failure(
        &self,
        event_id: &str,
        subscriber_name: &str,
        error: &str,
    ) -> Result<SubscriberRetryState> {
        let prior_count = self
            .get(event_id, subscriber_name)
            .await?
            .map(|s| s.retry_count)
            .unwrap_or(0);

        let (status, next_retry_at) = if self.subscriber_policy.is_exhausted(prior_count) {
            (SubscriberRetryStatus::Dead, None)
        } else {
            (
                SubscriberRetryStatus::Retrying,
                Some(self.subscriber_policy.next_retry_at(Utc::now(), prior_count)),
            )
        };

        sqlx::query(
            r#"
            INSERT INTO integration_event_subscriber_retry_state
                (event_id, subscriber_name, status, retry_count, next_retry_at, last_error)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_id, subscriber_name) DO UPDATE SET
                status = EXCLUDED.status,
                retry_count = EXCLUDED.retry_count,
                next_retry_at = EXCLUDED.next_retry_at,
                last_error = EXCLUDED.last_error
            "#,
        )
        .bind(event_id)
        .bind(subscriber_name)
        .bind(status.as_str())
        .bind((prior_count + 1) as i32)
        .bind(next_retry_at)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(SubscriberRetryState {
            event_id: event_id.to_string(),
            subscriber_name: subscriber_name.to_string(),
            status,
            retry_count: prior_count + 1,
            next_retry_at,
            last_error: Some(error.to_string()),
        })
    }

    async fn clear(&self, event_id: &str, subscriber_name: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM integration_event_subscriber_retry_state \
             WHERE event_id = $1 AND subscriber_name = $2",
        )
        .bind(event_id)
        .bind(subscriber_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
