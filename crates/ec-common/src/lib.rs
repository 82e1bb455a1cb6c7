pub mod envelope;
pub mod retry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use envelope::{EnvelopeError, IntegrationEventEnvelope};
pub use retry::RetryPolicy;

// ============================================================================
// Outbox Types
// ============================================================================

/// Lifecycle status of an outbox row.
///
/// `Queued` is reserved for the publisher stage (handed to a broker, not yet
/// consumed); `Published` means terminal consumption success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Queued,
    Published,
    Failed,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Queued => "queued",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
            OutboxStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "processing" => Some(OutboxStatus::Processing),
            "queued" => Some(OutboxStatus::Queued),
            "published" => Some(OutboxStatus::Published),
            "failed" => Some(OutboxStatus::Failed),
            "dead" => Some(OutboxStatus::Dead),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the integration outbox table.
///
/// The identity columns duplicate fields embedded in `payload`; the codec
/// cross-checks them before any handler sees the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub event_id: String,
    pub tenant_id: String,
    pub event_name: String,
    pub event_version: i32,
    pub partition_key: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// Age of the event relative to `now`, for lag logging.
    pub fn lag_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.occurred_at).num_milliseconds()
    }
}

/// Immutable snapshot of an outbox row at the moment it permanently failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: String,
    pub event_id: String,
    pub tenant_id: String,
    pub event_name: String,
    pub event_version: i32,
    pub partition_key: String,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub last_error: String,
    pub occurred_at: DateTime<Utc>,
    pub dead_at: DateTime<Utc>,
    /// Component that gave up on the event.
    pub processor_name: String,
    pub consumer_name: Option<String>,
}

// ============================================================================
// Subscriber Retry State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberRetryStatus {
    Retrying,
    Dead,
}

impl SubscriberRetryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberRetryStatus::Retrying => "retrying",
            SubscriberRetryStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retrying" => Some(SubscriberRetryStatus::Retrying),
            "dead" => Some(SubscriberRetryStatus::Dead),
            _ => None,
        }
    }
}

/// Per (event, subscriber) retry bookkeeping, independent of the outbox's
/// own status so one subscriber's failure never blocks others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberRetryState {
    pub event_id: String,
    pub subscriber_name: String,
    pub status: SubscriberRetryStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SubscriberRetryState {
    /// Whether the subscriber may attempt this event right now.
    pub fn is_attemptable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            SubscriberRetryStatus::Dead => false,
            SubscriberRetryStatus::Retrying => {
                self.next_retry_at.map(|t| t <= now).unwrap_or(true)
            }
        }
    }
}

// ============================================================================
// Execution Context
// ============================================================================

/// Context handed to every handler invocation, extracted from the envelope.
/// Passed explicitly instead of living in ambient task-local state.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub tenant_id: String,
    pub actor_id: Option<String>,
    pub request_id: Option<String>,
    pub locale: Option<String>,
}

impl EventContext {
    pub fn from_envelope(envelope: &IntegrationEventEnvelope) -> Self {
        Self {
            tenant_id: envelope.tenant_id.clone(),
            actor_id: envelope.actor_id.clone(),
            request_id: envelope.request_id.clone(),
            locale: envelope.locale.clone(),
        }
    }
}
