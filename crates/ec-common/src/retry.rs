//! Exponential backoff policy
//!
//! Pure and deterministic so the schedule is unit-testable in isolation.
//! The outbox processor, publisher, and subscriber dispatcher all use the
//! same shape with different knobs.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_seconds: u64,
    pub max_seconds: u64,
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Outbox processor / publisher defaults: 1s doubling, capped at 300s,
    /// 10 attempts.
    pub fn outbox() -> Self {
        Self {
            base_seconds: 1,
            max_seconds: 300,
            max_retries: 10,
        }
    }

    /// Subscriber dispatcher defaults: 5s doubling, capped at 300s,
    /// 20 attempts.
    pub fn subscriber() -> Self {
        Self {
            base_seconds: 5,
            max_seconds: 300,
            max_retries: 20,
        }
    }

    /// Seconds to wait before retry number `retry_count + 1`:
    /// `min(base * 2^retry_count, max)`.
    pub fn next_retry_seconds(&self, retry_count: u32) -> u64 {
        if retry_count >= 32 {
            return self.max_seconds;
        }
        self.base_seconds
            .saturating_mul(1u64 << retry_count)
            .min(self.max_seconds)
    }

    /// Retry ceiling with a floor of 1 so a misconfigured zero never
    /// disables dead-lettering checks.
    pub fn max_retry_count(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Whether a failure at the given prior retry count exhausts the budget.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count + 1 >= self.max_retry_count()
    }

    pub fn next_retry_at(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        now + Duration::seconds(self.next_retry_seconds(retry_count) as i64)
    }
}
