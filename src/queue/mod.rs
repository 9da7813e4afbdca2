//! Durable at-least-once job queue with singleton admission.
//!
//! A job moves `created -> active -> completed`, or on failure
//! `active -> retry -> active ...` until its retry budget runs out and it
//! lands in `failed`. While a job for a `(topic, singleton_key)` pair is
//! `created`, `retry` or `active`, further sends for that pair are dropped.

pub mod consumer;
pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub use consumer::{JobHandler, WorkOptions, work};

/// Topic carrying one job per source poll.
pub const POLL_TOPIC: &str = "data-poll";

/// Errors returned by job handlers, deciding whether the queue may retry.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Transient failure; the queue applies its retry policy.
    #[error("{0:#}")]
    Recoverable(anyhow::Error),
    /// The job can never succeed; it goes straight to `failed`.
    #[error("{0:#}")]
    Unrecoverable(anyhow::Error),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Retry,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// States that block a new send under the same singleton key.
    pub fn is_outstanding(self) -> bool {
        matches!(self, Self::Created | Self::Retry | Self::Active)
    }

    /// States a consumer may claim.
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Created | Self::Retry)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Payload of a [`POLL_TOPIC`] job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollPayload {
    pub source_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
    pub singleton_key: Option<String>,
    /// Seconds an `active` job may run before it is reported as stuck.
    pub expire_in_seconds: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub topic: String,
    pub payload: sqlx::types::Json<serde_json::Value>,
    pub singleton_key: Option<String>,
    pub state: JobState,
    pub retry_count: i32,
    pub retry_limit: i32,
    pub expire_in_seconds: i32,
    pub created_at: DateTime<Utc>,
    pub start_after: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload.0)
    }

    /// An `active` job that has run past its expiration.
    pub fn is_stuck(&self, now: DateTime<Utc>) -> bool {
        match (self.state, self.started_at) {
            (JobState::Active, Some(started)) => {
                (now - started).num_seconds() > i64::from(self.expire_in_seconds)
            }
            _ => false,
        }
    }
}

/// Bounded exponential retry applied to recoverable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub limit: i32,
    pub delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 2,
            delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(10 * 60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry_count + 1`: `delay * 2^retry_count`, capped.
    pub fn delay_for(&self, retry_count: i32) -> Duration {
        let exponent = u32::try_from(retry_count.max(0)).unwrap_or(0).min(16);
        self.delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Decide what happens to a job that failed on attempt `retry_count`.
    pub fn disposition(
        &self,
        retry_count: i32,
        retry_limit: i32,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> FailureDisposition {
        if !retryable || retry_count >= retry_limit {
            return FailureDisposition::Exhausted;
        }
        let delay = chrono::Duration::from_std(self.delay_for(retry_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        FailureDisposition::Retrying {
            attempt: retry_count + 1,
            start_after: now + delay,
        }
    }
}

/// What the queue did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Retrying {
        attempt: i32,
        start_after: DateTime<Utc>,
    },
    /// Left in `failed`, visible but never retried.
    Exhausted,
}

#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Persist a job, or return `None` when one is already outstanding for the
    /// same topic and singleton key.
    async fn send(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: SendOptions,
    ) -> Result<Option<Uuid>>;

    /// Claim the oldest runnable job for a topic, moving it to `active`.
    async fn fetch(&self, topic: &str, now: DateTime<Utc>) -> Result<Option<Job>>;

    async fn complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition>;

    /// Cancel `created`/`retry` jobs for a singleton key. Active jobs are untouched.
    async fn cancel_outstanding(&self, topic: &str, singleton_key: &str) -> Result<u64>;

    async fn has_active(&self, topic: &str, singleton_key: &str) -> Result<bool>;

    /// Active jobs running past their expiration. Reported, never reclaimed.
    async fn stuck(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Put jobs left `active` by a dead process back into `retry`.
    async fn recover_active(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Delete terminal jobs finished before `before`.
    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            limit: 5,
            delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(100),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(30));
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2), Duration::from_secs(100));
        assert_eq!(policy.delay_for(40), Duration::from_secs(100));
    }

    #[test]
    fn unrecoverable_failures_are_exhausted_immediately() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        assert_eq!(policy.disposition(0, 2, false, now), FailureDisposition::Exhausted);
        assert_eq!(policy.disposition(2, 2, true, now), FailureDisposition::Exhausted);
        assert_eq!(
            policy.disposition(1, 2, true, now),
            FailureDisposition::Retrying {
                attempt: 2,
                start_after: now + chrono::Duration::seconds(60),
            }
        );
    }

    #[test]
    fn stuck_only_after_expiry() {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            topic: POLL_TOPIC.to_owned(),
            payload: sqlx::types::Json(serde_json::json!({ "sourceKey": "metar_poll" })),
            singleton_key: Some("metar_poll".to_owned()),
            state: JobState::Active,
            retry_count: 0,
            retry_limit: 2,
            expire_in_seconds: 600,
            created_at: now,
            start_after: now,
            started_at: Some(now - chrono::Duration::seconds(601)),
            completed_at: None,
            last_error: None,
        };
        assert!(job.is_stuck(now));
        assert!(!job.is_stuck(now - chrono::Duration::seconds(2)));
        let payload: PollPayload = job.decode().unwrap();
        assert_eq!(payload.source_key, "metar_poll");
    }
}
