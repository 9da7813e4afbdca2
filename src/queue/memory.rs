//! Process-local queue with the same admission and retry rules as [`PgQueue`].
//!
//! [`PgQueue`]: super::postgres::PgQueue

use super::{DurableQueue, FailureDisposition, Job, JobState, RetryPolicy, SendOptions};
use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct MemoryQueue {
    jobs: Mutex<Vec<Job>>,
    policy: RetryPolicy,
}

impl MemoryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            jobs: Mutex::default(),
            policy,
        }
    }

    /// Snapshot of every job ever sent, in send order.
    pub fn jobs(&self) -> Vec<Job> {
        self.lock().clone()
    }

    pub fn count_in(&self, state: JobState) -> usize {
        self.lock().iter().filter(|j| j.state == state).count()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn send(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: SendOptions,
    ) -> Result<Option<Uuid>> {
        let mut jobs = self.lock();

        if let Some(key) = &options.singleton_key {
            let duplicate = jobs.iter().any(|j| {
                j.topic == topic && j.singleton_key.as_ref() == Some(key) && j.state.is_outstanding()
            });
            if duplicate {
                return Ok(None);
            }
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        jobs.push(Job {
            id,
            topic: topic.to_owned(),
            payload: sqlx::types::Json(payload),
            singleton_key: options.singleton_key,
            state: JobState::Created,
            retry_count: 0,
            retry_limit: self.policy.limit,
            expire_in_seconds: i32::try_from(options.expire_in_seconds).unwrap_or(i32::MAX),
            created_at: now,
            // Claimable immediately regardless of the caller's clock.
            start_after: DateTime::<Utc>::MIN_UTC,
            started_at: None,
            completed_at: None,
            last_error: None,
        });
        Ok(Some(id))
    }

    async fn fetch(&self, topic: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut jobs = self.lock();
        let next = jobs
            .iter_mut()
            .filter(|j| j.topic == topic && j.state.is_claimable() && j.start_after <= now)
            .min_by_key(|j| j.created_at);

        Ok(next.map(|job| {
            job.state = JobState::Active;
            job.started_at = Some(now);
            job.clone()
        }))
    }

    async fn complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut jobs = self.lock();
        if let Some(job) = jobs
            .iter_mut()
            .find(|j| j.id == id && j.state == JobState::Active)
        {
            job.state = JobState::Completed;
            job.completed_at = Some(now);
        }
        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition> {
        let mut jobs = self.lock();
        let Some(job) = jobs
            .iter_mut()
            .find(|j| j.id == id && j.state == JobState::Active)
        else {
            bail!("job {id} is not active");
        };

        let disposition = self
            .policy
            .disposition(job.retry_count, job.retry_limit, retryable, now);
        job.last_error = Some(error.to_owned());
        match disposition {
            FailureDisposition::Retrying {
                attempt,
                start_after,
            } => {
                job.state = JobState::Retry;
                job.retry_count = attempt;
                job.start_after = start_after;
                job.started_at = None;
            }
            FailureDisposition::Exhausted => {
                job.state = JobState::Failed;
                job.completed_at = Some(now);
            }
        }
        Ok(disposition)
    }

    async fn cancel_outstanding(&self, topic: &str, singleton_key: &str) -> Result<u64> {
        let now = Utc::now();
        let mut cancelled = 0;
        for job in self.lock().iter_mut() {
            if job.topic == topic
                && job.singleton_key.as_deref() == Some(singleton_key)
                && job.state.is_claimable()
            {
                job.state = JobState::Cancelled;
                job.completed_at = Some(now);
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn has_active(&self, topic: &str, singleton_key: &str) -> Result<bool> {
        Ok(self.lock().iter().any(|j| {
            j.topic == topic
                && j.singleton_key.as_deref() == Some(singleton_key)
                && j.state == JobState::Active
        }))
    }

    async fn stuck(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut stuck: Vec<Job> = self
            .lock()
            .iter()
            .filter(|j| j.is_stuck(now))
            .cloned()
            .collect();
        stuck.sort_by_key(|j| j.started_at);
        Ok(stuck)
    }

    async fn recover_active(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut recovered = 0;
        for job in self.lock().iter_mut() {
            if job.state == JobState::Active {
                job.state = JobState::Retry;
                job.start_after = now;
                job.started_at = None;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.lock();
        let len = jobs.len();
        jobs.retain(|j| !(j.state.is_terminal() && j.completed_at.is_some_and(|t| t < before)));
        Ok((len - jobs.len()) as u64)
    }
}
