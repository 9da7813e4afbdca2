//! Operator actions on the source registry.

use super::scheduler::{EnqueueOutcome, Scheduler};
use crate::data::models::{RunRecord, Source, SourceStatus, SourceSummary};
use crate::data::runs::{RunStore, clamp_limit};
use crate::data::sources::SourceStore;
use crate::queue::{DurableQueue, POLL_TOPIC};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("source {0} is running; wait for it to finish before restarting")]
    Busy(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Result of a forced restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartReport {
    pub source_key: String,
    pub cancelled_jobs: u64,
    /// Job enqueued by the immediate due check, if any.
    pub job_id: Option<Uuid>,
}

/// An `active` job running past its expiration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckJob {
    pub job_id: Uuid,
    pub source_key: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub running_seconds: i64,
    pub expire_in_seconds: i32,
    pub retry_count: i32,
}

#[derive(Clone)]
pub struct Operator {
    sources: Arc<dyn SourceStore>,
    runs: Arc<dyn RunStore>,
    queue: Arc<dyn DurableQueue>,
    scheduler: Scheduler,
}

impl Operator {
    pub fn new(
        sources: Arc<dyn SourceStore>,
        runs: Arc<dyn RunStore>,
        queue: Arc<dyn DurableQueue>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            sources,
            runs,
            queue,
            scheduler,
        }
    }

    pub async fn list(&self) -> Result<Vec<Source>, OperatorError> {
        Ok(self.sources.list().await?)
    }

    pub async fn get(&self, key: &str) -> Result<Source, OperatorError> {
        self.sources
            .get(key)
            .await?
            .ok_or_else(|| OperatorError::NotFound(key.to_owned()))
    }

    pub async fn summary(&self) -> Result<SourceSummary, OperatorError> {
        let sources = self.sources.list().await?;
        Ok(SourceSummary::from_sources(&sources))
    }

    /// Most recent runs for `key`, newest first.
    pub async fn history(&self, key: &str, limit: Option<i64>) -> Result<Vec<RunRecord>, OperatorError> {
        self.get(key).await?;
        Ok(self.runs.recent(key, clamp_limit(limit)).await?)
    }

    /// Flip the enabled flag and return the updated source.
    pub async fn toggle(&self, key: &str) -> Result<Source, OperatorError> {
        let enabled = self
            .sources
            .toggle_enabled(key)
            .await?
            .ok_or_else(|| OperatorError::NotFound(key.to_owned()))?;
        info!(source = key, enabled, "Source toggled");
        self.get(key).await
    }

    /// Cancel pending jobs, reset the source and check it for scheduling
    /// right away. Refused while the source is running.
    pub async fn restart(&self, key: &str, now: DateTime<Utc>) -> Result<RestartReport, OperatorError> {
        let source = self.get(key).await?;
        if source.status == SourceStatus::Running || self.queue.has_active(POLL_TOPIC, key).await? {
            return Err(OperatorError::Busy(key.to_owned()));
        }

        let cancelled_jobs = self.queue.cancel_outstanding(POLL_TOPIC, key).await?;
        if !self.sources.reset_for_restart(key).await? {
            return Err(OperatorError::Busy(key.to_owned()));
        }

        let source = self.get(key).await?;
        let job_id = match self.scheduler.enqueue_if_due(&source, now).await? {
            EnqueueOutcome::Enqueued(id) => Some(id),
            _ => None,
        };

        info!(source = key, cancelled_jobs, job_id = ?job_id, "Source restarted");
        Ok(RestartReport {
            source_key: key.to_owned(),
            cancelled_jobs,
            job_id,
        })
    }

    pub async fn stuck(&self, now: DateTime<Utc>) -> Result<Vec<StuckJob>, OperatorError> {
        let jobs = self.queue.stuck(now).await?;
        Ok(jobs
            .into_iter()
            .map(|job| StuckJob {
                job_id: job.id,
                running_seconds: job
                    .started_at
                    .map(|started| (now - started).num_seconds())
                    .unwrap_or_default(),
                source_key: job.singleton_key,
                started_at: job.started_at,
                expire_in_seconds: job.expire_in_seconds,
                retry_count: job.retry_count,
            })
            .collect())
    }
}
