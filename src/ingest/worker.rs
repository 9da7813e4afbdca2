use crate::data::models::{CompletionStats, NewRunRecord, RunOutcome};
use crate::data::runs::RunStore;
use crate::data::sources::SourceStore;
use crate::pollers::{PollOutcome, PollerRegistry};
use crate::queue::{
    DurableQueue, Job, JobError, JobHandler, POLL_TOPIC, PollPayload, WorkOptions, work,
};
use crate::utils::fmt_duration;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{Instrument, debug, error, info, warn};

/// Polls slower than this are logged as warnings.
const SLOW_POLL_THRESHOLD: Duration = Duration::from_secs(30);

/// Executes poll jobs: looks up the source's poller, runs it, and records the
/// result on the source row and in the run history.
#[derive(Clone)]
pub struct Worker {
    sources: Arc<dyn SourceStore>,
    runs: Arc<dyn RunStore>,
    registry: Arc<PollerRegistry>,
}

impl Worker {
    pub fn new(
        sources: Arc<dyn SourceStore>,
        runs: Arc<dyn RunStore>,
        registry: Arc<PollerRegistry>,
    ) -> Self {
        Self {
            sources,
            runs,
            registry,
        }
    }

    /// Consume [`POLL_TOPIC`] until shutdown.
    pub async fn run(
        self,
        queue: Arc<dyn DurableQueue>,
        options: WorkOptions,
        shutdown_rx: broadcast::Receiver<()>,
    ) {
        work(queue, POLL_TOPIC, options, Arc::new(self), shutdown_rx).await;
    }

    /// Run the poller named by `job`'s payload.
    ///
    /// A failed poll is returned as [`JobError::Recoverable`] so the queue
    /// applies its retry policy. Jobs that can never succeed (bad payload, no
    /// poller, source already running) are unrecoverable.
    pub async fn process(&self, job: &Job) -> Result<PollOutcome, JobError> {
        let payload: PollPayload = job.decode().map_err(|e| {
            JobError::Unrecoverable(anyhow!(e).context("invalid poll job payload"))
        })?;
        let key = payload.source_key;

        let Some(poller) = self.registry.get(&key) else {
            let message = format!("No poller registered for key: {key}");
            error!(source = %key, job_id = %job.id, "{message}");
            if let Err(e) = self.sources.mark_failed(&key, &message, None).await {
                warn!(source = %key, error = ?e, "Failed to mark unregistered source failed");
            }
            return Err(JobError::Unrecoverable(anyhow!(message)));
        };

        let claimed = self
            .sources
            .try_mark_running(&key)
            .await
            .map_err(JobError::Recoverable)?;
        if !claimed {
            return Err(JobError::Unrecoverable(anyhow!(
                "source {key} is already running"
            )));
        }

        let started_at = Utc::now();
        let start = Instant::now();

        // No deadline here: a hung feed shows up as a stuck job instead.
        let span = tracing::info_span!("poll", source = %key, job_id = %job.id, attempt = job.retry_count);
        let result = async {
            debug!("Executing poller");
            poller.execute().await
        }
        .instrument(span)
        .await;

        let elapsed = start.elapsed();
        let duration_ms = i32::try_from(elapsed.as_millis()).unwrap_or(i32::MAX);
        let completed_at = Utc::now();

        if elapsed > SLOW_POLL_THRESHOLD {
            warn!(source = %key, duration = fmt_duration(elapsed), "Slow poll detected");
        }

        match result {
            Ok(outcome) => {
                self.record_success(&key, &outcome, started_at, completed_at, duration_ms)
                    .await;
                Ok(outcome)
            }
            Err(e) => {
                let message = format!("{e:#}");
                warn!(source = %key, duration = fmt_duration(elapsed), error = %message, "Poll failed");

                if let Err(store_err) = self.sources.mark_failed(&key, &message, Some(duration_ms)).await {
                    error!(source = %key, error = ?store_err, "Failed to mark source failed");
                }
                self.append_run(NewRunRecord {
                    source_key: key.clone(),
                    outcome: RunOutcome::Failed,
                    started_at,
                    completed_at,
                    duration_ms,
                    records_updated: 0,
                    error_count: 1,
                    error_message: Some(message),
                })
                .await;

                Err(JobError::Recoverable(e))
            }
        }
    }

    async fn record_success(
        &self,
        key: &str,
        outcome: &PollOutcome,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        duration_ms: i32,
    ) {
        let stats = CompletionStats {
            completed_at,
            duration_ms,
            records_updated: outcome.records_updated,
            error_count: outcome.errors,
        };
        if let Err(e) = self.sources.mark_succeeded(key, stats).await {
            error!(source = %key, error = ?e, "Failed to record source completion");
        }

        let run_outcome = if outcome.errors > 0 {
            RunOutcome::Partial
        } else {
            RunOutcome::Success
        };

        if outcome.errors > 0 {
            warn!(
                source = %key,
                records = outcome.records_updated,
                errors = outcome.errors,
                last_error = outcome.last_error.as_deref().unwrap_or(""),
                "Poll completed with errors"
            );
        } else if outcome.records_updated > 0 {
            info!(source = %key, records = outcome.records_updated, duration_ms, "Poll completed");
        } else {
            debug!(source = %key, duration_ms, "Poll completed, no records");
        }

        self.append_run(NewRunRecord {
            source_key: key.to_owned(),
            outcome: run_outcome,
            started_at,
            completed_at,
            duration_ms,
            records_updated: outcome.records_updated,
            error_count: outcome.errors,
            error_message: outcome.last_error.clone(),
        })
        .await;
    }

    async fn append_run(&self, run: NewRunRecord) {
        let key = run.source_key.clone();
        if let Err(e) = self.runs.append(run).await {
            error!(source = %key, error = ?e, "Failed to append run record");
        }
    }
}

#[async_trait]
impl JobHandler for Worker {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        self.process(job).await.map(|_| ())
    }
}
