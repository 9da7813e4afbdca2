use super::{DurableQueue, FailureDisposition, Job, JobError};
use crate::utils::fmt_duration;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

/// Processes a single claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

#[derive(Debug, Clone, Copy)]
pub struct WorkOptions {
    /// Maximum jobs handled at once.
    pub concurrency: usize,
    /// Sleep between polls when the topic is empty.
    pub poll_interval: Duration,
}

impl Default for WorkOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Consume `topic` until shutdown, running up to `concurrency` handlers at once.
///
/// A permit is acquired before each claim, so a job is never taken out of the
/// queue without a free slot to run it. On shutdown no new jobs are claimed
/// and in-flight handlers are awaited.
pub async fn work(
    queue: Arc<dyn DurableQueue>,
    topic: &'static str,
    options: WorkOptions,
    handler: Arc<dyn JobHandler>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let concurrency = options.concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut in_flight = JoinSet::new();

    info!(topic, concurrency, "Queue consumer started");

    loop {
        while let Some(result) = in_flight.try_join_next() {
            if let Err(e) = result {
                error!(topic, error = ?e, "Job task panicked");
            }
        }

        let permit = tokio::select! {
            _ = shutdown_rx.recv() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let claimed = tokio::select! {
            _ = shutdown_rx.recv() => break,
            result = queue.fetch(topic, Utc::now()) => result,
        };

        let wait = match claimed {
            Ok(Some(job)) => {
                let queue = queue.clone();
                let handler = handler.clone();
                in_flight.spawn(async move {
                    run_job(queue.as_ref(), handler.as_ref(), job).await;
                    drop(permit);
                });
                continue;
            }
            Ok(None) => {
                trace!(topic, "No jobs available, waiting");
                options.poll_interval
            }
            Err(e) => {
                warn!(topic, error = ?e, "Failed to claim job, waiting");
                options.poll_interval * 5
            }
        };
        drop(permit);

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = time::sleep(wait) => {}
        }
    }

    if !in_flight.is_empty() {
        info!(topic, in_flight = in_flight.len(), "Draining in-flight jobs");
    }
    while let Some(result) = in_flight.join_next().await {
        if let Err(e) = result {
            error!(topic, error = ?e, "Job task panicked");
        }
    }
    info!(topic, "Queue consumer stopped");
}

async fn run_job(queue: &dyn DurableQueue, handler: &dyn JobHandler, job: Job) {
    let job_id = job.id;
    let start = Instant::now();
    debug!(%job_id, attempt = job.retry_count, "Processing job");

    match handler.handle(&job).await {
        Ok(()) => {
            if let Err(e) = queue.complete(job_id, Utc::now()).await {
                error!(%job_id, error = ?e, "Failed to complete job");
            }
        }
        Err(e) => {
            let message = e.to_string();
            match queue
                .fail(job_id, &message, e.is_retryable(), Utc::now())
                .await
            {
                Ok(FailureDisposition::Retrying {
                    attempt,
                    start_after,
                }) => {
                    warn!(
                        %job_id,
                        attempt,
                        retry_limit = job.retry_limit,
                        %start_after,
                        duration = fmt_duration(start.elapsed()),
                        error = %message,
                        "Job failed, will retry"
                    );
                }
                Ok(FailureDisposition::Exhausted) => {
                    error!(
                        %job_id,
                        retryable = e.is_retryable(),
                        retry_count = job.retry_count,
                        duration = fmt_duration(start.elapsed()),
                        error = %message,
                        "Job failed permanently"
                    );
                }
                Err(fail_err) => {
                    error!(%job_id, error = ?fail_err, "Failed to record job failure");
                }
            }
        }
    }
}
