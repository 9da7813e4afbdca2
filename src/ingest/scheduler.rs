use crate::data::models::Source;
use crate::data::sources::SourceStore;
use crate::pollers::Sweeper;
use crate::queue::{DurableQueue, POLL_TOPIC, PollPayload, SendOptions};
use crate::utils::{fmt_duration, log_if_slow};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

const SLOW_TICK_THRESHOLD: Duration = Duration::from_millis(500);

/// How long a shutdown waits for an in-progress tick.
const TICK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Terminal queue jobs are kept this long for inspection.
const FINISHED_JOB_RETENTION: chrono::Duration = chrono::Duration::days(7);

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub tick: Duration,
    pub cleanup_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(15 * 60),
        }
    }
}

/// Result of checking a single source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(Uuid),
    /// Disabled, or not in `idle`/`failed`.
    NotSchedulable,
    NotDue,
    /// Another actor moved the source first.
    Contended,
    /// The queue already holds an outstanding job for this source. The source
    /// is put back to its previous status.
    Deduplicated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub checked: usize,
    pub enqueued: Vec<String>,
    pub contended: usize,
    pub deduplicated: usize,
    pub failed: usize,
}

/// Finds due sources and enqueues one poll job for each.
#[derive(Clone)]
pub struct Scheduler {
    sources: Arc<dyn SourceStore>,
    queue: Arc<dyn DurableQueue>,
    sweepers: Vec<Arc<dyn Sweeper>>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(
        sources: Arc<dyn SourceStore>,
        queue: Arc<dyn DurableQueue>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            sources,
            queue,
            sweepers: Vec::new(),
            settings,
        }
    }

    pub fn with_sweeper(mut self, sweeper: Arc<dyn Sweeper>) -> Self {
        self.sweepers.push(sweeper);
        self
    }

    /// Move `source` to `queued` and enqueue its job, if it is due.
    ///
    /// The status CAS happens before the send, so of two concurrent callers
    /// only the one whose update affected a row ever reaches the queue.
    pub async fn enqueue_if_due(&self, source: &Source, now: DateTime<Utc>) -> Result<EnqueueOutcome> {
        if !source.enabled || !source.status.is_schedulable() {
            return Ok(EnqueueOutcome::NotSchedulable);
        }
        if !source.is_due(now) {
            return Ok(EnqueueOutcome::NotDue);
        }
        if !self.sources.try_mark_queued(&source.key, now).await? {
            return Ok(EnqueueOutcome::Contended);
        }

        let payload = serde_json::to_value(PollPayload {
            source_key: source.key.clone(),
        })?;
        let options = SendOptions {
            singleton_key: Some(source.key.clone()),
            expire_in_seconds: source.expire_in_seconds(),
        };

        match self.queue.send(POLL_TOPIC, payload, options).await {
            Ok(Some(job_id)) => Ok(EnqueueOutcome::Enqueued(job_id)),
            Ok(None) => {
                // A queued source is never rescheduled, so it must not outlive the job.
                self.release(source).await;
                Ok(EnqueueOutcome::Deduplicated)
            }
            Err(e) => {
                self.release(source).await;
                Err(e.context(format!("failed to enqueue job for {}", source.key)))
            }
        }
    }

    /// Put `source` back the way it was before this caller queued it.
    async fn release(&self, source: &Source) {
        match self
            .sources
            .release_queued(&source.key, source.status, source.last_requested_at)
            .await
        {
            Ok(true) => trace!(source = %source.key, status = %source.status, "Released queued source"),
            Ok(false) => debug!(source = %source.key, "Source moved on before release"),
            Err(e) => error!(source = %source.key, error = ?e, "Failed to release queued source"),
        }
    }

    /// Check a single source by key.
    pub async fn enqueue_key(&self, key: &str, now: DateTime<Utc>) -> Result<Option<EnqueueOutcome>> {
        let Some(source) = self.sources.get(key).await? else {
            return Ok(None);
        };
        self.enqueue_if_due(&source, now).await.map(Some)
    }

    /// Run one scheduling pass as of `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        self.tick_until_cancelled(now, &CancellationToken::new())
            .await
    }

    #[instrument(skip_all, fields(now = %now))]
    async fn tick_until_cancelled(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<TickReport> {
        let start = Instant::now();
        let candidates = self
            .sources
            .schedulable()
            .await
            .context("failed to load schedulable sources")?;

        let mut report = TickReport::default();
        for source in &candidates {
            // Stop between sources, never between the CAS and the send.
            if cancel.is_cancelled() {
                debug!("Tick cancelled");
                break;
            }
            report.checked += 1;

            match self.enqueue_if_due(source, now).await {
                Ok(EnqueueOutcome::Enqueued(job_id)) => {
                    debug!(source = %source.key, %job_id, "Enqueued poll job");
                    report.enqueued.push(source.key.clone());
                }
                Ok(EnqueueOutcome::Contended) => {
                    trace!(source = %source.key, "Source claimed by another scheduler");
                    report.contended += 1;
                }
                Ok(EnqueueOutcome::Deduplicated) => {
                    debug!(source = %source.key, "Poll job already outstanding");
                    report.deduplicated += 1;
                }
                Ok(EnqueueOutcome::NotDue | EnqueueOutcome::NotSchedulable) => {}
                Err(e) => {
                    warn!(source = %source.key, error = ?e, "Failed to schedule source");
                    report.failed += 1;
                }
            }
        }

        log_if_slow(start, SLOW_TICK_THRESHOLD, "scheduler tick");
        if !report.enqueued.is_empty() || report.failed > 0 {
            info!(
                checked = report.checked,
                enqueued = report.enqueued.len(),
                deduplicated = report.deduplicated,
                failed = report.failed,
                duration = fmt_duration(start.elapsed()),
                "Scheduler tick complete"
            );
        }
        Ok(report)
    }

    /// Run every retention sweeper and purge old terminal jobs.
    pub async fn sweep(&self, now: DateTime<Utc>) -> u64 {
        let mut removed = 0;
        for sweeper in &self.sweepers {
            match sweeper.sweep(now).await {
                Ok(0) => {}
                Ok(n) => {
                    info!(table = sweeper.name(), removed = n, "Retention sweep removed rows");
                    removed += n;
                }
                Err(e) => warn!(table = sweeper.name(), error = ?e, "Retention sweep failed"),
            }
        }

        match self.queue.purge_finished(now - FINISHED_JOB_RETENTION).await {
            Ok(0) => {}
            Ok(n) => {
                debug!(removed = n, "Purged finished jobs");
                removed += n;
            }
            Err(e) => warn!(error = ?e, "Failed to purge finished jobs"),
        }
        removed
    }

    /// Tick on a fixed interval until shutdown.
    ///
    /// A tick runs in its own task. If the previous tick is still going when
    /// the next one is due, that tick is skipped. On shutdown the running tick
    /// is cancelled at the next source boundary and given a few seconds to stop.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            tick = fmt_duration(self.settings.tick),
            cleanup_interval = fmt_duration(self.settings.cleanup_interval),
            sweepers = self.sweepers.len(),
            "Scheduler started"
        );

        let mut next_tick = time::Instant::now();
        let mut next_cleanup = time::Instant::now() + self.settings.cleanup_interval;
        let mut current: Option<(JoinHandle<()>, CancellationToken)> = None;

        loop {
            tokio::select! {
                _ = time::sleep_until(next_tick) => {
                    next_tick = time::Instant::now() + self.settings.tick;

                    if let Some((handle, _)) = &current
                        && !handle.is_finished()
                    {
                        trace!("Previous tick still running, skipping");
                        continue;
                    }

                    let cancel = CancellationToken::new();
                    let handle = tokio::spawn({
                        let scheduler = self.clone();
                        let cancel = cancel.clone();
                        async move {
                            if let Err(e) = scheduler.tick_until_cancelled(Utc::now(), &cancel).await {
                                error!(error = ?e, "Scheduler tick failed");
                            }
                        }
                    });
                    current = Some((handle, cancel));
                }
                _ = time::sleep_until(next_cleanup) => {
                    next_cleanup = time::Instant::now() + self.settings.cleanup_interval;
                    self.sweep(Utc::now()).await;
                }
                _ = shutdown_rx.recv() => {
                    if let Some((handle, cancel)) = current.take() {
                        cancel.cancel();
                        if time::timeout(TICK_DRAIN_TIMEOUT, handle).await.is_err() {
                            warn!("Scheduler tick did not stop in time, abandoning it");
                        }
                    }
                    info!("Scheduler exiting gracefully");
                    break;
                }
            }
        }
    }
}
