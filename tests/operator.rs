//! Operator controls over sources and the poll queue.

mod helpers;

use chrono::{Duration, Utc};
use helpers::{Harness, ScriptedPoller, with_status};
use skyfeed::data::models::SourceStatus;
use skyfeed::ingest::operator::OperatorError;
use skyfeed::pollers::PollOutcome;
use skyfeed::queue::{DurableQueue, JobState};
use std::sync::Arc;

fn harness() -> Harness {
    Harness::new(vec![
        Arc::new(ScriptedPoller::new("metar_poll", 300)),
        Arc::new(ScriptedPoller::new("storm_cell_poll", 120)),
    ])
}

#[tokio::test]
async fn restart_cancels_pending_jobs_and_enqueues_immediately() {
    let h = harness();
    let now = Utc::now();
    h.scheduler.tick_at(now).await.unwrap();
    let stale_job = h
        .queue
        .jobs()
        .into_iter()
        .find(|j| j.singleton_key.as_deref() == Some("metar_poll"))
        .unwrap()
        .id;

    let report = h.operator.restart("metar_poll", now).await.unwrap();

    assert_eq!(report.cancelled_jobs, 1);
    let new_job = report.job_id.expect("restart should enqueue a fresh job");
    assert_ne!(new_job, stale_job);

    let jobs = h.queue.jobs();
    let stale = jobs.iter().find(|j| j.id == stale_job).unwrap();
    assert_eq!(stale.state, JobState::Cancelled);
    assert_eq!(h.source("metar_poll").await.status, SourceStatus::Queued);
}

#[tokio::test]
async fn restart_clears_last_error_of_failed_source() {
    let h = harness();
    let now = Utc::now();
    h.edit("metar_poll", |s| {
        s.status = SourceStatus::Failed;
        s.last_error = Some("HTTP 500".to_owned());
        s.last_requested_at = Some(now);
    })
    .await;

    let report = h.operator.restart("metar_poll", now).await.unwrap();
    assert_eq!(report.cancelled_jobs, 0);
    assert!(report.job_id.is_some());

    let source = h.source("metar_poll").await;
    assert!(source.last_error.is_none());
    assert_eq!(source.last_requested_at, Some(now));
}

#[tokio::test]
async fn restart_refuses_running_source() {
    let h = harness();
    let now = Utc::now();
    h.scheduler.tick_at(now).await.unwrap();
    let job = h.claim(now).await.unwrap();
    assert_eq!(job.singleton_key.as_deref(), Some("metar_poll"));

    let err = h.operator.restart("metar_poll", now).await.unwrap_err();
    assert!(matches!(err, OperatorError::Busy(ref key) if key == "metar_poll"));

    h.edit("storm_cell_poll", with_status(SourceStatus::Running)).await;
    let err = h.operator.restart("storm_cell_poll", now).await.unwrap_err();
    assert!(matches!(err, OperatorError::Busy(_)));
}

#[tokio::test]
async fn unknown_source_is_not_found() {
    let h = harness();
    let err = h.operator.restart("pirep_poll", Utc::now()).await.unwrap_err();
    assert!(matches!(err, OperatorError::NotFound(_)));
    assert!(matches!(
        h.operator.toggle("pirep_poll").await.unwrap_err(),
        OperatorError::NotFound(_)
    ));
}

#[tokio::test]
async fn toggle_flips_enabled_and_summary_counts_it() {
    let h = harness();

    let source = h.operator.toggle("storm_cell_poll").await.unwrap();
    assert!(!source.enabled);

    let summary = h.operator.summary().await.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.enabled, 1);
    assert_eq!(summary.disabled, 1);
    assert_eq!(summary.idle, 2);

    let report = h.scheduler.tick_at(Utc::now()).await.unwrap();
    assert_eq!(report.enqueued, vec!["metar_poll".to_owned()]);

    assert!(h.operator.toggle("storm_cell_poll").await.unwrap().enabled);
}

#[tokio::test]
async fn history_is_newest_first() {
    let poller = Arc::new(
        ScriptedPoller::new("metar_poll", 60)
            .reply(Ok(PollOutcome::updated(1)))
            .reply(Ok(PollOutcome::updated(2))),
    );
    let h = Harness::new(vec![poller]);
    let mut now = Utc::now();

    for _ in 0..2 {
        h.scheduler.tick_at(now).await.unwrap();
        let job = h.claim(now).await.unwrap();
        h.worker.process(&job).await.unwrap();
        h.queue.complete(job.id, now).await.unwrap();
        now += Duration::seconds(61);
    }

    let history = h.operator.history("metar_poll", None).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].records_updated, 2);
    assert_eq!(history[1].records_updated, 1);

    let limited = h.operator.history("metar_poll", Some(1)).await.unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn stuck_reports_jobs_past_expiration() {
    let h = harness();
    let now = Utc::now();
    h.scheduler.tick_at(now).await.unwrap();
    let job = h.claim(now).await.unwrap();

    assert!(h.operator.stuck(now).await.unwrap().is_empty());

    let later = now + Duration::seconds(i64::from(job.expire_in_seconds) + 1);
    let stuck = h.operator.stuck(later).await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].job_id, job.id);
    assert_eq!(stuck[0].running_seconds, i64::from(job.expire_in_seconds) + 1);
    // Reported only; the job stays active.
    assert_eq!(h.queue.count_in(JobState::Active), 1);
}
