#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skyfeed::data::memory::{MemoryRunStore, MemorySourceStore};
use skyfeed::data::models::{Source, SourceDescriptor, SourceStatus};
use skyfeed::ingest::operator::Operator;
use skyfeed::ingest::scheduler::{Scheduler, SchedulerSettings};
use skyfeed::ingest::worker::Worker;
use skyfeed::pollers::{PollOutcome, Poller, PollerRegistry};
use skyfeed::queue::memory::MemoryQueue;
use skyfeed::queue::{Job, POLL_TOPIC, RetryPolicy};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A poller that replays scripted results, then keeps succeeding with no records.
pub struct ScriptedPoller {
    key: &'static str,
    interval_seconds: i32,
    replies: Mutex<VecDeque<Result<PollOutcome, String>>>,
    calls: AtomicUsize,
}

impl ScriptedPoller {
    pub fn new(key: &'static str, interval_seconds: i32) -> Self {
        Self {
            key,
            interval_seconds,
            replies: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn reply(self, reply: Result<PollOutcome, &str>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push_back(reply.map_err(str::to_owned));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Poller for ScriptedPoller {
    fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            key: self.key,
            name: "Scripted feed",
            interval_seconds: self.interval_seconds,
        }
    }

    async fn execute(&self) -> anyhow::Result<PollOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(PollOutcome::default()),
        }
    }
}

/// Scheduler, worker and operator wired to in-memory stores.
pub struct Harness {
    pub sources: Arc<MemorySourceStore>,
    pub runs: Arc<MemoryRunStore>,
    pub queue: Arc<MemoryQueue>,
    pub scheduler: Scheduler,
    pub worker: Worker,
    pub operator: Operator,
}

impl Harness {
    pub fn new(pollers: Vec<Arc<dyn Poller>>) -> Self {
        Self::with_retry_policy(pollers, RetryPolicy::default())
    }

    pub fn with_retry_policy(pollers: Vec<Arc<dyn Poller>>, policy: RetryPolicy) -> Self {
        let sources = Arc::new(MemorySourceStore::new());
        let runs = Arc::new(MemoryRunStore::new());
        let queue = Arc::new(MemoryQueue::new(policy));

        let mut registry = PollerRegistry::new();
        for poller in pollers {
            sources.put(Source::from(&poller.descriptor()));
            registry.register(poller).unwrap();
        }

        let scheduler = Scheduler::new(sources.clone(), queue.clone(), SchedulerSettings::default());
        let worker = Worker::new(sources.clone(), runs.clone(), Arc::new(registry));
        let operator = Operator::new(sources.clone(), runs.clone(), queue.clone(), scheduler.clone());

        Self {
            sources,
            runs,
            queue,
            scheduler,
            worker,
            operator,
        }
    }

    pub async fn source(&self, key: &str) -> Source {
        use skyfeed::data::sources::SourceStore;
        self.sources.get(key).await.unwrap().unwrap()
    }

    /// Overwrite fields of a stored source.
    pub async fn edit(&self, key: &str, f: impl FnOnce(&mut Source)) {
        let mut source = self.source(key).await;
        f(&mut source);
        self.sources.put(source);
    }

    /// Claim the next poll job, as a consumer would.
    pub async fn claim(&self, now: DateTime<Utc>) -> Option<Job> {
        use skyfeed::queue::DurableQueue;
        self.queue.fetch(POLL_TOPIC, now).await.unwrap()
    }
}

pub fn with_status(status: SourceStatus) -> impl FnOnce(&mut Source) {
    move |s| s.status = status
}
