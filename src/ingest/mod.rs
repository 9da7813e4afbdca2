//! Polling orchestration: the scheduler enqueues due sources, the worker
//! executes them, and the operator surface lets an admin intervene.

pub mod operator;
pub mod scheduler;
pub mod worker;

use crate::queue::{DurableQueue, WorkOptions};
use crate::services::Service;
use crate::state::{ServiceStatus, ServiceStatusRegistry};
use scheduler::Scheduler;
use std::sync::Arc;
use tokio::sync::broadcast;
use worker::Worker;

/// Runs the scheduler loop as a managed service.
pub struct SchedulerService {
    scheduler: Scheduler,
    service_statuses: ServiceStatusRegistry,
}

impl SchedulerService {
    pub fn new(scheduler: Scheduler, service_statuses: ServiceStatusRegistry) -> Self {
        Self {
            scheduler,
            service_statuses,
        }
    }
}

#[async_trait::async_trait]
impl Service for SchedulerService {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn run(&mut self, shutdown_rx: broadcast::Receiver<()>) -> Result<(), anyhow::Error> {
        self.service_statuses.set(self.name(), ServiceStatus::Active);
        self.scheduler.run(shutdown_rx).await;
        self.service_statuses.set(self.name(), ServiceStatus::Disabled);
        Ok(())
    }
}

/// Runs the poll job consumer as a managed service.
pub struct WorkerService {
    worker: Worker,
    queue: Arc<dyn DurableQueue>,
    options: WorkOptions,
    service_statuses: ServiceStatusRegistry,
}

impl WorkerService {
    pub fn new(
        worker: Worker,
        queue: Arc<dyn DurableQueue>,
        options: WorkOptions,
        service_statuses: ServiceStatusRegistry,
    ) -> Self {
        Self {
            worker,
            queue,
            options,
            service_statuses,
        }
    }
}

#[async_trait::async_trait]
impl Service for WorkerService {
    fn name(&self) -> &'static str {
        "worker"
    }

    async fn run(&mut self, shutdown_rx: broadcast::Receiver<()>) -> Result<(), anyhow::Error> {
        self.service_statuses.set(self.name(), ServiceStatus::Active);
        self.worker
            .clone()
            .run(self.queue.clone(), self.options, shutdown_rx)
            .await;
        self.service_statuses.set(self.name(), ServiceStatus::Disabled);
        Ok(())
    }
}
