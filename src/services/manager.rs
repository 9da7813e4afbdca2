use crate::services::{Service, ServiceResult, run_service};
use crate::utils::fmt_duration;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owns registered services, spawns them and coordinates their shutdown.
pub struct ServiceManager {
    registered_services: HashMap<String, Box<dyn Service>>,
    running_services: HashMap<String, JoinHandle<ServiceResult>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            registered_services: HashMap::new(),
            running_services: HashMap::new(),
            shutdown_tx,
        }
    }

    /// Register a service to be managed (not yet spawned)
    pub fn register_service(&mut self, name: &str, service: Box<dyn Service>) {
        self.registered_services.insert(name.to_owned(), service);
    }

    pub fn has_services(&self) -> bool {
        !self.registered_services.is_empty()
    }

    /// Spawn all registered services
    pub fn spawn_all(&mut self) {
        let service_count = self.registered_services.len();
        let service_names: Vec<_> = self.registered_services.keys().cloned().collect();

        for (name, service) in self.registered_services.drain() {
            let shutdown_rx = self.shutdown_tx.subscribe();
            let handle = tokio::spawn(run_service(service, shutdown_rx));
            debug!(service = name, id = ?handle.id(), "service spawned");
            self.running_services.insert(name, handle);
        }

        info!(
            service_count,
            services = ?service_names,
            "spawned {} services",
            service_count
        );
    }

    /// Wait for any service to finish. Returns its name and result.
    ///
    /// Pends forever when nothing is running.
    pub async fn run(&mut self) -> (String, ServiceResult) {
        if self.running_services.is_empty() {
            return std::future::pending().await;
        }

        let (name, result) = {
            let futures = self.running_services.iter_mut().map(|(name, handle)| {
                let name = name.clone();
                Box::pin(async move {
                    let result = match handle.await {
                        Ok(result) => result,
                        Err(e) => ServiceResult::Error(anyhow::anyhow!("task panicked: {e}")),
                    };
                    (name, result)
                })
            });
            futures::future::select_all(futures).await.0
        };

        self.running_services.remove(&name);
        (name, result)
    }

    /// Signal every running service to stop and wait for them, up to `timeout`.
    ///
    /// Returns the elapsed time on success, or the names of the services that
    /// did not finish in time.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<Duration, Vec<String>> {
        let service_count = self.running_services.len();
        info!(service_count, timeout = fmt_duration(timeout), "shutting down services");

        // No receivers is fine: every service may already have exited.
        let _ = self.shutdown_tx.send(());

        let start = std::time::Instant::now();
        let mut pending = Vec::new();

        for (name, handle) in self.running_services.drain() {
            let remaining = timeout.saturating_sub(start.elapsed());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(_)) => debug!(service = name, "service shut down"),
                Ok(Err(e)) => warn!(service = name, error = ?e, "service task panicked during shutdown"),
                Err(_) => {
                    warn!(service = name, "service did not shut down in time");
                    pending.push(name);
                }
            }
        }

        if pending.is_empty() {
            Ok(start.elapsed())
        } else {
            Err(pending)
        }
    }
}
