use tokio::sync::broadcast;

pub mod manager;
pub mod signals;
pub mod web;

#[derive(Debug)]
pub enum ServiceResult {
    GracefulShutdown,
    NormalCompletion,
    Error(anyhow::Error),
}

/// Common trait for all long-running services.
///
/// A service owns its shutdown: `run` returns once it has observed the
/// broadcast and drained whatever it had in flight.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// The name of the service for logging
    fn name(&self) -> &'static str;

    async fn run(&mut self, shutdown_rx: broadcast::Receiver<()>) -> Result<(), anyhow::Error>;
}

/// Run a service to completion, mapping its outcome to a [`ServiceResult`].
pub async fn run_service(
    mut service: Box<dyn Service>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> ServiceResult {
    let name = service.name();
    tracing::info!(service = name, "service started");

    let result = service.run(shutdown_rx.resubscribe()).await;
    let shutdown_requested = shutdown_rx.try_recv().is_ok();

    match result {
        Ok(()) if shutdown_requested => {
            tracing::info!(service = name, "service shut down gracefully");
            ServiceResult::GracefulShutdown
        }
        Ok(()) => {
            tracing::warn!(service = name, "service completed unexpectedly");
            ServiceResult::NormalCompletion
        }
        Err(e) => {
            tracing::error!(service = name, error = ?e, "service failed");
            ServiceResult::Error(e)
        }
    }
}
