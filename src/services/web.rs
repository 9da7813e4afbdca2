use super::Service;
use crate::state::{AppState, ServiceStatus};
use crate::web::create_router;
use anyhow::Context;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, trace, warn};

/// Web server service implementation
pub struct WebService {
    port: u16,
    app_state: AppState,
}

impl WebService {
    pub fn new(port: u16, app_state: AppState) -> Self {
        Self { port, app_state }
    }
}

#[async_trait::async_trait]
impl Service for WebService {
    fn name(&self) -> &'static str {
        "web"
    }

    async fn run(&mut self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), anyhow::Error> {
        let app = create_router(self.app_state.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind web server to {addr}"))?;
        self.app_state
            .service_statuses
            .set(self.name(), ServiceStatus::Active);

        let link = format!("http://localhost:{}", addr.port());
        info!(service = "web", address = %addr, link = %link, "web server listening");

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                if shutdown_rx.recv().await.is_err() {
                    warn!("shutdown channel closed before a signal was sent");
                }
                trace!(service = "web", "graceful shutdown signal received");
            })
            .await;
        if let Err(e) = served {
            self.app_state
                .service_statuses
                .set(self.name(), ServiceStatus::Error);
            return Err(e).context("web server error");
        }

        self.app_state
            .service_statuses
            .set(self.name(), ServiceStatus::Disabled);
        info!(service = "web", "web server stopped");
        Ok(())
    }
}
