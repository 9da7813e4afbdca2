//! Health handler.

use axum::extract::State;
use axum::response::Json;
use serde::Serialize;
use tracing::trace;

use crate::state::{AppState, ServiceStatus};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    name: &'static str,
    status: ServiceStatus,
    /// Seconds since the service last reported.
    reported_secs_ago: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    status: ServiceStatus,
    version: &'static str,
    services: Vec<ServiceInfo>,
}

/// Reduce individual service statuses to one overall status.
pub fn overall_status<'a>(statuses: impl IntoIterator<Item = &'a ServiceStatus>) -> ServiceStatus {
    let mut any = false;
    let mut all_active = true;
    for status in statuses {
        any = true;
        match status {
            ServiceStatus::Error => return ServiceStatus::Error,
            ServiceStatus::Active => {}
            _ => all_active = false,
        }
    }

    match (any, all_active) {
        (false, _) => ServiceStatus::Disabled,
        (true, true) => ServiceStatus::Active,
        (true, false) => ServiceStatus::Starting,
    }
}

/// `GET /api/health`
pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    trace!("health check requested");

    let services: Vec<ServiceInfo> = state
        .service_statuses
        .all()
        .into_iter()
        .map(|(name, entry)| ServiceInfo {
            name,
            status: entry.status,
            reported_secs_ago: entry.since.elapsed().as_secs(),
        })
        .collect();

    Json(HealthResponse {
        status: overall_status(services.iter().map(|s| &s.status)),
        version: env!("CARGO_PKG_VERSION"),
        services,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_status_reduction() {
        assert_eq!(overall_status(Vec::<&ServiceStatus>::new()), ServiceStatus::Disabled);
        assert_eq!(
            overall_status([&ServiceStatus::Active, &ServiceStatus::Active]),
            ServiceStatus::Active
        );
        assert_eq!(
            overall_status([&ServiceStatus::Active, &ServiceStatus::Starting]),
            ServiceStatus::Starting
        );
        assert_eq!(
            overall_status([&ServiceStatus::Disabled, &ServiceStatus::Error]),
            ServiceStatus::Error
        );
    }
}
