//! Application state shared across the web handlers and background services.

use crate::cycles::CycleManager;
use crate::cycles::lifecycle::CycleService;
use crate::ingest::operator::Operator;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

/// Lifecycle of a background service as shown by `/api/health`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Starting,
    Active,
    Disabled,
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct StatusEntry {
    pub status: ServiceStatus,
    /// When `status` was last reported.
    pub since: Instant,
}

/// Last reported status per service name. Services report themselves; the
/// health handler only reads.
#[derive(Debug, Clone, Default)]
pub struct ServiceStatusRegistry {
    entries: Arc<DashMap<&'static str, StatusEntry>>,
}

impl ServiceStatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, service: &'static str, status: ServiceStatus) {
        let previous = self.entries.insert(
            service,
            StatusEntry {
                status,
                since: Instant::now(),
            },
        );
        if previous.is_none_or(|p| p.status != status) {
            trace!(service, status = ?status, "service status changed");
        }
    }

    pub fn get(&self, service: &str) -> Option<ServiceStatus> {
        self.entries.get(service).map(|entry| entry.status)
    }

    /// Every reported service, ordered by name.
    pub fn all(&self) -> Vec<(&'static str, StatusEntry)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        entries.sort_unstable_by_key(|(name, _)| *name);
        entries
    }
}

#[derive(Clone)]
pub struct AppState {
    pub operator: Operator,
    pub cycles: CycleService,
    pub cycle_manager: Arc<CycleManager>,
    pub service_statuses: ServiceStatusRegistry,
    /// Bearer token guarding `/api/admin`; `None` leaves it open.
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        operator: Operator,
        cycles: CycleService,
        service_statuses: ServiceStatusRegistry,
        admin_token: Option<String>,
    ) -> Self {
        Self {
            operator,
            cycle_manager: cycles.manager().clone(),
            cycles,
            service_statuses,
            admin_token: admin_token.filter(|t| !t.is_empty()).map(Arc::from),
        }
    }
}
