//! Pluggable feed pollers and the registry the worker dispatches through.

pub mod backoff;
pub mod http;
pub mod json;
pub mod metar;
pub mod storm_cell;
pub mod store;

use crate::data::models::{Source, SourceDescriptor};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What one poller execution accomplished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOutcome {
    pub records_updated: i32,
    /// Sub-fetches that failed without failing the run.
    pub errors: i32,
    pub last_error: Option<String>,
}

impl PollOutcome {
    pub fn updated(records_updated: usize) -> Self {
        Self {
            records_updated: i32::try_from(records_updated).unwrap_or(i32::MAX),
            ..Self::default()
        }
    }
}

/// One external feed.
///
/// Executions of the same poller never overlap, but an execution may be
/// retried from scratch after a failure, so writes must be idempotent.
#[async_trait]
pub trait Poller: Send + Sync {
    fn descriptor(&self) -> SourceDescriptor;

    /// Fetch and persist the feed. An `Err` fails the run; tolerated
    /// sub-fetch failures are reported through [`PollOutcome::errors`].
    async fn execute(&self) -> Result<PollOutcome>;
}

/// Periodic retention cleanup for upsert tables.
#[async_trait]
pub trait Sweeper: Send + Sync {
    fn name(&self) -> &'static str;

    /// Delete expired rows, returning how many were removed.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("poller already registered for key: {0}")]
    Duplicate(String),
    #[error("no poller registered for enabled sources: {}", .0.join(", "))]
    Missing(Vec<String>),
}

/// Source key to poller map. Built once at startup and then shared read-only,
/// so every poller is registered before the worker consumes its first job.
#[derive(Default)]
pub struct PollerRegistry {
    pollers: BTreeMap<String, Arc<dyn Poller>>,
}

impl PollerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, poller: Arc<dyn Poller>) -> Result<(), RegistryError> {
        let key = poller.descriptor().key.to_owned();
        if self.pollers.contains_key(&key) {
            return Err(RegistryError::Duplicate(key));
        }
        self.pollers.insert(key, poller);
        Ok(())
    }

    pub fn with(mut self, poller: Arc<dyn Poller>) -> Result<Self, RegistryError> {
        self.register(poller)?;
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Poller>> {
        self.pollers.get(key).cloned()
    }

    pub fn descriptors(&self) -> Vec<SourceDescriptor> {
        self.pollers.values().map(|p| p.descriptor()).collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.pollers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.pollers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pollers.is_empty()
    }

    /// Fail if any enabled source has no registered poller.
    pub fn ensure_covers(&self, sources: &[Source]) -> Result<(), RegistryError> {
        let missing: Vec<String> = sources
            .iter()
            .filter(|s| s.enabled && !self.pollers.contains_key(&s.key))
            .map(|s| s.key.clone())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Missing(missing))
        }
    }
}

impl std::fmt::Debug for PollerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.pollers.keys()).finish()
    }
}
