//! Active data cycle resolution for reads.
//!
//! Each data group has at most one `active` cycle. Readers ask the
//! [`CycleManager`] which cycle to filter on; when none is active they get
//! [`CycleFilter::Legacy`] and read every row regardless of `cycle_id`.

pub mod lifecycle;

use crate::data::cycles::CycleStore;
use crate::data::models::DataGroup;
use anyhow::Result;
use dashmap::DashMap;
use sqlx::{Postgres, QueryBuilder};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};
use uuid::Uuid;

/// Which rows of a cycle-versioned table a read should see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleFilter {
    /// No active cycle: apply no filter.
    Legacy,
    Cycle(Uuid),
}

impl CycleFilter {
    pub fn from_id(id: Option<Uuid>) -> Self {
        id.map_or(Self::Legacy, Self::Cycle)
    }

    pub fn cycle_id(self) -> Option<Uuid> {
        match self {
            Self::Legacy => None,
            Self::Cycle(id) => Some(id),
        }
    }

    /// Whether a row tagged with `row_cycle` passes the filter.
    pub fn matches(self, row_cycle: Option<Uuid>) -> bool {
        match self {
            Self::Legacy => true,
            Self::Cycle(id) => row_cycle == Some(id),
        }
    }

    /// Append ` AND {column} = $n` to a query that already has a WHERE clause.
    /// Does nothing in legacy mode.
    pub fn push_predicate<'args>(self, qb: &mut QueryBuilder<'args, Postgres>, column: &str) {
        if let Self::Cycle(id) = self {
            qb.push(" AND ").push(column).push(" = ").push_bind(id);
        }
    }
}

/// Resolves the active cycle per data group, caching the answer in-process.
///
/// The cache holds "no active cycle" too, so legacy-mode groups don't hit
/// storage on every read. Entries are only dropped by [`invalidate`]; other
/// processes see a change once they are invalidated themselves.
///
/// Every invalidation bumps a generation counter. A miss that overlapped an
/// invalidation drops the entry it just wrote, so a value read before the
/// change can't outlive it.
///
/// [`invalidate`]: CycleManager::invalidate
pub struct CycleManager {
    store: Arc<dyn CycleStore>,
    cache: DashMap<DataGroup, Option<Uuid>>,
    generation: AtomicU64,
}

impl CycleManager {
    pub fn new(store: Arc<dyn CycleStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// The cycle a read of `group` should use.
    ///
    /// An override (admin preview of a staged cycle) is returned as-is without
    /// touching the cache. `None` means no cycle is active.
    pub async fn active_cycle_id(
        &self,
        group: DataGroup,
        override_id: Option<Uuid>,
    ) -> Result<Option<Uuid>> {
        if let Some(id) = override_id {
            trace!(%group, cycle_id = %id, "Using cycle override");
            return Ok(Some(id));
        }

        if let Some(cached) = self.cache.get(&group) {
            return Ok(*cached);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let active = self.store.active_id(group).await?;
        debug!(%group, cycle_id = ?active, "Resolved active cycle");
        self.cache.insert(group, active);
        if self.generation.load(Ordering::SeqCst) != generation {
            trace!(%group, "Cycle cache invalidated during lookup, dropping entry");
            self.cache.remove(&group);
        }
        Ok(active)
    }

    pub async fn filter(&self, group: DataGroup, override_id: Option<Uuid>) -> Result<CycleFilter> {
        self.active_cycle_id(group, override_id)
            .await
            .map(CycleFilter::from_id)
    }

    /// Drop the cached answer for `group`, or for every group when `None`.
    pub fn invalidate(&self, group: Option<DataGroup>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        match group {
            Some(group) => {
                self.cache.remove(&group);
            }
            None => self.cache.clear(),
        }
        debug!(group = ?group, "Cycle cache invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::cycles::Promotion;
    use crate::data::memory::MemoryCycleStore;
    use crate::data::models::{CycleStatus, DataCycle, NewDataCycle};
    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, Utc};
    use std::collections::BTreeMap;
    use tokio::sync::Notify;

    fn new_cycle(code: &str) -> NewDataCycle {
        NewDataCycle {
            data_group: DataGroup::Nasr,
            cycle_code: code.to_owned(),
            effective_date: NaiveDate::from_ymd_opt(2026, 1, 22).unwrap(),
            expiration_date: NaiveDate::from_ymd_opt(2026, 2, 19).unwrap(),
            source_url: None,
        }
    }

    #[test]
    fn legacy_filter_matches_everything() {
        let id = Uuid::new_v4();
        assert!(CycleFilter::Legacy.matches(None));
        assert!(CycleFilter::Legacy.matches(Some(id)));
        assert!(CycleFilter::Cycle(id).matches(Some(id)));
        assert!(!CycleFilter::Cycle(id).matches(Some(Uuid::new_v4())));
        assert!(!CycleFilter::Cycle(id).matches(None));
    }

    #[test]
    fn predicate_is_only_pushed_for_a_cycle() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM a_airports WHERE TRUE");
        CycleFilter::Legacy.push_predicate(&mut qb, "cycle_id");
        assert_eq!(qb.sql(), "SELECT * FROM a_airports WHERE TRUE");

        CycleFilter::Cycle(Uuid::new_v4()).push_predicate(&mut qb, "cycle_id");
        assert_eq!(qb.sql(), "SELECT * FROM a_airports WHERE TRUE AND cycle_id = $1");
    }

    #[tokio::test]
    async fn cache_serves_stale_value_until_invalidated() {
        let store = Arc::new(MemoryCycleStore::new());
        let manager = CycleManager::new(store.clone());

        assert_eq!(manager.active_cycle_id(DataGroup::Nasr, None).await.unwrap(), None);

        let cycle = store.insert(new_cycle("2601")).await.unwrap();
        store
            .transition(cycle.id, CycleStatus::Seeding, CycleStatus::Staged)
            .await
            .unwrap();
        store
            .promote(cycle.id, CycleStatus::Staged, Utc::now())
            .await
            .unwrap();

        // Still the cached "none".
        assert_eq!(manager.active_cycle_id(DataGroup::Nasr, None).await.unwrap(), None);

        manager.invalidate(Some(DataGroup::Nasr));
        assert_eq!(
            manager.active_cycle_id(DataGroup::Nasr, None).await.unwrap(),
            Some(cycle.id)
        );
    }

    /// Pauses `active_id` after reading until released.
    struct PausedReads {
        inner: Arc<MemoryCycleStore>,
        read: Notify,
        resume: Notify,
    }

    #[async_trait]
    impl CycleStore for PausedReads {
        async fn list(&self, group: Option<DataGroup>) -> Result<Vec<DataCycle>> {
            self.inner.list(group).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<DataCycle>> {
            self.inner.get(id).await
        }

        async fn find_by_code(&self, group: DataGroup, code: &str) -> Result<Option<DataCycle>> {
            self.inner.find_by_code(group, code).await
        }

        async fn insert(&self, cycle: NewDataCycle) -> Result<DataCycle> {
            self.inner.insert(cycle).await
        }

        async fn active_id(&self, group: DataGroup) -> Result<Option<Uuid>> {
            let active = self.inner.active_id(group).await?;
            self.read.notify_one();
            self.resume.notified().await;
            Ok(active)
        }

        async fn transition(
            &self,
            id: Uuid,
            from: CycleStatus,
            to: CycleStatus,
        ) -> Result<Option<DataCycle>> {
            self.inner.transition(id, from, to).await
        }

        async fn promote(
            &self,
            id: Uuid,
            expected: CycleStatus,
            now: DateTime<Utc>,
        ) -> Result<Option<Promotion>> {
            self.inner.promote(id, expected, now).await
        }

        async fn delete(&self, id: Uuid) -> Result<Vec<(String, u64)>> {
            self.inner.delete(id).await
        }

        async fn merge_record_counts(
            &self,
            id: Uuid,
            counts: &BTreeMap<String, i64>,
        ) -> Result<Option<DataCycle>> {
            self.inner.merge_record_counts(id, counts).await
        }

        async fn pending(&self, today: NaiveDate) -> Result<Vec<DataCycle>> {
            self.inner.pending(today).await
        }

        async fn rolled_back(&self, group: DataGroup) -> Result<Vec<DataCycle>> {
            self.inner.rolled_back(group).await
        }
    }

    #[tokio::test]
    async fn invalidation_during_lookup_is_not_lost() {
        let inner = Arc::new(MemoryCycleStore::new());
        let store = Arc::new(PausedReads {
            inner: inner.clone(),
            read: Notify::new(),
            resume: Notify::new(),
        });
        let manager = Arc::new(CycleManager::new(store.clone()));

        let lookup = tokio::spawn({
            let manager = manager.clone();
            async move { manager.active_cycle_id(DataGroup::Nasr, None).await }
        });
        store.read.notified().await;

        // Activate while the lookup holds its "none" answer.
        let cycle = inner.insert(new_cycle("2601")).await.unwrap();
        inner
            .transition(cycle.id, CycleStatus::Seeding, CycleStatus::Staged)
            .await
            .unwrap();
        inner
            .promote(cycle.id, CycleStatus::Staged, Utc::now())
            .await
            .unwrap();
        manager.invalidate(Some(DataGroup::Nasr));

        store.resume.notify_one();
        assert_eq!(lookup.await.unwrap().unwrap(), None);

        let next = tokio::spawn({
            let manager = manager.clone();
            async move { manager.active_cycle_id(DataGroup::Nasr, None).await }
        });
        store.read.notified().await;
        store.resume.notify_one();
        assert_eq!(next.await.unwrap().unwrap(), Some(cycle.id));
    }

    #[tokio::test]
    async fn override_wins_over_cache() {
        let manager = CycleManager::new(Arc::new(MemoryCycleStore::new()));
        let preview = Uuid::new_v4();
        assert_eq!(
            manager.filter(DataGroup::Cifp, Some(preview)).await.unwrap(),
            CycleFilter::Cycle(preview)
        );
        assert_eq!(
            manager.filter(DataGroup::Cifp, None).await.unwrap(),
            CycleFilter::Legacy
        );
    }
}
