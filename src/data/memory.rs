//! In-memory implementations of the storage traits.
//!
//! Each store mirrors the conditional-update semantics of its Postgres
//! counterpart under a single mutex, which makes them usable for tests and
//! for running the engine without a database.

use crate::data::cycles::{CycleStore, Promotion};
use crate::data::models::{
    CompletionStats, CycleStatus, DataCycle, DataGroup, NewDataCycle, NewRunRecord, RunRecord,
    Source, SourceDescriptor, SourceStatus,
};
use crate::data::runs::RunStore;
use crate::data::sources::{RESET_AFTER_RESTART, SourceStore};
use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct MemorySourceStore {
    rows: Mutex<BTreeMap<String, Source>>,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a row wholesale. Test fixture helper.
    pub fn put(&self, source: Source) {
        self.lock().insert(source.key.clone(), source);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Source>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update<F>(&self, key: &str, f: F) -> bool
    where
        F: FnOnce(&mut Source) -> bool,
    {
        self.lock().get_mut(key).is_some_and(f)
    }
}

impl From<&SourceDescriptor> for Source {
    fn from(d: &SourceDescriptor) -> Self {
        Source {
            key: d.key.to_owned(),
            name: d.name.to_owned(),
            interval_seconds: d.interval_seconds,
            enabled: true,
            status: SourceStatus::Idle,
            last_requested_at: None,
            last_completed_at: None,
            last_duration_ms: None,
            records_updated: None,
            last_error_count: None,
            last_error: None,
        }
    }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    async fn seed(&self, descriptors: &[SourceDescriptor]) -> Result<u64> {
        let mut rows = self.lock();
        let mut inserted = 0;
        for descriptor in descriptors {
            if !rows.contains_key(descriptor.key) {
                rows.insert(descriptor.key.to_owned(), Source::from(descriptor));
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn list(&self) -> Result<Vec<Source>> {
        Ok(self.lock().values().cloned().collect())
    }

    async fn get(&self, key: &str) -> Result<Option<Source>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn schedulable(&self) -> Result<Vec<Source>> {
        Ok(self
            .lock()
            .values()
            .filter(|s| s.enabled && s.status.is_schedulable())
            .cloned()
            .collect())
    }

    async fn try_mark_queued(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.update(key, |s| {
            if !s.status.is_schedulable() {
                return false;
            }
            s.status = SourceStatus::Queued;
            s.last_requested_at = Some(now);
            true
        }))
    }

    async fn release_queued(
        &self,
        key: &str,
        previous: SourceStatus,
        last_requested_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        Ok(self.update(key, |s| {
            if s.status != SourceStatus::Queued {
                return false;
            }
            s.status = previous;
            s.last_requested_at = last_requested_at;
            true
        }))
    }

    async fn try_mark_running(&self, key: &str) -> Result<bool> {
        Ok(self.update(key, |s| {
            if s.status == SourceStatus::Running {
                return false;
            }
            s.status = SourceStatus::Running;
            s.last_error = None;
            true
        }))
    }

    async fn mark_succeeded(&self, key: &str, stats: CompletionStats) -> Result<()> {
        self.update(key, |s| {
            if s.status != SourceStatus::Running {
                return false;
            }
            s.status = SourceStatus::Idle;
            s.last_completed_at = Some(stats.completed_at);
            s.last_duration_ms = Some(stats.duration_ms);
            s.records_updated = Some(stats.records_updated);
            s.last_error_count = Some(stats.error_count);
            s.last_error = None;
            true
        });
        Ok(())
    }

    async fn mark_failed(&self, key: &str, error: &str, duration_ms: Option<i32>) -> Result<()> {
        self.update(key, |s| {
            s.status = SourceStatus::Failed;
            s.last_error = Some(error.to_owned());
            if duration_ms.is_some() {
                s.last_duration_ms = duration_ms;
            }
            true
        });
        Ok(())
    }

    async fn reset_for_restart(&self, key: &str) -> Result<bool> {
        Ok(self.update(key, |s| {
            if s.status == SourceStatus::Running {
                return false;
            }
            s.status = SourceStatus::Idle;
            s.last_requested_at = None;
            s.last_error = None;
            true
        }))
    }

    async fn toggle_enabled(&self, key: &str) -> Result<Option<bool>> {
        let mut rows = self.lock();
        Ok(rows.get_mut(key).map(|s| {
            s.enabled = !s.enabled;
            s.enabled
        }))
    }

    async fn recover_running(&self) -> Result<u64> {
        let mut count = 0;
        for source in self.lock().values_mut() {
            if source.status == SourceStatus::Running {
                source.status = SourceStatus::Idle;
                source.last_error = Some(RESET_AFTER_RESTART.to_owned());
                count += 1;
            }
        }
        Ok(count)
    }
}

#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<Vec<RunRecord>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record in insertion order.
    pub fn all(&self) -> Vec<RunRecord> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn append(&self, run: NewRunRecord) -> Result<RunRecord> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let record = RunRecord {
            id: runs.len() as i64 + 1,
            source_key: run.source_key,
            outcome: run.outcome,
            started_at: run.started_at,
            completed_at: run.completed_at,
            duration_ms: run.duration_ms,
            records_updated: run.records_updated,
            error_count: run.error_count,
            error_message: run.error_message,
        };
        runs.push(record.clone());
        Ok(record)
    }

    async fn recent(&self, source_key: &str, limit: i64) -> Result<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<RunRecord> = runs
            .iter()
            .filter(|r| r.source_key == source_key)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        matching.truncate(usize::try_from(limit.max(0)).unwrap_or(0));
        Ok(matching)
    }
}

#[derive(Debug, Default)]
pub struct MemoryCycleStore {
    cycles: Mutex<HashMap<Uuid, DataCycle>>,
    /// Simulated per-table data rows tagged with a cycle id.
    rows: Mutex<HashMap<&'static str, Vec<Uuid>>>,
}

impl MemoryCycleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `count` data rows in `table` tagged with `cycle_id`.
    pub fn add_rows(&self, table: &'static str, cycle_id: Uuid, count: usize) {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.entry(table)
            .or_default()
            .extend(std::iter::repeat_n(cycle_id, count));
    }

    pub fn row_count(&self, table: &str, cycle_id: Uuid) -> usize {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.get(table)
            .map(|ids| ids.iter().filter(|id| **id == cycle_id).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, DataCycle>> {
        self.cycles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CycleStore for MemoryCycleStore {
    async fn list(&self, group: Option<DataGroup>) -> Result<Vec<DataCycle>> {
        let mut cycles: Vec<DataCycle> = self
            .lock()
            .values()
            .filter(|c| group.is_none_or(|g| c.data_group == g))
            .cloned()
            .collect();
        cycles.sort_by(|a, b| {
            a.data_group
                .cmp(&b.data_group)
                .then(b.effective_date.cmp(&a.effective_date))
        });
        Ok(cycles)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DataCycle>> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn find_by_code(&self, group: DataGroup, code: &str) -> Result<Option<DataCycle>> {
        Ok(self
            .lock()
            .values()
            .find(|c| c.data_group == group && c.cycle_code == code)
            .cloned())
    }

    async fn insert(&self, cycle: NewDataCycle) -> Result<DataCycle> {
        let mut cycles = self.lock();
        if cycles
            .values()
            .any(|c| c.data_group == cycle.data_group && c.cycle_code == cycle.cycle_code)
        {
            bail!(
                "duplicate data cycle {}/{}",
                cycle.data_group,
                cycle.cycle_code
            );
        }
        let row = DataCycle {
            id: Uuid::new_v4(),
            data_group: cycle.data_group,
            cycle_code: cycle.cycle_code,
            effective_date: cycle.effective_date,
            expiration_date: cycle.expiration_date,
            status: CycleStatus::Seeding,
            source_url: cycle.source_url,
            record_counts: sqlx::types::Json(BTreeMap::new()),
            seeded_at: Utc::now(),
            activated_at: None,
        };
        cycles.insert(row.id, row.clone());
        Ok(row)
    }

    async fn active_id(&self, group: DataGroup) -> Result<Option<Uuid>> {
        Ok(self
            .lock()
            .values()
            .find(|c| c.data_group == group && c.status == CycleStatus::Active)
            .map(|c| c.id))
    }

    async fn transition(
        &self,
        id: Uuid,
        from: CycleStatus,
        to: CycleStatus,
    ) -> Result<Option<DataCycle>> {
        let mut cycles = self.lock();
        match cycles.get_mut(&id) {
            Some(cycle) if cycle.status == from => {
                cycle.status = to;
                Ok(Some(cycle.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn promote(
        &self,
        id: Uuid,
        expected: CycleStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Promotion>> {
        let mut cycles = self.lock();
        let group = match cycles.get(&id) {
            Some(cycle) if cycle.status == expected => cycle.data_group,
            _ => return Ok(None),
        };

        let mut demoted = None;
        for cycle in cycles.values_mut() {
            if cycle.data_group == group && cycle.status == CycleStatus::Active {
                cycle.status = CycleStatus::RolledBack;
                demoted = Some(cycle.id);
            }
        }

        let Some(target) = cycles.get_mut(&id) else {
            return Ok(None);
        };
        target.status = CycleStatus::Active;
        target.activated_at = Some(now);
        Ok(Some(Promotion {
            activated: target.clone(),
            demoted,
        }))
    }

    async fn delete(&self, id: Uuid) -> Result<Vec<(String, u64)>> {
        let Some(cycle) = self.lock().remove(&id) else {
            return Ok(Vec::new());
        };

        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let mut deleted = Vec::new();
        for table in cycle.data_group.tables() {
            if let Some(ids) = rows.get_mut(table) {
                let before = ids.len();
                ids.retain(|row| *row != id);
                let removed = (before - ids.len()) as u64;
                if removed > 0 {
                    deleted.push(((*table).to_owned(), removed));
                }
            }
        }
        Ok(deleted)
    }

    async fn merge_record_counts(
        &self,
        id: Uuid,
        counts: &BTreeMap<String, i64>,
    ) -> Result<Option<DataCycle>> {
        let mut cycles = self.lock();
        Ok(cycles.get_mut(&id).map(|cycle| {
            for (table, count) in counts {
                cycle.record_counts.0.insert(table.clone(), *count);
            }
            cycle.clone()
        }))
    }

    async fn pending(&self, today: NaiveDate) -> Result<Vec<DataCycle>> {
        let mut cycles: Vec<DataCycle> = self
            .lock()
            .values()
            .filter(|c| c.status == CycleStatus::Staged && c.effective_date <= today)
            .cloned()
            .collect();
        cycles.sort_by(|a, b| {
            a.data_group
                .cmp(&b.data_group)
                .then(a.effective_date.cmp(&b.effective_date))
        });
        Ok(cycles)
    }

    async fn rolled_back(&self, group: DataGroup) -> Result<Vec<DataCycle>> {
        let mut cycles: Vec<DataCycle> = self
            .lock()
            .values()
            .filter(|c| c.data_group == group && c.status == CycleStatus::RolledBack)
            .cloned()
            .collect();
        // Descending on Option puts never-activated cycles last.
        cycles.sort_by(|a, b| b.activated_at.cmp(&a.activated_at));
        Ok(cycles)
    }
}
