//! Admin lifecycle for data cycles: `seeding -> staged -> active -> rolled_back`.

use super::CycleManager;
use crate::data::cycles::CycleStore;
use crate::data::models::{CycleStatus, DataCycle, DataGroup, NewDataCycle};
use chrono::{NaiveDate, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Rolled-back cycles kept per group after an activation; older ones are deleted.
pub const MAX_ROLLED_BACK_CYCLES: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("data cycle {0} not found")]
    NotFound(Uuid),
    #[error("cannot {action} cycle in {actual} status (expected {expected})")]
    InvalidTransition {
        action: &'static str,
        actual: CycleStatus,
        expected: CycleStatus,
    },
    #[error("cycle {code} already exists for {group}")]
    Conflict { group: DataGroup, code: String },
    #[error("cannot delete the active cycle; activate another cycle first")]
    ActiveDeletion,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Rows removed when a cycle is deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionReport {
    pub cycle_id: Uuid,
    pub rows_deleted: BTreeMap<String, u64>,
}

/// Lifecycle operations on data cycles. Every change to which cycle is
/// active invalidates the [`CycleManager`] cache for that group.
#[derive(Clone)]
pub struct CycleService {
    store: Arc<dyn CycleStore>,
    manager: Arc<CycleManager>,
}

impl CycleService {
    pub fn new(store: Arc<dyn CycleStore>, manager: Arc<CycleManager>) -> Self {
        Self { store, manager }
    }

    pub fn manager(&self) -> &Arc<CycleManager> {
        &self.manager
    }

    pub async fn list(&self, group: Option<DataGroup>) -> Result<Vec<DataCycle>, CycleError> {
        Ok(self.store.list(group).await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<DataCycle, CycleError> {
        self.store.get(id).await?.ok_or(CycleError::NotFound(id))
    }

    /// The active cycle of each group that has one.
    pub async fn active(&self) -> Result<Vec<DataCycle>, CycleError> {
        let cycles = self.store.list(None).await?;
        Ok(cycles
            .into_iter()
            .filter(|c| c.status == CycleStatus::Active)
            .collect())
    }

    /// Create a cycle in `seeding` status. Codes are unique per group.
    pub async fn create(&self, cycle: NewDataCycle) -> Result<DataCycle, CycleError> {
        if self
            .store
            .find_by_code(cycle.data_group, &cycle.cycle_code)
            .await?
            .is_some()
        {
            return Err(CycleError::Conflict {
                group: cycle.data_group,
                code: cycle.cycle_code,
            });
        }

        let created = self.store.insert(cycle).await?;
        info!(cycle_id = %created.id, group = %created.data_group, code = %created.cycle_code, "Data cycle created");
        Ok(created)
    }

    /// `seeding -> staged`, once the import has finished.
    pub async fn stage(&self, id: Uuid) -> Result<DataCycle, CycleError> {
        let cycle = self.get(id).await?;
        self.expect_status(&cycle, "stage", CycleStatus::Seeding)?;

        let staged = self
            .store
            .transition(id, CycleStatus::Seeding, CycleStatus::Staged)
            .await?;
        match staged {
            Some(cycle) => Ok(cycle),
            None => Err(self.lost_race(id, "stage", CycleStatus::Seeding).await),
        }
    }

    /// `staged -> active`, demoting the group's current active cycle. Old
    /// rolled-back cycles beyond [`MAX_ROLLED_BACK_CYCLES`] are deleted after.
    pub async fn activate(&self, id: Uuid) -> Result<DataCycle, CycleError> {
        let cycle = self.get(id).await?;
        self.expect_status(&cycle, "activate", CycleStatus::Staged)?;

        let Some(promotion) = self.store.promote(id, CycleStatus::Staged, Utc::now()).await? else {
            return Err(self.lost_race(id, "activate", CycleStatus::Staged).await);
        };
        let group = promotion.activated.data_group;
        self.manager.invalidate(Some(group));

        info!(
            cycle_id = %id,
            %group,
            code = %promotion.activated.cycle_code,
            demoted = ?promotion.demoted,
            "Data cycle activated"
        );

        if let Err(e) = self.cleanup_rolled_back(group).await {
            warn!(%group, error = ?e, "Failed to clean up old rolled-back cycles");
        }
        Ok(promotion.activated)
    }

    /// Re-activate a `rolled_back` cycle, demoting the current active one.
    pub async fn rollback(&self, id: Uuid) -> Result<DataCycle, CycleError> {
        let cycle = self.get(id).await?;
        self.expect_status(&cycle, "roll back to", CycleStatus::RolledBack)?;

        let Some(promotion) = self
            .store
            .promote(id, CycleStatus::RolledBack, Utc::now())
            .await?
        else {
            return Err(self.lost_race(id, "roll back to", CycleStatus::RolledBack).await);
        };
        self.manager.invalidate(Some(promotion.activated.data_group));

        info!(
            cycle_id = %id,
            group = %promotion.activated.data_group,
            code = %promotion.activated.cycle_code,
            demoted = ?promotion.demoted,
            "Rolled back to data cycle"
        );
        Ok(promotion.activated)
    }

    /// Delete a non-active cycle and every data row tagged with it.
    pub async fn remove(&self, id: Uuid) -> Result<DeletionReport, CycleError> {
        let cycle = self.get(id).await?;
        if cycle.status == CycleStatus::Active {
            return Err(CycleError::ActiveDeletion);
        }

        let report = self.delete_cycle(&cycle).await?;
        self.manager.invalidate(Some(cycle.data_group));
        Ok(report)
    }

    /// Merge per-table counts into the cycle's `record_counts`.
    pub async fn update_record_counts(
        &self,
        id: Uuid,
        counts: &BTreeMap<String, i64>,
    ) -> Result<DataCycle, CycleError> {
        self.store
            .merge_record_counts(id, counts)
            .await?
            .ok_or(CycleError::NotFound(id))
    }

    /// Staged cycles whose effective date is on or before `today`.
    pub async fn pending(&self, today: NaiveDate) -> Result<Vec<DataCycle>, CycleError> {
        Ok(self.store.pending(today).await?)
    }

    async fn cleanup_rolled_back(&self, group: DataGroup) -> Result<usize, CycleError> {
        let rolled_back = self.store.rolled_back(group).await?;
        let stale = rolled_back.iter().skip(MAX_ROLLED_BACK_CYCLES);

        let mut removed = 0;
        for cycle in stale {
            info!(cycle_id = %cycle.id, %group, code = %cycle.cycle_code, "Auto-cleaning rolled-back cycle");
            self.delete_cycle(cycle).await?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn delete_cycle(&self, cycle: &DataCycle) -> Result<DeletionReport, CycleError> {
        let deleted = self.store.delete(cycle.id).await?;
        for (table, rows) in &deleted {
            info!(cycle_id = %cycle.id, table = %table, rows, "Deleted cycle rows");
        }
        info!(cycle_id = %cycle.id, group = %cycle.data_group, code = %cycle.cycle_code, "Data cycle deleted");

        Ok(DeletionReport {
            cycle_id: cycle.id,
            rows_deleted: deleted.into_iter().collect(),
        })
    }

    fn expect_status(
        &self,
        cycle: &DataCycle,
        action: &'static str,
        expected: CycleStatus,
    ) -> Result<(), CycleError> {
        if cycle.status == expected {
            Ok(())
        } else {
            Err(CycleError::InvalidTransition {
                action,
                actual: cycle.status,
                expected,
            })
        }
    }

    /// Build the error for a conditional update that matched no row.
    async fn lost_race(&self, id: Uuid, action: &'static str, expected: CycleStatus) -> CycleError {
        match self.store.get(id).await {
            Ok(Some(cycle)) => CycleError::InvalidTransition {
                action,
                actual: cycle.status,
                expected,
            },
            Ok(None) => CycleError::NotFound(id),
            Err(e) => CycleError::Store(e),
        }
    }
}
