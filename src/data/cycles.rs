//! Database operations for the `data_cycles` table.

use crate::data::models::{CycleStatus, DataCycle, DataGroup, NewDataCycle};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Result of atomically making a cycle the active one for its group.
#[derive(Debug, Clone, PartialEq)]
pub struct Promotion {
    pub activated: DataCycle,
    /// The cycle that was active before, now `rolled_back`.
    pub demoted: Option<Uuid>,
}

#[async_trait]
pub trait CycleStore: Send + Sync {
    async fn list(&self, group: Option<DataGroup>) -> Result<Vec<DataCycle>>;

    async fn get(&self, id: Uuid) -> Result<Option<DataCycle>>;

    async fn find_by_code(&self, group: DataGroup, code: &str) -> Result<Option<DataCycle>>;

    /// Insert a new cycle in `seeding` status.
    async fn insert(&self, cycle: NewDataCycle) -> Result<DataCycle>;

    async fn active_id(&self, group: DataGroup) -> Result<Option<Uuid>>;

    /// Conditional status change; `None` if the cycle is missing or not in `from`.
    async fn transition(
        &self,
        id: Uuid,
        from: CycleStatus,
        to: CycleStatus,
    ) -> Result<Option<DataCycle>>;

    /// In one transaction: demote the group's active cycle to `rolled_back` and
    /// activate `id`, provided `id` is currently in `expected` status.
    async fn promote(
        &self,
        id: Uuid,
        expected: CycleStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Promotion>>;

    /// Delete a cycle and every data row that references it.
    /// Returns `(table, rows_deleted)` for tables that had rows.
    async fn delete(&self, id: Uuid) -> Result<Vec<(String, u64)>>;

    /// Merge counts into the cycle's `record_counts`.
    async fn merge_record_counts(
        &self,
        id: Uuid,
        counts: &BTreeMap<String, i64>,
    ) -> Result<Option<DataCycle>>;

    /// Staged cycles whose effective date has arrived.
    async fn pending(&self, today: NaiveDate) -> Result<Vec<DataCycle>>;

    /// Rolled-back cycles for a group, most recently activated first.
    async fn rolled_back(&self, group: DataGroup) -> Result<Vec<DataCycle>>;
}

const CYCLE_COLUMNS: &str = "id, data_group, cycle_code, effective_date, expiration_date, status, \
     source_url, record_counts, seeded_at, activated_at";

#[derive(Debug, Clone)]
pub struct PgCycleStore {
    pool: PgPool,
}

impl PgCycleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CycleStore for PgCycleStore {
    async fn list(&self, group: Option<DataGroup>) -> Result<Vec<DataCycle>> {
        let rows = sqlx::query_as::<_, DataCycle>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM data_cycles \
             WHERE ($1::data_group IS NULL OR data_group = $1) \
             ORDER BY data_group, effective_date DESC"
        ))
        .bind(group)
        .fetch_all(&self.pool)
        .await
        .context("failed to list data cycles")?;
        Ok(rows)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DataCycle>> {
        let row = sqlx::query_as::<_, DataCycle>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM data_cycles WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch data cycle")?;
        Ok(row)
    }

    async fn find_by_code(&self, group: DataGroup, code: &str) -> Result<Option<DataCycle>> {
        let row = sqlx::query_as::<_, DataCycle>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM data_cycles WHERE data_group = $1 AND cycle_code = $2"
        ))
        .bind(group)
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch data cycle by code")?;
        Ok(row)
    }

    async fn insert(&self, cycle: NewDataCycle) -> Result<DataCycle> {
        let row = sqlx::query_as::<_, DataCycle>(&format!(
            "INSERT INTO data_cycles \
                (id, data_group, cycle_code, effective_date, expiration_date, status, source_url) \
             VALUES ($1, $2, $3, $4, $5, 'seeding', $6) \
             RETURNING {CYCLE_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(cycle.data_group)
        .bind(&cycle.cycle_code)
        .bind(cycle.effective_date)
        .bind(cycle.expiration_date)
        .bind(&cycle.source_url)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert data cycle")?;
        Ok(row)
    }

    async fn active_id(&self, group: DataGroup) -> Result<Option<Uuid>> {
        let id = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM data_cycles WHERE data_group = $1 AND status = 'active'",
        )
        .bind(group)
        .fetch_optional(&self.pool)
        .await
        .context("failed to resolve active data cycle")?;
        Ok(id)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: CycleStatus,
        to: CycleStatus,
    ) -> Result<Option<DataCycle>> {
        let row = sqlx::query_as::<_, DataCycle>(&format!(
            "UPDATE data_cycles SET status = $3 WHERE id = $1 AND status = $2 \
             RETURNING {CYCLE_COLUMNS}"
        ))
        .bind(id)
        .bind(from)
        .bind(to)
        .fetch_optional(&self.pool)
        .await
        .context("failed to transition data cycle")?;
        Ok(row)
    }

    async fn promote(
        &self,
        id: Uuid,
        expected: CycleStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Promotion>> {
        let mut tx = self.pool.begin().await?;

        let target = sqlx::query_as::<_, (DataGroup, CycleStatus)>(
            "SELECT data_group, status FROM data_cycles WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((group, status)) = target else {
            return Ok(None);
        };
        if status != expected {
            return Ok(None);
        }

        let demoted = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE data_cycles SET status = 'rolled_back'
            WHERE data_group = $1 AND status = 'active'
            RETURNING id
            "#,
        )
        .bind(group)
        .fetch_optional(&mut *tx)
        .await?;

        let activated = sqlx::query_as::<_, DataCycle>(&format!(
            "UPDATE data_cycles SET status = 'active', activated_at = $2 WHERE id = $1 \
             RETURNING {CYCLE_COLUMNS}"
        ))
        .bind(id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await.context("failed to commit cycle promotion")?;
        Ok(Some(Promotion { activated, demoted }))
    }

    async fn delete(&self, id: Uuid) -> Result<Vec<(String, u64)>> {
        let mut tx = self.pool.begin().await?;

        let group = sqlx::query_scalar::<_, DataGroup>(
            "SELECT data_group FROM data_cycles WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(group) = group else {
            return Ok(Vec::new());
        };

        let mut deleted = Vec::new();
        for table in group.tables() {
            let exists = sqlx::query_scalar::<_, bool>("SELECT to_regclass($1) IS NOT NULL")
                .bind(*table)
                .fetch_one(&mut *tx)
                .await?;
            if !exists {
                continue;
            }

            // Table names come from a static list, never from input.
            let result = sqlx::query(&format!("DELETE FROM {table} WHERE cycle_id = $1"))
                .bind(id)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to delete cycle rows from {table}"))?;
            if result.rows_affected() > 0 {
                deleted.push(((*table).to_owned(), result.rows_affected()));
            }
        }

        sqlx::query("DELETE FROM data_cycles WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.context("failed to commit cycle deletion")?;
        Ok(deleted)
    }

    async fn merge_record_counts(
        &self,
        id: Uuid,
        counts: &BTreeMap<String, i64>,
    ) -> Result<Option<DataCycle>> {
        let row = sqlx::query_as::<_, DataCycle>(&format!(
            "UPDATE data_cycles SET record_counts = record_counts || $2 WHERE id = $1 \
             RETURNING {CYCLE_COLUMNS}"
        ))
        .bind(id)
        .bind(sqlx::types::Json(counts))
        .fetch_optional(&self.pool)
        .await
        .context("failed to update cycle record counts")?;
        Ok(row)
    }

    async fn pending(&self, today: NaiveDate) -> Result<Vec<DataCycle>> {
        let rows = sqlx::query_as::<_, DataCycle>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM data_cycles \
             WHERE status = 'staged' AND effective_date <= $1 \
             ORDER BY data_group, effective_date"
        ))
        .bind(today)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch pending data cycles")?;
        Ok(rows)
    }

    async fn rolled_back(&self, group: DataGroup) -> Result<Vec<DataCycle>> {
        let rows = sqlx::query_as::<_, DataCycle>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM data_cycles \
             WHERE data_group = $1 AND status = 'rolled_back' \
             ORDER BY activated_at DESC NULLS LAST"
        ))
        .bind(group)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch rolled back data cycles")?;
        Ok(rows)
    }
}
