//! Source registry: per-feed state and configuration (`data_sources` table).
//!
//! Every status change is a conditional update that names the statuses it
//! expects to find, so two actors racing on the same row cannot both win.

use crate::data::models::{CompletionStats, Source, SourceDescriptor, SourceStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Message stored on sources reset by startup crash recovery.
pub const RESET_AFTER_RESTART: &str = "Reset after restart";

#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Insert descriptors that have no row yet. Returns how many were inserted.
    async fn seed(&self, descriptors: &[SourceDescriptor]) -> Result<u64>;

    /// All sources, ordered by key.
    async fn list(&self) -> Result<Vec<Source>>;

    async fn get(&self, key: &str) -> Result<Option<Source>>;

    /// Enabled sources whose status is `idle` or `failed`.
    async fn schedulable(&self) -> Result<Vec<Source>>;

    /// CAS `idle|failed -> queued`, stamping `last_requested_at`. True if this caller won.
    async fn try_mark_queued(&self, key: &str, now: DateTime<Utc>) -> Result<bool>;

    /// CAS `queued -> previous`, undoing [`try_mark_queued`] when no job came of it.
    /// `last_requested_at` is put back as well.
    ///
    /// [`try_mark_queued`]: SourceStore::try_mark_queued
    async fn release_queued(
        &self,
        key: &str,
        previous: SourceStatus,
        last_requested_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// CAS anything-but-running `-> running`, clearing `last_error`.
    async fn try_mark_running(&self, key: &str) -> Result<bool>;

    /// `running -> idle` with run stats. `last_error` is always cleared.
    async fn mark_succeeded(&self, key: &str, stats: CompletionStats) -> Result<()>;

    /// `-> failed` with the error text.
    async fn mark_failed(&self, key: &str, error: &str, duration_ms: Option<i32>) -> Result<()>;

    /// Operator reset: `-> idle`, clearing `last_requested_at` and `last_error`,
    /// unless the source is running. True if the row was reset.
    async fn reset_for_restart(&self, key: &str) -> Result<bool>;

    /// Flip the enabled flag, returning the new value.
    async fn toggle_enabled(&self, key: &str) -> Result<Option<bool>>;

    /// Reset sources left `running` by a previous process. Returns how many.
    async fn recover_running(&self) -> Result<u64>;
}

const SOURCE_COLUMNS: &str = "key, name, interval_seconds, enabled, status, last_requested_at, \
     last_completed_at, last_duration_ms, records_updated, last_error_count, last_error";

/// Postgres-backed [`SourceStore`].
#[derive(Debug, Clone)]
pub struct PgSourceStore {
    pool: PgPool,
}

impl PgSourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceStore for PgSourceStore {
    async fn seed(&self, descriptors: &[SourceDescriptor]) -> Result<u64> {
        if descriptors.is_empty() {
            return Ok(0);
        }

        let keys: Vec<&str> = descriptors.iter().map(|d| d.key).collect();
        let names: Vec<&str> = descriptors.iter().map(|d| d.name).collect();
        let intervals: Vec<i32> = descriptors.iter().map(|d| d.interval_seconds).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO data_sources (key, name, interval_seconds)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::int4[])
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(&keys)
        .bind(&names)
        .bind(&intervals)
        .execute(&self.pool)
        .await
        .context("failed to seed data sources")?;

        Ok(result.rows_affected())
    }

    async fn list(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query_as::<_, Source>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM data_sources ORDER BY key"
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to list data sources")?;
        Ok(rows)
    }

    async fn get(&self, key: &str) -> Result<Option<Source>> {
        let row = sqlx::query_as::<_, Source>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM data_sources WHERE key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch data source")?;
        Ok(row)
    }

    async fn schedulable(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query_as::<_, Source>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM data_sources \
             WHERE enabled AND status IN ('idle', 'failed') \
             ORDER BY key"
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch schedulable data sources")?;
        Ok(rows)
    }

    async fn try_mark_queued(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE data_sources
            SET status = 'queued', last_requested_at = $2
            WHERE key = $1 AND status IN ('idle', 'failed')
            "#,
        )
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to mark data source queued")?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_queued(
        &self,
        key: &str,
        previous: SourceStatus,
        last_requested_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE data_sources
            SET status = $2, last_requested_at = $3
            WHERE key = $1 AND status = 'queued'
            "#,
        )
        .bind(key)
        .bind(previous)
        .bind(last_requested_at)
        .execute(&self.pool)
        .await
        .context("failed to release queued data source")?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_mark_running(&self, key: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE data_sources
            SET status = 'running', last_error = NULL
            WHERE key = $1 AND status <> 'running'
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await
        .context("failed to mark data source running")?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_succeeded(&self, key: &str, stats: CompletionStats) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE data_sources
            SET status = 'idle',
                last_completed_at = $2,
                last_duration_ms = $3,
                records_updated = $4,
                last_error_count = $5,
                last_error = NULL
            WHERE key = $1 AND status = 'running'
            "#,
        )
        .bind(key)
        .bind(stats.completed_at)
        .bind(stats.duration_ms)
        .bind(stats.records_updated)
        .bind(stats.error_count)
        .execute(&self.pool)
        .await
        .context("failed to record data source completion")?;
        Ok(())
    }

    async fn mark_failed(&self, key: &str, error: &str, duration_ms: Option<i32>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE data_sources
            SET status = 'failed',
                last_error = $2,
                last_duration_ms = COALESCE($3, last_duration_ms)
            WHERE key = $1
            "#,
        )
        .bind(key)
        .bind(error)
        .bind(duration_ms)
        .execute(&self.pool)
        .await
        .context("failed to record data source failure")?;
        Ok(())
    }

    async fn reset_for_restart(&self, key: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE data_sources
            SET status = 'idle', last_requested_at = NULL, last_error = NULL
            WHERE key = $1 AND status <> 'running'
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await
        .context("failed to reset data source")?;
        Ok(result.rows_affected() == 1)
    }

    async fn toggle_enabled(&self, key: &str) -> Result<Option<bool>> {
        let enabled = sqlx::query_scalar::<_, bool>(
            "UPDATE data_sources SET enabled = NOT enabled WHERE key = $1 RETURNING enabled",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("failed to toggle data source")?;
        Ok(enabled)
    }

    async fn recover_running(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE data_sources SET status = 'idle', last_error = $1 WHERE status = 'running'",
        )
        .bind(RESET_AFTER_RESTART)
        .execute(&self.pool)
        .await
        .context("failed to recover running data sources")?;
        Ok(result.rows_affected())
    }
}
