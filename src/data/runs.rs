//! Append-only poller run history (`poller_runs` table).

use crate::data::models::{NewRunRecord, RunRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

/// Default number of runs returned by history queries.
pub const DEFAULT_HISTORY_LIMIT: i64 = 20;
/// Upper bound on history queries.
pub const MAX_HISTORY_LIMIT: i64 = 200;

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn append(&self, run: NewRunRecord) -> Result<RunRecord>;

    /// Most recent runs for a source, newest first.
    async fn recent(&self, source_key: &str, limit: i64) -> Result<Vec<RunRecord>>;
}

/// Clamp a caller-supplied history limit into `1..=MAX_HISTORY_LIMIT`.
pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT)
}

#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn append(&self, run: NewRunRecord) -> Result<RunRecord> {
        let row = sqlx::query_as::<_, RunRecord>(
            r#"
            INSERT INTO poller_runs (
                source_key, outcome, started_at, completed_at, duration_ms,
                records_updated, error_count, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, source_key, outcome, started_at, completed_at, duration_ms,
                      records_updated, error_count, error_message
            "#,
        )
        .bind(&run.source_key)
        .bind(run.outcome)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.duration_ms)
        .bind(run.records_updated)
        .bind(run.error_count)
        .bind(&run.error_message)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert poller run")?;
        Ok(row)
    }

    async fn recent(&self, source_key: &str, limit: i64) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT id, source_key, outcome, started_at, completed_at, duration_ms,
                   records_updated, error_count, error_message
            FROM poller_runs
            WHERE source_key = $1
            ORDER BY started_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(source_key)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch poller runs")?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_defaults_and_clamps() {
        assert_eq!(clamp_limit(None), DEFAULT_HISTORY_LIMIT);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(10_000)), MAX_HISTORY_LIMIT);
        assert_eq!(clamp_limit(Some(5)), 5);
    }
}
