//! Postgres-backed queue over the `poll_jobs` table.

use super::{DurableQueue, FailureDisposition, Job, RetryPolicy, SendOptions};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, topic, payload, singleton_key, state, retry_count, retry_limit, \
     expire_in_seconds, created_at, start_after, started_at, completed_at, last_error";

#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
    policy: RetryPolicy,
}

impl PgQueue {
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }
}

#[async_trait]
impl DurableQueue for PgQueue {
    async fn send(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: SendOptions,
    ) -> Result<Option<Uuid>> {
        // The partial unique index on (topic, singleton_key) over outstanding
        // states turns a duplicate into a conflict, which yields no row.
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO poll_jobs (id, topic, payload, singleton_key, retry_limit, expire_in_seconds)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(topic)
        .bind(sqlx::types::Json(payload))
        .bind(&options.singleton_key)
        .bind(self.policy.limit)
        .bind(i32::try_from(options.expire_in_seconds).unwrap_or(i32::MAX))
        .fetch_optional(&self.pool)
        .await
        .context("failed to enqueue job")?;
        Ok(id)
    }

    async fn fetch(&self, topic: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE poll_jobs
            SET state = 'active', started_at = $2
            WHERE id = (
                SELECT id FROM poll_jobs
                WHERE topic = $1
                  AND state IN ('created', 'retry')
                  AND start_after <= $2
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(topic)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("failed to claim job")?;
        Ok(job)
    }

    async fn complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE poll_jobs SET state = 'completed', completed_at = $2 \
             WHERE id = $1 AND state = 'active'",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to complete job")?;
        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition> {
        let mut tx = self.pool.begin().await?;

        let counts = sqlx::query_as::<_, (i32, i32)>(
            "SELECT retry_count, retry_limit FROM poll_jobs \
             WHERE id = $1 AND state = 'active' FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((retry_count, retry_limit)) = counts else {
            anyhow::bail!("job {id} is not active");
        };

        let disposition = self
            .policy
            .disposition(retry_count, retry_limit, retryable, now);

        match disposition {
            FailureDisposition::Retrying {
                attempt,
                start_after,
            } => {
                sqlx::query(
                    r#"
                    UPDATE poll_jobs
                    SET state = 'retry', retry_count = $2, start_after = $3,
                        started_at = NULL, last_error = $4
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(attempt)
                .bind(start_after)
                .bind(error)
                .execute(&mut *tx)
                .await?;
            }
            FailureDisposition::Exhausted => {
                sqlx::query(
                    "UPDATE poll_jobs SET state = 'failed', completed_at = $2, last_error = $3 \
                     WHERE id = $1",
                )
                .bind(id)
                .bind(now)
                .bind(error)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await.context("failed to record job failure")?;
        Ok(disposition)
    }

    async fn cancel_outstanding(&self, topic: &str, singleton_key: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE poll_jobs SET state = 'cancelled', completed_at = now()
            WHERE topic = $1 AND singleton_key = $2 AND state IN ('created', 'retry')
            "#,
        )
        .bind(topic)
        .bind(singleton_key)
        .execute(&self.pool)
        .await
        .context("failed to cancel outstanding jobs")?;
        Ok(result.rows_affected())
    }

    async fn has_active(&self, topic: &str, singleton_key: &str) -> Result<bool> {
        let active = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM poll_jobs \
             WHERE topic = $1 AND singleton_key = $2 AND state = 'active')",
        )
        .bind(topic)
        .bind(singleton_key)
        .fetch_one(&self.pool)
        .await
        .context("failed to check for active job")?;
        Ok(active)
    }

    async fn stuck(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM poll_jobs
            WHERE state = 'active'
              AND started_at + make_interval(secs => expire_in_seconds) < $1
            ORDER BY started_at
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch stuck jobs")?;
        Ok(jobs)
    }

    async fn recover_active(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE poll_jobs
            SET state = 'retry', start_after = $1, started_at = NULL
            WHERE state = 'active'
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to recover active jobs")?;
        Ok(result.rows_affected())
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM poll_jobs WHERE state IN ('completed', 'failed', 'cancelled') \
             AND completed_at < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await
        .context("failed to purge finished jobs")?;
        Ok(result.rows_affected())
    }
}

