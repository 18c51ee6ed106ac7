//! Postgres-backed lease store.
//!
//! Every mutation is a single `UPDATE ... WHERE id = $1 AND <predicate>`; the
//! row lock Postgres takes for the update makes check-and-write atomic, and
//! `rows_affected() == 1` tells the caller whether it won.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use opforge_core::{JobId, ResultRef, WorkerId};

use super::{describe_sqlx_error, execute_all, is_decode_error, is_unique_violation, sqlstate};
use crate::jobs::{
    Job, JobOrder, JobParams, JobPredicate, JobStats, JobStatus, JobUpdate, LeaseStore,
    LeaseStoreError, LockChange,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS synthesis_jobs (
        id               UUID PRIMARY KEY,
        status           TEXT NOT NULL
                         CHECK (status IN ('pending', 'running', 'succeeded', 'failed', 'insufficient_evidence')),
        attempts         INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        max_attempts     INTEGER NOT NULL CHECK (max_attempts > 0),
        locked_at        TIMESTAMPTZ,
        locked_by        TEXT,
        available_at     TIMESTAMPTZ NOT NULL,
        params           JSONB NOT NULL DEFAULT '{}'::jsonb,
        last_error       TEXT,
        outcome          JSONB,
        result_ref       UUID,
        progress_stage   TEXT,
        progress_detail  TEXT,
        created_at       TIMESTAMPTZ NOT NULL,
        updated_at       TIMESTAMPTZ NOT NULL,
        finished_at      TIMESTAMPTZ,
        CONSTRAINT lock_fields_paired CHECK ((locked_at IS NULL) = (locked_by IS NULL))
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS synthesis_jobs_claimable_idx
        ON synthesis_jobs (available_at, created_at)
        WHERE status = 'pending'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS synthesis_jobs_stale_idx
        ON synthesis_jobs (locked_at)
        WHERE status = 'running'
    "#,
];

const COLUMNS: &str = "id, status, attempts, max_attempts, locked_at, locked_by, available_at, \
    params, last_error, outcome, result_ref, progress_stage, progress_detail, \
    created_at, updated_at, finished_at";

/// Lease store on the `synthesis_jobs` table.
#[derive(Debug, Clone)]
pub struct PgLeaseStore {
    pool: Arc<PgPool>,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn from_arc(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Create the jobs table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), LeaseStoreError> {
        execute_all(&self.pool, SCHEMA)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LeaseStoreError {
    let msg = describe_sqlx_error(operation, &err);
    if is_decode_error(&err) {
        return LeaseStoreError::Corrupt(msg);
    }
    match sqlstate(&err).as_deref() {
        // Check constraint violation: a write would break a row invariant.
        Some("23514") => LeaseStoreError::Corrupt(msg),
        _ => LeaseStoreError::Storage(msg),
    }
}

/// Bind values for a [`LockChange`]: `(kind, worker, at)`.
fn lock_binds(change: Option<&LockChange>) -> (Option<&'static str>, Option<String>, Option<DateTime<Utc>>) {
    match change {
        Some(LockChange::Acquire { worker_id, at }) => {
            (Some("acquire"), Some(worker_id.as_str().to_string()), Some(*at))
        }
        Some(LockChange::Refresh { at }) => (Some("refresh"), None, Some(*at)),
        Some(LockChange::Release) => (Some("release"), None, None),
        None => (None, None, None),
    }
}

fn row_to_job(row: &PgRow) -> Result<Job, LeaseStoreError> {
    let corrupt = |e: sqlx::Error| LeaseStoreError::Corrupt(e.to_string());

    let id: Uuid = row.try_get("id").map_err(corrupt)?;
    let status: String = row.try_get("status").map_err(corrupt)?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| LeaseStoreError::Corrupt(format!("job {}: {}", id, e)))?;
    let attempts: i32 = row.try_get("attempts").map_err(corrupt)?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(corrupt)?;
    let locked_by: Option<String> = row.try_get("locked_by").map_err(corrupt)?;
    let locked_by = locked_by
        .map(WorkerId::new)
        .transpose()
        .map_err(|e| LeaseStoreError::Corrupt(format!("job {}: {}", id, e)))?;
    let params: Value = row.try_get("params").map_err(corrupt)?;
    let params = JobParams::from_value(params)
        .map_err(|e| LeaseStoreError::Corrupt(format!("job {}: {}", id, e)))?;
    let result_ref: Option<Uuid> = row.try_get("result_ref").map_err(corrupt)?;

    let non_negative = |field: &str, value: i32| {
        u32::try_from(value)
            .map_err(|_| LeaseStoreError::Corrupt(format!("job {}: negative {}", id, field)))
    };

    Ok(Job {
        id: JobId::from_uuid(id),
        status,
        attempts: non_negative("attempts", attempts)?,
        max_attempts: non_negative("max_attempts", max_attempts)?,
        locked_at: row.try_get("locked_at").map_err(corrupt)?,
        locked_by,
        available_at: row.try_get("available_at").map_err(corrupt)?,
        params,
        last_error: row.try_get("last_error").map_err(corrupt)?,
        outcome: row.try_get("outcome").map_err(corrupt)?,
        result_ref: result_ref.map(ResultRef::from_uuid),
        progress_stage: row.try_get("progress_stage").map_err(corrupt)?,
        progress_detail: row.try_get("progress_detail").map_err(corrupt)?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        updated_at: row.try_get("updated_at").map_err(corrupt)?,
        finished_at: row.try_get("finished_at").map_err(corrupt)?,
    })
}

fn to_i32(field: &str, value: u32) -> Result<i32, LeaseStoreError> {
    i32::try_from(value).map_err(|_| LeaseStoreError::Storage(format!("{} out of range: {}", field, value)))
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: Job) -> Result<(), LeaseStoreError> {
        sqlx::query(
            r#"
            INSERT INTO synthesis_jobs (
                id, status, attempts, max_attempts, locked_at, locked_by, available_at,
                params, last_error, outcome, result_ref, progress_stage, progress_detail,
                created_at, updated_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(to_i32("attempts", job.attempts)?)
        .bind(to_i32("max_attempts", job.max_attempts)?)
        .bind(job.locked_at)
        .bind(job.locked_by.as_ref().map(|w| w.as_str().to_string()))
        .bind(job.available_at)
        .bind(job.params.clone().into_value())
        .bind(job.last_error.as_deref())
        .bind(job.outcome.as_ref())
        .bind(job.result_ref.map(Uuid::from))
        .bind(job.progress_stage.as_deref())
        .bind(job.progress_detail.as_deref())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.finished_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                LeaseStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, LeaseStoreError> {
        let sql = format!("SELECT {} FROM synthesis_jobs WHERE id = $1", COLUMNS);
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(row_to_job).transpose()
    }

    #[instrument(skip(self, expected, update), fields(job_id = %job_id), err)]
    async fn conditional_update(
        &self,
        job_id: JobId,
        expected: &JobPredicate,
        update: &JobUpdate,
    ) -> Result<bool, LeaseStoreError> {
        let (lock_kind, lock_worker, lock_at) = lock_binds(update.lock.as_ref());
        let (progress_set, progress_stage, progress_detail) = match &update.progress {
            Some((stage, detail)) => (true, Some(stage.as_str()), detail.as_deref()),
            None => (false, None, None),
        };

        // Right-hand sides see the pre-update row, so `refresh` only touches a held lock.
        let result = sqlx::query(
            r#"
            UPDATE synthesis_jobs SET
                status = COALESCE($2::text, status),
                locked_by = CASE $3::text
                    WHEN 'acquire' THEN $4::text
                    WHEN 'release' THEN NULL
                    ELSE locked_by
                END,
                locked_at = CASE $3::text
                    WHEN 'acquire' THEN $5::timestamptz
                    WHEN 'refresh' THEN CASE WHEN locked_by IS NULL THEN NULL ELSE $5::timestamptz END
                    WHEN 'release' THEN NULL
                    ELSE locked_at
                END,
                attempts = attempts + $6::integer,
                available_at = COALESCE($7::timestamptz, available_at),
                last_error = COALESCE($8::text, last_error),
                outcome = COALESCE($9::jsonb, outcome),
                result_ref = COALESCE($10::uuid, result_ref),
                progress_stage = CASE WHEN $11::boolean THEN $12::text ELSE progress_stage END,
                progress_detail = CASE WHEN $11::boolean THEN $13::text ELSE progress_detail END,
                finished_at = COALESCE($14::timestamptz, finished_at),
                updated_at = $15::timestamptz
            WHERE id = $1
              AND ($16::text IS NULL OR status = $16::text)
              AND ($17::timestamptz IS NULL OR available_at <= $17::timestamptz)
              AND ($18::text IS NULL OR locked_by = $18::text)
              AND ($19::timestamptz IS NULL OR locked_at < $19::timestamptz)
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(update.status.map(|s| s.as_str()))
        .bind(lock_kind)
        .bind(lock_worker)
        .bind(lock_at)
        .bind(if update.increment_attempts { 1i32 } else { 0i32 })
        .bind(update.available_at)
        .bind(update.last_error.as_deref())
        .bind(update.outcome.as_ref())
        .bind(update.result_ref.map(Uuid::from))
        .bind(progress_set)
        .bind(progress_stage)
        .bind(progress_detail)
        .bind(update.finished_at)
        .bind(update.updated_at)
        .bind(expected.status.map(|s| s.as_str()))
        .bind(expected.available_by)
        .bind(expected.locked_by.as_ref().map(|w| w.as_str().to_string()))
        .bind(expected.locked_before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("conditional_update", e))?;

        let applied = result.rows_affected() == 1;
        debug!(job_id = %job_id, applied, "conditional update");
        Ok(applied)
    }

    #[instrument(skip(self, filter), err)]
    async fn query(
        &self,
        filter: &JobPredicate,
        order: JobOrder,
        limit: usize,
    ) -> Result<Vec<Job>, LeaseStoreError> {
        let order_by = match order {
            JobOrder::OldestAvailable => "available_at ASC, created_at ASC, id ASC",
            JobOrder::OldestLock => "locked_at ASC NULLS FIRST, id ASC",
        };
        let sql = format!(
            r#"
            SELECT {}
            FROM synthesis_jobs
            WHERE ($1::text IS NULL OR status = $1::text)
              AND ($2::timestamptz IS NULL OR available_at <= $2::timestamptz)
              AND ($3::text IS NULL OR locked_by = $3::text)
              AND ($4::timestamptz IS NULL OR locked_at < $4::timestamptz)
            ORDER BY {}
            LIMIT $5
            "#,
            COLUMNS, order_by
        );

        let rows = sqlx::query(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.available_by)
            .bind(filter.locked_by.as_ref().map(|w| w.as_str().to_string()))
            .bind(filter.locked_before)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("query", e))?;

        rows.iter().map(row_to_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, LeaseStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n
            FROM synthesis_jobs
            GROUP BY status
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| LeaseStoreError::Corrupt(e.to_string()))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| LeaseStoreError::Corrupt(e.to_string()))?;
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| LeaseStoreError::Corrupt(e.to_string()))?;
            stats.add(status, usize::try_from(n).unwrap_or(0));
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_binds_cover_every_change() {
        let now = Utc::now();
        let worker = WorkerId::new("host-1").unwrap();

        assert_eq!(
            lock_binds(Some(&LockChange::Acquire {
                worker_id: worker,
                at: now
            })),
            (Some("acquire"), Some("host-1".to_string()), Some(now))
        );
        assert_eq!(
            lock_binds(Some(&LockChange::Refresh { at: now })),
            (Some("refresh"), None, Some(now))
        );
        assert_eq!(lock_binds(Some(&LockChange::Release)), (Some("release"), None, None));
        assert_eq!(lock_binds(None), (None, None, None));
    }

    #[test]
    fn constraint_violations_are_corruption() {
        assert!(matches!(
            map_sqlx_error("insert", sqlx::Error::PoolClosed),
            LeaseStoreError::Storage(_)
        ));
        assert!(matches!(
            map_sqlx_error(
                "get",
                sqlx::Error::ColumnDecode {
                    index: "params".into(),
                    source: "not an object".into(),
                }
            ),
            LeaseStoreError::Corrupt(_)
        ));
    }

    #[test]
    fn schema_keeps_lock_fields_paired() {
        assert!(SCHEMA[0].contains("lock_fields_paired"));
        assert!(SCHEMA.iter().all(|s| !s.trim().is_empty()));
    }
}
