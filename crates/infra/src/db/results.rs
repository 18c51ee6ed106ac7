//! Result sink persisting committed pipeline runs.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{info, instrument};
use uuid::Uuid;

use opforge_ai::PipelineResult;
use opforge_core::{JobId, ResultRef};

use super::{describe_sqlx_error, execute_all};
use crate::ai::{ResultSink, SinkError};

const SCHEMA: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS synthesis_results (
        id           UUID PRIMARY KEY,
        job_id       UUID NOT NULL UNIQUE,
        target_id    UUID NOT NULL,
        item_count   INTEGER NOT NULL,
        degraded     BOOLEAN NOT NULL,
        payload      JSONB NOT NULL,
        committed_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#];

/// Writes one row per job to `synthesis_results`.
///
/// A retried job that commits again replaces its previous payload and keeps
/// the original reference.
#[derive(Debug, Clone)]
pub struct PgResultSink {
    pool: Arc<PgPool>,
}

impl PgResultSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn from_arc(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), SinkError> {
        execute_all(&self.pool, SCHEMA)
            .await
            .map_err(|e| SinkError::Storage(describe_sqlx_error("ensure_schema", &e)))
    }
}

#[async_trait]
impl ResultSink for PgResultSink {
    #[instrument(skip(self, result), fields(job_id = %job_id, items = result.items.len()), err)]
    async fn commit(&self, job_id: JobId, result: &PipelineResult) -> Result<ResultRef, SinkError> {
        let payload =
            serde_json::to_value(result).map_err(|e| SinkError::Serialization(e.to_string()))?;
        let item_count = i32::try_from(result.items.len())
            .map_err(|_| SinkError::Serialization(format!("too many items: {}", result.items.len())))?;

        let row = sqlx::query(
            r#"
            INSERT INTO synthesis_results (id, job_id, target_id, item_count, degraded, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (job_id) DO UPDATE SET
                target_id = EXCLUDED.target_id,
                item_count = EXCLUDED.item_count,
                degraded = EXCLUDED.degraded,
                payload = EXCLUDED.payload,
                committed_at = now()
            RETURNING id
            "#,
        )
        .bind(Uuid::from(ResultRef::new()))
        .bind(job_id.as_uuid())
        .bind(result.target_id.as_uuid())
        .bind(item_count)
        .bind(result.quality.is_degraded())
        .bind(&payload)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| SinkError::Storage(describe_sqlx_error("commit_result", &e)))?;

        let id: Uuid = row
            .try_get("id")
            .map_err(|e| SinkError::Storage(e.to_string()))?;
        let result_ref = ResultRef::from_uuid(id);
        info!(job_id = %job_id, result_ref = %result_ref, "result committed");
        Ok(result_ref)
    }
}
