//! Evidence adapter reading pre-collected items from Postgres.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use opforge_ai::{Engagement, EvidenceRecord, Platform};
use opforge_core::TargetId;

use super::{describe_sqlx_error, execute_all, is_decode_error, sqlstate};
use crate::ai::{Capability, EvidenceAdapter, EvidenceError};

/// Upper bound on rows read per `(target, platform, capability)`.
const MAX_ROWS: i64 = 200;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS evidence_items (
        id                UUID PRIMARY KEY,
        target_id         UUID NOT NULL,
        platform          TEXT NOT NULL,
        capability        TEXT NOT NULL,
        text              TEXT NOT NULL,
        has_rich_content  BOOLEAN NOT NULL DEFAULT FALSE,
        author            TEXT NOT NULL,
        url               TEXT NOT NULL,
        published_at      TIMESTAMPTZ NOT NULL,
        engagement        JSONB
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS evidence_items_lookup_idx
        ON evidence_items (target_id, platform, capability, published_at DESC)
    "#,
];

/// Reads `evidence_items` for one platform/capability pair.
///
/// One instance can be registered for every pair; the pair is part of the query.
#[derive(Debug, Clone)]
pub struct PgEvidenceAdapter {
    pool: Arc<PgPool>,
}

impl PgEvidenceAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn from_arc(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), EvidenceError> {
        execute_all(&self.pool, SCHEMA)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EvidenceError {
    let msg = describe_sqlx_error(operation, &err);
    if is_decode_error(&err) {
        return EvidenceError::Malformed(msg);
    }
    match sqlstate(&err).as_deref() {
        // insufficient_privilege / invalid_authorization_specification
        Some("42501") | Some("28000") | Some("28P01") => EvidenceError::Unauthorized(msg),
        // too_many_connections
        Some("53300") => EvidenceError::RateLimited(msg),
        _ => EvidenceError::Unavailable(msg),
    }
}

fn row_to_record(platform: Platform, row: &PgRow) -> Result<EvidenceRecord, EvidenceError> {
    let malformed = |e: sqlx::Error| EvidenceError::Malformed(e.to_string());

    let engagement: Option<Value> = row.try_get("engagement").map_err(malformed)?;
    let engagement = engagement
        .filter(|v| !v.is_null())
        .map(serde_json::from_value::<Engagement>)
        .transpose()
        .map_err(|e| EvidenceError::Malformed(format!("engagement: {}", e)))?;

    Ok(EvidenceRecord {
        platform,
        text: row.try_get("text").map_err(malformed)?,
        has_rich_content: row.try_get("has_rich_content").map_err(malformed)?,
        author: row.try_get("author").map_err(malformed)?,
        url: row.try_get("url").map_err(malformed)?,
        published_at: row.try_get("published_at").map_err(malformed)?,
        engagement,
    })
}

#[async_trait]
impl EvidenceAdapter for PgEvidenceAdapter {
    #[instrument(
        skip(self),
        fields(target_id = %target_id, platform = %platform, capability = %capability),
        err
    )]
    async fn fetch(
        &self,
        target_id: TargetId,
        platform: Platform,
        capability: Capability,
    ) -> Result<Vec<EvidenceRecord>, EvidenceError> {
        let rows = sqlx::query(
            r#"
            SELECT text, has_rich_content, author, url, published_at, engagement
            FROM evidence_items
            WHERE target_id = $1 AND platform = $2 AND capability = $3
            ORDER BY published_at DESC
            LIMIT $4
            "#,
        )
        .bind(target_id.as_uuid())
        .bind(platform.as_str())
        .bind(capability.as_str())
        .bind(MAX_ROWS)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_evidence", e))?;

        rows.iter().map(|row| row_to_record(platform, row)).collect()
    }
}
