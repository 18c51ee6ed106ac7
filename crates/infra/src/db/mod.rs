//! Postgres adapters.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to the error type of the seam each adapter implements:
//!
//! | SQLx Error | PostgreSQL Error Code | Lease store | Evidence | Results |
//! |------------|----------------------|-------------|----------|---------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert) | `Unavailable` | `Storage` |
//! | Database (check violation) | `23514` | `Corrupt` | `Unavailable` | `Storage` |
//! | Database (other) | Any other | `Storage` | `Unavailable` | `Storage` |
//! | Database (insufficient privilege) | `42501` | `Storage` | `Unauthorized` | `Storage` |
//! | Decode / ColumnDecode | N/A | `Corrupt` | `Malformed` | `Storage` |
//! | PoolClosed, Io, Tls, other | N/A | `Storage` | `Unavailable` | `Storage` |
//!
//! Each adapter owns its table and creates it with `ensure_schema()`. Statements
//! run one at a time; the extended query protocol rejects multi-statement strings.

pub mod evidence;
pub mod jobs;
pub mod results;

pub use evidence::PgEvidenceAdapter;
pub use jobs::PgLeaseStore;
pub use results::PgResultSink;

/// Human-readable description of a SQLx error in `operation`.
pub(crate) fn describe_sqlx_error(operation: &str, err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => format!("database error in {} ({}): {}", operation, code, db_err.message()),
            None => format!("database error in {}: {}", operation, db_err.message()),
        },
        sqlx::Error::PoolClosed => format!("connection pool closed in {}", operation),
        sqlx::Error::PoolTimedOut => format!("connection pool timed out in {}", operation),
        _ => format!("sqlx error in {}: {}", operation, err),
    }
}

/// SQLSTATE of a database error, if any.
pub(crate) fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some("23505")
}

/// Check if an error is a row decoding failure rather than a storage failure.
pub(crate) fn is_decode_error(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. })
}

/// Run each DDL statement in order.
pub(crate) async fn execute_all(
    pool: &sqlx::PgPool,
    statements: &[&str],
) -> Result<(), sqlx::Error> {
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
