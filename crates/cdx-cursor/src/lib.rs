//! Durable lease/checkpoint record with conditional create/take/advance/evict.
//!
//! A single Postgres row per `lease_key` acts as the mutual-exclusion
//! primitive: every mutating operation is one conditional
//! `UPDATE ... WHERE <precondition> RETURNING *` statement, so the
//! precondition check and the mutation are atomic without any explicit
//! transaction or row lock.

use anyhow::Context;
use cdx_schemas::{Lease, LEASE_OWNER_NOBODY};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::fmt;

pub const ENV_DB_URL: &str = "CDX_DATABASE_URL";

/// Connect to Postgres using `CDX_DATABASE_URL`.
pub async fn connect_from_env() -> anyhow::Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("cursor store migrate failed")?;
    Ok(())
}

/// Connect + migrate, for use by tests and by short-lived CLI invocations.
pub async fn testkit_db_pool() -> anyhow::Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Conditional-write failures and transport failures for lease operations.
#[derive(Debug)]
pub enum LeaseError {
    /// `take` failed: another owner currently holds the lease.
    Busy,
    /// `advance` failed: ownership changed since the caller took the lease.
    Stolen,
    /// The underlying store failed (connectivity, SQL error, etc.).
    Io(anyhow::Error),
}

impl fmt::Display for LeaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseError::Busy => write!(f, "LeaseBusy: lease is currently held by another owner"),
            LeaseError::Stolen => {
                write!(f, "LeaseStolen: lease ownership changed before advance could apply")
            }
            LeaseError::Io(e) => write!(f, "cursor store error: {e}"),
        }
    }
}

impl std::error::Error for LeaseError {}

impl From<sqlx::Error> for LeaseError {
    fn from(e: sqlx::Error) -> Self {
        LeaseError::Io(anyhow::Error::new(e))
    }
}

fn row_to_lease(row: sqlx::postgres::PgRow) -> Result<Lease, LeaseError> {
    Ok(Lease {
        lease_key: row.try_get("lease_key")?,
        lease_owner: row.try_get("lease_owner")?,
        checkpoint: row.try_get("checkpoint")?,
        checkpoint_sub_sequence_number: row.try_get("checkpoint_sub_sequence_number")?,
        last_update_time_millis: row.try_get("last_update_time_millis")?,
    })
}

/// Idempotent put with a "key does not exist" precondition. No-op if the
/// lease already exists.
pub async fn create_if_absent(pool: &PgPool, lease_key: &str) -> Result<(), LeaseError> {
    sqlx::query(
        r#"
        insert into cursor_lease (lease_key, lease_owner, checkpoint, checkpoint_sub_sequence_number, last_update_time_millis)
        values ($1, 'nobody', 0, 0, 0)
        on conflict (lease_key) do nothing
        "#,
    )
    .bind(lease_key)
    .execute(pool)
    .await?;
    Ok(())
}

/// Strongly consistent read.
pub async fn get(pool: &PgPool, lease_key: &str) -> Result<Option<Lease>, LeaseError> {
    let row = sqlx::query(
        r#"
        select lease_key, lease_owner, checkpoint, checkpoint_sub_sequence_number, last_update_time_millis
        from cursor_lease
        where lease_key = $1
        "#,
    )
    .bind(lease_key)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(r) => Ok(Some(row_to_lease(r)?)),
        None => Ok(None),
    }
}

/// Conditional update requiring `owner == "nobody"`. Fails with
/// [`LeaseError::Busy`] when the precondition is not met.
pub async fn take(
    pool: &PgPool,
    lease_key: &str,
    new_owner: &str,
    now_millis: i64,
) -> Result<Lease, LeaseError> {
    let row = sqlx::query(
        r#"
        update cursor_lease
        set lease_owner = $2, last_update_time_millis = $3
        where lease_key = $1 and lease_owner = $4
        returning lease_key, lease_owner, checkpoint, checkpoint_sub_sequence_number, last_update_time_millis
        "#,
    )
    .bind(lease_key)
    .bind(new_owner)
    .bind(now_millis)
    .bind(LEASE_OWNER_NOBODY)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(r) => Ok(row_to_lease(r)?),
        None => Err(LeaseError::Busy),
    }
}

/// Conditional update requiring `owner == expected_owner`. Fails with
/// [`LeaseError::Stolen`] on precondition miss.
pub async fn advance(
    pool: &PgPool,
    lease_key: &str,
    expected_owner: &str,
    commit_num: i64,
    op_num: i64,
    now_millis: i64,
) -> Result<Lease, LeaseError> {
    let row = sqlx::query(
        r#"
        update cursor_lease
        set checkpoint = $3, checkpoint_sub_sequence_number = $4, last_update_time_millis = $5
        where lease_key = $1 and lease_owner = $2
        returning lease_key, lease_owner, checkpoint, checkpoint_sub_sequence_number, last_update_time_millis
        "#,
    )
    .bind(lease_key)
    .bind(expected_owner)
    .bind(commit_num)
    .bind(op_num)
    .bind(now_millis)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(r) => Ok(row_to_lease(r)?),
        None => Err(LeaseError::Stolen),
    }
}

/// Conditional update setting owner back to "nobody" iff currently held by
/// `owner`. Returns `true` if this call performed the eviction, `false` if
/// some other cycle already reclaimed the lease. Callers should swallow a
/// `false` result (or an `Err`) rather than propagate it — see the pipeline
/// controller's unconditional-evict-on-exit contract.
pub async fn evict(pool: &PgPool, lease_key: &str, owner: &str) -> Result<bool, LeaseError> {
    let row = sqlx::query(
        r#"
        update cursor_lease
        set lease_owner = $3
        where lease_key = $1 and lease_owner = $2
        returning lease_key
        "#,
    )
    .bind(lease_key)
    .bind(owner)
    .bind(LEASE_OWNER_NOBODY)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_error_display_names_each_variant() {
        assert!(format!("{}", LeaseError::Busy).contains("LeaseBusy"));
        assert!(format!("{}", LeaseError::Stolen).contains("LeaseStolen"));
    }
}
