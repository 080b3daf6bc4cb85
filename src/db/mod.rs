pub mod migrations;
pub mod queries;

use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("cannot connect to database: {raw_error_message}")]
    CannotConnect { raw_error_message: String },
    #[error("migration {version} failed: {raw_error_message}")]
    MigrationFailed { version: i32, raw_error_message: String },
    #[error(transparent)]
    Query(#[from] sqlx::Error),
}

/// Database: shared handle to the metadata store. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connects and applies pending migrations. The pool must be sized for
    /// all HTTP workers plus all janitor loops, otherwise janitors can
    /// starve request handling.
    pub async fn connect(database_url: &str, pool_size: u32) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|err| DatabaseError::CannotConnect {
                raw_error_message: err.to_string(),
            })?;
        let db = Database { pool };
        db.apply_migrations().await?;
        Ok(db)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Database { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Multi-row writes happen between `begin` and an explicit `commit`.
    /// An early return (or a panic, or cancellation) drops the transaction
    /// guard, which rolls back.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        self.pool.begin().await
    }

    async fn apply_migrations(&self) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;
        // One process at a time gets to look at the schema version.
        advisory_lock(&mut tx, "keppel-schema-migrations").await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&mut *tx)
        .await?;

        let applied: Vec<(i32,)> = sqlx::query_as("SELECT version FROM schema_migrations")
            .fetch_all(&mut *tx)
            .await?;
        let applied: Vec<i32> = applied.into_iter().map(|row| row.0).collect();

        for migration in migrations::ALL {
            if applied.contains(&migration.version) {
                continue;
            }
            // Unparameterized SQL goes over the simple protocol, so one
            // migration script may hold many statements.
            sqlx::Executor::execute(&mut *tx, migration.sql)
                .await
                .map_err(|err| DatabaseError::MigrationFailed {
                    version: migration.version,
                    raw_error_message: err.to_string(),
                })?;
            sqlx::query("INSERT INTO schema_migrations (version) VALUES ($1)")
                .bind(migration.version)
                .execute(&mut *tx)
                .await?;
            info!("applied database migration {}", migration.version);
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Takes a transaction-scoped advisory lock on an arbitrary string key. The
/// lock is released with the transaction.
pub async fn advisory_lock(
    tx: &mut Transaction<'static, Postgres>,
    key: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(advisory_lock_key(key))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Postgres advisory locks are keyed by i64; we derive one from the first 8
/// bytes of the key's sha256.
pub fn advisory_lock_key(key: &str) -> i64 {
    let digest = crate::digest::Digest::of_contents(key.as_bytes());
    let hex = digest.hex();
    let mut bytes = [0u8; 8];
    hex::decode_to_slice(&hex[..16], &mut bytes).expect("digest hex is well-formed");
    i64::from_be_bytes(bytes)
}

/// The schema stores whole seconds; anything finer would not survive a
/// round-trip through replica-sync payloads.
pub fn whole_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(0)
}

pub fn now() -> DateTime<Utc> {
    whole_seconds(Utc::now())
}

/// Monotone bump for pull timestamps: out-of-order replica-sync payloads
/// must never move them backwards.
pub async fn bump_last_pulled_at(
    conn: &mut PgConnection,
    repo_id: i64,
    digest: &str,
    tag_name: Option<&str>,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE manifests SET last_pulled_at = GREATEST(coalesce(last_pulled_at, to_timestamp(0)), $3)
         WHERE repo_id = $1 AND digest = $2",
    )
    .bind(repo_id)
    .bind(digest)
    .bind(whole_seconds(at))
    .execute(&mut *conn)
    .await?;
    if let Some(name) = tag_name {
        sqlx::query(
            "UPDATE tags SET last_pulled_at = GREATEST(coalesce(last_pulled_at, to_timestamp(0)), $3)
             WHERE repo_id = $1 AND name = $2",
        )
        .bind(repo_id)
        .bind(name)
        .bind(whole_seconds(at))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_lock_keys_are_stable() {
        let a = advisory_lock_key("replication:acc1:latest");
        let b = advisory_lock_key("replication:acc1:latest");
        let c = advisory_lock_key("replication:acc1:v2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn whole_seconds_drops_nanos() {
        let t = Utc::now();
        let truncated = whole_seconds(t);
        assert_eq!(truncated.timestamp_subsec_nanos(), 0);
        assert_eq!(truncated.timestamp(), t.timestamp());
    }
}
