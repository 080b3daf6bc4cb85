//! The three sweepers that keep database and storage in agreement: blob
//! mounts, blobs, and the storage backend itself.

use async_trait::async_trait;
use chrono::Duration;

use super::{job_error, Job, JobError, JobOutcome};
use crate::api::AppState;
use crate::db::queries;
use crate::models::{Account, Blob, Repository};

const MOUNT_SWEEP_INTERVAL: Duration = Duration::hours(1);
const BLOB_SWEEP_INTERVAL: Duration = Duration::hours(1);
const STORAGE_SWEEP_INTERVAL: Duration = Duration::hours(6);

/// Removes blob mounts that no manifest in the repo references anymore,
/// after their grace period. Newly unreferenced mounts only get marked; the
/// next pass deletes them.
pub struct BlobMountSweep;

#[async_trait]
impl Job for BlobMountSweep {
    fn name(&self) -> &'static str {
        "blob-mount-sweep"
    }

    async fn execute_one(&self, state: &AppState) -> Result<JobOutcome, JobError> {
        let grace = chrono::Duration::from_std(state.config.blob_sweep_grace)
            .unwrap_or(Duration::hours(6));
        let now = crate::db::now();
        let mut tx = state.db.begin().await?;
        let repo: Option<Repository> = sqlx::query_as(
            "SELECT * FROM repos
             WHERE next_blob_mount_sweep_at IS NOT NULL
               AND next_blob_mount_sweep_at < $1
             ORDER BY next_blob_mount_sweep_at ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(repo) = repo else {
            return Ok(JobOutcome::NothingToDo);
        };

        queries::mark_unreferenced_blob_mounts(&mut *tx, repo.id, now + grace).await?;

        // Mounts whose grace period ended go away; their blobs become sweep
        // candidates on the account level.
        let orphaned: Vec<(i64,)> = sqlx::query_as(
            "DELETE FROM blob_mounts
             WHERE repo_id = $1 AND can_be_deleted_at < $2
             RETURNING blob_id",
        )
        .bind(repo.id)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;
        if !orphaned.is_empty() {
            sqlx::query(
                "UPDATE accounts SET next_blob_sweep_at = COALESCE(next_blob_sweep_at, $2)
                 WHERE name = $1",
            )
            .bind(&repo.account_name)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE repos SET next_blob_mount_sweep_at = $2 WHERE id = $1")
            .bind(repo.id)
            .bind(now + MOUNT_SWEEP_INTERVAL)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(JobOutcome::DidWork)
    }
}

/// Deletes blobs that have no mounts left, once their grace period has
/// passed. Storage deletion happens before the row goes away, so a failed
/// storage call leaves the row for the next pass.
pub struct BlobSweep;

#[async_trait]
impl Job for BlobSweep {
    fn name(&self) -> &'static str {
        "blob-sweep"
    }

    async fn execute_one(&self, state: &AppState) -> Result<JobOutcome, JobError> {
        let grace = chrono::Duration::from_std(state.config.blob_sweep_grace)
            .unwrap_or(Duration::hours(6));
        let now = crate::db::now();
        let mut tx = state.db.begin().await?;
        let account: Option<Account> = sqlx::query_as(
            "SELECT * FROM accounts
             WHERE next_blob_sweep_at IS NOT NULL AND next_blob_sweep_at < $1
             ORDER BY next_blob_sweep_at ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(account) = account else {
            return Ok(JobOutcome::NothingToDo);
        };

        // Mark blobs without mounts, unmark blobs that regained a mount
        // during the grace period.
        sqlx::query(
            "UPDATE blobs SET can_be_deleted_at = NULL
             WHERE account_name = $1 AND can_be_deleted_at IS NOT NULL
               AND id IN (SELECT blob_id FROM blob_mounts)",
        )
        .bind(&account.name)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE blobs SET can_be_deleted_at = $2
             WHERE account_name = $1 AND can_be_deleted_at IS NULL
               AND id NOT IN (SELECT blob_id FROM blob_mounts)",
        )
        .bind(&account.name)
        .bind(now + grace)
        .execute(&mut *tx)
        .await?;

        let doomed: Vec<Blob> = sqlx::query_as(
            "SELECT * FROM blobs
             WHERE account_name = $1 AND can_be_deleted_at < $2
               AND id NOT IN (SELECT blob_id FROM blob_mounts)",
        )
        .bind(&account.name)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;
        for blob in doomed {
            match state.drivers.storage.delete_blob(&account.name, &blob.storage_id).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(job_error(err)),
            }
            sqlx::query("DELETE FROM blobs WHERE id = $1")
                .bind(blob.id)
                .execute(&mut *tx)
                .await?;
            debug!("swept blob {} from account {}", blob.digest, account.name);
        }

        sqlx::query("UPDATE accounts SET next_blob_sweep_at = $2 WHERE name = $1")
            .bind(&account.name)
            .bind(now + BLOB_SWEEP_INTERVAL)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(JobOutcome::DidWork)
    }
}

/// Reconciles the storage backend against the database: objects unknown to
/// the database get recorded, and deleted after a grace period if they are
/// still unknown by then.
pub struct StorageSweep;

#[async_trait]
impl Job for StorageSweep {
    fn name(&self) -> &'static str {
        "storage-sweep"
    }

    async fn execute_one(&self, state: &AppState) -> Result<JobOutcome, JobError> {
        let account = {
            let now = crate::db::now();
            let account: Option<Account> = sqlx::query_as(
                "SELECT * FROM accounts
                 WHERE next_storage_sweep_at IS NULL OR next_storage_sweep_at < $1
                 ORDER BY next_storage_sweep_at ASC NULLS FIRST
                 LIMIT 1",
            )
            .bind(now)
            .fetch_optional(state.db.pool())
            .await?;
            let Some(account) = account else {
                return Ok(JobOutcome::NothingToDo);
            };
            account
        };

        let contents = state
            .drivers
            .storage
            .list_storage_contents(&account.name)
            .await
            .map_err(job_error)?;
        let grace = chrono::Duration::from_std(state.config.blob_sweep_grace)
            .unwrap_or(Duration::hours(6));
        let storage = &state.drivers.storage;

        let mut tx = state.db.begin().await?;
        let now = crate::db::now();

        for storage_id in &contents.blobs {
            let known: Option<(i64,)> = sqlx::query_as(
                "SELECT 1::bigint FROM blobs
                 WHERE account_name = $1 AND storage_id = $2
                 UNION ALL
                 SELECT 1::bigint FROM uploads u JOIN repos r ON u.repo_id = r.id
                 WHERE r.account_name = $1 AND u.storage_id = $2
                 LIMIT 1",
            )
            .bind(&account.name)
            .bind(storage_id)
            .fetch_optional(&mut *tx)
            .await?;
            if known.is_none() {
                sqlx::query(
                    "INSERT INTO unknown_blobs (account_name, storage_id, can_be_deleted_at)
                     VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
                )
                .bind(&account.name)
                .bind(storage_id)
                .bind(now + grace)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(
                    "DELETE FROM unknown_blobs WHERE account_name = $1 AND storage_id = $2",
                )
                .bind(&account.name)
                .bind(storage_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        for (repo_name, digest) in &contents.manifests {
            let known: Option<(i64,)> = sqlx::query_as(
                "SELECT 1::bigint FROM manifests m JOIN repos r ON m.repo_id = r.id
                 WHERE r.account_name = $1 AND r.name = $2 AND m.digest = $3",
            )
            .bind(&account.name)
            .bind(repo_name)
            .bind(digest)
            .fetch_optional(&mut *tx)
            .await?;
            if known.is_none() {
                sqlx::query(
                    "INSERT INTO unknown_manifests
                         (account_name, repo_name, digest, can_be_deleted_at)
                     VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
                )
                .bind(&account.name)
                .bind(repo_name)
                .bind(digest)
                .bind(now + grace)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(
                    "DELETE FROM unknown_manifests
                     WHERE account_name = $1 AND repo_name = $2 AND digest = $3",
                )
                .bind(&account.name)
                .bind(repo_name)
                .bind(digest)
                .execute(&mut *tx)
                .await?;
            }
        }

        // Unknown objects past their grace period are deleted,
        // unless the database learned about them meanwhile.
        let doomed_blobs: Vec<(String,)> = sqlx::query_as(
            "DELETE FROM unknown_blobs
             WHERE account_name = $1 AND can_be_deleted_at < $2
             RETURNING storage_id",
        )
        .bind(&account.name)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;
        for (storage_id,) in doomed_blobs {
            match storage.delete_blob(&account.name, &storage_id).await {
                Ok(()) => info!(
                    "storage sweep removed unknown blob object {storage_id} in {}",
                    account.name
                ),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(job_error(err)),
            }
        }
        let doomed_manifests: Vec<(String, String)> = sqlx::query_as(
            "DELETE FROM unknown_manifests
             WHERE account_name = $1 AND can_be_deleted_at < $2
             RETURNING repo_name, digest",
        )
        .bind(&account.name)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;
        for (repo_name, digest) in doomed_manifests {
            match storage.delete_manifest(&account.name, &repo_name, &digest).await {
                Ok(()) => info!(
                    "storage sweep removed unknown manifest {repo_name}@{digest} in {}",
                    account.name
                ),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(job_error(err)),
            }
        }

        sqlx::query("UPDATE accounts SET next_storage_sweep_at = $2 WHERE name = $1")
            .bind(&account.name)
            .bind(now + STORAGE_SWEEP_INTERVAL)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(JobOutcome::DidWork)
    }
}
