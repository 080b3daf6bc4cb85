//! Shared typed queries. Handler- or janitor-specific statements stay next
//! to their call sites; what lives here is needed from several subsystems.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use crate::models::{Account, Blob, Manifest, Repository, Upload};

pub async fn get_account(
    conn: &mut PgConnection,
    name: &str,
) -> Result<Option<Account>, sqlx::Error> {
    sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE name = $1")
        .bind(name)
        .fetch_optional(conn)
        .await
}

pub async fn get_repo(
    conn: &mut PgConnection,
    account_name: &str,
    repo_name: &str,
) -> Result<Option<Repository>, sqlx::Error> {
    sqlx::query_as::<_, Repository>(
        "SELECT * FROM repos WHERE account_name = $1 AND name = $2",
    )
    .bind(account_name)
    .bind(repo_name)
    .fetch_optional(conn)
    .await
}

/// Repositories spring into existence on first push or first replica pull.
pub async fn get_or_create_repo(
    conn: &mut PgConnection,
    account_name: &str,
    repo_name: &str,
) -> Result<Repository, sqlx::Error> {
    sqlx::query_as::<_, Repository>(
        "INSERT INTO repos (account_name, name) VALUES ($1, $2)
         ON CONFLICT (account_name, name) DO UPDATE SET name = repos.name
         RETURNING *",
    )
    .bind(account_name)
    .bind(repo_name)
    .fetch_one(conn)
    .await
}

pub async fn get_blob(
    conn: &mut PgConnection,
    account_name: &str,
    digest: &str,
) -> Result<Option<Blob>, sqlx::Error> {
    sqlx::query_as::<_, Blob>("SELECT * FROM blobs WHERE account_name = $1 AND digest = $2")
        .bind(account_name)
        .bind(digest)
        .fetch_optional(conn)
        .await
}

/// The blob, but only if it is mounted in the given repo. Pull paths must
/// use this; a blob of the same account is not pullable through repos it is
/// not mounted in.
pub async fn get_mounted_blob(
    conn: &mut PgConnection,
    repo_id: i64,
    account_name: &str,
    digest: &str,
) -> Result<Option<Blob>, sqlx::Error> {
    sqlx::query_as::<_, Blob>(
        "SELECT b.* FROM blobs b
         JOIN blob_mounts bm ON bm.blob_id = b.id
         WHERE bm.repo_id = $1 AND b.account_name = $2 AND b.digest = $3",
    )
    .bind(repo_id)
    .bind(account_name)
    .bind(digest)
    .fetch_optional(conn)
    .await
}

/// Inserts the blob if missing and reports whether this call created it.
/// The losing side of a concurrent push of the same digest must discard its
/// own storage copy.
pub async fn insert_blob_if_missing(
    conn: &mut PgConnection,
    account_name: &str,
    digest: &str,
    size_bytes: i64,
    storage_id: &str,
    media_type: &str,
    now: DateTime<Utc>,
    next_validation_at: DateTime<Utc>,
) -> Result<(Blob, bool), sqlx::Error> {
    let inserted = sqlx::query_as::<_, Blob>(
        "INSERT INTO blobs (account_name, digest, size_bytes, storage_id, media_type,
                            pushed_at, validated_at, next_validation_at)
         VALUES ($1, $2, $3, $4, $5, $6, $6, $7)
         ON CONFLICT (account_name, digest) DO NOTHING
         RETURNING *",
    )
    .bind(account_name)
    .bind(digest)
    .bind(size_bytes)
    .bind(storage_id)
    .bind(media_type)
    .bind(now)
    .bind(next_validation_at)
    .fetch_optional(&mut *conn)
    .await?;
    match inserted {
        Some(blob) => Ok((blob, true)),
        None => {
            let existing = get_blob(conn, account_name, digest)
                .await?
                .expect("blob row cannot vanish inside the transaction");
            Ok((existing, false))
        }
    }
}

/// Mounting is idempotent; re-mounting also clears a pending sweep mark.
pub async fn mount_blob(
    conn: &mut PgConnection,
    blob_id: i64,
    repo_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO blob_mounts (blob_id, repo_id) VALUES ($1, $2)
         ON CONFLICT (blob_id, repo_id) DO UPDATE SET can_be_deleted_at = NULL",
    )
    .bind(blob_id)
    .bind(repo_id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_manifest(
    conn: &mut PgConnection,
    repo_id: i64,
    digest: &str,
) -> Result<Option<Manifest>, sqlx::Error> {
    sqlx::query_as::<_, Manifest>("SELECT * FROM manifests WHERE repo_id = $1 AND digest = $2")
        .bind(repo_id)
        .bind(digest)
        .fetch_optional(conn)
        .await
}

pub async fn resolve_tag(
    conn: &mut PgConnection,
    repo_id: i64,
    tag_name: &str,
) -> Result<Option<String>, sqlx::Error> {
    let digest: Option<(String,)> =
        sqlx::query_as("SELECT digest FROM tags WHERE repo_id = $1 AND name = $2")
            .bind(repo_id)
            .bind(tag_name)
            .fetch_optional(conn)
            .await?;
    Ok(digest.map(|row| row.0))
}

pub async fn get_upload(
    conn: &mut PgConnection,
    repo_id: i64,
    upload_uuid: uuid::Uuid,
) -> Result<Option<Upload>, sqlx::Error> {
    sqlx::query_as::<_, Upload>("SELECT * FROM uploads WHERE repo_id = $1 AND uuid = $2")
        .bind(repo_id)
        .bind(upload_uuid)
        .fetch_optional(conn)
        .await
}

/// Sum of manifests across all of the tenant's accounts, for quota checks.
pub async fn count_tenant_manifests(
    conn: &mut PgConnection,
    auth_tenant_id: &str,
) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM manifests m
         JOIN repos r ON m.repo_id = r.id
         JOIN accounts a ON r.account_name = a.name
         WHERE a.auth_tenant_id = $1",
    )
    .bind(auth_tenant_id)
    .fetch_one(conn)
    .await?;
    Ok(count)
}

pub async fn get_quota(
    conn: &mut PgConnection,
    auth_tenant_id: &str,
) -> Result<Option<crate::models::Quota>, sqlx::Error> {
    sqlx::query_as::<_, crate::models::Quota>(
        "SELECT * FROM quotas WHERE auth_tenant_id = $1",
    )
    .bind(auth_tenant_id)
    .fetch_optional(conn)
    .await
}

/// Marks every blob mount in this repo that no manifest references anymore,
/// and unmarks the ones that are referenced again. Returns how many mounts
/// are currently marked.
pub async fn mark_unreferenced_blob_mounts(
    conn: &mut PgConnection,
    repo_id: i64,
    can_be_deleted_at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    sqlx::query(
        "UPDATE blob_mounts SET can_be_deleted_at = NULL
         WHERE repo_id = $1 AND can_be_deleted_at IS NOT NULL AND blob_id IN (
             SELECT mbr.blob_id FROM manifest_blob_refs mbr WHERE mbr.repo_id = $1
         )",
    )
    .bind(repo_id)
    .execute(&mut *conn)
    .await?;
    let marked = sqlx::query(
        "UPDATE blob_mounts SET can_be_deleted_at = $2
         WHERE repo_id = $1 AND can_be_deleted_at IS NULL AND blob_id NOT IN (
             SELECT mbr.blob_id FROM manifest_blob_refs mbr WHERE mbr.repo_id = $1
         )",
    )
    .bind(repo_id)
    .bind(can_be_deleted_at)
    .execute(&mut *conn)
    .await?;
    Ok(marked.rows_affected())
}
