use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::api::registry::{authorize, enforce_rate_limit, require_account, RepoPath};
use crate::api::AppState;
use crate::auth::Scope;
use crate::db::queries;
use crate::digest::Digest;
use crate::drivers::RateLimitAction;
use crate::errors::{RegistryError, RegistryErrorCode, RegistryResult};
use crate::models::Blob;

/// GET/HEAD `/v2/<repo>/blobs/<digest>`.
pub async fn get_blob(
    state: &AppState,
    headers: &HeaderMap,
    repo: &RepoPath,
    raw_digest: &str,
    head_only: bool,
) -> RegistryResult<Response> {
    let authz =
        authorize(state, headers, &[Scope::repository(&repo.full_name(), &["pull"])]).await?;
    let digest: Digest = raw_digest
        .parse()
        .map_err(|_| RegistryError::new(RegistryErrorCode::DigestInvalid))?;
    let account = {
        let mut conn = state.db.pool().acquire().await?;
        queries::get_account(&mut *conn, &repo.account_name).await?
    };
    let Some(account) = account else {
        // Under the anycast FQDN another peer may own this account.
        if crate::api::registry::manifests::is_anycast_request(state, headers) {
            let subpath = format!("blobs/{digest}");
            return crate::peering::proxy_anycast_pull(state, repo, &subpath, head_only).await;
        }
        return Err(RegistryError::new(RegistryErrorCode::NameUnknown));
    };
    enforce_rate_limit(
        state,
        &account.name,
        RateLimitAction::BlobPull,
        &authz.identity.name(),
        1,
    )
    .await?;

    let blob = {
        let mut conn = state.db.pool().acquire().await?;
        match queries::get_repo(&mut *conn, &account.name, &repo.repo_name).await? {
            Some(repo_row) => {
                queries::get_mounted_blob(&mut *conn, repo_row.id, &account.name, &digest.to_string())
                    .await?
            }
            None => None,
        }
    };

    let blob: Blob = match blob {
        Some(blob) => blob,
        None if account.is_replica() => {
            crate::replication::replicate_blob(state, &account, repo, &digest).await?
        }
        None => return Err(RegistryError::new(RegistryErrorCode::BlobUnknown)),
    };

    if head_only {
        return Ok((
            StatusCode::OK,
            [
                ("Content-Length", blob.size_bytes.to_string()),
                ("Content-Type", content_type(&blob)),
                ("Docker-Content-Digest", digest.to_string()),
            ],
        )
            .into_response())
    }

    // Backends that can serve clients directly save us the bandwidth.
    if let Some(url) = state
        .drivers
        .storage
        .url_for_blob(&account.name, &blob.storage_id)
        .await
        .map_err(RegistryError::internal)?
    {
        return Ok((
            StatusCode::TEMPORARY_REDIRECT,
            [
                ("Location", url),
                ("Docker-Content-Digest", digest.to_string()),
            ],
        )
            .into_response());
    }

    let contents = state
        .drivers
        .storage
        .read_blob(&account.name, &blob.storage_id)
        .await
        .map_err(|err| {
            if err.is_not_found() {
                RegistryError::new(RegistryErrorCode::BlobUnknown)
            } else {
                RegistryError::internal(err)
            }
        })?;

    Ok((
        StatusCode::OK,
        [
            ("Content-Length", contents.size_bytes.to_string()),
            ("Content-Type", content_type(&blob)),
            ("Docker-Content-Digest", digest.to_string()),
        ],
        Body::from_stream(contents.stream),
    )
        .into_response())
}

fn content_type(blob: &Blob) -> String {
    if blob.media_type.is_empty() {
        "application/octet-stream".to_string()
    } else {
        blob.media_type.clone()
    }
}

/// DELETE `/v2/<repo>/blobs/<digest>` — removes only the mount. The blob
/// itself is left for the sweeper once nothing references it.
pub async fn delete_blob(
    state: &AppState,
    headers: &HeaderMap,
    repo: &RepoPath,
    raw_digest: &str,
) -> RegistryResult<Response> {
    authorize(state, headers, &[Scope::repository(&repo.full_name(), &["delete"])]).await?;
    let digest: Digest = raw_digest
        .parse()
        .map_err(|_| RegistryError::new(RegistryErrorCode::DigestInvalid))?;
    let account = require_account(state, &repo.account_name).await?;

    let mut conn = state.db.pool().acquire().await?;
    let repo_row = queries::get_repo(&mut *conn, &account.name, &repo.repo_name)
        .await?
        .ok_or_else(|| RegistryError::new(RegistryErrorCode::NameUnknown))?;
    let deleted = sqlx::query(
        "DELETE FROM blob_mounts bm USING blobs b
         WHERE bm.blob_id = b.id AND bm.repo_id = $1
           AND b.account_name = $2 AND b.digest = $3",
    )
    .bind(repo_row.id)
    .bind(&account.name)
    .bind(digest.to_string())
    .execute(&mut *conn)
    .await?;
    if deleted.rows_affected() == 0 {
        return Err(RegistryError::new(RegistryErrorCode::BlobUnknown));
    }
    Ok(StatusCode::ACCEPTED.into_response())
}
