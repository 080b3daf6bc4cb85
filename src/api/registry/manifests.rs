use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Duration;

use crate::api::registry::{authorize, enforce_rate_limit, RepoPath};
use crate::api::AppState;
use crate::auth::Scope;
use crate::db::queries;
use crate::digest::Digest;
use crate::drivers::RateLimitAction;
use crate::errors::{RegistryError, RegistryErrorCode, RegistryResult};
use crate::manifest::{media_types, ParsedManifest, MAX_MANIFEST_SIZE_BYTES};
use crate::models::{is_valid_tag_name, Account};

pub const MANIFEST_VALIDATION_INTERVAL: Duration = Duration::days(7);

/// PUT `/v2/<repo>/manifests/<reference>`.
pub async fn put_manifest(
    state: &AppState,
    headers: &HeaderMap,
    repo: &RepoPath,
    reference: &str,
    body: Body,
) -> RegistryResult<Response> {
    let authz =
        authorize(state, headers, &[Scope::repository(&repo.full_name(), &["push"])]).await?;
    let account = crate::api::registry::require_account(state, &repo.account_name).await?;
    if account.is_replica() {
        return Err(RegistryError::new(RegistryErrorCode::Denied)
            .with_message("cannot push to a replica account"));
    }
    if account.in_maintenance {
        return Err(RegistryError::new(RegistryErrorCode::Denied)
            .with_message("account is in maintenance"));
    }
    enforce_rate_limit(
        state,
        &account.name,
        RateLimitAction::ManifestPush,
        &authz.identity.name(),
        1,
    )
    .await?;

    let media_type = headers
        .get("Content-Type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or(media_types::OCI_MANIFEST)
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    if media_type == media_types::DOCKER_MANIFEST_V1
        || media_type == media_types::DOCKER_MANIFEST_V1_SIGNED
    {
        return Err(RegistryError::new(RegistryErrorCode::Unsupported)
            .with_message("schema 1 manifests can no longer be pushed"));
    }

    let contents = axum::body::to_bytes(body, MAX_MANIFEST_SIZE_BYTES)
        .await
        .map_err(|_| {
            RegistryError::new(RegistryErrorCode::ManifestInvalid)
                .with_message("manifest exceeds size limit")
        })?;
    let digest = Digest::of_contents(&contents);

    // A by-digest push must name the digest of exactly these bytes.
    let tag = if let Ok(expected) = reference.parse::<Digest>() {
        if expected != digest {
            return Err(RegistryError::new(RegistryErrorCode::DigestInvalid));
        }
        None
    } else {
        if !is_valid_tag_name(reference) {
            return Err(RegistryError::new(RegistryErrorCode::ManifestInvalid)
                .with_message("invalid tag name"));
        }
        Some(reference.to_string())
    };

    persist_manifest(
        state,
        &account,
        repo,
        &media_type,
        contents,
        &digest,
        tag.as_deref(),
        true,
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        [
            ("Location", format!("/v2/{}/manifests/{digest}", repo.full_name())),
            ("Docker-Content-Digest", digest.to_string()),
            ("Content-Length", "0".to_string()),
        ],
    )
        .into_response())
}

/// Parses, verifies closure, and writes one manifest to storage and
/// database. Shared between the push path and the replication engine; the
/// latter has already replicated the referenced blobs and submanifests.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn persist_manifest(
    state: &AppState,
    account: &Account,
    repo: &RepoPath,
    media_type: &str,
    contents: Bytes,
    digest: &Digest,
    tag: Option<&str>,
    enforce_quota: bool,
) -> RegistryResult<()> {
    let parsed =
        ParsedManifest::parse(media_type, &contents).map_err(registry_error_for_parse)?;

    check_required_labels(state, account, &parsed).await?;

    let size_bytes = contents.len() as i64;
    state
        .drivers
        .storage
        .write_manifest(&account.name, &repo.repo_name, &digest.to_string(), contents)
        .await
        .map_err(RegistryError::internal)?;

    let tx_result =
        persist_manifest_rows(state, account, repo, &parsed, media_type, size_bytes, digest, tag, enforce_quota)
            .await;

    if let Err(err) = tx_result {
        // The storage write is compensated so the storage sweep does not
        // have to find the stray object later. A re-push of an existing
        // manifest keeps its object: the database still references it.
        let still_referenced = {
            let mut conn = state.db.pool().acquire().await?;
            match queries::get_repo(&mut *conn, &account.name, &repo.repo_name).await? {
                Some(repo_row) => {
                    queries::get_manifest(&mut *conn, repo_row.id, &digest.to_string())
                        .await?
                        .is_some()
                }
                None => false,
            }
        };
        if !still_referenced {
            let _ = state
                .drivers
                .storage
                .delete_manifest(&account.name, &repo.repo_name, &digest.to_string())
                .await;
        }
        return Err(err);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn persist_manifest_rows(
    state: &AppState,
    account: &Account,
    repo: &RepoPath,
    parsed: &ParsedManifest,
    media_type: &str,
    size_bytes: i64,
    digest: &Digest,
    tag: Option<&str>,
    enforce_quota: bool,
) -> RegistryResult<()> {
    let digest_str = digest.to_string();
    let platform_filter = account.platform_filter();
    let mut tx = state.db.begin().await?;
    let repo_row = queries::get_or_create_repo(&mut *tx, &account.name, &repo.repo_name).await?;
    let now = crate::db::now();

    // Manifest closure: every referenced blob must be mounted
    // here, every referenced submanifest must exist here.
    let mut blob_ids = Vec::new();
    for descriptor in parsed.blob_references() {
        let blob = queries::get_mounted_blob(
            &mut *tx,
            repo_row.id,
            &account.name,
            &descriptor.digest.to_string(),
        )
        .await?
        .ok_or_else(|| {
            RegistryError::new(RegistryErrorCode::ManifestBlobUnknown).with_detail(
                serde_json::json!({"digest": descriptor.digest.to_string()}),
            )
        })?;
        if let Some(expected_size) = descriptor.size {
            if expected_size != blob.size_bytes {
                return Err(RegistryError::new(RegistryErrorCode::SizeInvalid)
                    .with_message(format!(
                        "manifest declares {expected_size} bytes for {}, but the blob has {}",
                        descriptor.digest, blob.size_bytes
                    )));
            }
        }
        blob_ids.push(blob.id);
    }
    let mut child_digests = Vec::new();
    for descriptor in parsed.manifest_references(&platform_filter) {
        let child_digest = descriptor.digest.to_string();
        queries::get_manifest(&mut *tx, repo_row.id, &child_digest)
            .await?
            .ok_or_else(|| {
                RegistryError::new(RegistryErrorCode::ManifestUnknown)
                    .with_status(StatusCode::BAD_REQUEST)
                    .with_message("manifest references a submanifest that was not pushed yet")
                    .with_detail(serde_json::json!({"digest": child_digest}))
            })?;
        child_digests.push(child_digest);
    }

    let is_new = queries::get_manifest(&mut *tx, repo_row.id, &digest_str).await?.is_none();
    if enforce_quota && is_new {
        if let Some(quota) = queries::get_quota(&mut *tx, &account.auth_tenant_id).await? {
            let used = queries::count_tenant_manifests(&mut *tx, &account.auth_tenant_id).await?;
            if used + 1 > quota.manifests {
                return Err(RegistryError::new(RegistryErrorCode::Denied)
                    .with_message(format!(
                        "manifest quota exceeded (quota = {}, usage = {used})",
                        quota.manifests
                    )));
            }
        }
    }

    sqlx::query(
        "INSERT INTO manifests (repo_id, digest, media_type, size_bytes, pushed_at,
                                validated_at, next_validation_at)
         VALUES ($1, $2, $3, $4, $5, $5, $6)
         ON CONFLICT (repo_id, digest) DO UPDATE
            SET media_type = EXCLUDED.media_type,
                size_bytes = EXCLUDED.size_bytes,
                validated_at = EXCLUDED.validated_at,
                next_validation_at = EXCLUDED.next_validation_at",
    )
    .bind(repo_row.id)
    .bind(&digest_str)
    .bind(media_type)
    .bind(size_bytes)
    .bind(now)
    .bind(now + MANIFEST_VALIDATION_INTERVAL)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM manifest_blob_refs WHERE repo_id = $1 AND manifest_digest = $2")
        .bind(repo_row.id)
        .bind(&digest_str)
        .execute(&mut *tx)
        .await?;
    for blob_id in blob_ids {
        sqlx::query(
            "INSERT INTO manifest_blob_refs (repo_id, manifest_digest, blob_id)
             VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(repo_row.id)
        .bind(&digest_str)
        .bind(blob_id)
        .execute(&mut *tx)
        .await?;
    }
    sqlx::query(
        "DELETE FROM manifest_manifest_refs WHERE repo_id = $1 AND parent_digest = $2",
    )
    .bind(repo_row.id)
    .bind(&digest_str)
    .execute(&mut *tx)
    .await?;
    for child_digest in child_digests {
        sqlx::query(
            "INSERT INTO manifest_manifest_refs (repo_id, parent_digest, child_digest)
             VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(repo_row.id)
        .bind(&digest_str)
        .bind(child_digest)
        .execute(&mut *tx)
        .await?;
    }

    if let Some(tag_name) = tag {
        sqlx::query(
            "INSERT INTO tags (repo_id, name, digest, pushed_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (repo_id, name) DO UPDATE
                SET digest = EXCLUDED.digest, pushed_at = EXCLUDED.pushed_at",
        )
        .bind(repo_row.id)
        .bind(tag_name)
        .bind(&digest_str)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Accounts can require certain labels on all images (e.g. `maintainer`).
/// The config blob is already local at this point, so the check is cheap.
async fn check_required_labels(
    state: &AppState,
    account: &Account,
    parsed: &ParsedManifest,
) -> RegistryResult<()> {
    let required = account.required_labels();
    if required.is_empty() {
        return Ok(());
    }
    let ParsedManifest::Image(document) = parsed else {
        return Ok(());
    };
    let config_blob = {
        let mut conn = state.db.pool().acquire().await?;
        queries::get_blob(&mut *conn, &account.name, &document.config.digest.to_string()).await?
    };
    let Some(config_blob) = config_blob else {
        // The closure check in the transaction reports this properly.
        return Ok(());
    };
    let contents = state
        .drivers
        .storage
        .read_blob(&account.name, &config_blob.storage_id)
        .await
        .map_err(RegistryError::internal)?
        .into_bytes()
        .await
        .map_err(RegistryError::internal)?;
    let info = crate::manifest::ImageConfigInfo::parse(&contents)
        .map_err(|err| RegistryError::new(RegistryErrorCode::ManifestInvalid).with_message(err.to_string()))?;
    let labels = info.config.labels.unwrap_or_default();
    let missing: Vec<_> = required
        .iter()
        .filter(|label| !labels.contains_key(label.as_str()))
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(RegistryError::new(RegistryErrorCode::ManifestInvalid)
            .with_message(format!("missing required labels: {}", missing.join(", "))))
    }
}

fn registry_error_for_parse(err: crate::manifest::ManifestParseError) -> RegistryError {
    RegistryError::new(RegistryErrorCode::ManifestInvalid).with_message(err.to_string())
}

/// GET/HEAD `/v2/<repo>/manifests/<reference>`.
pub async fn get_manifest(
    state: &AppState,
    headers: &HeaderMap,
    repo: &RepoPath,
    reference: &str,
    head_only: bool,
) -> RegistryResult<Response> {
    let authz =
        authorize(state, headers, &[Scope::repository(&repo.full_name(), &["pull"])]).await?;

    let account = {
        let mut conn = state.db.pool().acquire().await?;
        queries::get_account(&mut *conn, &repo.account_name).await?
    };
    let Some(account) = account else {
        // Under the anycast FQDN another peer may own this account.
        if is_anycast_request(state, headers) {
            let subpath = format!("manifests/{reference}");
            return crate::peering::proxy_anycast_pull(state, repo, &subpath, head_only).await;
        }
        return Err(RegistryError::new(RegistryErrorCode::NameUnknown));
    };
    enforce_rate_limit(
        state,
        &account.name,
        RateLimitAction::ManifestPull,
        &authz.identity.name(),
        1,
    )
    .await?;

    let local = load_local_manifest(state, &account, repo, reference).await?;
    let (contents, media_type, digest, tag_name) = match local {
        Some(found) => found,
        None if account.is_replica() => {
            let replicated =
                crate::replication::replicate_manifest(state, &account, repo, reference, &authz)
                    .await?;
            let tag_name = reference.parse::<Digest>().is_err().then(|| reference.to_string());
            (replicated.contents, replicated.media_type, replicated.digest, tag_name)
        }
        None => return Err(RegistryError::new(RegistryErrorCode::ManifestUnknown)),
    };

    // Pull timestamps only ever move forward.
    {
        let mut conn = state.db.pool().acquire().await?;
        if let Some(repo_row) =
            queries::get_repo(&mut *conn, &account.name, &repo.repo_name).await?
        {
            crate::db::bump_last_pulled_at(
                &mut *conn,
                repo_row.id,
                &digest.to_string(),
                tag_name.as_deref(),
                chrono::Utc::now(),
            )
            .await?;
        }
    }

    if head_only {
        return Ok((
            StatusCode::OK,
            [
                ("Content-Type", media_type),
                ("Docker-Content-Digest", digest.to_string()),
                ("Content-Length", contents.len().to_string()),
            ],
        )
            .into_response());
    }
    Ok((
        StatusCode::OK,
        [
            ("Content-Type", media_type),
            ("Docker-Content-Digest", digest.to_string()),
            ("Content-Length", contents.len().to_string()),
        ],
        contents,
    )
        .into_response())
}

pub(crate) fn is_anycast_request(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(anycast) = &state.config.anycast_api_public_hostname else {
        return false;
    };
    headers
        .get("Host")
        .and_then(|value| value.to_str().ok())
        .map(|host| host.split(':').next() == Some(anycast.as_str()))
        .unwrap_or(false)
}

type LocalManifest = (Bytes, String, Digest, Option<String>);

pub(crate) async fn load_local_manifest(
    state: &AppState,
    account: &Account,
    repo: &RepoPath,
    reference: &str,
) -> RegistryResult<Option<LocalManifest>> {
    let mut conn = state.db.pool().acquire().await?;
    let Some(repo_row) = queries::get_repo(&mut *conn, &account.name, &repo.repo_name).await?
    else {
        return Ok(None);
    };
    let (digest_str, tag_name) = match reference.parse::<Digest>() {
        Ok(digest) => (digest.to_string(), None),
        Err(_) => match queries::resolve_tag(&mut *conn, repo_row.id, reference).await? {
            Some(digest_str) => (digest_str, Some(reference.to_string())),
            None => return Ok(None),
        },
    };
    let Some(manifest_row) = queries::get_manifest(&mut *conn, repo_row.id, &digest_str).await?
    else {
        return Ok(None);
    };
    drop(conn);

    match state
        .drivers
        .storage
        .read_manifest(&account.name, &repo.repo_name, &digest_str)
        .await
    {
        Ok(contents) => {
            let digest: Digest = digest_str.parse().map_err(RegistryError::internal)?;
            Ok(Some((contents, manifest_row.media_type, digest, tag_name)))
        }
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(RegistryError::internal(err)),
    }
}

/// DELETE `/v2/<repo>/manifests/<digest>`.
pub async fn delete_manifest(
    state: &AppState,
    headers: &HeaderMap,
    repo: &RepoPath,
    reference: &str,
) -> RegistryResult<Response> {
    authorize(state, headers, &[Scope::repository(&repo.full_name(), &["delete"])]).await?;
    let account = crate::api::registry::require_account(state, &repo.account_name).await?;

    // Deletion goes by digest; tags are deleted through the management API.
    let digest: Digest = reference
        .parse()
        .map_err(|_| RegistryError::new(RegistryErrorCode::Unsupported)
            .with_message("manifests are deleted by digest, not by tag"))?;

    delete_manifest_core(state, &account, repo, &digest).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

/// Removes one manifest and its tags, marks newly unreferenced blob mounts
/// for the sweeper, and drops the storage object. Shared with the
/// management API.
pub(crate) async fn delete_manifest_core(
    state: &AppState,
    account: &Account,
    repo: &RepoPath,
    digest: &Digest,
) -> RegistryResult<()> {
    let grace = state.config.blob_sweep_grace;
    let digest_str = digest.to_string();
    let mut tx = state.db.begin().await?;
    let repo_row = queries::get_repo(&mut *tx, &account.name, &repo.repo_name)
        .await?
        .ok_or_else(|| RegistryError::new(RegistryErrorCode::NameUnknown))?;
    let deleted = sqlx::query("DELETE FROM manifests WHERE repo_id = $1 AND digest = $2")
        .bind(repo_row.id)
        .bind(&digest_str)
        .execute(&mut *tx)
        .await?;
    if deleted.rows_affected() == 0 {
        return Err(RegistryError::new(RegistryErrorCode::ManifestUnknown));
    }
    sqlx::query("DELETE FROM tags WHERE repo_id = $1 AND digest = $2")
        .bind(repo_row.id)
        .bind(&digest_str)
        .execute(&mut *tx)
        .await?;
    // Newly unreferenced blobs start their grace period now.
    let now = crate::db::now();
    queries::mark_unreferenced_blob_mounts(
        &mut *tx,
        repo_row.id,
        now + chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::hours(6)),
    )
    .await?;
    sqlx::query(
        "UPDATE repos SET next_blob_mount_sweep_at = COALESCE(next_blob_mount_sweep_at, $2)
         WHERE id = $1",
    )
    .bind(repo_row.id)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    if let Err(err) = state
        .drivers
        .storage
        .delete_manifest(&account.name, &repo.repo_name, &digest.to_string())
        .await
    {
        if !err.is_not_found() {
            warn!("cannot delete manifest object {digest} from storage: {err}");
        }
    }

    Ok(())
}
