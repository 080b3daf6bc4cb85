//! The chunked blob upload state machine.

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Duration;
use uuid::Uuid;

use crate::api::registry::{authorize, enforce_rate_limit, require_account, RepoPath};
use crate::api::AppState;
use crate::auth::Scope;
use crate::db::queries;
use crate::digest::{Digest, RunningDigest};
use crate::drivers::storage::generate_storage_id;
use crate::drivers::RateLimitAction;
use crate::errors::{RegistryError, RegistryErrorCode, RegistryResult};
use crate::models::{Account, Upload};

/// Blobs re-validate weekly by default.
pub const BLOB_VALIDATION_INTERVAL: Duration = Duration::days(7);

fn upload_url(repo: &RepoPath, upload_uuid: Uuid) -> String {
    format!("/v2/{}/blobs/uploads/{upload_uuid}", repo.full_name())
}

fn blob_url(repo: &RepoPath, digest: &Digest) -> String {
    format!("/v2/{}/blobs/{digest}", repo.full_name())
}

fn range_header(size_bytes: i64) -> String {
    format!("0-{}", size_bytes.max(1) - 1)
}

async fn writable_account(state: &AppState, repo: &RepoPath) -> RegistryResult<Account> {
    let account = require_account(state, &repo.account_name).await?;
    if account.is_replica() {
        return Err(RegistryError::new(RegistryErrorCode::Denied)
            .with_message("cannot push to a replica account"));
    }
    if account.in_maintenance {
        return Err(RegistryError::new(RegistryErrorCode::Denied)
            .with_message("account is in maintenance"));
    }
    Ok(account)
}

fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// POST `/v2/<repo>/blobs/uploads/` — starts an upload, or short-circuits
/// it: `?mount=&from=` performs a cross-repo mount, `?digest=` accepts a
/// monolithic body.
pub async fn start_upload(
    state: &AppState,
    headers: &HeaderMap,
    repo: &RepoPath,
    query: &str,
    body: Body,
) -> RegistryResult<Response> {
    let mount_digest = query_param(query, "mount");
    let mount_from = query_param(query, "from");
    let monolithic_digest = query_param(query, "digest");

    let mut required = vec![Scope::repository(&repo.full_name(), &["push"])];
    if let Some(from) = &mount_from {
        required.push(Scope::repository(from, &["pull"]));
    }
    let authz = authorize(state, headers, &required).await?;
    let account = writable_account(state, repo).await?;
    enforce_rate_limit(
        state,
        &account.name,
        RateLimitAction::BlobPush,
        &authz.identity.name(),
        1,
    )
    .await?;

    if let (Some(raw_digest), Some(from)) = (mount_digest, mount_from) {
        return cross_repo_mount(state, repo, &account, &raw_digest, &from).await;
    }

    // Every upload gets its own storage id; the blob only becomes visible
    // under its digest at finalize time.
    let storage_id = generate_storage_id();
    let upload_uuid = Uuid::new_v4();
    let now = crate::db::now();

    let mut upload = Upload {
        repo_id: 0,
        uuid: upload_uuid,
        storage_id,
        size_bytes: 0,
        digest: String::new(),
        num_chunks: 0,
        updated_at: now,
    };

    let mut tx = state.db.begin().await?;
    let repo_row = queries::get_or_create_repo(&mut *tx, &repo.account_name, &repo.repo_name).await?;
    sqlx::query(
        "INSERT INTO uploads (repo_id, uuid, storage_id, size_bytes, digest,
                              num_chunks, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(repo_row.id)
    .bind(upload.uuid)
    .bind(&upload.storage_id)
    .bind(upload.size_bytes)
    .bind(&upload.digest)
    .bind(upload.num_chunks)
    .bind(upload.updated_at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    upload.repo_id = repo_row.id;
    state
        .upload_hashers
        .lock()
        .unwrap()
        .insert(upload_uuid, RunningDigest::default());

    if let Some(raw_digest) = monolithic_digest {
        // Monolithic POST: body plus digest in one request.
        let upload = append_body_to_upload(state, &account, upload, body).await?;
        return finalize_upload(state, repo, &account, upload, &raw_digest).await;
    }

    Ok((
        StatusCode::ACCEPTED,
        [
            ("Location", upload_url(repo, upload_uuid)),
            ("Range", "0-0".to_string()),
            ("Docker-Upload-UUID", upload_uuid.to_string()),
            ("Content-Length", "0".to_string()),
        ],
    )
        .into_response())
}

/// Cross-repo mount: no bytes move, a new BlobMount row appears. Only
/// within the same account.
async fn cross_repo_mount(
    state: &AppState,
    repo: &RepoPath,
    account: &Account,
    raw_digest: &str,
    from: &str,
) -> RegistryResult<Response> {
    let digest: Digest = raw_digest
        .parse()
        .map_err(|_| RegistryError::new(RegistryErrorCode::DigestInvalid))?;
    let source_repo_name = match from.split_once('/') {
        Some((source_account, rest)) if source_account == account.name => rest.to_string(),
        _ => {
            return Err(RegistryError::new(RegistryErrorCode::Denied)
                .with_message("cross-repo mounts must stay within one account"))
        }
    };

    let mut tx = state.db.begin().await?;
    let source = queries::get_repo(&mut *tx, &account.name, &source_repo_name)
        .await?
        .ok_or_else(|| RegistryError::new(RegistryErrorCode::NameUnknown))?;
    let blob = queries::get_mounted_blob(&mut *tx, source.id, &account.name, &digest.to_string())
        .await?
        .ok_or_else(|| RegistryError::new(RegistryErrorCode::BlobUnknown))?;
    let target = queries::get_or_create_repo(&mut *tx, &account.name, &repo.repo_name).await?;
    queries::mount_blob(&mut *tx, blob.id, target.id).await?;
    tx.commit().await?;

    Ok((
        StatusCode::CREATED,
        [
            ("Location", blob_url(repo, &digest)),
            ("Docker-Content-Digest", digest.to_string()),
        ],
    )
        .into_response())
}

/// Rebuilds the running digest for uploads resumed on another process.
async fn running_digest_for(
    state: &AppState,
    account: &Account,
    upload: &Upload,
) -> RegistryResult<RunningDigest> {
    if let Some(hasher) = state.upload_hashers.lock().unwrap().get(&upload.uuid) {
        return Ok(hasher.clone());
    }
    if upload.num_chunks == 0 {
        return Ok(RunningDigest::default());
    }
    let contents = state
        .drivers
        .storage
        .read_uploaded_chunks(&account.name, &upload.storage_id, upload.num_chunks as u32)
        .await
        .map_err(RegistryError::internal)?
        .into_bytes()
        .await
        .map_err(RegistryError::internal)?;
    Ok(RunningDigest::of_stored_chunks(std::iter::once(contents.as_ref())))
}

async fn append_body_to_upload(
    state: &AppState,
    account: &Account,
    mut upload: Upload,
    body: Body,
) -> RegistryResult<Upload> {
    let chunk = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|err| {
            RegistryError::new(RegistryErrorCode::BlobUploadInvalid)
                .with_message(format!("cannot read request body: {err}"))
        })?;
    if chunk.is_empty() {
        return Ok(upload);
    }
    append_chunk_to_upload(state, account, &mut upload, chunk).await?;
    Ok(upload)
}

async fn append_chunk_to_upload(
    state: &AppState,
    account: &Account,
    upload: &mut Upload,
    chunk: Bytes,
) -> RegistryResult<()> {
    let mut hasher = running_digest_for(state, account, upload).await?;
    hasher.update(&chunk);

    let chunk_number = upload.num_chunks as u32 + 1;
    state
        .drivers
        .storage
        .append_to_blob(&account.name, &upload.storage_id, chunk_number, chunk.clone())
        .await
        .map_err(RegistryError::internal)?;

    upload.num_chunks += 1;
    upload.size_bytes += chunk.len() as i64;
    upload.digest = hasher.clone().finish().to_string();
    upload.updated_at = crate::db::now();

    sqlx::query(
        "UPDATE uploads SET size_bytes = $3, digest = $4, num_chunks = $5, updated_at = $6
         WHERE repo_id = $1 AND uuid = $2",
    )
    .bind(upload.repo_id)
    .bind(upload.uuid)
    .bind(upload.size_bytes)
    .bind(&upload.digest)
    .bind(upload.num_chunks)
    .bind(upload.updated_at)
    .execute(state.db.pool())
    .await?;

    state.upload_hashers.lock().unwrap().insert(upload.uuid, hasher);
    Ok(())
}

async fn load_upload(
    state: &AppState,
    repo: &RepoPath,
    upload_uuid: Uuid,
) -> RegistryResult<Upload> {
    let mut conn = state.db.pool().acquire().await?;
    let repo_row = queries::get_repo(&mut *conn, &repo.account_name, &repo.repo_name)
        .await?
        .ok_or_else(|| RegistryError::new(RegistryErrorCode::NameUnknown))?;
    queries::get_upload(&mut *conn, repo_row.id, upload_uuid)
        .await?
        .ok_or_else(|| RegistryError::new(RegistryErrorCode::BlobUploadUnknown))
}

/// PATCH `/v2/<repo>/blobs/uploads/<uuid>` — appends one chunk.
pub async fn append_chunk(
    state: &AppState,
    headers: &HeaderMap,
    repo: &RepoPath,
    upload_uuid: Uuid,
    body: Body,
) -> RegistryResult<Response> {
    authorize(state, headers, &[Scope::repository(&repo.full_name(), &["push"])]).await?;
    let account = writable_account(state, repo).await?;
    let mut upload = load_upload(state, repo, upload_uuid).await?;

    // Chunks must arrive in order; an out-of-order Content-Range is the
    // client's mistake, not ours.
    if let Some(raw_range) = headers.get("Content-Range").and_then(|value| value.to_str().ok()) {
        let starts_at_offset = raw_range
            .split_once('-')
            .and_then(|(start, _)| start.parse::<i64>().ok())
            .is_some_and(|start| start == upload.size_bytes);
        if !starts_at_offset {
            return Err(RegistryError::new(RegistryErrorCode::BlobUploadInvalid)
                .with_status(StatusCode::RANGE_NOT_SATISFIABLE)
                .with_message("chunk does not continue at the current upload offset"));
        }
    }

    let chunk = axum::body::to_bytes(body, usize::MAX).await.map_err(|err| {
        RegistryError::new(RegistryErrorCode::BlobUploadInvalid)
            .with_message(format!("cannot read request body: {err}"))
    })?;
    append_chunk_to_upload(state, &account, &mut upload, chunk).await?;

    Ok((
        StatusCode::ACCEPTED,
        [
            ("Location", upload_url(repo, upload_uuid)),
            ("Range", range_header(upload.size_bytes)),
            ("Docker-Upload-UUID", upload_uuid.to_string()),
            ("Content-Length", "0".to_string()),
        ],
    )
        .into_response())
}

/// PUT `/v2/<repo>/blobs/uploads/<uuid>?digest=` — optional final chunk,
/// then digest verification and promotion to a proper blob.
pub async fn finish_upload(
    state: &AppState,
    headers: &HeaderMap,
    repo: &RepoPath,
    upload_uuid: Uuid,
    query: &str,
    body: Body,
) -> RegistryResult<Response> {
    authorize(state, headers, &[Scope::repository(&repo.full_name(), &["push"])]).await?;
    let account = writable_account(state, repo).await?;
    let upload = load_upload(state, repo, upload_uuid).await?;

    let raw_digest = query_param(query, "digest")
        .ok_or_else(|| RegistryError::new(RegistryErrorCode::DigestInvalid))?;
    let upload = append_body_to_upload(state, &account, upload, body).await?;
    finalize_upload(state, repo, &account, upload, &raw_digest).await
}

async fn finalize_upload(
    state: &AppState,
    repo: &RepoPath,
    account: &Account,
    upload: Upload,
    raw_digest: &str,
) -> RegistryResult<Response> {
    let expected: Digest = raw_digest
        .parse()
        .map_err(|_| RegistryError::new(RegistryErrorCode::DigestInvalid))?;

    state.upload_hashers.lock().unwrap().remove(&upload.uuid);

    if upload.digest != expected.to_string() {
        // The upload is unusable now; throw away the partial state.
        let _ = state
            .drivers
            .storage
            .abort_blob_upload(&account.name, &upload.storage_id, upload.num_chunks as u32)
            .await;
        sqlx::query("DELETE FROM uploads WHERE repo_id = $1 AND uuid = $2")
            .bind(upload.repo_id)
            .bind(upload.uuid)
            .execute(state.db.pool())
            .await?;
        return Err(RegistryError::new(RegistryErrorCode::DigestInvalid));
    }

    state
        .drivers
        .storage
        .finalize_blob(&account.name, &upload.storage_id, upload.num_chunks as u32)
        .await
        .map_err(RegistryError::internal)?;

    let mut tx = state.db.begin().await?;
    let now = crate::db::now();
    let (blob, freshly_created) = queries::insert_blob_if_missing(
        &mut *tx,
        &account.name,
        &expected.to_string(),
        upload.size_bytes,
        &upload.storage_id,
        "application/octet-stream",
        now,
        now + BLOB_VALIDATION_INTERVAL,
    )
    .await?;
    queries::mount_blob(&mut *tx, blob.id, upload.repo_id).await?;
    sqlx::query("DELETE FROM uploads WHERE repo_id = $1 AND uuid = $2")
        .bind(upload.repo_id)
        .bind(upload.uuid)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    if !freshly_created {
        // Concurrent push of the same digest won; our copy is redundant.
        if let Err(err) = state
            .drivers
            .storage
            .delete_blob(&account.name, &upload.storage_id)
            .await
        {
            warn!("cannot delete duplicate blob {}: {err}", upload.storage_id);
        }
    }

    Ok((
        StatusCode::CREATED,
        [
            ("Location", blob_url(repo, &expected)),
            ("Docker-Content-Digest", expected.to_string()),
            ("Content-Length", "0".to_string()),
        ],
    )
        .into_response())
}

/// GET `/v2/<repo>/blobs/uploads/<uuid>` — progress report.
pub async fn get_upload_status(
    state: &AppState,
    headers: &HeaderMap,
    repo: &RepoPath,
    upload_uuid: Uuid,
) -> RegistryResult<Response> {
    authorize(state, headers, &[Scope::repository(&repo.full_name(), &["push"])]).await?;
    require_account(state, &repo.account_name).await?;
    let upload = load_upload(state, repo, upload_uuid).await?;
    Ok((
        StatusCode::NO_CONTENT,
        [
            ("Range", range_header(upload.size_bytes)),
            ("Docker-Upload-UUID", upload_uuid.to_string()),
        ],
    )
        .into_response())
}

/// DELETE `/v2/<repo>/blobs/uploads/<uuid>` — abort.
pub async fn abort_upload(
    state: &AppState,
    headers: &HeaderMap,
    repo: &RepoPath,
    upload_uuid: Uuid,
) -> RegistryResult<Response> {
    authorize(state, headers, &[Scope::repository(&repo.full_name(), &["push"])]).await?;
    let account = require_account(state, &repo.account_name).await?;
    let upload = load_upload(state, repo, upload_uuid).await?;

    state.upload_hashers.lock().unwrap().remove(&upload_uuid);
    state
        .drivers
        .storage
        .abort_blob_upload(&account.name, &upload.storage_id, upload.num_chunks as u32)
        .await
        .map_err(RegistryError::internal)?;
    sqlx::query("DELETE FROM uploads WHERE repo_id = $1 AND uuid = $2")
        .bind(upload.repo_id)
        .bind(upload.uuid)
        .execute(state.db.pool())
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
