//! On-demand replication of manifests and blobs into replica accounts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;

use crate::api::registry::RepoPath;
use crate::api::AppState;
use crate::auth::Authorization;
use crate::db::queries;
use crate::digest::{Digest, RunningDigest};
use crate::drivers::auth::IdentityKind;
use crate::drivers::inbound_cache::{CacheResult, UpstreamManifestRef};
use crate::drivers::storage::generate_storage_id;
use crate::errors::{RegistryError, RegistryErrorCode, RegistryResult};
use crate::models::account::ReplicationMode;
use crate::models::Account;

mod upstream;
pub use upstream::UpstreamClient;

/// At most one replication runs per key at any time, across all request
/// handlers of this process. Cross-process dedup is not needed: the loser
/// just finds the content already present and serves it.
#[derive(Default)]
pub struct ReplicationLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ReplicationLocks {
    pub async fn hold(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            if locks.len() > 1024 {
                locks.retain(|_, entry| Arc::strong_count(entry) > 1);
            }
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

fn replication_lock_key(account_name: &str, reference: &str) -> String {
    // Hashing keeps keys bounded even for pathological reference lengths.
    Digest::of_contents(format!("{account_name}\n{reference}").as_bytes()).hex()
}

pub struct ReplicatedManifest {
    pub contents: Bytes,
    pub media_type: String,
    pub digest: Digest,
}

/// Replicates one manifest (and everything it references) into the local
/// replica account, then serves it. Safe to call concurrently; one caller
/// replicates, the rest wait and then read locally.
pub async fn replicate_manifest(
    state: &AppState,
    account: &Account,
    repo: &RepoPath,
    reference: &str,
    authz: &Authorization,
) -> RegistryResult<ReplicatedManifest> {
    // Plain anonymous_pull serves local content only; triggering first-time
    // replication needs the stronger anonymous_first_pull.
    if authz.identity.kind() == IdentityKind::Anonymous
        && !crate::auth::anonymous_first_pull_allowed(account, &repo.repo_name, None)
    {
        return Err(RegistryError::new(RegistryErrorCode::ManifestUnknown));
    }

    let _guard = state
        .replication_locks
        .hold(&replication_lock_key(
            &account.name,
            &format!("{}:{reference}", repo.repo_name),
        ))
        .await;

    // Someone else may have finished the same replication while we waited.
    if let Some((contents, media_type, digest, _)) =
        crate::api::registry::manifests::load_local_manifest(state, account, repo, reference)
            .await?
    {
        return Ok(ReplicatedManifest { contents, media_type, digest });
    }

    replicate_manifest_inner(state, account, repo, reference, 0).await
}

/// Submanifests of an index are replicated depth-first. The recursion depth
/// is bounded: indexes of indexes exist, but nothing sane nests deeper.
const MAX_SUBMANIFEST_DEPTH: u32 = 3;

fn replicate_manifest_inner<'a>(
    state: &'a AppState,
    account: &'a Account,
    repo: &'a RepoPath,
    reference: &'a str,
    depth: u32,
) -> BoxFuture<'a, RegistryResult<ReplicatedManifest>> {
    async move {
        if depth > MAX_SUBMANIFEST_DEPTH {
            return Err(RegistryError::new(RegistryErrorCode::ManifestInvalid)
                .with_message("submanifest nesting is too deep"));
        }

        let client = UpstreamClient::for_account(state, account)?;
        let location = UpstreamManifestRef {
            host: client.upstream_host().to_string(),
            repo_name: client.upstream_repo_name(&repo.repo_name),
            reference: reference.to_string(),
        };

        let now = Utc::now();
        let cached = state
            .drivers
            .inbound_cache
            .load_manifest(&location, now)
            .await
            .ok()
            .unwrap_or(CacheResult::Miss);
        let (contents, media_type) = match cached {
            CacheResult::Hit(entry) => (entry.contents, entry.media_type),
            CacheResult::Miss => {
                let fetched = client.fetch_manifest(&repo.repo_name, reference).await?;
                let _ = state
                    .drivers
                    .inbound_cache
                    .store_manifest(&location, &fetched.1, fetched.0.clone(), now)
                    .await;
                fetched
            }
        };

        let digest = Digest::of_contents(&contents);
        if let Ok(expected) = reference.parse::<Digest>() {
            if expected != digest {
                return Err(RegistryError::internal(format!(
                    "upstream returned corrupt manifest for {reference}: got digest {digest}"
                )));
            }
        }

        let parsed = crate::manifest::ParsedManifest::parse(&media_type, &contents)
            .map_err(|err| {
                RegistryError::new(RegistryErrorCode::ManifestInvalid).with_message(err.to_string())
            })?;

        // Children first, so the persistence transaction finds them.
        for descriptor in parsed.manifest_references(&account.platform_filter()) {
            let child_reference = descriptor.digest.to_string();
            replicate_manifest_inner(state, account, repo, &child_reference, depth + 1).await?;
        }
        for descriptor in parsed.blob_references() {
            if let Err(err) = replicate_blob(state, account, repo, &descriptor.digest).await {
                record_pending_blob(state, account, repo, &descriptor.digest).await;
                return Err(err);
            }
        }

        let tag = reference.parse::<Digest>().is_err().then(|| reference.to_string());
        crate::api::registry::manifests::persist_manifest(
            state,
            account,
            repo,
            &media_type,
            contents.clone(),
            &digest,
            tag.as_deref(),
            // Quota limits what tenants push, not what replication mirrors.
            false,
        )
        .await?;

        Ok(ReplicatedManifest { contents, media_type, digest })
    }
    .boxed()
}

/// Streams one blob from upstream into local storage, verifying the digest
/// along the way, and mounts it into the repo.
pub async fn replicate_blob(
    state: &AppState,
    account: &Account,
    repo: &RepoPath,
    digest: &Digest,
) -> RegistryResult<crate::models::Blob> {
    let _guard = state
        .replication_locks
        .hold(&replication_lock_key(&account.name, &digest.to_string()))
        .await;

    // Double-check under the lock.
    {
        let mut conn = state.db.pool().acquire().await?;
        if let Some(repo_row) = queries::get_repo(&mut *conn, &account.name, &repo.repo_name).await?
        {
            if let Some(blob) =
                queries::get_mounted_blob(&mut *conn, repo_row.id, &account.name, &digest.to_string())
                    .await?
            {
                return Ok(blob);
            }
        }
        // Mounting an already-replicated blob into another repo needs no
        // upstream traffic.
        if let Some(blob) = queries::get_blob(&mut *conn, &account.name, &digest.to_string()).await? {
            drop(conn);
            let repo_row = get_or_create_repo_row(state, account, repo).await?;
            mount_existing(state, blob.id, repo_row.id).await?;
            return Ok(blob);
        }
    }

    let client = UpstreamClient::for_account(state, account)?;
    let mut byte_stream = client.fetch_blob(&repo.repo_name, digest).await?;

    let storage_id = generate_storage_id();
    let mut hasher = RunningDigest::default();
    let mut total_bytes: i64 = 0;
    let mut chunk_number: u32 = 0;

    let cleanup = |state: &AppState, account_name: String, storage_id: String, chunks: u32| {
        let storage = state.drivers.storage.clone();
        async move {
            let _ = storage.abort_blob_upload(&account_name, &storage_id, chunks).await;
        }
    };

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                cleanup(state, account.name.clone(), storage_id.clone(), chunk_number).await;
                record_pending_blob(state, account, repo, digest).await;
                return Err(RegistryError::internal(format!(
                    "upstream blob transfer failed: {err}"
                )));
            }
        };
        hasher.update(&chunk);
        total_bytes += chunk.len() as i64;
        chunk_number += 1;
        if let Err(err) = state
            .drivers
            .storage
            .append_to_blob(&account.name, &storage_id, chunk_number, chunk)
            .await
        {
            cleanup(state, account.name.clone(), storage_id.clone(), chunk_number).await;
            record_pending_blob(state, account, repo, digest).await;
            return Err(RegistryError::internal(err));
        }
    }

    if hasher.clone().finish() != *digest {
        cleanup(state, account.name.clone(), storage_id.clone(), chunk_number).await;
        return Err(RegistryError::internal(format!(
            "upstream returned corrupt blob for {digest}"
        )));
    }

    state
        .drivers
        .storage
        .finalize_blob(&account.name, &storage_id, chunk_number)
        .await
        .map_err(RegistryError::internal)?;

    let our_storage_id = storage_id.clone();
    let mut tx = state.db.begin().await?;
    let now = crate::db::now();
    let repo_row = queries::get_or_create_repo(&mut *tx, &account.name, &repo.repo_name).await?;
    let (blob, created) = queries::insert_blob_if_missing(
        &mut *tx,
        &account.name,
        &digest.to_string(),
        total_bytes,
        &storage_id,
        "application/octet-stream",
        now,
        now + crate::api::registry::uploads::BLOB_VALIDATION_INTERVAL,
    )
    .await?;
    queries::mount_blob(&mut *tx, blob.id, repo_row.id).await?;
    sqlx::query("DELETE FROM pending_blobs WHERE account_name = $1 AND digest = $2")
        .bind(&account.name)
        .bind(digest.to_string())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    if !created && blob.storage_id != our_storage_id {
        // Lost a race against another replication of the same blob; our
        // copy is redundant.
        if let Err(err) = state
            .drivers
            .storage
            .delete_blob(&account.name, &our_storage_id)
            .await
        {
            warn!("cannot delete duplicate replicated blob {our_storage_id}: {err}");
        }
    }
    Ok(blob)
}

async fn get_or_create_repo_row(
    state: &AppState,
    account: &Account,
    repo: &RepoPath,
) -> RegistryResult<crate::models::Repository> {
    let mut conn = state.db.pool().acquire().await?;
    Ok(queries::get_or_create_repo(&mut *conn, &account.name, &repo.repo_name).await?)
}

async fn mount_existing(state: &AppState, blob_id: i64, repo_id: i64) -> RegistryResult<()> {
    let mut conn = state.db.pool().acquire().await?;
    queries::mount_blob(&mut *conn, blob_id, repo_id).await?;
    Ok(())
}

/// Failed replications leave a pending row; a janitor retries with
/// exponential backoff.
pub(crate) async fn record_pending_blob(
    state: &AppState,
    account: &Account,
    repo: &RepoPath,
    digest: &Digest,
) {
    let now = crate::db::now();
    let result = sqlx::query(
        "INSERT INTO pending_blobs (account_name, digest, repo_name, reason, since,
                                    num_failures, next_check_at)
         VALUES ($1, $2, $3, 'replication failed', $4, 1, $5)
         ON CONFLICT (account_name, digest) DO UPDATE
            SET num_failures = pending_blobs.num_failures + 1,
                next_check_at = $4 + make_interval(mins =>
                    LEAST(30, POWER(2, pending_blobs.num_failures))::int)",
    )
    .bind(&account.name)
    .bind(digest.to_string())
    .bind(&repo.repo_name)
    .bind(now)
    .bind(now + chrono::Duration::minutes(1))
    .execute(state.db.pool())
    .await;
    if let Err(err) = result {
        warn!("cannot record pending blob {digest} for {}: {err}", account.name);
    }
}

impl UpstreamClient {
    pub(crate) fn for_account(state: &AppState, account: &Account) -> RegistryResult<Self> {
        match account.replication_mode() {
            ReplicationMode::Primary => Err(RegistryError::internal(
                "replication invoked on a primary account",
            )),
            ReplicationMode::FromPeer { peer_hostname } => Ok(UpstreamClient::peer(
                state.clone(),
                account.name.clone(),
                peer_hostname,
            )),
            ReplicationMode::FromExternal { url, username, password } => Ok(
                UpstreamClient::external(state.clone(), account.name.clone(), url, username, password),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keyed_locks_serialize_only_same_key() {
        let locks = Arc::new(ReplicationLocks::default());

        let first = locks.hold("key-a").await;
        // A different key is immediately available.
        let _other = locks.hold("key-b").await;

        // The same key is not available until the first guard drops.
        let locks_clone = locks.clone();
        let contender = tokio::spawn(async move { locks_clone.hold("key-a").await });
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(first);
        let _reacquired = contender.await.unwrap();
    }

    #[test]
    fn lock_keys_are_digest_sized() {
        let key = replication_lock_key("acc1", "very/long/repo:with-tag");
        assert_eq!(key.len(), 64);
        assert_eq!(key, replication_lock_key("acc1", "very/long/repo:with-tag"));
        assert_ne!(key, replication_lock_key("acc1", "other"));
    }
}
