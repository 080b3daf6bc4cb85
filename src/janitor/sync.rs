//! Replica upkeep: manifest sync against the primary, retries for blobs
//! whose replication failed, and peer credential rotation.

use async_trait::async_trait;
use chrono::Duration;

use super::{job_error, Job, JobError, JobOutcome};
use crate::api::peer::{ManifestSyncEntry, ReplicaSyncPayload, TagSyncEntry};
use crate::api::registry::RepoPath;
use crate::api::AppState;
use crate::db::queries;
use crate::digest::Digest;
use crate::models::{Manifest, PendingBlob, Repository, Tag};

const MANIFEST_SYNC_INTERVAL: Duration = Duration::hours(1);

/// For each repo of a peer replica, reports the local state to the primary
/// and applies the authoritative answer: manifests gone upstream are
/// deleted locally, tags are reconciled.
pub struct ManifestSync;

#[async_trait]
impl Job for ManifestSync {
    fn name(&self) -> &'static str {
        "manifest-sync"
    }

    async fn execute_one(&self, state: &AppState) -> Result<JobOutcome, JobError> {
        let now = crate::db::now();
        let repo: Option<Repository> = sqlx::query_as(
            "UPDATE repos SET next_manifest_sync_at = $2
             WHERE id = (
                 SELECT r.id FROM repos r
                 JOIN accounts a ON r.account_name = a.name
                 WHERE a.upstream_peer_hostname IS NOT NULL
                   AND (r.next_manifest_sync_at IS NULL OR r.next_manifest_sync_at < $1)
                 ORDER BY r.next_manifest_sync_at ASC NULLS FIRST
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING *",
        )
        .bind(now)
        .bind(now + MANIFEST_SYNC_INTERVAL)
        .fetch_optional(state.db.pool())
        .await?;
        let Some(repo) = repo else {
            return Ok(JobOutcome::NothingToDo);
        };

        let mut conn = state.db.pool().acquire().await?;
        let Some(account) = queries::get_account(&mut *conn, &repo.account_name).await? else {
            return Ok(JobOutcome::DidWork);
        };
        let Some(peer_hostname) = account.upstream_peer_hostname.clone() else {
            return Ok(JobOutcome::DidWork);
        };

        let manifests: Vec<Manifest> =
            sqlx::query_as("SELECT * FROM manifests WHERE repo_id = $1")
                .bind(repo.id)
                .fetch_all(&mut *conn)
                .await?;
        let tags: Vec<Tag> = sqlx::query_as("SELECT * FROM tags WHERE repo_id = $1")
            .bind(repo.id)
            .fetch_all(&mut *conn)
            .await?;
        drop(conn);

        let payload = ReplicaSyncPayload {
            manifests: manifests
                .iter()
                .map(|manifest| ManifestSyncEntry {
                    digest: manifest.digest.clone(),
                    last_pulled_at: manifest.last_pulled_at,
                    tags: tags
                        .iter()
                        .filter(|tag| tag.digest == manifest.digest)
                        .map(|tag| TagSyncEntry {
                            name: tag.name.clone(),
                            last_pulled_at: tag.last_pulled_at,
                        })
                        .collect(),
                })
                .collect(),
        };

        let token = crate::peering::get_peer_token(state, &peer_hostname, "keppel_api:peer:access")
            .await
            .map_err(job_error)?;
        let url = format!(
            "https://{peer_hostname}/peer/v1/sync-replica/{}/{}",
            repo.account_name, repo.name
        );
        let response = state
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|err| job_error(format!("sync-replica request failed: {err}")))?;

        let repo_path = RepoPath {
            account_name: repo.account_name.clone(),
            repo_name: repo.name.clone(),
        };

        // 404 means the whole repo is gone upstream.
        let authoritative: ReplicaSyncPayload = if response.status() == http::StatusCode::NOT_FOUND
        {
            ReplicaSyncPayload::default()
        } else if response.status().is_success() {
            response
                .json()
                .await
                .map_err(|err| job_error(format!("sync-replica response is malformed: {err}")))?
        } else {
            return Err(job_error(format!(
                "sync-replica returned {}",
                response.status()
            )));
        };

        let keep: Vec<&str> = authoritative
            .manifests
            .iter()
            .map(|entry| entry.digest.as_str())
            .collect();
        for manifest in &manifests {
            if !keep.contains(&manifest.digest.as_str()) {
                let digest: Digest = manifest
                    .digest
                    .parse()
                    .map_err(|err| job_error(format!("corrupt digest in database: {err}")))?;
                crate::api::registry::manifests::delete_manifest_core(
                    state, &account, &repo_path, &digest,
                )
                .await?;
                info!(
                    "manifest sync deleted {} from {}/{}",
                    manifest.digest, repo.account_name, repo.name
                );
            }
        }

        // Tags follow the primary exactly: retarget moved ones, drop dead
        // ones. Tags for manifests we have not replicated yet are left for
        // on-demand replication.
        let mut conn = state.db.pool().acquire().await?;
        let mut upstream_tags = Vec::new();
        for entry in &authoritative.manifests {
            for tag in &entry.tags {
                upstream_tags.push(tag.name.as_str());
                let have_manifest = keep.contains(&entry.digest.as_str())
                    && manifests.iter().any(|m| m.digest == entry.digest);
                if have_manifest {
                    sqlx::query(
                        "INSERT INTO tags (repo_id, name, digest, pushed_at)
                         VALUES ($1, $2, $3, $4)
                         ON CONFLICT (repo_id, name) DO UPDATE SET digest = EXCLUDED.digest",
                    )
                    .bind(repo.id)
                    .bind(&tag.name)
                    .bind(&entry.digest)
                    .bind(now)
                    .execute(&mut *conn)
                    .await?;
                }
            }
        }
        for tag in &tags {
            if !upstream_tags.contains(&tag.name.as_str()) {
                sqlx::query("DELETE FROM tags WHERE repo_id = $1 AND name = $2")
                    .bind(repo.id)
                    .bind(&tag.name)
                    .execute(&mut *conn)
                    .await?;
            }
        }

        Ok(JobOutcome::DidWork)
    }
}

/// Retries blob replications that failed mid-way, with the exponential
/// backoff recorded on the pending row.
pub struct PendingBlobRetry;

#[async_trait]
impl Job for PendingBlobRetry {
    fn name(&self) -> &'static str {
        "pending-blob-retry"
    }

    async fn execute_one(&self, state: &AppState) -> Result<JobOutcome, JobError> {
        let now = crate::db::now();
        let pending: Option<PendingBlob> = sqlx::query_as(
            "SELECT * FROM pending_blobs
             WHERE next_check_at < $1
             ORDER BY next_check_at ASC
             LIMIT 1",
        )
        .bind(now)
        .fetch_optional(state.db.pool())
        .await?;
        let Some(pending) = pending else {
            return Ok(JobOutcome::NothingToDo);
        };

        let mut conn = state.db.pool().acquire().await?;
        let Some(account) = queries::get_account(&mut *conn, &pending.account_name).await? else {
            sqlx::query("DELETE FROM pending_blobs WHERE account_name = $1 AND digest = $2")
                .bind(&pending.account_name)
                .bind(&pending.digest)
                .execute(&mut *conn)
                .await?;
            return Ok(JobOutcome::DidWork);
        };
        drop(conn);

        let digest: Digest = pending
            .digest
            .parse()
            .map_err(|err| job_error(format!("corrupt digest in pending blob: {err}")))?;
        let repo_path = RepoPath {
            account_name: account.name.clone(),
            repo_name: pending.repo_name.clone(),
        };
        // replicate_blob clears the pending row on success and bumps the
        // backoff on failure.
        match crate::replication::replicate_blob(state, &account, &repo_path, &digest).await {
            Ok(_) => {
                info!("pending blob {digest} replicated into {}", account.name);
                Ok(JobOutcome::DidWork)
            }
            Err(err) => Err(job_error(err)),
        }
    }
}

/// Rotates our credential towards the longest-idle peer. The rotation
/// cadence keeps every password younger than ten minutes.
pub struct PeerCredentialRotation;

#[async_trait]
impl Job for PeerCredentialRotation {
    fn name(&self) -> &'static str {
        "peer-credential-rotation"
    }

    async fn execute_one(&self, state: &AppState) -> Result<JobOutcome, JobError> {
        match crate::peering::rotate_one_peer_credential(state).await {
            Ok(Some(hostname)) => {
                debug!("rotated peer credentials towards {hostname}");
                Ok(JobOutcome::DidWork)
            }
            Ok(None) => Ok(JobOutcome::NothingToDo),
            Err(err) => Err(job_error(err)),
        }
    }
}
