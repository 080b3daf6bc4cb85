use async_trait::async_trait;
use chrono::Duration;
use serde::Serialize;

use super::{Job, JobError, JobOutcome};
use crate::api::registry::RepoPath;
use crate::api::AppState;
use crate::db::queries;
use crate::digest::Digest;
use crate::models::policies::GcDecision;
use crate::models::{Manifest, Repository, Tag};

const GC_INTERVAL: Duration = Duration::hours(1);

/// Applies the account's GC policies to one repo at a time. Policies are
/// evaluated in declaration order; the first rule whose matchers apply
/// decides, and the verdict is recorded on the manifest for user
/// visibility.
pub struct ManifestGarbageCollection;

#[derive(Serialize)]
struct GcStatus {
    /// Index of the policy that decided, or absent when none matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    decided_by_policy: Option<usize>,
    verdict: &'static str,
    checked_at: i64,
}

#[async_trait]
impl Job for ManifestGarbageCollection {
    fn name(&self) -> &'static str {
        "manifest-gc"
    }

    async fn execute_one(&self, state: &AppState) -> Result<JobOutcome, JobError> {
        let now = crate::db::now();
        // The row claim is its own small transaction: the actual deletions
        // below take locks of their own.
        let repo: Option<Repository> = sqlx::query_as(
            "UPDATE repos SET next_gc_at = $2
             WHERE id = (
                 SELECT id FROM repos
                 WHERE next_gc_at IS NULL OR next_gc_at < $1
                 ORDER BY next_gc_at ASC NULLS FIRST
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING *",
        )
        .bind(now)
        .bind(now + GC_INTERVAL)
        .fetch_optional(state.db.pool())
        .await?;
        let Some(repo) = repo else {
            return Ok(JobOutcome::NothingToDo);
        };

        let mut conn = state.db.pool().acquire().await?;
        let Some(account) = queries::get_account(&mut *conn, &repo.account_name).await? else {
            return Ok(JobOutcome::DidWork);
        };
        let policies = account.gc_policies();
        if policies.is_empty() {
            return Ok(JobOutcome::DidWork);
        }

        let manifests: Vec<Manifest> =
            sqlx::query_as("SELECT * FROM manifests WHERE repo_id = $1")
                .bind(repo.id)
                .fetch_all(&mut *conn)
                .await?;
        let tags: Vec<Tag> = sqlx::query_as("SELECT * FROM tags WHERE repo_id = $1")
            .bind(repo.id)
            .fetch_all(&mut *conn)
            .await?;
        // Submanifests of a retained index must never be collected from
        // underneath it.
        let child_digests: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT child_digest FROM manifest_manifest_refs WHERE repo_id = $1")
                .bind(repo.id)
                .fetch_all(&mut *conn)
                .await?;
        drop(conn);

        let repo_path = RepoPath {
            account_name: repo.account_name.clone(),
            repo_name: repo.name.clone(),
        };
        for manifest in manifests {
            let is_tagged = tags.iter().any(|tag| tag.digest == manifest.digest);
            let is_child = child_digests.iter().any(|(digest,)| *digest == manifest.digest);

            let mut verdict = "none";
            let mut decided_by_policy = None;
            for (index, policy) in policies.iter().enumerate() {
                match policy.evaluate(
                    &repo.name,
                    is_tagged,
                    manifest.pushed_at,
                    manifest.last_pulled_at,
                    now,
                ) {
                    GcDecision::NoMatch => continue,
                    GcDecision::Protect => {
                        verdict = "protected";
                        decided_by_policy = Some(index);
                        break;
                    }
                    GcDecision::Delete => {
                        verdict = if is_child { "protected" } else { "deleted" };
                        decided_by_policy = Some(index);
                        break;
                    }
                }
            }

            if verdict == "deleted" {
                let digest: Digest = manifest
                    .digest
                    .parse()
                    .map_err(|err| super::job_error(format!("corrupt digest in database: {err}")))?;
                crate::api::registry::manifests::delete_manifest_core(
                    state, &account, &repo_path, &digest,
                )
                .await?;
                info!(
                    "GC deleted manifest {} from {}/{}",
                    manifest.digest, repo.account_name, repo.name
                );
                continue;
            }

            let status = GcStatus {
                decided_by_policy,
                verdict,
                checked_at: now.timestamp(),
            };
            sqlx::query("UPDATE manifests SET gc_status_json = $3 WHERE repo_id = $1 AND digest = $2")
                .bind(repo.id)
                .bind(&manifest.digest)
                .bind(serde_json::to_string(&status).unwrap_or_default())
                .execute(state.db.pool())
                .await?;
        }

        Ok(JobOutcome::DidWork)
    }
}
