//! Periodic re-validation: stored bytes must still match their digest, and
//! manifest metadata (labels, layer timestamps) is refreshed from the
//! config blob.

use async_trait::async_trait;
use chrono::Duration;

use super::{Job, JobError, JobOutcome};
use crate::api::AppState;
use crate::db::queries;
use crate::digest::Digest;
use crate::manifest::{ImageConfigInfo, ParsedManifest};
use crate::models::{Blob, Manifest};

const VALIDATION_INTERVAL: Duration = Duration::days(7);
/// Failed objects are retried daily so transient storage hiccups heal.
const FAILED_RETRY_INTERVAL: Duration = Duration::hours(24);

/// Re-reads one blob and re-checks its digest.
pub struct BlobValidation;

#[async_trait]
impl Job for BlobValidation {
    fn name(&self) -> &'static str {
        "blob-validation"
    }

    async fn execute_one(&self, state: &AppState) -> Result<JobOutcome, JobError> {
        let now = crate::db::now();
        let blob: Option<Blob> = sqlx::query_as(
            "SELECT * FROM blobs WHERE next_validation_at < $1
             ORDER BY next_validation_at ASC LIMIT 1",
        )
        .bind(now)
        .fetch_optional(state.db.pool())
        .await?;
        let Some(blob) = blob else {
            return Ok(JobOutcome::NothingToDo);
        };

        let outcome = validate_blob_bytes(state, &blob).await;
        let (message, next) = match outcome {
            Ok(()) => (String::new(), now + VALIDATION_INTERVAL),
            Err(message) => {
                warn!("validation of blob {} failed: {message}", blob.digest);
                (message, now + FAILED_RETRY_INTERVAL)
            }
        };
        sqlx::query(
            "UPDATE blobs SET validated_at = $2, validation_error_message = $3,
                              next_validation_at = $4
             WHERE id = $1",
        )
        .bind(blob.id)
        .bind(now)
        .bind(message)
        .bind(next)
        .execute(state.db.pool())
        .await?;
        Ok(JobOutcome::DidWork)
    }
}

async fn validate_blob_bytes(state: &AppState, blob: &Blob) -> Result<(), String> {
    use futures::StreamExt;

    let expected: Digest = blob
        .digest
        .parse()
        .map_err(|err| format!("corrupt digest in database: {err}"))?;
    let contents = state
        .drivers
        .storage
        .read_blob(&blob.account_name, &blob.storage_id)
        .await
        .map_err(|err| format!("cannot read blob from storage: {err}"))?;

    let mut hasher = crate::digest::RunningDigest::default();
    let mut total: i64 = 0;
    let mut stream = contents.stream;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| format!("cannot read blob from storage: {err}"))?;
        hasher.update(&chunk);
        total += chunk.len() as i64;
    }
    if hasher.finish() != expected {
        return Err("blob contents do not match digest".into());
    }
    if total != blob.size_bytes {
        return Err(format!(
            "blob has {total} bytes in storage, but the database says {}",
            blob.size_bytes
        ));
    }
    Ok(())
}

/// Re-reads one manifest: digest check, reference closure check, and
/// metadata extraction from the config blob.
pub struct ManifestValidation;

#[async_trait]
impl Job for ManifestValidation {
    fn name(&self) -> &'static str {
        "manifest-validation"
    }

    async fn execute_one(&self, state: &AppState) -> Result<JobOutcome, JobError> {
        let now = crate::db::now();
        let manifest: Option<Manifest> = sqlx::query_as(
            "SELECT * FROM manifests WHERE next_validation_at < $1
             ORDER BY next_validation_at ASC LIMIT 1",
        )
        .bind(now)
        .fetch_optional(state.db.pool())
        .await?;
        let Some(manifest) = manifest else {
            return Ok(JobOutcome::NothingToDo);
        };

        let outcome = validate_manifest(state, &manifest).await;
        let (message, next) = match outcome {
            Ok(()) => (String::new(), now + VALIDATION_INTERVAL),
            Err(message) => {
                warn!("validation of manifest {} failed: {message}", manifest.digest);
                (message, now + FAILED_RETRY_INTERVAL)
            }
        };
        sqlx::query(
            "UPDATE manifests SET validated_at = $3, validation_error_message = $4,
                                  next_validation_at = $5
             WHERE repo_id = $1 AND digest = $2",
        )
        .bind(manifest.repo_id)
        .bind(&manifest.digest)
        .bind(now)
        .bind(message)
        .bind(next)
        .execute(state.db.pool())
        .await?;
        Ok(JobOutcome::DidWork)
    }
}

async fn validate_manifest(state: &AppState, manifest: &Manifest) -> Result<(), String> {
    let mut conn = state
        .db
        .pool()
        .acquire()
        .await
        .map_err(|err| err.to_string())?;
    let repo: crate::models::Repository = sqlx::query_as("SELECT * FROM repos WHERE id = $1")
        .bind(manifest.repo_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|err| err.to_string())?;

    let expected: Digest = manifest
        .digest
        .parse()
        .map_err(|err| format!("corrupt digest in database: {err}"))?;
    let contents = state
        .drivers
        .storage
        .read_manifest(&repo.account_name, &repo.name, &manifest.digest)
        .await
        .map_err(|err| format!("cannot read manifest from storage: {err}"))?;
    if Digest::of_contents(&contents) != expected {
        return Err("manifest contents do not match digest".into());
    }

    let parsed = ParsedManifest::parse(&manifest.media_type, &contents)
        .map_err(|err| format!("cannot parse stored manifest: {err}"))?;

    // The closure must still hold: all referenced blobs mounted, all
    // referenced submanifests present.
    for descriptor in parsed.blob_references() {
        let mounted = queries::get_mounted_blob(
            &mut *conn,
            repo.id,
            &repo.account_name,
            &descriptor.digest.to_string(),
        )
        .await
        .map_err(|err| err.to_string())?;
        if mounted.is_none() {
            return Err(format!(
                "referenced blob {} is not mounted in this repo",
                descriptor.digest
            ));
        }
    }
    for descriptor in parsed.manifest_references(&Default::default()) {
        let child = queries::get_manifest(&mut *conn, repo.id, &descriptor.digest.to_string())
            .await
            .map_err(|err| err.to_string())?;
        if child.is_none() {
            return Err(format!(
                "referenced submanifest {} does not exist in this repo",
                descriptor.digest
            ));
        }
    }

    // Labels and layer timestamps come out of the config blob; they feed
    // GC policies and the management UI.
    if let ParsedManifest::Image(document) = &parsed {
        let config_blob = queries::get_blob(
            &mut *conn,
            &repo.account_name,
            &document.config.digest.to_string(),
        )
        .await
        .map_err(|err| err.to_string())?;
        if let Some(config_blob) = config_blob {
            let raw = state
                .drivers
                .storage
                .read_blob(&repo.account_name, &config_blob.storage_id)
                .await
                .map_err(|err| format!("cannot read config blob: {err}"))?
                .into_bytes()
                .await
                .map_err(|err| format!("cannot read config blob: {err}"))?;
            if let Ok(info) = ImageConfigInfo::parse(&raw) {
                let labels_json = info
                    .config
                    .labels
                    .as_ref()
                    .and_then(|labels| serde_json::to_string(labels).ok())
                    .unwrap_or_default();
                let (min_created, max_created) = info.layer_created_range();
                sqlx::query(
                    "UPDATE manifests SET labels_json = $3, min_layer_created_at = $4,
                                          max_layer_created_at = $5
                     WHERE repo_id = $1 AND digest = $2",
                )
                .bind(repo.id)
                .bind(&manifest.digest)
                .bind(labels_json)
                .bind(min_created)
                .bind(max_created)
                .execute(&mut *conn)
                .await
                .map_err(|err| err.to_string())?;
            }
        }
    }

    Ok(())
}
