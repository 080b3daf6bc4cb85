//! Vulnerability scanning fan-out against the Trivy proxy.

use async_trait::async_trait;
use chrono::Duration;
use serde::Deserialize;

use super::{Job, JobError, JobOutcome};
use crate::api::AppState;
use crate::models::{Manifest, Repository, VulnStatus};

const CHECK_INTERVAL: Duration = Duration::hours(6);
const ERROR_RETRY_INTERVAL: Duration = Duration::minutes(30);
/// How many manifests are scanned concurrently per pass. Trivy is the
/// bottleneck; hammering it does not make reports come faster.
const SCAN_CONCURRENCY: usize = 3;

/// Layers above this size make Trivy fall over; such manifests are reported
/// as Unsupported instead of retried forever.
const MAX_SCANNABLE_BLOB_BYTES: i64 = 10 << 30;

#[derive(Default)]
pub struct VulnerabilityScanning;

#[async_trait]
impl Job for VulnerabilityScanning {
    fn name(&self) -> &'static str {
        "vulnerability-scanning"
    }

    async fn execute_one(&self, state: &AppState) -> Result<JobOutcome, JobError> {
        if state.config.trivy_url.is_none() {
            return Ok(JobOutcome::NothingToDo);
        }

        let now = crate::db::now();
        let due: Vec<Manifest> = sqlx::query_as(
            "UPDATE manifests SET next_vuln_check_at = $2
             WHERE (repo_id, digest) IN (
                 SELECT repo_id, digest FROM manifests
                 WHERE next_vuln_check_at IS NULL OR next_vuln_check_at < $1
                 ORDER BY next_vuln_check_at ASC NULLS FIRST
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING *",
        )
        .bind(now)
        .bind(now + CHECK_INTERVAL)
        .bind(SCAN_CONCURRENCY as i64)
        .fetch_all(state.db.pool())
        .await?;
        if due.is_empty() {
            return Ok(JobOutcome::NothingToDo);
        }

        let scans = due.iter().map(|manifest| scan_one(state, manifest));
        for result in futures::future::join_all(scans).await {
            if let Err(err) = result {
                warn!("vulnerability scan failed: {err}");
            }
        }
        Ok(JobOutcome::DidWork)
    }
}

async fn scan_one(state: &AppState, manifest: &Manifest) -> Result<(), JobError> {
    let repo: Repository = sqlx::query_as("SELECT * FROM repos WHERE id = $1")
        .bind(manifest.repo_id)
        .fetch_one(state.db.pool())
        .await?;

    let (status, error_message) = determine_status(state, &repo, manifest).await;
    let next = match status {
        VulnStatus::Error => crate::db::now() + ERROR_RETRY_INTERVAL,
        _ => crate::db::now() + CHECK_INTERVAL,
    };
    sqlx::query(
        "UPDATE manifests SET vuln_status = $3, vuln_scan_error_message = $4,
                              next_vuln_check_at = $5
         WHERE repo_id = $1 AND digest = $2",
    )
    .bind(manifest.repo_id)
    .bind(&manifest.digest)
    .bind(status.to_string())
    .bind(error_message)
    .bind(next)
    .execute(state.db.pool())
    .await?;
    Ok(())
}

async fn determine_status(
    state: &AppState,
    repo: &Repository,
    manifest: &Manifest,
) -> (VulnStatus, String) {
    // Indexes aggregate their children instead of being scanned themselves.
    let children: Result<Vec<(String,)>, _> = sqlx::query_as(
        "SELECT child_digest FROM manifest_manifest_refs
         WHERE repo_id = $1 AND parent_digest = $2",
    )
    .bind(repo.id)
    .bind(&manifest.digest)
    .fetch_all(state.db.pool())
    .await;
    match children {
        Err(err) => return (VulnStatus::Error, err.to_string()),
        Ok(children) if !children.is_empty() => {
            let mut aggregate = VulnStatus::Unknown;
            for (child_digest,) in children {
                let child_status: Option<(String,)> = sqlx::query_as(
                    "SELECT vuln_status FROM manifests WHERE repo_id = $1 AND digest = $2",
                )
                .bind(repo.id)
                .bind(&child_digest)
                .fetch_optional(state.db.pool())
                .await
                .unwrap_or(None);
                let status = child_status
                    .and_then(|(raw,)| raw.parse().ok())
                    .unwrap_or(VulnStatus::Pending);
                aggregate = aggregate.merge(status);
            }
            return (aggregate, String::new());
        }
        Ok(_) => {}
    }

    // Blobs beyond the scanner's limits taint the whole manifest.
    let oversized: Result<Option<(String,)>, _> = sqlx::query_as(
        "SELECT b.digest FROM blobs b
         JOIN manifest_blob_refs mbr ON mbr.blob_id = b.id
         WHERE mbr.repo_id = $1 AND mbr.manifest_digest = $2 AND b.size_bytes > $3
         LIMIT 1",
    )
    .bind(repo.id)
    .bind(&manifest.digest)
    .bind(MAX_SCANNABLE_BLOB_BYTES)
    .fetch_optional(state.db.pool())
    .await;
    match oversized {
        Err(err) => return (VulnStatus::Error, err.to_string()),
        Ok(Some((blob_digest,))) => {
            return (
                VulnStatus::Unsupported,
                format!("blob {blob_digest} is too large for vulnerability scanning"),
            )
        }
        Ok(None) => {}
    }

    // The scanner is shared with interactive report retrieval; respect the
    // same budget.
    match state
        .drivers
        .rate_limit
        .check(
            &repo.account_name,
            crate::drivers::RateLimitAction::TrivyReportRetrieval,
            "janitor",
            1,
        )
        .await
    {
        Ok(decision) if !decision.allowed => {
            return (VulnStatus::Pending, "trivy budget exhausted; retrying later".into())
        }
        _ => {}
    }

    let image_ref = format!(
        "{}/{}/{}@{}",
        state.config.api_public_hostname, repo.account_name, repo.name, manifest.digest
    );
    match fetch_trivy_report(state, &image_ref).await {
        Ok(status) => (status, String::new()),
        Err(message) => (VulnStatus::Error, message),
    }
}

#[derive(Deserialize)]
struct TrivyReport {
    #[serde(rename = "Results", default)]
    results: Vec<TrivyResult>,
}

#[derive(Deserialize)]
struct TrivyResult {
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Vec<TrivyVulnerability>,
}

#[derive(Deserialize)]
struct TrivyVulnerability {
    #[serde(rename = "Severity", default)]
    severity: String,
}

async fn fetch_trivy_report(state: &AppState, image_ref: &str) -> Result<VulnStatus, String> {
    let base = state
        .config
        .trivy_url
        .as_ref()
        .ok_or_else(|| "trivy is not configured".to_string())?;
    let mut url = base.clone();
    url.query_pairs_mut().append_pair("image", image_ref);

    let mut request = state.http.get(url);
    if let Some(token) = &state.config.trivy_token {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .await
        .map_err(|err| format!("trivy request failed: {err}"))?;
    if !response.status().is_success() {
        return Err(format!("trivy returned {}", response.status()));
    }
    let report: TrivyReport = response
        .json()
        .await
        .map_err(|err| format!("trivy report is malformed: {err}"))?;

    let mut status = VulnStatus::Clean;
    for result in &report.results {
        for vulnerability in &result.vulnerabilities {
            let severity = match vulnerability.severity.as_str() {
                "LOW" => VulnStatus::Low,
                "MEDIUM" => VulnStatus::Medium,
                "HIGH" => VulnStatus::High,
                "CRITICAL" => VulnStatus::Critical,
                _ => VulnStatus::Clean,
            };
            status = status.merge(severity);
        }
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_mapping_takes_the_worst() {
        let mut status = VulnStatus::Clean;
        for severity in [VulnStatus::Low, VulnStatus::Critical, VulnStatus::Medium] {
            status = status.merge(severity);
        }
        assert_eq!(status, VulnStatus::Critical);
    }

    #[test]
    fn trivy_report_parsing() {
        let raw = r#"{"Results": [{"Vulnerabilities": [
            {"Severity": "LOW"}, {"Severity": "HIGH"}
        ]}]}"#;
        let report: TrivyReport = serde_json::from_str(raw).unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].vulnerabilities.len(), 2);
    }
}
