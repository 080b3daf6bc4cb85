//! Background reconciliation loops. Every loop follows the same shape:
//! discover the single most overdue row (`FOR UPDATE SKIP LOCKED`), do the
//! work, reschedule the row, repeat. Failures back off exponentially and
//! never take the process down.

pub mod announce;
pub mod gc;
pub mod managed;
pub mod sweep;
pub mod sync;
pub mod uploads;
pub mod validation;
pub mod vuln;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;

#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Other(String),
}

impl From<crate::errors::RegistryError> for JobError {
    fn from(err: crate::errors::RegistryError) -> Self {
        JobError::Other(err.to_string())
    }
}

pub fn job_error(err: impl std::fmt::Display) -> JobError {
    JobError::Other(err.to_string())
}

/// Whether a job iteration found work. Idle jobs poll slowly; busy jobs
/// immediately look for the next row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    DidWork,
    NothingToDo,
}

/// One background loop. `execute_one` performs a full
/// discover → work → reschedule cycle for a single unit of work.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute_one(&self, state: &AppState) -> Result<JobOutcome, JobError>;
}

const IDLE_INTERVAL: Duration = Duration::from_secs(10);
const BACKOFF_START: Duration = Duration::from_secs(60);
const BACKOFF_CAP: Duration = Duration::from_secs(30 * 60);

/// All janitor loops this binary knows.
pub fn all_jobs() -> Vec<Arc<dyn Job>> {
    vec![
        Arc::new(uploads::AbandonedUploadCleanup),
        Arc::new(sweep::BlobMountSweep),
        Arc::new(sweep::BlobSweep),
        Arc::new(sweep::StorageSweep),
        Arc::new(gc::ManifestGarbageCollection),
        Arc::new(sync::ManifestSync),
        Arc::new(sync::PendingBlobRetry),
        Arc::new(sync::PeerCredentialRotation),
        Arc::new(validation::BlobValidation),
        Arc::new(validation::ManifestValidation),
        Arc::new(managed::ManagedAccountEnforcement::default()),
        Arc::new(vuln::VulnerabilityScanning::default()),
        Arc::new(announce::FederationAnnouncement),
    ]
}

/// Runs every job on its own task until the token is cancelled. Jobs exit
/// at their next loop boundary.
pub fn spawn_all(
    state: AppState,
    jobs: Vec<Arc<dyn Job>>,
    cancel: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    jobs.into_iter()
        .map(|job| {
            let state = state.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { run_job(state, job, cancel).await })
        })
        .collect()
}

async fn run_job(state: AppState, job: Arc<dyn Job>, cancel: CancellationToken) {
    let mut backoff = BACKOFF_START;
    loop {
        let step = tokio::select! {
            _ = cancel.cancelled() => break,
            step = job.execute_one(&state) => step,
        };
        state.counters.janitor_runs.fetch_add(1, Ordering::Relaxed);
        let sleep_for = match step {
            Ok(JobOutcome::DidWork) => {
                backoff = BACKOFF_START;
                continue;
            }
            Ok(JobOutcome::NothingToDo) => {
                backoff = BACKOFF_START;
                IDLE_INTERVAL
            }
            Err(err) => {
                state.counters.janitor_failures.fetch_add(1, Ordering::Relaxed);
                warn!("janitor {} failed: {err}", job.name());
                let sleep_for = backoff;
                backoff = (backoff * 2).min(BACKOFF_CAP);
                sleep_for
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
    debug!("janitor {} stopped", job.name());
}
