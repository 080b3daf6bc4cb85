use async_trait::async_trait;
use chrono::Duration;

use super::{job_error, Job, JobError, JobOutcome};
use crate::api::AppState;
use crate::models::Account;

const ANNOUNCEMENT_INTERVAL: Duration = Duration::hours(1);

/// Heartbeats every local account into the federation. Drift (the
/// federation believing someone else owns our account) surfaces here as a
/// logged error and a backoff, never as a silent correction.
pub struct FederationAnnouncement;

#[async_trait]
impl Job for FederationAnnouncement {
    fn name(&self) -> &'static str {
        "federation-announcement"
    }

    async fn execute_one(&self, state: &AppState) -> Result<JobOutcome, JobError> {
        let now = crate::db::now();
        let account: Option<Account> = sqlx::query_as(
            "UPDATE accounts SET next_federation_announcement_at = $2
             WHERE name = (
                 SELECT name FROM accounts
                 WHERE next_federation_announcement_at IS NULL
                    OR next_federation_announcement_at < $1
                 ORDER BY next_federation_announcement_at ASC NULLS FIRST
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING *",
        )
        .bind(now)
        .bind(now + ANNOUNCEMENT_INTERVAL)
        .fetch_optional(state.db.pool())
        .await?;
        let Some(account) = account else {
            return Ok(JobOutcome::NothingToDo);
        };

        state
            .drivers
            .federation
            .record_existing_account(
                &account.name,
                &state.config.api_public_hostname,
                account.is_replica(),
                now,
            )
            .await
            .map_err(|err| {
                job_error(format!(
                    "federation announcement for {} failed: {err}",
                    account.name
                ))
            })?;
        Ok(JobOutcome::DidWork)
    }
}
