use async_trait::async_trait;
use chrono::Duration;

use super::{Job, JobError, JobOutcome};
use crate::api::AppState;
use crate::models::Upload;

/// Uploads that saw no traffic for a day are dead; docker clients do not
/// resume across days. The partial chunks in storage go first, then the row.
pub struct AbandonedUploadCleanup;

const ABANDON_AFTER: Duration = Duration::hours(24);

#[async_trait]
impl Job for AbandonedUploadCleanup {
    fn name(&self) -> &'static str {
        "abandoned-upload-cleanup"
    }

    async fn execute_one(&self, state: &AppState) -> Result<JobOutcome, JobError> {
        let deadline = crate::db::now() - ABANDON_AFTER;
        let mut tx = state.db.begin().await?;
        let upload: Option<Upload> = sqlx::query_as(
            "SELECT u.* FROM uploads u
             WHERE u.updated_at < $1
             ORDER BY u.updated_at ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(deadline)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(upload) = upload else {
            return Ok(JobOutcome::NothingToDo);
        };

        let (account_name,): (String,) =
            sqlx::query_as("SELECT account_name FROM repos WHERE id = $1")
                .bind(upload.repo_id)
                .fetch_one(&mut *tx)
                .await?;

        if let Err(err) = state
            .drivers
            .storage
            .abort_blob_upload(&account_name, &upload.storage_id, upload.num_chunks as u32)
            .await
        {
            if !err.is_not_found() {
                return Err(super::job_error(err));
            }
        }
        sqlx::query("DELETE FROM uploads WHERE repo_id = $1 AND uuid = $2")
            .bind(upload.repo_id)
            .bind(upload.uuid)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!("removed abandoned upload {} from {account_name}", upload.uuid);
        Ok(JobOutcome::DidWork)
    }
}
