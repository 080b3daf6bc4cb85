use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{job_error, Job, JobError, JobOutcome};
use crate::api::AppState;
use crate::db::queries;
use crate::drivers::ClaimResult;
use crate::models::account::ReplicationView;
use crate::models::Account;

const ENFORCEMENT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Reconciles the database against the declarative account config: managed
/// accounts are created and updated to match, and deleted once they vanish
/// from the config (as soon as they are empty).
#[derive(Default)]
pub struct ManagedAccountEnforcement {
    last_run: Mutex<Option<Instant>>,
}

#[async_trait]
impl Job for ManagedAccountEnforcement {
    fn name(&self) -> &'static str {
        "managed-account-enforcement"
    }

    async fn execute_one(&self, state: &AppState) -> Result<JobOutcome, JobError> {
        {
            let mut last_run = self.last_run.lock().await;
            if let Some(last) = *last_run {
                if last.elapsed() < ENFORCEMENT_INTERVAL {
                    return Ok(JobOutcome::NothingToDo);
                }
            }
            *last_run = Some(Instant::now());
        }

        let driver = &state.drivers.account_management;
        let desired_names = driver.managed_account_names().await.map_err(job_error)?;

        for name in &desired_names {
            let desired = driver.managed_account(name).await.map_err(job_error)?;
            let Some(desired) = desired else { continue };

            let existing = {
                let mut conn = state.db.pool().acquire().await?;
                queries::get_account(&mut *conn, name).await?
            };
            match existing {
                None => {
                    let claim = state
                        .drivers
                        .federation
                        .claim_account_name(name, &state.config.api_public_hostname, None)
                        .await
                        .map_err(job_error)?;
                    if let ClaimResult::Failed { reason } = claim {
                        warn!("cannot create managed account {name}: {reason}");
                        continue;
                    }
                    let upstream = match &desired.replication {
                        Some(ReplicationView::OnFirstUse { upstream }) => Some(upstream.clone()),
                        _ => None,
                    };
                    sqlx::query(
                        "INSERT INTO accounts (name, auth_tenant_id, upstream_peer_hostname,
                                               rbac_policies_json, gc_policies_json,
                                               required_labels, is_managed)
                         VALUES ($1, $2, $3, $4, $5, $6, TRUE)
                         ON CONFLICT (name) DO NOTHING",
                    )
                    .bind(name)
                    .bind(&desired.auth_tenant_id)
                    .bind(&upstream)
                    .bind(serde_json::to_string(&desired.rbac_policies).unwrap_or_else(|_| "[]".into()))
                    .bind(serde_json::to_string(&desired.gc_policies).unwrap_or_else(|_| "[]".into()))
                    .bind(&desired.required_labels)
                    .execute(state.db.pool())
                    .await?;
                    info!("created managed account {name}");
                }
                Some(_) => {
                    sqlx::query(
                        "UPDATE accounts
                         SET rbac_policies_json = $2, gc_policies_json = $3,
                             required_labels = $4, is_managed = TRUE
                         WHERE name = $1",
                    )
                    .bind(name)
                    .bind(serde_json::to_string(&desired.rbac_policies).unwrap_or_else(|_| "[]".into()))
                    .bind(serde_json::to_string(&desired.gc_policies).unwrap_or_else(|_| "[]".into()))
                    .bind(&desired.required_labels)
                    .execute(state.db.pool())
                    .await?;
                }
            }
        }

        // Managed accounts that left the config get deleted once empty. Non-
        // empty ones go into maintenance so they drain.
        let managed: Vec<Account> =
            sqlx::query_as("SELECT * FROM accounts WHERE is_managed = TRUE")
                .fetch_all(state.db.pool())
                .await?;
        for account in managed {
            if desired_names.contains(&account.name) {
                continue;
            }
            let (manifests,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM manifests m JOIN repos r ON m.repo_id = r.id
                 WHERE r.account_name = $1",
            )
            .bind(&account.name)
            .fetch_one(state.db.pool())
            .await?;
            let (blobs,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM blobs WHERE account_name = $1")
                    .bind(&account.name)
                    .fetch_one(state.db.pool())
                    .await?;
            if manifests == 0 && blobs == 0 {
                if let Err(err) = state
                    .drivers
                    .federation
                    .forfeit_account_name(
                        &account.name,
                        &state.config.api_public_hostname,
                        account.is_replica(),
                    )
                    .await
                {
                    warn!("cannot forfeit managed account {}: {err}", account.name);
                    continue;
                }
                sqlx::query("DELETE FROM accounts WHERE name = $1")
                    .bind(&account.name)
                    .execute(state.db.pool())
                    .await?;
                info!("deleted managed account {}", account.name);
            } else if !account.in_maintenance {
                sqlx::query("UPDATE accounts SET in_maintenance = TRUE WHERE name = $1")
                    .bind(&account.name)
                    .execute(state.db.pool())
                    .await?;
                info!(
                    "managed account {} left the config; set to maintenance until empty",
                    account.name
                );
            }
        }

        Ok(JobOutcome::DidWork)
    }
}
