use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;

use crate::models::account::AccountView;

/// AccountManagementDriver: source of truth for declaratively managed
/// accounts. The managed-account janitor reconciles the database against it.
#[async_trait]
pub trait AccountManagementDriver: Send + Sync {
    /// All account names this driver manages. Managed accounts that exist in
    /// the database but are no longer listed here get deleted.
    async fn managed_account_names(&self) -> Result<Vec<String>, String>;

    /// The desired configuration for one managed account, or None if it
    /// should not exist (anymore).
    async fn managed_account(&self, name: &str) -> Result<Option<AccountView>, String>;
}

/// TrivialAccountManagementDriver: manages nothing.
pub struct TrivialAccountManagementDriver;

#[async_trait]
impl AccountManagementDriver for TrivialAccountManagementDriver {
    async fn managed_account_names(&self) -> Result<Vec<String>, String> {
        Ok(Vec::new())
    }

    async fn managed_account(&self, _name: &str) -> Result<Option<AccountView>, String> {
        Ok(None)
    }
}

#[derive(Deserialize)]
struct ManagedAccountsFile {
    accounts: Vec<AccountView>,
}

/// FileAccountManagementDriver: reads the desired account set from a JSON
/// config file. The file is re-read on every call so operators can edit it
/// without restarting the process.
pub struct FileAccountManagementDriver {
    path: PathBuf,
}

impl FileAccountManagementDriver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileAccountManagementDriver { path: path.into() }
    }

    async fn read_file(&self) -> Result<ManagedAccountsFile, String> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| format!("cannot read {}: {err}", self.path.display()))?;
        serde_json::from_str(&raw)
            .map_err(|err| format!("cannot parse {}: {err}", self.path.display()))
    }
}

#[async_trait]
impl AccountManagementDriver for FileAccountManagementDriver {
    async fn managed_account_names(&self) -> Result<Vec<String>, String> {
        let file = self.read_file().await?;
        Ok(file.accounts.into_iter().map(|account| account.name).collect())
    }

    async fn managed_account(&self, name: &str) -> Result<Option<AccountView>, String> {
        let file = self.read_file().await?;
        Ok(file.accounts.into_iter().find(|account| account.name == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn file_driver_reads_account_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"accounts": [{{
                "name": "managed1",
                "auth_tenant_id": "tenant1",
                "rbac_policies": [{{"match_repository": "library/.*", "permissions": ["anonymous_pull"]}}]
            }}]}}"#
        )
        .unwrap();

        let driver = FileAccountManagementDriver::new(file.path());
        assert_eq!(driver.managed_account_names().await.unwrap(), vec!["managed1"]);

        let account = driver.managed_account("managed1").await.unwrap().unwrap();
        assert_eq!(account.auth_tenant_id, "tenant1");
        assert_eq!(account.rbac_policies.len(), 1);

        assert!(driver.managed_account("other").await.unwrap().is_none());
    }
}
