use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::models::policies::{GcPolicy, PlatformFilter, RbacPolicy};

/// Account: a tenant-owned top-level namespace, 1:1 with a storage container.
#[derive(Clone, Debug, FromRow)]
pub struct Account {
    pub name: String,
    pub auth_tenant_id: String,
    /// Set on replica accounts that follow a peer keppel.
    pub upstream_peer_hostname: Option<String>,
    /// Set on replica accounts that follow an external registry.
    pub external_peer_url: Option<String>,
    pub external_peer_username: Option<String>,
    pub external_peer_password: Option<String>,
    pub platform_filter_json: Option<String>,
    pub rbac_policies_json: String,
    pub gc_policies_json: String,
    /// Comma-separated label names that manifests must carry to pass
    /// validation.
    pub required_labels: Option<String>,
    pub in_maintenance: bool,
    pub is_managed: bool,
    pub next_blob_sweep_at: Option<DateTime<Utc>>,
    pub next_storage_sweep_at: Option<DateTime<Utc>>,
    pub next_federation_announcement_at: Option<DateTime<Utc>>,
}

/// ReplicationMode: how content enters this account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Pushes land here directly.
    Primary,
    /// On-demand replication from another keppel in the fleet.
    FromPeer { peer_hostname: String },
    /// On-demand replication from an external registry.
    FromExternal {
        url: String,
        username: Option<String>,
        password: Option<String>,
    },
}

impl Account {
    pub fn replication_mode(&self) -> ReplicationMode {
        if let Some(peer_hostname) = &self.upstream_peer_hostname {
            return ReplicationMode::FromPeer {
                peer_hostname: peer_hostname.clone(),
            };
        }
        if let Some(url) = &self.external_peer_url {
            return ReplicationMode::FromExternal {
                url: url.clone(),
                username: self.external_peer_username.clone(),
                password: self.external_peer_password.clone(),
            };
        }
        ReplicationMode::Primary
    }

    pub fn is_replica(&self) -> bool {
        self.upstream_peer_hostname.is_some() || self.external_peer_url.is_some()
    }

    pub fn rbac_policies(&self) -> Vec<RbacPolicy> {
        serde_json::from_str(&self.rbac_policies_json).unwrap_or_default()
    }

    pub fn gc_policies(&self) -> Vec<GcPolicy> {
        serde_json::from_str(&self.gc_policies_json).unwrap_or_default()
    }

    pub fn platform_filter(&self) -> PlatformFilter {
        self.platform_filter_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    pub fn required_labels(&self) -> Vec<String> {
        self.required_labels
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|label| !label.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The management API representation of an account.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountView {
    pub name: String,
    pub auth_tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationView>,
    #[serde(default)]
    pub rbac_policies: Vec<RbacPolicy>,
    #[serde(default)]
    pub gc_policies: Vec<GcPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_filter: Option<PlatformFilter>,
    #[serde(default)]
    pub in_maintenance: bool,
    #[serde(default)]
    pub is_managed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_labels: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ReplicationView {
    OnFirstUse {
        upstream: String,
    },
    FromExternalOnFirstUse {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
}

impl From<&Account> for AccountView {
    fn from(account: &Account) -> Self {
        let replication = match account.replication_mode() {
            ReplicationMode::Primary => None,
            ReplicationMode::FromPeer { peer_hostname } => Some(ReplicationView::OnFirstUse {
                upstream: peer_hostname,
            }),
            ReplicationMode::FromExternal { url, username, .. } => {
                Some(ReplicationView::FromExternalOnFirstUse {
                    url,
                    username,
                    // Passwords never leave the API.
                    password: None,
                })
            }
        };
        AccountView {
            name: account.name.clone(),
            auth_tenant_id: account.auth_tenant_id.clone(),
            replication,
            rbac_policies: account.rbac_policies(),
            gc_policies: account.gc_policies(),
            platform_filter: if account.platform_filter_json.is_some() {
                Some(account.platform_filter())
            } else {
                None
            },
            in_maintenance: account.in_maintenance,
            is_managed: account.is_managed,
            required_labels: account.required_labels.clone(),
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn test_account(name: &str) -> Account {
        Account {
            name: name.into(),
            auth_tenant_id: "tenant1".into(),
            upstream_peer_hostname: None,
            external_peer_url: None,
            external_peer_username: None,
            external_peer_password: None,
            platform_filter_json: None,
            rbac_policies_json: "[]".into(),
            gc_policies_json: "[]".into(),
            required_labels: None,
            in_maintenance: false,
            is_managed: false,
            next_blob_sweep_at: None,
            next_storage_sweep_at: None,
            next_federation_announcement_at: None,
        }
    }

    #[test]
    fn replication_mode_resolution() {
        let mut account = test_account("acc1");
        assert_eq!(account.replication_mode(), ReplicationMode::Primary);

        account.upstream_peer_hostname = Some("peer.example.org".into());
        assert!(account.is_replica());
        assert_eq!(
            account.replication_mode(),
            ReplicationMode::FromPeer {
                peer_hostname: "peer.example.org".into()
            }
        );
    }

    #[test]
    fn view_hides_external_password() {
        let mut account = test_account("acc1");
        account.external_peer_url = Some("registry-1.docker.io".into());
        account.external_peer_username = Some("bot".into());
        account.external_peer_password = Some("hunter2".into());
        let view = AccountView::from(&account);
        match view.replication {
            Some(ReplicationView::FromExternalOnFirstUse { password, .. }) => {
                assert!(password.is_none())
            }
            other => panic!("unexpected replication view: {other:?}"),
        }
    }
}
