pub mod token;

use std::fmt::{self, Display, Formatter};
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::drivers::auth::{IdentityKind, Permission, UserIdentity};
use crate::models::account::Account;
use crate::models::policies::RbacPermission;

/// Scope: one `(resourceType, resourceName, actions)` triplet, as it appears
/// in token requests and token payloads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(rename = "name")]
    pub resource_name: String,
    pub actions: Vec<String>,
}

#[derive(Clone, Error, Debug, PartialEq, Eq)]
#[error("invalid scope syntax: `{raw}`")]
pub struct ScopeParseError {
    pub raw: String,
}

impl Scope {
    pub fn new(resource_type: &str, resource_name: &str, actions: &[&str]) -> Self {
        Scope {
            resource_type: resource_type.to_string(),
            resource_name: resource_name.to_string(),
            actions: actions.iter().map(|action| action.to_string()).collect(),
        }
    }

    pub fn repository(repo_path: &str, actions: &[&str]) -> Self {
        Scope::new("repository", repo_path, actions)
    }

    pub fn contains_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a == action)
    }
}

impl FromStr for Scope {
    type Err = ScopeParseError;

    /// Parses `resourceType:resourceName:action1,action2`. The resource name
    /// itself never contains a colon in our grammar, but `registry:catalog:*`
    /// and friends require splitting from both ends.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let err = || ScopeParseError { raw: raw.to_string() };
        let (resource_type, rest) = raw.split_once(':').ok_or_else(err)?;
        let (resource_name, actions) = rest.rsplit_once(':').ok_or_else(err)?;
        if resource_type.is_empty() || resource_name.is_empty() || actions.is_empty() {
            return Err(err());
        }
        Ok(Scope {
            resource_type: resource_type.to_string(),
            resource_name: resource_name.to_string(),
            actions: actions
                .split(',')
                .filter(|action| !action.is_empty())
                .map(|action| action.to_string())
                .collect(),
        })
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.resource_type,
            self.resource_name,
            self.actions.join(",")
        )
    }
}

/// ScopeSet: the granted scopes inside a validated token.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeSet(pub Vec<Scope>);

impl ScopeSet {
    pub fn grants(&self, resource_type: &str, resource_name: &str, action: &str) -> bool {
        self.0.iter().any(|scope| {
            scope.resource_type == resource_type
                && scope.resource_name == resource_name
                && scope.contains_action(action)
        })
    }

    pub fn push_nonempty(&mut self, scope: Scope) {
        if !scope.actions.is_empty() {
            self.0.push(scope);
        }
    }
}

/// Authorization: the result of validating a bearer token: who is acting,
/// and what the token lets them do.
pub struct Authorization {
    pub identity: Box<dyn UserIdentity>,
    pub scopes: ScopeSet,
    /// `keppel-api@<hostname>` of the issuing peer.
    pub issuer: String,
}

impl Authorization {
    pub fn is_peer(&self) -> bool {
        self.identity.kind() == IdentityKind::Peer
    }

    pub fn peer_hostname(&self) -> Option<String> {
        if self.is_peer() {
            self.identity.name().strip_prefix("replication@").map(str::to_string)
        } else {
            None
        }
    }
}

/// Builds the `Www-Authenticate: Bearer ...` challenge mirroring the
/// requested scopes, so clients know where to fetch a token.
pub fn bearer_challenge(public_hostname: &str, service: &str, scopes: &[Scope]) -> String {
    let realm = format!("https://{public_hostname}/keppel/v1/auth");
    let mut challenge = format!(r#"Bearer realm="{realm}",service="{service}""#);
    if !scopes.is_empty() {
        let scope_str = scopes
            .iter()
            .map(Scope::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        challenge.push_str(&format!(r#",scope="{scope_str}""#));
    }
    challenge
}

/// The repository actions that can be granted on a repo scope.
pub const REPO_ACTIONS: &[&str] = &["pull", "push", "delete"];

/// Decides which of the requested repository actions this identity gets on
/// this account. Unauthorized actions are dropped silently; the client
/// notices when it tries to use them.
pub fn granted_repository_actions(
    account: &Account,
    repo_name: &str,
    requested: &[String],
    identity: &dyn UserIdentity,
    source_addr: Option<IpAddr>,
) -> Vec<String> {
    let policies = account.rbac_policies();
    let user_name = identity.name();
    let applicable: Vec<_> = policies
        .iter()
        .filter(|policy| policy.matches(repo_name, &user_name, source_addr))
        .collect();

    let mut granted = Vec::new();
    for action in requested {
        let allowed = match (action.as_str(), identity.kind()) {
            // Peers replicate on behalf of their users; they may read
            // everything but never write.
            ("pull", IdentityKind::Peer) => true,
            ("pull", IdentityKind::Anonymous) => applicable.iter().any(|policy| {
                policy.grants(RbacPermission::AnonymousPull)
                    || policy.grants(RbacPermission::AnonymousFirstPull)
            }),
            ("pull", IdentityKind::Regular) => {
                identity.has_permission(Permission::PullFromAccount, &account.auth_tenant_id)
                    || applicable.iter().any(|policy| policy.grants(RbacPermission::Pull))
            }
            ("push", IdentityKind::Regular) => {
                // Replicas only ever receive content through replication.
                !account.is_replica()
                    && (identity.has_permission(Permission::PushToAccount, &account.auth_tenant_id)
                        || applicable.iter().any(|policy| policy.grants(RbacPermission::Push)))
            }
            ("delete", IdentityKind::Regular) => {
                identity.has_permission(Permission::DeleteFromAccount, &account.auth_tenant_id)
                    || applicable.iter().any(|policy| policy.grants(RbacPermission::Delete))
            }
            _ => false,
        };
        if allowed && !granted.contains(action) {
            granted.push(action.clone());
        }
    }
    granted
}

/// Whether an anonymous pull may trigger first-time replication on a
/// replica account. Plain `anonymous_pull` only serves what is already
/// local.
pub fn anonymous_first_pull_allowed(
    account: &Account,
    repo_name: &str,
    source_addr: Option<IpAddr>,
) -> bool {
    account
        .rbac_policies()
        .iter()
        .filter(|policy| policy.matches(repo_name, "", source_addr))
        .any(|policy| policy.grants(RbacPermission::AnonymousFirstPull))
}

/// The keppel_account actions and their permission mapping.
pub fn granted_account_actions(
    account: &Account,
    requested: &[String],
    identity: &dyn UserIdentity,
) -> Vec<String> {
    let tenant = &account.auth_tenant_id;
    requested
        .iter()
        .filter(|action| {
            let needed = match action.as_str() {
                "view" => Permission::ViewAccount,
                "change" | "change_rbac" | "delete" => Permission::ChangeAccount,
                "view_quota" => Permission::ViewQuotas,
                "change_quota" => Permission::ChangeQuotas,
                _ => return false,
            };
            identity.has_permission(needed, tenant)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::auth::{AnonymousIdentity, PeerIdentity, TrivialIdentity};
    use crate::models::policies::RbacPolicy;

    fn account_with_policies(policies: &[RbacPolicy]) -> Account {
        let mut account = crate::models::account::tests::test_account("acc1");
        account.rbac_policies_json = serde_json::to_string(policies).unwrap();
        account
    }

    #[test]
    fn scope_round_trip() {
        let scope: Scope = "repository:acc1/foo:pull,push".parse().unwrap();
        assert_eq!(scope.resource_type, "repository");
        assert_eq!(scope.resource_name, "acc1/foo");
        assert_eq!(scope.actions, vec!["pull", "push"]);
        assert_eq!(scope.to_string(), "repository:acc1/foo:pull,push");

        let catalog: Scope = "registry:catalog:*".parse().unwrap();
        assert_eq!(catalog.resource_name, "catalog");
        assert_eq!(catalog.actions, vec!["*"]);

        assert!("repository".parse::<Scope>().is_err());
        assert!("repository:name".parse::<Scope>().is_err());
    }

    #[test]
    fn challenge_mirrors_requested_scopes() {
        let challenge = bearer_challenge(
            "registry.example.org",
            "registry.example.org",
            &[Scope::repository("acc1/foo", &["pull"])],
        );
        assert_eq!(
            challenge,
            r#"Bearer realm="https://registry.example.org/keppel/v1/auth",service="registry.example.org",scope="repository:acc1/foo:pull""#
        );
    }

    #[test]
    fn anonymous_pull_needs_matching_policy() {
        let account = account_with_policies(&[RbacPolicy {
            match_repository: Some("public/.*".into()),
            permissions: vec![crate::models::policies::RbacPermission::AnonymousPull],
            ..Default::default()
        }]);
        let requested = vec!["pull".to_string(), "push".to_string()];

        let granted = granted_repository_actions(
            &account,
            "public/app",
            &requested,
            &AnonymousIdentity,
            None,
        );
        assert_eq!(granted, vec!["pull"]);

        let granted = granted_repository_actions(
            &account,
            "private/app",
            &requested,
            &AnonymousIdentity,
            None,
        );
        assert!(granted.is_empty());
    }

    #[test]
    fn tenant_permissions_grant_repo_actions() {
        let account = account_with_policies(&[]);
        let identity = TrivialIdentity {
            username: "jane".into(),
            grants: crate::drivers::auth::tests::full_grants("tenant1"),
        };
        let requested: Vec<String> =
            ["pull", "push", "delete"].iter().map(|s| s.to_string()).collect();
        let granted =
            granted_repository_actions(&account, "any/repo", &requested, &identity, None);
        assert_eq!(granted, requested);
    }

    #[test]
    fn replicas_refuse_push_even_for_owners() {
        let mut account = account_with_policies(&[]);
        account.upstream_peer_hostname = Some("peer.example.org".into());
        let identity = TrivialIdentity {
            username: "jane".into(),
            grants: crate::drivers::auth::tests::full_grants("tenant1"),
        };
        let requested: Vec<String> = ["pull", "push"].iter().map(|s| s.to_string()).collect();
        let granted =
            granted_repository_actions(&account, "any/repo", &requested, &identity, None);
        assert_eq!(granted, vec!["pull"]);
    }

    #[test]
    fn peers_get_pull_only() {
        let account = account_with_policies(&[]);
        let peer = PeerIdentity {
            peer_hostname: "peer.example.org".into(),
        };
        let requested: Vec<String> =
            ["pull", "push", "delete"].iter().map(|s| s.to_string()).collect();
        let granted = granted_repository_actions(&account, "any/repo", &requested, &peer, None);
        assert_eq!(granted, vec!["pull"]);
    }
}
