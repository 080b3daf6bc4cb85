use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::prelude::{Engine, BASE64_STANDARD};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;

/// Permission: everything the core ever asks an identity about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ViewAccount,
    PullFromAccount,
    PushToAccount,
    DeleteFromAccount,
    ChangeAccount,
    ViewQuotas,
    ChangeQuotas,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum IdentityKind {
    Regular,
    Anonymous,
    Peer,
}

#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid credentials")]
    Unauthorized,
    #[error("too many authentication attempts")]
    TooManyRequests { retry_after_seconds: u64 },
    #[error("identity provider failure: {raw_error_message}")]
    Internal { raw_error_message: String },
}

/// UserIdentity: the authenticated principal. Implementations must be
/// serializable into a compact payload so tokens can embed them, and
/// rehydratable from that payload on any peer.
pub trait UserIdentity: Send + Sync {
    fn kind(&self) -> IdentityKind;
    /// The user name as it appears in token subjects and RBAC matching.
    /// Empty for anonymous; `replication@<hostname>` for peers.
    fn name(&self) -> String;
    fn has_permission(&self, permission: Permission, auth_tenant_id: &str) -> bool;
    /// Compact self-describing payload for token embedding.
    fn serialize_payload(&self) -> serde_json::Value;
}

/// AuthDriver: the identity provider plug-point. Production deployments put
/// Keystone or OIDC behind this; the core only sees the trait.
#[async_trait]
pub trait AuthDriver: Send + Sync {
    async fn authenticate_user(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn UserIdentity>, AuthError>;

    /// Authenticates from request headers (e.g. `X-Auth-Token`). Returns
    /// Ok(None) if the request carries no credentials this driver handles.
    async fn authenticate_from_request(
        &self,
        headers: &HeaderMap,
    ) -> Result<Option<Box<dyn UserIdentity>>, AuthError>;

    /// Validates a tenant id at account creation time.
    fn validate_tenant_id(&self, auth_tenant_id: &str) -> Result<(), String>;
}

/// Parses an HTTP Basic Authorization header into (username, password).
pub fn parse_basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64_STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

// ---------------------------------------------------------------------------
// identity implementations

#[derive(Clone, Debug, Default)]
pub struct AnonymousIdentity;

impl UserIdentity for AnonymousIdentity {
    fn kind(&self) -> IdentityKind {
        IdentityKind::Anonymous
    }
    fn name(&self) -> String {
        String::new()
    }
    fn has_permission(&self, _permission: Permission, _auth_tenant_id: &str) -> bool {
        false
    }
    fn serialize_payload(&self) -> serde_json::Value {
        serde_json::json!({ "kind": "anonymous" })
    }
}

/// PeerIdentity: another keppel authenticated as `replication@<hostname>`.
/// Peers do not hold tenant permissions; peer-only endpoints check the kind.
#[derive(Clone, Debug)]
pub struct PeerIdentity {
    pub peer_hostname: String,
}

impl UserIdentity for PeerIdentity {
    fn kind(&self) -> IdentityKind {
        IdentityKind::Peer
    }
    fn name(&self) -> String {
        format!("replication@{}", self.peer_hostname)
    }
    fn has_permission(&self, _permission: Permission, _auth_tenant_id: &str) -> bool {
        false
    }
    fn serialize_payload(&self) -> serde_json::Value {
        serde_json::json!({ "kind": "peer", "hostname": self.peer_hostname })
    }
}

/// TrivialIdentity: a user with an explicit per-tenant permission table, as
/// produced by the trivial auth driver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrivialIdentity {
    pub username: String,
    /// tenant id -> granted permissions
    pub grants: HashMap<String, Vec<Permission>>,
}

impl UserIdentity for TrivialIdentity {
    fn kind(&self) -> IdentityKind {
        IdentityKind::Regular
    }
    fn name(&self) -> String {
        self.username.clone()
    }
    fn has_permission(&self, permission: Permission, auth_tenant_id: &str) -> bool {
        self.grants
            .get(auth_tenant_id)
            .is_some_and(|granted| granted.contains(&permission))
    }
    fn serialize_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": "regular",
            "username": self.username,
            "grants": self.grants,
        })
    }
}

/// Rehydrates an identity from the payload embedded in a token. The inverse
/// of `UserIdentity::serialize_payload`.
pub fn deserialize_identity(payload: &serde_json::Value) -> Result<Box<dyn UserIdentity>, String> {
    match payload.get("kind").and_then(|kind| kind.as_str()) {
        Some("anonymous") => Ok(Box::new(AnonymousIdentity)),
        Some("peer") => {
            let hostname = payload
                .get("hostname")
                .and_then(|value| value.as_str())
                .ok_or("peer identity payload lacks hostname")?;
            Ok(Box::new(PeerIdentity {
                peer_hostname: hostname.to_string(),
            }))
        }
        Some("regular") => {
            let identity: TrivialIdentity = serde_json::from_value(payload.clone())
                .map_err(|err| format!("malformed regular identity payload: {err}"))?;
            Ok(Box::new(identity))
        }
        other => Err(format!("unknown identity kind {other:?}")),
    }
}

// ---------------------------------------------------------------------------
// trivial driver

struct TrivialUser {
    password: String,
    identity: TrivialIdentity,
}

/// TrivialAuthDriver: a static user table. Useful for development and for
/// tests; real identity lives behind an out-of-tree driver.
#[derive(Default)]
pub struct TrivialAuthDriver {
    users: HashMap<String, TrivialUser>,
}

impl TrivialAuthDriver {
    pub fn new() -> Self {
        TrivialAuthDriver::default()
    }

    pub fn with_user(
        mut self,
        username: &str,
        password: &str,
        grants: HashMap<String, Vec<Permission>>,
    ) -> Self {
        self.users.insert(
            username.to_string(),
            TrivialUser {
                password: password.to_string(),
                identity: TrivialIdentity {
                    username: username.to_string(),
                    grants,
                },
            },
        );
        self
    }
}

#[async_trait]
impl AuthDriver for TrivialAuthDriver {
    async fn authenticate_user(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn UserIdentity>, AuthError> {
        match self.users.get(username) {
            Some(user) if user.password == password => Ok(Box::new(user.identity.clone())),
            _ => Err(AuthError::Unauthorized),
        }
    }

    async fn authenticate_from_request(
        &self,
        headers: &HeaderMap,
    ) -> Result<Option<Box<dyn UserIdentity>>, AuthError> {
        match parse_basic_auth(headers) {
            None => Ok(None),
            Some((username, password)) => self
                .authenticate_user(&username, &password)
                .await
                .map(Some),
        }
    }

    fn validate_tenant_id(&self, auth_tenant_id: &str) -> Result<(), String> {
        if auth_tenant_id.is_empty() {
            Err("tenant id must not be empty".to_string())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn full_grants(tenant: &str) -> HashMap<String, Vec<Permission>> {
        let mut grants = HashMap::new();
        grants.insert(
            tenant.to_string(),
            vec![
                Permission::ViewAccount,
                Permission::PullFromAccount,
                Permission::PushToAccount,
                Permission::DeleteFromAccount,
                Permission::ChangeAccount,
                Permission::ViewQuotas,
                Permission::ChangeQuotas,
            ],
        );
        grants
    }

    #[tokio::test]
    async fn trivial_driver_authenticates_configured_users() {
        let driver =
            TrivialAuthDriver::new().with_user("jane", "secret", full_grants("tenant1"));
        let identity = driver.authenticate_user("jane", "secret").await.unwrap();
        assert!(identity.has_permission(Permission::PushToAccount, "tenant1"));
        assert!(!identity.has_permission(Permission::PushToAccount, "tenant2"));
        assert_eq!(
            driver.authenticate_user("jane", "wrong").await.err(),
            Some(AuthError::Unauthorized)
        );
    }

    #[test]
    fn identities_survive_serialization() {
        let identity = TrivialIdentity {
            username: "jane".into(),
            grants: full_grants("tenant1"),
        };
        let restored = deserialize_identity(&identity.serialize_payload()).unwrap();
        assert_eq!(restored.kind(), IdentityKind::Regular);
        assert_eq!(restored.name(), "jane");
        assert!(restored.has_permission(Permission::ViewAccount, "tenant1"));

        let peer = PeerIdentity {
            peer_hostname: "peer.example.org".into(),
        };
        let restored = deserialize_identity(&peer.serialize_payload()).unwrap();
        assert_eq!(restored.name(), "replication@peer.example.org");
        assert_eq!(restored.kind(), IdentityKind::Peer);
    }

    #[test]
    fn basic_auth_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            // jane:secret
            "Basic amFuZTpzZWNyZXQ=".parse().unwrap(),
        );
        assert_eq!(
            parse_basic_auth(&headers),
            Some(("jane".to_string(), "secret".to_string()))
        );
    }
}
