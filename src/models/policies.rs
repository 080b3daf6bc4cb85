use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum PolicyError {
    #[error("invalid regex in `{field}`: {raw_error_message}")]
    InvalidRegex { field: String, raw_error_message: String },
    #[error("invalid CIDR in `match_cidr`: {raw_error_message}")]
    InvalidCidr { raw_error_message: String },
    #[error("policy grants no permissions")]
    NoPermissions,
    #[error("policy `{field}` requires `{requires}` to be set as well")]
    MissingCompanionField { field: String, requires: String },
}

/// RbacPermission: what an RBAC policy may grant to matching requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RbacPermission {
    AnonymousPull,
    AnonymousFirstPull,
    Pull,
    Push,
    Delete,
}

/// RbacPolicy: one entry of an account's RBAC policy list. All matchers that
/// are present must match for the policy to apply.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RbacPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_cidr: Option<String>,
    pub permissions: Vec<RbacPermission>,
}

/// Anchors a user-supplied regex so that `foo` does not match `foobar/baz`.
fn anchored(pattern: &str) -> String {
    format!("^(?:{pattern})$")
}

fn compile_matcher(field: &str, pattern: &str) -> Result<Regex, PolicyError> {
    Regex::new(&anchored(pattern)).map_err(|err| PolicyError::InvalidRegex {
        field: field.to_string(),
        raw_error_message: err.to_string(),
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Cidr {
    network: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    fn parse(raw: &str) -> Result<Self, PolicyError> {
        let err = |message: &str| PolicyError::InvalidCidr {
            raw_error_message: message.to_string(),
        };
        let (addr_part, len_part) = raw.split_once('/').ok_or_else(|| err("missing /prefix"))?;
        let network: IpAddr = addr_part.parse().map_err(|_| err("invalid address"))?;
        let prefix_len: u8 = len_part.parse().map_err(|_| err("invalid prefix length"))?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(err("prefix length out of range"));
        }
        Ok(Cidr { network, prefix_len })
    }

    fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(network), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(self.prefix_len))
                };
                (u32::from(network) & mask) == (u32::from(addr) & mask)
            }
            (IpAddr::V6(network), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(self.prefix_len))
                };
                (u128::from(network) & mask) == (u128::from(addr) & mask)
            }
            _ => false,
        }
    }
}

impl RbacPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.permissions.is_empty() {
            return Err(PolicyError::NoPermissions);
        }
        if let Some(pattern) = &self.match_repository {
            compile_matcher("match_repository", pattern)?;
        }
        if let Some(pattern) = &self.match_username {
            compile_matcher("match_username", pattern)?;
        }
        if let Some(raw) = &self.match_cidr {
            Cidr::parse(raw)?;
        }
        let grants_anonymous = self.permissions.iter().any(|p| {
            matches!(
                p,
                RbacPermission::AnonymousPull | RbacPermission::AnonymousFirstPull
            )
        });
        if grants_anonymous && self.match_username.is_some() {
            return Err(PolicyError::MissingCompanionField {
                field: "anonymous_pull".into(),
                requires: "no match_username".into(),
            });
        }
        Ok(())
    }

    /// Whether this policy applies to the given request context. Validation
    /// has already happened at policy-write time; malformed matchers never
    /// match here.
    pub fn matches(&self, repo_name: &str, user_name: &str, source_addr: Option<IpAddr>) -> bool {
        if let Some(pattern) = &self.match_repository {
            match compile_matcher("match_repository", pattern) {
                Ok(re) if re.is_match(repo_name) => {}
                _ => return false,
            }
        }
        if let Some(pattern) = &self.match_username {
            match compile_matcher("match_username", pattern) {
                Ok(re) if re.is_match(user_name) => {}
                _ => return false,
            }
        }
        if let Some(raw) = &self.match_cidr {
            match (Cidr::parse(raw), source_addr) {
                (Ok(cidr), Some(addr)) if cidr.contains(addr) => {}
                _ => return false,
            }
        }
        true
    }

    pub fn grants(&self, permission: RbacPermission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// GcPolicy: one entry of an account's garbage-collection policy list.
/// Policies are evaluated in declaration order; the first one whose matchers
/// apply decides the manifest's fate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GcPolicy {
    pub match_repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except_repository: Option<String>,
    /// Only manifests whose pushed_at is at least this many seconds in the
    /// past are eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub older_than_seconds: Option<i64>,
    #[serde(default)]
    pub only_untagged: bool,
    /// Manifests pulled within this many seconds are protected regardless of
    /// the other matchers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protect_recently_pulled_seconds: Option<i64>,
    pub action: GcAction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcAction {
    Delete,
    Protect,
}

pub enum GcDecision {
    Delete,
    Protect,
    NoMatch,
}

impl GcPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        compile_matcher("match_repository", &self.match_repository)?;
        if let Some(pattern) = &self.except_repository {
            compile_matcher("except_repository", pattern)?;
        }
        Ok(())
    }

    pub fn evaluate(
        &self,
        repo_name: &str,
        is_tagged: bool,
        pushed_at: DateTime<Utc>,
        last_pulled_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> GcDecision {
        match compile_matcher("match_repository", &self.match_repository) {
            Ok(re) if re.is_match(repo_name) => {}
            _ => return GcDecision::NoMatch,
        }
        if let Some(pattern) = &self.except_repository {
            if let Ok(re) = compile_matcher("except_repository", pattern) {
                if re.is_match(repo_name) {
                    return GcDecision::NoMatch;
                }
            }
        }
        if self.only_untagged && is_tagged {
            return GcDecision::NoMatch;
        }
        if let Some(age) = self.older_than_seconds {
            if pushed_at + Duration::seconds(age) > now {
                return GcDecision::NoMatch;
            }
        }
        if let Some(window) = self.protect_recently_pulled_seconds {
            if let Some(pulled) = last_pulled_at {
                if pulled + Duration::seconds(window) > now {
                    return GcDecision::Protect;
                }
            }
        }
        match self.action {
            GcAction::Delete => GcDecision::Delete,
            GcAction::Protect => GcDecision::Protect,
        }
    }
}

/// Platform: one entry of a replica account's platform filter, in the OCI
/// platform object shape.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "os.features", default, skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// All fields specified in the filter entry must equal the descriptor's.
    pub fn includes(&self, candidate: &Platform) -> bool {
        if !self.os.is_empty() && self.os != candidate.os {
            return false;
        }
        if !self.architecture.is_empty() && self.architecture != candidate.architecture {
            return false;
        }
        if let Some(version) = &self.os_version {
            if Some(version) != candidate.os_version.as_ref() {
                return false;
            }
        }
        if let Some(features) = &self.os_features {
            if Some(features) != candidate.os_features.as_ref() {
                return false;
            }
        }
        if let Some(variant) = &self.variant {
            if Some(variant) != candidate.variant.as_ref() {
                return false;
            }
        }
        true
    }
}

/// PlatformFilter: empty means "replicate everything".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformFilter(pub Vec<Platform>);

impl PlatformFilter {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn includes(&self, candidate: &Platform) -> bool {
        self.0.is_empty() || self.0.iter().any(|entry| entry.includes(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(perms: Vec<RbacPermission>) -> RbacPolicy {
        RbacPolicy {
            match_repository: Some("library/.*".into()),
            match_username: None,
            match_cidr: None,
            permissions: perms,
        }
    }

    #[test]
    fn rbac_matchers_are_anchored() {
        let p = policy(vec![RbacPermission::AnonymousPull]);
        assert!(p.matches("library/alpine", "", None));
        assert!(!p.matches("not-library/alpine", "", None));
        assert!(!p.matches("xlibrary/alpine", "", None));
    }

    #[test]
    fn rbac_cidr_matching() {
        let p = RbacPolicy {
            match_cidr: Some("10.1.0.0/16".into()),
            permissions: vec![RbacPermission::Pull],
            ..Default::default()
        };
        assert!(p.matches("any/repo", "user", Some("10.1.2.3".parse().unwrap())));
        assert!(!p.matches("any/repo", "user", Some("10.2.0.1".parse().unwrap())));
        assert!(!p.matches("any/repo", "user", None));
    }

    #[test]
    fn rbac_validation_rejects_empty_permissions() {
        let p = RbacPolicy::default();
        assert_eq!(p.validate(), Err(PolicyError::NoPermissions));
    }

    #[test]
    fn gc_policy_first_match_semantics() {
        let now = Utc::now();
        let old_push = now - Duration::days(30);
        let p = GcPolicy {
            match_repository: ".*".into(),
            except_repository: None,
            older_than_seconds: Some(7 * 86400),
            only_untagged: true,
            protect_recently_pulled_seconds: Some(86400),
            action: GcAction::Delete,
        };
        // untagged, old, never pulled: delete
        assert!(matches!(
            p.evaluate("foo", false, old_push, None, now),
            GcDecision::Delete
        ));
        // tagged: no match
        assert!(matches!(
            p.evaluate("foo", true, old_push, None, now),
            GcDecision::NoMatch
        ));
        // pulled an hour ago: protected
        assert!(matches!(
            p.evaluate("foo", false, old_push, Some(now - Duration::hours(1)), now),
            GcDecision::Protect
        ));
    }

    #[test]
    fn platform_filter_matches_specified_fields_only() {
        let filter = PlatformFilter(vec![Platform {
            os: "linux".into(),
            architecture: "amd64".into(),
            ..Default::default()
        }]);
        let amd = Platform {
            os: "linux".into(),
            architecture: "amd64".into(),
            variant: Some("v2".into()),
            ..Default::default()
        };
        let arm = Platform {
            os: "linux".into(),
            architecture: "arm64".into(),
            ..Default::default()
        };
        assert!(filter.includes(&amd));
        assert!(!filter.includes(&arm));
        assert!(PlatformFilter::default().includes(&arm));
    }
}
