use std::env;
use std::time::Duration;

use thiserror::Error;
use url::Url;

/// RuntimeConfig: process configuration read once at startup and threaded
/// explicitly through constructors. Nothing in here is mutated after boot.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Hostname under which this keppel is reachable by clients and peers.
    pub api_public_hostname: String,
    /// Fleet-wide anycast FQDN, when this instance participates in anycast.
    pub anycast_api_public_hostname: Option<String>,
    pub database_url: String,
    /// PEM-encoded RSA private key used to sign issued tokens.
    pub issuer_key_pem: String,
    /// PEM-encoded RSA public key used to validate tokens. Shared across the
    /// fleet so that anycast tokens verify on every peer.
    pub issuer_public_key_pem: String,
    pub redis_url: Option<String>,
    /// Hostnames of the other keppels in the fleet.
    pub peer_hostnames: Vec<String>,
    pub auth_driver: String,
    pub storage_driver: String,
    pub federation_driver: String,
    /// Backend names for the `chained` federation driver, authoritative
    /// first.
    pub federation_chain: Vec<String>,
    pub inbound_cache_driver: String,
    pub rate_limit_driver: String,
    pub account_management_driver: String,
    /// Root directory for the filesystem storage driver.
    pub storage_path: Option<String>,
    pub trivy_url: Option<Url>,
    pub trivy_token: Option<String>,
    /// Declarative account config for the managed-account janitor.
    pub managed_accounts_path: Option<String>,
    /// Grace period before an unmounted blob is deleted from storage.
    pub blob_sweep_grace: Duration,
    /// How long in-flight requests get to finish after SIGTERM.
    pub shutdown_grace: Duration,
    /// Disables TLS verification towards peers. Never set outside of tests.
    pub insecure_debug: bool,
}

#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable `{name}`")]
    MissingVariable { name: String },
    #[error("malformed value in `{name}`: {raw_error_message}")]
    MalformedValue { name: String, raw_error_message: String },
    #[error("cannot read `{path}` (from `{name}`): {raw_error_message}")]
    UnreadableFile {
        name: String,
        path: String,
        raw_error_message: String,
    },
}

fn required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVariable { name: name.into() })
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn file_contents(name: &str) -> Result<String, ConfigError> {
    let path = required(name)?;
    std::fs::read_to_string(&path).map_err(|err| ConfigError::UnreadableFile {
        name: name.into(),
        path,
        raw_error_message: err.to_string(),
    })
}

fn seconds(name: &str, default: u64) -> Result<Duration, ConfigError> {
    match optional(name) {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => raw
            .parse()
            .map(Duration::from_secs)
            .map_err(|err: std::num::ParseIntError| ConfigError::MalformedValue {
                name: name.into(),
                raw_error_message: err.to_string(),
            }),
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let trivy_url = match optional("KEPPEL_TRIVY_URL") {
            None => None,
            Some(raw) => Some(Url::parse(&raw).map_err(|err| ConfigError::MalformedValue {
                name: "KEPPEL_TRIVY_URL".into(),
                raw_error_message: err.to_string(),
            })?),
        };

        Ok(RuntimeConfig {
            api_public_hostname: required("KEPPEL_API_PUBLIC_FQDN")?,
            anycast_api_public_hostname: optional("KEPPEL_API_ANYCAST_FQDN"),
            database_url: required("KEPPEL_DB_URL")?,
            issuer_key_pem: file_contents("KEPPEL_ISSUER_KEY")?,
            issuer_public_key_pem: file_contents("KEPPEL_ISSUER_CERT")?,
            redis_url: optional("KEPPEL_REDIS_URL"),
            peer_hostnames: optional("KEPPEL_PEERS")
                .map(|raw| {
                    raw.split(',')
                        .map(|hostname| hostname.trim().to_string())
                        .filter(|hostname| !hostname.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            auth_driver: required("KEPPEL_DRIVER_AUTH")?,
            storage_driver: required("KEPPEL_DRIVER_STORAGE")?,
            federation_driver: required("KEPPEL_DRIVER_FEDERATION")?,
            federation_chain: optional("KEPPEL_FEDERATION_CHAIN")
                .map(|raw| {
                    raw.split(',')
                        .map(|name| name.trim().to_string())
                        .filter(|name| !name.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            inbound_cache_driver: optional("KEPPEL_DRIVER_INBOUND_CACHE")
                .unwrap_or_else(|| "trivial".into()),
            rate_limit_driver: optional("KEPPEL_DRIVER_RATE_LIMIT").unwrap_or_else(|| "noop".into()),
            account_management_driver: optional("KEPPEL_DRIVER_ACCOUNT_MANAGEMENT")
                .unwrap_or_else(|| "trivial".into()),
            storage_path: optional("KEPPEL_STORAGE_PATH"),
            trivy_url,
            trivy_token: optional("KEPPEL_TRIVY_TOKEN"),
            managed_accounts_path: optional("KEPPEL_MANAGED_ACCOUNTS_PATH"),
            blob_sweep_grace: seconds("KEPPEL_GC_BLOB_GRACE", 6 * 3600)?,
            shutdown_grace: seconds("KEPPEL_SHUTDOWN_GRACE", 10)?,
            insecure_debug: optional("KEPPEL_INSECURE_DEBUG").is_some(),
        })
    }

    /// Issuer string stamped into tokens signed by this instance.
    pub fn token_issuer(&self) -> String {
        format!("keppel-api@{}", self.api_public_hostname)
    }

    pub fn is_anycast_service(&self, service: &str) -> bool {
        self.anycast_api_public_hostname.as_deref() == Some(service)
    }

    pub fn is_known_peer(&self, hostname: &str) -> bool {
        self.peer_hostnames.iter().any(|peer| peer == hostname)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// A config for driver and API tests that never talks to the network.
    pub fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            api_public_hostname: "registry.example.org".into(),
            anycast_api_public_hostname: Some("registry.anycast.example.org".into()),
            database_url: "postgres://localhost/keppel_test".into(),
            issuer_key_pem: crate::auth::token::tests::TEST_RSA_PRIVATE_KEY.into(),
            issuer_public_key_pem: crate::auth::token::tests::TEST_RSA_PUBLIC_KEY.into(),
            redis_url: None,
            peer_hostnames: vec!["peer.example.org".into()],
            auth_driver: "trivial".into(),
            storage_driver: "in-memory".into(),
            federation_driver: "trivial".into(),
            federation_chain: Vec::new(),
            inbound_cache_driver: "local".into(),
            rate_limit_driver: "noop".into(),
            account_management_driver: "trivial".into(),
            storage_path: None,
            trivy_url: None,
            trivy_token: None,
            managed_accounts_path: None,
            blob_sweep_grace: Duration::from_secs(6 * 3600),
            shutdown_grace: Duration::from_secs(10),
            insecure_debug: false,
        }
    }

    #[test]
    fn issuer_carries_public_hostname() {
        assert_eq!(
            test_config().token_issuer(),
            "keppel-api@registry.example.org"
        );
    }
}
