pub mod account_management;
pub mod auth;
pub mod federation;
pub mod inbound_cache;
pub mod rate_limit;
pub mod storage;

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::config::RuntimeConfig;

pub use account_management::AccountManagementDriver;
pub use auth::{AuthDriver, AuthError, IdentityKind, Permission, UserIdentity};
pub use federation::{ClaimResult, FederationDriver, FederationError};
pub use inbound_cache::{CacheResult, InboundCacheDriver, UpstreamManifestRef};
pub use rate_limit::{RateLimitAction, RateLimitDecision, RateLimitDriver};
pub use storage::{StorageContents, StorageDriver, StorageError};

#[derive(Clone, Error, Debug)]
pub enum DriverError {
    #[error("no {kind} driver registered under the name `{name}`")]
    UnknownDriver { kind: &'static str, name: String },
    #[error("cannot set up {kind} driver `{name}`: {raw_error_message}")]
    SetupFailed {
        kind: &'static str,
        name: String,
        raw_error_message: String,
    },
}

type Builder<T> = Box<dyn Fn(&RuntimeConfig) -> Result<Arc<T>, String> + Send + Sync>;

/// DriverRegistry: explicit name-to-constructor tables for every driver
/// kind, populated at program start. There is deliberately no init-time
/// self-registration.
pub struct DriverRegistry {
    auth: BTreeMap<&'static str, Builder<dyn AuthDriver>>,
    storage: BTreeMap<&'static str, Builder<dyn StorageDriver>>,
    federation: BTreeMap<&'static str, Builder<dyn FederationDriver>>,
    inbound_cache: BTreeMap<&'static str, Builder<dyn InboundCacheDriver>>,
    rate_limit: BTreeMap<&'static str, Builder<dyn RateLimitDriver>>,
    account_management: BTreeMap<&'static str, Builder<dyn AccountManagementDriver>>,
}

impl DriverRegistry {
    /// The registry with all drivers that ship in this crate.
    pub fn builtin() -> Self {
        let mut registry = DriverRegistry {
            auth: BTreeMap::new(),
            storage: BTreeMap::new(),
            federation: BTreeMap::new(),
            inbound_cache: BTreeMap::new(),
            rate_limit: BTreeMap::new(),
            account_management: BTreeMap::new(),
        };

        registry.register_auth("trivial", |_| Ok(Arc::new(auth::TrivialAuthDriver::new())));

        registry.register_storage("in-memory", |_| {
            Ok(Arc::new(storage::in_memory::InMemoryStorage::new()))
        });
        registry.register_storage("filesystem", |cfg| {
            let root = cfg
                .storage_path
                .clone()
                .ok_or_else(|| "KEPPEL_STORAGE_PATH is not set".to_string())?;
            Ok(Arc::new(storage::filesystem::FilesystemStorage::new(root)))
        });

        registry.register_federation("trivial", |_| {
            Ok(Arc::new(federation::TrivialFederationDriver::default()))
        });
        registry.register_federation("in-memory", |_| {
            Ok(Arc::new(federation::StoreBackedFederationDriver::in_memory()))
        });
        registry.register_federation("redis", |cfg| {
            let url = cfg
                .redis_url
                .clone()
                .ok_or_else(|| "KEPPEL_REDIS_URL is not set".to_string())?;
            let driver = federation::StoreBackedFederationDriver::redis(&url)
                .map_err(|err| err.to_string())?;
            Ok(Arc::new(driver))
        });
        registry.register_federation("chained", |cfg| {
            if cfg.federation_chain.is_empty() {
                return Err("KEPPEL_FEDERATION_CHAIN is not set".to_string());
            }
            let mut backends: Vec<Arc<dyn FederationDriver>> = Vec::new();
            for name in &cfg.federation_chain {
                backends.push(match name.as_str() {
                    "trivial" => Arc::new(federation::TrivialFederationDriver::default()),
                    "in-memory" => Arc::new(federation::StoreBackedFederationDriver::in_memory()),
                    "redis" => {
                        let url = cfg
                            .redis_url
                            .clone()
                            .ok_or_else(|| "KEPPEL_REDIS_URL is not set".to_string())?;
                        Arc::new(
                            federation::StoreBackedFederationDriver::redis(&url)
                                .map_err(|err| err.to_string())?,
                        )
                    }
                    other => return Err(format!("`{other}` cannot be chained")),
                });
            }
            Ok(Arc::new(federation::ChainedFederationDriver::new(backends)))
        });

        registry.register_inbound_cache("trivial", |_| {
            Ok(Arc::new(inbound_cache::TrivialInboundCache))
        });
        registry.register_inbound_cache("local", |_| {
            Ok(Arc::new(inbound_cache::LocalInboundCache::new()))
        });

        registry.register_rate_limit("noop", |_| Ok(Arc::new(rate_limit::NoopRateLimitDriver)));
        registry.register_rate_limit("local", |_| {
            Ok(Arc::new(rate_limit::LocalRateLimitDriver::with_default_limits()))
        });
        registry.register_rate_limit("redis", |cfg| {
            let url = cfg
                .redis_url
                .clone()
                .ok_or_else(|| "KEPPEL_REDIS_URL is not set".to_string())?;
            let driver =
                rate_limit::RedisRateLimitDriver::new(&url).map_err(|err| err.to_string())?;
            Ok(Arc::new(driver))
        });

        registry.register_account_management("trivial", |_| {
            Ok(Arc::new(account_management::TrivialAccountManagementDriver))
        });
        registry.register_account_management("file", |cfg| {
            let path = cfg
                .managed_accounts_path
                .clone()
                .ok_or_else(|| "KEPPEL_MANAGED_ACCOUNTS_PATH is not set".to_string())?;
            Ok(Arc::new(account_management::FileAccountManagementDriver::new(path)))
        });

        registry
    }

    pub fn register_auth(
        &mut self,
        name: &'static str,
        builder: impl Fn(&RuntimeConfig) -> Result<Arc<dyn AuthDriver>, String> + Send + Sync + 'static,
    ) {
        self.auth.insert(name, Box::new(builder));
    }

    pub fn register_storage(
        &mut self,
        name: &'static str,
        builder: impl Fn(&RuntimeConfig) -> Result<Arc<dyn StorageDriver>, String> + Send + Sync + 'static,
    ) {
        self.storage.insert(name, Box::new(builder));
    }

    pub fn register_federation(
        &mut self,
        name: &'static str,
        builder: impl Fn(&RuntimeConfig) -> Result<Arc<dyn FederationDriver>, String>
            + Send
            + Sync
            + 'static,
    ) {
        self.federation.insert(name, Box::new(builder));
    }

    pub fn register_inbound_cache(
        &mut self,
        name: &'static str,
        builder: impl Fn(&RuntimeConfig) -> Result<Arc<dyn InboundCacheDriver>, String>
            + Send
            + Sync
            + 'static,
    ) {
        self.inbound_cache.insert(name, Box::new(builder));
    }

    pub fn register_rate_limit(
        &mut self,
        name: &'static str,
        builder: impl Fn(&RuntimeConfig) -> Result<Arc<dyn RateLimitDriver>, String>
            + Send
            + Sync
            + 'static,
    ) {
        self.rate_limit.insert(name, Box::new(builder));
    }

    pub fn register_account_management(
        &mut self,
        name: &'static str,
        builder: impl Fn(&RuntimeConfig) -> Result<Arc<dyn AccountManagementDriver>, String>
            + Send
            + Sync
            + 'static,
    ) {
        self.account_management.insert(name, Box::new(builder));
    }

    fn build<T: ?Sized>(
        table: &BTreeMap<&'static str, Builder<T>>,
        kind: &'static str,
        name: &str,
        config: &RuntimeConfig,
    ) -> Result<Arc<T>, DriverError> {
        let builder = table.get(name).ok_or_else(|| DriverError::UnknownDriver {
            kind,
            name: name.to_string(),
        })?;
        builder(config).map_err(|raw_error_message| DriverError::SetupFailed {
            kind,
            name: name.to_string(),
            raw_error_message,
        })
    }
}

/// Drivers: the resolved driver set for one process, selected by name from
/// process configuration.
#[derive(Clone)]
pub struct Drivers {
    pub auth: Arc<dyn AuthDriver>,
    pub storage: Arc<dyn StorageDriver>,
    pub federation: Arc<dyn FederationDriver>,
    pub inbound_cache: Arc<dyn InboundCacheDriver>,
    pub rate_limit: Arc<dyn RateLimitDriver>,
    pub account_management: Arc<dyn AccountManagementDriver>,
}

impl std::fmt::Debug for Drivers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drivers").finish_non_exhaustive()
    }
}

impl Drivers {
    pub fn from_config(
        registry: &DriverRegistry,
        config: &RuntimeConfig,
    ) -> Result<Self, DriverError> {
        Ok(Drivers {
            auth: DriverRegistry::build(&registry.auth, "auth", &config.auth_driver, config)?,
            storage: DriverRegistry::build(
                &registry.storage,
                "storage",
                &config.storage_driver,
                config,
            )?,
            federation: DriverRegistry::build(
                &registry.federation,
                "federation",
                &config.federation_driver,
                config,
            )?,
            inbound_cache: DriverRegistry::build(
                &registry.inbound_cache,
                "inbound-cache",
                &config.inbound_cache_driver,
                config,
            )?,
            rate_limit: DriverRegistry::build(
                &registry.rate_limit,
                "rate-limit",
                &config.rate_limit_driver,
                config,
            )?,
            account_management: DriverRegistry::build(
                &registry.account_management,
                "account-management",
                &config.account_management_driver,
                config,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    #[test]
    fn builtin_registry_resolves_test_config() {
        let registry = DriverRegistry::builtin();
        let drivers = Drivers::from_config(&registry, &test_config()).unwrap();
        assert!(Arc::strong_count(&drivers.auth) >= 1);
    }

    #[test]
    fn unknown_driver_names_are_reported() {
        let registry = DriverRegistry::builtin();
        let mut config = test_config();
        config.storage_driver = "swift".into();
        let err = Drivers::from_config(&registry, &config).unwrap_err();
        assert!(matches!(err, DriverError::UnknownDriver { kind: "storage", .. }));
    }
}
