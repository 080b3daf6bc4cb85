use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::prelude::{Engine, BASE64_STANDARD};
use chrono::{DateTime, Utc};
use rand::RngCore;
use thiserror::Error;

#[derive(Clone, Error, Debug)]
pub enum FederationError {
    #[error("no primary account with this name exists anywhere in the federation")]
    NoSuchPrimaryAccount,
    #[error("federation state conflicts with local state: {message}")]
    Conflict { message: String },
    #[error("federation store failure: {raw_error_message}")]
    Store { raw_error_message: String },
}

/// Outcome of a name claim. A failed claim is a normal user-visible outcome,
/// not an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimResult {
    Succeeded,
    Failed { reason: String },
}

/// FederationDriver: assigns account names across the fleet and tracks who
/// replicates what. Cross-peer calls are at-least-once; all operations are
/// idempotent at the receiver.
#[async_trait]
pub trait FederationDriver: Send + Sync {
    /// Primary claim when `sublease_secret` is None, replica claim otherwise.
    async fn claim_account_name(
        &self,
        account_name: &str,
        our_hostname: &str,
        sublease_secret: Option<&str>,
    ) -> Result<ClaimResult, FederationError>;

    /// Primary-only. At most one secret is outstanding per account; issuing
    /// again replaces the previous one.
    async fn issue_sublease_token_secret(
        &self,
        account_name: &str,
    ) -> Result<String, FederationError>;

    async fn forfeit_account_name(
        &self,
        account_name: &str,
        our_hostname: &str,
        is_replica: bool,
    ) -> Result<(), FederationError>;

    /// Idempotent heartbeat. Detects drift between local DB and federation
    /// state and surfaces it instead of silently correcting.
    async fn record_existing_account(
        &self,
        account_name: &str,
        our_hostname: &str,
        is_replica: bool,
        now: DateTime<Utc>,
    ) -> Result<(), FederationError>;

    async fn find_primary_account(&self, account_name: &str)
        -> Result<String, FederationError>;
}

/// Sublease secrets are capability tokens, not passwords: 12 random bytes
/// are plenty and keep the Base64 form short enough to paste.
pub fn generate_sublease_secret() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64_STANDARD.encode(bytes)
}

// ---------------------------------------------------------------------------
// trivial driver

/// TrivialFederationDriver: for single-instance deployments. There is nobody
/// to coordinate with, so every claim succeeds and no primary is ever found
/// elsewhere.
#[derive(Default)]
pub struct TrivialFederationDriver;

#[async_trait]
impl FederationDriver for TrivialFederationDriver {
    async fn claim_account_name(
        &self,
        _account_name: &str,
        _our_hostname: &str,
        sublease_secret: Option<&str>,
    ) -> Result<ClaimResult, FederationError> {
        if sublease_secret.is_some() {
            return Ok(ClaimResult::Failed {
                reason: "this instance does not participate in a federation".into(),
            });
        }
        Ok(ClaimResult::Succeeded)
    }

    async fn issue_sublease_token_secret(
        &self,
        _account_name: &str,
    ) -> Result<String, FederationError> {
        Ok(generate_sublease_secret())
    }

    async fn forfeit_account_name(
        &self,
        _account_name: &str,
        _our_hostname: &str,
        _is_replica: bool,
    ) -> Result<(), FederationError> {
        Ok(())
    }

    async fn record_existing_account(
        &self,
        _account_name: &str,
        _our_hostname: &str,
        _is_replica: bool,
        _now: DateTime<Utc>,
    ) -> Result<(), FederationError> {
        Ok(())
    }

    async fn find_primary_account(
        &self,
        _account_name: &str,
    ) -> Result<String, FederationError> {
        Err(FederationError::NoSuchPrimaryAccount)
    }
}

// ---------------------------------------------------------------------------
// shared key-value store driver

/// FederationStore: the small atomic-KV surface that the store-backed driver
/// needs. Implemented over Redis for fleets and over process memory for
/// tests.
#[async_trait]
pub trait FederationStore: Send + Sync {
    /// Claims the primary slot if free; returns the resulting owner either
    /// way. Must be atomic.
    async fn claim_primary(&self, account_name: &str, hostname: &str) -> Result<String, String>;
    async fn get_primary(&self, account_name: &str) -> Result<Option<String>, String>;
    async fn put_sublease_secret(&self, account_name: &str, secret: &str) -> Result<(), String>;
    /// Check-and-clear: succeeds at most once per stored secret.
    async fn consume_sublease_secret(
        &self,
        account_name: &str,
        secret: &str,
    ) -> Result<bool, String>;
    async fn add_replica(&self, account_name: &str, hostname: &str) -> Result<(), String>;
    async fn remove_replica(&self, account_name: &str, hostname: &str) -> Result<(), String>;
    async fn count_replicas(&self, account_name: &str) -> Result<u64, String>;
    /// Removes all keys for the account (primary, secret, replica set).
    async fn clear_account(&self, account_name: &str) -> Result<(), String>;
}

/// StoreBackedFederationDriver: the real federation logic, generic over the
/// backing store.
pub struct StoreBackedFederationDriver {
    store: Box<dyn FederationStore>,
}

impl StoreBackedFederationDriver {
    pub fn new(store: Box<dyn FederationStore>) -> Self {
        StoreBackedFederationDriver { store }
    }

    pub fn in_memory() -> Self {
        StoreBackedFederationDriver::new(Box::new(MemoryFederationStore::default()))
    }

    pub fn redis(url: &str) -> Result<Self, FederationError> {
        let store = RedisFederationStore::new(url)?;
        Ok(StoreBackedFederationDriver::new(Box::new(store)))
    }
}

fn store_err(raw_error_message: String) -> FederationError {
    FederationError::Store { raw_error_message }
}

#[async_trait]
impl FederationDriver for StoreBackedFederationDriver {
    async fn claim_account_name(
        &self,
        account_name: &str,
        our_hostname: &str,
        sublease_secret: Option<&str>,
    ) -> Result<ClaimResult, FederationError> {
        match sublease_secret {
            None => {
                let owner = self
                    .store
                    .claim_primary(account_name, our_hostname)
                    .await
                    .map_err(store_err)?;
                if owner == our_hostname {
                    Ok(ClaimResult::Succeeded)
                } else {
                    Ok(ClaimResult::Failed {
                        reason: format!("account name is already claimed by {owner}"),
                    })
                }
            }
            Some(secret) => {
                match self.store.get_primary(account_name).await.map_err(store_err)? {
                    None => Ok(ClaimResult::Failed {
                        reason: "no such primary account".into(),
                    }),
                    Some(owner) if owner == our_hostname => Ok(ClaimResult::Failed {
                        reason: "cannot replicate an account from itself".into(),
                    }),
                    Some(_) => {
                        let consumed = self
                            .store
                            .consume_sublease_secret(account_name, secret)
                            .await
                            .map_err(store_err)?;
                        if !consumed {
                            return Ok(ClaimResult::Failed {
                                reason: "sublease token is invalid or was already used".into(),
                            });
                        }
                        self.store
                            .add_replica(account_name, our_hostname)
                            .await
                            .map_err(store_err)?;
                        Ok(ClaimResult::Succeeded)
                    }
                }
            }
        }
    }

    async fn issue_sublease_token_secret(
        &self,
        account_name: &str,
    ) -> Result<String, FederationError> {
        let secret = generate_sublease_secret();
        self.store
            .put_sublease_secret(account_name, &secret)
            .await
            .map_err(store_err)?;
        Ok(secret)
    }

    async fn forfeit_account_name(
        &self,
        account_name: &str,
        our_hostname: &str,
        is_replica: bool,
    ) -> Result<(), FederationError> {
        if is_replica {
            return self
                .store
                .remove_replica(account_name, our_hostname)
                .await
                .map_err(store_err);
        }
        let replicas = self
            .store
            .count_replicas(account_name)
            .await
            .map_err(store_err)?;
        if replicas > 0 {
            return Err(FederationError::Conflict {
                message: format!("{replicas} replicas are still attached to this account"),
            });
        }
        self.store.clear_account(account_name).await.map_err(store_err)
    }

    async fn record_existing_account(
        &self,
        account_name: &str,
        our_hostname: &str,
        is_replica: bool,
        _now: DateTime<Utc>,
    ) -> Result<(), FederationError> {
        if is_replica {
            return self
                .store
                .add_replica(account_name, our_hostname)
                .await
                .map_err(store_err);
        }
        let owner = self
            .store
            .claim_primary(account_name, our_hostname)
            .await
            .map_err(store_err)?;
        if owner != our_hostname {
            return Err(FederationError::Conflict {
                message: format!(
                    "local database owns account `{account_name}`, but the federation \
                     says it belongs to {owner}"
                ),
            });
        }
        Ok(())
    }

    async fn find_primary_account(
        &self,
        account_name: &str,
    ) -> Result<String, FederationError> {
        self.store
            .get_primary(account_name)
            .await
            .map_err(store_err)?
            .ok_or(FederationError::NoSuchPrimaryAccount)
    }
}

// ---------------------------------------------------------------------------
// in-memory store

#[derive(Default)]
pub struct MemoryFederationStore {
    state: Mutex<MemoryFederationState>,
}

#[derive(Default)]
struct MemoryFederationState {
    primaries: HashMap<String, String>,
    secrets: HashMap<String, String>,
    replicas: HashMap<String, HashSet<String>>,
}

#[async_trait]
impl FederationStore for MemoryFederationStore {
    async fn claim_primary(&self, account_name: &str, hostname: &str) -> Result<String, String> {
        let mut state = self.state.lock().unwrap();
        let owner = state
            .primaries
            .entry(account_name.to_string())
            .or_insert_with(|| hostname.to_string());
        Ok(owner.clone())
    }

    async fn get_primary(&self, account_name: &str) -> Result<Option<String>, String> {
        Ok(self.state.lock().unwrap().primaries.get(account_name).cloned())
    }

    async fn put_sublease_secret(&self, account_name: &str, secret: &str) -> Result<(), String> {
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert(account_name.to_string(), secret.to_string());
        Ok(())
    }

    async fn consume_sublease_secret(
        &self,
        account_name: &str,
        secret: &str,
    ) -> Result<bool, String> {
        let mut state = self.state.lock().unwrap();
        if state.secrets.get(account_name).map(String::as_str) == Some(secret) {
            state.secrets.remove(account_name);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn add_replica(&self, account_name: &str, hostname: &str) -> Result<(), String> {
        self.state
            .lock()
            .unwrap()
            .replicas
            .entry(account_name.to_string())
            .or_default()
            .insert(hostname.to_string());
        Ok(())
    }

    async fn remove_replica(&self, account_name: &str, hostname: &str) -> Result<(), String> {
        if let Some(replica_set) = self.state.lock().unwrap().replicas.get_mut(account_name) {
            replica_set.remove(hostname);
        }
        Ok(())
    }

    async fn count_replicas(&self, account_name: &str) -> Result<u64, String> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .replicas
            .get(account_name)
            .map(|replica_set| replica_set.len() as u64)
            .unwrap_or(0))
    }

    async fn clear_account(&self, account_name: &str) -> Result<(), String> {
        let mut state = self.state.lock().unwrap();
        state.primaries.remove(account_name);
        state.secrets.remove(account_name);
        state.replicas.remove(account_name);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// redis store

pub struct RedisFederationStore {
    client: redis::Client,
}

impl RedisFederationStore {
    pub fn new(url: &str) -> Result<Self, FederationError> {
        let client = redis::Client::open(url).map_err(|err| FederationError::Store {
            raw_error_message: err.to_string(),
        })?;
        Ok(RedisFederationStore { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, String> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| err.to_string())
    }
}

fn primary_key(account_name: &str) -> String {
    format!("keppel-primary-{account_name}")
}
fn secret_key(account_name: &str) -> String {
    format!("keppel-sublease-{account_name}")
}
fn replicas_key(account_name: &str) -> String {
    format!("keppel-replicas-{account_name}")
}

#[async_trait]
impl FederationStore for RedisFederationStore {
    async fn claim_primary(&self, account_name: &str, hostname: &str) -> Result<String, String> {
        let mut conn = self.connection().await?;
        // Claim-if-free and read back the owner in one atomic step.
        let script = redis::Script::new(
            r#"
            local owner = redis.call('GET', KEYS[1])
            if not owner then
                redis.call('SET', KEYS[1], ARGV[1])
                return ARGV[1]
            end
            return owner
            "#,
        );
        script
            .key(primary_key(account_name))
            .arg(hostname)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| err.to_string())
    }

    async fn get_primary(&self, account_name: &str) -> Result<Option<String>, String> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(primary_key(account_name))
            .query_async(&mut conn)
            .await
            .map_err(|err| err.to_string())
    }

    async fn put_sublease_secret(&self, account_name: &str, secret: &str) -> Result<(), String> {
        let mut conn = self.connection().await?;
        redis::cmd("SET")
            .arg(secret_key(account_name))
            .arg(secret)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| err.to_string())
    }

    async fn consume_sublease_secret(
        &self,
        account_name: &str,
        secret: &str,
    ) -> Result<bool, String> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                redis.call('DEL', KEYS[1])
                return 1
            end
            return 0
            "#,
        );
        let consumed: i64 = script
            .key(secret_key(account_name))
            .arg(secret)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| err.to_string())?;
        Ok(consumed == 1)
    }

    async fn add_replica(&self, account_name: &str, hostname: &str) -> Result<(), String> {
        let mut conn = self.connection().await?;
        redis::cmd("SADD")
            .arg(replicas_key(account_name))
            .arg(hostname)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| err.to_string())
    }

    async fn remove_replica(&self, account_name: &str, hostname: &str) -> Result<(), String> {
        let mut conn = self.connection().await?;
        redis::cmd("SREM")
            .arg(replicas_key(account_name))
            .arg(hostname)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| err.to_string())
    }

    async fn count_replicas(&self, account_name: &str) -> Result<u64, String> {
        let mut conn = self.connection().await?;
        redis::cmd("SCARD")
            .arg(replicas_key(account_name))
            .query_async(&mut conn)
            .await
            .map_err(|err| err.to_string())
    }

    async fn clear_account(&self, account_name: &str) -> Result<(), String> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(primary_key(account_name))
            .arg(secret_key(account_name))
            .arg(replicas_key(account_name))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| err.to_string())
    }
}

// ---------------------------------------------------------------------------
// chained driver

/// ChainedFederationDriver: fans every operation out to several backends.
/// The first backend is authoritative; the others are kept in sync on a
/// best-effort basis so they can take over in a migration.
pub struct ChainedFederationDriver {
    drivers: Vec<Arc<dyn FederationDriver>>,
}

impl ChainedFederationDriver {
    pub fn new(drivers: Vec<Arc<dyn FederationDriver>>) -> Self {
        assert!(!drivers.is_empty(), "chained federation driver needs at least one backend");
        ChainedFederationDriver { drivers }
    }

    fn authoritative(&self) -> &dyn FederationDriver {
        self.drivers[0].as_ref()
    }
}

#[async_trait]
impl FederationDriver for ChainedFederationDriver {
    async fn claim_account_name(
        &self,
        account_name: &str,
        our_hostname: &str,
        sublease_secret: Option<&str>,
    ) -> Result<ClaimResult, FederationError> {
        let result = self
            .authoritative()
            .claim_account_name(account_name, our_hostname, sublease_secret)
            .await?;
        if result == ClaimResult::Succeeded {
            let is_replica = sublease_secret.is_some();
            for driver in &self.drivers[1..] {
                if let Err(err) = driver
                    .record_existing_account(account_name, our_hostname, is_replica, Utc::now())
                    .await
                {
                    warn!("secondary federation backend failed to record claim of {account_name}: {err}");
                }
            }
        }
        Ok(result)
    }

    async fn issue_sublease_token_secret(
        &self,
        account_name: &str,
    ) -> Result<String, FederationError> {
        self.authoritative()
            .issue_sublease_token_secret(account_name)
            .await
    }

    async fn forfeit_account_name(
        &self,
        account_name: &str,
        our_hostname: &str,
        is_replica: bool,
    ) -> Result<(), FederationError> {
        self.authoritative()
            .forfeit_account_name(account_name, our_hostname, is_replica)
            .await?;
        for driver in &self.drivers[1..] {
            if let Err(err) = driver
                .forfeit_account_name(account_name, our_hostname, is_replica)
                .await
            {
                warn!("secondary federation backend failed to forfeit {account_name}: {err}");
            }
        }
        Ok(())
    }

    async fn record_existing_account(
        &self,
        account_name: &str,
        our_hostname: &str,
        is_replica: bool,
        now: DateTime<Utc>,
    ) -> Result<(), FederationError> {
        self.authoritative()
            .record_existing_account(account_name, our_hostname, is_replica, now)
            .await?;
        for driver in &self.drivers[1..] {
            if let Err(err) = driver
                .record_existing_account(account_name, our_hostname, is_replica, now)
                .await
            {
                warn!("secondary federation backend failed to record {account_name}: {err}");
            }
        }
        Ok(())
    }

    async fn find_primary_account(
        &self,
        account_name: &str,
    ) -> Result<String, FederationError> {
        for driver in &self.drivers {
            match driver.find_primary_account(account_name).await {
                Ok(hostname) => return Ok(hostname),
                Err(FederationError::NoSuchPrimaryAccount) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(FederationError::NoSuchPrimaryAccount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn primary_claims_are_idempotent_and_exclusive() {
        let driver = StoreBackedFederationDriver::in_memory();
        assert_eq!(
            driver.claim_account_name("acc1", "host-a", None).await.unwrap(),
            ClaimResult::Succeeded
        );
        // Same host again: idempotent success.
        assert_eq!(
            driver.claim_account_name("acc1", "host-a", None).await.unwrap(),
            ClaimResult::Succeeded
        );
        // Different host: refused.
        assert!(matches!(
            driver.claim_account_name("acc1", "host-b", None).await.unwrap(),
            ClaimResult::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn sublease_secrets_are_single_use() {
        let driver = StoreBackedFederationDriver::in_memory();
        driver.claim_account_name("acc3", "host-a", None).await.unwrap();
        let secret = driver.issue_sublease_token_secret("acc3").await.unwrap();

        assert_eq!(
            driver
                .claim_account_name("acc3", "host-b", Some(&secret))
                .await
                .unwrap(),
            ClaimResult::Succeeded
        );
        // Second use fails, from any host.
        assert!(matches!(
            driver
                .claim_account_name("acc3", "host-c", Some(&secret))
                .await
                .unwrap(),
            ClaimResult::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn replica_claim_without_primary_fails() {
        let driver = StoreBackedFederationDriver::in_memory();
        assert!(matches!(
            driver
                .claim_account_name("ghost", "host-b", Some("whatever"))
                .await
                .unwrap(),
            ClaimResult::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn forfeit_refuses_while_replicas_attached() {
        let driver = StoreBackedFederationDriver::in_memory();
        driver.claim_account_name("acc4", "host-a", None).await.unwrap();
        let secret = driver.issue_sublease_token_secret("acc4").await.unwrap();
        driver
            .claim_account_name("acc4", "host-b", Some(&secret))
            .await
            .unwrap();

        assert!(matches!(
            driver.forfeit_account_name("acc4", "host-a", false).await,
            Err(FederationError::Conflict { .. })
        ));

        driver.forfeit_account_name("acc4", "host-b", true).await.unwrap();
        driver.forfeit_account_name("acc4", "host-a", false).await.unwrap();
        assert!(matches!(
            driver.find_primary_account("acc4").await,
            Err(FederationError::NoSuchPrimaryAccount)
        ));
    }

    #[tokio::test]
    async fn record_existing_account_detects_drift() {
        let driver = StoreBackedFederationDriver::in_memory();
        driver.claim_account_name("acc5", "host-a", None).await.unwrap();
        // host-b's DB wrongly believes it owns acc5 as primary.
        assert!(matches!(
            driver
                .record_existing_account("acc5", "host-b", false, Utc::now())
                .await,
            Err(FederationError::Conflict { .. })
        ));
        // The rightful owner heartbeats fine, repeatedly.
        driver
            .record_existing_account("acc5", "host-a", false, Utc::now())
            .await
            .unwrap();
        driver
            .record_existing_account("acc5", "host-a", false, Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn chained_driver_prefers_first_backend() {
        let first = Arc::new(StoreBackedFederationDriver::in_memory());
        let second = Arc::new(StoreBackedFederationDriver::in_memory());
        second.claim_account_name("acc6", "elsewhere", None).await.unwrap();

        let chained = ChainedFederationDriver::new(vec![first, second]);
        assert_eq!(
            chained.claim_account_name("acc6", "host-a", None).await.unwrap(),
            ClaimResult::Succeeded
        );
        assert_eq!(chained.find_primary_account("acc6").await.unwrap(), "host-a");
    }
}
