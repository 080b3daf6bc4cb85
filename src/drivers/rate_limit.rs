use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use strum_macros::{Display, EnumString};
use thiserror::Error;

/// RateLimitAction: every admission-controlled operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum RateLimitAction {
    BlobPull,
    BlobPush,
    ManifestPull,
    ManifestPush,
    AnycastBlobBytePull,
    TrivyReportRetrieval,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub retry_after_seconds: u64,
}

impl RateLimitDecision {
    pub fn allow() -> Self {
        RateLimitDecision {
            allowed: true,
            retry_after_seconds: 0,
        }
    }
}

#[derive(Clone, Error, Debug)]
pub enum RateLimitError {
    #[error("rate-limit store failure: {raw_error_message}")]
    Store { raw_error_message: String },
}

/// One token bucket shape: `limit` tokens refilling over `per`.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitRule {
    pub limit: NonZeroU32,
    pub per: Duration,
}

/// RateLimitDriver: token-bucket admission keyed by
/// (account, action, identity). Absence of a configured driver means
/// admission always passes; callers fail open on store errors too.
#[async_trait]
pub trait RateLimitDriver: Send + Sync {
    async fn check(
        &self,
        account_name: &str,
        action: RateLimitAction,
        identity_name: &str,
        amount: u64,
    ) -> Result<RateLimitDecision, RateLimitError>;
}

/// NoopRateLimitDriver: always admits.
pub struct NoopRateLimitDriver;

#[async_trait]
impl RateLimitDriver for NoopRateLimitDriver {
    async fn check(
        &self,
        _account_name: &str,
        _action: RateLimitAction,
        _identity_name: &str,
        _amount: u64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        Ok(RateLimitDecision::allow())
    }
}

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// LocalRateLimitDriver: per-process token buckets. Good for a single
/// instance; fleets want the Redis driver so all peers share buckets.
pub struct LocalRateLimitDriver {
    limiters: HashMap<RateLimitAction, KeyedLimiter>,
    clock: DefaultClock,
}

impl LocalRateLimitDriver {
    pub fn new(rules: HashMap<RateLimitAction, RateLimitRule>) -> Self {
        let clock = DefaultClock::default();
        let limiters = rules
            .into_iter()
            .map(|(action, rule)| {
                let period = rule.per.max(Duration::from_millis(1));
                let replenish = period / rule.limit.get();
                let quota = Quota::with_period(replenish)
                    .expect("replenish interval is non-zero")
                    .allow_burst(rule.limit);
                (action, RateLimiter::keyed(quota))
            })
            .collect();
        LocalRateLimitDriver { limiters, clock }
    }

    pub fn with_default_limits() -> Self {
        let mut rules = HashMap::new();
        rules.insert(
            RateLimitAction::BlobPull,
            RateLimitRule { limit: nonzero!(1000u32), per: Duration::from_secs(60) },
        );
        rules.insert(
            RateLimitAction::BlobPush,
            RateLimitRule { limit: nonzero!(300u32), per: Duration::from_secs(60) },
        );
        rules.insert(
            RateLimitAction::ManifestPull,
            RateLimitRule { limit: nonzero!(2000u32), per: Duration::from_secs(60) },
        );
        rules.insert(
            RateLimitAction::ManifestPush,
            RateLimitRule { limit: nonzero!(100u32), per: Duration::from_secs(60) },
        );
        rules.insert(
            RateLimitAction::AnycastBlobBytePull,
            RateLimitRule {
                // bytes, not requests
                limit: nonzero!(1_000_000_000u32),
                per: Duration::from_secs(60),
            },
        );
        rules.insert(
            RateLimitAction::TrivyReportRetrieval,
            RateLimitRule { limit: nonzero!(60u32), per: Duration::from_secs(60) },
        );
        LocalRateLimitDriver::new(rules)
    }
}

fn bucket_key(account_name: &str, identity_name: &str) -> String {
    let identity = if identity_name.is_empty() {
        "anonymous"
    } else {
        identity_name
    };
    format!("{account_name}:{identity}")
}

#[async_trait]
impl RateLimitDriver for LocalRateLimitDriver {
    async fn check(
        &self,
        account_name: &str,
        action: RateLimitAction,
        identity_name: &str,
        amount: u64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let Some(limiter) = self.limiters.get(&action) else {
            return Ok(RateLimitDecision::allow());
        };
        let key = bucket_key(account_name, identity_name);
        let amount = NonZeroU32::new(amount.min(u64::from(u32::MAX)) as u32)
            .unwrap_or(nonzero!(1u32));
        match limiter.check_key_n(&key, amount) {
            Ok(Ok(())) => Ok(RateLimitDecision::allow()),
            Ok(Err(not_until)) => {
                let wait = not_until.wait_time_from(self.clock.now());
                Ok(RateLimitDecision {
                    allowed: false,
                    retry_after_seconds: wait.as_secs().max(1),
                })
            }
            // The request is larger than the whole bucket; it can never pass.
            Err(_) => Ok(RateLimitDecision {
                allowed: false,
                retry_after_seconds: 3600,
            }),
        }
    }
}

/// RedisRateLimitDriver: fleet-shared token buckets, one Lua round-trip per
/// admission check.
pub struct RedisRateLimitDriver {
    client: redis::Client,
    rules: HashMap<RateLimitAction, RateLimitRule>,
}

impl RedisRateLimitDriver {
    pub fn new(url: &str) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(url).map_err(|err| RateLimitError::Store {
            raw_error_message: err.to_string(),
        })?;
        let mut rules = HashMap::new();
        for action in [
            RateLimitAction::BlobPull,
            RateLimitAction::BlobPush,
            RateLimitAction::ManifestPull,
            RateLimitAction::ManifestPush,
            RateLimitAction::AnycastBlobBytePull,
            RateLimitAction::TrivyReportRetrieval,
        ] {
            rules.insert(
                action,
                RateLimitRule { limit: nonzero!(1000u32), per: Duration::from_secs(60) },
            );
        }
        Ok(RedisRateLimitDriver { client, rules })
    }

    pub fn with_rules(mut self, rules: HashMap<RateLimitAction, RateLimitRule>) -> Self {
        self.rules = rules;
        self
    }
}

const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local period_ms = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local amount = tonumber(ARGV[4])
local refill_per_ms = capacity / period_ms
local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil then
    tokens = capacity
    ts = now_ms
end
tokens = math.min(capacity, tokens + (now_ms - ts) * refill_per_ms)
local allowed = 0
local retry_ms = 0
if tokens >= amount then
    tokens = tokens - amount
    allowed = 1
else
    retry_ms = math.ceil((amount - tokens) / refill_per_ms)
end
redis.call('HMSET', KEYS[1], 'tokens', tokens, 'ts', now_ms)
redis.call('PEXPIRE', KEYS[1], period_ms * 2)
return {allowed, retry_ms}
"#;

#[async_trait]
impl RateLimitDriver for RedisRateLimitDriver {
    async fn check(
        &self,
        account_name: &str,
        action: RateLimitAction,
        identity_name: &str,
        amount: u64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let Some(rule) = self.rules.get(&action) else {
            return Ok(RateLimitDecision::allow());
        };
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| RateLimitError::Store {
                raw_error_message: err.to_string(),
            })?;
        let key = format!(
            "keppel-ratelimit-{action}-{}",
            bucket_key(account_name, identity_name)
        );
        let now_ms = chrono::Utc::now().timestamp_millis();
        let (allowed, retry_ms): (i64, i64) = redis::Script::new(TOKEN_BUCKET_SCRIPT)
            .key(key)
            .arg(rule.limit.get())
            .arg(rule.per.as_millis() as u64)
            .arg(now_ms)
            .arg(amount)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| RateLimitError::Store {
                raw_error_message: err.to_string(),
            })?;
        if allowed == 1 {
            return Ok(RateLimitDecision::allow());
        }
        Ok(RateLimitDecision {
            allowed: false,
            retry_after_seconds: (retry_ms as u64).div_ceil(1000).max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_buckets_exhaust_and_report_retry() {
        let mut rules = HashMap::new();
        rules.insert(
            RateLimitAction::ManifestPush,
            RateLimitRule { limit: nonzero!(2u32), per: Duration::from_secs(60) },
        );
        let driver = LocalRateLimitDriver::new(rules);

        for _ in 0..2 {
            let decision = driver
                .check("acc1", RateLimitAction::ManifestPush, "jane", 1)
                .await
                .unwrap();
            assert!(decision.allowed);
        }
        let decision = driver
            .check("acc1", RateLimitAction::ManifestPush, "jane", 1)
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert!(decision.retry_after_seconds >= 1);

        // Different identity, different bucket.
        let decision = driver
            .check("acc1", RateLimitAction::ManifestPush, "john", 1)
            .await
            .unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn unconfigured_actions_pass() {
        let driver = LocalRateLimitDriver::new(HashMap::new());
        let decision = driver
            .check("acc1", RateLimitAction::BlobPull, "", 1)
            .await
            .unwrap();
        assert!(decision.allowed);
    }

    #[test]
    fn anonymous_shares_one_bucket_per_account() {
        assert_eq!(bucket_key("acc1", ""), "acc1:anonymous");
        assert_eq!(bucket_key("acc1", "jane"), "acc1:jane");
    }
}
