use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use moka::future::Cache;
use thiserror::Error;

use crate::digest::Digest;

/// Where an inbound-replicated manifest came from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UpstreamManifestRef {
    pub host: String,
    pub repo_name: String,
    /// Tag or digest, as requested by the client.
    pub reference: String,
}

impl UpstreamManifestRef {
    fn cache_key(&self) -> String {
        format!("{}/{}:{}", self.host, self.repo_name, self.reference)
    }

    /// Tags move, digests do not; the cache lifetime follows.
    pub fn time_to_live(&self) -> Duration {
        if self.reference.parse::<Digest>().is_ok() {
            Duration::hours(48)
        } else {
            Duration::hours(3)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedManifest {
    pub media_type: String,
    pub contents: Bytes,
}

/// A miss is an ordinary result here, not an error sentinel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheResult {
    Hit(CachedManifest),
    Miss,
}

#[derive(Clone, Error, Debug)]
pub enum CacheError {
    #[error("inbound cache failure: {raw_error_message}")]
    Store { raw_error_message: String },
}

/// InboundCacheDriver: caches manifests pulled from upstreams so that hot
/// replica pulls do not hammer the primary.
#[async_trait]
pub trait InboundCacheDriver: Send + Sync {
    async fn load_manifest(
        &self,
        location: &UpstreamManifestRef,
        now: DateTime<Utc>,
    ) -> Result<CacheResult, CacheError>;

    async fn store_manifest(
        &self,
        location: &UpstreamManifestRef,
        media_type: &str,
        contents: Bytes,
        now: DateTime<Utc>,
    ) -> Result<(), CacheError>;
}

/// TrivialInboundCache: caches nothing. Every load is a miss.
pub struct TrivialInboundCache;

#[async_trait]
impl InboundCacheDriver for TrivialInboundCache {
    async fn load_manifest(
        &self,
        _location: &UpstreamManifestRef,
        _now: DateTime<Utc>,
    ) -> Result<CacheResult, CacheError> {
        Ok(CacheResult::Miss)
    }

    async fn store_manifest(
        &self,
        _location: &UpstreamManifestRef,
        _media_type: &str,
        _contents: Bytes,
        _now: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        Ok(())
    }
}

#[derive(Clone)]
struct LocalEntry {
    media_type: String,
    contents: Bytes,
    expires_at: DateTime<Utc>,
}

/// LocalInboundCache: per-process cache. The moka TTL caps entry lifetime at
/// the digest maximum; the per-entry expiry enforces the shorter tag TTL.
pub struct LocalInboundCache {
    entries: Cache<String, LocalEntry>,
}

impl LocalInboundCache {
    pub fn new() -> Self {
        LocalInboundCache {
            entries: Cache::builder()
                .max_capacity(4096)
                .time_to_live(std::time::Duration::from_secs(48 * 3600))
                .build(),
        }
    }
}

impl Default for LocalInboundCache {
    fn default() -> Self {
        LocalInboundCache::new()
    }
}

#[async_trait]
impl InboundCacheDriver for LocalInboundCache {
    async fn load_manifest(
        &self,
        location: &UpstreamManifestRef,
        now: DateTime<Utc>,
    ) -> Result<CacheResult, CacheError> {
        match self.entries.get(&location.cache_key()).await {
            Some(entry) if entry.expires_at > now => Ok(CacheResult::Hit(CachedManifest {
                media_type: entry.media_type,
                contents: entry.contents,
            })),
            Some(_) => {
                self.entries.invalidate(&location.cache_key()).await;
                Ok(CacheResult::Miss)
            }
            None => Ok(CacheResult::Miss),
        }
    }

    async fn store_manifest(
        &self,
        location: &UpstreamManifestRef,
        media_type: &str,
        contents: Bytes,
        now: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let entry = LocalEntry {
            media_type: media_type.to_string(),
            contents,
            expires_at: now + location.time_to_live(),
        };
        self.entries.insert(location.cache_key(), entry).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_ref() -> UpstreamManifestRef {
        UpstreamManifestRef {
            host: "peer.example.org".into(),
            repo_name: "acc1/foo".into(),
            reference: "latest".into(),
        }
    }

    #[test]
    fn ttl_depends_on_reference_kind() {
        assert_eq!(tag_ref().time_to_live(), Duration::hours(3));
        let by_digest = UpstreamManifestRef {
            reference: format!("{}", Digest::of_contents(b"x")),
            ..tag_ref()
        };
        assert_eq!(by_digest.time_to_live(), Duration::hours(48));
    }

    #[tokio::test]
    async fn local_cache_hit_miss_and_expiry() {
        let cache = LocalInboundCache::new();
        let location = tag_ref();
        let now = Utc::now();

        assert_eq!(cache.load_manifest(&location, now).await.unwrap(), CacheResult::Miss);

        cache
            .store_manifest(&location, "application/json", Bytes::from_static(b"{}"), now)
            .await
            .unwrap();
        match cache.load_manifest(&location, now).await.unwrap() {
            CacheResult::Hit(found) => assert_eq!(found.media_type, "application/json"),
            CacheResult::Miss => panic!("expected cache hit"),
        }

        // Past the tag TTL the entry no longer counts.
        let later = now + Duration::hours(4);
        assert_eq!(
            cache.load_manifest(&location, later).await.unwrap(),
            CacheResult::Miss
        );
    }
}
