//! Bucket persistence behind a trait so the limiter can run against either
//! the in-process map or an external key-value store with atomic per-key
//! updates (required once multiple gateway instances share counters;
//! read-then-write from several processes would under-count tokens).

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

/// One token bucket, keyed by (client key, category) at the limiter level.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    /// Tokens currently available. Fractional so refill is continuous.
    pub tokens: f64,
    /// Clock reading (millis) of the last refill.
    pub last_refill_millis: u64,
    /// Cumulative request counter, used for abuse detection.
    pub request_count: u64,
    /// Clock reading (millis) until which this key is hard-blocked.
    /// Zero means not blocked.
    pub blocked_until_millis: u64,
}

impl Bucket {
    /// A fresh bucket at full burst capacity.
    pub fn full(burst: f64, now_millis: u64) -> Self {
        Self {
            tokens: burst,
            last_refill_millis: now_millis,
            request_count: 0,
            blocked_until_millis: 0,
        }
    }
}

/// Storage for rate-limit buckets.
///
/// `update` must apply the mutation atomically with respect to other
/// updates of the same key; the limiter's read-modify-write runs entirely
/// inside it. Entries carry a TTL and are never explicitly deleted; they
/// expire naturally.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Read a bucket without mutating it. Expired entries read as absent.
    async fn get(&self, key: &str) -> Option<Bucket>;

    /// Atomically mutate the bucket under `key`, creating it with `default`
    /// if absent (or expired), and refresh its TTL. Returns the bucket as
    /// stored after the mutation.
    async fn update(
        &self,
        key: &str,
        ttl_secs: u64,
        default: Bucket,
        f: &mut (dyn for<'a> FnMut(&'a mut Bucket) + Send),
    ) -> Bucket;
}

struct Entry {
    bucket: Bucket,
    expires_at_millis: u64,
}

/// Single-process [`BucketStore`]: one async mutex over the whole map, so
/// per-key updates never interleave.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: std::sync::Arc<dyn crate::clock::Clock>,
}

impl MemoryStore {
    pub fn new(clock: std::sync::Arc<dyn crate::clock::Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Evict entries past their TTL. Intended for a periodic sweep.
    pub async fn purge_expired(&self) {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at_millis > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Purged expired rate-limit buckets");
        }
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<Bucket> {
        let now = self.clock.now_millis();
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|e| e.expires_at_millis > now)
            .map(|e| e.bucket.clone())
    }

    async fn update(
        &self,
        key: &str,
        ttl_secs: u64,
        default: Bucket,
        f: &mut (dyn for<'a> FnMut(&'a mut Bucket) + Send),
    ) -> Bucket {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(key.to_string())
            .and_modify(|e| {
                if e.expires_at_millis <= now {
                    e.bucket = default.clone();
                }
            })
            .or_insert_with(|| Entry {
                bucket: default.clone(),
                expires_at_millis: 0,
            });
        f(&mut entry.bucket);
        entry.expires_at_millis = now + ttl_secs * 1000;
        entry.bucket.clone()
    }
}
