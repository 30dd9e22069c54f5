//! Per-key, per-category token buckets with endpoint cost surcharges,
//! abuse counters, and exponentially growing cooldowns.
//!
//! Checks run in order: IP blocklist, circuit breaker, token bucket. The
//! bucket read-modify-write executes atomically inside the store, so
//! concurrent checks for the same key never under-count.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::blocklist::{IpBlocklist, DEFAULT_BLOCK_SECS};
use crate::breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::store::{Bucket, BucketStore};

/// Cooldown base for abuse blocking: 60 s, doubling per threshold multiple.
const COOLDOWN_BASE_SECS: u64 = 60;
/// Cooldown ceiling: one hour.
const COOLDOWN_CAP_SECS: u64 = 3600;
/// Violations after which a key's associated IP is blocked outright.
const AUTO_BLOCK_VIOLATIONS: u64 = 10;

/// Endpoint surcharge keys for known-expensive operations.
pub mod endpoints {
    pub const BULK_IMPORT: &str = "bulk_import";
    pub const REPORT_GENERATION: &str = "report_generation";
    pub const CONTENT_GENERATION: &str = "content_generation";
    pub const IMAGE_UPLOAD: &str = "image_upload";
}

/// Request categories with independent limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateCategory {
    /// Authentication and other security-sensitive paths. Strictest.
    Auth,
    /// General API traffic.
    Api,
    /// In-band WebSocket messages.
    Realtime,
    /// Content mutation endpoints.
    Content,
    /// Public/static paths. Loosest.
    Public,
}

impl RateCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateCategory::Auth => "auth",
            RateCategory::Api => "api",
            RateCategory::Realtime => "realtime",
            RateCategory::Content => "content",
            RateCategory::Public => "public",
        }
    }
}

impl std::fmt::Display for RateCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Limits for one category.
#[derive(Debug, Clone, Copy)]
pub struct CategoryLimit {
    /// Tokens refilled per interval.
    pub tokens_per_interval: f64,
    /// Refill interval in seconds.
    pub interval_secs: f64,
    /// Burst capacity (bucket ceiling, also the starting fill).
    pub burst: f64,
    /// Base token cost per request in this category.
    pub base_cost: f64,
}

impl CategoryLimit {
    fn rate_per_sec(&self) -> f64 {
        self.tokens_per_interval / self.interval_secs
    }

    /// Buckets persist for roughly twice the refill interval.
    fn ttl_secs(&self) -> u64 {
        (self.interval_secs * 2.0) as u64
    }
}

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    IpBlocked,
    CircuitOpen,
    /// The key is in an abuse cooldown window.
    BurstTraffic,
    RateLimitExceeded,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::IpBlocked => "ip_blocked",
            RejectReason::CircuitOpen => "circuit_open",
            RejectReason::BurstTraffic => "burst_traffic",
            RejectReason::RateLimitExceeded => "rate_limit_exceeded",
        }
    }
}

/// Outcome of an admission check. Allowed decisions carry header hints;
/// rejected ones carry a reason and a retry-after.
#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<RejectReason>,
    pub retry_after_secs: Option<u64>,
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_secs: Option<u64>,
}

impl Decision {
    fn allow(limit: u64, remaining: u64, reset_secs: u64) -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after_secs: None,
            limit: Some(limit),
            remaining: Some(remaining),
            reset_secs: Some(reset_secs),
        }
    }

    fn reject(reason: RejectReason, retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            retry_after_secs: Some(retry_after_secs),
            limit: None,
            remaining: None,
            reset_secs: None,
        }
    }
}

#[derive(Debug, Default)]
struct ViolationRecord {
    count: u64,
}

enum BucketOutcome {
    Allowed { remaining: u64, reset_secs: u64 },
    StillBlocked { retry_after_secs: u64 },
    Cooldown { retry_after_secs: u64 },
    Short { retry_after_secs: u64 },
}

/// Token-bucket rate limiter with adaptive circuit breaking.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    blocklist: IpBlocklist,
    breaker: CircuitBreaker,
    limits: HashMap<RateCategory, CategoryLimit>,
    surcharges: HashMap<String, f64>,
    violations: Arc<Mutex<HashMap<String, ViolationRecord>>>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn BucketStore>,
        clock: Arc<dyn Clock>,
        blocklist: IpBlocklist,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            store,
            clock,
            blocklist,
            breaker,
            limits: default_limits(),
            surcharges: default_surcharges(),
            violations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Override the limits for one category.
    pub fn with_limit(mut self, category: RateCategory, limit: CategoryLimit) -> Self {
        self.limits.insert(category, limit);
        self
    }

    /// Register or replace a fixed surcharge for an expensive endpoint.
    pub fn with_surcharge(mut self, endpoint: impl Into<String>, cost: f64) -> Self {
        self.surcharges.insert(endpoint.into(), cost);
        self
    }

    pub fn blocklist(&self) -> &IpBlocklist {
        &self.blocklist
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Admission check for one request.
    ///
    /// `key` identifies the client (user id or IP string); `endpoint` is an
    /// optional surcharge key for known-expensive operations; `ip` enables
    /// blocklist checks and automatic blocking of repeat offenders.
    pub async fn allow(
        &self,
        key: &str,
        category: RateCategory,
        endpoint: Option<&str>,
        ip: Option<IpAddr>,
    ) -> Decision {
        // 1. Explicit IP blocks come before any bucket arithmetic.
        if let Some(addr) = ip {
            if let Some(remaining) = self.blocklist.remaining_secs(addr).await {
                debug!(ip = %addr, remaining, "Request from blocked IP rejected");
                return Decision::reject(RejectReason::IpBlocked, remaining);
            }
        }

        // 2. While the circuit is open everything is rejected uniformly.
        if let Some(retry) = self.breaker.check().await {
            return Decision::reject(RejectReason::CircuitOpen, retry);
        }

        // 3. Token bucket for (key, category).
        let limit = self.limits[&category];
        let surcharge = endpoint
            .and_then(|e| self.surcharges.get(e).copied())
            .unwrap_or(0.0);
        let cost = limit.base_cost + surcharge;
        let rate = limit.rate_per_sec();
        let now = self.clock.now_millis();

        let bucket_key = format!("{key}:{category}");
        let mut outcome = BucketOutcome::Short {
            retry_after_secs: 0,
        };
        self.store
            .update(
                &bucket_key,
                limit.ttl_secs(),
                Bucket::full(limit.burst, now),
                &mut |b| {
                    outcome = check_bucket(b, now, rate, limit.burst, cost);
                },
            )
            .await;

        match outcome {
            BucketOutcome::Allowed {
                remaining,
                reset_secs,
            } => Decision::allow(limit.burst as u64, remaining, reset_secs),
            BucketOutcome::StillBlocked { retry_after_secs } => {
                Decision::reject(RejectReason::BurstTraffic, retry_after_secs)
            }
            BucketOutcome::Cooldown { retry_after_secs } => {
                self.record_violation(key, ip).await;
                Decision::reject(RejectReason::BurstTraffic, retry_after_secs)
            }
            BucketOutcome::Short { retry_after_secs } => {
                Decision::reject(RejectReason::RateLimitExceeded, retry_after_secs)
            }
        }
    }

    /// Record a "burst traffic" violation for a key. Ten or more
    /// violations with an associated IP block that IP outright.
    async fn record_violation(&self, key: &str, ip: Option<IpAddr>) {
        let count = {
            let mut violations = self.violations.lock().await;
            let record = violations.entry(key.to_string()).or_default();
            record.count += 1;
            record.count
        };
        warn!(key, count, "Burst traffic violation recorded");

        if count >= AUTO_BLOCK_VIOLATIONS {
            if let Some(addr) = ip {
                self.blocklist.block(addr, DEFAULT_BLOCK_SECS).await;
                warn!(key, ip = %addr, "Repeat offender IP auto-blocked");
            }
        }
    }

    #[cfg(test)]
    async fn violation_count(&self, key: &str) -> u64 {
        self.violations
            .lock()
            .await
            .get(key)
            .map(|r| r.count)
            .unwrap_or(0)
    }
}

/// One token-bucket step. Runs inside the store's atomic update.
fn check_bucket(b: &mut Bucket, now: u64, rate: f64, burst: f64, cost: f64) -> BucketOutcome {
    // Hard-blocked keys are rejected without touching counters, so the
    // abuse counter only grows from live traffic.
    if b.blocked_until_millis > now {
        return BucketOutcome::StillBlocked {
            retry_after_secs: (b.blocked_until_millis - now).div_ceil(1000),
        };
    }

    let elapsed_secs = now.saturating_sub(b.last_refill_millis) as f64 / 1000.0;
    b.tokens = (b.tokens + elapsed_secs * rate).min(burst);
    b.last_refill_millis = now;
    b.request_count += 1;

    if b.tokens < cost {
        // Not consumed; the refilled state still persists. Crossing twice
        // the burst limit on the request counter starts exponentially
        // growing cooldowns.
        let threshold = (2.0 * burst) as u64;
        let multiples = if threshold > 0 {
            b.request_count / threshold
        } else {
            0
        };
        if multiples >= 1 {
            let cooldown = cooldown_secs(multiples);
            b.blocked_until_millis = now + cooldown * 1000;
            return BucketOutcome::Cooldown {
                retry_after_secs: cooldown,
            };
        }
        let wait = ((cost - b.tokens) / rate).ceil() as u64;
        return BucketOutcome::Short {
            retry_after_secs: wait.max(1),
        };
    }

    b.tokens -= cost;
    BucketOutcome::Allowed {
        remaining: b.tokens.floor() as u64,
        reset_secs: ((burst - b.tokens) / rate).ceil() as u64,
    }
}

/// Cooldown for the k-th threshold multiple: `min(60 * 2^(k-1), 3600)`.
fn cooldown_secs(k: u64) -> u64 {
    let exp = (k - 1).min(6); // 60 * 2^6 already exceeds the cap
    (COOLDOWN_BASE_SECS << exp).min(COOLDOWN_CAP_SECS)
}

fn default_limits() -> HashMap<RateCategory, CategoryLimit> {
    let mut limits = HashMap::new();
    limits.insert(
        RateCategory::Auth,
        CategoryLimit {
            tokens_per_interval: 10.0,
            interval_secs: 60.0,
            burst: 5.0,
            base_cost: 1.0,
        },
    );
    limits.insert(
        RateCategory::Api,
        CategoryLimit {
            tokens_per_interval: 120.0,
            interval_secs: 60.0,
            burst: 40.0,
            base_cost: 1.0,
        },
    );
    limits.insert(
        RateCategory::Realtime,
        CategoryLimit {
            tokens_per_interval: 600.0,
            interval_secs: 60.0,
            burst: 200.0,
            base_cost: 1.0,
        },
    );
    limits.insert(
        RateCategory::Content,
        CategoryLimit {
            tokens_per_interval: 60.0,
            interval_secs: 60.0,
            burst: 20.0,
            base_cost: 2.0,
        },
    );
    limits.insert(
        RateCategory::Public,
        CategoryLimit {
            tokens_per_interval: 300.0,
            interval_secs: 60.0,
            burst: 100.0,
            base_cost: 1.0,
        },
    );
    limits
}

fn default_surcharges() -> HashMap<String, f64> {
    let mut surcharges = HashMap::new();
    surcharges.insert(endpoints::BULK_IMPORT.to_string(), 20.0);
    surcharges.insert(endpoints::REPORT_GENERATION.to_string(), 15.0);
    surcharges.insert(endpoints::CONTENT_GENERATION.to_string(), 10.0);
    surcharges.insert(endpoints::IMAGE_UPLOAD.to_string(), 5.0);
    surcharges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn limiter_with(limit: CategoryLimit) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let limiter = RateLimiter::new(
            Arc::new(MemoryStore::new(shared.clone())),
            shared.clone(),
            IpBlocklist::new(shared.clone()),
            CircuitBreaker::new(BreakerConfig::default(), shared),
        )
        .with_limit(RateCategory::Api, limit);
        (limiter, clock)
    }

    #[tokio::test]
    async fn test_burst_then_refill_one_token() {
        // Burst of 5, refill 1 token/sec, cost 1.
        let (limiter, clock) = limiter_with(CategoryLimit {
            tokens_per_interval: 60.0,
            interval_secs: 60.0,
            burst: 5.0,
            base_cost: 1.0,
        });

        for _ in 0..5 {
            assert!(limiter.allow("u1", RateCategory::Api, None, None).await.allowed);
        }
        let denied = limiter.allow("u1", RateCategory::Api, None, None).await;
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(RejectReason::RateLimitExceeded));
        assert!(denied.retry_after_secs.unwrap() >= 1);

        // After exactly 1/R seconds one more request fits, and only one.
        clock.advance_secs(1);
        assert!(limiter.allow("u1", RateCategory::Api, None, None).await.allowed);
        assert!(!limiter.allow("u1", RateCategory::Api, None, None).await.allowed);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (limiter, _clock) = limiter_with(CategoryLimit {
            tokens_per_interval: 60.0,
            interval_secs: 60.0,
            burst: 1.0,
            base_cost: 1.0,
        });
        assert!(limiter.allow("u1", RateCategory::Api, None, None).await.allowed);
        assert!(!limiter.allow("u1", RateCategory::Api, None, None).await.allowed);
        assert!(limiter.allow("u2", RateCategory::Api, None, None).await.allowed);
    }

    #[tokio::test]
    async fn test_categories_are_independent() {
        let (limiter, _clock) = limiter_with(CategoryLimit {
            tokens_per_interval: 60.0,
            interval_secs: 60.0,
            burst: 1.0,
            base_cost: 1.0,
        });
        assert!(limiter.allow("u1", RateCategory::Api, None, None).await.allowed);
        assert!(!limiter.allow("u1", RateCategory::Api, None, None).await.allowed);
        // Same key, different category: separate bucket.
        assert!(limiter.allow("u1", RateCategory::Public, None, None).await.allowed);
    }

    #[tokio::test]
    async fn test_surcharge_is_additive() {
        let (limiter, _clock) = limiter_with(CategoryLimit {
            tokens_per_interval: 60.0,
            interval_secs: 60.0,
            burst: 30.0,
            base_cost: 1.0,
        });
        // bulk_import costs 1 + 20 = 21 tokens.
        let first = limiter
            .allow("u1", RateCategory::Api, Some(endpoints::BULK_IMPORT), None)
            .await;
        assert!(first.allowed);
        assert_eq!(first.remaining, Some(9));
        // A second bulk import does not fit into the remaining 9.
        let second = limiter
            .allow("u1", RateCategory::Api, Some(endpoints::BULK_IMPORT), None)
            .await;
        assert!(!second.allowed);
        // But a plain request still does.
        assert!(limiter.allow("u1", RateCategory::Api, None, None).await.allowed);
    }

    #[tokio::test]
    async fn test_allowed_decision_hints() {
        let (limiter, _clock) = limiter_with(CategoryLimit {
            tokens_per_interval: 60.0,
            interval_secs: 60.0,
            burst: 10.0,
            base_cost: 1.0,
        });
        let d = limiter.allow("u1", RateCategory::Api, None, None).await;
        assert!(d.allowed);
        assert_eq!(d.limit, Some(10));
        assert_eq!(d.remaining, Some(9));
        assert_eq!(d.reset_secs, Some(1));
    }

    #[tokio::test]
    async fn test_cooldown_growth() {
        assert_eq!(cooldown_secs(1), 60);
        assert_eq!(cooldown_secs(2), 120);
        assert_eq!(cooldown_secs(3), 240);
        assert_eq!(cooldown_secs(6), 1920);
        assert_eq!(cooldown_secs(7), 3600);
        assert_eq!(cooldown_secs(100), 3600);
    }

    #[tokio::test]
    async fn test_abuse_cooldown_engages_and_escalates() {
        // Burst 2, negligible refill: threshold = 4 requests.
        let (limiter, clock) = limiter_with(CategoryLimit {
            tokens_per_interval: 1.0,
            interval_secs: 100_000.0,
            burst: 2.0,
            base_cost: 1.0,
        });

        assert!(limiter.allow("u1", RateCategory::Api, None, None).await.allowed);
        assert!(limiter.allow("u1", RateCategory::Api, None, None).await.allowed);
        // 3rd request: short on tokens, below the abuse threshold.
        let d = limiter.allow("u1", RateCategory::Api, None, None).await;
        assert_eq!(d.reason, Some(RejectReason::RateLimitExceeded));
        // 4th request crosses 2x burst: first cooldown, 60 s.
        let d = limiter.allow("u1", RateCategory::Api, None, None).await;
        assert_eq!(d.reason, Some(RejectReason::BurstTraffic));
        assert_eq!(d.retry_after_secs, Some(60));
        assert_eq!(limiter.violation_count("u1").await, 1);

        // While blocked the rejection reports the remaining wait.
        clock.advance_secs(10);
        let d = limiter.allow("u1", RateCategory::Api, None, None).await;
        assert_eq!(d.reason, Some(RejectReason::BurstTraffic));
        assert_eq!(d.retry_after_secs, Some(50));

        // Run the counter to the second threshold multiple: 120 s cooldown.
        clock.advance_secs(51);
        for _ in 0..3 {
            let d = limiter.allow("u1", RateCategory::Api, None, None).await;
            assert!(!d.allowed);
            clock.advance_secs(d.retry_after_secs.unwrap());
        }
        let d = limiter.allow("u1", RateCategory::Api, None, None).await;
        assert_eq!(d.retry_after_secs, Some(120));
    }

    #[tokio::test]
    async fn test_blocked_ip_rejected_before_bucket() {
        let (limiter, _clock) = limiter_with(CategoryLimit {
            tokens_per_interval: 60.0,
            interval_secs: 60.0,
            burst: 10.0,
            base_cost: 1.0,
        });
        let ip: IpAddr = "198.51.100.4".parse().unwrap();
        limiter.blocklist().block(ip, 120).await;

        let d = limiter.allow("u1", RateCategory::Api, None, Some(ip)).await;
        assert!(!d.allowed);
        assert_eq!(d.reason, Some(RejectReason::IpBlocked));
        assert_eq!(d.retry_after_secs, Some(120));
        // The bucket was never touched.
        assert!(limiter.allow("u1", RateCategory::Api, None, None).await.allowed);
    }

    #[tokio::test]
    async fn test_circuit_open_rejects_everything() {
        let (limiter, _clock) = limiter_with(CategoryLimit {
            tokens_per_interval: 60.0,
            interval_secs: 60.0,
            burst: 10.0,
            base_cost: 1.0,
        });
        for _ in 0..BreakerConfig::default().error_threshold {
            limiter.breaker().record_failure().await;
        }
        let d = limiter.allow("u1", RateCategory::Api, None, None).await;
        assert_eq!(d.reason, Some(RejectReason::CircuitOpen));
        let d = limiter.allow("other", RateCategory::Public, None, None).await;
        assert_eq!(d.reason, Some(RejectReason::CircuitOpen));
    }

    #[tokio::test]
    async fn test_repeat_offender_ip_auto_blocked() {
        // Burst 1, threshold 2, so violations accumulate quickly.
        let (limiter, clock) = limiter_with(CategoryLimit {
            tokens_per_interval: 1.0,
            interval_secs: 1_000_000.0,
            burst: 1.0,
            base_cost: 1.0,
        });
        let ip: IpAddr = "198.51.100.9".parse().unwrap();

        let _ = limiter.allow("u1", RateCategory::Api, None, Some(ip)).await;
        let mut violations = 0;
        while violations < AUTO_BLOCK_VIOLATIONS {
            let d = limiter.allow("u1", RateCategory::Api, None, Some(ip)).await;
            assert!(!d.allowed);
            if d.reason == Some(RejectReason::IpBlocked) {
                break;
            }
            if d.reason == Some(RejectReason::BurstTraffic) {
                violations += 1;
                clock.advance_secs(d.retry_after_secs.unwrap());
            }
        }
        assert!(limiter.blocklist().is_blocked(ip).await);
    }
}
