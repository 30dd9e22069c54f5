//! # atelier-protect
//!
//! Admission control for the Atelier gateway: per-key/per-category token
//! buckets with endpoint cost surcharges and adaptive cooldowns, an
//! explicitly managed IP blocklist, and a process-wide circuit breaker.
//!
//! The limiter is consulted synchronously before request processing and
//! reports structured decisions (reason + retry-after) rather than raising;
//! callers translate rejections into 429s or in-band notifications.
//!
//! Bucket state lives behind the [`BucketStore`] trait so that a
//! multi-instance deployment can back it with an external key-value store
//! offering atomic per-key updates. The shipped [`MemoryStore`] is the
//! single-process implementation.

pub mod blocklist;
pub mod breaker;
pub mod clock;
pub mod limiter;
pub mod store;

pub use blocklist::IpBlocklist;
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use limiter::{CategoryLimit, Decision, RateCategory, RateLimiter, RejectReason};
pub use store::{Bucket, BucketStore, MemoryStore};
