//! Explicitly managed IP blocklist, checked before token-bucket logic.
//! Entries expire after a fixed duration unless removed sooner.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::clock::Clock;

/// Default block duration: one hour.
pub const DEFAULT_BLOCK_SECS: u64 = 3600;

#[derive(Clone)]
pub struct IpBlocklist {
    entries: Arc<RwLock<HashMap<IpAddr, u64>>>,
    clock: Arc<dyn Clock>,
}

impl IpBlocklist {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Block an address for `duration_secs` (replaces any existing entry).
    pub async fn block(&self, ip: IpAddr, duration_secs: u64) {
        let until = self.clock.now_millis() + duration_secs * 1000;
        self.entries.write().await.insert(ip, until);
        info!(ip = %ip, duration_secs, "IP blocked");
    }

    /// Remove an address from the blocklist before it expires.
    pub async fn unblock(&self, ip: IpAddr) -> bool {
        let removed = self.entries.write().await.remove(&ip).is_some();
        if removed {
            info!(ip = %ip, "IP unblocked");
        }
        removed
    }

    /// Whether the address is currently blocked. Expired entries are
    /// treated as absent and dropped.
    pub async fn is_blocked(&self, ip: IpAddr) -> bool {
        self.remaining_secs(ip).await.is_some()
    }

    /// Seconds until the block on `ip` lifts, if one is active.
    pub async fn remaining_secs(&self, ip: IpAddr) -> Option<u64> {
        let now = self.clock.now_millis();
        {
            let entries = self.entries.read().await;
            match entries.get(&ip) {
                Some(&until) if until > now => {
                    return Some((until - now).div_ceil(1000));
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Entry exists but expired; drop it.
        self.entries.write().await.remove(&ip);
        debug!(ip = %ip, "Expired IP block removed");
        None
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn blocklist() -> (IpBlocklist, ManualClock) {
        let clock = ManualClock::new();
        (IpBlocklist::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_block_and_unblock() {
        let (list, _clock) = blocklist();
        let ip: IpAddr = "203.0.113.7".parse().unwrap();

        assert!(!list.is_blocked(ip).await);
        list.block(ip, DEFAULT_BLOCK_SECS).await;
        assert!(list.is_blocked(ip).await);
        assert!(list.unblock(ip).await);
        assert!(!list.is_blocked(ip).await);
        assert!(!list.unblock(ip).await);
    }

    #[tokio::test]
    async fn test_block_expires() {
        let (list, clock) = blocklist();
        let ip: IpAddr = "203.0.113.7".parse().unwrap();

        list.block(ip, 60).await;
        assert_eq!(list.remaining_secs(ip).await, Some(60));

        clock.advance_secs(61);
        assert!(!list.is_blocked(ip).await);
        // The expired entry was dropped on read.
        assert_eq!(list.len().await, 0);
    }
}
