//! Gateway configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the gateway can start with zero
//! configuration for local development.

use std::collections::HashMap;
use std::net::SocketAddr;

use atelier_protect::{BreakerConfig, CategoryLimit, RateCategory};
use atelier_shared::constants::{DEFAULT_HTTP_PORT, SAMPLER_INTERVAL_SECS};

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Human-readable name for this gateway instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Atelier Gateway"`
    pub instance_name: String,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Maximum number of concurrent WebSocket connections (0 = unlimited).
    /// Env: `MAX_CONNECTIONS`
    /// Default: `0`
    pub max_connections: usize,

    /// Seconds between metrics samples.
    /// Env: `SAMPLER_INTERVAL_SECS`
    /// Default: `60`
    pub sampler_interval_secs: u64,

    /// Circuit breaker tuning.
    /// Env: `BREAKER_ERROR_THRESHOLD`, `BREAKER_OPEN_TIMEOUT_SECS`
    pub breaker: BreakerConfig,

    /// Per-category rate limit overrides.
    /// Env: `RATE_LIMIT_<CATEGORY>` as `tokens:interval_secs:burst`, e.g.
    /// `RATE_LIMIT_REALTIME=1200:60:400`.
    pub limit_overrides: HashMap<RateCategory, CategoryLimit>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            instance_name: "Atelier Gateway".to_string(),
            admin_token: None,
            max_connections: 0,
            sampler_interval_secs: SAMPLER_INTERVAL_SECS,
            breaker: BreakerConfig::default(),
            limit_overrides: HashMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(name) = std::env::var("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Ok(token) = std::env::var("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Ok(val) = std::env::var("MAX_CONNECTIONS") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_connections = n;
            } else {
                tracing::warn!(value = %val, "Invalid MAX_CONNECTIONS, using default");
            }
        }

        if let Ok(val) = std::env::var("SAMPLER_INTERVAL_SECS") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.sampler_interval_secs = n,
                _ => {
                    tracing::warn!(value = %val, "Invalid SAMPLER_INTERVAL_SECS, using default");
                }
            }
        }

        if let Ok(val) = std::env::var("BREAKER_ERROR_THRESHOLD") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.breaker.error_threshold = n,
                _ => {
                    tracing::warn!(value = %val, "Invalid BREAKER_ERROR_THRESHOLD, using default");
                }
            }
        }

        if let Ok(val) = std::env::var("BREAKER_OPEN_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.breaker.open_timeout_secs = n,
                _ => {
                    tracing::warn!(value = %val, "Invalid BREAKER_OPEN_TIMEOUT_SECS, using default");
                }
            }
        }

        for category in [
            RateCategory::Auth,
            RateCategory::Api,
            RateCategory::Realtime,
            RateCategory::Content,
            RateCategory::Public,
        ] {
            let var = format!("RATE_LIMIT_{}", category.as_str().to_uppercase());
            if let Ok(val) = std::env::var(&var) {
                match parse_limit(&val) {
                    Some(limit) => {
                        config.limit_overrides.insert(category, limit);
                    }
                    None => {
                        tracing::warn!(var = %var, value = %val, "Invalid rate limit override, ignoring");
                    }
                }
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Parse `tokens:interval_secs:burst` into a limit with base cost 1.
fn parse_limit(val: &str) -> Option<CategoryLimit> {
    let mut parts = val.split(':');
    let tokens = parts.next()?.trim().parse::<f64>().ok()?;
    let interval = parts.next()?.trim().parse::<f64>().ok()?;
    let burst = parts.next()?.trim().parse::<f64>().ok()?;
    if parts.next().is_some() || tokens <= 0.0 || interval <= 0.0 || burst <= 0.0 {
        return None;
    }
    Some(CategoryLimit {
        tokens_per_interval: tokens,
        interval_secs: interval,
        burst,
        base_cost: 1.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.max_connections, 0);
        assert!(config.admin_token.is_none());
        assert_eq!(config.sampler_interval_secs, 60);
        assert!(config.limit_overrides.is_empty());
    }

    #[test]
    fn test_parse_limit() {
        let limit = parse_limit("1200:60:400").unwrap();
        assert_eq!(limit.tokens_per_interval, 1200.0);
        assert_eq!(limit.interval_secs, 60.0);
        assert_eq!(limit.burst, 400.0);
        assert_eq!(limit.base_cost, 1.0);
    }

    #[test]
    fn test_parse_limit_rejects_garbage() {
        assert!(parse_limit("1200:60").is_none());
        assert!(parse_limit("1200:60:400:9").is_none());
        assert!(parse_limit("0:60:400").is_none());
        assert!(parse_limit("abc").is_none());
    }
}
