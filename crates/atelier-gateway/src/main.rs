//! # atelier-gateway
//!
//! Realtime collaboration and protection gateway.
//!
//! This binary provides:
//! - **WebSocket endpoint** (axum) for collaborative editing sessions:
//!   rooms, presence, a versioned operation log, and threaded comments
//! - **Connection registry** that owns all live connection and room state
//!   and fans events out over per-connection queues
//! - **Protection stack**: per-key token buckets with category limits and
//!   endpoint surcharges, an IP blocklist, and a global circuit breaker
//! - **REST API** for health checks, instance info, and admin operations
//! - **Metrics sampler** logging per-interval traffic summaries

mod analytics;
mod api;
mod auth;
mod config;
mod error;
mod metrics;
mod registry;
mod room;
mod ws;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use atelier_protect::{CircuitBreaker, IpBlocklist, MemoryStore, MonotonicClock, RateLimiter};

use crate::analytics::TracingSink;
use crate::api::AppState;
use crate::auth::DevTokenAuthenticator;
use crate::config::GatewayConfig;
use crate::metrics::{spawn_sampler, MetricsRecorder};
use crate::registry::ConnectionRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,atelier_gateway=debug")),
        )
        .init();

    info!("Starting Atelier gateway v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = GatewayConfig::from_env();
    info!(?config, "Loaded configuration");
    info!(
        instance = %config.instance_name,
        max_connections = config.max_connections,
        admin_enabled = config.admin_token.is_some(),
        "Instance settings"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Protection stack: shared clock, bucket store, blocklist, breaker.
    let clock = Arc::new(MonotonicClock::default());
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let blocklist = IpBlocklist::new(clock.clone());
    let breaker = CircuitBreaker::new(config.breaker.clone(), clock.clone());
    let mut limiter = RateLimiter::new(store.clone(), clock, blocklist, breaker);
    for (category, limit) in &config.limit_overrides {
        limiter = limiter.with_limit(*category, *limit);
    }

    // Registry, metrics, analytics, dev authenticator.
    let metrics = Arc::new(MetricsRecorder::new());
    let analytics = Arc::new(TracingSink);
    let registry = Arc::new(ConnectionRegistry::new(metrics.clone(), analytics));

    let app_state = AppState {
        registry,
        limiter,
        metrics: metrics.clone(),
        authenticator: Arc::new(DevTokenAuthenticator),
        config: Arc::new(config.clone()),
        started_at: std::time::Instant::now(),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sampler = spawn_sampler(metrics, config.sampler_interval_secs, shutdown_rx);

    // Periodic bucket store cleanup (every 5 minutes).
    let purge_store = store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            purge_store.purge_expired().await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    // Stop the sampler; the final partial interval is discarded.
    let _ = shutdown_tx.send(true);
    let _ = sampler.await;

    Ok(())
}
