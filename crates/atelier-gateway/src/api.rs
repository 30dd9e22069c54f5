use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Method, Request},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use atelier_protect::{limiter::endpoints, RateCategory, RateLimiter};

use crate::auth::Authenticator;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::metrics::MetricsRecorder;
use crate::registry::ConnectionRegistry;
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub limiter: RateLimiter,
    pub metrics: Arc<MetricsRecorder>,
    pub authenticator: Arc<dyn Authenticator>,
    pub config: Arc<GatewayConfig>,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(gateway_info))
        .route("/ws", get(ws_handler))
        .route("/admin/status", get(admin_status))
        .route("/admin/block-ip", post(admin_block_ip))
        .route("/admin/unblock-ip", post(admin_unblock_ip))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Admission category for an HTTP path.
fn path_category(path: &str) -> RateCategory {
    if path.starts_with("/ws") {
        RateCategory::Realtime
    } else if path.starts_with("/auth") {
        RateCategory::Auth
    } else if path.starts_with("/admin") || path.starts_with("/api") {
        RateCategory::Api
    } else if path.starts_with("/content") {
        RateCategory::Content
    } else {
        RateCategory::Public
    }
}

/// Surcharge key for known-expensive paths.
fn path_endpoint(path: &str) -> Option<&'static str> {
    if path.ends_with("/bulk-import") {
        Some(endpoints::BULK_IMPORT)
    } else if path.ends_with("/reports") {
        Some(endpoints::REPORT_GENERATION)
    } else if path.ends_with("/generate") {
        Some(endpoints::CONTENT_GENERATION)
    } else if path.ends_with("/images") {
        Some(endpoints::IMAGE_UPLOAD)
    } else {
        None
    }
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, GatewayError> {
    let path = req.uri().path().to_string();
    let Some(ip) = extract_client_ip(&req) else {
        // No attributable client; let the request through rather than
        // sharing one anonymous bucket across all of them.
        return Ok(next.run(req).await);
    };

    let decision = state
        .limiter
        .allow(
            &ip.to_string(),
            path_category(&path),
            path_endpoint(&path),
            Some(ip),
        )
        .await;

    if !decision.allowed {
        let reason = decision
            .reason
            .unwrap_or(atelier_protect::RejectReason::RateLimitExceeded);
        warn!(ip = %ip, path = %path, reason = reason.as_str(), "Request rejected");
        return Err(GatewayError::RateLimited {
            reason,
            retry_after_secs: decision.retry_after_secs.unwrap_or(1),
        });
    }

    let mut response = next.run(req).await;

    // Server errors feed the circuit breaker; everything else counts as a
    // success and heals it.
    if response.status().is_server_error() {
        state.limiter.breaker().record_failure().await;
    } else {
        state.limiter.breaker().record_success().await;
    }

    let headers = response.headers_mut();
    if let Some(limit) = decision.limit {
        if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
            headers.insert("x-ratelimit-limit", v);
        }
    }
    if let Some(remaining) = decision.remaining {
        if let Ok(v) = HeaderValue::from_str(&remaining.to_string()) {
            headers.insert("x-ratelimit-remaining", v);
        }
    }
    if let Some(reset) = decision.reset_secs {
        if let Ok(v) = HeaderValue::from_str(&reset.to_string()) {
            headers.insert("x-ratelimit-reset", v);
        }
    }
    Ok(response)
}

/// Try ConnectInfo first, then X-Forwarded-For, then X-Real-IP.
pub fn extract_client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    if let Some(forwarded) = req.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }

    if let Some(real_ip) = req.headers().get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            if let Ok(ip) = value.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }

    None
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct GatewayInfoResponse {
    name: String,
    version: &'static str,
    protocol: &'static str,
    max_connections: usize,
}

#[derive(Serialize)]
struct AdminStatusResponse {
    name: String,
    connections: usize,
    rooms: usize,
    blocked_ips: usize,
    circuit: String,
    uptime_secs: u64,
}

#[derive(Deserialize)]
struct BlockIpRequest {
    ip: String,
    #[serde(default)]
    duration_secs: Option<u64>,
}

#[derive(Deserialize)]
struct UnblockIpRequest {
    ip: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn gateway_info(State(state): State<AppState>) -> Json<GatewayInfoResponse> {
    Json(GatewayInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: atelier_shared::constants::PROTOCOL_VERSION,
        max_connections: state.config.max_connections,
    })
}

fn verify_admin_token(headers: &HeaderMap, config: &GatewayConfig) -> Result<(), GatewayError> {
    let Some(ref expected) = config.admin_token else {
        return Err(GatewayError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    // Constant-time comparison to prevent timing attacks on admin token.
    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(GatewayError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, GatewayError> {
    verify_admin_token(&headers, &state.config)?;

    Ok(Json(AdminStatusResponse {
        name: state.config.instance_name.clone(),
        connections: state.registry.connection_count().await,
        rooms: state.registry.room_count().await,
        blocked_ips: state.limiter.blocklist().len().await,
        circuit: state.limiter.breaker().current_state().await.to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    }))
}

async fn admin_block_ip(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<BlockIpRequest>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    verify_admin_token(&headers, &state.config)?;

    let ip: IpAddr = req
        .ip
        .trim()
        .parse()
        .map_err(|_| GatewayError::BadRequest(format!("Invalid IP address: {}", req.ip)))?;
    let duration = req
        .duration_secs
        .unwrap_or(atelier_protect::blocklist::DEFAULT_BLOCK_SECS);
    state.limiter.blocklist().block(ip, duration).await;

    info!(ip = %ip, duration_secs = duration, "Admin blocked IP");
    Ok(Json(serde_json::json!({ "blocked": true })))
}

async fn admin_unblock_ip(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<UnblockIpRequest>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    verify_admin_token(&headers, &state.config)?;

    let ip: IpAddr = req
        .ip
        .trim()
        .parse()
        .map_err(|_| GatewayError::BadRequest(format!("Invalid IP address: {}", req.ip)))?;
    let removed = state.limiter.blocklist().unblock(ip).await;

    info!(ip = %ip, removed, "Admin unblocked IP");
    Ok(Json(serde_json::json!({ "removed": removed })))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    Ok(())
}
