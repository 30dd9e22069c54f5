//! WebSocket transport: upgrade handling, the per-socket read/write loops,
//! and dispatch of client messages into the registry.
//!
//! The socket never touches room state directly. Inbound frames are parsed,
//! admitted by the limiter, and handed to the registry; outbound traffic is
//! whatever the registry queued on this connection's channel.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use atelier_protect::{RateCategory, RejectReason};
use atelier_shared::protocol::{ClientMessage, ServerMessage};
use atelier_shared::types::{ConnectionId, UserId};

use crate::analytics::AnalyticsEvent;
use crate::api::AppState;
use crate::error::GatewayError;
use crate::registry::PresenceUpdate;

#[derive(Deserialize)]
pub struct WsParams {
    #[serde(default)]
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Result<Response, GatewayError> {
    let token = params.token.as_deref().unwrap_or("");
    let Some(user) = state.authenticator.authenticate(token).await else {
        return Err(GatewayError::Unauthorized);
    };

    let max = state.config.max_connections;
    if max > 0 && state.registry.connection_count().await >= max {
        warn!(user = %user, max, "Connection rejected: at capacity");
        return Err(GatewayError::AtCapacity);
    }

    info!(user = %user, ip = %addr.ip(), "WebSocket upgrade accepted");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user, addr.ip())))
}

async fn handle_socket(socket: WebSocket, state: AppState, user: UserId, ip: IpAddr) {
    let (conn_id, mut outbound) = state.registry.connect(user.clone()).await;
    let (mut sink, mut stream) = socket.split();

    let metrics = state.metrics.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let text = match msg.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize outbound message");
                    continue;
                }
            };
            metrics.record_sent_bytes(text.len() as u64);
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let read_state = state.clone();
    let read_user = user.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => {
                    handle_frame(&read_state, conn_id, &read_user, ip, &text).await;
                }
                Message::Close(_) => break,
                // Pings and pongs are answered at the protocol layer.
                _ => {}
            }
        }
    });

    // Whichever half finishes first takes the other down with it.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.registry.disconnect(conn_id).await;
}

/// Parse, admit, and dispatch one inbound text frame.
async fn handle_frame(
    state: &AppState,
    conn_id: ConnectionId,
    user: &UserId,
    ip: IpAddr,
    text: &str,
) {
    let started = Instant::now();
    state.metrics.record_received(text.len() as u64);

    let decision = state
        .limiter
        .allow(user.as_str(), RateCategory::Realtime, None, Some(ip))
        .await;
    if !decision.allowed {
        let retry_after_secs = decision.retry_after_secs.unwrap_or(1);
        debug!(user = %user, retry_after_secs, "Realtime message rate limited");
        if decision.reason == Some(RejectReason::BurstTraffic) {
            state
                .registry
                .analytics()
                .record(AnalyticsEvent::ViolationRecorded {
                    user: user.clone(),
                    reason: RejectReason::BurstTraffic.as_str(),
                });
        }
        state
            .registry
            .send_to(conn_id, ServerMessage::RateLimited { retry_after_secs })
            .await;
        return;
    }

    // Malformed input is dropped silently; the connection stays up.
    let msg = match ClientMessage::from_json(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(user = %user, error = %e, "Dropping malformed message");
            return;
        }
    };

    dispatch(state, conn_id, msg).await;
    state
        .metrics
        .record_latency_ms(started.elapsed().as_secs_f64() * 1000.0);
}

async fn dispatch(state: &AppState, conn_id: ConnectionId, msg: ClientMessage) {
    let registry = &state.registry;
    match msg {
        ClientMessage::JoinRoom {
            room_id,
            content_id,
            user_data,
            include_resolved_comments,
        } => {
            registry
                .join_room(
                    conn_id,
                    room_id,
                    content_id,
                    user_data,
                    include_resolved_comments,
                )
                .await;
        }
        ClientMessage::LeaveRoom { room_id } => {
            registry.leave_room(conn_id, room_id).await;
        }
        ClientMessage::TypingStatus { is_typing } => {
            registry
                .update_presence(conn_id, PresenceUpdate::Typing { is_typing })
                .await;
        }
        ClientMessage::CursorPosition { cursor } => {
            registry
                .update_presence(conn_id, PresenceUpdate::Cursor { cursor })
                .await;
        }
        ClientMessage::SelectionChange { selection } => {
            registry
                .update_presence(conn_id, PresenceUpdate::Selection { selection })
                .await;
        }
        ClientMessage::ContentOperation { operation } => {
            registry.apply_operation(conn_id, operation).await;
        }
        ClientMessage::AddComment { comment } => {
            registry.add_comment(conn_id, comment).await;
        }
        ClientMessage::ReplyToComment { reply } => {
            registry
                .reply_to_comment(conn_id, reply.comment_id, reply.text)
                .await;
        }
        ClientMessage::ResolveComment { resolve } => {
            registry.resolve_comment(conn_id, resolve.comment_id).await;
        }
        ClientMessage::Ping => {
            registry.send_to(conn_id, ServerMessage::Pong).await;
        }
    }
}
