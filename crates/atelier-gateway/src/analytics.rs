//! Fire-and-forget usage events for the external analytics pipeline.
//!
//! The gateway never waits on the sink; a lost event is acceptable. The
//! default sink logs events; production deployments implement
//! [`AnalyticsSink`] over their event bus.

use atelier_shared::types::{RoomId, UserId};
use tracing::info;

#[derive(Debug, Clone)]
pub enum AnalyticsEvent {
    Connected {
        user: UserId,
    },
    Disconnected {
        user: UserId,
        duration_secs: u64,
    },
    RoomJoined {
        user: UserId,
        room: RoomId,
    },
    RoomLeft {
        user: UserId,
        room: RoomId,
    },
    OperationApplied {
        user: UserId,
        room: RoomId,
        version: u64,
    },
    ViolationRecorded {
        user: UserId,
        reason: &'static str,
    },
}

pub trait AnalyticsSink: Send + Sync {
    fn record(&self, event: AnalyticsEvent);
}

/// Default sink: structured log lines under the `analytics` target.
pub struct TracingSink;

impl AnalyticsSink for TracingSink {
    fn record(&self, event: AnalyticsEvent) {
        match event {
            AnalyticsEvent::Connected { user } => {
                info!(target: "analytics", user = %user, "connected");
            }
            AnalyticsEvent::Disconnected {
                user,
                duration_secs,
            } => {
                info!(target: "analytics", user = %user, duration_secs, "disconnected");
            }
            AnalyticsEvent::RoomJoined { user, room } => {
                info!(target: "analytics", user = %user, room = %room, "room_joined");
            }
            AnalyticsEvent::RoomLeft { user, room } => {
                info!(target: "analytics", user = %user, room = %room, "room_left");
            }
            AnalyticsEvent::OperationApplied {
                user,
                room,
                version,
            } => {
                info!(target: "analytics", user = %user, room = %room, version, "operation_applied");
            }
            AnalyticsEvent::ViolationRecorded { user, reason } => {
                info!(target: "analytics", user = %user, reason, "violation_recorded");
            }
        }
    }
}
