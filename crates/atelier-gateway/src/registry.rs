//! Connection registry and room manager.
//!
//! Tracks live connections, their user ownership, and room memberships;
//! mediates every state mutation and broadcast. Constructed once at process
//! start and injected into the transport handlers, so tests get a fresh
//! registry each.
//!
//! All maps live behind one async mutex and no I/O happens while it is
//! held: outbound delivery goes through each connection's bounded queue via
//! `try_send`. A closed queue is a transport failure and tears down that
//! one connection; a full queue drops the message for that slow consumer
//! only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use atelier_shared::constants::{OUTBOUND_QUEUE_SIZE, PROTOCOL_VERSION};
use atelier_shared::protocol::{
    CommentInput, CursorPosition, OperationInput, SelectionRange, ServerMessage,
};
use atelier_shared::types::{ConnectionId, ContentId, RoomId, UserId};

use crate::analytics::{AnalyticsEvent, AnalyticsSink};
use crate::metrics::MetricsRecorder;
use crate::room::Room;

/// A presence change from one connection.
#[derive(Debug, Clone)]
pub enum PresenceUpdate {
    Typing { is_typing: bool },
    Cursor { cursor: CursorPosition },
    Selection { selection: Option<SelectionRange> },
}

struct ConnectionHandle {
    user: UserId,
    tx: mpsc::Sender<ServerMessage>,
    connected_at: Instant,
    /// At most one room per connection; joining a second requires leaving
    /// the first.
    room: Option<RoomId>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    user_connections: HashMap<UserId, HashSet<ConnectionId>>,
    rooms: HashMap<RoomId, Room>,
}

pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    metrics: Arc<MetricsRecorder>,
    analytics: Arc<dyn AnalyticsSink>,
}

impl ConnectionRegistry {
    pub fn new(metrics: Arc<MetricsRecorder>, analytics: Arc<dyn AnalyticsSink>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            metrics,
            analytics,
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Register a connection for `user`. Always succeeds; the returned
    /// receiver carries everything the gateway pushes to this socket,
    /// starting with the `connected` confirmation.
    pub async fn connect(&self, user: UserId) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);

        // Queued before the handle is visible, so it is the first message
        // the client sees.
        let confirmation = ServerMessage::Connected {
            connection_id: id,
            protocol: PROTOCOL_VERSION.to_string(),
        };
        if tx.try_send(confirmation).is_ok() {
            self.metrics.record_sent();
        }

        let mut state = self.state.lock().await;
        state.connections.insert(
            id,
            ConnectionHandle {
                user: user.clone(),
                tx,
                connected_at: Instant::now(),
                room: None,
            },
        );
        state
            .user_connections
            .entry(user.clone())
            .or_default()
            .insert(id);
        drop(state);

        self.metrics.connection_opened();
        self.analytics
            .record(AnalyticsEvent::Connected { user: user.clone() });
        info!(conn = %id, user = %user, "Connection registered");

        (id, rx)
    }

    /// Tear down a connection. No-op if the connection is unknown, so the
    /// transport may call it unconditionally.
    pub async fn disconnect(&self, id: ConnectionId) {
        let mut state = self.state.lock().await;
        let Some(handle) = state.connections.remove(&id) else {
            return;
        };
        Self::unindex(&mut state, &handle.user, id);

        let mut dead = Vec::new();
        if let Some(room_id) = &handle.room {
            self.leave_room_inner(&mut state, &handle.user, room_id, Some(id), &mut dead);
        }
        self.reap(&mut state, dead);
        drop(state);

        let duration_secs = handle.connected_at.elapsed().as_secs();
        self.metrics.connection_closed();
        self.analytics.record(AnalyticsEvent::Disconnected {
            user: handle.user.clone(),
            duration_secs,
        });
        info!(conn = %id, user = %handle.user, duration_secs, "Connection closed");
    }

    // -- rooms --------------------------------------------------------------

    /// Join a room, creating it on first join. Returns `false` if the
    /// connection is unknown or already in a room. The joiner receives a
    /// snapshot; everyone else receives `user_joined_room`.
    pub async fn join_room(
        &self,
        id: ConnectionId,
        room_id: RoomId,
        content_id: Option<ContentId>,
        user_data: Option<serde_json::Value>,
        include_resolved_comments: bool,
    ) -> bool {
        let mut state = self.state.lock().await;
        let user = {
            let Some(handle) = state.connections.get_mut(&id) else {
                return false;
            };
            if let Some(current) = &handle.room {
                debug!(conn = %id, current = %current, requested = %room_id,
                       "Join rejected: connection already in a room");
                return false;
            }
            handle.room = Some(room_id.clone());
            handle.user.clone()
        };

        let room = state.rooms.entry(room_id.clone()).or_insert_with(|| {
            info!(room = %room_id, has_document = content_id.is_some(), "Room created");
            Room::new(content_id)
        });
        room.members.insert(user.clone());

        // Snapshot for the joiner: member presence, document identity and
        // version, comments filtered by the caller-supplied flag.
        let members = room.member_states();
        let document = room
            .document
            .as_ref()
            .map(|d| (d.content_id.clone(), d.version));
        let document_version = document.as_ref().map(|(_, v)| *v);
        let comments = room.snapshot_comments(include_resolved_comments);

        let mut dead = Vec::new();
        self.send_to_connection(
            &state,
            id,
            ServerMessage::RoomJoined {
                room_id: room_id.clone(),
                members,
                document_version,
                comments,
            },
            &mut dead,
        );
        if let Some((content_id, version)) = document {
            self.send_to_connection(
                &state,
                id,
                ServerMessage::ContentState {
                    room_id: room_id.clone(),
                    content_id,
                    version,
                },
                &mut dead,
            );
        }
        self.send_to_room(
            &state,
            &room_id,
            &ServerMessage::UserJoinedRoom {
                room_id: room_id.clone(),
                user_id: user.clone(),
                user_data,
            },
            Some(id),
            &mut dead,
        );
        self.reap(&mut state, dead);
        drop(state);

        self.analytics.record(AnalyticsEvent::RoomJoined {
            user,
            room: room_id,
        });
        true
    }

    /// Leave a room. Returns `false` if the user is not a member. Deletes
    /// the room (document, comments, presence and all) when the last member
    /// leaves.
    pub async fn leave_room(&self, id: ConnectionId, room_id: RoomId) -> bool {
        let mut state = self.state.lock().await;
        let user = {
            let Some(handle) = state.connections.get_mut(&id) else {
                return false;
            };
            if handle.room.as_ref() != Some(&room_id) {
                return false;
            }
            handle.room = None;
            handle.user.clone()
        };

        let mut dead = Vec::new();
        let left = self.leave_room_inner(&mut state, &user, &room_id, Some(id), &mut dead);
        self.reap(&mut state, dead);
        drop(state);

        if left {
            self.analytics.record(AnalyticsEvent::RoomLeft {
                user,
                room: room_id,
            });
        }
        left
    }

    /// Mutate the sender's ephemeral presence and fan the change out to the
    /// rest of the room. Silent no-op without a user/room context.
    pub async fn update_presence(&self, id: ConnectionId, update: PresenceUpdate) {
        let mut state = self.state.lock().await;
        let Some((user, room_id)) = Self::room_context(&state, id) else {
            return;
        };
        let Some(room) = state.rooms.get_mut(&room_id) else {
            return;
        };

        let event = match update {
            PresenceUpdate::Typing { is_typing } => {
                room.set_typing(&user, is_typing);
                ServerMessage::UserTyping {
                    room_id: room_id.clone(),
                    user_id: user,
                    is_typing,
                }
            }
            PresenceUpdate::Cursor { cursor } => {
                room.set_cursor(&user, cursor);
                ServerMessage::UserCursor {
                    room_id: room_id.clone(),
                    user_id: user,
                    cursor,
                }
            }
            PresenceUpdate::Selection { selection } => {
                room.set_selection(&user, selection);
                ServerMessage::UserSelection {
                    room_id: room_id.clone(),
                    user_id: user,
                    selection,
                }
            }
        };

        let mut dead = Vec::new();
        self.send_to_room(&state, &room_id, &event, Some(id), &mut dead);
        self.reap(&mut state, dead);
    }

    /// Apply a content edit to the sender's room. Returns `false` when the
    /// connection has no room or the room has no document state. The
    /// accepted operation (not the document) is broadcast to the rest of
    /// the room.
    pub async fn apply_operation(&self, id: ConnectionId, op: OperationInput) -> bool {
        let mut state = self.state.lock().await;
        let Some((user, room_id)) = Self::room_context(&state, id) else {
            return false;
        };
        let Some(room) = state.rooms.get_mut(&room_id) else {
            return false;
        };
        let Some(logged) = room.apply_operation(&user, op) else {
            debug!(room = %room_id, "Operation rejected: room has no document");
            return false;
        };
        let version = logged.version;

        let mut dead = Vec::new();
        self.send_to_room(
            &state,
            &room_id,
            &ServerMessage::ContentOperation {
                room_id: room_id.clone(),
                operation: logged,
            },
            Some(id),
            &mut dead,
        );
        self.reap(&mut state, dead);
        drop(state);

        self.analytics.record(AnalyticsEvent::OperationApplied {
            user,
            room: room_id,
            version,
        });
        true
    }

    // -- comments -----------------------------------------------------------
    //
    // Unlike cursor/edit events, comment events go to ALL members including
    // the sender: the sender needs the assigned id and timestamp back.

    pub async fn add_comment(&self, id: ConnectionId, input: CommentInput) -> bool {
        let mut state = self.state.lock().await;
        let Some((user, room_id)) = Self::room_context(&state, id) else {
            return false;
        };
        let Some(room) = state.rooms.get_mut(&room_id) else {
            return false;
        };
        let comment = room.add_comment(&user, input);

        let mut dead = Vec::new();
        self.send_to_room(
            &state,
            &room_id,
            &ServerMessage::CommentAdded {
                room_id: room_id.clone(),
                comment,
            },
            None,
            &mut dead,
        );
        self.reap(&mut state, dead);
        true
    }

    pub async fn reply_to_comment(&self, id: ConnectionId, comment_id: Uuid, text: String) -> bool {
        let mut state = self.state.lock().await;
        let Some((user, room_id)) = Self::room_context(&state, id) else {
            return false;
        };
        let Some(room) = state.rooms.get_mut(&room_id) else {
            return false;
        };
        let Some(reply) = room.add_reply(&user, comment_id, text) else {
            debug!(room = %room_id, comment = %comment_id, "Reply rejected: unknown comment");
            return false;
        };

        let mut dead = Vec::new();
        self.send_to_room(
            &state,
            &room_id,
            &ServerMessage::CommentReplyAdded {
                room_id: room_id.clone(),
                comment_id,
                reply,
            },
            None,
            &mut dead,
        );
        self.reap(&mut state, dead);
        true
    }

    pub async fn resolve_comment(&self, id: ConnectionId, comment_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        let Some((user, room_id)) = Self::room_context(&state, id) else {
            return false;
        };
        let Some(room) = state.rooms.get_mut(&room_id) else {
            return false;
        };
        let Some(resolved_at) = room.resolve_comment(&user, comment_id) else {
            debug!(room = %room_id, comment = %comment_id, "Resolve rejected: unknown comment");
            return false;
        };

        let mut dead = Vec::new();
        self.send_to_room(
            &state,
            &room_id,
            &ServerMessage::CommentResolved {
                room_id: room_id.clone(),
                comment_id,
                resolved_by: user,
                resolved_at,
            },
            None,
            &mut dead,
        );
        self.reap(&mut state, dead);
        true
    }

    // -- direct sends and introspection -------------------------------------

    /// Push a message to one connection (pong, rate-limit notices).
    pub async fn send_to(&self, id: ConnectionId, msg: ServerMessage) {
        let mut state = self.state.lock().await;
        let mut dead = Vec::new();
        self.send_to_connection(&state, id, msg, &mut dead);
        self.reap(&mut state, dead);
    }

    pub fn analytics(&self) -> &Arc<dyn AnalyticsSink> {
        &self.analytics
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn room_count(&self) -> usize {
        self.state.lock().await.rooms.len()
    }

    pub async fn room_exists(&self, room_id: &RoomId) -> bool {
        self.state.lock().await.rooms.contains_key(room_id)
    }

    // -- internals -----------------------------------------------------------

    /// Resolve a connection to its user and room, requiring membership:
    /// operations from a connection whose user is not in the room's member
    /// set are unauthorized, not merely stale.
    fn room_context(state: &RegistryState, id: ConnectionId) -> Option<(UserId, RoomId)> {
        let handle = state.connections.get(&id)?;
        let room_id = handle.room.clone()?;
        let room = state.rooms.get(&room_id)?;
        if !room.members.contains(&handle.user) {
            return None;
        }
        Some((handle.user.clone(), room_id))
    }

    fn unindex(state: &mut RegistryState, user: &UserId, id: ConnectionId) {
        if let Some(set) = state.user_connections.get_mut(user) {
            set.remove(&id);
            if set.is_empty() {
                state.user_connections.remove(user);
            }
        }
    }

    /// True while any of `user`'s live connections currently holds
    /// `room_id`. Callers clear or remove the departing connection's handle
    /// first, so it never counts itself.
    fn user_in_room(state: &RegistryState, user: &UserId, room_id: &RoomId) -> bool {
        state.user_connections.get(user).is_some_and(|conns| {
            conns.iter().any(|cid| {
                state
                    .connections
                    .get(cid)
                    .is_some_and(|h| h.room.as_ref() == Some(room_id))
            })
        })
    }

    /// Remove `user` from a room, clearing presence, deleting the room if
    /// it empties, and notifying remaining members. Returns whether the
    /// user was a member.
    ///
    /// Membership is user-keyed while room context is per-connection: when
    /// the user still has a sibling connection in the room, only the
    /// departing connection goes away and the member set is untouched.
    fn leave_room_inner(
        &self,
        state: &mut RegistryState,
        user: &UserId,
        room_id: &RoomId,
        exclude: Option<ConnectionId>,
        dead: &mut Vec<ConnectionId>,
    ) -> bool {
        let Some(room) = state.rooms.get(room_id) else {
            return false;
        };
        if !room.members.contains(user) {
            return false;
        }
        if Self::user_in_room(state, user, room_id) {
            return true;
        }

        let Some(room) = state.rooms.get_mut(room_id) else {
            return false;
        };
        room.members.remove(user);
        room.clear_presence(user);

        if room.is_empty() {
            state.rooms.remove(room_id);
            info!(room = %room_id, "Room deleted (last member left)");
        } else {
            self.send_to_room(
                state,
                room_id,
                &ServerMessage::UserLeftRoom {
                    room_id: room_id.clone(),
                    user_id: user.clone(),
                },
                exclude,
                dead,
            );
        }
        true
    }

    /// Fan a message out to every live connection of every room member,
    /// skipping `exclude`. Dead connections are collected, not cleaned up
    /// inline, so delivery to the remaining members always completes.
    fn send_to_room(
        &self,
        state: &RegistryState,
        room_id: &RoomId,
        msg: &ServerMessage,
        exclude: Option<ConnectionId>,
        dead: &mut Vec<ConnectionId>,
    ) {
        let Some(room) = state.rooms.get(room_id) else {
            return;
        };
        for user in &room.members {
            let Some(conn_ids) = state.user_connections.get(user) else {
                continue;
            };
            for conn_id in conn_ids {
                if Some(*conn_id) == exclude {
                    continue;
                }
                self.send_to_connection(state, *conn_id, msg.clone(), dead);
            }
        }
    }

    fn send_to_connection(
        &self,
        state: &RegistryState,
        id: ConnectionId,
        msg: ServerMessage,
        dead: &mut Vec<ConnectionId>,
    ) {
        let Some(handle) = state.connections.get(&id) else {
            return;
        };
        match handle.tx.try_send(msg) {
            Ok(()) => self.metrics.record_sent(),
            Err(TrySendError::Full(_)) => {
                debug!(conn = %id, "Dropping message for slow connection");
            }
            Err(TrySendError::Closed(_)) => {
                if !dead.contains(&id) {
                    dead.push(id);
                }
            }
        }
    }

    /// Tear down connections whose outbound channel closed mid-broadcast.
    /// Their leave broadcasts may surface further dead connections, which
    /// are processed in the same pass.
    fn reap(&self, state: &mut RegistryState, mut dead: Vec<ConnectionId>) {
        while let Some(id) = dead.pop() {
            let Some(handle) = state.connections.remove(&id) else {
                continue;
            };
            Self::unindex(state, &handle.user, id);
            if let Some(room_id) = &handle.room {
                self.leave_room_inner(state, &handle.user, room_id, Some(id), &mut dead);
            }
            self.metrics.connection_closed();
            self.analytics.record(AnalyticsEvent::Disconnected {
                user: handle.user.clone(),
                duration_secs: handle.connected_at.elapsed().as_secs(),
            });
            warn!(conn = %id, user = %handle.user, "Connection dropped after send failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::TracingSink;
    use atelier_shared::protocol::OpType;
    use tokio::sync::mpsc::Receiver;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(MetricsRecorder::new()), Arc::new(TracingSink))
    }

    fn insert_op(text: &str, position: u64) -> OperationInput {
        OperationInput {
            op_type: OpType::Insert,
            position,
            length: None,
            text: Some(text.to_string()),
        }
    }

    fn delete_op(position: u64, length: u64) -> OperationInput {
        OperationInput {
            op_type: OpType::Delete,
            position,
            length: Some(length),
            text: None,
        }
    }

    /// Drain everything currently queued for a connection.
    fn drain(rx: &mut Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut msgs = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    #[tokio::test]
    async fn test_connect_sends_confirmation() {
        let reg = registry();
        let (id, mut rx) = reg.connect(UserId::new("alice")).await;
        match rx.try_recv().unwrap() {
            ServerMessage::Connected { connection_id, .. } => assert_eq!(connection_id, id),
            other => panic!("expected connected, got {other:?}"),
        }
        assert_eq!(reg.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let reg = registry();
        let (id, _rx) = reg.connect(UserId::new("alice")).await;
        reg.disconnect(id).await;
        reg.disconnect(id).await;
        assert_eq!(reg.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_room_lifecycle() {
        let reg = registry();
        let (id, _rx) = reg.connect(UserId::new("alice")).await;
        let room = RoomId::new("doc-1");

        assert!(!reg.room_exists(&room).await);
        assert!(
            reg.join_room(id, room.clone(), Some(ContentId::new("c1")), None, false)
                .await
        );
        assert!(reg.room_exists(&room).await);

        // Sole member leaves: the room and all its state disappear.
        assert!(reg.leave_room(id, room.clone()).await);
        assert!(!reg.room_exists(&room).await);
        assert_eq!(reg.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_leave_without_membership_fails() {
        let reg = registry();
        let (id, _rx) = reg.connect(UserId::new("alice")).await;
        assert!(!reg.leave_room(id, RoomId::new("doc-1")).await);
    }

    #[tokio::test]
    async fn test_one_room_per_connection() {
        let reg = registry();
        let (id, _rx) = reg.connect(UserId::new("alice")).await;
        assert!(reg.join_room(id, RoomId::new("a"), None, None, false).await);
        assert!(!reg.join_room(id, RoomId::new("b"), None, None, false).await);
        assert!(reg.leave_room(id, RoomId::new("a")).await);
        assert!(reg.join_room(id, RoomId::new("b"), None, None, false).await);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_room() {
        let reg = registry();
        let (a, _rx_a) = reg.connect(UserId::new("alice")).await;
        let (b, mut rx_b) = reg.connect(UserId::new("bob")).await;
        let room = RoomId::new("doc-1");
        reg.join_room(a, room.clone(), None, None, false).await;
        reg.join_room(b, room.clone(), None, None, false).await;
        drain(&mut rx_b);

        reg.disconnect(a).await;
        assert!(reg.room_exists(&room).await);
        let msgs = drain(&mut rx_b);
        assert!(msgs.iter().any(|m| matches!(
            m,
            ServerMessage::UserLeftRoom { user_id, .. } if user_id == &UserId::new("alice")
        )));

        reg.disconnect(b).await;
        assert!(!reg.room_exists(&room).await);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let reg = registry();
        let (a, mut rx_a) = reg.connect(UserId::new("alice")).await;
        let (b, mut rx_b) = reg.connect(UserId::new("bob")).await;
        let room = RoomId::new("doc-1");
        reg.join_room(a, room.clone(), None, None, false).await;
        reg.join_room(b, room.clone(), None, None, false).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        reg.update_presence(
            a,
            PresenceUpdate::Cursor {
                cursor: CursorPosition { position: 7 },
            },
        )
        .await;

        // A never hears its own cursor echo; B does.
        assert!(drain(&mut rx_a).is_empty());
        let msgs = drain(&mut rx_b);
        assert!(matches!(
            msgs.as_slice(),
            [ServerMessage::UserCursor { cursor, .. }] if cursor.position == 7
        ));
    }

    #[tokio::test]
    async fn test_presence_isolated_between_rooms() {
        let reg = registry();
        let (a, _rx_a) = reg.connect(UserId::new("alice")).await;
        let (b, mut rx_b) = reg.connect(UserId::new("bob")).await;
        reg.join_room(a, RoomId::new("r1"), None, None, false).await;
        reg.join_room(b, RoomId::new("r2"), None, None, false).await;
        drain(&mut rx_b);

        reg.update_presence(a, PresenceUpdate::Typing { is_typing: true })
            .await;
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_comment_broadcast_includes_sender() {
        let reg = registry();
        let (a, mut rx_a) = reg.connect(UserId::new("alice")).await;
        let room = RoomId::new("doc-1");
        reg.join_room(a, room.clone(), None, None, false).await;
        drain(&mut rx_a);

        assert!(
            reg.add_comment(
                a,
                CommentInput {
                    text: "first".into(),
                    position: None,
                },
            )
            .await
        );

        // The sender gets the comment back with its assigned id.
        let msgs = drain(&mut rx_a);
        let comment_id = match msgs.as_slice() {
            [ServerMessage::CommentAdded { comment, .. }] => comment.id,
            other => panic!("expected comment_added, got {other:?}"),
        };

        assert!(reg.reply_to_comment(a, comment_id, "reply".into()).await);
        assert!(reg.resolve_comment(a, comment_id).await);
        let msgs = drain(&mut rx_a);
        assert!(matches!(msgs[0], ServerMessage::CommentReplyAdded { .. }));
        assert!(matches!(msgs[1], ServerMessage::CommentResolved { .. }));

        assert!(!reg.resolve_comment(a, Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_operation_requires_document() {
        let reg = registry();
        let (a, _rx) = reg.connect(UserId::new("alice")).await;
        reg.join_room(a, RoomId::new("plain"), None, None, false)
            .await;
        assert!(!reg.apply_operation(a, insert_op("hi", 0)).await);
    }

    #[tokio::test]
    async fn test_end_to_end_edit_session() {
        let reg = registry();
        let room = RoomId::new("doc-1");

        // A joins with a content id: document created at version 1.
        let (a, mut rx_a) = reg.connect(UserId::new("alice")).await;
        assert!(
            reg.join_room(a, room.clone(), Some(ContentId::new("c1")), None, false)
                .await
        );
        let msgs = drain(&mut rx_a);
        assert!(msgs.iter().any(|m| matches!(
            m,
            ServerMessage::RoomJoined { document_version: Some(1), .. }
        )));
        assert!(msgs.iter().any(|m| matches!(
            m,
            ServerMessage::ContentState { content_id, version: 1, .. }
                if content_id == &ContentId::new("c1")
        )));

        // A inserts: version becomes 2.
        assert!(reg.apply_operation(a, insert_op("hi", 0)).await);

        // B joins afterwards: its snapshot reports version 2, and B never
        // sees A's earlier operation (snapshot-then-stream).
        let (b, mut rx_b) = reg.connect(UserId::new("bob")).await;
        assert!(reg.join_room(b, room.clone(), None, None, false).await);
        let msgs = drain(&mut rx_b);
        assert!(msgs.iter().any(|m| matches!(
            m,
            ServerMessage::RoomJoined { document_version: Some(2), .. }
        )));
        assert!(!msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::ContentOperation { .. })));

        // A deletes: version 3, streamed live to B only.
        drain(&mut rx_a);
        assert!(reg.apply_operation(a, delete_op(0, 1)).await);
        let msgs = drain(&mut rx_b);
        match msgs.as_slice() {
            [ServerMessage::ContentOperation { operation, .. }] => {
                assert_eq!(operation.version, 3);
                assert_eq!(operation.op_type, OpType::Delete);
            }
            other => panic!("expected one content_operation, got {other:?}"),
        }
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn test_join_snapshot_reports_presence() {
        let reg = registry();
        let room = RoomId::new("doc-1");
        let (a, _rx_a) = reg.connect(UserId::new("alice")).await;
        reg.join_room(a, room.clone(), None, None, false).await;
        reg.update_presence(a, PresenceUpdate::Typing { is_typing: true })
            .await;
        reg.update_presence(
            a,
            PresenceUpdate::Selection {
                selection: Some(SelectionRange { start: 2, end: 9 }),
            },
        )
        .await;

        let (b, mut rx_b) = reg.connect(UserId::new("bob")).await;
        reg.join_room(b, room.clone(), None, None, false).await;
        let msgs = drain(&mut rx_b);
        let members = msgs
            .iter()
            .find_map(|m| match m {
                ServerMessage::RoomJoined { members, .. } => Some(members.clone()),
                _ => None,
            })
            .expect("room_joined snapshot");
        let alice = members
            .iter()
            .find(|m| m.user_id == UserId::new("alice"))
            .unwrap();
        assert!(alice.is_typing);
        assert_eq!(alice.selection, Some(SelectionRange { start: 2, end: 9 }));
    }

    #[tokio::test]
    async fn test_dead_connection_reaped_on_broadcast() {
        let reg = registry();
        let room = RoomId::new("doc-1");
        let (a, rx_a) = reg.connect(UserId::new("alice")).await;
        let (b, mut rx_b) = reg.connect(UserId::new("bob")).await;
        reg.join_room(a, room.clone(), None, None, false).await;
        reg.join_room(b, room.clone(), None, None, false).await;
        drain(&mut rx_b);

        // A's receiver goes away (socket died). The next broadcast tears A
        // down and still reaches B.
        drop(rx_a);
        reg.update_presence(b, PresenceUpdate::Typing { is_typing: true })
            .await;
        assert_eq!(reg.connection_count().await, 1);

        // B is told A left.
        let msgs = drain(&mut rx_b);
        assert!(msgs.iter().any(|m| matches!(
            m,
            ServerMessage::UserLeftRoom { user_id, .. } if user_id == &UserId::new("alice")
        )));
    }

    #[tokio::test]
    async fn test_multi_tab_leave_keeps_membership() {
        let reg = registry();
        let room = RoomId::new("doc-1");
        let (a1, _rx_a1) = reg.connect(UserId::new("alice")).await;
        let (a2, _rx_a2) = reg.connect(UserId::new("alice")).await;
        let (b, mut rx_b) = reg.connect(UserId::new("bob")).await;
        reg.join_room(a1, room.clone(), Some(ContentId::new("c1")), None, false)
            .await;
        reg.join_room(a2, room.clone(), None, None, false).await;
        reg.join_room(b, room.clone(), None, None, false).await;
        drain(&mut rx_b);

        // One tab leaves: the other still holds the room, so alice stays a
        // member and nobody is told she left.
        assert!(reg.leave_room(a1, room.clone()).await);
        assert!(drain(&mut rx_b)
            .iter()
            .all(|m| !matches!(m, ServerMessage::UserLeftRoom { .. })));

        // The remaining tab keeps editing and bob keeps receiving.
        assert!(reg.apply_operation(a2, insert_op("still here", 0)).await);
        let msgs = drain(&mut rx_b);
        assert!(matches!(
            msgs.as_slice(),
            [ServerMessage::ContentOperation { .. }]
        ));

        // The last tab leaving ends the membership for real.
        assert!(reg.leave_room(a2, room.clone()).await);
        let msgs = drain(&mut rx_b);
        assert!(msgs.iter().any(|m| matches!(
            m,
            ServerMessage::UserLeftRoom { user_id, .. } if user_id == &UserId::new("alice")
        )));
        assert!(!reg.apply_operation(a2, insert_op("ghost", 0)).await);
    }

    #[tokio::test]
    async fn test_multi_tab_disconnect_keeps_membership() {
        let reg = registry();
        let room = RoomId::new("doc-1");
        let (a1, _rx_a1) = reg.connect(UserId::new("alice")).await;
        let (a2, _rx_a2) = reg.connect(UserId::new("alice")).await;
        reg.join_room(a1, room.clone(), None, None, false).await;
        reg.join_room(a2, room.clone(), None, None, false).await;

        reg.disconnect(a1).await;
        assert!(reg.room_exists(&room).await);

        // A fresh joiner's snapshot still lists alice through the
        // surviving tab.
        let (b, mut rx_b) = reg.connect(UserId::new("bob")).await;
        reg.join_room(b, room.clone(), None, None, false).await;
        let members = drain(&mut rx_b)
            .iter()
            .find_map(|m| match m {
                ServerMessage::RoomJoined { members, .. } => Some(members.clone()),
                _ => None,
            })
            .expect("room_joined snapshot");
        assert!(members
            .iter()
            .any(|m| m.user_id == UserId::new("alice")));

        reg.disconnect(a2).await;
        reg.disconnect(b).await;
        assert!(!reg.room_exists(&room).await);
    }

    #[tokio::test]
    async fn test_multi_tab_user_receives_on_all_connections() {
        let reg = registry();
        let room = RoomId::new("doc-1");
        let (a1, _rx_a1) = reg.connect(UserId::new("alice")).await;
        let (_a2, mut rx_a2) = reg.connect(UserId::new("alice")).await;
        let (b, mut rx_b) = reg.connect(UserId::new("bob")).await;
        reg.join_room(a1, room.clone(), None, None, false).await;
        reg.join_room(b, room.clone(), None, None, false).await;
        drain(&mut rx_a2);
        drain(&mut rx_b);

        // A broadcast from bob reaches both of alice's connections: the
        // second tab shares the user's membership.
        reg.update_presence(b, PresenceUpdate::Typing { is_typing: true })
            .await;
        assert_eq!(drain(&mut rx_a2).len(), 1);
    }
}
