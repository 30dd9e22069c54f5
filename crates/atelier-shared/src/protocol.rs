use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::ProtocolError;
use crate::types::{ConnectionId, ContentId, RoomId, UserId};

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Kind of a content edit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Insert,
    Delete,
    Replace,
}

/// A content edit as submitted by a client. Positions are offsets into the
/// shared logical position space; no transformation against concurrent
/// edits is performed (last-writer-wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationInput {
    pub op_type: OpType,
    pub position: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// An accepted edit as recorded in the room's operation log and relayed to
/// other members. `version` is the document version this edit produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedOperation {
    pub author: UserId,
    pub op_type: OpType,
    pub position: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
}

/// Caret location within the shared document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorPosition {
    pub position: u64,
}

/// Selection range within the shared document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionRange {
    pub start: u64,
    pub end: u64,
}

/// A new comment as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentInput {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
}

/// A reply to an existing comment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyInput {
    pub comment_id: Uuid,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveInput {
    pub comment_id: Uuid,
}

/// A threaded comment anchored to a document position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub author: UserId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub replies: Vec<CommentReply>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentReply {
    pub id: Uuid,
    pub author: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// One room member's ephemeral state, as reported in the join snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberState {
    pub user_id: UserId,
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// All messages a client may send over its WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinRoom {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_id: Option<ContentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_data: Option<serde_json::Value>,
        #[serde(default)]
        include_resolved_comments: bool,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    TypingStatus {
        is_typing: bool,
    },
    CursorPosition {
        cursor: CursorPosition,
    },
    SelectionChange {
        /// `None` clears the sender's selection.
        #[serde(default)]
        selection: Option<SelectionRange>,
    },
    ContentOperation {
        operation: OperationInput,
    },
    AddComment {
        comment: CommentInput,
    },
    ReplyToComment {
        reply: ReplyInput,
    },
    ResolveComment {
        resolve: ResolveInput,
    },
    Ping,
}

impl ClientMessage {
    /// Parse an inbound text frame.
    ///
    /// Oversized or malformed frames are protocol errors; the caller drops
    /// them silently and keeps the connection.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge {
                size: text.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(serde_json::from_str(text)?)
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// All events the gateway may push to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once, immediately after a successful connect.
    Connected {
        connection_id: ConnectionId,
        protocol: String,
    },
    /// Snapshot sent to the joiner: member list with presence, document
    /// version (if the room has a document), and comments.
    RoomJoined {
        room_id: RoomId,
        members: Vec<MemberState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document_version: Option<u64>,
        comments: Vec<Comment>,
    },
    /// Document identity and current version, sent on join when the room
    /// has a document.
    ContentState {
        room_id: RoomId,
        content_id: ContentId,
        version: u64,
    },
    UserJoinedRoom {
        room_id: RoomId,
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_data: Option<serde_json::Value>,
    },
    UserLeftRoom {
        room_id: RoomId,
        user_id: UserId,
    },
    UserTyping {
        room_id: RoomId,
        user_id: UserId,
        is_typing: bool,
    },
    UserSelection {
        room_id: RoomId,
        user_id: UserId,
        #[serde(default)]
        selection: Option<SelectionRange>,
    },
    UserCursor {
        room_id: RoomId,
        user_id: UserId,
        cursor: CursorPosition,
    },
    ContentOperation {
        room_id: RoomId,
        operation: LoggedOperation,
    },
    CommentAdded {
        room_id: RoomId,
        comment: Comment,
    },
    CommentReplyAdded {
        room_id: RoomId,
        comment_id: Uuid,
        reply: CommentReply,
    },
    CommentResolved {
        room_id: RoomId,
        comment_id: Uuid,
        resolved_by: UserId,
        resolved_at: DateTime<Utc>,
    },
    RateLimited {
        retry_after_secs: u64,
    },
    Pong,
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
