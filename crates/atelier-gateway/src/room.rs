//! Per-room collaboration state: members, the document version counter and
//! operation log, ephemeral presence maps, and threaded comments.
//!
//! A room exists iff at least one user is a member; the registry creates it
//! on first join and deletes it on last leave, so abandoned rooms never
//! accumulate.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use atelier_shared::protocol::{
    Comment, CommentInput, CommentReply, CursorPosition, LoggedOperation, MemberState, OpType,
    OperationInput, SelectionRange,
};
use atelier_shared::types::{ContentId, UserId};

/// Version counter plus append-only operation log for a room's shared
/// document. The durable document lives in the persistence layer; this is
/// an in-memory cache of the edit stream.
#[derive(Debug)]
pub struct DocumentState {
    pub content_id: ContentId,
    /// Monotonic, gapless. Starts at 1; each accepted edit adds one.
    pub version: u64,
    pub operations: Vec<LoggedOperation>,
}

impl DocumentState {
    fn new(content_id: ContentId) -> Self {
        Self {
            content_id,
            version: 1,
            operations: Vec::new(),
        }
    }

    /// Accept an edit: bump the version and append to the log.
    ///
    /// Operations apply last-writer-wins against the shared position space,
    /// with no transformation against concurrent edits. A multi-writer
    /// deployment that needs true convergence would put OT or a CRDT behind
    /// this same call.
    pub fn apply(&mut self, author: &UserId, op: OperationInput) -> LoggedOperation {
        self.version += 1;
        let logged = LoggedOperation {
            author: author.clone(),
            op_type: op.op_type,
            position: op.position,
            length: op.length,
            text: op.text,
            timestamp: Utc::now(),
            version: self.version,
        };
        self.operations.push(logged.clone());
        logged
    }
}

/// A collaboration room.
#[derive(Debug)]
pub struct Room {
    pub members: HashSet<UserId>,
    pub document: Option<DocumentState>,
    typing: HashMap<UserId, DateTime<Utc>>,
    selections: HashMap<UserId, (SelectionRange, DateTime<Utc>)>,
    cursors: HashMap<UserId, (CursorPosition, DateTime<Utc>)>,
    comments: Vec<Comment>,
}

impl Room {
    /// A fresh room. Document state exists only when a content id was
    /// supplied on the creating join, and never appears later.
    pub fn new(content_id: Option<ContentId>) -> Self {
        Self {
            members: HashSet::new(),
            document: content_id.map(DocumentState::new),
            typing: HashMap::new(),
            selections: HashMap::new(),
            cursors: HashMap::new(),
            comments: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    // -- presence -----------------------------------------------------------

    pub fn set_typing(&mut self, user: &UserId, is_typing: bool) {
        if is_typing {
            self.typing.insert(user.clone(), Utc::now());
        } else {
            self.typing.remove(user);
        }
    }

    pub fn set_selection(&mut self, user: &UserId, selection: Option<SelectionRange>) {
        match selection {
            Some(range) => {
                self.selections.insert(user.clone(), (range, Utc::now()));
            }
            None => {
                self.selections.remove(user);
            }
        }
    }

    pub fn set_cursor(&mut self, user: &UserId, cursor: CursorPosition) {
        self.cursors.insert(user.clone(), (cursor, Utc::now()));
    }

    /// Drop all of a user's ephemeral state. Called on leave.
    pub fn clear_presence(&mut self, user: &UserId) {
        self.typing.remove(user);
        self.selections.remove(user);
        self.cursors.remove(user);
    }

    /// Member list with each member's current presence, for the join
    /// snapshot.
    pub fn member_states(&self) -> Vec<MemberState> {
        self.members
            .iter()
            .map(|user| MemberState {
                user_id: user.clone(),
                is_typing: self.typing.contains_key(user),
                selection: self.selections.get(user).map(|(range, _)| *range),
                cursor: self.cursors.get(user).map(|(cursor, _)| *cursor),
            })
            .collect()
    }

    // -- comments -----------------------------------------------------------

    pub fn add_comment(&mut self, author: &UserId, input: CommentInput) -> Comment {
        let comment = Comment {
            id: Uuid::new_v4(),
            author: author.clone(),
            text: input.text,
            position: input.position,
            resolved: false,
            resolved_by: None,
            resolved_at: None,
            created_at: Utc::now(),
            replies: Vec::new(),
        };
        self.comments.push(comment.clone());
        comment
    }

    pub fn add_reply(
        &mut self,
        author: &UserId,
        comment_id: Uuid,
        text: String,
    ) -> Option<CommentReply> {
        let comment = self.comments.iter_mut().find(|c| c.id == comment_id)?;
        let reply = CommentReply {
            id: Uuid::new_v4(),
            author: author.clone(),
            text,
            created_at: Utc::now(),
        };
        comment.replies.push(reply.clone());
        Some(reply)
    }

    pub fn resolve_comment(&mut self, by: &UserId, comment_id: Uuid) -> Option<DateTime<Utc>> {
        let comment = self.comments.iter_mut().find(|c| c.id == comment_id)?;
        let resolved_at = Utc::now();
        comment.resolved = true;
        comment.resolved_by = Some(by.clone());
        comment.resolved_at = Some(resolved_at);
        Some(resolved_at)
    }

    /// Comments for the join snapshot: unresolved only, or everything.
    pub fn snapshot_comments(&self, include_resolved: bool) -> Vec<Comment> {
        self.comments
            .iter()
            .filter(|c| include_resolved || !c.resolved)
            .cloned()
            .collect()
    }

    /// Apply an edit to the room's document, if it has one.
    pub fn apply_operation(
        &mut self,
        author: &UserId,
        op: OperationInput,
    ) -> Option<LoggedOperation> {
        self.document.as_mut().map(|doc| doc.apply(author, op))
    }
}
