//! # atelier-shared
//!
//! Wire protocol and identifier types shared between the Atelier gateway
//! and its clients.  The collaboration channel is a single bidirectional
//! WebSocket per connection, carrying JSON messages tagged with a `type`
//! field; this crate defines both directions of that protocol plus the
//! opaque identifiers used throughout the workspace.

pub mod constants;
pub mod protocol;
pub mod types;

mod error;

pub use error::ProtocolError;
pub use protocol::{ClientMessage, ServerMessage};
pub use types::{ConnectionId, ContentId, RoomId, UserId};
