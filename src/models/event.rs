//! Gateway protocol: JSON events exchanged over the WebSocket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::message::{Message, MessageId};
use crate::models::position::Position;
use crate::models::presence::{avatar_color, PresenceEntry};
use crate::services::session::SessionPhase;

/// Client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientMessage {
    SignIn { data: SignInPayload },
    Send { data: SendPayload },
    Move { data: MovePayload },
    MarkRead { data: MarkReadPayload },
    Rename { data: RenamePayload },
    TutorialShown,
    SignOut,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SignInPayload {
    #[validate(length(min = 1, max = 10))]
    pub display_name: String,
    /// Falls back to the position the socket was opened with.
    #[serde(default)]
    pub position: Option<Position>,
    /// A token from an earlier `signed_in` keeps the same user id.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SendPayload {
    #[validate(length(min = 1, max = 50))]
    pub text: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MovePayload {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadPayload {
    pub id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RenamePayload {
    #[validate(length(min = 1, max = 10))]
    pub display_name: String,
}

/// Server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ConnectionEstablished {
        socket_id: String,
        position: Position,
        share_query: String,
        saved_display_name: Option<String>,
        tutorial_shown: bool,
    },
    SignedIn {
        user_id: String,
        display_name: String,
        login_epoch: DateTime<Utc>,
        token: String,
    },
    Snapshot(SnapshotView),
    Error {
        message: String,
        code: u16,
    },
    Pong,
}

/// Everything a client renders, pushed whenever it changes.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotView {
    pub phase: SessionPhase,
    pub in_range: bool,
    pub unread_count: usize,
    /// Unread chat, oldest first.
    pub messages: Vec<MessageView>,
    /// All chat in the window, newest first.
    pub log: Vec<MessageView>,
    pub avatars: Vec<AvatarView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub id: MessageId,
    pub text: String,
    pub author_name: String,
    pub color: String,
    pub mine: bool,
    pub position: Position,
    pub created_at: DateTime<Utc>,
}

impl MessageView {
    pub fn from_message(message: &Message, own_user_id: Option<&str>) -> Self {
        Self {
            id: message.id.clone(),
            text: message.text.clone(),
            author_name: message.author_name.clone(),
            color: avatar_color(&message.author_id),
            mine: own_user_id == Some(message.author_id.as_str()),
            position: message.position,
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AvatarView {
    pub user_id: String,
    pub display_name: String,
    pub position: Position,
    pub color: String,
    pub is_self: bool,
}

impl AvatarView {
    pub fn from_entry(entry: &PresenceEntry, own_user_id: Option<&str>) -> Self {
        Self {
            user_id: entry.user_id.clone(),
            display_name: entry.display_name.clone(),
            position: entry.position,
            color: entry.color(),
            is_self: own_user_id == Some(entry.user_id.as_str()),
        }
    }
}
