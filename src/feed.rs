//! Items delivered to the engine by the listener and the inbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a location is a top-level post or a reply inside one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationKind {
    Post,
    Reply,
}

/// A place text can be posted to or read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRef {
    /// Channel-wide identifier of the location.
    pub id: String,
    pub community_id: String,
    pub permalink: String,
    pub kind: LocationKind,
}

/// A post or reply observed by the listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub id: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
    pub raw_text: String,
    pub location: LocationRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// A private message addressed to the bot.
    Private,
    /// Anything else landing in the inbox (reply notifications, mentions).
    Other,
}

/// An unread inbox item. Votes arrive this way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectMessage {
    pub id: String,
    pub kind: MessageKind,
    /// `None` when the sender account was deleted.
    pub author_id: Option<String>,
    pub subject: String,
    pub body: String,
}

/// One line of the JSON-lines feed consumed by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FeedItem {
    Post(InboundEvent),
    Message(DirectMessage),
}
