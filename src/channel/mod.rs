//! The outbound text channel and inbox the engine talks to.
//!
//! The engine never touches the network itself. Everything it posts, edits
//! or reads goes through a [`TextChannel`].

pub mod console;
pub mod mock;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::feed::{DirectMessage, LocationRef};
use crate::parser::TargetLocation;

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// Transient; the channel says when to try again.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    /// Permanent refusal, e.g. the bot is banned from the community.
    #[error("permission denied: {0}")]
    Denied(String),
    #[error("channel failure: {0}")]
    Failed(String),
}

impl ChannelError {
    /// How long to wait before trying again, for errors worth retrying.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            Self::Denied(_) | Self::Failed(_) => None,
        }
    }
}

#[async_trait]
pub trait TextChannel: Send + Sync {
    /// Look up the location a poll request points at.
    async fn resolve(&self, target: &TargetLocation) -> Result<Option<LocationRef>, ChannelError>;

    /// Post `text` as a reply to `parent`. Returns the new location's id.
    async fn create_reply(&self, parent: &LocationRef, text: &str) -> Result<String, ChannelError>;

    /// Replace the text of a reply the bot posted earlier.
    async fn edit_reply(&self, location_id: &str, text: &str) -> Result<(), ChannelError>;

    /// Community a location belongs to.
    async fn community_of(&self, location_id: &str) -> Result<Option<String>, ChannelError>;

    /// Unread inbox messages.
    async fn unread_messages(&self) -> Result<Vec<DirectMessage>, ChannelError>;

    /// Mark an inbox message as handled so it is not delivered again.
    async fn mark_processed(&self, message_id: &str) -> Result<(), ChannelError>;
}
