//! A channel that prints outbound actions as JSON lines.
//!
//! Used by the binary when driven from a feed file: nothing is posted
//! anywhere, every create and edit is written out for a downstream process
//! to pick up.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;

use super::{ChannelError, TextChannel};
use crate::feed::{DirectMessage, LocationKind, LocationRef};
use crate::parser::TargetLocation;

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Action<'a> {
    CreateReply {
        parent_id: &'a str,
        location_id: &'a str,
        text: &'a str,
    },
    EditReply {
        location_id: &'a str,
        text: &'a str,
    },
}

pub struct ConsoleChannel {
    /// Community assumed for targets the feed never mentioned.
    default_community: String,
    locations: Mutex<HashMap<String, LocationRef>>,
    inbox: Mutex<Vec<DirectMessage>>,
    next_id: AtomicUsize,
    out: Mutex<Box<dyn Write + Send>>,
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConsoleChannel {
    pub fn new(default_community: impl Into<String>, out: Box<dyn Write + Send>) -> Self {
        Self {
            default_community: default_community.into(),
            locations: Mutex::new(HashMap::new()),
            inbox: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            out: Mutex::new(out),
        }
    }

    pub fn stdout(default_community: impl Into<String>) -> Self {
        Self::new(default_community, Box::new(std::io::stdout()))
    }

    /// Remember a location seen in the feed so later lookups know its
    /// community.
    pub fn observe(&self, location: &LocationRef) {
        lock(&self.locations).insert(location.id.clone(), location.clone());
    }

    pub fn push_message(&self, message: DirectMessage) {
        lock(&self.inbox).push(message);
    }

    fn emit(&self, action: &Action<'_>) -> Result<(), ChannelError> {
        let line = serde_json::to_string(action).map_err(|e| ChannelError::Failed(e.to_string()))?;
        let mut out = lock(&self.out);
        writeln!(out, "{line}").map_err(|e| ChannelError::Failed(e.to_string()))?;
        out.flush().map_err(|e| ChannelError::Failed(e.to_string()))
    }
}

#[async_trait]
impl TextChannel for ConsoleChannel {
    async fn resolve(&self, target: &TargetLocation) -> Result<Option<LocationRef>, ChannelError> {
        let id = target.location_id();
        let mut locations = lock(&self.locations);
        let location = locations.entry(id.clone()).or_insert_with(|| LocationRef {
            id: id.clone(),
            community_id: self.default_community.clone(),
            permalink: id.clone(),
            kind: target.kind(),
        });
        Ok(Some(location.clone()))
    }

    async fn create_reply(&self, parent: &LocationRef, text: &str) -> Result<String, ChannelError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let location_id = format!("t1_console{n}");
        self.emit(&Action::CreateReply {
            parent_id: &parent.id,
            location_id: &location_id,
            text,
        })?;
        self.observe(&LocationRef {
            id: location_id.clone(),
            community_id: parent.community_id.clone(),
            permalink: format!("{}/{location_id}", parent.permalink),
            kind: LocationKind::Reply,
        });
        Ok(location_id)
    }

    async fn edit_reply(&self, location_id: &str, text: &str) -> Result<(), ChannelError> {
        self.emit(&Action::EditReply { location_id, text })
    }

    async fn community_of(&self, location_id: &str) -> Result<Option<String>, ChannelError> {
        let known = lock(&self.locations)
            .get(location_id)
            .map(|l| l.community_id.clone());
        Ok(Some(known.unwrap_or_else(|| self.default_community.clone())))
    }

    async fn unread_messages(&self) -> Result<Vec<DirectMessage>, ChannelError> {
        Ok(lock(&self.inbox).clone())
    }

    async fn mark_processed(&self, message_id: &str) -> Result<(), ChannelError> {
        lock(&self.inbox).retain(|m| m.id != message_id);
        Ok(())
    }
}
