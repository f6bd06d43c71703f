use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{ChannelError, TextChannel};
use crate::feed::{DirectMessage, LocationKind, LocationRef};
use crate::parser::TargetLocation;

/// A reply the engine posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedReply {
    pub parent_id: String,
    pub location_id: String,
    pub text: String,
}

/// An edit the engine made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditedReply {
    pub location_id: String,
    pub text: String,
}

/// In-memory channel for tests. Records everything and can be scripted to
/// fail the next create or edit calls.
#[derive(Default)]
pub struct MockChannel {
    locations: Mutex<HashMap<String, LocationRef>>,
    inbox: Mutex<Vec<DirectMessage>>,
    create_errors: Mutex<VecDeque<ChannelError>>,
    edit_errors: Mutex<VecDeque<ChannelError>>,
    next_id: AtomicUsize,
    create_calls: AtomicUsize,
    edit_calls: AtomicUsize,
    replies: Mutex<Vec<PostedReply>>,
    edits: Mutex<Vec<EditedReply>>,
    processed: Mutex<Vec<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a location resolvable.
    pub fn add_location(&self, location: LocationRef) {
        lock(&self.locations).insert(location.id.clone(), location);
    }

    /// Register a post with the given id in `community`, returning it.
    pub fn add_post(&self, id: &str, community: &str) -> LocationRef {
        let location = LocationRef {
            id: id.to_string(),
            community_id: community.to_string(),
            permalink: format!("/r/{community}/comments/{id}"),
            kind: LocationKind::Post,
        };
        self.add_location(location.clone());
        location
    }

    pub fn push_message(&self, message: DirectMessage) {
        lock(&self.inbox).push(message);
    }

    /// Fail the next `create_reply` call with `error`.
    pub fn queue_create_error(&self, error: ChannelError) {
        lock(&self.create_errors).push_back(error);
    }

    /// Fail the next `edit_reply` call with `error`.
    pub fn queue_edit_error(&self, error: ChannelError) {
        lock(&self.edit_errors).push_back(error);
    }

    pub fn replies(&self) -> Vec<PostedReply> {
        lock(&self.replies).clone()
    }

    pub fn replies_to(&self, parent_id: &str) -> Vec<PostedReply> {
        lock(&self.replies)
            .iter()
            .filter(|r| r.parent_id == parent_id)
            .cloned()
            .collect()
    }

    pub fn edits(&self) -> Vec<EditedReply> {
        lock(&self.edits).clone()
    }

    pub fn processed(&self) -> Vec<String> {
        lock(&self.processed).clone()
    }

    pub fn unread_count(&self) -> usize {
        lock(&self.inbox).len()
    }

    /// Number of `create_reply` attempts, failed ones included.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of `edit_reply` attempts, failed ones included.
    pub fn edit_calls(&self) -> usize {
        self.edit_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextChannel for MockChannel {
    async fn resolve(&self, target: &TargetLocation) -> Result<Option<LocationRef>, ChannelError> {
        Ok(lock(&self.locations).get(&target.location_id()).cloned())
    }

    async fn create_reply(&self, parent: &LocationRef, text: &str) -> Result<String, ChannelError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.create_errors).pop_front() {
            return Err(error);
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let location_id = format!("t1_mock{n}");
        self.add_location(LocationRef {
            id: location_id.clone(),
            community_id: parent.community_id.clone(),
            permalink: format!("{}/{location_id}", parent.permalink),
            kind: LocationKind::Reply,
        });
        lock(&self.replies).push(PostedReply {
            parent_id: parent.id.clone(),
            location_id: location_id.clone(),
            text: text.to_string(),
        });
        Ok(location_id)
    }

    async fn edit_reply(&self, location_id: &str, text: &str) -> Result<(), ChannelError> {
        self.edit_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.edit_errors).pop_front() {
            return Err(error);
        }
        if !lock(&self.locations).contains_key(location_id) {
            return Err(ChannelError::Failed(format!("no such location: {location_id}")));
        }
        lock(&self.edits).push(EditedReply {
            location_id: location_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn community_of(&self, location_id: &str) -> Result<Option<String>, ChannelError> {
        Ok(lock(&self.locations)
            .get(location_id)
            .map(|l| l.community_id.clone()))
    }

    async fn unread_messages(&self) -> Result<Vec<DirectMessage>, ChannelError> {
        Ok(lock(&self.inbox).clone())
    }

    async fn mark_processed(&self, message_id: &str) -> Result<(), ChannelError> {
        lock(&self.inbox).retain(|m| m.id != message_id);
        lock(&self.processed).push(message_id.to_string());
        Ok(())
    }
}
