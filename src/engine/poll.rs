use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast};

use super::{
    CreationOutcome, Engine, IgnoreReason, MessageIgnore, Rejection, VoteOutcome, VotePass,
};
use crate::channel::{ChannelError, TextChannel};
use crate::consts::{DEFAULT_BOT_NAME, MAX_RETRY_DELAY, RETRY_LIMIT};
use crate::events::{Event, EventBus};
use crate::feed::{DirectMessage, InboundEvent, LocationRef, MessageKind};
use crate::guard::{AbuseGuard, Clock, Denial, GuardConfig};
use crate::parser;
use crate::render::PollRenderer;
use crate::store::{FailClosed, Poll, PollId, PollOption, PollStore, StoreError, Tally};
use crate::vote::VoteCollector;

pub const DUPLICATE_NOTICE: &str =
    "Sorry but I have already created a poll in response to that comment or submission.";

pub const AUTHOR_LIMIT_NOTICE: &str = "Sorry but you have already created too many polls today. \
     Come back in a day or so and try again.";

pub const COMMUNITY_LIMIT_NOTICE: &str = "Sorry but I have already created too many polls in \
     that community today. If you are a moderator of that community and you would like these \
     restrictions to be lifted, please contact my human. Otherwise try again in about a day or so.";

pub struct EngineConfig {
    /// The bot's own identity. Posts by it are ignored and votes are sent to it.
    pub bot_name: String,
    /// Communities without a creation limit.
    pub exempt_communities: HashSet<String>,
    /// Posts created before this are ignored.
    pub reply_after: Option<DateTime<Utc>>,
    /// Footer appended to everything the bot posts.
    pub signature: Option<String>,
    /// Attempts per channel call while rate limited.
    pub retry_limit: usize,
    pub guard: GuardConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bot_name: DEFAULT_BOT_NAME.to_string(),
            exempt_communities: HashSet::new(),
            reply_after: None,
            signature: None,
            retry_limit: RETRY_LIMIT,
            guard: GuardConfig::default(),
        }
    }
}

/// Drives poll creation and vote tallying.
///
/// Poll creation runs end to end under one async lock that also owns the
/// abuse counters, so two workers can't both pass the duplicate check or the
/// limit check for the same request. Store access always goes through short
/// synchronous [`PollStore::lock`] sections and never spans an `.await`.
pub struct PollEngine {
    config: EngineConfig,
    store: Arc<PollStore>,
    channel: Arc<dyn TextChannel>,
    renderer: PollRenderer,
    votes: VoteCollector,
    creation: Mutex<AbuseGuard>,
    events: EventBus,
}

impl PollEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<PollStore>,
        channel: Arc<dyn TextChannel>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            renderer: PollRenderer::new(config.bot_name.clone()),
            votes: VoteCollector::new(Arc::clone(&store)),
            creation: Mutex::new(AbuseGuard::new(config.guard, clock)),
            events: EventBus::default(),
            config,
            store,
            channel,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Handle one inbox message. Records at most one vote; does not touch
    /// the channel.
    pub fn handle_message(&self, message: &DirectMessage) -> VoteOutcome {
        if message.kind != MessageKind::Private {
            tracing::debug!(message = %message.id, "ignoring non-private message");
            return VoteOutcome::Ignored(MessageIgnore::NotPrivate);
        }
        let Some(voter) = message.author_id.as_deref() else {
            tracing::debug!(message = %message.id, "ignoring message with no author");
            return VoteOutcome::Ignored(MessageIgnore::NoAuthor);
        };

        let Some(poll_id) = parse_subject(&message.subject) else {
            tracing::info!(subject = %message.subject, "cannot parse vote subject");
            return VoteOutcome::Ignored(MessageIgnore::BadSubject);
        };
        let Some(letter) = parse_body(&message.body) else {
            tracing::info!(poll_id, body = %message.body, "cannot parse vote body");
            return VoteOutcome::Ignored(MessageIgnore::BadBody);
        };

        match self.votes.record_vote(poll_id, voter, letter) {
            Ok(option) => {
                self.events.emit(Event::VoteRecorded {
                    poll_id,
                    voter: voter.to_string(),
                    option,
                });
                VoteOutcome::Recorded { poll_id, option }
            }
            Err(reason) => VoteOutcome::Rejected { poll_id, reason },
        }
    }

    /// Re-render a poll from stored state and edit it in place.
    /// Returns whether the edit went through.
    pub async fn refresh_poll(&self, poll_id: PollId) -> bool {
        let Some((poll, options, tally)) = self.snapshot(poll_id) else {
            return false;
        };
        let Some(location_id) = poll.rendered_location_id.as_deref() else {
            tracing::warn!(poll_id, "poll was never posted, nothing to edit");
            return false;
        };

        let texts: Vec<&str> = options.iter().map(|o| o.text.as_str()).collect();
        let text = self.sign(&self.renderer.render(poll.id, &poll.title, &texts, &tally));

        let community = match self
            .with_retry("look up community", || self.channel.community_of(location_id))
            .await
        {
            Ok(Some(community)) => community,
            Ok(None) => {
                tracing::warn!(poll_id, location = location_id, "poll location has vanished");
                return false;
            }
            Err(e) => {
                tracing::error!(error = %e, poll_id, "failed to look up poll community");
                return false;
            }
        };

        let banned = self.store.lock().is_banned(&community).assume_present("ban");
        if banned {
            tracing::warn!(poll_id, %community, "not editing poll in banned community");
            return false;
        }

        match self
            .with_retry("edit poll", || self.channel.edit_reply(location_id, &text))
            .await
        {
            Ok(()) => {
                tracing::info!(poll_id, total = tally.values().sum::<u32>(), "poll updated");
                self.events.emit(Event::PollEdited { poll_id });
                true
            }
            Err(ChannelError::Denied(reason)) => {
                self.ban(&community, &reason);
                false
            }
            Err(e) => {
                tracing::error!(error = %e, poll_id, "failed to edit poll");
                false
            }
        }
    }

    /// Poll, options and tally read under a single lock.
    fn snapshot(&self, poll_id: PollId) -> Option<(Poll, Vec<PollOption>, Tally)> {
        let db = self.store.lock();
        let read = || -> Result<Option<(Poll, Vec<PollOption>, Tally)>, StoreError> {
            let Some(poll) = db.get_poll(poll_id)? else {
                return Ok(None);
            };
            Ok(Some((poll, db.get_options(poll_id)?, db.get_votes(poll_id)?)))
        };
        match read() {
            Ok(Some(snapshot)) => Some(snapshot),
            Ok(None) => {
                tracing::warn!(poll_id, "no such poll");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, poll_id, "failed to read poll");
                None
            }
        }
    }

    /// Run a channel call, sleeping through rate limits up to the retry limit.
    async fn with_retry<T, F, Fut>(&self, action: &str, mut call: F) -> Result<T, ChannelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChannelError>>,
    {
        let mut attempt = 1;
        loop {
            let result = call().await;
            let retry_after = result.as_ref().err().and_then(ChannelError::retry_after);
            match retry_after {
                Some(delay) if attempt < self.config.retry_limit => {
                    let delay = delay.min(MAX_RETRY_DELAY);
                    tracing::warn!(action, attempt, ?delay, "rate limited, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                _ => return result,
            }
        }
    }

    /// Post a signed reply, recording a ban if the channel refuses us.
    async fn post(&self, parent: &LocationRef, text: &str) -> Result<String, ChannelError> {
        let text = self.sign(text);
        let result = self
            .with_retry("post reply", || self.channel.create_reply(parent, &text))
            .await;
        if let Err(ChannelError::Denied(reason)) = &result {
            self.ban(&parent.community_id, reason);
        }
        result
    }

    /// Tell the requester why nothing happened.
    async fn notify(&self, event: &InboundEvent, notice: &str) {
        if let Err(e) = self.post(&event.location, notice).await {
            tracing::error!(error = %e, location = %event.location.id, "failed to post notice");
        }
        self.mark_replied(event);
    }

    fn mark_replied(&self, event: &InboundEvent) {
        if let Err(e) = self.store.lock().mark_replied(&event.location.id) {
            tracing::error!(
                error = %e,
                location = %event.location.id,
                "failed to record reply marker"
            );
        }
    }

    fn ban(&self, community: &str, reason: &str) {
        tracing::warn!(community, reason, "adding ban");
        if let Err(e) = self.store.lock().add_ban(community) {
            tracing::error!(error = %e, community, "failed to record ban");
        }
        self.events.emit(Event::CommunityBanned {
            community: community.to_string(),
        });
    }

    fn sign(&self, text: &str) -> String {
        match &self.config.signature {
            Some(signature) => format!("{text}\n\n----\n{signature}"),
            None => text.to_string(),
        }
    }
}

#[async_trait]
impl Engine for PollEngine {
    async fn handle_post(&self, event: &InboundEvent) -> CreationOutcome {
        if event.author_id.eq_ignore_ascii_case(&self.config.bot_name) {
            return CreationOutcome::Ignored(IgnoreReason::OwnPost);
        }
        if event.raw_text.trim().is_empty() {
            return CreationOutcome::Ignored(IgnoreReason::EmptyText);
        }
        if let Some(cutoff) = self.config.reply_after
            && event.created_at < cutoff
        {
            return CreationOutcome::Ignored(IgnoreReason::TooOld);
        }

        let Some(candidate) = parser::extract(&event.raw_text) else {
            return CreationOutcome::Ignored(IgnoreReason::NoRequest);
        };

        let mut guard = self.creation.lock().await;

        // Checked under the creation lock: a concurrent delivery of the same
        // event must see the marker the first one leaves behind.
        let replied = self
            .store
            .lock()
            .has_replied(&event.location.id)
            .assume_present("reply marker");
        if replied {
            tracing::debug!(location = %event.location.id, "request already handled");
            return CreationOutcome::Ignored(IgnoreReason::AlreadyReplied);
        }

        let target = match self
            .with_retry("resolve target", || self.channel.resolve(&candidate.target))
            .await
        {
            Ok(Some(target)) => target,
            Ok(None) => {
                tracing::warn!(target = %candidate.target, "poll target not found");
                return CreationOutcome::Failed(format!("target {} not found", candidate.target));
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    target = %candidate.target,
                    "failed to resolve poll target"
                );
                return CreationOutcome::Failed(e.to_string());
            }
        };

        let exists = self
            .store
            .lock()
            .has_poll_for_request(&target.id)
            .assume_present("existing poll");
        if exists {
            tracing::info!(target = %target.id, "already started a poll for this target");
            self.notify(event, DUPLICATE_NOTICE).await;
            return CreationOutcome::Rejected(Rejection::DuplicateRequest);
        }

        let banned = self
            .store
            .lock()
            .is_banned(&target.community_id)
            .assume_present("ban");
        if banned {
            tracing::warn!(
                community = %target.community_id,
                "not creating poll in banned community"
            );
            self.mark_replied(event);
            return CreationOutcome::Rejected(Rejection::Banned);
        }

        if let Err(denial) = guard.authorize(
            &event.author_id,
            &target.community_id,
            &self.config.exempt_communities,
        ) {
            let notice = match denial {
                Denial::AuthorLimit => AUTHOR_LIMIT_NOTICE,
                Denial::CommunityLimit => COMMUNITY_LIMIT_NOTICE,
            };
            self.notify(event, notice).await;
            return CreationOutcome::Rejected(Rejection::Limited(denial));
        }

        let created = self.store.lock().create_poll_with_options(
            &target.id,
            &candidate.title,
            &candidate.options,
        );
        let poll_id = match created {
            Ok(poll_id) => poll_id,
            Err(StoreError::DuplicateRequest(_)) => {
                self.notify(event, DUPLICATE_NOTICE).await;
                return CreationOutcome::Rejected(Rejection::DuplicateRequest);
            }
            Err(e) => {
                tracing::error!(error = %e, target = %target.id, "failed to store poll");
                return CreationOutcome::Failed(e.to_string());
            }
        };
        tracing::info!(
            poll_id,
            author = %event.author_id,
            community = %target.community_id,
            "poll created"
        );

        let text = self
            .renderer
            .render(poll_id, &candidate.title, &candidate.options, &Tally::new());
        let location_id = match self.post(&target, &text).await {
            Ok(location_id) => location_id,
            Err(e) => {
                tracing::error!(error = %e, poll_id, "failed to post poll, discarding it");
                // Nothing was posted, so a later delivery may try again.
                if let Err(e) = self.store.lock().discard_unposted_poll(poll_id) {
                    tracing::error!(error = %e, poll_id, "failed to discard unposted poll");
                }
                return CreationOutcome::Failed(e.to_string());
            }
        };

        let stored = self.store.lock().set_rendered_location(poll_id, &location_id);
        if let Err(e) = stored {
            tracing::error!(error = %e, poll_id, "failed to record poll location");
        }
        self.mark_replied(event);
        drop(guard);

        self.events.emit(Event::PollCreated {
            poll_id,
            location_id: location_id.clone(),
        });
        CreationOutcome::Created {
            poll_id,
            location_id,
        }
    }

    async fn run_vote_pass(&self) -> VotePass {
        let messages = match self
            .with_retry("fetch messages", || self.channel.unread_messages())
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                tracing::error!(error = %e, "failed to fetch messages");
                return VotePass::default();
            }
        };
        tracing::info!(count = messages.len(), "processing messages");

        let mut pass = VotePass::default();
        let mut touched = BTreeSet::new();

        for message in &messages {
            let outcome = self.handle_message(message);
            if let VoteOutcome::Recorded { poll_id, .. } = outcome {
                touched.insert(poll_id);
            }
            if let Err(e) = self
                .with_retry("mark processed", || self.channel.mark_processed(&message.id))
                .await
            {
                tracing::warn!(
                    error = %e,
                    message = %message.id,
                    "failed to mark message processed"
                );
            }
            pass.outcomes.push((message.id.clone(), outcome));
        }

        tracing::info!(count = touched.len(), "editing affected polls");
        for poll_id in touched {
            if self.refresh_poll(poll_id).await {
                pass.edited.push(poll_id);
            } else {
                pass.skipped.push(poll_id);
            }
        }
        pass
    }
}

/// `<command> <poll id>`.
fn parse_subject(subject: &str) -> Option<PollId> {
    match subject.split_whitespace().collect::<Vec<_>>().as_slice() {
        [_, id] => id.parse().ok(),
        _ => None,
    }
}

/// `<keyword> <letter>`; the letter itself is validated when recording.
fn parse_body(body: &str) -> Option<&str> {
    match body.split_whitespace().collect::<Vec<_>>().as_slice() {
        [_, letter] => Some(letter),
        _ => None,
    }
}
