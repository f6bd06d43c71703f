pub mod poll;

pub use poll::{EngineConfig, PollEngine};

use async_trait::async_trait;

use crate::feed::InboundEvent;
use crate::guard::Denial;
use crate::store::PollId;
use crate::vote::VoteRejection;

/// The outermost boundary. main.rs only knows this trait.
#[async_trait]
pub trait Engine: Send + Sync {
    /// React to a post or reply that may hold a poll request.
    async fn handle_post(&self, event: &InboundEvent) -> CreationOutcome;

    /// Pull unread messages, record the votes among them, and re-render
    /// every poll that got a vote.
    async fn run_vote_pass(&self) -> VotePass;
}

/// What became of an inbound post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationOutcome {
    Created { poll_id: PollId, location_id: String },
    /// Not ours to act on. No side effects.
    Ignored(IgnoreReason),
    /// A request we refused; the requester usually gets a notice.
    Rejected(Rejection),
    /// Something broke partway. Logged.
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    OwnPost,
    EmptyText,
    /// Created before the reply-after cutoff.
    TooOld,
    NoRequest,
    AlreadyReplied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    DuplicateRequest,
    Limited(Denial),
    /// The target community has banned the bot.
    Banned,
}

/// What became of one inbox message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    Recorded { poll_id: PollId, option: usize },
    Rejected { poll_id: PollId, reason: VoteRejection },
    Ignored(MessageIgnore),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageIgnore {
    NotPrivate,
    NoAuthor,
    /// Subject isn't `<command> <poll id>`.
    BadSubject,
    /// Body isn't `<keyword> <letter>`.
    BadBody,
}

/// Summary of one vote pass.
#[derive(Debug, Default)]
pub struct VotePass {
    /// Outcome per message id, in inbox order.
    pub outcomes: Vec<(String, VoteOutcome)>,
    /// Polls re-rendered and edited, once each.
    pub edited: Vec<PollId>,
    /// Polls that got votes but could not be edited.
    pub skipped: Vec<PollId>,
}

impl VotePass {
    pub fn recorded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, VoteOutcome::Recorded { .. }))
            .count()
    }
}
