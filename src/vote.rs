//! One vote per voter per poll.

use std::fmt;
use std::sync::Arc;

use crate::store::{PollId, PollStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteRejection {
    /// Not a single letter in `a..=z`.
    InvalidLetter,
    UnknownPoll,
    /// The voter already has a vote in this poll. Votes are never replaced.
    Duplicate,
    /// The store failed; nothing was recorded.
    Storage,
}

impl fmt::Display for VoteRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            VoteRejection::InvalidLetter => "invalid option letter",
            VoteRejection::UnknownPoll => "no such poll",
            VoteRejection::Duplicate => "already voted",
            VoteRejection::Storage => "storage fault",
        };
        f.write_str(reason)
    }
}

/// Map a vote letter to its option index.
pub fn option_index(letter: &str) -> Option<usize> {
    let mut chars = letter.chars();
    match (chars.next(), chars.next()) {
        (Some(c @ 'a'..='z'), None) => Some(c as usize - 'a' as usize),
        _ => None,
    }
}

pub struct VoteCollector {
    store: Arc<PollStore>,
}

impl VoteCollector {
    pub fn new(store: Arc<PollStore>) -> Self {
        Self { store }
    }

    /// Record `voter`'s vote for the option named by `letter`.
    ///
    /// The letter is not checked against the poll's option count: a vote for
    /// an option the poll doesn't have is stored and simply never shows up
    /// in the rendered tally. Returns the recorded option index.
    pub fn record_vote(
        &self,
        poll_id: PollId,
        voter: &str,
        letter: &str,
    ) -> Result<usize, VoteRejection> {
        let Some(index) = option_index(letter) else {
            tracing::debug!(poll_id, voter, letter, "vote rejected: invalid letter");
            return Err(VoteRejection::InvalidLetter);
        };

        let db = self.store.lock();

        match db.get_poll(poll_id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::debug!(poll_id, voter, "vote rejected: unknown poll");
                return Err(VoteRejection::UnknownPoll);
            }
            Err(e) => {
                tracing::error!(error = %e, poll_id, "failed to look up poll for vote");
                return Err(VoteRejection::Storage);
            }
        }

        match db.has_vote(poll_id, voter) {
            Ok(false) => {}
            Ok(true) => {
                tracing::info!(poll_id, voter, "vote already present");
                return Err(VoteRejection::Duplicate);
            }
            Err(e) => {
                tracing::error!(error = %e, poll_id, voter, "failed to check for existing vote");
                return Err(VoteRejection::Storage);
            }
        }

        if let Err(e) = db.insert_vote(poll_id, voter, index) {
            tracing::error!(error = %e, poll_id, voter, "failed to record vote");
            return Err(VoteRejection::Storage);
        }

        tracing::info!(poll_id, voter, option = index, "vote recorded");
        Ok(index)
    }
}
