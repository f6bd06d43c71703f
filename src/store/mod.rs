//! Durable poll state: polls, options, votes, reply markers and bans.

pub mod sqlite;

pub use sqlite::{PollStore, StoreGuard};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type PollId = i64;

/// Votes per option index.
pub type Tally = BTreeMap<usize, u32>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub id: PollId,
    pub title: String,
    /// The location whose request created this poll. Unique.
    pub request_location_id: String,
    /// Where the rendered poll lives, once posted.
    pub rendered_location_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    pub poll_id: PollId,
    pub index: usize,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("a poll already exists for request {0}")]
    DuplicateRequest(String),
}

/// Applies the anti-spam default to an existence check: a fault means
/// "assume it's there".
///
/// The store itself always reports faults; callers opt into treating an
/// unknown answer as blocking.
pub trait FailClosed {
    fn assume_present(self, what: &str) -> bool;
}

impl FailClosed for Result<bool, StoreError> {
    fn assume_present(self, what: &str) -> bool {
        match self {
            Ok(present) => present,
            Err(e) => {
                tracing::error!(error = %e, check = what, "storage fault, assuming present");
                true
            }
        }
    }
}
