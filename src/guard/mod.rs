//! Rolling per-author and per-community poll creation limits.
//!
//! Counters live in memory only and reset on restart. The guard is not
//! internally synchronised: the engine owns it behind the same lock that
//! serialises poll creation, so the count check and the increment can't
//! interleave across workers.

pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::consts::{CREATION_LIMIT, RESET_WINDOW_HOURS};

/// Creations counted for one key inside the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreationCounter {
    pub window_start: DateTime<Utc>,
    pub count: u32,
}

/// Why a creation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    AuthorLimit,
    CommunityLimit,
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::AuthorLimit => f.write_str("author creation limit reached"),
            Denial::CommunityLimit => f.write_str("community creation limit reached"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GuardConfig {
    /// Denial happens once the count is strictly greater than this.
    pub limit: u32,
    pub reset_window: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            limit: CREATION_LIMIT,
            reset_window: Duration::hours(RESET_WINDOW_HOURS),
        }
    }
}

pub struct AbuseGuard {
    config: GuardConfig,
    clock: Arc<dyn Clock>,
    by_author: HashMap<String, CreationCounter>,
    by_community: HashMap<String, CreationCounter>,
}

impl AbuseGuard {
    pub fn new(config: GuardConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            by_author: HashMap::new(),
            by_community: HashMap::new(),
        }
    }

    /// Check both counters and, if allowed, count the creation.
    ///
    /// The community counter is neither checked nor bumped for exempt
    /// communities. On success every touched counter has its window start
    /// moved to now, so steady activity keeps extending the window.
    pub fn authorize(
        &mut self,
        author: &str,
        community: &str,
        exempt: &HashSet<String>,
    ) -> Result<(), Denial> {
        let now = self.clock.now();
        let check_community = !exempt.contains(community);

        if !Self::admit(&mut self.by_author, author, now, &self.config) {
            tracing::info!(author, "poll creation denied: author limit");
            return Err(Denial::AuthorLimit);
        }
        if check_community && !Self::admit(&mut self.by_community, community, now, &self.config) {
            tracing::info!(community, "poll creation denied: community limit");
            return Err(Denial::CommunityLimit);
        }

        Self::bump(&mut self.by_author, author, now);
        if check_community {
            Self::bump(&mut self.by_community, community, now);
        }
        Ok(())
    }

    pub fn author_counter(&self, author: &str) -> Option<CreationCounter> {
        self.by_author.get(author).copied()
    }

    pub fn community_counter(&self, community: &str) -> Option<CreationCounter> {
        self.by_community.get(community).copied()
    }

    fn admit(
        counters: &mut HashMap<String, CreationCounter>,
        key: &str,
        now: DateTime<Utc>,
        config: &GuardConfig,
    ) -> bool {
        let counter = counters
            .entry(key.to_string())
            .or_insert(CreationCounter {
                window_start: now,
                count: 0,
            });
        if now - counter.window_start > config.reset_window {
            counter.window_start = now;
            counter.count = 0;
        }
        counter.count <= config.limit
    }

    fn bump(counters: &mut HashMap<String, CreationCounter>, key: &str, now: DateTime<Utc>) {
        if let Some(counter) = counters.get_mut(key) {
            counter.count += 1;
            counter.window_start = now;
        }
    }
}
