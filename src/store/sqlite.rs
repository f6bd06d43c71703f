use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension, params};

use super::{Poll, PollId, PollOption, StoreError, Tally};

/// Next id is `max + 1`, starting at 1.
const INSERT_POLL: &str = "INSERT INTO polls (poll_id, request_location_id, title)
     VALUES ((SELECT IFNULL(MAX(poll_id), 0) + 1 FROM polls), ?1, ?2)";

const INSERT_OPTION: &str =
    "INSERT INTO poll_options (poll_id, option_index, option_text) VALUES (?1, ?2, ?3)";

/// SQLite-backed poll storage.
///
/// Every read or write goes through [`PollStore::lock`], and the returned
/// guard is the only way to reach the connection. A check-then-act sequence
/// (does a poll exist for this request? then create it) is done on one
/// guard, so nothing else can interleave with it.
pub struct PollStore {
    conn: Mutex<Connection>,
}

/// Exclusive access to the store for the lifetime of the guard.
pub struct StoreGuard<'a> {
    conn: MutexGuard<'a, Connection>,
}

impl PollStore {
    /// Open or create the poll tables in the given database.
    /// Use `":memory:"` for tests.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bans (
                community_id TEXT PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS reply_markers (
                location_id TEXT PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS polls (
                poll_id              INTEGER PRIMARY KEY,
                request_location_id  TEXT NOT NULL UNIQUE,
                rendered_location_id TEXT,
                title                TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS poll_options (
                poll_id      INTEGER NOT NULL REFERENCES polls(poll_id),
                option_index INTEGER NOT NULL,
                option_text  TEXT NOT NULL,
                PRIMARY KEY (poll_id, option_index)
            );
            CREATE TABLE IF NOT EXISTS poll_votes (
                poll_id      INTEGER NOT NULL,
                option_index INTEGER NOT NULL,
                voter_id     TEXT NOT NULL,
                UNIQUE (poll_id, voter_id)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    /// Take the store lock.
    pub fn lock(&self) -> StoreGuard<'_> {
        StoreGuard {
            conn: self.conn.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

impl StoreGuard<'_> {
    // --- Polls ---

    /// Insert a poll with the next id (`max + 1`, starting at 1).
    pub fn create_poll(
        &mut self,
        request_location_id: &str,
        title: &str,
    ) -> Result<PollId, StoreError> {
        self.conn
            .execute(INSERT_POLL, params![request_location_id, title])?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Store all options of a poll in one transaction.
    pub fn set_options(&mut self, poll_id: PollId, options: &[String]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(INSERT_OPTION)?;
            for (index, text) in options.iter().enumerate() {
                stmt.execute(params![poll_id, index as i64, text])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Create a poll and its options atomically, refusing if a poll already
    /// exists for the request.
    pub fn create_poll_with_options(
        &mut self,
        request_location_id: &str,
        title: &str,
        options: &[String],
    ) -> Result<PollId, StoreError> {
        let tx = self.conn.transaction()?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM polls WHERE request_location_id = ?1)",
            [request_location_id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(StoreError::DuplicateRequest(request_location_id.to_string()));
        }

        tx.execute(INSERT_POLL, params![request_location_id, title])?;
        let poll_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(INSERT_OPTION)?;
            for (index, text) in options.iter().enumerate() {
                stmt.execute(params![poll_id, index as i64, text])?;
            }
        }
        tx.commit()?;
        Ok(poll_id)
    }

    /// Record where the rendered poll was posted. Only the first call for a
    /// poll has any effect; returns whether this call set it.
    pub fn set_rendered_location(
        &self,
        poll_id: PollId,
        location_id: &str,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE polls SET rendered_location_id = ?1
             WHERE poll_id = ?2 AND rendered_location_id IS NULL",
            params![location_id, poll_id],
        )?;
        Ok(changed > 0)
    }

    /// Remove a poll that was never posted, with its options and votes.
    /// Returns false, leaving everything in place, if the poll is unknown
    /// or already has a rendered location.
    pub fn discard_unposted_poll(&mut self, poll_id: PollId) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM polls WHERE poll_id = ?1 AND rendered_location_id IS NULL",
            [poll_id],
        )?;
        if removed == 0 {
            return Ok(false);
        }
        tx.execute("DELETE FROM poll_options WHERE poll_id = ?1", [poll_id])?;
        tx.execute("DELETE FROM poll_votes WHERE poll_id = ?1", [poll_id])?;
        tx.commit()?;
        Ok(true)
    }

    pub fn get_poll(&self, poll_id: PollId) -> Result<Option<Poll>, StoreError> {
        let poll = self
            .conn
            .query_row(
                "SELECT poll_id, title, request_location_id, rendered_location_id
                 FROM polls WHERE poll_id = ?1",
                [poll_id],
                |row| {
                    Ok(Poll {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        request_location_id: row.get(2)?,
                        rendered_location_id: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(poll)
    }

    /// Options of a poll, ordered by index.
    pub fn get_options(&self, poll_id: PollId) -> Result<Vec<PollOption>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT option_index, option_text FROM poll_options
             WHERE poll_id = ?1 ORDER BY option_index ASC",
        )?;
        let options = stmt
            .query_map([poll_id], |row| {
                Ok(PollOption {
                    poll_id,
                    index: row.get::<_, i64>(0)? as usize,
                    text: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(options)
    }

    pub fn has_poll_for_request(&self, request_location_id: &str) -> Result<bool, StoreError> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM polls WHERE request_location_id = ?1)",
            [request_location_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    // --- Votes ---

    pub fn has_vote(&self, poll_id: PollId, voter_id: &str) -> Result<bool, StoreError> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM poll_votes WHERE poll_id = ?1 AND voter_id = ?2)",
            params![poll_id, voter_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn insert_vote(
        &self,
        poll_id: PollId,
        voter_id: &str,
        option_index: usize,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO poll_votes (poll_id, option_index, voter_id) VALUES (?1, ?2, ?3)",
            params![poll_id, option_index as i64, voter_id],
        )?;
        Ok(())
    }

    /// Vote counts per option index.
    pub fn get_votes(&self, poll_id: PollId) -> Result<Tally, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT option_index, COUNT(*) FROM poll_votes
             WHERE poll_id = ?1 GROUP BY option_index",
        )?;
        let tally = stmt
            .query_map([poll_id], |row| {
                Ok((row.get::<_, i64>(0)? as usize, row.get::<_, i64>(1)? as u32))
            })?
            .collect::<Result<Tally, _>>()?;
        Ok(tally)
    }

    // --- Bans ---

    pub fn is_banned(&self, community_id: &str) -> Result<bool, StoreError> {
        let banned = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM bans WHERE community_id = ?1)",
            [community_id],
            |row| row.get(0),
        )?;
        Ok(banned)
    }

    pub fn add_ban(&self, community_id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO bans (community_id) VALUES (?1)",
            [community_id],
        )?;
        Ok(())
    }

    /// Lift a ban. Only ever done by hand; returns whether a ban existed.
    pub fn remove_ban(&self, community_id: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .execute("DELETE FROM bans WHERE community_id = ?1", [community_id])?;
        Ok(removed > 0)
    }

    pub fn bans(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT community_id FROM bans ORDER BY community_id ASC")?;
        let bans = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(bans)
    }

    // --- Reply markers ---

    pub fn has_replied(&self, location_id: &str) -> Result<bool, StoreError> {
        let replied = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM reply_markers WHERE location_id = ?1)",
            [location_id],
            |row| row.get(0),
        )?;
        Ok(replied)
    }

    pub fn mark_replied(&self, location_id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO reply_markers (location_id) VALUES (?1)",
            [location_id],
        )?;
        Ok(())
    }

    /// Drop a table out from under the store, to exercise fault handling.
    #[cfg(test)]
    pub(crate) fn break_table(&self, table: &str) {
        self.conn
            .execute_batch(&format!("DROP TABLE {table}"))
            .unwrap();
    }
}
