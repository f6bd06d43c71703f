//! Operator settings stored next to the poll data.
//!
//! Shares a database with [`PollStore`](crate::store::PollStore); pass the
//! same path to both. Command-line flags win over stored values.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use crate::consts::DEFAULT_BOT_NAME;
use crate::engine::EngineConfig;

pub const BOT_NAME: &str = "bot_name";
pub const SIGNATURE: &str = "signature";
/// JSON array of community ids.
pub const EXEMPT_COMMUNITIES: &str = "exempt_communities";
/// RFC 3339 timestamp.
pub const REPLY_AFTER: &str = "reply_after";

/// Persistent key-value settings.
pub struct Settings {
    conn: Mutex<Connection>,
}

impl Settings {
    /// Open or create the settings table in the given database.
    /// Use `":memory:"` for tests.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open settings database")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .context("failed to create settings table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn()
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .with_context(|| format!("failed to read setting {key}"))
    }

    /// Set a value (upsert).
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [key, value],
            )
            .with_context(|| format!("failed to write setting {key}"))?;
        Ok(())
    }

    pub fn exempt_communities(&self) -> Result<HashSet<String>> {
        match self.get(EXEMPT_COMMUNITIES)? {
            Some(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("{EXEMPT_COMMUNITIES} is not a JSON array of strings")),
            None => Ok(HashSet::new()),
        }
    }

    /// Lift the creation limit for a community. Returns false if it was
    /// already exempt.
    pub fn add_exempt(&self, community: &str) -> Result<bool> {
        let mut exempt = self.exempt_communities()?;
        if !exempt.insert(community.to_string()) {
            return Ok(false);
        }
        let mut sorted: Vec<_> = exempt.into_iter().collect();
        sorted.sort();
        self.set(EXEMPT_COMMUNITIES, &serde_json::to_string(&sorted)?)?;
        Ok(true)
    }

    pub fn reply_after(&self) -> Result<Option<DateTime<Utc>>> {
        self.get(REPLY_AFTER)?
            .map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|t| t.with_timezone(&Utc))
                    .with_context(|| format!("{REPLY_AFTER} is not an RFC 3339 timestamp: {raw}"))
            })
            .transpose()
    }

    /// Build the engine configuration from stored settings, with
    /// `bot_name` taking precedence when given.
    pub fn engine_config(&self, bot_name: Option<String>) -> Result<EngineConfig> {
        let bot_name = match bot_name {
            Some(name) => name,
            None => self
                .get(BOT_NAME)?
                .unwrap_or_else(|| DEFAULT_BOT_NAME.to_string()),
        };
        Ok(EngineConfig {
            bot_name,
            exempt_communities: self.exempt_communities()?,
            reply_after: self.reply_after()?,
            signature: self.get(SIGNATURE)?,
            ..EngineConfig::default()
        })
    }
}
