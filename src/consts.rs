//! Project-wide constants.

use std::path::PathBuf;
use std::time::Duration;

/// Maximum number of options a single poll can carry.
pub const MAX_OPTIONS: usize = 20;

/// Poll creations allowed per author or community before denial kicks in.
/// The check is `count > CREATION_LIMIT`, so one extra creation slips through.
pub const CREATION_LIMIT: u32 = 5;

/// Length of the creation counting window.
pub const RESET_WINDOW_HOURS: i64 = 24;

/// Attempts made against the text channel before giving up on an action.
pub const RETRY_LIMIT: usize = 5;

/// Upper bound on a single rate-limit sleep, whatever the channel asks for.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(600);

/// Width of the rendered tally bar, in 5% units.
pub const BAR_UNITS: usize = 20;

pub const BAR_FILLED: &str = "█";
pub const BAR_EMPTY: &str = "░";

/// Default identity the engine posts as.
pub const DEFAULT_BOT_NAME: &str = "PollingBot";

/// Default database path: `~/.pollbot/pollbot.db`.
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".pollbot")
        .join("pollbot.db")
}

/// Letter label for a 0-based option index (`0 -> 'A'`).
pub fn option_label(index: usize) -> char {
    (b'A' + (index % 26) as u8) as char
}

/// Lowercase vote letter for a 0-based option index (`0 -> 'a'`).
pub fn vote_letter(index: usize) -> char {
    option_label(index).to_ascii_lowercase()
}
