use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::feed::LocationKind;

/// `.../comments/<post>[/<slug>[/<reply>]][/]`, nothing after.
static TARGET_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://\S+/comments/(\w+)(?:/\w+/?(\w+)?)?/?$").expect("valid target pattern")
});

/// The post, or the reply within a post, a poll request points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetLocation {
    pub post_id: String,
    pub reply_id: Option<String>,
}

impl TargetLocation {
    /// Decompose a permalink. Returns `None` for anything that is not a
    /// post or reply URL.
    pub fn from_url(url: &str) -> Option<Self> {
        let caps = TARGET_URL.captures(url)?;
        Some(Self {
            post_id: caps.get(1)?.as_str().to_string(),
            reply_id: caps.get(2).map(|m| m.as_str().to_string()),
        })
    }

    pub fn kind(&self) -> LocationKind {
        match self.reply_id {
            Some(_) => LocationKind::Reply,
            None => LocationKind::Post,
        }
    }

    /// Channel-wide id of the target: `t3_<post>` or `t1_<reply>`.
    /// This is what polls are keyed on as their request location.
    pub fn location_id(&self) -> String {
        match &self.reply_id {
            Some(reply) => format!("t1_{reply}"),
            None => format!("t3_{}", self.post_id),
        }
    }
}

impl fmt::Display for TargetLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.location_id())
    }
}
