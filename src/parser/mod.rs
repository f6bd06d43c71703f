//! Poll request detection.
//!
//! A request is recognised by two independent productions over the raw
//! text:
//!
//! - the *title block*: an `http(s)://` URL, whitespace, a title running up
//!   to the first `?`, a line break, then at least one bullet line. Only
//!   the first line holding a title block counts, and on that line the last
//!   URL that starts one wins.
//! - the *option bullets*: every line starting with `-`, `*` or `+` and
//!   carrying content, anywhere in the text, in document order, capped at
//!   [`MAX_OPTIONS`].
//!
//! The target is found separately: the first URL in the text, followed by
//! whitespace, that decomposes into a [`TargetLocation`]. It need not be the
//! title block's URL. Any failure yields `None`; nothing here returns an
//! error.

pub mod target;

pub use target::TargetLocation;

use crate::consts::MAX_OPTIONS;

/// A poll request pulled out of free-form text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// The post or reply URL the target was taken from.
    pub url: String,
    pub title: String,
    /// Where the poll should be posted.
    pub target: TargetLocation,
    /// Option texts; the position is the option index.
    pub options: Vec<String>,
}

/// URL and title captured by the title-block production.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TitleBlock<'a> {
    pub url: &'a str,
    pub title: &'a str,
}

/// Extract a poll request from `text`, if it holds one.
pub fn extract(text: &str) -> Option<Candidate> {
    let Some(block) = title_block(text) else {
        tracing::trace!("no poll request title block");
        return None;
    };

    let options = option_bullets(text);
    if options.is_empty() {
        tracing::debug!(url = block.url, "poll request without options");
        return None;
    }

    let Some((url, target)) = first_target(text) else {
        tracing::debug!(url = block.url, "poll request without a post or reply URL");
        return None;
    };

    let title = block.title.split_whitespace().collect::<Vec<_>>().join(" ");
    tracing::info!(url, %title, options = options.len(), "found poll request");

    Some(Candidate {
        url: url.to_string(),
        title,
        target,
        options,
    })
}

/// Title block of the first line that starts one. When several URLs on
/// that line start a block, the last of them is taken.
pub fn title_block(text: &str) -> Option<TitleBlock<'_>> {
    let mut found = url_starts(text).filter_map(|start| {
        title_block_at(&text[start..]).map(|block| (start, block))
    });
    let (first, mut block) = found.next()?;
    let line_end = text[first..].find('\n').map_or(text.len(), |i| first + i);
    for (start, later) in found {
        if start >= line_end {
            break;
        }
        block = later;
    }
    Some(block)
}

/// First whitespace-terminated URL in `text` naming a post or reply.
fn first_target(text: &str) -> Option<(&str, TargetLocation)> {
    url_starts(text).find_map(|start| {
        let rest = &text[start..];
        let url = &rest[..rest.find(char::is_whitespace)?];
        TargetLocation::from_url(url).map(|target| (url, target))
    })
}

/// Byte offsets of every `http://` or `https://` in `text`.
fn url_starts(text: &str) -> impl Iterator<Item = usize> + '_ {
    text.match_indices("http")
        .map(|(start, _)| start)
        .filter(|&start| {
            let rest = &text[start..];
            rest.starts_with("http://") || rest.starts_with("https://")
        })
}

fn title_block_at(rest: &str) -> Option<TitleBlock<'_>> {
    let scheme_len = if rest.starts_with("https://") { 8 } else { 7 };
    let url_len = rest.find(char::is_whitespace)?;
    if url_len <= scheme_len {
        return None;
    }
    let url = &rest[..url_len];

    let tail = rest[url_len..].trim_start();
    let question = tail.find('?')?;
    let title = tail[..=question].trim_end();
    if title.len() < 2 {
        return None;
    }

    let after_title = tail[question + 1..].trim_start_matches([' ', '\t', '\r']);
    if !after_title.starts_with('\n') {
        return None;
    }
    let first_line = after_title.trim_start().lines().next()?;
    bullet(first_line)?;

    Some(TitleBlock { url, title })
}

/// Every bullet line in `text`, in order, capped at [`MAX_OPTIONS`].
pub fn option_bullets(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(bullet)
        .take(MAX_OPTIONS)
        .map(str::to_string)
        .collect()
}

/// Content of a bullet line, or `None` if the line is not one.
fn bullet(line: &str) -> Option<&str> {
    let line = line.trim_start_matches([' ', '\t']);
    let rest = line.strip_prefix(['-', '*', '+'])?;
    if !rest.starts_with([' ', '\t']) {
        return None;
    }
    let content = rest.trim();
    (!content.is_empty()).then_some(content)
}
