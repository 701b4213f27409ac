//! Parsing of user-submitted gallery links

use once_cell::sync::Lazy;
use regex::Regex;

use crate::ripper::error::{RipperError, RipperResult};

static THREAD_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/threads/(\d+)(?:.*?[?&]p=(\d+)|.*?#post(\d+))?").expect("valid thread path pattern")
});

/// What a submitted link points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GalleryRef {
    /// A whole thread, expanded by a multi-post scan
    Thread { thread_id: String },
    /// One post of a thread
    Post { thread_id: String, post_id: String },
}

impl GalleryRef {
    pub fn thread_id(&self) -> &str {
        match self {
            GalleryRef::Thread { thread_id } | GalleryRef::Post { thread_id, .. } => thread_id,
        }
    }
}

/// Split pasted text into trimmed, non-empty lines
pub fn split_links(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a link on the configured forum into a gallery reference
pub fn parse_link(link: &str, proxy: &str) -> RipperResult<GalleryRef> {
    let proxy = proxy.trim_end_matches('/');
    let path = link
        .trim()
        .strip_prefix(proxy)
        .ok_or_else(|| RipperError::Validation(format!("{} is not a link to {}", link, proxy)))?;

    let captures = THREAD_PATH
        .captures(path)
        .ok_or_else(|| RipperError::Validation(format!("invalid link {}, link is missing the thread id", link)))?;

    let thread_id = captures[1].to_string();
    match captures.get(2).or_else(|| captures.get(3)) {
        Some(post_id) => Ok(GalleryRef::Post {
            thread_id,
            post_id: post_id.as_str().to_string(),
        }),
        None => Ok(GalleryRef::Thread { thread_id }),
    }
}
