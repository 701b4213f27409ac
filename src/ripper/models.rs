//! Domain records shared by the scanner, store, job queue and broadcast layers

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a Post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostStatus {
    Stopped,
    Pending,
    Partial,
    Error,
    Complete,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Stopped => "STOPPED",
            PostStatus::Pending => "PENDING",
            PostStatus::Partial => "PARTIAL",
            PostStatus::Error => "ERROR",
            PostStatus::Complete => "COMPLETE",
        }
    }

    /// Terminal states are not affected by `stop`
    pub fn is_terminal(&self) -> bool {
        matches!(self, PostStatus::Stopped | PostStatus::Error | PostStatus::Complete)
    }
}

/// Status of an Image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageStatus {
    Stopped,
    Pending,
    Downloading,
    Complete,
    Error,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Stopped => "STOPPED",
            ImageStatus::Pending => "PENDING",
            ImageStatus::Downloading => "DOWNLOADING",
            ImageStatus::Complete => "COMPLETE",
            ImageStatus::Error => "ERROR",
        }
    }
}

/// Category of a persisted log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogEventKind {
    Post,
    Queued,
    Thanks,
    Scan,
    Download,
}

impl LogEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogEventKind::Post => "POST",
            LogEventKind::Queued => "QUEUED",
            LogEventKind::Thanks => "THANKS",
            LogEventKind::Scan => "SCAN",
            LogEventKind::Download => "DOWNLOAD",
        }
    }
}

/// Progress of the operation a log record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogEventStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl LogEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogEventStatus::Pending => "PENDING",
            LogEventStatus::Processing => "PROCESSING",
            LogEventStatus::Done => "DONE",
            LogEventStatus::Error => "ERROR",
        }
    }
}

/// Error returned when a stored status string is not recognised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

macro_rules! impl_status_conversions {
    ($ty:ty, [$($variant:ident),+ $(,)?]) => {
        impl FromStr for $ty {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s == <$ty>::$variant.as_str() {
                        return Ok(<$ty>::$variant);
                    }
                )+
                Err(UnknownStatus(s.to_string()))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

impl_status_conversions!(PostStatus, [Stopped, Pending, Partial, Error, Complete]);
impl_status_conversions!(ImageStatus, [Stopped, Pending, Downloading, Complete, Error]);
impl_status_conversions!(LogEventKind, [Post, Queued, Thanks, Scan, Download]);
impl_status_conversions!(LogEventStatus, [Pending, Processing, Done, Error]);

/// One gallery entry tracked for download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    /// Store-assigned surrogate id, 0 until persisted
    pub id: i64,
    pub post_id: String,
    pub thread_id: String,
    pub title: String,
    pub url: String,
    pub thread_title: String,
    pub forum: String,
    pub submitter: String,
    pub total: u32,
    pub done: u32,
    pub status: PostStatus,
    pub download_directory: Option<String>,
    pub thanked: bool,
    pub hosts: Vec<String>,
    pub previews: Vec<String>,
    /// Other names of the gallery found in the post body, offered for renaming
    #[serde(default)]
    pub alt_titles: Vec<String>,
    pub added_at: DateTime<Utc>,
}

/// One downloadable file of a Post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// Store-assigned surrogate id, 0 until persisted
    pub id: i64,
    pub post_id: String,
    pub url: String,
    pub thumb_url: String,
    /// Domain of the site resolver accepted at scan time
    pub host: String,
    /// 1-based position within the post
    pub index: u32,
    pub current: u64,
    pub total: u64,
    pub status: ImageStatus,
}

/// A thread link that expands into several posts awaiting a choice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedGroup {
    pub id: i64,
    pub thread_id: String,
    pub link: String,
    pub total: u32,
}

/// Persisted, user-facing log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub id: i64,
    pub kind: LogEventKind,
    pub status: LogEventStatus,
    pub time: DateTime<Utc>,
    pub message: String,
}

impl LogEvent {
    pub fn new(kind: LogEventKind, status: LogEventStatus, message: impl Into<String>) -> Self {
        Self {
            id: 0,
            kind,
            status,
            time: Utc::now(),
            message: message.into(),
        }
    }
}

/// One candidate post found while scanning a whole thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiPostItem {
    pub thread_id: String,
    pub post_id: String,
    pub number: u32,
    pub title: String,
    pub image_count: u32,
    pub url: String,
    pub previews: Vec<String>,
    pub hosts: Vec<String>,
}

/// Snapshot of queue activity reported on the download-state topic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalState {
    pub running: usize,
    pub remaining: usize,
    pub error: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_strings() {
        assert_eq!("PARTIAL".parse::<PostStatus>().unwrap(), PostStatus::Partial);
        assert_eq!("DOWNLOADING".parse::<ImageStatus>().unwrap(), ImageStatus::Downloading);
        assert_eq!(LogEventKind::Download.to_string(), "DOWNLOAD");
        assert!("FINISHED".parse::<PostStatus>().is_err());
    }

    #[test]
    fn test_terminal_post_statuses() {
        assert!(PostStatus::Stopped.is_terminal());
        assert!(PostStatus::Error.is_terminal());
        assert!(PostStatus::Complete.is_terminal());
        assert!(!PostStatus::Pending.is_terminal());
        assert!(!PostStatus::Partial.is_terminal());
    }

    #[test]
    fn test_global_state_serializes_field_names() {
        let json = serde_json::to_value(GlobalState { running: 1, remaining: 2, error: 0 }).unwrap();
        assert_eq!(json["running"], 1);
        assert_eq!(json["remaining"], 2);
    }
}
