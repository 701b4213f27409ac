//! Record store for posts, images, queued groups and log records
//!
//! The core talks to persistence only through the synchronous `Store`
//! trait. Field updates are targeted so concurrent workers touching
//! different fields of the same post never overwrite each other.

use thiserror::Error;

use crate::ripper::models::{Image, ImageStatus, LogEvent, Post, PostStatus, QueuedGroup};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub trait Store: Send + Sync {
    /// Persist a post together with its images; either all rows are written or none
    fn insert_post(&self, post: &Post, images: &[Image]) -> StoreResult<(Post, Vec<Image>)>;
    fn find_post(&self, post_id: &str) -> StoreResult<Option<Post>>;
    fn find_post_by_id(&self, id: i64) -> StoreResult<Option<Post>>;
    fn all_posts(&self) -> StoreResult<Vec<Post>>;
    fn find_posts_by_status(&self, status: PostStatus) -> StoreResult<Vec<Post>>;
    fn exists_post(&self, post_id: &str) -> StoreResult<bool> {
        Ok(self.find_post(post_id)?.is_some())
    }
    fn update_post_status(&self, post_id: &str, status: PostStatus) -> StoreResult<()>;
    fn update_post_done(&self, post_id: &str, done: u32) -> StoreResult<()>;
    /// Atomically add one to the done counter, never exceeding total; returns the new value
    fn increment_post_done(&self, post_id: &str) -> StoreResult<u32>;
    fn update_post_download_directory(&self, post_id: &str, directory: &str) -> StoreResult<()>;
    fn update_post_alt_titles(&self, post_id: &str, titles: &[String]) -> StoreResult<()>;
    fn update_post_thanked(&self, post_id: &str, thanked: bool) -> StoreResult<()>;
    /// Remove a post and all of its images; returns false if it did not exist
    fn delete_post(&self, post_id: &str) -> StoreResult<bool>;

    fn find_image(&self, id: i64) -> StoreResult<Option<Image>>;
    fn images_of_post(&self, post_id: &str) -> StoreResult<Vec<Image>>;
    fn images_not_completed(&self, post_id: &str) -> StoreResult<Vec<Image>> {
        Ok(self
            .images_of_post(post_id)?
            .into_iter()
            .filter(|image| image.status != ImageStatus::Complete)
            .collect())
    }
    fn count_images_with_status(&self, status: ImageStatus) -> StoreResult<usize>;
    fn update_image_status(&self, id: i64, status: ImageStatus) -> StoreResult<()>;
    fn update_image_progress(&self, id: i64, current: u64, total: u64) -> StoreResult<()>;

    fn insert_queued(&self, queued: &QueuedGroup) -> StoreResult<QueuedGroup>;
    fn find_queued(&self, thread_id: &str) -> StoreResult<Option<QueuedGroup>>;
    fn find_queued_by_id(&self, id: i64) -> StoreResult<Option<QueuedGroup>>;
    fn all_queued(&self) -> StoreResult<Vec<QueuedGroup>>;
    fn delete_queued(&self, thread_id: &str) -> StoreResult<bool>;

    fn insert_log_event(&self, event: &LogEvent) -> StoreResult<LogEvent>;
    fn update_log_event(&self, event: &LogEvent) -> StoreResult<()>;
    fn find_log_event(&self, id: i64) -> StoreResult<Option<LogEvent>>;
    fn all_log_events(&self) -> StoreResult<Vec<LogEvent>>;
    /// Remove every log record; returns the removed ids
    fn delete_log_events(&self) -> StoreResult<Vec<i64>>;
}
