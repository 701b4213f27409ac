//! In-process store used when no database file is configured

use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::{Store, StoreError, StoreResult};
use crate::ripper::models::{Image, ImageStatus, LogEvent, Post, PostStatus, QueuedGroup};

#[derive(Default)]
struct MemoryState {
    posts: BTreeMap<i64, Post>,
    images: BTreeMap<i64, Image>,
    queued: BTreeMap<i64, QueuedGroup>,
    log_events: BTreeMap<i64, LogEvent>,
    next_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn post_mut(&mut self, post_id: &str) -> StoreResult<&mut Post> {
        self.posts
            .values_mut()
            .find(|p| p.post_id == post_id)
            .ok_or_else(|| StoreError::NotFound(format!("post {}", post_id)))
    }

    fn image_mut(&mut self, id: i64) -> StoreResult<&mut Image> {
        self.images
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("image {}", id)))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn insert_post(&self, post: &Post, images: &[Image]) -> StoreResult<(Post, Vec<Image>)> {
        let mut state = self.state.lock();
        if state.posts.values().any(|p| p.post_id == post.post_id) {
            return Err(StoreError::Duplicate(format!("post {}", post.post_id)));
        }
        let mut stored_post = post.clone();
        stored_post.id = state.next_id();
        state.posts.insert(stored_post.id, stored_post.clone());

        let mut stored_images = Vec::with_capacity(images.len());
        for image in images {
            let mut stored = image.clone();
            stored.id = state.next_id();
            stored.post_id = post.post_id.clone();
            state.images.insert(stored.id, stored.clone());
            stored_images.push(stored);
        }
        Ok((stored_post, stored_images))
    }

    fn find_post(&self, post_id: &str) -> StoreResult<Option<Post>> {
        let state = self.state.lock();
        Ok(state.posts.values().find(|p| p.post_id == post_id).cloned())
    }

    fn find_post_by_id(&self, id: i64) -> StoreResult<Option<Post>> {
        Ok(self.state.lock().posts.get(&id).cloned())
    }

    fn all_posts(&self) -> StoreResult<Vec<Post>> {
        Ok(self.state.lock().posts.values().cloned().collect())
    }

    fn find_posts_by_status(&self, status: PostStatus) -> StoreResult<Vec<Post>> {
        let state = self.state.lock();
        Ok(state.posts.values().filter(|p| p.status == status).cloned().collect())
    }

    fn update_post_status(&self, post_id: &str, status: PostStatus) -> StoreResult<()> {
        self.state.lock().post_mut(post_id)?.status = status;
        Ok(())
    }

    fn update_post_done(&self, post_id: &str, done: u32) -> StoreResult<()> {
        let mut state = self.state.lock();
        let post = state.post_mut(post_id)?;
        post.done = done.min(post.total);
        Ok(())
    }

    fn increment_post_done(&self, post_id: &str) -> StoreResult<u32> {
        let mut state = self.state.lock();
        let post = state.post_mut(post_id)?;
        post.done = (post.done + 1).min(post.total);
        Ok(post.done)
    }

    fn update_post_download_directory(&self, post_id: &str, directory: &str) -> StoreResult<()> {
        self.state.lock().post_mut(post_id)?.download_directory = Some(directory.to_string());
        Ok(())
    }

    fn update_post_alt_titles(&self, post_id: &str, titles: &[String]) -> StoreResult<()> {
        self.state.lock().post_mut(post_id)?.alt_titles = titles.to_vec();
        Ok(())
    }

    fn update_post_thanked(&self, post_id: &str, thanked: bool) -> StoreResult<()> {
        self.state.lock().post_mut(post_id)?.thanked = thanked;
        Ok(())
    }

    fn delete_post(&self, post_id: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let Some(id) = state.posts.values().find(|p| p.post_id == post_id).map(|p| p.id) else {
            return Ok(false);
        };
        state.posts.remove(&id);
        state.images.retain(|_, image| image.post_id != post_id);
        Ok(true)
    }

    fn find_image(&self, id: i64) -> StoreResult<Option<Image>> {
        Ok(self.state.lock().images.get(&id).cloned())
    }

    fn images_of_post(&self, post_id: &str) -> StoreResult<Vec<Image>> {
        let state = self.state.lock();
        let mut images: Vec<Image> = state
            .images
            .values()
            .filter(|i| i.post_id == post_id)
            .cloned()
            .collect();
        images.sort_by_key(|i| i.index);
        Ok(images)
    }

    fn count_images_with_status(&self, status: ImageStatus) -> StoreResult<usize> {
        Ok(self.state.lock().images.values().filter(|i| i.status == status).count())
    }

    fn update_image_status(&self, id: i64, status: ImageStatus) -> StoreResult<()> {
        self.state.lock().image_mut(id)?.status = status;
        Ok(())
    }

    fn update_image_progress(&self, id: i64, current: u64, total: u64) -> StoreResult<()> {
        let mut state = self.state.lock();
        let image = state.image_mut(id)?;
        image.current = current;
        image.total = total;
        Ok(())
    }

    fn insert_queued(&self, queued: &QueuedGroup) -> StoreResult<QueuedGroup> {
        let mut state = self.state.lock();
        if state.queued.values().any(|q| q.thread_id == queued.thread_id) {
            return Err(StoreError::Duplicate(format!("thread {}", queued.thread_id)));
        }
        let mut stored = queued.clone();
        stored.id = state.next_id();
        state.queued.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn find_queued(&self, thread_id: &str) -> StoreResult<Option<QueuedGroup>> {
        let state = self.state.lock();
        Ok(state.queued.values().find(|q| q.thread_id == thread_id).cloned())
    }

    fn find_queued_by_id(&self, id: i64) -> StoreResult<Option<QueuedGroup>> {
        Ok(self.state.lock().queued.get(&id).cloned())
    }

    fn all_queued(&self) -> StoreResult<Vec<QueuedGroup>> {
        Ok(self.state.lock().queued.values().cloned().collect())
    }

    fn delete_queued(&self, thread_id: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let before = state.queued.len();
        state.queued.retain(|_, q| q.thread_id != thread_id);
        Ok(state.queued.len() != before)
    }

    fn insert_log_event(&self, event: &LogEvent) -> StoreResult<LogEvent> {
        let mut state = self.state.lock();
        let mut stored = event.clone();
        stored.id = state.next_id();
        state.log_events.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn update_log_event(&self, event: &LogEvent) -> StoreResult<()> {
        let mut state = self.state.lock();
        let stored = state
            .log_events
            .get_mut(&event.id)
            .ok_or_else(|| StoreError::NotFound(format!("log event {}", event.id)))?;
        *stored = event.clone();
        Ok(())
    }

    fn find_log_event(&self, id: i64) -> StoreResult<Option<LogEvent>> {
        Ok(self.state.lock().log_events.get(&id).cloned())
    }

    fn all_log_events(&self) -> StoreResult<Vec<LogEvent>> {
        Ok(self.state.lock().log_events.values().cloned().collect())
    }

    fn delete_log_events(&self) -> StoreResult<Vec<i64>> {
        let mut state = self.state.lock();
        let ids = state.log_events.keys().copied().collect();
        state.log_events.clear();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ripper::tests::{image, post};

    #[test]
    fn test_insert_assigns_ids_and_links_images() {
        let store = MemoryStore::new();
        let (stored, images) = store
            .insert_post(&post("10", 2), &[image("10", "https://imagetwist.com/a", 1), image("10", "https://imagetwist.com/b", 2)])
            .unwrap();

        assert!(stored.id > 0);
        assert_eq!(images.len(), 2);
        assert!(images.iter().all(|i| i.id > 0 && i.post_id == "10"));
        assert!(matches!(
            store.insert_post(&post("10", 0), &[]),
            Err(StoreError::Duplicate(_))
        ));
    }

    #[test]
    fn test_done_counter_never_exceeds_total() {
        let store = MemoryStore::new();
        store.insert_post(&post("1", 2), &[]).unwrap();
        assert_eq!(store.increment_post_done("1").unwrap(), 1);
        assert_eq!(store.increment_post_done("1").unwrap(), 2);
        assert_eq!(store.increment_post_done("1").unwrap(), 2);
    }

    #[test]
    fn test_delete_post_removes_images() {
        let store = MemoryStore::new();
        store.insert_post(&post("1", 1), &[image("1", "https://imagetwist.com/a", 1)]).unwrap();
        store.insert_post(&post("2", 1), &[image("2", "https://imagetwist.com/b", 1)]).unwrap();

        assert!(store.delete_post("1").unwrap());
        assert!(!store.delete_post("1").unwrap());
        assert!(store.images_of_post("1").unwrap().is_empty());
        assert_eq!(store.images_of_post("2").unwrap().len(), 1);
    }
}
