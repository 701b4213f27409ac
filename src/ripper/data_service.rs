//! Domain façade over the record store
//!
//! Every mutation goes through here so that each persisted change is
//! followed by the matching event on the bus. Post finalization lives here
//! too since it is purely a function of the stored Images.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::ripper::config_loader::SettingsManager;
use crate::ripper::error::RipperResult;
use crate::ripper::event_bus::{Event, EventBus};
use crate::ripper::models::{
    Image, ImageStatus, LogEvent, LogEventKind, LogEventStatus, Post, PostStatus, QueuedGroup,
};
use crate::ripper::store::Store;

pub struct DataService {
    store: Arc<dyn Store>,
    event_bus: EventBus,
    settings: Arc<SettingsManager>,
}

impl DataService {
    pub fn new(store: Arc<dyn Store>, event_bus: EventBus, settings: Arc<SettingsManager>) -> Self {
        Self {
            store,
            event_bus,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn publish_post(&self, post_id: &str) -> RipperResult<()> {
        if let Some(post) = self.store.find_post(post_id)? {
            self.event_bus.publish(Event::PostUpdate(post.id));
        }
        Ok(())
    }

    // Posts

    /// Persist a scanned post with its images and announce them
    pub fn new_post(&self, post: &Post, images: &[Image]) -> RipperResult<(Post, Vec<Image>)> {
        let (post, images) = self.store.insert_post(post, images)?;
        self.event_bus.publish(Event::PostUpdate(post.id));
        for image in &images {
            self.event_bus.publish(Event::ImageUpdate(image.id));
        }
        Ok((post, images))
    }

    pub fn exists(&self, post_id: &str) -> RipperResult<bool> {
        Ok(self.store.exists_post(post_id)?)
    }

    pub fn find_post(&self, post_id: &str) -> RipperResult<Option<Post>> {
        Ok(self.store.find_post(post_id)?)
    }

    pub fn posts(&self) -> RipperResult<Vec<Post>> {
        Ok(self.store.all_posts()?)
    }

    pub fn update_post_status(&self, post_id: &str, status: PostStatus) -> RipperResult<()> {
        self.store.update_post_status(post_id, status)?;
        self.publish_post(post_id)
    }

    pub fn update_download_directory(&self, post_id: &str, directory: &str) -> RipperResult<()> {
        self.store.update_post_download_directory(post_id, directory)?;
        self.publish_post(post_id)
    }

    pub fn update_alt_titles(&self, post_id: &str, titles: &[String]) -> RipperResult<()> {
        self.store.update_post_alt_titles(post_id, titles)?;
        self.publish_post(post_id)
    }

    pub fn update_thanked(&self, post_id: &str, thanked: bool) -> RipperResult<()> {
        self.store.update_post_thanked(post_id, thanked)?;
        self.publish_post(post_id)
    }

    /// Delete a post and its images; returns false if it was already gone
    pub fn remove(&self, post_id: &str) -> RipperResult<bool> {
        let removed = self.store.delete_post(post_id)?;
        if removed {
            info!(post_id, "Removed post");
            self.event_bus.publish(Event::PostRemove(post_id.to_string()));
        }
        Ok(removed)
    }

    /// Delete every COMPLETE post; returns the removed post ids
    pub fn clear_completed(&self) -> RipperResult<Vec<String>> {
        let mut removed = Vec::new();
        for post in self.store.find_posts_by_status(PostStatus::Complete)? {
            if self.remove(&post.post_id)? {
                removed.push(post.post_id);
            }
        }
        Ok(removed)
    }

    // Images

    pub fn images(&self, post_id: &str) -> RipperResult<Vec<Image>> {
        Ok(self.store.images_of_post(post_id)?)
    }

    pub fn images_not_completed(&self, post_id: &str) -> RipperResult<Vec<Image>> {
        Ok(self.store.images_not_completed(post_id)?)
    }

    pub fn find_image(&self, id: i64) -> RipperResult<Option<Image>> {
        Ok(self.store.find_image(id)?)
    }

    pub fn update_image_status(&self, id: i64, status: ImageStatus) -> RipperResult<()> {
        self.store.update_image_status(id, status)?;
        self.event_bus.publish(Event::ImageUpdate(id));
        Ok(())
    }

    pub fn update_image_progress(&self, id: i64, current: u64, total: u64) -> RipperResult<()> {
        self.store.update_image_progress(id, current, total)?;
        self.event_bus.publish(Event::ImageUpdate(id));
        Ok(())
    }

    /// Clear progress and set the image back to `status`
    pub fn reset_image(&self, id: i64, status: ImageStatus) -> RipperResult<()> {
        self.store.update_image_progress(id, 0, 0)?;
        self.update_image_status(id, status)
    }

    pub fn count_error_images(&self) -> RipperResult<usize> {
        Ok(self.store.count_images_with_status(ImageStatus::Error)?)
    }

    /// Set every non-COMPLETE image of a post to STOPPED
    pub fn stop_images_not_completed(&self, post_id: &str) -> RipperResult<()> {
        for image in self.store.images_not_completed(post_id)? {
            if image.status != ImageStatus::Stopped {
                self.update_image_status(image.id, ImageStatus::Stopped)?;
            }
        }
        Ok(())
    }

    /// Record a finished transfer: COMPLETE image, total = current, done + 1
    pub fn image_completed(&self, image: &Image, bytes: u64) -> RipperResult<()> {
        self.store.update_image_progress(image.id, bytes, bytes)?;
        self.update_image_status(image.id, ImageStatus::Complete)?;
        let done = self.store.increment_post_done(&image.post_id)?;
        debug!(post_id = %image.post_id, done, "Image completed");
        self.publish_post(&image.post_id)?;
        self.new_log_event(
            LogEventKind::Download,
            LogEventStatus::Done,
            format!("Downloaded {}", image.url),
        )?;
        Ok(())
    }

    /// Record a terminal transfer failure with its cause chain
    pub fn image_failed(&self, image: &Image, cause: &str) -> RipperResult<()> {
        self.update_image_status(image.id, ImageStatus::Error)?;
        if let Some(post) = self.store.find_post(&image.post_id)? {
            if post.status == PostStatus::Pending {
                self.update_post_status(&image.post_id, PostStatus::Partial)?;
            }
        }
        self.new_log_event(
            LogEventKind::Download,
            LogEventStatus::Error,
            format!("Failed to download {}\n{}", image.url, cause),
        )?;
        Ok(())
    }

    /// Decide the post status once none of its jobs are outstanding
    pub fn finish_post(&self, post_id: &str) -> RipperResult<Option<PostStatus>> {
        let Some(post) = self.store.find_post(post_id)? else {
            return Ok(None);
        };
        let images = self.store.images_of_post(post_id)?;

        let status = if images.iter().any(|i| i.status == ImageStatus::Error) {
            PostStatus::Error
        } else if post.done < post.total {
            PostStatus::Stopped
        } else {
            PostStatus::Complete
        };
        self.update_post_status(post_id, status)?;
        info!(post_id, status = %status, done = post.done, total = post.total, "Post finished");

        if status == PostStatus::Complete && self.settings.settings().download.clear_completed {
            self.remove(post_id)?;
        }
        Ok(Some(status))
    }

    /// Settle state left behind by an interrupted run
    pub fn recover_interrupted(&self) -> RipperResult<usize> {
        let mut recovered = 0;
        for post in self.store.all_posts()? {
            if matches!(post.status, PostStatus::Pending | PostStatus::Partial) {
                self.store.update_post_status(&post.post_id, PostStatus::Stopped)?;
                recovered += 1;
            }
            for image in self.store.images_of_post(&post.post_id)? {
                if matches!(image.status, ImageStatus::Pending | ImageStatus::Downloading) {
                    self.store.update_image_progress(image.id, 0, image.total)?;
                    self.store.update_image_status(image.id, ImageStatus::Stopped)?;
                }
            }
        }
        if recovered > 0 {
            warn!(posts = recovered, "Reset posts interrupted by a previous run");
        }
        Ok(recovered)
    }

    // Queued groups

    pub fn queued(&self) -> RipperResult<Vec<QueuedGroup>> {
        Ok(self.store.all_queued()?)
    }

    pub fn find_queued(&self, thread_id: &str) -> RipperResult<Option<QueuedGroup>> {
        Ok(self.store.find_queued(thread_id)?)
    }

    pub fn new_queued(&self, queued: &QueuedGroup) -> RipperResult<QueuedGroup> {
        let stored = self.store.insert_queued(queued)?;
        self.event_bus.publish(Event::QueuedUpdate(stored.id));
        Ok(stored)
    }

    pub fn remove_queued(&self, thread_id: &str) -> RipperResult<bool> {
        let removed = self.store.delete_queued(thread_id)?;
        if removed {
            self.event_bus.publish(Event::QueuedRemove(thread_id.to_string()));
        }
        Ok(removed)
    }

    // Log records

    pub fn new_log_event(
        &self,
        kind: LogEventKind,
        status: LogEventStatus,
        message: impl Into<String>,
    ) -> RipperResult<LogEvent> {
        let stored = self.store.insert_log_event(&LogEvent::new(kind, status, message))?;
        self.event_bus.publish(Event::LogEventUpdate(stored.id));
        Ok(stored)
    }

    pub fn update_log_event(&self, event: &LogEvent) -> RipperResult<()> {
        self.store.update_log_event(event)?;
        self.event_bus.publish(Event::LogEventUpdate(event.id));
        Ok(())
    }

    pub fn log_events(&self) -> RipperResult<Vec<LogEvent>> {
        Ok(self.store.all_log_events()?)
    }

    pub fn clear_log_events(&self) -> RipperResult<usize> {
        let ids = self.store.delete_log_events()?;
        for id in &ids {
            self.event_bus.publish(Event::LogEventRemove(*id));
        }
        Ok(ids.len())
    }
}
