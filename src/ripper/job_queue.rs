//! FIFO queue of image download jobs with per-post stop and restart
//!
//! Jobs sit in a single pending queue until a worker takes them, at which
//! point they move to the running set together with their cancellation
//! token. Enqueue, stop, restart and post finalization for the same post
//! are serialized through a per-post lock so none of them can interleave.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::ripper::data_service::DataService;
use crate::ripper::error::{RipperError, RipperResult};
use crate::ripper::models::{Image, ImageStatus, PostStatus};

/// One image transfer awaiting or holding a worker
#[derive(Debug, Clone)]
pub struct Job {
    pub post_id: String,
    pub image_id: i64,
    pub cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    running: HashMap<String, HashMap<i64, CancellationToken>>,
}

impl QueueState {
    fn has_jobs(&self, post_id: &str) -> bool {
        self.running.get(post_id).is_some_and(|jobs| !jobs.is_empty())
            || self.pending.iter().any(|job| job.post_id == post_id)
    }

    fn running_total(&self) -> usize {
        self.running.values().map(HashMap::len).sum()
    }
}

/// Per-post results of a bulk operation
#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, RipperError)>,
}

impl BulkOutcome {
    fn record(&mut self, post_id: String, result: RipperResult<()>) {
        match result {
            Ok(()) => self.succeeded.push(post_id),
            Err(e) => self.failed.push((post_id, e)),
        }
    }
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    available: Notify,
    drained: Notify,
    post_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    data: Arc<DataService>,
    shutdown: CancellationToken,
}

impl JobQueue {
    pub fn new(data: Arc<DataService>, shutdown: CancellationToken) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            drained: Notify::new(),
            post_locks: DashMap::new(),
            data,
            shutdown,
        }
    }

    /// Exclusive access to a post's job set
    pub async fn lock_post(&self, post_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .post_locks
            .entry(post_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Queue every non-COMPLETE image; the caller must hold the post lock
    fn enqueue_locked(&self, post_id: &str, images: &[Image]) -> RipperResult<usize> {
        let mut queued = 0;
        for image in images.iter().filter(|i| i.status != ImageStatus::Complete) {
            self.data.reset_image(image.id, ImageStatus::Pending)?;
            self.state.lock().pending.push_back(Job {
                post_id: post_id.to_string(),
                image_id: image.id,
                cancel: self.shutdown.child_token(),
            });
            self.available.notify_one();
            queued += 1;
        }
        debug!(post_id, queued, "Enqueued images");
        Ok(queued)
    }

    /// Queue a post's images for download
    pub async fn enqueue(&self, post_id: &str, images: &[Image]) -> RipperResult<usize> {
        let _guard = self.lock_post(post_id).await;
        self.enqueue_locked(post_id, images)
    }

    fn try_take(&self) -> Option<Job> {
        let mut state = self.state.lock();
        let job = state.pending.pop_front()?;
        state
            .running
            .entry(job.post_id.clone())
            .or_default()
            .insert(job.image_id, job.cancel.clone());
        Some(job)
    }

    /// Wait for the next job; returns None once the queue shuts down
    pub async fn take(&self) -> Option<Job> {
        loop {
            let notified = self.available.notified();
            if self.shutdown.is_cancelled() {
                return None;
            }
            if let Some(job) = self.try_take() {
                return Some(job);
            }
            tokio::select! {
                _ = notified => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    /// Drop a finished job from the running set; returns whether the post
    /// still has queued or running jobs. The caller must hold the post lock.
    pub fn release(&self, job: &Job) -> bool {
        let outstanding = {
            let mut state = self.state.lock();
            if let Some(jobs) = state.running.get_mut(&job.post_id) {
                jobs.remove(&job.image_id);
                if jobs.is_empty() {
                    state.running.remove(&job.post_id);
                }
            }
            state.has_jobs(&job.post_id)
        };
        self.drained.notify_waiters();
        outstanding
    }

    pub fn is_pending(&self, post_id: &str) -> bool {
        self.state.lock().has_jobs(post_id)
    }

    fn has_running(&self, post_id: &str) -> bool {
        self.state.lock().running.get(post_id).is_some_and(|jobs| !jobs.is_empty())
    }

    /// Number of jobs currently held by workers
    pub fn running_count(&self) -> usize {
        self.state.lock().running_total()
    }

    /// Number of jobs waiting for a worker
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    async fn wait_drained(&self, post_id: &str) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.has_running(post_id) {
                return;
            }
            notified.await;
        }
    }

    /// Stop a post: drop its queued jobs, cancel its running ones and wait
    /// until every running job has acknowledged the cancellation
    pub async fn stop(&self, post_id: &str) -> RipperResult<()> {
        let touched = {
            let _guard = self.lock_post(post_id).await;
            let Some(post) = self.data.find_post(post_id)? else {
                return Err(RipperError::Validation(format!("unknown post {}", post_id)));
            };

            let (removed, cancelled) = {
                let mut state = self.state.lock();
                let mut removed = Vec::new();
                state.pending.retain(|job| {
                    if job.post_id == post_id {
                        removed.push(job.image_id);
                        false
                    } else {
                        true
                    }
                });
                let cancelled: Vec<CancellationToken> = state
                    .running
                    .get(post_id)
                    .map(|jobs| jobs.values().cloned().collect())
                    .unwrap_or_default();
                (removed, cancelled)
            };
            for token in &cancelled {
                token.cancel();
            }
            for image_id in &removed {
                self.data.reset_image(*image_id, ImageStatus::Stopped)?;
            }

            let changed = !post.status.is_terminal();
            if changed {
                self.data.update_post_status(post_id, PostStatus::Stopped)?;
            }
            if changed || !removed.is_empty() || !cancelled.is_empty() {
                info!(
                    post_id,
                    dequeued = removed.len(),
                    cancelled = cancelled.len(),
                    "Stopping post"
                );
                true
            } else {
                false
            }
        };

        if touched {
            self.wait_drained(post_id).await;
            let _guard = self.lock_post(post_id).await;
            self.data.stop_images_not_completed(post_id)?;
        }
        Ok(())
    }

    /// Re-enqueue the non-COMPLETE images of a post; a no-op while the post
    /// still has outstanding jobs. Returns whether anything was queued.
    pub async fn restart(&self, post_id: &str) -> RipperResult<bool> {
        let _guard = self.lock_post(post_id).await;
        if self.state.lock().has_jobs(post_id) {
            debug!(post_id, "Restart ignored, post still has jobs");
            return Ok(false);
        }
        if self.data.find_post(post_id)?.is_none() {
            return Err(RipperError::Validation(format!("unknown post {}", post_id)));
        }
        let images = self.data.images_not_completed(post_id)?;
        if images.is_empty() {
            return Ok(false);
        }
        self.data.update_post_status(post_id, PostStatus::Pending)?;
        self.enqueue_locked(post_id, &images)?;
        info!(post_id, images = images.len(), "Restarted post");
        Ok(true)
    }

    /// Stop each post independently
    pub async fn stop_many(&self, post_ids: Vec<String>) -> BulkOutcome {
        let results =
            futures::future::join_all(post_ids.iter().map(|post_id| self.stop(post_id))).await;
        let mut outcome = BulkOutcome::default();
        for (post_id, result) in post_ids.into_iter().zip(results) {
            outcome.record(post_id, result);
        }
        outcome
    }

    /// Restart each post independently
    pub async fn restart_many(&self, post_ids: Vec<String>) -> BulkOutcome {
        let results =
            futures::future::join_all(post_ids.iter().map(|post_id| self.restart(post_id))).await;
        let mut outcome = BulkOutcome::default();
        for (post_id, result) in post_ids.into_iter().zip(results) {
            outcome.record(post_id, result.map(|_| ()));
        }
        outcome
    }

    /// Forget the lock of a post that no longer exists
    pub fn forget(&self, post_id: &str) {
        self.post_locks.remove(post_id);
    }
}
