//! Fixed set of workers draining the job queue

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ripper::data_service::DataService;
use crate::ripper::download::{Downloader, JobOutcome};
use crate::ripper::error::{RipperResult, error_chain};
use crate::ripper::job_queue::{Job, JobQueue};
use crate::ripper::models::{ImageStatus, LogEventKind, LogEventStatus};

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers; they exit once the queue shuts down
    pub fn start(
        size: usize,
        queue: Arc<JobQueue>,
        downloader: Arc<Downloader>,
        data: Arc<DataService>,
    ) -> Self {
        let size = size.max(1);
        let handles = (0..size)
            .map(|worker| {
                let queue = queue.clone();
                let downloader = downloader.clone();
                let data = data.clone();
                tokio::spawn(async move {
                    debug!(worker, "Worker started");
                    while let Some(job) = queue.take().await {
                        let outcome = downloader.run(&job).await;
                        if let Err(e) = settle(&queue, &data, &job, outcome).await {
                            error!(post_id = %job.post_id, image_id = job.image_id, "Failed to record job result: {}", e);
                        }
                    }
                    debug!(worker, "Worker stopped");
                })
            })
            .collect();
        info!(workers = size, "Worker pool started");
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
    }
}

/// Apply a job's outcome and finalize the post once nothing is outstanding
async fn settle(
    queue: &JobQueue,
    data: &DataService,
    job: &Job,
    outcome: JobOutcome,
) -> RipperResult<()> {
    let _guard = queue.lock_post(&job.post_id).await;

    let recorded = match &outcome {
        JobOutcome::Completed { image, bytes, .. } => data.image_completed(image, *bytes),
        JobOutcome::Failed { image: Some(image), error } => {
            warn!(url = %image.url, "Download failed: {}", error);
            data.image_failed(image, &error_chain(error))
        }
        JobOutcome::Failed { image: None, error } => {
            warn!(image_id = job.image_id, "Job dropped: {}", error);
            data.new_log_event(
                LogEventKind::Download,
                LogEventStatus::Error,
                format!("Failed to download image {}\n{}", job.image_id, error_chain(error)),
            )
            .map(|_| ())
        }
        JobOutcome::Cancelled { image_id } => {
            debug!(image_id, "Job cancelled");
            data.reset_image(*image_id, ImageStatus::Stopped)
        }
    };

    let outstanding = queue.release(job);
    // a post whose last job could not be recorded must still leave PENDING
    let finished = if !outstanding && !matches!(outcome, JobOutcome::Cancelled { .. }) {
        data.finish_post(&job.post_id).map(|_| ())
    } else {
        Ok(())
    };
    recorded.and(finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ripper::config_loader::{Settings, SettingsManager};
    use crate::ripper::error::RipperError;
    use crate::ripper::event_bus::EventBus;
    use crate::ripper::models::{Image, PostStatus};
    use crate::ripper::store::MemoryStore;
    use crate::ripper::tests::{image, post};
    use tokio_util::sync::CancellationToken;

    async fn running_job(images: u32) -> (JobQueue, Arc<DataService>, Vec<Image>, Job) {
        let bus = EventBus::new();
        let settings = Arc::new(SettingsManager::in_memory(Settings::default(), bus.clone()));
        let data = Arc::new(DataService::new(Arc::new(MemoryStore::new()), bus, settings));
        let imgs: Vec<Image> = (1..=images)
            .map(|i| image("5", &format!("https://imagetwist.com/{}", i), i))
            .collect();
        let (_, stored) = data.new_post(&post("5", images), &imgs).unwrap();
        data.update_post_status("5", PostStatus::Pending).unwrap();
        let queue = JobQueue::new(data.clone(), CancellationToken::new());
        queue.enqueue("5", &stored).await.unwrap();
        let job = queue.take().await.unwrap();
        (queue, data, stored, job)
    }

    #[tokio::test]
    async fn test_dropped_job_writes_failure_record_and_finalizes() {
        let (queue, data, _, job) = running_job(1).await;

        let outcome = JobOutcome::Failed {
            image: None,
            error: RipperError::Extraction("image row vanished".to_string()),
        };
        settle(&queue, &data, &job, outcome).await.unwrap();

        let records = data.log_events().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, LogEventKind::Download);
        assert_eq!(records[0].status, LogEventStatus::Error);
        assert!(records[0].message.contains("image row vanished"));
        assert_eq!(data.find_post("5").unwrap().unwrap().status, PostStatus::Stopped);
    }

    #[tokio::test]
    async fn test_store_failure_still_finalizes_last_job() {
        let (queue, data, stored, job) = running_job(1).await;
        let mut missing = stored[0].clone();
        missing.id = 9_999;

        let outcome = JobOutcome::Completed {
            image: missing,
            bytes: 16,
            path: std::path::PathBuf::from("unused.jpg"),
        };
        assert!(settle(&queue, &data, &job, outcome).await.is_err());

        assert!(!queue.is_pending("5"));
        assert_eq!(data.find_post("5").unwrap().unwrap().status, PostStatus::Stopped);
    }

    #[tokio::test]
    async fn test_outstanding_jobs_defer_finalization() {
        let (queue, data, stored, job) = running_job(2).await;

        let outcome = JobOutcome::Completed {
            image: stored[0].clone(),
            bytes: 16,
            path: std::path::PathBuf::from("a.jpg"),
        };
        settle(&queue, &data, &job, outcome).await.unwrap();

        assert!(queue.is_pending("5"));
        assert_eq!(data.find_post("5").unwrap().unwrap().status, PostStatus::Pending);
    }
}
