//! Public entry point of the download core
//!
//! `RipperEngine` wires the scanner, job queue, worker pool, monitors and
//! broadcast aggregator together around one event bus and one store, and
//! exposes the operations callers use: submitting galleries, stopping,
//! restarting and removing posts, and handling queued thread links.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ripper::auth::AuthContext;
use crate::ripper::broadcast::{BroadcastAggregator, NotificationSink};
use crate::ripper::config_loader::SettingsManager;
use crate::ripper::data_service::DataService;
use crate::ripper::download::Downloader;
use crate::ripper::error::{RipperError, RipperResult, error_chain};
use crate::ripper::event_bus::{Event, EventBus};
use crate::ripper::hosts::HostRegistry;
use crate::ripper::job_queue::{BulkOutcome, JobQueue};
use crate::ripper::links::{GalleryRef, parse_link, split_links};
use crate::ripper::models::{
    GlobalState, Image, LogEvent, LogEventKind, LogEventStatus, MultiPostItem, Post, PostStatus,
    QueuedGroup,
};
use crate::ripper::monitor::{GlobalStateMonitor, ThroughputMeter, spawn_speed_reporter};
use crate::ripper::scan_cache::{DEFAULT_SCAN_TTL, ScanCache, spawn_invalidation};
use crate::ripper::scanner::GalleryScanner;
use crate::ripper::store::Store;
use crate::ripper::thanks::ThanksService;
use crate::ripper::transport::Transport;
use crate::ripper::worker_pool::WorkerPool;

/// Result of submitting one gallery reference
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Posts that were ingested
    Added(Vec<String>),
    /// The thread holds too many posts and awaits a choice
    Queued(QueuedGroup),
}

pub struct RipperEngine {
    settings: Arc<SettingsManager>,
    event_bus: EventBus,
    data: Arc<DataService>,
    transport: Arc<dyn Transport>,
    auth: Arc<AuthContext>,
    scanner: Arc<GalleryScanner>,
    thread_cache: Arc<ScanCache<Vec<MultiPostItem>>>,
    queue: Arc<JobQueue>,
    downloader: Arc<Downloader>,
    meter: Arc<ThroughputMeter>,
    thanks: ThanksService,
    shutdown: CancellationToken,
    workers: Mutex<Option<WorkerPool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RipperEngine {
    pub fn new(
        settings: Arc<SettingsManager>,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        hosts: HostRegistry,
        event_bus: EventBus,
    ) -> Self {
        let shutdown = CancellationToken::new();
        debug!(hosts = ?hosts.hosts(), "Image hosts registered");
        let hosts = Arc::new(hosts);
        let auth = Arc::new(AuthContext::anonymous());
        let meter = Arc::new(ThroughputMeter::new());
        let data = Arc::new(DataService::new(store, event_bus.clone(), settings.clone()));
        let scanner = Arc::new(GalleryScanner::new(
            transport.clone(),
            hosts.clone(),
            settings.clone(),
            shutdown.clone(),
        ));
        let queue = Arc::new(JobQueue::new(data.clone(), shutdown.clone()));
        let downloader = Arc::new(Downloader::new(
            data.clone(),
            transport.clone(),
            hosts,
            settings.clone(),
            meter.clone(),
        ));
        let thanks = ThanksService::new(transport.clone(), auth.clone(), settings.clone(), data.clone());

        Self {
            settings,
            event_bus,
            data,
            transport,
            auth,
            scanner,
            thread_cache: Arc::new(ScanCache::new(DEFAULT_SCAN_TTL)),
            queue,
            downloader,
            meter,
            thanks,
            shutdown,
            workers: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Recover interrupted state, log in and start workers and reporters
    pub async fn start(&self) -> RipperResult<()> {
        self.data.recover_interrupted()?;

        let upstream = self.settings.settings().upstream;
        if let Err(e) = self.auth.authenticate(self.transport.as_ref(), &upstream, &self.event_bus).await {
            warn!("Login failed, continuing anonymously: {}", error_chain(&e));
        }

        let size = self.settings.settings().connection.worker_count();
        let pool = WorkerPool::start(size, self.queue.clone(), self.downloader.clone(), self.data.clone());
        let workers = pool.size();
        *self.workers.lock() = Some(pool);

        let mut tasks = vec![
            spawn_speed_reporter(self.meter.clone(), self.event_bus.clone(), self.shutdown.clone()),
            GlobalStateMonitor::new(self.queue.clone(), self.data.clone(), self.event_bus.clone())
                .spawn(self.shutdown.clone()),
            spawn_invalidation(self.thread_cache.clone(), self.event_bus.subscribe(), self.shutdown.clone()),
            self.spawn_session_refresh(),
        ];
        self.tasks.lock().append(&mut tasks);
        info!(workers, "Engine started");
        Ok(())
    }

    /// Log in again whenever settings change
    fn spawn_session_refresh(&self) -> JoinHandle<()> {
        let events = self.event_bus.subscribe();
        let auth = self.auth.clone();
        let transport = self.transport.clone();
        let settings = self.settings.clone();
        let event_bus = self.event_bus.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv_async() => match event {
                        Ok(Event::SettingsUpdate) => {
                            let upstream = settings.settings().upstream;
                            if let Err(e) = auth.authenticate(transport.as_ref(), &upstream, &event_bus).await {
                                warn!("Login failed after settings change: {}", e);
                            }
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            }
        })
    }

    /// Fan bus events out to `sinks` through a batching aggregator
    pub fn attach_sinks(&self, sinks: Vec<Arc<dyn NotificationSink>>) {
        let notifications = self.settings.settings().notifications;
        let aggregator = BroadcastAggregator::new(self.data.clone())
            .with_flush_interval(Duration::from_millis(notifications.flush_interval_ms.max(1)))
            .with_max_batch_size(notifications.max_batch_size);
        let aggregator = sinks.into_iter().fold(aggregator, |aggregator, sink| aggregator.with_sink(sink));
        let handle = Arc::new(aggregator).spawn(self.event_bus.subscribe(), self.shutdown.clone());
        self.tasks.lock().push(handle);
    }

    /// Cancel in-flight work and wait for every task to exit
    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        self.shutdown.cancel();
        let workers = self.workers.lock().take();
        if let Some(pool) = workers {
            pool.join().await;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }

    // Submission

    /// Submit every link in `text`, one per line; each link succeeds or fails on its own
    pub async fn submit_links(&self, text: &str) -> Vec<(String, RipperResult<SubmitOutcome>)> {
        let proxy = self.settings.settings().upstream.proxy;
        let mut results = Vec::new();
        for link in split_links(text) {
            let result = match parse_link(&link, &proxy) {
                Ok(gallery) => self.submit_gallery(&link, gallery).await,
                Err(e) => {
                    warn!("{}", e);
                    self.record(LogEventKind::Post, LogEventStatus::Error, format!("Invalid link {}\n{}", link, e));
                    Err(e)
                }
            };
            results.push((link, result));
        }
        results
    }

    /// Ingest one gallery reference
    pub async fn submit_gallery(&self, link: &str, gallery: GalleryRef) -> RipperResult<SubmitOutcome> {
        debug!(thread_id = gallery.thread_id(), link, "Submitting gallery");
        match gallery {
            GalleryRef::Post { thread_id, post_id } => {
                self.ingest_post(&thread_id, &post_id).await.map(|id| SubmitOutcome::Added(vec![id]))
            }
            GalleryRef::Thread { thread_id } => self.submit_thread(link, &thread_id).await,
        }
    }

    fn record(&self, kind: LogEventKind, status: LogEventStatus, message: String) -> Option<LogEvent> {
        match self.data.new_log_event(kind, status, message) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("Failed to write log record: {}", e);
                None
            }
        }
    }

    fn update_record(&self, record: &mut Option<LogEvent>, status: LogEventStatus, message: String) {
        if let Some(event) = record {
            event.status = status;
            event.message = message;
            if let Err(e) = self.data.update_log_event(event) {
                warn!("Failed to update log record: {}", e);
            }
        }
    }

    async fn ingest_post(&self, thread_id: &str, post_id: &str) -> RipperResult<String> {
        let mut record = self.record(
            LogEventKind::Post,
            LogEventStatus::Pending,
            format!("Processing post {}", post_id),
        );
        let result = self.ingest_post_inner(thread_id, post_id, &mut record).await;
        match &result {
            Ok(_) => self.update_record(&mut record, LogEventStatus::Done, format!("Post {} is loaded", post_id)),
            Err(e) => {
                warn!(post_id, "Failed to load post: {}", e);
                self.update_record(
                    &mut record,
                    LogEventStatus::Error,
                    format!("Failed to load post {}\n{}", post_id, error_chain(e)),
                )
            }
        }
        result
    }

    async fn ingest_post_inner(
        &self,
        thread_id: &str,
        post_id: &str,
        record: &mut Option<LogEvent>,
    ) -> RipperResult<String> {
        if self.data.exists(post_id)? {
            return Err(RipperError::Validation(format!("post {} is already loaded", post_id)));
        }
        self.update_record(record, LogEventStatus::Processing, format!("Scanning post {}", post_id));

        let scan = self.scanner.scan_post(thread_id, post_id).await?;
        let auto_start = self.settings.settings().download.auto_start;
        let mut post = scan.post;
        post.status = if auto_start { PostStatus::Pending } else { PostStatus::Stopped };

        let (post, images) = self.data.new_post(&post, &scan.images)?;
        info!(post_id, images = images.len(), title = %post.title, "Post added");
        if auto_start {
            self.queue.enqueue(post_id, &images).await?;
        }
        self.thanks.leave_thanks(&post).await;
        self.spawn_metadata_fetch(&post.post_id);
        Ok(post.post_id)
    }

    /// Look up alternative titles of a new post in the background
    fn spawn_metadata_fetch(&self, post_id: &str) {
        if !self.settings.settings().upstream.fetch_metadata {
            return;
        }
        let scanner = self.scanner.clone();
        let data = self.data.clone();
        let shutdown = self.shutdown.clone();
        let post_id = post_id.to_string();
        tokio::spawn(async move {
            let titles = tokio::select! {
                _ = shutdown.cancelled() => return,
                titles = scanner.fetch_alt_titles(&post_id) => titles,
            };
            let stored = titles.and_then(|titles| {
                debug!(post_id, titles = titles.len(), "Alternative titles found");
                data.update_alt_titles(&post_id, &titles)
            });
            if let Err(e) = stored {
                warn!(post_id, "Failed to fetch post metadata: {}", e);
            }
        });
    }

    async fn scan_thread_cached(&self, thread_id: &str) -> RipperResult<Arc<Vec<MultiPostItem>>> {
        let scanner = self.scanner.clone();
        let key = thread_id.to_string();
        self.thread_cache
            .get_or_compute(thread_id, || async move { scanner.scan_thread(&key).await })
            .await
    }

    async fn submit_thread(&self, link: &str, thread_id: &str) -> RipperResult<SubmitOutcome> {
        let mut record = self.record(
            LogEventKind::Queued,
            LogEventStatus::Pending,
            format!("Processing thread {}", link),
        );
        let result = self.submit_thread_inner(link, thread_id, &mut record).await;
        match &result {
            Ok(SubmitOutcome::Added(ids)) => self.update_record(
                &mut record,
                LogEventStatus::Done,
                format!("Thread {} added {} post(s)", thread_id, ids.len()),
            ),
            Ok(SubmitOutcome::Queued(group)) => self.update_record(
                &mut record,
                LogEventStatus::Done,
                format!("Thread {} queued with {} posts", thread_id, group.total),
            ),
            Err(e) => self.update_record(
                &mut record,
                LogEventStatus::Error,
                format!("Failed to process thread {}\n{}", link, error_chain(e)),
            ),
        }
        result
    }

    async fn submit_thread_inner(
        &self,
        link: &str,
        thread_id: &str,
        record: &mut Option<LogEvent>,
    ) -> RipperResult<SubmitOutcome> {
        if self.data.find_queued(thread_id)?.is_some() {
            return Err(RipperError::Validation(format!("thread {} is already queued", thread_id)));
        }
        self.update_record(record, LogEventStatus::Processing, format!("Scanning thread {}", link));

        let items = self.scan_thread_cached(thread_id).await?;
        if items.is_empty() {
            return Err(RipperError::Scan(format!("nothing found for thread {}", thread_id)));
        }

        let threshold = self.settings.settings().download.auto_queue_threshold;
        if items.len() <= threshold {
            let mut added = Vec::new();
            for item in items.iter() {
                match self.ingest_post(&item.thread_id, &item.post_id).await {
                    Ok(post_id) => added.push(post_id),
                    Err(e) => debug!(post_id = %item.post_id, "Skipped post of thread: {}", e),
                }
            }
            return Ok(SubmitOutcome::Added(added));
        }

        let group = self.data.new_queued(&QueuedGroup {
            id: 0,
            thread_id: thread_id.to_string(),
            link: link.to_string(),
            total: items.len() as u32,
        })?;
        info!(thread_id, posts = group.total, "Thread queued for selection");
        Ok(SubmitOutcome::Queued(group))
    }

    /// Candidate posts of a queued thread
    pub async fn grab(&self, thread_id: &str) -> RipperResult<Arc<Vec<MultiPostItem>>> {
        if self.data.find_queued(thread_id)?.is_none() {
            return Err(RipperError::Validation(format!("thread {} is not queued", thread_id)));
        }
        let items = self.scan_thread_cached(thread_id).await?;
        if items.is_empty() {
            return Err(RipperError::Scan(format!("nothing found for thread {}", thread_id)));
        }
        Ok(items)
    }

    /// Ingest chosen posts, given as (thread id, post id) pairs
    pub async fn add_posts(&self, posts: &[(String, String)]) -> Vec<(String, RipperResult<String>)> {
        let results =
            futures::future::join_all(posts.iter().map(|(thread_id, post_id)| self.ingest_post(thread_id, post_id)))
                .await;
        posts.iter().map(|(_, post_id)| post_id.clone()).zip(results).collect()
    }

    pub fn remove_queued(&self, thread_id: &str) -> RipperResult<bool> {
        self.data.remove_queued(thread_id)
    }

    pub fn clear_queued(&self) -> RipperResult<usize> {
        let mut removed = 0;
        for group in self.data.queued()? {
            if self.data.remove_queued(&group.thread_id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // Post control

    pub async fn stop(&self, post_id: &str) -> RipperResult<()> {
        self.queue.stop(post_id).await
    }

    pub async fn restart(&self, post_id: &str) -> RipperResult<bool> {
        self.queue.restart(post_id).await
    }

    fn tracked_posts(&self) -> RipperResult<Vec<String>> {
        Ok(self.data.posts()?.into_iter().map(|post| post.post_id).collect())
    }

    pub async fn stop_all(&self) -> RipperResult<BulkOutcome> {
        let posts = self.tracked_posts()?;
        Ok(self.queue.stop_many(posts).await)
    }

    pub async fn restart_all(&self) -> RipperResult<BulkOutcome> {
        let posts = self.tracked_posts()?;
        Ok(self.queue.restart_many(posts).await)
    }

    /// Stop and delete each post independently
    pub async fn remove(&self, post_ids: &[String]) -> BulkOutcome {
        let results = futures::future::join_all(post_ids.iter().map(|post_id| async move {
            self.queue.stop(post_id).await?;
            let _guard = self.queue.lock_post(post_id).await;
            self.data.remove(post_id)?;
            Ok::<(), RipperError>(())
        }))
        .await;

        let mut outcome = BulkOutcome::default();
        for (post_id, result) in post_ids.iter().zip(results) {
            match result {
                Ok(()) => {
                    self.queue.forget(post_id);
                    outcome.succeeded.push(post_id.clone());
                }
                Err(e) => outcome.failed.push((post_id.clone(), e)),
            }
        }
        outcome
    }

    /// Rename a post's folder; refused while any of its jobs is queued or running
    pub async fn rename(&self, post_id: &str, name: &str) -> RipperResult<PathBuf> {
        let _guard = self.queue.lock_post(post_id).await;
        if self.queue.is_pending(post_id) {
            return Err(RipperError::Validation(format!("post {} is still downloading", post_id)));
        }
        let post = self
            .data
            .find_post(post_id)?
            .ok_or_else(|| RipperError::Validation(format!("unknown post {}", post_id)))?;
        self.downloader.rename_directory(&post, name)
    }

    /// Rename each post to its first alternative title; posts without one are skipped
    pub async fn rename_to_first(&self, post_ids: &[String]) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for post_id in post_ids {
            let first = match self.data.find_post(post_id) {
                Ok(post) => post.and_then(|post| post.alt_titles.into_iter().next()),
                Err(e) => {
                    outcome.failed.push((post_id.clone(), e));
                    continue;
                }
            };
            let Some(name) = first else {
                debug!(post_id, "No alternative title, rename skipped");
                continue;
            };
            match self.rename(post_id, &name).await {
                Ok(_) => outcome.succeeded.push(post_id.clone()),
                Err(e) => outcome.failed.push((post_id.clone(), e)),
            }
        }
        outcome
    }

    pub fn clear_completed(&self) -> RipperResult<Vec<String>> {
        let removed = self.data.clear_completed()?;
        for post_id in &removed {
            self.queue.forget(post_id);
        }
        Ok(removed)
    }

    pub fn clear_log_events(&self) -> RipperResult<usize> {
        self.data.clear_log_events()
    }

    // Accessors

    pub fn posts(&self) -> RipperResult<Vec<Post>> {
        self.data.posts()
    }

    pub fn post(&self, post_id: &str) -> RipperResult<Option<Post>> {
        self.data.find_post(post_id)
    }

    pub fn images(&self, post_id: &str) -> RipperResult<Vec<Image>> {
        self.data.images(post_id)
    }

    pub fn queued(&self) -> RipperResult<Vec<QueuedGroup>> {
        self.data.queued()
    }

    pub fn log_events(&self) -> RipperResult<Vec<LogEvent>> {
        self.data.log_events()
    }

    pub fn global_state(&self) -> RipperResult<GlobalState> {
        GlobalStateMonitor::new(self.queue.clone(), self.data.clone(), self.event_bus.clone()).snapshot()
    }

    /// Whether any job of the post is queued or running
    pub fn is_pending(&self, post_id: &str) -> bool {
        self.queue.is_pending(post_id)
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn settings(&self) -> &Arc<SettingsManager> {
        &self.settings
    }

    pub fn user(&self) -> Option<String> {
        self.auth.user()
    }
}
