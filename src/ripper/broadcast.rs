//! Batches bus events and fans them out to notification sinks
//!
//! Events are buffered and flushed on a fixed interval (or once the batch
//! is full). A flush groups the batch by kind, drops duplicate keys and
//! re-reads update kinds from the store so observers receive current rows.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::ripper::data_service::DataService;
use crate::ripper::error::RipperResult;
use crate::ripper::event_bus::{Event, EventKind, EventSubscription};
use crate::ripper::models::Image;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1_000;

/// Destination channel of a notification
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Posts,
    PostsDeleted,
    Images(String),
    Queued,
    QueuedDeleted,
    Events,
    EventsDeleted,
    DownloadState,
    Speed,
    User,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Posts => f.write_str("posts"),
            Topic::PostsDeleted => f.write_str("posts/deleted"),
            Topic::Images(post_id) => write!(f, "images/{}", post_id),
            Topic::Queued => f.write_str("queued"),
            Topic::QueuedDeleted => f.write_str("queued/deleted"),
            Topic::Events => f.write_str("events"),
            Topic::EventsDeleted => f.write_str("events/deleted"),
            Topic::DownloadState => f.write_str("download-state"),
            Topic::Speed => f.write_str("speed"),
            Topic::User => f.write_str("user"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub topic: Topic,
    pub payload: Value,
}

/// Push channel towards observers
pub trait NotificationSink: Send + Sync {
    fn send(&self, notification: &Notification);
}

pub struct BroadcastAggregator {
    data: Arc<DataService>,
    sinks: Vec<Arc<dyn NotificationSink>>,
    buffer: Mutex<Vec<Event>>,
    flush_interval: Duration,
    max_batch_size: usize,
}

fn dedup<T: Eq + Hash + Clone>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|item| seen.insert(item.clone())).collect()
}

impl BroadcastAggregator {
    pub fn new(data: Arc<DataService>) -> Self {
        Self {
            data,
            sinks: Vec::new(),
            buffer: Mutex::new(Vec::new()),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    /// Buffer an event; returns true once the batch is full
    pub fn push(&self, event: Event) -> bool {
        let mut buffer = self.buffer.lock();
        buffer.push(event);
        buffer.len() >= self.max_batch_size
    }

    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Send everything buffered so far; returns the number of notifications
    pub fn flush(&self) -> usize {
        let batch = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return 0;
        }
        let notifications = match self.build_notifications(batch) {
            Ok(notifications) => notifications,
            Err(e) => {
                warn!("Failed to build notifications: {}", e);
                return 0;
            }
        };
        for notification in &notifications {
            trace!(topic = %notification.topic, "Broadcasting");
            for sink in &self.sinks {
                sink.send(notification);
            }
        }
        notifications.len()
    }

    fn build_notifications(&self, batch: Vec<Event>) -> RipperResult<Vec<Notification>> {
        let mut grouped: BTreeMap<EventKind, Vec<Event>> = BTreeMap::new();
        for event in batch {
            grouped.entry(event.kind()).or_default().push(event);
        }

        let store = self.data.store();
        let mut out = Vec::new();
        for (kind, events) in grouped {
            match kind {
                EventKind::PostUpdate => {
                    let ids = dedup(events.iter().filter_map(|e| match e {
                        Event::PostUpdate(id) => Some(*id),
                        _ => None,
                    }));
                    let mut posts = Vec::new();
                    for id in ids {
                        if let Some(post) = store.find_post_by_id(id)? {
                            posts.push(post);
                        }
                    }
                    push_payload(&mut out, Topic::Posts, &posts);
                }
                EventKind::ImageUpdate => {
                    let ids = dedup(events.iter().filter_map(|e| match e {
                        Event::ImageUpdate(id) => Some(*id),
                        _ => None,
                    }));
                    let mut by_post: HashMap<String, Vec<Image>> = HashMap::new();
                    let mut order = Vec::new();
                    for id in ids {
                        if let Some(image) = store.find_image(id)? {
                            if !by_post.contains_key(&image.post_id) {
                                order.push(image.post_id.clone());
                            }
                            by_post.entry(image.post_id.clone()).or_default().push(image);
                        }
                    }
                    for post_id in order {
                        if let Some(images) = by_post.get(&post_id) {
                            push_payload(&mut out, Topic::Images(post_id.clone()), images);
                        }
                    }
                }
                EventKind::QueuedUpdate => {
                    let ids = dedup(events.iter().filter_map(|e| match e {
                        Event::QueuedUpdate(id) => Some(*id),
                        _ => None,
                    }));
                    let mut queued = Vec::new();
                    for id in ids {
                        if let Some(group) = store.find_queued_by_id(id)? {
                            queued.push(group);
                        }
                    }
                    push_payload(&mut out, Topic::Queued, &queued);
                }
                EventKind::LogEventUpdate => {
                    let ids = dedup(events.iter().filter_map(|e| match e {
                        Event::LogEventUpdate(id) => Some(*id),
                        _ => None,
                    }));
                    let mut records = Vec::new();
                    for id in ids {
                        if let Some(record) = store.find_log_event(id)? {
                            records.push(record);
                        }
                    }
                    push_payload(&mut out, Topic::Events, &records);
                }
                EventKind::PostRemove => {
                    let ids = dedup(events.into_iter().filter_map(|e| match e {
                        Event::PostRemove(post_id) => Some(post_id),
                        _ => None,
                    }));
                    push_payload(&mut out, Topic::PostsDeleted, &ids);
                }
                EventKind::QueuedRemove => {
                    let ids = dedup(events.into_iter().filter_map(|e| match e {
                        Event::QueuedRemove(thread_id) => Some(thread_id),
                        _ => None,
                    }));
                    push_payload(&mut out, Topic::QueuedDeleted, &ids);
                }
                EventKind::LogEventRemove => {
                    let ids = dedup(events.iter().filter_map(|e| match e {
                        Event::LogEventRemove(id) => Some(*id),
                        _ => None,
                    }));
                    push_payload(&mut out, Topic::EventsDeleted, &ids);
                }
                // Only the latest value of a gauge matters
                EventKind::GlobalState => {
                    if let Some(Event::GlobalState(state)) = events.last() {
                        push_payload(&mut out, Topic::DownloadState, state);
                    }
                }
                EventKind::BytesPerSecond => {
                    if let Some(Event::BytesPerSecond(rate)) = events.last() {
                        push_payload(&mut out, Topic::Speed, rate);
                    }
                }
                EventKind::User => {
                    if let Some(Event::User(name)) = events.last() {
                        push_payload(&mut out, Topic::User, name);
                    }
                }
                EventKind::SettingsUpdate => {}
            }
        }
        Ok(out)
    }

    /// Consume `events` until `shutdown`, flushing on the interval or when full
    pub fn spawn(self: Arc<Self>, events: EventSubscription, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.flush();
                    }
                    event = events.recv_async() => match event {
                        Ok(event) => {
                            if self.push(event) {
                                self.flush();
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
            for event in events.try_iter() {
                self.push(event);
            }
            self.flush();
            debug!("Broadcast aggregator stopped");
        })
    }
}

fn push_payload<T: Serialize + ?Sized>(out: &mut Vec<Notification>, topic: Topic, value: &T) {
    match serde_json::to_value(value) {
        Ok(Value::Array(items)) if items.is_empty() => {}
        Ok(payload) => out.push(Notification { topic, payload }),
        Err(e) => warn!(topic = %topic, "Failed to serialize notification: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ripper::config_loader::{Settings, SettingsManager};
    use crate::ripper::event_bus::EventBus;
    use crate::ripper::models::GlobalState;
    use crate::ripper::store::MemoryStore;
    use crate::ripper::tests::{image, post};

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<Notification>>,
    }

    impl NotificationSink for RecordingSink {
        fn send(&self, notification: &Notification) {
            self.received.lock().push(notification.clone());
        }
    }

    fn data_service() -> Arc<DataService> {
        let bus = EventBus::new();
        let settings = Arc::new(SettingsManager::in_memory(Settings::default(), bus.clone()));
        Arc::new(DataService::new(Arc::new(MemoryStore::new()), bus, settings))
    }

    #[test]
    fn test_flush_groups_and_deduplicates() {
        let data = data_service();
        let (stored, images) = data
            .new_post(
                &post("3", 2),
                &[image("3", "https://imagetwist.com/a", 1), image("3", "https://imagetwist.com/b", 2)],
            )
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let aggregator = BroadcastAggregator::new(data).with_sink(sink.clone());

        aggregator.push(Event::PostUpdate(stored.id));
        aggregator.push(Event::ImageUpdate(images[0].id));
        aggregator.push(Event::PostUpdate(stored.id));
        aggregator.push(Event::ImageUpdate(images[1].id));
        aggregator.push(Event::ImageUpdate(images[0].id));
        aggregator.push(Event::BytesPerSecond(10));
        aggregator.push(Event::BytesPerSecond(20));
        aggregator.push(Event::SettingsUpdate);

        assert_eq!(aggregator.flush(), 3);
        let received = sink.received.lock();
        assert_eq!(received[0].topic, Topic::Posts);
        assert_eq!(received[0].payload.as_array().unwrap().len(), 1);
        assert_eq!(received[1].topic, Topic::Images("3".to_string()));
        assert_eq!(received[1].payload.as_array().unwrap().len(), 2);
        assert_eq!(received[2].topic, Topic::Speed);
        assert_eq!(received[2].payload, serde_json::json!(20));
        assert_eq!(aggregator.pending(), 0);
    }

    #[test]
    fn test_missing_rows_are_skipped() {
        let sink = Arc::new(RecordingSink::default());
        let aggregator = BroadcastAggregator::new(data_service()).with_sink(sink.clone());
        aggregator.push(Event::PostUpdate(42));
        aggregator.push(Event::PostRemove("9".to_string()));

        assert_eq!(aggregator.flush(), 1);
        let received = sink.received.lock();
        assert_eq!(received[0].topic.to_string(), "posts/deleted");
        assert_eq!(received[0].payload, serde_json::json!(["9"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_aggregator_flushes_on_interval() {
        let bus = EventBus::new();
        let sink = Arc::new(RecordingSink::default());
        let aggregator = Arc::new(BroadcastAggregator::new(data_service()).with_sink(sink.clone()));
        let shutdown = CancellationToken::new();
        let handle = aggregator.clone().spawn(bus.subscribe(), shutdown.clone());

        bus.publish(Event::GlobalState(GlobalState { running: 1, remaining: 0, error: 0 }));
        bus.publish(Event::GlobalState(GlobalState { running: 2, remaining: 0, error: 0 }));
        tokio::time::sleep(Duration::from_millis(600)).await;

        {
            let received = sink.received.lock();
            assert_eq!(received.len(), 1);
            assert_eq!(received[0].topic, Topic::DownloadState);
            assert_eq!(received[0].payload["running"], 2);
        }

        shutdown.cancel();
        handle.await.unwrap();
    }
}
