//! Process-wide publish/subscribe channel for state-change notifications
//!
//! Every component that mutates Post, Image, QueuedGroup or LogEvent state
//! receives an `EventBus` handle at construction and publishes a typed
//! `Event` after each mutation. Subscribers own a bounded `flume` channel.
//! `publish` never blocks a runtime thread: events that do not fit wait in
//! an ordered per-subscriber backlog that a pump task keeps retrying until
//! the subscriber accepts them. Outside a runtime the publisher retries in
//! place. Disconnected subscribers are pruned.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::ripper::models::GlobalState;

/// Default capacity of a subscriber channel
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 4096;

/// Sleep between emit attempts against a full subscriber
const EMIT_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Typed state-change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PostUpdate(i64),
    PostRemove(String),
    ImageUpdate(i64),
    QueuedUpdate(i64),
    QueuedRemove(String),
    LogEventUpdate(i64),
    LogEventRemove(i64),
    GlobalState(GlobalState),
    BytesPerSecond(u64),
    User(String),
    SettingsUpdate,
}

/// Discriminant of an `Event`, used to group events when batching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    PostUpdate,
    PostRemove,
    ImageUpdate,
    QueuedUpdate,
    QueuedRemove,
    LogEventUpdate,
    LogEventRemove,
    GlobalState,
    BytesPerSecond,
    User,
    SettingsUpdate,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PostUpdate(_) => EventKind::PostUpdate,
            Event::PostRemove(_) => EventKind::PostRemove,
            Event::ImageUpdate(_) => EventKind::ImageUpdate,
            Event::QueuedUpdate(_) => EventKind::QueuedUpdate,
            Event::QueuedRemove(_) => EventKind::QueuedRemove,
            Event::LogEventUpdate(_) => EventKind::LogEventUpdate,
            Event::LogEventRemove(_) => EventKind::LogEventRemove,
            Event::GlobalState(_) => EventKind::GlobalState,
            Event::BytesPerSecond(_) => EventKind::BytesPerSecond,
            Event::User(_) => EventKind::User,
            Event::SettingsUpdate => EventKind::SettingsUpdate,
        }
    }
}

/// Receiving half handed to a subscriber
pub type EventSubscription = Receiver<Event>;

#[derive(Default)]
struct Backlog {
    events: VecDeque<Event>,
    pumping: bool,
}

struct Subscriber {
    id: u64,
    sender: Sender<Event>,
    backlog: Arc<Mutex<Backlog>>,
}

#[derive(Default)]
struct BusInner {
    subscribers: Vec<Subscriber>,
    next_id: u64,
}

/// Cloneable handle to the shared event bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner::default())),
            capacity: capacity.max(1),
        }
    }

    /// Register a new subscriber. Events published before this call are not replayed.
    pub fn subscribe(&self) -> EventSubscription {
        let (sender, receiver) = flume::bounded(self.capacity);
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber {
            id,
            sender,
            backlog: Arc::new(Mutex::new(Backlog::default())),
        });
        debug!(subscriber = id, "Event bus subscriber registered");
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Published events still waiting for room in a subscriber channel
    pub fn backlog_len(&self) -> usize {
        let inner = self.inner.lock();
        inner.subscribers.iter().map(|s| s.backlog.lock().events.len()).sum()
    }

    /// Deliver an event to every live subscriber
    pub fn publish(&self, event: Event) {
        // Snapshot the subscribers so a slow one never holds the registry lock.
        let subscribers: Vec<(u64, Sender<Event>, Arc<Mutex<Backlog>>)> = {
            let inner = self.inner.lock();
            inner
                .subscribers
                .iter()
                .map(|s| (s.id, s.sender.clone(), s.backlog.clone()))
                .collect()
        };

        let runtime = Handle::try_current().ok();
        let mut disconnected = Vec::new();
        for (id, sender, backlog) in subscribers {
            if sender.is_disconnected() {
                disconnected.push(id);
                continue;
            }
            let mut pending = backlog.lock();
            if pending.events.is_empty() {
                match sender.try_send(event.clone()) {
                    Ok(()) => continue,
                    Err(TrySendError::Disconnected(_)) => {
                        disconnected.push(id);
                        continue;
                    }
                    Err(TrySendError::Full(returned)) => {
                        trace!(subscriber = id, "Subscriber channel full, deferring emit");
                        pending.events.push_back(returned);
                    }
                }
            } else {
                pending.events.push_back(event.clone());
            }

            match &runtime {
                Some(handle) if !pending.pumping => {
                    pending.pumping = true;
                    handle.spawn(pump(id, sender, backlog.clone()));
                }
                Some(_) => {}
                None if !pending.pumping => {
                    pending.pumping = true;
                    drop(pending);
                    drain_in_place(id, &sender, &backlog);
                }
                None => {}
            }
        }

        if !disconnected.is_empty() {
            let mut inner = self.inner.lock();
            inner.subscribers.retain(|s| !disconnected.contains(&s.id));
            debug!(removed = disconnected.len(), "Pruned disconnected event bus subscribers");
        }
    }
}

/// Deliver a subscriber's backlog in order, waiting for channel room
async fn pump(id: u64, sender: Sender<Event>, backlog: Arc<Mutex<Backlog>>) {
    loop {
        let next = {
            let mut pending = backlog.lock();
            match pending.events.front() {
                Some(event) => event.clone(),
                None => {
                    pending.pumping = false;
                    return;
                }
            }
        };
        if sender.send_async(next).await.is_err() {
            let mut pending = backlog.lock();
            pending.events.clear();
            pending.pumping = false;
            debug!(subscriber = id, "Subscriber went away with a pending backlog");
            return;
        }
        backlog.lock().events.pop_front();
    }
}

/// Retry a subscriber's backlog on the calling thread; only used off the runtime
fn drain_in_place(id: u64, sender: &Sender<Event>, backlog: &Mutex<Backlog>) {
    loop {
        let mut next = {
            let mut pending = backlog.lock();
            match pending.events.front() {
                Some(event) => event.clone(),
                None => {
                    pending.pumping = false;
                    return;
                }
            }
        };
        loop {
            match sender.try_send(next) {
                Ok(()) => break,
                Err(TrySendError::Full(returned)) => {
                    trace!(subscriber = id, "Subscriber channel full, retrying emit");
                    next = returned;
                    std::thread::sleep(EMIT_RETRY_DELAY);
                }
                Err(TrySendError::Disconnected(_)) => {
                    let mut pending = backlog.lock();
                    pending.events.clear();
                    pending.pumping = false;
                    return;
                }
            }
        }
        backlog.lock().events.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_subscriber_receives_events() {
        let bus = EventBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();

        bus.publish(Event::PostUpdate(7));
        bus.publish(Event::BytesPerSecond(1024));

        assert_eq!(first.try_recv().unwrap(), Event::PostUpdate(7));
        assert_eq!(first.try_recv().unwrap(), Event::BytesPerSecond(1024));
        assert_eq!(second.try_recv().unwrap(), Event::PostUpdate(7));
        assert_eq!(second.try_recv().unwrap(), Event::BytesPerSecond(1024));
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(Event::SettingsUpdate);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.try_recv().unwrap(), Event::SettingsUpdate);
    }

    #[test]
    fn test_full_subscriber_off_runtime_waits_until_drained() {
        let bus = EventBus::with_capacity(1);
        let receiver = bus.subscribe();
        bus.publish(Event::ImageUpdate(1));

        let consumer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let mut received = Vec::new();
            while received.len() < 2 {
                received.push(receiver.recv().unwrap());
            }
            received
        });

        // Capacity is exhausted; this publish must wait rather than drop.
        bus.publish(Event::ImageUpdate(2));
        let received = consumer.join().unwrap();
        assert_eq!(received, vec![Event::ImageUpdate(1), Event::ImageUpdate(2)]);
    }

    #[tokio::test]
    async fn test_full_subscriber_never_blocks_runtime_publisher() {
        let bus = EventBus::with_capacity(2);
        let receiver = bus.subscribe();

        for id in 1..=5 {
            bus.publish(Event::ImageUpdate(id));
        }
        assert_eq!(bus.backlog_len(), 3);

        let mut received = Vec::new();
        while received.len() < 5 {
            received.push(receiver.recv_async().await.unwrap());
        }
        let expected: Vec<Event> = (1..=5).map(Event::ImageUpdate).collect();
        assert_eq!(received, expected);
        assert_eq!(bus.backlog_len(), 0);
    }

    #[tokio::test]
    async fn test_backlog_keeps_order_with_later_publishes() {
        let bus = EventBus::with_capacity(1);
        let receiver = bus.subscribe();

        bus.publish(Event::PostUpdate(1));
        bus.publish(Event::PostUpdate(2));
        assert_eq!(receiver.recv_async().await.unwrap(), Event::PostUpdate(1));
        bus.publish(Event::PostUpdate(3));

        assert_eq!(receiver.recv_async().await.unwrap(), Event::PostUpdate(2));
        assert_eq!(receiver.recv_async().await.unwrap(), Event::PostUpdate(3));
    }

    #[tokio::test]
    async fn test_backlog_of_dropped_subscriber_is_discarded() {
        let bus = EventBus::with_capacity(1);
        let receiver = bus.subscribe();
        bus.publish(Event::QueuedUpdate(1));
        bus.publish(Event::QueuedUpdate(2));
        drop(receiver);

        tokio::task::yield_now().await;
        assert_eq!(bus.backlog_len(), 0);
        bus.publish(Event::QueuedUpdate(3));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
